//! End-to-end tunnel paths over loopback: a real broker, a real client,
//! raw protocol peers where a test needs to misbehave.

use std::{sync::Arc, time::Duration};

use anyhow::{Result, bail};
use codec::{
    ControlMessage, DEFAULT_MAX_FRAME, Payload,
    message::{ClientRecord, DataConnection, ServiceKind, ServiceRecord, codes},
};
use service::ports::PortPolicy;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::{sleep, timeout},
};
use tunnel_client::Connector;
use tunnel_server::{config::Config, runtime::ServerPool};

fn server_config(server_id: &str, control_port: u16, allowed: &str) -> Arc<Config> {
    let mut config = Config::default();
    config.server.server_id = server_id.to_string();
    config.server.listen = format!("127.0.0.1:{}", control_port).parse().unwrap();
    config.server.token = Some("T".to_string());
    config.server.allowed_ports = PortPolicy::new(vec![allowed.parse().unwrap()]);
    config.server.pairing_timeout = 1;
    config.server.heartbeat_timeout = 60;
    config.server.drain_window = 2;
    Arc::new(config)
}

fn client_config(
    control_port: u16,
    client_id: &str,
    name: &str,
    local_port: u16,
) -> Arc<tunnel_client::config::Config> {
    let mut config = tunnel_client::config::Config::default();
    config.client.client_id = client_id.to_string();
    config.client.server = format!("127.0.0.1:{}", control_port);
    config.client.token = "T".to_string();
    config.client.heartbeat_interval = 1;
    config.reconnect.enabled = false;

    config.services.push(tunnel_client::config::Service {
        name: name.to_string(),
        kind: ServiceKind::Tcp,
        local_address: "127.0.0.1".to_string(),
        local_port,
        remote_port: None,
        custom_domains: vec![],
        subdomain: None,
        headers: Default::default(),
        use_encryption: false,
        use_compression: false,
        health_check_type: None,
        health_check_url: None,
        max_connections: 0,
    });

    Arc::new(config)
}

fn record(client_id: &str) -> ClientRecord {
    ClientRecord {
        tenant_id: String::new(),
        client_id: client_id.to_string(),
        client_name: String::new(),
        server_address: "127.0.0.1".to_string(),
        server_port: 0,
        auth_token: "T".to_string(),
        use_tls: false,
        reconnect: Default::default(),
        heartbeat_interval: 1,
        heartbeat_timeout: 60,
    }
}

fn service(name: &str, remote_port: Option<u16>) -> ServiceRecord {
    ServiceRecord {
        tenant_id: String::new(),
        service_id: String::new(),
        client_id: String::new(),
        service_name: name.to_string(),
        service_type: ServiceKind::Tcp,
        local_address: "127.0.0.1".to_string(),
        local_port: 1,
        remote_port,
        custom_domains: vec![],
        subdomain: None,
        headers: Default::default(),
        use_encryption: false,
        use_compression: false,
        health_check_type: None,
        health_check_url: None,
        max_connections: 0,
    }
}

/// Authenticates a raw protocol peer and returns the socket plus the
/// assigned session id.
async fn raw_client(control_port: u16, client_id: &str) -> Result<(TcpStream, String)> {
    let mut stream = TcpStream::connect(("127.0.0.1", control_port)).await?;

    let auth = ControlMessage::new(Payload::Auth(record(client_id)));
    codec::write_message(&mut stream, &auth).await?;

    let reply = codec::read_message(&mut stream, DEFAULT_MAX_FRAME).await?;
    match reply.payload {
        Payload::Response(response) if response.success => {
            Ok((stream, response.session_id.unwrap_or_default()))
        }
        other => bail!("auth not accepted: {:?}", other),
    }
}

async fn register(
    stream: &mut TcpStream,
    session_id: &str,
    record: ServiceRecord,
) -> Result<codec::message::Response> {
    let frame = ControlMessage::with_session(session_id, Payload::RegisterService(record));
    codec::write_message(stream, &frame).await?;

    let reply = codec::read_message(stream, DEFAULT_MAX_FRAME).await?;
    match reply.payload {
        Payload::Response(response) => Ok(response),
        other => bail!("unexpected reply: {:?}", other),
    }
}

async fn wait_for_remote_port(pool: &Arc<ServerPool>, server_id: &str) -> Result<u16> {
    for _ in 0..100 {
        if let Some(snapshot) = pool.server_snapshot(server_id).await {
            if let Some(port) = snapshot["services"][0]["remotePort"].as_u64() {
                return Ok(port as u16);
            }
        }

        sleep(Duration::from_millis(50)).await;
    }

    bail!("service was never registered");
}

/// An echo service standing in for something like sshd.
async fn echo_service() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(size) = socket.read(&mut buf).await {
                    if size == 0 || socket.write_all(&buf[..size]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    Ok(port)
}

#[tokio::test]
async fn tcp_tunnel_end_to_end() -> Result<()> {
    let echo_port = echo_service().await?;

    let config = server_config("e2e-1", 17001, "27001..27010");
    let pool = tunnel_server::startup(config).await?;

    let connector = Connector::new(client_config(17001, "edge-1", "echo", echo_port));
    let run = {
        let connector = connector.clone();
        tokio::spawn(async move { connector.run().await })
    };

    // The first free port of the policy is handed out.
    let remote_port = wait_for_remote_port(&pool, "e2e-1").await?;
    assert_eq!(remote_port, 27001);

    let mut public = TcpStream::connect(("127.0.0.1", remote_port)).await?;
    public.write_all(b"hello").await?;

    let mut buf = [0u8; 5];
    timeout(Duration::from_secs(5), public.read_exact(&mut buf)).await??;
    assert_eq!(&buf, b"hello");

    // A second exchange on the same splice still works.
    public.write_all(b"again").await?;
    timeout(Duration::from_secs(5), public.read_exact(&mut buf)).await??;
    assert_eq!(&buf, b"again");

    connector.stop();
    let _ = run.await;
    pool.stop("e2e-1").await?;
    Ok(())
}

#[tokio::test]
async fn pairing_timeout_reaps_the_public_socket() -> Result<()> {
    let config = server_config("e2e-2", 17002, "27021..27030");
    let pool = tunnel_server::startup(config).await?;

    let (mut control, session_id) = raw_client(17002, "quiet-1").await?;
    let response = register(&mut control, &session_id, service("quiet", Some(27021))).await?;
    assert!(response.success);

    // Public user arrives, the broker signals the client...
    let mut public = TcpStream::connect("127.0.0.1:27021").await?;
    let signal = codec::read_message(&mut control, DEFAULT_MAX_FRAME).await?;
    let connection_id = match signal.payload {
        Payload::ProxyRequest(request) => request.connection_id,
        other => bail!("expected a proxy request, got {:?}", other),
    };

    // ...and the client never dials back. The sweeper must close the
    // public socket.
    let mut buf = [0u8; 1];
    match timeout(Duration::from_secs(5), public.read(&mut buf)).await? {
        Ok(0) | Err(_) => {}
        Ok(_) => bail!("public socket received unexpected bytes"),
    }

    // A data connection that shows up after the sweep gets an error
    // frame and is closed.
    let mut late = TcpStream::connect("127.0.0.1:17002").await?;
    let handshake = ControlMessage::new(Payload::DataConnection(DataConnection {
        connection_id,
        client_id: "quiet-1".to_string(),
        service_id: None,
    }));
    codec::write_message(&mut late, &handshake).await?;

    let reply = codec::read_message(&mut late, DEFAULT_MAX_FRAME).await?;
    match reply.payload {
        Payload::Error(error) => assert_eq!(error.code, codes::UNKNOWN_CONNECTION),
        other => bail!("expected an error frame, got {:?}", other),
    }

    pool.stop("e2e-2").await?;
    Ok(())
}

#[tokio::test]
async fn heartbeat_timeout_closes_the_session_and_its_listeners() -> Result<()> {
    let config = {
        let mut config = (*server_config("e2e-3", 17003, "27041..27050")).clone();
        config.server.heartbeat_timeout = 2;
        Arc::new(config)
    };
    let pool = tunnel_server::startup(config).await?;

    let (mut control, session_id) = raw_client(17003, "mute-1").await?;
    let response = register(&mut control, &session_id, service("mute", Some(27041))).await?;
    assert!(response.success);

    // No heartbeats ever. The server must drop the session and the
    // control socket with it.
    let mut buf = [0u8; 64];
    let deadline = Duration::from_secs(10);
    loop {
        match timeout(deadline, control.read(&mut buf)).await? {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }

    // The service listener must be gone with the session.
    let mut refused = false;
    for _ in 0..50 {
        if TcpStream::connect("127.0.0.1:27041").await.is_err() {
            refused = true;
            break;
        }

        sleep(Duration::from_millis(100)).await;
    }
    assert!(refused, "service listener survived the session");

    let snapshot = pool.server_snapshot("e2e-3").await.unwrap();
    assert_eq!(snapshot["sessions"].as_array().unwrap().len(), 0);
    assert_eq!(snapshot["services"].as_array().unwrap().len(), 0);

    pool.stop("e2e-3").await?;
    Ok(())
}

#[tokio::test]
async fn requested_port_conflicts_are_rejected() -> Result<()> {
    let config = server_config("e2e-4", 17004, "27061..27070");
    let pool = tunnel_server::startup(config).await?;

    let (mut first, first_session) = raw_client(17004, "holder").await?;
    let response = register(&mut first, &first_session, service("a", Some(27061))).await?;
    assert!(response.success);

    let (mut second, second_session) = raw_client(17004, "contender").await?;
    let response = register(&mut second, &second_session, service("b", Some(27061))).await?;
    assert!(!response.success);
    assert_eq!(response.code.as_deref(), Some(codes::PORT_IN_USE));

    // The loser retries on another port and wins it.
    let response = register(&mut second, &second_session, service("b", Some(27062))).await?;
    assert!(response.success);
    assert_eq!(response.remote_port, Some(27062));

    // Outside the policy is its own failure.
    let response = register(&mut second, &second_session, service("c", Some(5))).await?;
    assert!(!response.success);
    assert_eq!(response.code.as_deref(), Some(codes::PORT_NOT_ALLOWED));

    pool.stop("e2e-4").await?;
    Ok(())
}

#[tokio::test]
async fn unregister_frees_the_port_and_the_name() -> Result<()> {
    let config = server_config("e2e-5", 17005, "27081..27090");
    let pool = tunnel_server::startup(config).await?;

    let (mut control, session_id) = raw_client(17005, "cycler").await?;

    let response = register(&mut control, &session_id, service("tmp", Some(27081))).await?;
    assert!(response.success);
    let service_id = response.service_id.unwrap();

    let frame = ControlMessage::with_session(
        &session_id,
        Payload::UnregisterService(codec::message::UnregisterService {
            service_id,
            service_name: "tmp".to_string(),
        }),
    );
    codec::write_message(&mut control, &frame).await?;

    let reply = codec::read_message(&mut control, DEFAULT_MAX_FRAME).await?;
    match reply.payload {
        Payload::Response(response) => assert!(response.success),
        other => bail!("unexpected reply: {:?}", other),
    }

    let snapshot = pool.server_snapshot("e2e-5").await.unwrap();
    assert_eq!(snapshot["services"].as_array().unwrap().len(), 0);
    assert_eq!(snapshot["portsAllocated"].as_u64(), Some(0));

    // Same name, same port, registered again without complaint.
    let response = register(&mut control, &session_id, service("tmp", Some(27081))).await?;
    assert!(response.success);

    pool.stop("e2e-5").await?;
    Ok(())
}

#[tokio::test]
async fn duplicate_auth_is_rejected_and_fatal() -> Result<()> {
    let config = server_config("e2e-6", 17006, "27101..27110");
    let pool = tunnel_server::startup(config).await?;

    let (mut control, session_id) = raw_client(17006, "double").await?;

    let again = ControlMessage::with_session(&session_id, Payload::Auth(record("double")));
    codec::write_message(&mut control, &again).await?;

    let reply = codec::read_message(&mut control, DEFAULT_MAX_FRAME).await?;
    match reply.payload {
        Payload::Error(error) => assert_eq!(error.code, codes::DUPLICATE_AUTH),
        other => bail!("expected an error frame, got {:?}", other),
    }

    // The server closes after the error frame.
    let mut buf = [0u8; 16];
    loop {
        match timeout(Duration::from_secs(5), control.read(&mut buf)).await? {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }

    pool.stop("e2e-6").await?;
    Ok(())
}

#[tokio::test]
async fn wrong_token_is_refused() -> Result<()> {
    let config = server_config("e2e-7", 17007, "27121..27130");
    let pool = tunnel_server::startup(config).await?;

    let mut stream = TcpStream::connect("127.0.0.1:17007").await?;
    let mut bad = record("liar");
    bad.auth_token = "wrong".to_string();

    codec::write_message(&mut stream, &ControlMessage::new(Payload::Auth(bad))).await?;

    let reply = codec::read_message(&mut stream, DEFAULT_MAX_FRAME).await?;
    match reply.payload {
        Payload::Response(response) => {
            assert!(!response.success);
            assert_eq!(response.code.as_deref(), Some(codes::AUTH_FAILED));
        }
        other => bail!("unexpected reply: {:?}", other),
    }

    pool.stop("e2e-7").await?;
    Ok(())
}

#[tokio::test]
async fn kicked_clients_are_notified_and_dropped() -> Result<()> {
    let config = server_config("e2e-9", 17009, "27161..27170");
    let pool = tunnel_server::startup(config).await?;

    let (mut control, session_id) = raw_client(17009, "victim").await?;
    let response = register(&mut control, &session_id, service("gone", Some(27161))).await?;
    assert!(response.success);

    pool.kick("e2e-9", "victim").await?;

    let reply = codec::read_message(&mut control, DEFAULT_MAX_FRAME).await?;
    match reply.payload {
        Payload::Notification(notification) => assert_eq!(notification.title, "kicked"),
        other => bail!("expected a notification, got {:?}", other),
    }

    let mut buf = [0u8; 16];
    loop {
        match timeout(Duration::from_secs(5), control.read(&mut buf)).await? {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }

    let snapshot = pool.server_snapshot("e2e-9").await.unwrap();
    assert_eq!(snapshot["sessions"].as_array().unwrap().len(), 0);

    // Kicking a client with no session is an error the caller sees.
    assert!(pool.kick("e2e-9", "victim").await.is_err());

    pool.stop("e2e-9").await?;
    Ok(())
}

#[tokio::test]
async fn stop_takes_everything_down() -> Result<()> {
    let config = server_config("e2e-8", 17008, "27141..27150");
    let pool = tunnel_server::startup(config).await?;

    let (mut control, session_id) = raw_client(17008, "tenant-of-doom").await?;
    let response = register(&mut control, &session_id, service("doomed", Some(27141))).await?;
    assert!(response.success);

    pool.stop("e2e-8").await?;

    // The session saw a notification or a plain close, either way the
    // socket ends.
    let mut buf = [0u8; 256];
    loop {
        match timeout(Duration::from_secs(5), control.read(&mut buf)).await? {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }

    assert!(TcpStream::connect("127.0.0.1:27141").await.is_err());
    assert!(TcpStream::connect("127.0.0.1:17008").await.is_err());
    assert!(pool.server_snapshot("e2e-8").await.is_none());

    // Stop again is a quiet no-op.
    pool.stop("e2e-8").await?;
    Ok(())
}
