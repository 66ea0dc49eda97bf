//! Static proxy behavior: balancing, failover, health transitions, UDP
//! forwarding and reload diffing, all over loopback.

use std::{sync::Arc, time::Duration};

use anyhow::{Result, bail};
use codec::message::ServiceKind;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    time::{sleep, timeout},
};
use tunnel_server::config::{Config, HealthCheck, StaticNode, StaticServer};

/// A TCP backend that greets with its tag and hangs up.
async fn tagged_backend(tag: &'static str) -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = socket.write_all(tag.as_bytes()).await;
            });
        }
    });

    Ok(port)
}

fn node(target_port: u16) -> StaticNode {
    StaticNode {
        name: String::new(),
        target: "127.0.0.1".to_string(),
        port: target_port,
        weight: 1,
        max_connections: 0,
    }
}

fn static_server(
    name: &str,
    listen_port: u16,
    balance: &str,
    nodes: Vec<StaticNode>,
) -> StaticServer {
    StaticServer {
        name: name.to_string(),
        listen: format!("127.0.0.1:{}", listen_port).parse().unwrap(),
        transport: ServiceKind::Tcp,
        balance: match balance {
            "leastconn" => service::balance::BalancePolicy::LeastConn,
            "random" => service::balance::BalancePolicy::Random,
            _ => service::balance::BalancePolicy::RoundRobin,
        },
        max_connections: 0,
        connection_timeout: 1,
        retry_count: 2,
        retry_interval: 1,
        health_check: HealthCheck {
            // One initial probe round, then effectively never again so
            // the tests stay in control of node state.
            interval: 3600,
            timeout: 1,
            max_failures: 3,
            url: None,
        },
        nodes,
    }
}

fn config_with(server_id: &str, control_port: u16, statics: Vec<StaticServer>) -> Arc<Config> {
    let mut config = Config::default();
    config.server.server_id = server_id.to_string();
    config.server.listen = format!("127.0.0.1:{}", control_port).parse().unwrap();
    config.server.drain_window = 1;
    config.static_servers = statics;
    Arc::new(config)
}

async fn read_tag(listen_port: u16) -> Result<String> {
    let mut stream = TcpStream::connect(("127.0.0.1", listen_port)).await?;
    let mut tag = String::new();
    timeout(Duration::from_secs(5), stream.read_to_string(&mut tag)).await??;
    Ok(tag)
}

async fn wait_for_node_health(
    pool: &Arc<tunnel_server::runtime::ServerPool>,
    server_id: &str,
    node_index: usize,
    expected: &str,
) -> Result<()> {
    for _ in 0..100 {
        if let Some(snapshot) = pool.server_snapshot(server_id).await {
            let health = &snapshot["staticServers"][0]["nodes"][node_index]["health"];
            if health == expected {
                return Ok(());
            }
        }

        sleep(Duration::from_millis(50)).await;
    }

    bail!("node {} never became {}", node_index, expected);
}

#[tokio::test]
async fn round_robin_skips_the_unhealthy_node() -> Result<()> {
    let n1 = tagged_backend("n1").await?;
    let n3 = tagged_backend("n3").await?;

    // The middle node points at a port nothing listens on; its initial
    // probes take it out of rotation.
    let dead = {
        let probe = TcpListener::bind("127.0.0.1:0").await?;
        probe.local_addr()?.port()
    };

    let mut statics = static_server(
        "web",
        19001,
        "roundrobin",
        vec![node(n1), node(dead), node(n3)],
    );
    statics.health_check.max_failures = 1;

    let pool = tunnel_server::startup(config_with("static-1", 17101, vec![statics])).await?;
    wait_for_node_health(&pool, "static-1", 1, "unhealthy").await?;

    let mut served = Vec::new();
    for _ in 0..6 {
        served.push(read_tag(19001).await?);
    }

    assert_eq!(served, vec!["n1", "n3", "n1", "n3", "n1", "n3"]);

    pool.stop("static-1").await?;
    Ok(())
}

#[tokio::test]
async fn failed_dials_fail_over_and_eventually_quarantine() -> Result<()> {
    // n1 refuses connections, n2 serves.
    let dead = {
        let probe = TcpListener::bind("127.0.0.1:0").await?;
        probe.local_addr()?.port()
    };
    let n2 = tagged_backend("n2").await?;

    let statics = static_server("fail", 19002, "roundrobin", vec![node(dead), node(n2)]);
    let pool = tunnel_server::startup(config_with("static-2", 17102, vec![statics])).await?;

    // The initial probe already charged n1 with one failure; two more
    // dial failures push it over max_failures = 3.
    assert_eq!(read_tag(19002).await?, "n2");
    assert_eq!(read_tag(19002).await?, "n2");

    wait_for_node_health(&pool, "static-2", 0, "unhealthy").await?;

    // With n1 quarantined the dial succeeds on the first attempt.
    assert_eq!(read_tag(19002).await?, "n2");

    let snapshot = pool.server_snapshot("static-2").await.unwrap();
    let failures = snapshot["staticServers"][0]["nodes"][0]["failures"].as_u64().unwrap();
    assert!(failures >= 3, "failures = {}", failures);

    pool.stop("static-2").await?;
    Ok(())
}

#[tokio::test]
async fn least_conn_prefers_the_idle_backend() -> Result<()> {
    // A backend that holds its connections open until told to go.
    async fn holding_backend(tag: &'static str) -> Result<u16> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let _ = socket.write_all(tag.as_bytes()).await;
                    let mut buf = [0u8; 1];
                    let _ = socket.read(&mut buf).await;
                });
            }
        });

        Ok(port)
    }

    let b1 = holding_backend("b1").await?;
    let b2 = holding_backend("b2").await?;

    let statics = static_server("lc", 19003, "leastconn", vec![node(b1), node(b2)]);
    let pool = tunnel_server::startup(config_with("static-3", 17103, vec![statics])).await?;

    // First connection lands on b1 (tie, lower index) and stays open.
    let mut first = TcpStream::connect("127.0.0.1:19003").await?;
    let mut tag = [0u8; 2];
    timeout(Duration::from_secs(5), first.read_exact(&mut tag)).await??;
    assert_eq!(&tag, b"b1");

    // While b1 is busy, the next one must go to b2.
    let mut second = TcpStream::connect("127.0.0.1:19003").await?;
    timeout(Duration::from_secs(5), second.read_exact(&mut tag)).await??;
    assert_eq!(&tag, b"b2");

    pool.stop("static-3").await?;
    Ok(())
}

#[tokio::test]
async fn udp_datagrams_are_forwarded_both_ways() -> Result<()> {
    // A UDP echo backend.
    let backend = UdpSocket::bind("127.0.0.1:0").await?;
    let backend_port = backend.local_addr()?.port();

    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((size, peer)) = backend.recv_from(&mut buf).await {
            let _ = backend.send_to(&buf[..size], peer).await;
        }
    });

    let mut statics = static_server("dns", 19004, "roundrobin", vec![node(backend_port)]);
    statics.transport = ServiceKind::Udp;

    let pool = tunnel_server::startup(config_with("static-4", 17104, vec![statics])).await?;
    sleep(Duration::from_millis(200)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await?;
    client.connect("127.0.0.1:19004").await?;

    let mut buf = [0u8; 2048];
    let mut size = 0;
    for _ in 0..10 {
        client.send(b"ping").await?;
        match timeout(Duration::from_millis(500), client.recv(&mut buf)).await {
            Ok(Ok(received)) => {
                size = received;
                break;
            }
            _ => continue,
        }
    }

    assert_eq!(&buf[..size], b"ping");

    pool.stop("static-4").await?;
    Ok(())
}

#[tokio::test]
async fn reload_adds_and_keeps_static_servers() -> Result<()> {
    let alpha = tagged_backend("a1").await?;
    let beta = tagged_backend("b1").await?;

    let first = config_with(
        "static-5",
        17105,
        vec![static_server("alpha", 19005, "roundrobin", vec![node(alpha)])],
    );

    let pool = tunnel_server::startup(first.clone()).await?;
    assert_eq!(read_tag(19005).await?, "a1");

    let second = {
        let mut config = (*first).clone();
        config
            .static_servers
            .push(static_server("beta", 19006, "roundrobin", vec![node(beta)]));
        Arc::new(config)
    };

    pool.reload(second).await?;

    // The new listener serves and the untouched one kept running.
    assert_eq!(read_tag(19006).await?, "b1");
    assert_eq!(read_tag(19005).await?, "a1");

    let snapshot = pool.server_snapshot("static-5").await.unwrap();
    assert_eq!(snapshot["staticServers"].as_array().unwrap().len(), 2);

    pool.stop("static-5").await?;
    Ok(())
}
