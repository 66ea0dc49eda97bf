pub mod listener;
pub mod session;
pub mod tls;

pub use listener::{ListenerPool, PublicConn};
pub use session::Outbounds;
pub use tls::ControlStream;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use ahash::AHashMap;
use anyhow::Result;
use codec::{
    ControlMessage, Payload,
    message::{DataConnection, ErrorInfo, codes},
    splice::{SpliceOptions, Traffic, splice},
};
use parking_lot::Mutex;
use service::{
    counters::Number,
    now_secs,
    pending::PendingRequests,
    ports::PortAllocator,
    services::Services,
    session::Sessions,
};
use tokio::{
    net::TcpListener,
    sync::{broadcast, oneshot},
};
use tokio_rustls::TlsAcceptor;

use crate::{
    config::Config,
    observer::Observer,
    repository::update_with_retry,
    statistics::Statistics,
};

/// Shared state of one running broker instance. The accept loop, every
/// session, every service listener and the sweepers all hang off an
/// `Arc` of this.
pub struct TunnelServer {
    pub config: Arc<Config>,
    pub sessions: Sessions,
    pub services: Services,
    pub pending: PendingRequests<PublicConn>,
    pub ports: Mutex<PortAllocator>,
    pub outbounds: Outbounds,
    pub listeners: ListenerPool,
    pub statistics: Statistics,
    pub observer: Observer,
    pub(crate) kicks: Mutex<AHashMap<String, oneshot::Sender<()>>>,
    shutdown: broadcast::Sender<()>,
    force: broadcast::Sender<()>,
}

impl TunnelServer {
    pub fn new(config: Arc<Config>, observer: Observer, statistics: Statistics) -> Arc<Self> {
        let ports = PortAllocator::new(config.server.allowed_ports.clone());

        Arc::new(Self {
            sessions: Default::default(),
            services: Default::default(),
            pending: Default::default(),
            ports: Mutex::new(ports),
            outbounds: Default::default(),
            listeners: Default::default(),
            statistics,
            observer,
            kicks: Default::default(),
            shutdown: broadcast::channel(1).0,
            force: broadcast::channel(1).0,
            config,
        })
    }

    /// Terminates one session out of band. True when the session was
    /// live and got the signal.
    pub fn kick_session(&self, session_id: &str) -> bool {
        match self.kicks.lock().remove(session_id) {
            Some(sender) => sender.send(()).is_ok(),
            None => false,
        }
    }

    /// First shutdown phase: acceptors, listeners and sessions stop, live
    /// splices keep draining.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Second phase, fired after the drain window: live splices end now.
    pub fn trigger_force_shutdown(&self) {
        let _ = self.force.send(());
    }

    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub fn force_signal(&self) -> broadcast::Receiver<()> {
        self.force.subscribe()
    }
}

/// Binds the control port and spawns the accept loop, the pending
/// sweeper and the counter flusher. A bind failure here is the one error
/// that is fatal to the server.
pub async fn start(server: &Arc<TunnelServer>) -> Result<()> {
    let broker = &server.config.server;

    let acceptor = match &broker.ssl {
        Some(ssl) => Some(tls::acceptor(ssl)?),
        None => None,
    };

    let listener = TcpListener::bind(broker.listen).await?;

    log::info!(
        "tunnel server listening: server={}, listen={}, tls={}",
        broker.server_id,
        broker.listen,
        acceptor.is_some()
    );

    tokio::spawn(accept_loop(server.clone(), listener, acceptor));
    tokio::spawn(sweep_loop(server.clone()));
    tokio::spawn(flush_loop(server.clone()));
    Ok(())
}

async fn accept_loop(
    server: Arc<TunnelServer>,
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
) {
    let mut shutdown = server.shutdown_signal();

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    let server = server.clone();
                    let acceptor = acceptor.clone();

                    tokio::spawn(async move {
                        handle_connection(server, stream, peer, acceptor).await;
                    });
                }
                Err(e) => {
                    log::warn!("control accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.recv() => break,
        }
    }

    log::info!(
        "control acceptor stopped: server={}",
        server.config.server.server_id
    );
}

/// The first frame on a fresh connection decides its role: `auth` makes
/// it a control session, `data_connection` makes it a data connection,
/// anything else is refused.
async fn handle_connection(
    server: Arc<TunnelServer>,
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
) {
    stream.set_nodelay(true).ok();

    let mut stream = match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => ControlStream::Tls(Box::new(stream)),
            Err(e) => {
                log::debug!("tls handshake failed: peer={}, {}", peer, e);
                return;
            }
        },
        None => ControlStream::Plain(stream),
    };

    let first = match codec::read_message(&mut stream, server.config.server.max_frame_size).await {
        Ok(message) => message,
        Err(e) => {
            log::debug!("unreadable first frame: peer={}, {}", peer, e);
            return;
        }
    };

    match first.payload {
        Payload::Auth(record) => session::run(server, stream, peer, record).await,
        Payload::DataConnection(handshake) => pair(server, stream, peer, handshake).await,
        _ => {
            log::warn!("unexpected first frame: peer={}", peer);
            send_error(
                &mut stream,
                codes::PROTOCOL_ERROR,
                "first frame must be auth or data_connection",
            )
            .await;
        }
    }
}

async fn send_error(stream: &mut ControlStream, code: &str, message: &str) {
    use tokio::io::AsyncWriteExt;

    let frame = ControlMessage::new(Payload::Error(ErrorInfo::new(code, message)));
    let _ = codec::write_message(stream, &frame).await;
    let _ = stream.shutdown().await;
}

/// Consumes the pending entry for a freshly dialed data connection and
/// splices it with the parked public side.
async fn pair(
    server: Arc<TunnelServer>,
    mut stream: ControlStream,
    peer: SocketAddr,
    handshake: DataConnection,
) {
    let Some(entry) = server.pending.take(&handshake.connection_id) else {
        log::warn!(
            "data connection for unknown id: connection={}, peer={}",
            handshake.connection_id,
            peer
        );

        server.statistics.orphan_data_connections.add(1);
        send_error(&mut stream, codes::UNKNOWN_CONNECTION, "unknown or expired connection id")
            .await;
        return;
    };

    if entry.client_id != handshake.client_id {
        // Another client answered; put the public side back so the right
        // one can still claim it.
        let _ = server.pending.put(entry);
        send_error(&mut stream, codes::PROTOCOL_ERROR, "connection belongs to another client")
            .await;
        return;
    }

    let Some(service) = server.services.get(&entry.service_id) else {
        send_error(&mut stream, codes::UNKNOWN_SERVICE, "service is gone").await;
        return;
    };

    service.touch();
    server.observer.paired(&service, &entry.connection_id);
    server.statistics.live_splices.add(1);

    let connection_id = entry.connection_id.clone();
    let (received, sent) = match entry.stream {
        PublicConn::Tcp(public) => {
            let options = SpliceOptions {
                buffer_size: server.config.server.splice_buffer,
                deadline: None,
            };

            let traffic = Traffic::default();
            let mut force = server.force_signal();

            tokio::select! {
                result = splice(public, stream, &options, &traffic) => {
                    if let Err(e) = result {
                        log::debug!("splice ended with error: connection={}, {}", connection_id, e);
                    }
                }
                _ = force.recv() => {
                    log::debug!("splice force closed: connection={}", connection_id);
                }
            }

            (traffic.a_to_b(), traffic.b_to_a())
        }
        PublicConn::Udp(conn) => {
            listener::udp_pump(conn, stream, server.force_signal()).await
        }
    };

    service.counts.on_close(received, sent);
    server.statistics.live_splices.sub(1);

    log::info!(
        "splice finished: connection={}, service={}, received={}, sent={}",
        connection_id,
        service.service_id,
        received,
        sent
    );
}

/// Reaps pending entries older than the pairing timeout. Their public
/// sockets close when the entries drop, after the table lock is gone.
async fn sweep_loop(server: Arc<TunnelServer>) {
    let timeout = Duration::from_secs(server.config.server.pairing_timeout);
    let mut shutdown = server.shutdown_signal();
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tick.tick() => {
                for expired in server.pending.take_expired(timeout) {
                    server
                        .observer
                        .pairing_expired(&expired.connection_id, &expired.service_id);

                    if let Some(service) = server.services.get(&expired.service_id) {
                        service.counts.current_connections.sub(1);
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

/// Best-effort counter publication on the flush window. Failures log and
/// wait for the next window.
async fn flush_loop(server: Arc<TunnelServer>) {
    let window = Duration::from_secs(server.config.server.flush_window.max(1));
    let mut shutdown = server.shutdown_signal();
    let mut tick = tokio::time::interval(window);

    loop {
        tokio::select! {
            _ = tick.tick() => flush_counters(&server),
            _ = shutdown.recv() => break,
        }
    }
}

fn flush_counters(server: &Arc<TunnelServer>) {
    let repository = server.observer.repository();

    for entry in server.services.snapshot() {
        let counts = entry.counts.snapshot();
        let last_active = entry.last_active();

        let result = update_with_retry(
            repository.services.as_ref(),
            &entry.tenant_id,
            &entry.service_id,
            "flush",
            |row| {
                row.current_connections = counts.current_connections;
                row.total_connections = counts.total_connections;
                row.received_bytes = counts.received_bytes;
                row.sent_bytes = counts.sent_bytes;
                row.last_active_at = (last_active > 0).then_some(last_active);
            },
        );

        if let Err(e) = result {
            log::debug!("service counter flush failed: service={}, {}", entry.service_id, e);
        }
    }

    for session in server.sessions.snapshot() {
        let last_heartbeat = session.last_activity();
        let services = session.service_count() as u64;

        let result = update_with_retry(
            repository.clients.as_ref(),
            &session.tenant_id,
            &session.client_id,
            "flush",
            |row| {
                row.last_heartbeat_at = Some(last_heartbeat);
                row.service_count = services;
            },
        );

        if let Err(e) = result {
            log::debug!("client counter flush failed: client={}, {}", session.client_id, e);
        }
    }

    log::trace!(
        "counters flushed: services={}, sessions={}, pending={}, at={}",
        server.services.len(),
        server.sessions.len(),
        server.pending.len(),
        now_secs()
    );
}
