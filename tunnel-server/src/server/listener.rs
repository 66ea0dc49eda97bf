use std::{net::SocketAddr, sync::Arc, time::{Duration, Instant}};

use ahash::AHashMap;
use anyhow::Result;
use bytes::BytesMut;
use codec::{
    ControlMessage, Payload, datagram,
    message::{ProxyRequest, ServiceKind},
};
use parking_lot::Mutex;
use service::{counters::Number, pending::PendingRequest, services::ServiceEntry, unique_id};
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream, UdpSocket},
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};

use super::{ControlStream, TunnelServer};

/// Datagrams a public UDP peer may queue while its pairing is in flight.
const UDP_BACKLOG: usize = 64;

/// A paired UDP flow with no traffic in either direction for this long is
/// torn down.
const UDP_IDLE: Duration = Duration::from_secs(60);

type UdpPeers = Arc<Mutex<AHashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>>;

/// What a service listener parks in the pending table. For TCP it is the
/// accepted socket itself; for UDP it is one public peer's flow over the
/// shared socket.
#[derive(Debug)]
pub enum PublicConn {
    Tcp(TcpStream),
    Udp(UdpConn),
}

#[derive(Debug)]
pub struct UdpConn {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    inbound: mpsc::Receiver<Vec<u8>>,
    peers: UdpPeers,
}

impl Drop for UdpConn {
    fn drop(&mut self) {
        // Unmaps the peer so its next datagram starts a fresh pairing.
        self.peers.lock().remove(&self.peer);
    }
}

/// One bound public listener. Dropping the close side stops the loop.
pub struct ListenerHandle {
    pub service_id: String,
    pub remote_port: u16,
    close: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn close(self) {
        drop(self.close);
        self.task.abort();
    }
}

#[derive(Default)]
pub struct ListenerPool(Mutex<AHashMap<String, ListenerHandle>>);

impl ListenerPool {
    pub fn insert(&self, handle: ListenerHandle) {
        self.0.lock().insert(handle.service_id.clone(), handle);
    }

    pub fn remove(&self, service_id: &str) -> Option<ListenerHandle> {
        self.0.lock().remove(service_id)
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn close_all(&self) {
        let handles: Vec<ListenerHandle> = {
            let mut pool = self.0.lock();
            pool.drain().map(|(_, handle)| handle).collect()
        };

        for handle in handles {
            handle.close();
        }
    }
}

/// Binds the public listener for a freshly registered service. The bind
/// address reuses the control listener's interface.
pub async fn spawn(server: Arc<TunnelServer>, entry: Arc<ServiceEntry>) -> Result<ListenerHandle> {
    let address = SocketAddr::new(server.config.server.listen.ip(), entry.remote_port);
    let (close, closed) = oneshot::channel();

    let task = match entry.kind {
        ServiceKind::Udp => {
            let socket = Arc::new(UdpSocket::bind(address).await?);
            log::info!(
                "service listener bound: service={}, name={}, udp={}",
                entry.service_id,
                entry.name,
                address
            );

            tokio::spawn(udp_loop(server, entry.clone(), socket, closed))
        }
        _ => {
            let listener = TcpListener::bind(address).await?;
            log::info!(
                "service listener bound: service={}, name={}, tcp={}",
                entry.service_id,
                entry.name,
                address
            );

            tokio::spawn(tcp_loop(server, entry.clone(), listener, closed))
        }
    };

    Ok(ListenerHandle {
        service_id: entry.service_id.clone(),
        remote_port: entry.remote_port,
        close,
        task,
    })
}

async fn tcp_loop(
    server: Arc<TunnelServer>,
    entry: Arc<ServiceEntry>,
    listener: TcpListener,
    mut closed: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((public, peer)) => {
                    accept_public(&server, &entry, PublicConn::Tcp(public), peer).await;
                }
                Err(e) => {
                    log::warn!("service listener accept failed: service={}, {}", entry.service_id, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = &mut closed => break,
        }
    }

    log::info!(
        "service listener closed: service={}, name={}, port={}",
        entry.service_id,
        entry.name,
        entry.remote_port
    );
}

/// Steps 1..4 of the accept path: cap check, mint an id, park the public
/// side, signal the owning client. Nothing here blocks on the pairing.
async fn accept_public(
    server: &Arc<TunnelServer>,
    entry: &Arc<ServiceEntry>,
    conn: PublicConn,
    peer: SocketAddr,
) {
    if entry.at_capacity() {
        // No peer exists on the data plane yet, so the drop is silent.
        log::debug!(
            "connection cap reached: service={}, peer={}",
            entry.service_id,
            peer
        );

        return;
    }

    entry.counts.on_open();

    let connection_id = unique_id("conn");
    let request = PendingRequest::new(
        connection_id.clone(),
        entry.service_id.clone(),
        entry.name.clone(),
        entry.client_id.clone(),
        conn,
    );

    if server.pending.put(request).is_err() {
        log::error!("connection id collision: connection={}", connection_id);
        entry.counts.current_connections.sub(1);
        return;
    }

    log::debug!(
        "public connection parked: connection={}, service={}, peer={}",
        connection_id,
        entry.service_id,
        peer
    );

    let message = ControlMessage::with_session(
        &entry.session_id,
        Payload::ProxyRequest(ProxyRequest {
            connection_id: connection_id.clone(),
            service_id: entry.service_id.clone(),
            service_name: entry.name.clone(),
            remote_address: peer.ip().to_string(),
            remote_port: peer.port(),
        }),
    );

    if !server.outbounds.send(&entry.session_id, message).await {
        // The owning session died under us; reclaim the entry instead of
        // letting the sweeper age it out.
        if server.pending.take(&connection_id).is_some() {
            entry.counts.current_connections.sub(1);
        }

        log::debug!(
            "proxy request undeliverable: connection={}, session={}",
            connection_id,
            entry.session_id
        );
    }
}

async fn udp_loop(
    server: Arc<TunnelServer>,
    entry: Arc<ServiceEntry>,
    socket: Arc<UdpSocket>,
    mut closed: oneshot::Receiver<()>,
) {
    let peers: UdpPeers = Default::default();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok((size, peer)) => {
                    let datagram = buf[..size].to_vec();
                    let sender = peers.lock().get(&peer).cloned();

                    match sender {
                        Some(sender) => {
                            if sender.try_send(datagram).is_err() && sender.is_closed() {
                                peers.lock().remove(&peer);
                            }
                        }
                        None => {
                            accept_udp_peer(&server, &entry, &socket, &peers, peer, datagram)
                                .await;
                        }
                    }
                }
                Err(e) => {
                    log::warn!("udp listener receive failed: service={}, {}", entry.service_id, e);
                }
            },
            _ = &mut closed => break,
        }
    }

    log::info!(
        "service listener closed: service={}, name={}, port={}",
        entry.service_id,
        entry.name,
        entry.remote_port
    );
}

/// First datagram from an unknown peer opens a virtual public connection
/// and requests a data connection for it, exactly like a TCP accept.
async fn accept_udp_peer(
    server: &Arc<TunnelServer>,
    entry: &Arc<ServiceEntry>,
    socket: &Arc<UdpSocket>,
    peers: &UdpPeers,
    peer: SocketAddr,
    datagram: Vec<u8>,
) {
    if entry.at_capacity() {
        log::debug!(
            "connection cap reached: service={}, peer={}",
            entry.service_id,
            peer
        );

        return;
    }

    let (sender, inbound) = mpsc::channel(UDP_BACKLOG);
    let _ = sender.try_send(datagram);
    peers.lock().insert(peer, sender);

    let conn = PublicConn::Udp(UdpConn {
        socket: socket.clone(),
        peer,
        inbound,
        peers: peers.clone(),
    });

    accept_public(server, entry, conn, peer).await;
}

/// Shuttles one UDP peer's datagrams over its paired data connection,
/// u16-length framed. Ends on stream EOF, idle expiry, or force
/// shutdown; returns (public to client, client to public) byte totals.
pub async fn udp_pump(
    mut conn: UdpConn,
    stream: ControlStream,
    mut force: broadcast::Receiver<()>,
) -> (u64, u64) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = BytesMut::with_capacity(64 * 1024);
    let mut received = 0u64;
    let mut sent = 0u64;
    let mut last_activity = Instant::now();
    let mut idle_check = tokio::time::interval(Duration::from_secs(5));

    'main: loop {
        while let Some(datagram) = datagram::decode(&mut buf) {
            if conn.socket.send_to(&datagram, conn.peer).await.is_err() {
                break 'main;
            }

            sent += datagram.len() as u64;
            last_activity = Instant::now();
        }

        tokio::select! {
            maybe = conn.inbound.recv() => match maybe {
                Some(datagram) => {
                    if datagram::write_datagram(&mut writer, &datagram).await.is_err() {
                        break;
                    }

                    received += datagram.len() as u64;
                    last_activity = Instant::now();
                }
                // The listener dropped its sender, the service is gone.
                None => break,
            },
            result = reader.read_buf(&mut buf) => match result {
                Ok(0) => break,
                Ok(_) => {}
                Err(_) => break,
            },
            _ = idle_check.tick() => {
                if last_activity.elapsed() >= UDP_IDLE {
                    break;
                }
            }
            _ = force.recv() => break,
        }
    }

    (received, sent)
}
