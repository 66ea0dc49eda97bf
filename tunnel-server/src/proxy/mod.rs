//! The static proxy: pre-configured public listeners forwarding to a
//! load-balanced pool of backends, independent of any tunnel client.

pub mod health;

use std::{net::SocketAddr, sync::Arc, time::{Duration, Instant}};

use ahash::AHashMap;
use anyhow::Result;
use codec::{
    message::ServiceKind,
    splice::{SpliceOptions, Traffic, splice},
};
use parking_lot::Mutex;
use service::{
    balance::{Node, NodePool},
    counters::{Count, Number, TrafficCounts},
    unique_id,
};
use tokio::{
    net::{TcpListener, TcpStream, UdpSocket},
    sync::{broadcast, mpsc},
    time::timeout,
};

use crate::{
    config::StaticServer,
    repository::{Audit, Repository, StaticNodeRow, StaticServerRow, update_with_retry},
};

/// Datagrams a public UDP peer may queue while its flow starts.
const UDP_BACKLOG: usize = 64;

/// A UDP flow with no traffic in either direction for this long is torn
/// down and its mapping forgotten.
const UDP_IDLE: Duration = Duration::from_secs(60);

/// One running static server: its listener, node pool, health checker
/// and counter flusher.
pub struct StaticProxy {
    pub static_server_id: String,
    pub tenant_id: String,
    pub config: StaticServer,
    pub pool: Arc<NodePool>,
    pub counts: TrafficCounts<Count>,
    repository: Repository,
    shutdown: broadcast::Sender<()>,
}

impl StaticProxy {
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    /// Stops the proxy and soft-deletes its rows, used when a reload
    /// removes or replaces it.
    pub fn retire(&self) {
        self.stop();

        let _ = self.repository.static_servers.soft_delete(
            &self.tenant_id,
            &self.static_server_id,
            "reload",
        );

        for node in self.pool.nodes() {
            let _ =
                self.repository
                    .static_nodes
                    .soft_delete(&self.tenant_id, &node.node_id, "reload");
        }
    }

    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }
}

/// Binds and runs one static server. A bind failure here is an error for
/// this listener only, never fatal to the broker.
pub async fn start(
    config: StaticServer,
    repository: Repository,
    tenant_id: String,
) -> Result<Arc<StaticProxy>> {
    let nodes: Vec<Arc<Node>> = config
        .nodes
        .iter()
        .enumerate()
        .map(|(index, node)| {
            let node_id = if node.name.is_empty() {
                format!("{}-node-{}", config.name, index)
            } else {
                node.name.clone()
            };

            Arc::new(Node::new(
                node_id,
                node.target.clone(),
                node.port,
                node.weight,
                node.max_connections,
            ))
        })
        .collect();

    let proxy = Arc::new(StaticProxy {
        static_server_id: unique_id("static"),
        tenant_id,
        pool: Arc::new(NodePool::new(config.balance, nodes)),
        counts: Default::default(),
        repository,
        shutdown: broadcast::channel(1).0,
        config,
    });

    persist_rows(&proxy);

    match proxy.config.transport {
        ServiceKind::Udp => {
            let socket = Arc::new(UdpSocket::bind(proxy.config.listen).await?);
            tokio::spawn(udp_loop(proxy.clone(), socket));
        }
        _ => {
            let listener = TcpListener::bind(proxy.config.listen).await?;
            tokio::spawn(tcp_loop(proxy.clone(), listener));
        }
    }

    log::info!(
        "static server listening: name={}, listen={}, transport={}, nodes={}",
        proxy.config.name,
        proxy.config.listen,
        proxy.config.transport,
        proxy.pool.len()
    );

    tokio::spawn(health::health_loop(proxy.clone()));
    tokio::spawn(flush_loop(proxy.clone()));
    Ok(proxy)
}

async fn tcp_loop(proxy: Arc<StaticProxy>, listener: TcpListener) {
    let mut shutdown = proxy.shutdown_signal();

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((public, peer)) => {
                    if at_capacity(&proxy) {
                        log::debug!("static server full: name={}, peer={}", proxy.config.name, peer);
                        continue;
                    }

                    let proxy = proxy.clone();
                    tokio::spawn(async move {
                        forward_tcp(proxy, public, peer).await;
                    });
                }
                Err(e) => {
                    log::warn!("static accept failed: name={}, {}", proxy.config.name, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.recv() => break,
        }
    }

    log::info!("static server stopped: name={}", proxy.config.name);
}

fn at_capacity(proxy: &StaticProxy) -> bool {
    proxy.config.max_connections > 0
        && proxy.counts.current_connections.get() >= proxy.config.max_connections
}

/// Selection with dial retry: a failed dial bumps the node's failure
/// count and the next attempt re-selects, so an unhealthy backend slides
/// out of rotation mid-storm.
async fn connect_backend(proxy: &StaticProxy) -> Option<(Arc<Node>, TcpStream)> {
    let dial_timeout = Duration::from_secs(proxy.config.connection_timeout);
    let max_failures = proxy.config.health_check.max_failures;

    for attempt in 0..=proxy.config.retry_count {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(proxy.config.retry_interval)).await;
        }

        let Some(node) = proxy.pool.select() else {
            log::warn!("no selectable node: name={}", proxy.config.name);
            return None;
        };

        match timeout(dial_timeout, TcpStream::connect(node.target())).await {
            Ok(Ok(backend)) => {
                node.record_success();
                return Some((node, backend));
            }
            Ok(Err(e)) => {
                log::debug!("backend dial failed: node={}, {}", node.node_id, e);
            }
            Err(_) => {
                log::debug!("backend dial timed out: node={}", node.node_id);
            }
        }

        if node.record_failure(max_failures) {
            log::warn!(
                "node marked unhealthy after failed dials: name={}, node={}",
                proxy.config.name,
                node.node_id
            );
        }
    }

    None
}

async fn forward_tcp(proxy: Arc<StaticProxy>, public: TcpStream, peer: SocketAddr) {
    let Some((node, backend)) = connect_backend(&proxy).await else {
        // All attempts failed; the public connection just drops.
        return;
    };

    proxy.counts.on_open();
    node.counts.on_open();

    log::debug!(
        "static forward: name={}, peer={}, node={}",
        proxy.config.name,
        peer,
        node.node_id
    );

    let traffic = Traffic::default();
    let mut shutdown = proxy.shutdown_signal();

    let splice_options = SpliceOptions::default();
    tokio::select! {
        result = splice(public, backend, &splice_options, &traffic) => {
            if let Err(e) = result {
                log::debug!("static splice ended with error: name={}, {}", proxy.config.name, e);
            }
        }
        _ = shutdown.recv() => {}
    }

    proxy.counts.on_close(traffic.a_to_b(), traffic.b_to_a());
    node.counts.on_close(traffic.a_to_b(), traffic.b_to_a());
}

async fn udp_loop(proxy: Arc<StaticProxy>, socket: Arc<UdpSocket>) {
    let mut shutdown = proxy.shutdown_signal();
    let peers: Arc<Mutex<AHashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>> = Default::default();
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
                            if at_capacity(&proxy) {
                                continue;
                            }

                            let Some(node) = proxy.pool.select() else {
                                log::warn!("no selectable node: name={}", proxy.config.name);
                                continue;
                            };

                            let (sender, inbound) = mpsc::channel(UDP_BACKLOG);
                            let _ = sender.try_send(datagram);
                            peers.lock().insert(peer, sender);

                            tokio::spawn(udp_flow(
                                proxy.clone(),
                                node,
                                socket.clone(),
                                peers.clone(),
                                peer,
                                inbound,
                            ));
                        }
                    }
                }
                Err(e) => {
                    log::warn!("static udp receive failed: name={}, {}", proxy.config.name, e);
                }
            },
            _ = shutdown.recv() => break,
        }
    }

    log::info!("static server stopped: name={}", proxy.config.name);
}

/// One public UDP peer relayed through one selected node.
async fn udp_flow(
    proxy: Arc<StaticProxy>,
    node: Arc<Node>,
    socket: Arc<UdpSocket>,
    peers: Arc<Mutex<AHashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>>,
    peer: SocketAddr,
    mut inbound: mpsc::Receiver<Vec<u8>>,
) {
    let upstream = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(upstream) => upstream,
        Err(e) => {
            log::warn!("udp upstream bind failed: {}", e);
            peers.lock().remove(&peer);
            return;
        }
    };

    if upstream.connect(node.target()).await.is_err() {
        node.record_failure(proxy.config.health_check.max_failures);
        peers.lock().remove(&peer);
        return;
    }

    proxy.counts.on_open();
    node.counts.on_open();

    let mut received = 0u64;
    let mut sent = 0u64;
    let mut buf = vec![0u8; 64 * 1024];
    let mut last_activity = Instant::now();
    let mut idle_check = tokio::time::interval(Duration::from_secs(5));
    let mut shutdown = proxy.shutdown_signal();

    loop {
        tokio::select! {
            maybe = inbound.recv() => match maybe {
                Some(datagram) => {
                    if upstream.send(&datagram).await.is_err() {
                        break;
                    }

                    received += datagram.len() as u64;
                    last_activity = Instant::now();
                }
                None => break,
            },
            result = upstream.recv(&mut buf) => match result {
                Ok(size) => {
                    if socket.send_to(&buf[..size], peer).await.is_err() {
                        break;
                    }

                    sent += size as u64;
                    last_activity = Instant::now();
                }
                Err(_) => break,
            },
            _ = idle_check.tick() => {
                if last_activity.elapsed() >= UDP_IDLE {
                    break;
                }
            }
            _ = shutdown.recv() => break,
        }
    }

    peers.lock().remove(&peer);
    proxy.counts.on_close(received, sent);
    node.counts.on_close(received, sent);
}

/// Seeds the repository rows for the static server and its nodes.
fn persist_rows(proxy: &Arc<StaticProxy>) {
    let row = StaticServerRow {
        tenant_id: proxy.tenant_id.clone(),
        static_server_id: proxy.static_server_id.clone(),
        name: proxy.config.name.clone(),
        listen_address: proxy.config.listen.ip().to_string(),
        listen_port: proxy.config.listen.port(),
        transport: proxy.config.transport.to_string(),
        balance: format!("{:?}", proxy.pool.policy()).to_lowercase(),
        max_connections: proxy.config.max_connections,
        audit: Audit::new("startup"),
    };

    if let Err(e) = proxy.repository.static_servers.insert(row) {
        log::warn!("static server row insert failed: name={}, {}", proxy.config.name, e);
    }

    for node in proxy.pool.nodes() {
        let row = StaticNodeRow {
            tenant_id: proxy.tenant_id.clone(),
            node_id: node.node_id.clone(),
            static_server_id: proxy.static_server_id.clone(),
            target_address: node.target_address.clone(),
            target_port: node.target_port,
            weight: node.weight,
            max_connections: node.max_connections,
            health: node.health().as_str().to_string(),
            failures: 0,
            current_connections: 0,
            total_connections: 0,
            received_bytes: 0,
            sent_bytes: 0,
            last_check_at: None,
            last_check_status: String::new(),
            audit: Audit::new("startup"),
        };

        if let Err(e) = proxy.repository.static_nodes.insert(row) {
            log::warn!("static node row insert failed: node={}, {}", node.node_id, e);
        }
    }
}

/// Best-effort node counter publication, same cadence idea as the tunnel
/// side's flush window.
async fn flush_loop(proxy: Arc<StaticProxy>) {
    let mut shutdown = proxy.shutdown_signal();
    let mut tick = tokio::time::interval(Duration::from_secs(10));

    loop {
        tokio::select! {
            _ = tick.tick() => {
                for node in proxy.pool.nodes() {
                    let counts = node.counts.snapshot();
                    let health = node.health().as_str().to_string();
                    let failures = node.failures();
                    let last_check = node.last_check();
                    let status = node.last_check_status();

                    let result = update_with_retry(
                        proxy.repository.static_nodes.as_ref(),
                        &proxy.tenant_id,
                        &node.node_id,
                        "flush",
                        |row| {
                            row.health = health.clone();
                            row.failures = failures;
                            row.current_connections = counts.current_connections;
                            row.total_connections = counts.total_connections;
                            row.received_bytes = counts.received_bytes;
                            row.sent_bytes = counts.sent_bytes;
                            row.last_check_at = (last_check > 0).then_some(last_check);
                            row.last_check_status = status.clone();
                        },
                    );

                    if let Err(e) = result {
                        log::debug!("node counter flush failed: node={}, {}", node.node_id, e);
                    }
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
