//! The registry of running broker instances. `Start`, `Stop` and
//! `Reload` land here with at-most-once semantics per server id.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use anyhow::{Result, bail};
use serde_json::{Value, json};
use service::{counters::Number, now_secs};
use tokio::sync::Mutex;

use crate::{
    config::{Broker, Config},
    observer::Observer,
    proxy::{self, StaticProxy},
    repository::{Audit, Repository, ServerRow, ServerStatus, update_with_retry},
    server::{self, TunnelServer},
    statistics::Statistics,
};

struct RunningServer {
    config: Arc<Config>,
    server: Arc<TunnelServer>,
    statics: Vec<Arc<StaticProxy>>,
}

pub struct ServerPool {
    repository: Repository,
    servers: Mutex<AHashMap<String, RunningServer>>,
}

impl ServerPool {
    pub fn new(repository: Repository) -> Self {
        Self {
            repository,
            servers: Default::default(),
        }
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Brings one broker instance up. Rejected when the id is already
    /// running; a control-port bind failure is fatal and marks the
    /// server row `error`.
    pub async fn start(&self, config: Arc<Config>) -> Result<()> {
        let server_id = config.server.server_id.clone();

        let mut servers = self.servers.lock().await;
        if servers.contains_key(&server_id) {
            bail!("server {} is already running", server_id);
        }

        let statistics = Statistics::default();
        let observer = Observer::new(self.repository.clone(), statistics.clone());
        let server = TunnelServer::new(config.clone(), observer, statistics);

        if let Err(e) = server::start(&server).await {
            self.mark_status(&config.server, ServerStatus::Error, None);
            return Err(e);
        }

        let mut statics = Vec::new();
        for static_config in &config.static_servers {
            let result = proxy::start(
                static_config.clone(),
                self.repository.clone(),
                config.server.tenant_id.clone(),
            )
            .await;

            match result {
                Ok(proxy) => statics.push(proxy),
                // Never fatal, the broker runs without this listener.
                Err(e) => {
                    log::error!(
                        "static server failed to start: name={}, {}",
                        static_config.name,
                        e
                    );
                }
            }
        }

        self.mark_status(&config.server, ServerStatus::Running, Some(now_secs()));
        servers.insert(
            server_id,
            RunningServer {
                config,
                server,
                statics,
            },
        );

        Ok(())
    }

    /// Takes one broker instance down: acceptor first, then a drain
    /// window for live splices, then force-close. A no-op when the id is
    /// not running.
    pub async fn stop(&self, server_id: &str) -> Result<()> {
        let Some(running) = self.servers.lock().await.remove(server_id) else {
            return Ok(());
        };

        log::info!("stopping server: server={}", server_id);

        running.server.trigger_shutdown();
        for proxy in &running.statics {
            proxy.stop();
        }

        let deadline =
            Instant::now() + Duration::from_secs(running.config.server.drain_window);
        while Instant::now() < deadline {
            if running.server.statistics.live_splices.get() == 0
                && running.server.sessions.is_empty()
            {
                break;
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        running.server.trigger_force_shutdown();
        running.server.listeners.close_all();

        // Whatever the drain window left behind goes now.
        let leftovers = running.server.pending.take_expired(Duration::ZERO);
        if !leftovers.is_empty() {
            log::warn!(
                "pending requests dropped at stop: server={}, count={}",
                server_id,
                leftovers.len()
            );
        }

        let stragglers = running.server.sessions.drain();
        if !stragglers.is_empty() {
            log::warn!(
                "sessions force closed at stop: server={}, count={}",
                server_id,
                stragglers.len()
            );
        }

        self.mark_status(&running.config.server, ServerStatus::Stopped, None);
        log::info!("server stopped: server={}", server_id);
        Ok(())
    }

    /// Applies a new configuration to a running instance. Static servers
    /// are diffed by name: unchanged ones keep running untouched, so
    /// their live splices never notice the reload.
    pub async fn reload(&self, config: Arc<Config>) -> Result<()> {
        let server_id = config.server.server_id.clone();

        let mut servers = self.servers.lock().await;
        let Some(running) = servers.get_mut(&server_id) else {
            bail!("server {} is not running", server_id);
        };

        if running.config.server != config.server {
            bail!("control-plane settings changed, stop and start the server to apply them");
        }

        let mut kept = Vec::new();
        for proxy in running.statics.drain(..) {
            match config
                .static_servers
                .iter()
                .find(|it| it.name == proxy.config.name)
            {
                Some(fresh) if *fresh == proxy.config => kept.push(proxy),
                Some(_) => {
                    log::info!("static server changed, rebinding: name={}", proxy.config.name);
                    proxy.retire();
                }
                None => {
                    log::info!("static server removed: name={}", proxy.config.name);
                    proxy.retire();
                }
            }
        }

        // Give the retired listeners a beat to release their ports.
        tokio::time::sleep(Duration::from_millis(100)).await;

        for static_config in &config.static_servers {
            if kept.iter().any(|it| it.config.name == static_config.name) {
                continue;
            }

            let result = proxy::start(
                static_config.clone(),
                self.repository.clone(),
                config.server.tenant_id.clone(),
            )
            .await;

            match result {
                Ok(proxy) => kept.push(proxy),
                Err(e) => {
                    log::error!(
                        "static server failed to start: name={}, {}",
                        static_config.name,
                        e
                    );
                }
            }
        }

        running.statics = kept;
        running.config = config;

        log::info!("configuration reloaded: server={}", server_id);
        Ok(())
    }

    /// Terminates one client's session on a running server. Its services
    /// and their listeners go away with it.
    pub async fn kick(&self, server_id: &str, client_id: &str) -> Result<()> {
        let servers = self.servers.lock().await;
        let Some(running) = servers.get(server_id) else {
            bail!("server {} is not running", server_id);
        };

        let Some(session) = running.server.sessions.get_by_client(client_id) else {
            bail!("client {} has no live session", client_id);
        };

        if !running.server.kick_session(&session.session_id) {
            bail!("session {} is already closing", session.session_id);
        }

        Ok(())
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.servers.lock().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                log::warn!("stop failed: server={}, {}", id, e);
            }
        }
    }

    pub async fn ids(&self) -> Vec<String> {
        self.servers.lock().await.keys().cloned().collect()
    }

    /// The read-only state the snapshot surface serves.
    pub async fn server_snapshot(&self, server_id: &str) -> Option<Value> {
        let servers = self.servers.lock().await;
        let running = servers.get(server_id)?;
        let server = &running.server;
        let broker = &running.config.server;

        let sessions: Vec<Value> = server
            .sessions
            .snapshot()
            .iter()
            .map(|session| {
                json!({
                    "sessionId": session.session_id,
                    "clientId": session.client_id,
                    "peerAddress": session.peer_address.to_string(),
                    "startedAt": session.started_unix,
                    "uptimeSecs": session.started_at.elapsed().as_secs(),
                    "heartbeats": session.heartbeats.get(),
                    "lastActivity": session.last_activity(),
                    "services": session.service_count(),
                })
            })
            .collect();

        let services: Vec<Value> = server
            .services
            .snapshot()
            .iter()
            .map(|entry| {
                let counts = entry.counts.snapshot();
                json!({
                    "serviceId": entry.service_id,
                    "serviceName": entry.name,
                    "clientId": entry.client_id,
                    "serviceType": entry.kind.to_string(),
                    "remotePort": entry.remote_port,
                    "localAddress": entry.local_address,
                    "localPort": entry.local_port,
                    "useEncryption": entry.use_encryption,
                    "useCompression": entry.use_compression,
                    "healthCheckType": entry.health_check_type,
                    "healthCheckUrl": entry.health_check_url,
                    "registeredAt": entry.registered_at,
                    "lastActiveAt": entry.last_active(),
                    "currentConnections": counts.current_connections,
                    "totalConnections": counts.total_connections,
                    "receivedBytes": counts.received_bytes,
                    "sentBytes": counts.sent_bytes,
                })
            })
            .collect();

        let statics: Vec<Value> = running
            .statics
            .iter()
            .map(|proxy| {
                let counts = proxy.counts.snapshot();
                let nodes: Vec<Value> = proxy
                    .pool
                    .nodes()
                    .iter()
                    .map(|node| {
                        let counts = node.counts.snapshot();
                        json!({
                            "nodeId": node.node_id,
                            "target": node.target(),
                            "weight": node.weight,
                            "health": node.health().as_str(),
                            "failures": node.failures(),
                            "lastCheckAt": node.last_check(),
                            "lastCheckStatus": node.last_check_status(),
                            "currentConnections": counts.current_connections,
                            "totalConnections": counts.total_connections,
                            "receivedBytes": counts.received_bytes,
                            "sentBytes": counts.sent_bytes,
                        })
                    })
                    .collect();

                json!({
                    "name": proxy.config.name,
                    "listen": proxy.config.listen.to_string(),
                    "transport": proxy.config.transport.to_string(),
                    "currentConnections": counts.current_connections,
                    "totalConnections": counts.total_connections,
                    "availableNodes": proxy.pool.available_len(),
                    "nodes": nodes,
                })
            })
            .collect();

        Some(json!({
            "serverId": broker.server_id,
            "listen": broker.listen.to_string(),
            "sessions": sessions,
            "services": services,
            "pendingRequests": server.pending.len(),
            "portCapacity": broker.allowed_ports.capacity(),
            "portsAllocated": server.ports.lock().len(),
            "counters": {
                "sessionsTotal": server.statistics.sessions_total.get(),
                "authFailures": server.statistics.auth_failures.get(),
                "liveSplices": server.statistics.live_splices.get(),
                "pairedTotal": server.statistics.paired_total.get(),
                "expiredTotal": server.statistics.expired_total.get(),
                "orphanDataConnections": server.statistics.orphan_data_connections.get(),
            },
            "staticServers": statics,
        }))
    }

    /// Seeds or updates the server row with the new status.
    fn mark_status(&self, broker: &Broker, status: ServerStatus, started_at: Option<u64>) {
        let servers = &self.repository.servers;

        if servers.get(&broker.tenant_id, &broker.server_id).is_none() {
            let row = ServerRow {
                tenant_id: broker.tenant_id.clone(),
                server_id: broker.server_id.clone(),
                listen_address: broker.listen.ip().to_string(),
                listen_port: broker.listen.port(),
                dashboard_port: None,
                http_vhost_port: None,
                https_vhost_port: None,
                max_clients: broker.max_clients,
                token_auth: broker.token.is_some(),
                token: broker.token.clone(),
                tls_enabled: broker.ssl.is_some(),
                tls_cert_path: broker.ssl.as_ref().map(|it| it.certificate_chain.clone()),
                tls_key_path: broker.ssl.as_ref().map(|it| it.private_key.clone()),
                heartbeat_interval: broker.heartbeat_interval,
                heartbeat_timeout: broker.heartbeat_timeout,
                allowed_ports: broker
                    .allowed_ports
                    .ranges()
                    .iter()
                    .map(|it| it.to_string())
                    .collect(),
                status,
                started_at,
                audit: Audit::new("startup"),
            };

            if let Err(e) = servers.insert(row) {
                log::warn!("server row insert failed: server={}, {}", broker.server_id, e);
            }

            return;
        }

        let result = update_with_retry(
            servers.as_ref(),
            &broker.tenant_id,
            &broker.server_id,
            "runtime",
            |row| {
                row.status = status;
                row.started_at = started_at;
            },
        );

        if let Err(e) = result {
            log::warn!("server row update failed: server={}, {}", broker.server_id, e);
        }
    }
}
