use codec::message::{ClientRecord, ServiceRecord};
use service::{
    counters::Number,
    now_secs,
    services::ServiceEntry,
    session::Session,
};

use crate::{
    repository::{
        ClientRow, ConnectionStatus, Repository, RepositoryError, ServiceRow, update_with_retry,
    },
    statistics::Statistics,
};

/// Where session and service lifecycle events land.
///
/// Everything here is driven from the hot paths of the server, so the
/// rule is: log, bump in-memory counters, and only touch the repository
/// for structural changes. Counter flushing happens on the flush window,
/// not here.
#[derive(Clone)]
pub struct Observer {
    repository: Repository,
    statistics: Statistics,
}

impl Observer {
    pub fn new(repository: Repository, statistics: Statistics) -> Self {
        Self {
            repository,
            statistics,
        }
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// A client authenticated and its session is established. The client
    /// row is created on first contact.
    pub fn connected(&self, session: &Session, record: &ClientRecord) {
        log::info!(
            "session established: session={}, client={}, peer={}",
            session.session_id,
            session.client_id,
            session.peer_address
        );

        self.statistics.sessions_total.add(1);

        let clients = self.repository.clients.clone();
        if clients.get(&session.tenant_id, &session.client_id).is_none() {
            let row = ClientRow::new(record.clone(), &session.client_id);
            if let Err(e) = clients.insert(row) {
                log::warn!("client row insert failed: {}", e);
            }
        }

        let result = update_with_retry(
            clients.as_ref(),
            &session.tenant_id,
            &session.client_id,
            &session.client_id,
            |row| {
                row.status = ConnectionStatus::Connected;
                row.last_connected_at = Some(now_secs());
                row.reconnects += 1;
            },
        );

        if let Err(e) = result {
            log::warn!(
                "client row update failed: client={}, {}",
                session.client_id,
                e
            );
        }
    }

    pub fn authentication_failed(&self, client_id: &str, peer: std::net::SocketAddr, reason: &str) {
        log::warn!(
            "authentication failed: client={}, peer={}, reason={}",
            client_id,
            peer,
            reason
        );

        self.statistics.auth_failures.add(1);
    }

    /// A service registration was accepted and its listener is up. The
    /// repository write is structural: when it fails the registration is
    /// rolled back by the caller. The record passed here is the completed
    /// one, with the assigned id and remote port filled in.
    pub fn registered(&self, record: &ServiceRecord) -> Result<(), RepositoryError> {
        log::info!(
            "service registered: service={}, name={}, client={}, remote-port={:?}",
            record.service_id,
            record.service_name,
            record.client_id,
            record.remote_port
        );

        let row = ServiceRow::new(record.clone(), &record.client_id);
        self.repository.services.insert(row)
    }

    pub fn unregistered(&self, service: &ServiceEntry, reason: &str) {
        log::info!(
            "service unregistered: service={}, name={}, remote-port={}, reason={}",
            service.service_id,
            service.name,
            service.remote_port,
            reason
        );

        let result = self.repository.services.soft_delete(
            &service.tenant_id,
            &service.service_id,
            &service.client_id,
        );

        if let Err(e) = result {
            log::warn!("service row delete failed: service={}, {}", service.service_id, e);
        }
    }

    pub fn paired(&self, service: &ServiceEntry, connection_id: &str) {
        log::debug!(
            "pairing complete: connection={}, service={}, name={}",
            connection_id,
            service.service_id,
            service.name
        );

        self.statistics.paired_total.add(1);
    }

    pub fn pairing_expired(&self, connection_id: &str, service_id: &str) {
        log::warn!(
            "pending request expired: connection={}, service={}",
            connection_id,
            service_id
        );

        self.statistics.expired_total.add(1);
    }

    /// The session reached CLOSED, its listeners are gone and its
    /// services dropped from the registry.
    pub fn disconnected(&self, session: &Session, reason: &str) {
        log::info!(
            "session closed: session={}, client={}, reason={}",
            session.session_id,
            session.client_id,
            reason
        );

        let result = update_with_retry(
            self.repository.clients.as_ref(),
            &session.tenant_id,
            &session.client_id,
            &session.client_id,
            |row| {
                row.status = ConnectionStatus::Disconnected;
                row.last_disconnected_at = Some(now_secs());
                row.connected_secs += session.started_at.elapsed().as_secs();
                row.service_count = 0;
            },
        );

        if let Err(e) = result {
            log::warn!(
                "client row update failed: client={}, {}",
                session.client_id,
                e
            );
        }
    }
}
