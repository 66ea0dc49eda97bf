use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::now_secs;

/// A counter that only ever stacks, used for heartbeats.
///
/// ```
/// use tunnel_service::session::Timer;
///
/// let timer = Timer::default();
///
/// assert_eq!(timer.get(), 0);
/// assert_eq!(timer.add(), 1);
/// assert_eq!(timer.get(), 1);
/// ```
#[derive(Debug, Default)]
pub struct Timer(AtomicU64);

impl Timer {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn add(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// One live control session.
///
/// Created once authentication succeeded, dropped when the peer closes,
/// the read loop fails, the heartbeat grace expires, or the session is
/// kicked. The session tracks only the ids of its services; the full
/// entries live in the server-wide [`crate::services::Services`] index.
#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    pub client_id: String,
    pub tenant_id: String,
    pub peer_address: SocketAddr,
    pub started_at: Instant,
    pub started_unix: u64,
    last_activity: AtomicU64,
    pub heartbeats: Timer,
    services: RwLock<AHashMap<String, String>>,
}

impl Session {
    pub fn new(
        session_id: String,
        client_id: String,
        tenant_id: String,
        peer_address: SocketAddr,
    ) -> Self {
        Self {
            session_id,
            client_id,
            tenant_id,
            peer_address,
            started_at: Instant::now(),
            started_unix: now_secs(),
            last_activity: AtomicU64::new(now_secs()),
            heartbeats: Timer::default(),
            services: Default::default(),
        }
    }

    /// Any frame from the peer counts as activity.
    pub fn touch(&self) {
        self.last_activity.store(now_secs(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Seconds since the last frame arrived.
    pub fn idle_secs(&self) -> u64 {
        now_secs().saturating_sub(self.last_activity())
    }

    pub fn track_service(&self, service_id: &str, name: &str) {
        self.services
            .write()
            .insert(service_id.to_string(), name.to_string());
    }

    pub fn forget_service(&self, service_id: &str) -> bool {
        self.services.write().remove(service_id).is_some()
    }

    pub fn service_ids(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }

    pub fn service_count(&self) -> usize {
        self.services.read().len()
    }

    pub fn service_name_in_use(&self, name: &str) -> bool {
        self.services.read().values().any(|it| it == name)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SessionError {
    /// The client already holds a live session.
    ClientBusy(String),
}

impl std::error::Error for SessionError {}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClientBusy(client_id) => {
                write!(f, "client {} already has a session", client_id)
            }
        }
    }
}

/// Session registry with two views that always agree: by session id and
/// by client id. Every mutation takes both locks, session map first.
#[derive(Debug, Default)]
pub struct Sessions {
    by_session: RwLock<AHashMap<String, Arc<Session>>>,
    by_client: RwLock<AHashMap<String, String>>,
}

impl Sessions {
    pub fn insert(&self, session: Arc<Session>) -> Result<(), SessionError> {
        let mut by_session = self.by_session.write();
        let mut by_client = self.by_client.write();

        if by_client.contains_key(&session.client_id) {
            return Err(SessionError::ClientBusy(session.client_id.clone()));
        }

        by_client.insert(session.client_id.clone(), session.session_id.clone());
        by_session.insert(session.session_id.clone(), session);
        Ok(())
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let mut by_session = self.by_session.write();
        let mut by_client = self.by_client.write();

        let session = by_session.remove(session_id)?;
        if by_client.get(&session.client_id) == Some(&session.session_id) {
            by_client.remove(&session.client_id);
        }

        Some(session)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.by_session.read().get(session_id).cloned()
    }

    pub fn get_by_client(&self, client_id: &str) -> Option<Arc<Session>> {
        let session_id = self.by_client.read().get(client_id).cloned()?;
        self.get(&session_id)
    }

    pub fn len(&self) -> usize {
        self.by_session.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_session.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.by_session.read().values().cloned().collect()
    }

    /// Empties the registry and returns what was in it, used by server
    /// shutdown to tear every session down.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        let mut by_session = self.by_session.write();
        let mut by_client = self.by_client.write();

        by_client.clear();
        by_session.drain().map(|(_, session)| session).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(session_id: &str, client_id: &str) -> Arc<Session> {
        Arc::new(Session::new(
            session_id.to_string(),
            client_id.to_string(),
            "tenant-1".to_string(),
            "127.0.0.1:50000".parse().unwrap(),
        ))
    }

    #[test]
    fn views_agree() {
        let sessions = Sessions::default();
        sessions.insert(session("s-1", "client-1")).unwrap();
        sessions.insert(session("s-2", "client-2")).unwrap();

        assert_eq!(sessions.len(), 2);
        assert_eq!(
            sessions.get_by_client("client-1").unwrap().session_id,
            "s-1"
        );

        let removed = sessions.remove("s-1").unwrap();
        assert_eq!(removed.client_id, "client-1");
        assert!(sessions.get("s-1").is_none());
        assert!(sessions.get_by_client("client-1").is_none());
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn one_session_per_client() {
        let sessions = Sessions::default();
        sessions.insert(session("s-1", "client-1")).unwrap();

        assert_eq!(
            sessions.insert(session("s-2", "client-1")),
            Err(SessionError::ClientBusy("client-1".to_string()))
        );

        // The losing session must not have disturbed either view.
        assert!(sessions.get("s-2").is_none());
        assert_eq!(
            sessions.get_by_client("client-1").unwrap().session_id,
            "s-1"
        );
    }

    #[test]
    fn tracks_service_names() {
        let session = session("s-1", "client-1");
        session.track_service("service-1", "ssh");

        assert!(session.service_name_in_use("ssh"));
        assert!(!session.service_name_in_use("web"));
        assert_eq!(session.service_count(), 1);

        assert!(session.forget_service("service-1"));
        assert!(!session.forget_service("service-1"));
        assert_eq!(session.service_count(), 0);
    }

    #[test]
    fn drain_empties_both_views() {
        let sessions = Sessions::default();
        sessions.insert(session("s-1", "client-1")).unwrap();
        sessions.insert(session("s-2", "client-2")).unwrap();

        let drained = sessions.drain();
        assert_eq!(drained.len(), 2);
        assert!(sessions.is_empty());
        assert!(sessions.get_by_client("client-1").is_none());
    }
}
