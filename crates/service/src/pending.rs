use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::Mutex;

/// A public-side connection parked until the owning client dials back.
///
/// Generic over the socket type so the table itself stays free of any
/// transport and can be tested with plain values.
#[derive(Debug)]
pub struct PendingRequest<T> {
    pub connection_id: String,
    pub service_id: String,
    pub service_name: String,
    pub client_id: String,
    pub stream: T,
    pub created_at: Instant,
}

impl<T> PendingRequest<T> {
    pub fn new(
        connection_id: String,
        service_id: String,
        service_name: String,
        client_id: String,
        stream: T,
    ) -> Self {
        Self {
            connection_id,
            service_id,
            service_name,
            client_id,
            stream,
            created_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Table pairing server-minted connection ids with client-dialed data
/// connections.
///
/// Inserts refuse duplicate ids since ids must stay unique for the
/// server's lifetime; take is remove-and-return so exactly one caller
/// wins a pairing. The sweeper drains expired entries under the lock and
/// closes their sockets only after releasing it.
///
/// # Example
///
/// ```
/// use tunnel_service::pending::{PendingRequest, PendingRequests};
///
/// let pending: PendingRequests<&str> = PendingRequests::default();
///
/// let entry = PendingRequest::new(
///     "c-1".to_string(),
///     "service-1".to_string(),
///     "ssh".to_string(),
///     "client-1".to_string(),
///     "public socket",
/// );
///
/// assert!(pending.put(entry).is_ok());
/// assert_eq!(pending.len(), 1);
///
/// assert!(pending.take("c-1").is_some());
/// assert!(pending.take("c-1").is_none());
/// ```
#[derive(Debug)]
pub struct PendingRequests<T>(Mutex<AHashMap<String, PendingRequest<T>>>);

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self(Mutex::new(AHashMap::with_capacity(128)))
    }
}

impl<T> PendingRequests<T> {
    /// Rejected entries come back to the caller so it can close the
    /// public socket itself.
    pub fn put(&self, entry: PendingRequest<T>) -> Result<(), PendingRequest<T>> {
        let mut table = self.0.lock();
        if table.contains_key(&entry.connection_id) {
            return Err(entry);
        }

        table.insert(entry.connection_id.clone(), entry);
        Ok(())
    }

    pub fn take(&self, connection_id: &str) -> Option<PendingRequest<T>> {
        self.0.lock().remove(connection_id)
    }

    /// Removes and returns every entry older than `max_age`.
    pub fn take_expired(&self, max_age: Duration) -> Vec<PendingRequest<T>> {
        let mut table = self.0.lock();
        let expired: Vec<String> = table
            .iter()
            .filter(|(_, entry)| entry.age() >= max_age)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| table.remove(&id))
            .collect()
    }

    /// Removes and returns every entry targeting one of the given
    /// services, used when a session closes and takes its services along.
    pub fn take_services(&self, service_ids: &[String]) -> Vec<PendingRequest<T>> {
        let mut table = self.0.lock();
        let matching: Vec<String> = table
            .iter()
            .filter(|(_, entry)| service_ids.contains(&entry.service_id))
            .map(|(id, _)| id.clone())
            .collect();

        matching
            .into_iter()
            .filter_map(|id| table.remove(&id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}
