use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use ahash::AHashMap;
use codec::message::{ServiceKind, ServiceRecord};
use parking_lot::RwLock;

use crate::{
    counters::{Count, Number, TrafficCounts},
    now_secs,
};

/// A dynamic service while its owning session is alive.
#[derive(Debug)]
pub struct ServiceEntry {
    pub service_id: String,
    pub tenant_id: String,
    pub client_id: String,
    pub session_id: String,
    pub name: String,
    pub kind: ServiceKind,
    pub local_address: String,
    pub local_port: u16,
    pub remote_port: u16,
    /// 0 means unlimited.
    pub max_connections: u64,
    pub use_encryption: bool,
    pub use_compression: bool,
    pub health_check_type: Option<String>,
    pub health_check_url: Option<String>,
    pub registered_at: u64,
    last_active: AtomicU64,
    pub counts: TrafficCounts<Count>,
}

impl ServiceEntry {
    pub fn from_record(record: &ServiceRecord, session_id: &str, remote_port: u16) -> Self {
        Self {
            service_id: record.service_id.clone(),
            tenant_id: record.tenant_id.clone(),
            client_id: record.client_id.clone(),
            session_id: session_id.to_string(),
            name: record.service_name.clone(),
            kind: record.service_type,
            local_address: record.local_address.clone(),
            local_port: record.local_port,
            remote_port,
            max_connections: record.max_connections,
            use_encryption: record.use_encryption,
            use_compression: record.use_compression,
            health_check_type: record.health_check_type.clone(),
            health_check_url: record.health_check_url.clone(),
            registered_at: now_secs(),
            last_active: AtomicU64::new(0),
            counts: Default::default(),
        }
    }

    /// Stamped on every successful pairing.
    pub fn touch(&self) {
        self.last_active.store(now_secs(), Ordering::Relaxed);
    }

    pub fn last_active(&self) -> u64 {
        self.last_active.load(Ordering::Relaxed)
    }

    pub fn at_capacity(&self) -> bool {
        self.max_connections > 0 && self.counts.current_connections.get() >= self.max_connections
    }
}

/// Server-wide index of registered dynamic services.
#[derive(Debug, Default)]
pub struct Services(RwLock<AHashMap<String, Arc<ServiceEntry>>>);

impl Services {
    pub fn insert(&self, entry: Arc<ServiceEntry>) {
        self.0.write().insert(entry.service_id.clone(), entry);
    }

    pub fn remove(&self, service_id: &str) -> Option<Arc<ServiceEntry>> {
        self.0.write().remove(service_id)
    }

    pub fn get(&self, service_id: &str) -> Option<Arc<ServiceEntry>> {
        self.0.read().get(service_id).cloned()
    }

    pub fn find_by_name(&self, client_id: &str, name: &str) -> Option<Arc<ServiceEntry>> {
        self.0
            .read()
            .values()
            .find(|it| it.client_id == client_id && it.name == name)
            .cloned()
    }

    pub fn by_session(&self, session_id: &str) -> Vec<Arc<ServiceEntry>> {
        self.0
            .read()
            .values()
            .filter(|it| it.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<ServiceEntry>> {
        self.0.read().values().cloned().collect()
    }
}
