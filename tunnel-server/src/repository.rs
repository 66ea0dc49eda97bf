//! The persistence seam the core consumes.
//!
//! The relational store lives behind an external collaborator; the core
//! only speaks this interface and ships an in-memory implementation for
//! the binaries and the tests. Every row is tenant scoped and carries the
//! audit envelope with a monotonic version for optimistic concurrency.

use std::sync::Arc;

use ahash::AHashMap;
use codec::message::{ClientRecord, ServiceRecord};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use service::now_secs;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Audit {
    pub creator: String,
    pub editor: String,
    pub created_at: u64,
    pub edited_at: u64,
    pub version: u64,
    pub active: bool,
}

impl Audit {
    pub fn new(actor: &str) -> Self {
        let now = now_secs();

        Self {
            creator: actor.to_string(),
            editor: actor.to_string(),
            created_at: now,
            edited_at: now,
            version: 1,
            active: true,
        }
    }

    pub fn edited(&mut self, editor: &str) {
        self.editor = editor.to_string();
        self.edited_at = now_secs();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Running,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Configuration row of one broker instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRow {
    pub tenant_id: String,
    pub server_id: String,
    pub listen_address: String,
    pub listen_port: u16,
    #[serde(default)]
    pub dashboard_port: Option<u16>,
    #[serde(default)]
    pub http_vhost_port: Option<u16>,
    #[serde(default)]
    pub https_vhost_port: Option<u16>,
    pub max_clients: usize,
    pub token_auth: bool,
    #[serde(default)]
    pub token: Option<String>,
    pub tls_enabled: bool,
    #[serde(default)]
    pub tls_cert_path: Option<String>,
    #[serde(default)]
    pub tls_key_path: Option<String>,
    pub heartbeat_interval: u64,
    pub heartbeat_timeout: u64,
    pub allowed_ports: Vec<String>,
    pub status: ServerStatus,
    #[serde(default)]
    pub started_at: Option<u64>,
    #[serde(flatten)]
    pub audit: Audit,
}

/// A tunnel client identity plus its aggregate runtime counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRow {
    #[serde(flatten)]
    pub record: ClientRecord,
    pub status: ConnectionStatus,
    #[serde(default)]
    pub last_connected_at: Option<u64>,
    #[serde(default)]
    pub last_disconnected_at: Option<u64>,
    #[serde(default)]
    pub connected_secs: u64,
    #[serde(default)]
    pub reconnects: u64,
    #[serde(default)]
    pub service_count: u64,
    #[serde(default)]
    pub last_heartbeat_at: Option<u64>,
    #[serde(flatten)]
    pub audit: Audit,
}

impl ClientRow {
    pub fn new(record: ClientRecord, actor: &str) -> Self {
        Self {
            record,
            status: ConnectionStatus::Disconnected,
            last_connected_at: None,
            last_disconnected_at: None,
            connected_secs: 0,
            reconnects: 0,
            service_count: 0,
            last_heartbeat_at: None,
            audit: Audit::new(actor),
        }
    }
}

/// A dynamic service row plus its flushed counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRow {
    #[serde(flatten)]
    pub record: ServiceRecord,
    #[serde(default)]
    pub registered_at: Option<u64>,
    #[serde(default)]
    pub last_active_at: Option<u64>,
    #[serde(default)]
    pub current_connections: u64,
    #[serde(default)]
    pub total_connections: u64,
    #[serde(default)]
    pub received_bytes: u64,
    #[serde(default)]
    pub sent_bytes: u64,
    #[serde(flatten)]
    pub audit: Audit,
}

impl ServiceRow {
    pub fn new(record: ServiceRecord, actor: &str) -> Self {
        Self {
            record,
            registered_at: Some(now_secs()),
            last_active_at: None,
            current_connections: 0,
            total_connections: 0,
            received_bytes: 0,
            sent_bytes: 0,
            audit: Audit::new(actor),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticServerRow {
    pub tenant_id: String,
    pub static_server_id: String,
    pub name: String,
    pub listen_address: String,
    pub listen_port: u16,
    pub transport: String,
    pub balance: String,
    pub max_connections: u64,
    #[serde(flatten)]
    pub audit: Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticNodeRow {
    pub tenant_id: String,
    pub node_id: String,
    pub static_server_id: String,
    pub target_address: String,
    pub target_port: u16,
    pub weight: u32,
    pub max_connections: u64,
    pub health: String,
    #[serde(default)]
    pub failures: u64,
    #[serde(default)]
    pub current_connections: u64,
    #[serde(default)]
    pub total_connections: u64,
    #[serde(default)]
    pub received_bytes: u64,
    #[serde(default)]
    pub sent_bytes: u64,
    #[serde(default)]
    pub last_check_at: Option<u64>,
    #[serde(default)]
    pub last_check_status: String,
    #[serde(flatten)]
    pub audit: Audit,
}

/// Anything the repository can hold.
pub trait Entity: Clone + Send + Sync + 'static {
    fn tenant_id(&self) -> &str;
    fn entity_id(&self) -> &str;
    fn audit(&self) -> &Audit;
    fn audit_mut(&mut self) -> &mut Audit;
}

macro_rules! entity {
    ($kind:ty, $tenant:expr, $id:expr) => {
        impl Entity for $kind {
            fn tenant_id(&self) -> &str {
                (($tenant) as fn(&$kind) -> &str)(self)
            }

            fn entity_id(&self) -> &str {
                (($id) as fn(&$kind) -> &str)(self)
            }

            fn audit(&self) -> &Audit {
                &self.audit
            }

            fn audit_mut(&mut self) -> &mut Audit {
                &mut self.audit
            }
        }
    };
}

entity!(ServerRow, |it: &ServerRow| &it.tenant_id, |it: &ServerRow| &it.server_id);
entity!(
    ClientRow,
    |it: &ClientRow| &it.record.tenant_id,
    |it: &ClientRow| &it.record.client_id
);
entity!(
    ServiceRow,
    |it: &ServiceRow| &it.record.tenant_id,
    |it: &ServiceRow| &it.record.service_id
);
entity!(
    StaticServerRow,
    |it: &StaticServerRow| &it.tenant_id,
    |it: &StaticServerRow| &it.static_server_id
);
entity!(
    StaticNodeRow,
    |it: &StaticNodeRow| &it.tenant_id,
    |it: &StaticNodeRow| &it.node_id
);

#[derive(Debug, PartialEq, Eq)]
pub enum RepositoryError {
    NotFound,
    Duplicate,
    /// The row moved underneath the writer. Callers retry once and then
    /// surface the failure.
    VersionConflict { expected: u64, found: u64 },
}

impl std::error::Error for RepositoryError {}

impl std::fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "row not found"),
            Self::Duplicate => write!(f, "row already exists"),
            Self::VersionConflict { expected, found } => {
                write!(f, "version conflict: expected {}, found {}", expected, found)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListFilter {
    pub active_only: bool,
    pub offset: usize,
    pub limit: usize,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            active_only: true,
            offset: 0,
            limit: 100,
        }
    }
}

/// One entity kind's operations. `update` is compare-and-swap on the
/// version the caller read; the store bumps it on success.
pub trait Table<T: Entity>: Send + Sync {
    fn insert(&self, row: T) -> Result<(), RepositoryError>;
    fn update(&self, row: T) -> Result<(), RepositoryError>;
    fn soft_delete(&self, tenant_id: &str, entity_id: &str, editor: &str)
    -> Result<(), RepositoryError>;
    fn get(&self, tenant_id: &str, entity_id: &str) -> Option<T>;
    fn list(&self, tenant_id: &str, filter: &ListFilter) -> Vec<T>;
}

pub struct MemoryTable<T>(RwLock<AHashMap<(String, String), T>>);

impl<T> Default for MemoryTable<T> {
    fn default() -> Self {
        Self(Default::default())
    }
}

impl<T: Entity> Table<T> for MemoryTable<T> {
    fn insert(&self, row: T) -> Result<(), RepositoryError> {
        let key = (row.tenant_id().to_string(), row.entity_id().to_string());

        let mut table = self.0.write();
        if table.contains_key(&key) {
            return Err(RepositoryError::Duplicate);
        }

        table.insert(key, row);
        Ok(())
    }

    fn update(&self, mut row: T) -> Result<(), RepositoryError> {
        let key = (row.tenant_id().to_string(), row.entity_id().to_string());

        let mut table = self.0.write();
        let current = table.get(&key).ok_or(RepositoryError::NotFound)?;

        let expected = row.audit().version;
        let found = current.audit().version;
        if expected != found {
            return Err(RepositoryError::VersionConflict { expected, found });
        }

        row.audit_mut().version += 1;
        table.insert(key, row);
        Ok(())
    }

    fn soft_delete(
        &self,
        tenant_id: &str,
        entity_id: &str,
        editor: &str,
    ) -> Result<(), RepositoryError> {
        let mut table = self.0.write();
        let row = table
            .get_mut(&(tenant_id.to_string(), entity_id.to_string()))
            .ok_or(RepositoryError::NotFound)?;

        let audit = row.audit_mut();
        audit.active = false;
        audit.edited(editor);
        audit.version += 1;
        Ok(())
    }

    fn get(&self, tenant_id: &str, entity_id: &str) -> Option<T> {
        self.0
            .read()
            .get(&(tenant_id.to_string(), entity_id.to_string()))
            .cloned()
    }

    fn list(&self, tenant_id: &str, filter: &ListFilter) -> Vec<T> {
        let table = self.0.read();
        let mut rows: Vec<&T> = table
            .iter()
            .filter(|((tenant, _), row)| {
                tenant == tenant_id && (!filter.active_only || row.audit().active)
            })
            .map(|(_, row)| row)
            .collect();

        // A relational store would order by primary key; do the same so
        // pagination is stable.
        rows.sort_by(|a, b| a.entity_id().cmp(b.entity_id()));
        rows.into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .cloned()
            .collect()
    }
}

/// The full persistence surface handed to the core.
#[derive(Clone)]
pub struct Repository {
    pub servers: Arc<dyn Table<ServerRow>>,
    pub clients: Arc<dyn Table<ClientRow>>,
    pub services: Arc<dyn Table<ServiceRow>>,
    pub static_servers: Arc<dyn Table<StaticServerRow>>,
    pub static_nodes: Arc<dyn Table<StaticNodeRow>>,
}

impl Repository {
    pub fn in_memory() -> Self {
        Self {
            servers: Arc::new(MemoryTable::default()),
            clients: Arc::new(MemoryTable::default()),
            services: Arc::new(MemoryTable::default()),
            static_servers: Arc::new(MemoryTable::default()),
            static_nodes: Arc::new(MemoryTable::default()),
        }
    }
}

/// Read-mutate-write with one retry on a version conflict.
pub fn update_with_retry<T, F>(
    table: &dyn Table<T>,
    tenant_id: &str,
    entity_id: &str,
    editor: &str,
    mutate: F,
) -> Result<(), RepositoryError>
where
    T: Entity,
    F: Fn(&mut T),
{
    let mut attempts = 0;
    loop {
        let mut row = table.get(tenant_id, entity_id).ok_or(RepositoryError::NotFound)?;
        mutate(&mut row);
        row.audit_mut().edited(editor);

        match table.update(row) {
            Err(RepositoryError::VersionConflict { .. }) if attempts == 0 => {
                attempts += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_row(client_id: &str) -> ClientRow {
        ClientRow::new(
            ClientRecord {
                tenant_id: "tenant-1".to_string(),
                client_id: client_id.to_string(),
                client_name: String::new(),
                server_address: "127.0.0.1".to_string(),
                server_port: 7000,
                auth_token: String::new(),
                use_tls: false,
                reconnect: Default::default(),
                heartbeat_interval: 30,
                heartbeat_timeout: 90,
            },
            "test",
        )
    }

    #[test]
    fn insert_rejects_duplicates() {
        let table = MemoryTable::default();
        table.insert(client_row("client-1")).unwrap();

        assert_eq!(
            table.insert(client_row("client-1")),
            Err(RepositoryError::Duplicate)
        );
    }

    #[test]
    fn update_is_compare_and_swap() {
        let table = MemoryTable::default();
        table.insert(client_row("client-1")).unwrap();

        let stale = table.get("tenant-1", "client-1").unwrap();

        let mut fresh = stale.clone();
        fresh.reconnects = 1;
        table.update(fresh).unwrap();

        // Writing through the stale copy must conflict.
        let mut conflicting = stale;
        conflicting.reconnects = 9;
        assert!(matches!(
            table.update(conflicting),
            Err(RepositoryError::VersionConflict { .. })
        ));
    }

    #[test]
    fn retry_once_recovers_from_one_conflict() {
        let table = MemoryTable::default();
        table.insert(client_row("client-1")).unwrap();

        update_with_retry(&table, "tenant-1", "client-1", "flush", |row| {
            row.reconnects += 1;
        })
        .unwrap();

        let row = table.get("tenant-1", "client-1").unwrap();
        assert_eq!(row.reconnects, 1);
        assert_eq!(row.audit.version, 2);
        assert_eq!(row.audit.editor, "flush");
    }

    #[test]
    fn soft_delete_hides_rows_from_active_listings() {
        let table = MemoryTable::default();
        table.insert(client_row("client-1")).unwrap();
        table.insert(client_row("client-2")).unwrap();

        table.soft_delete("tenant-1", "client-1", "admin").unwrap();

        let active = table.list("tenant-1", &ListFilter::default());
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].record.client_id, "client-2");

        let all = table.list(
            "tenant-1",
            &ListFilter {
                active_only: false,
                ..Default::default()
            },
        );
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn listing_is_tenant_scoped_and_paginated() {
        let table = MemoryTable::default();
        for index in 0..5 {
            table.insert(client_row(&format!("client-{}", index))).unwrap();
        }

        let mut other = client_row("client-9");
        other.record.tenant_id = "tenant-2".to_string();
        table.insert(other).unwrap();

        let page = table.list(
            "tenant-1",
            &ListFilter {
                offset: 2,
                limit: 2,
                ..Default::default()
            },
        );

        assert_eq!(page.len(), 2);
        assert_eq!(page[0].record.client_id, "client-2");
        assert_eq!(page[1].record.client_id, "client-3");
    }
}
