use std::{ops::Deref, sync::Arc};

use service::counters::Count;

/// Broker-wide gauges, one bundle per running server instance.
///
/// Per-service and per-node traffic lives on the registry entries
/// themselves; what is counted here is what only the server as a whole
/// can see.
#[derive(Debug, Default)]
pub struct Counters {
    /// Sessions accepted over the lifetime of the server.
    pub sessions_total: Count,
    /// Auth frames rejected for any reason.
    pub auth_failures: Count,
    /// Splices currently shuttling bytes, the drain window waits on this.
    pub live_splices: Count,
    /// Pairings completed.
    pub paired_total: Count,
    /// Pending entries reaped by the sweeper.
    pub expired_total: Count,
    /// Data connections that arrived with an unknown or already swept id.
    pub orphan_data_connections: Count,
}

#[derive(Debug, Default, Clone)]
pub struct Statistics(Arc<Counters>);

impl Deref for Statistics {
    type Target = Counters;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
