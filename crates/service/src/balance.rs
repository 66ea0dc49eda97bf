use std::sync::{
    Arc,
    atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering},
};

use parking_lot::Mutex;
use rand::Rng;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    counters::{Count, Number, TrafficCounts},
    now_secs,
};

/// How a static server picks the backend for an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum BalancePolicy {
    #[default]
    #[cfg_attr(feature = "serde", serde(rename = "roundrobin"))]
    RoundRobin,
    #[cfg_attr(feature = "serde", serde(rename = "leastconn"))]
    LeastConn,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    Healthy,
    Unhealthy,
    /// Never probed yet. Treated as selectable so a fresh pool can serve
    /// before the first health-check round completes.
    Unknown,
}

impl NodeHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Healthy,
            1 => Self::Unhealthy,
            _ => Self::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Unhealthy => 1,
            Self::Unknown => 2,
        }
    }
}

/// One backend of a static server.
#[derive(Debug)]
pub struct Node {
    pub node_id: String,
    pub target_address: String,
    pub target_port: u16,
    pub weight: u32,
    /// 0 means unlimited.
    pub max_connections: u64,
    health: AtomicU8,
    consecutive_failures: AtomicU64,
    last_check: AtomicU64,
    last_check_status: Mutex<String>,
    pub counts: TrafficCounts<Count>,
}

impl Node {
    pub fn new(
        node_id: String,
        target_address: String,
        target_port: u16,
        weight: u32,
        max_connections: u64,
    ) -> Self {
        Self {
            node_id,
            target_address,
            target_port,
            weight,
            max_connections,
            health: AtomicU8::new(NodeHealth::Unknown.as_u8()),
            consecutive_failures: AtomicU64::new(0),
            last_check: AtomicU64::new(0),
            last_check_status: Mutex::new(String::new()),
            counts: Default::default(),
        }
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.target_address, self.target_port)
    }

    pub fn health(&self) -> NodeHealth {
        NodeHealth::from_u8(self.health.load(Ordering::Relaxed))
    }

    pub fn failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn last_check(&self) -> u64 {
        self.last_check.load(Ordering::Relaxed)
    }

    pub fn last_check_status(&self) -> String {
        self.last_check_status.lock().clone()
    }

    /// Selectable for new connections: not marked unhealthy and below its
    /// connection cap.
    pub fn available(&self) -> bool {
        if self.health() == NodeHealth::Unhealthy {
            return false;
        }

        self.max_connections == 0 || self.counts.current_connections.get() < self.max_connections
    }

    /// One failed dial or probe. Returns true when this pushed the node
    /// over the threshold and it just became unhealthy.
    pub fn record_failure(&self, max_failures: u64) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= max_failures && self.health() != NodeHealth::Unhealthy {
            self.health
                .store(NodeHealth::Unhealthy.as_u8(), Ordering::Relaxed);
            return true;
        }

        false
    }

    /// A single success brings an unhealthy node back.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.health
            .store(NodeHealth::Healthy.as_u8(), Ordering::Relaxed);
    }

    /// Outcome of one active health probe.
    pub fn mark_checked(&self, healthy: bool, status: &str, max_failures: u64) {
        self.last_check.store(now_secs(), Ordering::Relaxed);
        *self.last_check_status.lock() = status.to_string();

        if healthy {
            self.record_success();
        } else {
            self.record_failure(max_failures);
        }
    }
}

/// The backend pool of one static server.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tunnel_service::balance::{BalancePolicy, Node, NodePool};
///
/// let pool = NodePool::new(
///     BalancePolicy::RoundRobin,
///     vec![
///         Arc::new(Node::new("n1".into(), "10.0.0.1".into(), 80, 1, 0)),
///         Arc::new(Node::new("n2".into(), "10.0.0.2".into(), 80, 1, 0)),
///     ],
/// );
///
/// assert_eq!(pool.select().unwrap().node_id, "n1");
/// assert_eq!(pool.select().unwrap().node_id, "n2");
/// assert_eq!(pool.select().unwrap().node_id, "n1");
/// ```
#[derive(Debug)]
pub struct NodePool {
    policy: BalancePolicy,
    nodes: Vec<Arc<Node>>,
    cursor: AtomicUsize,
}

impl NodePool {
    pub fn new(policy: BalancePolicy, nodes: Vec<Arc<Node>>) -> Self {
        Self {
            policy,
            nodes,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> BalancePolicy {
        self.policy
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn available_len(&self) -> usize {
        self.nodes.iter().filter(|it| it.available()).count()
    }

    /// Picks a backend among the currently selectable nodes, or nothing
    /// when the pool has no selectable node left.
    pub fn select(&self) -> Option<Arc<Node>> {
        let candidates: Vec<&Arc<Node>> =
            self.nodes.iter().filter(|it| it.available()).collect();

        if candidates.is_empty() {
            return None;
        }

        let node = match self.policy {
            BalancePolicy::RoundRobin => {
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates[index]
            }
            BalancePolicy::LeastConn => {
                // min_by_key keeps the first minimum, which is the tie
                // break on the lower index.
                candidates
                    .iter()
                    .min_by_key(|it| it.counts.current_connections.get())
                    .copied()?
            }
            BalancePolicy::Random => candidates[rand::rng().random_range(0..candidates.len())],
        };

        Some(Arc::clone(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(policy: BalancePolicy) -> NodePool {
        NodePool::new(
            policy,
            vec![
                Arc::new(Node::new("n1".into(), "10.0.0.1".into(), 80, 1, 0)),
                Arc::new(Node::new("n2".into(), "10.0.0.2".into(), 80, 1, 0)),
                Arc::new(Node::new("n3".into(), "10.0.0.3".into(), 80, 1, 0)),
            ],
        )
    }

    #[test]
    fn round_robin_skips_unhealthy_nodes() {
        let pool = pool(BalancePolicy::RoundRobin);
        pool.nodes()[1].mark_checked(false, "connection refused", 1);

        let picked: Vec<String> = (0..6)
            .filter_map(|_| pool.select())
            .map(|node| node.node_id.clone())
            .collect();

        assert_eq!(picked, vec!["n1", "n3", "n1", "n3", "n1", "n3"]);
    }

    #[test]
    fn least_conn_prefers_idle_nodes_and_breaks_ties_low() {
        let pool = pool(BalancePolicy::LeastConn);
        pool.nodes()[0].counts.on_open();
        pool.nodes()[0].counts.on_open();
        pool.nodes()[1].counts.on_open();

        assert_eq!(pool.select().unwrap().node_id, "n3");

        pool.nodes()[2].counts.on_open();
        pool.nodes()[2].counts.on_open();

        // n1=2, n2=1, n3=2 now.
        assert_eq!(pool.select().unwrap().node_id, "n2");

        pool.nodes()[1].counts.on_open();
        // Every node holds 2: the lowest index wins the tie.
        assert_eq!(pool.select().unwrap().node_id, "n1");
    }

    #[test]
    fn random_only_picks_available_nodes() {
        let pool = pool(BalancePolicy::Random);
        pool.nodes()[0].mark_checked(false, "timeout", 1);
        pool.nodes()[2].mark_checked(false, "timeout", 1);

        for _ in 0..16 {
            assert_eq!(pool.select().unwrap().node_id, "n2");
        }
    }

    #[test]
    fn empty_healthy_set_rejects_selection() {
        let pool = pool(BalancePolicy::RoundRobin);
        for node in pool.nodes() {
            node.mark_checked(false, "down", 1);
        }

        assert!(pool.select().is_none());
        assert_eq!(pool.available_len(), 0);
    }

    #[test]
    fn failure_threshold_and_recovery() {
        let node = Node::new("n1".into(), "10.0.0.1".into(), 80, 1, 0);
        assert_eq!(node.health(), NodeHealth::Unknown);

        assert!(!node.record_failure(3));
        assert!(!node.record_failure(3));
        assert!(node.record_failure(3));
        assert_eq!(node.health(), NodeHealth::Unhealthy);
        assert_eq!(node.failures(), 3);

        // A repeat failure does not "transition" again.
        assert!(!node.record_failure(3));

        node.record_success();
        assert_eq!(node.health(), NodeHealth::Healthy);
        assert_eq!(node.failures(), 0);
    }

    #[test]
    fn connection_cap_makes_node_unavailable() {
        let node = Node::new("n1".into(), "10.0.0.1".into(), 80, 1, 1);
        assert!(node.available());

        node.counts.on_open();
        assert!(!node.available());

        node.counts.on_close(0, 0);
        assert!(node.available());
    }
}
