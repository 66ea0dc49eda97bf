use std::sync::atomic::{AtomicU64, Ordering};

/// Abstraction over a monotonic-ish counter so snapshots and live atomics
/// can share the bundle type below.
pub trait Number {
    fn add(&self, value: u64);
    fn sub(&self, value: u64);
    fn get(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct Count(AtomicU64);

impl Number for Count {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn sub(&self, value: u64) {
        // Clamped at zero, a close racing a snapshot must not wrap.
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |it| {
                Some(it.saturating_sub(value))
            });
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Count {
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }
}

/// Traffic bookkeeping shared by dynamic services and static nodes.
///
/// # Example
///
/// ```
/// use tunnel_service::counters::{Count, Number, TrafficCounts};
///
/// let counts = TrafficCounts::<Count>::default();
///
/// counts.on_open();
/// assert_eq!(counts.current_connections.get(), 1);
/// assert_eq!(counts.total_connections.get(), 1);
///
/// counts.on_close(100, 50);
/// assert_eq!(counts.current_connections.get(), 0);
/// assert_eq!(counts.received_bytes.get(), 100);
/// assert_eq!(counts.sent_bytes.get(), 50);
/// ```
#[derive(Debug, Default)]
pub struct TrafficCounts<T> {
    pub current_connections: T,
    pub total_connections: T,
    pub received_bytes: T,
    pub sent_bytes: T,
}

impl<T: Number> TrafficCounts<T> {
    /// A connection was accepted and is being serviced.
    pub fn on_open(&self) {
        self.current_connections.add(1);
        self.total_connections.add(1);
    }

    /// The splice for one connection terminated with the given byte
    /// totals.
    pub fn on_close(&self, received_bytes: u64, sent_bytes: u64) {
        self.current_connections.sub(1);
        self.received_bytes.add(received_bytes);
        self.sent_bytes.add(sent_bytes);
    }

    /// Per-field consistent copy for publication. Fields may be a few
    /// updates apart from each other, which accounting accepts.
    pub fn snapshot(&self) -> TrafficCounts<u64> {
        TrafficCounts {
            current_connections: self.current_connections.get(),
            total_connections: self.total_connections.get(),
            received_bytes: self.received_bytes.get(),
            sent_bytes: self.sent_bytes.get(),
        }
    }
}
