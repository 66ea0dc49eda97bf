//! Runtime state of the tunnel broker, kept free of sockets and timers so
//! every table can be exercised directly in tests. The server composes
//! these pieces and drives them from its accept loops and sweepers:
//!
//! * [`session::Sessions`]: live control sessions, indexed by session id
//!   and by client id.
//! * [`services::Services`]: dynamic services registered over those
//!   sessions.
//! * [`pending::PendingRequests`]: public connections waiting to be
//!   paired with a client-dialed data connection.
//! * [`ports::PortAllocator`]: remote-port handout under the
//!   allowed-ports policy.
//! * [`balance::NodePool`]: backend selection for the static proxy.

pub mod balance;
pub mod counters;
pub mod pending;
pub mod ports;
pub mod services;
pub mod session;

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Mints an identifier that is unique for the lifetime of the process.
///
/// # Example
///
/// ```
/// let a = tunnel_service::unique_id("conn");
/// let b = tunnel_service::unique_id("conn");
///
/// assert!(a.starts_with("conn-"));
/// assert_ne!(a, b);
/// ```
pub fn unique_id(prefix: &str) -> String {
    let nonce: u128 = rand::rng().random();
    format!("{}-{:032x}", prefix, nonce)
}

/// Seconds since the unix epoch, the clock all bookkeeping fields share.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|it| it.as_secs())
        .unwrap_or(0)
}
