pub mod config;
pub mod connector;
pub mod tls;
pub mod worker;

pub use connector::{ClientState, Connector};
