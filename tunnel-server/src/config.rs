use std::{fs::read_to_string, net::SocketAddr, str::FromStr};

use anyhow::Result;
use clap::Parser;
use codec::message::ServiceKind;
use serde::{Deserialize, Serialize};
use service::{balance::BalancePolicy, ports::PortPolicy};

/// SSL configuration
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Ssl {
    ///
    /// SSL private key file
    ///
    pub private_key: String,
    ///
    /// SSL certificate chain file
    ///
    pub certificate_chain: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Broker {
    ///
    /// server identity
    ///
    /// identifies this broker instance in the repository and in
    /// snapshots. several instances may run in one process, each with its
    /// own id.
    ///
    #[serde(default = "Broker::server_id")]
    pub server_id: String,
    #[serde(default = "Broker::tenant_id")]
    pub tenant_id: String,
    ///
    /// control listen address
    ///
    /// The single public port all client-originated traffic arrives on.
    /// The first frame of every connection decides whether it becomes a
    /// control session or a data connection.
    ///
    #[serde(default = "Broker::listen")]
    pub listen: SocketAddr,
    ///
    /// Maximum number of concurrently authenticated clients. Further
    /// auth attempts are rejected with a failure response.
    ///
    #[serde(default = "Broker::max_clients")]
    pub max_clients: usize,
    ///
    /// Maximum number of services one client may keep registered.
    ///
    #[serde(default = "Broker::max_services_per_client")]
    pub max_services_per_client: usize,
    ///
    /// authentication token
    ///
    /// When set, every client must present this token in its auth frame.
    /// When unset any client id is accepted.
    ///
    #[serde(default)]
    pub token: Option<String>,
    ///
    /// allowed-ports policy
    ///
    /// The port ranges dynamic services may claim as their public remote
    /// port, e.g. ["20000..20100"]. An empty list permits any
    /// non-privileged port on explicit request but disables automatic
    /// assignment.
    ///
    #[serde(default)]
    pub allowed_ports: PortPolicy,
    ///
    /// Expected interval of client heartbeats in seconds.
    ///
    #[serde(default = "Broker::heartbeat_interval")]
    pub heartbeat_interval: u64,
    ///
    /// Grace in seconds before an idle session is terminated.
    ///
    #[serde(default = "Broker::heartbeat_timeout")]
    pub heartbeat_timeout: u64,
    ///
    /// Seconds a public connection may wait for the matching data
    /// connection before the sweeper closes it.
    ///
    #[serde(default = "Broker::pairing_timeout")]
    pub pairing_timeout: u64,
    ///
    /// Seconds to wait for in-flight splices when the server stops.
    ///
    #[serde(default = "Broker::drain_window")]
    pub drain_window: u64,
    #[serde(default = "Broker::control_read_buffer")]
    pub control_read_buffer: usize,
    #[serde(default = "Broker::splice_buffer")]
    pub splice_buffer: usize,
    #[serde(default = "Broker::max_frame_size")]
    pub max_frame_size: usize,
    ///
    /// Seconds between best-effort counter flushes to the repository.
    ///
    #[serde(default = "Broker::flush_window")]
    pub flush_window: u64,
    ///
    /// SSL configuration
    ///
    /// Wraps the control socket in TLS when present. Data connections use
    /// the same wrapping as the control socket.
    ///
    #[serde(default)]
    pub ssl: Option<Ssl>,
}

impl Broker {
    fn server_id() -> String {
        "server-1".to_string()
    }

    fn tenant_id() -> String {
        "default".to_string()
    }

    fn listen() -> SocketAddr {
        "0.0.0.0:7000".parse().unwrap()
    }

    fn max_clients() -> usize {
        128
    }

    fn max_services_per_client() -> usize {
        32
    }

    fn heartbeat_interval() -> u64 {
        30
    }

    fn heartbeat_timeout() -> u64 {
        90
    }

    fn pairing_timeout() -> u64 {
        30
    }

    fn drain_window() -> u64 {
        10
    }

    fn control_read_buffer() -> usize {
        32 * 1024
    }

    fn splice_buffer() -> usize {
        32 * 1024
    }

    fn max_frame_size() -> usize {
        1024 * 1024
    }

    fn flush_window() -> u64 {
        10
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self {
            server_id: Self::server_id(),
            tenant_id: Self::tenant_id(),
            listen: Self::listen(),
            max_clients: Self::max_clients(),
            max_services_per_client: Self::max_services_per_client(),
            token: None,
            allowed_ports: Default::default(),
            heartbeat_interval: Self::heartbeat_interval(),
            heartbeat_timeout: Self::heartbeat_timeout(),
            pairing_timeout: Self::pairing_timeout(),
            drain_window: Self::drain_window(),
            control_read_buffer: Self::control_read_buffer(),
            splice_buffer: Self::splice_buffer(),
            max_frame_size: Self::max_frame_size(),
            flush_window: Self::flush_window(),
            ssl: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct HealthCheck {
    #[serde(default = "HealthCheck::interval")]
    pub interval: u64,
    #[serde(default = "HealthCheck::timeout")]
    pub timeout: u64,
    #[serde(default = "HealthCheck::max_failures")]
    pub max_failures: u64,
    ///
    /// Probe path for http/https pools, relative to each node, e.g.
    /// "/healthz". TCP pools ignore it and probe with a plain connect.
    ///
    #[serde(default)]
    pub url: Option<String>,
}

impl HealthCheck {
    fn interval() -> u64 {
        30
    }

    fn timeout() -> u64 {
        5
    }

    fn max_failures() -> u64 {
        3
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            interval: Self::interval(),
            timeout: Self::timeout(),
            max_failures: Self::max_failures(),
            url: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct StaticNode {
    #[serde(default)]
    pub name: String,
    pub target: String,
    pub port: u16,
    #[serde(default = "StaticNode::weight")]
    pub weight: u32,
    #[serde(default)]
    pub max_connections: u64,
}

impl StaticNode {
    fn weight() -> u32 {
        1
    }
}

///
/// A pre-configured public listener forwarding to a pool of backends,
/// independent of any tunnel client.
///
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct StaticServer {
    pub name: String,
    pub listen: SocketAddr,
    ///
    /// tcp, udp, http or https. http/https only changes how nodes are
    /// probed, the payload passes through untouched either way.
    ///
    #[serde(default = "StaticServer::transport")]
    pub transport: ServiceKind,
    #[serde(default)]
    pub balance: BalancePolicy,
    ///
    /// Cap on concurrently served public connections, 0 is unlimited.
    ///
    #[serde(default)]
    pub max_connections: u64,
    ///
    /// Seconds allowed for one backend dial.
    ///
    #[serde(default = "StaticServer::connection_timeout")]
    pub connection_timeout: u64,
    ///
    /// Further selection attempts after a failed dial.
    ///
    #[serde(default = "StaticServer::retry_count")]
    pub retry_count: u32,
    ///
    /// Seconds between those attempts.
    ///
    #[serde(default = "StaticServer::retry_interval")]
    pub retry_interval: u64,
    #[serde(default)]
    pub health_check: HealthCheck,
    #[serde(default, rename = "node")]
    pub nodes: Vec<StaticNode>,
}

impl StaticServer {
    fn transport() -> ServiceKind {
        ServiceKind::Tcp
    }

    fn connection_timeout() -> u64 {
        5
    }

    fn retry_count() -> u32 {
        2
    }

    fn retry_interval() -> u64 {
        1
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Api {
    ///
    /// snapshot server listen
    ///
    /// This option specifies the http server binding address used to
    /// read broker snapshots.
    ///
    /// Warn: This http server does not contain any means of
    /// authentication, please do not expose it directly to an unsafe
    /// environment.
    ///
    #[serde(default = "Api::listen")]
    pub listen: SocketAddr,
}

impl Api {
    fn listen() -> SocketAddr {
        "127.0.0.1:3000".parse().unwrap()
    }
}

impl Default for Api {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: Broker,
    #[serde(default, rename = "static-server")]
    pub static_servers: Vec<StaticServer>,
    #[serde(default)]
    pub api: Option<Api>,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: tunnel-server --config /etc/tunnel-rs/server.toml
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// Load command line parameters, if the configuration file path is
    /// specified, the configuration is read from the configuration file,
    /// otherwise the default configuration is used.
    ///
    pub fn load() -> Result<Self> {
        Ok(match Cli::parse().config {
            Some(path) => toml::from_str(&read_to_string(&path)?)?,
            None => Self::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_operational_knobs() {
        let config = Config::default();

        assert_eq!(config.server.heartbeat_interval, 30);
        assert_eq!(config.server.heartbeat_timeout, 90);
        assert_eq!(config.server.pairing_timeout, 30);
        assert_eq!(config.server.drain_window, 10);
        assert_eq!(config.server.control_read_buffer, 32 * 1024);
        assert_eq!(config.server.splice_buffer, 32 * 1024);
    }

    #[test]
    fn parses_a_full_file() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:7000"
            token = "T"
            allowed-ports = ["20000..20100", "30000"]
            max-clients = 16

            [[static-server]]
            name = "web"
            listen = "0.0.0.0:9000"
            transport = "http"
            balance = "leastconn"

            [[static-server.node]]
            target = "10.0.0.1"
            port = 8080

            [[static-server.node]]
            target = "10.0.0.2"
            port = 8080
            weight = 2

            [api]
            listen = "127.0.0.1:3000"

            [log]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.token.as_deref(), Some("T"));
        assert!(config.server.allowed_ports.allows(20050));
        assert!(config.server.allowed_ports.allows(30000));
        assert!(!config.server.allowed_ports.allows(19999));

        let web = &config.static_servers[0];
        assert_eq!(web.transport, ServiceKind::Http);
        assert_eq!(web.nodes.len(), 2);
        assert_eq!(web.nodes[1].weight, 2);
        assert_eq!(web.health_check.interval, 30);
        assert!(config.api.is_some());
    }
}
