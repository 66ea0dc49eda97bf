use std::{collections::HashMap, fs::read_to_string, str::FromStr};

use anyhow::Result;
use clap::Parser;
use codec::message::{ClientRecord, ReconnectPolicy, ServiceKind, ServiceRecord};
use serde::Deserialize;

/// TLS towards the broker. The CA file verifies the broker's
/// certificate; self-hosted deployments point this at their own CA.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Tls {
    pub ca: String,
    ///
    /// Name to verify the broker certificate against. Defaults to the
    /// host part of the server address.
    ///
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Client {
    #[serde(default = "Client::client_id")]
    pub client_id: String,
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub tenant_id: String,
    ///
    /// broker address
    ///
    /// host:port of the tunnel server's control port. Both the control
    /// session and every data connection dial this.
    ///
    #[serde(default = "Client::server")]
    pub server: String,
    #[serde(default)]
    pub token: String,
    ///
    /// Seconds between heartbeats on the control session.
    ///
    #[serde(default = "Client::heartbeat_interval")]
    pub heartbeat_interval: u64,
    #[serde(default = "Client::heartbeat_timeout")]
    pub heartbeat_timeout: u64,
    #[serde(default)]
    pub tls: Option<Tls>,
}

impl Client {
    fn client_id() -> String {
        "client-1".to_string()
    }

    fn server() -> String {
        "127.0.0.1:7000".to_string()
    }

    fn heartbeat_interval() -> u64 {
        30
    }

    fn heartbeat_timeout() -> u64 {
        90
    }

    /// The host part of the server address, for TLS name verification.
    pub fn server_host(&self) -> &str {
        self.server
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.server)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self {
            client_id: Self::client_id(),
            client_name: String::new(),
            tenant_id: String::new(),
            server: Self::server(),
            token: String::new(),
            heartbeat_interval: Self::heartbeat_interval(),
            heartbeat_timeout: Self::heartbeat_timeout(),
            tls: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Reconnect {
    #[serde(default = "Reconnect::enabled")]
    pub enabled: bool,
    #[serde(default = "Reconnect::max_retries")]
    pub max_retries: u32,
    ///
    /// Seconds between attempts.
    ///
    #[serde(default = "Reconnect::retry_interval")]
    pub retry_interval: u64,
}

impl Reconnect {
    fn enabled() -> bool {
        true
    }

    fn max_retries() -> u32 {
        10
    }

    fn retry_interval() -> u64 {
        5
    }
}

impl Default for Reconnect {
    fn default() -> Self {
        Self {
            enabled: Self::enabled(),
            max_retries: Self::max_retries(),
            retry_interval: Self::retry_interval(),
        }
    }
}

///
/// One local service to expose through the broker.
///
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Service {
    pub name: String,
    #[serde(rename = "type", default = "Service::kind")]
    pub kind: ServiceKind,
    #[serde(default = "Service::local_address")]
    pub local_address: String,
    pub local_port: u16,
    ///
    /// Ask the broker for this public port; leave unset to let it pick
    /// one from its allowed ranges.
    ///
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub custom_domains: Vec<String>,
    #[serde(default)]
    pub subdomain: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
    #[serde(default)]
    pub health_check_type: Option<String>,
    #[serde(default)]
    pub health_check_url: Option<String>,
    #[serde(default)]
    pub max_connections: u64,
}

impl Service {
    fn kind() -> ServiceKind {
        ServiceKind::Tcp
    }

    fn local_address() -> String {
        "127.0.0.1".to_string()
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
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

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub client: Client,
    #[serde(default)]
    pub reconnect: Reconnect,
    #[serde(default, rename = "service")]
    pub services: Vec<Service>,
    #[serde(default)]
    pub log: Log,
}

impl Config {
    /// The identity presented in the auth frame. Runtime counters never
    /// travel, so nothing else is needed here.
    pub fn client_record(&self) -> ClientRecord {
        let (host, port) = self
            .client
            .server
            .rsplit_once(':')
            .map(|(host, port)| (host.to_string(), port.parse().unwrap_or(0)))
            .unwrap_or((self.client.server.clone(), 0));

        ClientRecord {
            tenant_id: self.client.tenant_id.clone(),
            client_id: self.client.client_id.clone(),
            client_name: self.client.client_name.clone(),
            server_address: host,
            server_port: port,
            auth_token: self.client.token.clone(),
            use_tls: self.client.tls.is_some(),
            reconnect: ReconnectPolicy {
                enabled: self.reconnect.enabled,
                max_retries: self.reconnect.max_retries,
                retry_interval: self.reconnect.retry_interval,
            },
            heartbeat_interval: self.client.heartbeat_interval,
            heartbeat_timeout: self.client.heartbeat_timeout,
        }
    }

    pub fn service_record(&self, service: &Service) -> ServiceRecord {
        ServiceRecord {
            tenant_id: self.client.tenant_id.clone(),
            service_id: String::new(),
            client_id: self.client.client_id.clone(),
            service_name: service.name.clone(),
            service_type: service.kind,
            local_address: service.local_address.clone(),
            local_port: service.local_port,
            remote_port: service.remote_port,
            custom_domains: service.custom_domains.clone(),
            subdomain: service.subdomain.clone(),
            headers: service.headers.clone(),
            use_encryption: service.use_encryption,
            use_compression: service.use_compression,
            health_check_type: service.health_check_type.clone(),
            health_check_url: service.health_check_url.clone(),
            max_connections: service.max_connections,
        }
    }
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
    /// Example: tunnel-client --config /etc/tunnel-rs/client.toml
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
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
    fn parses_a_client_file() {
        let config: Config = toml::from_str(
            r#"
            [client]
            client-id = "edge-1"
            server = "broker.example.com:7000"
            token = "T"
            heartbeat-interval = 10

            [reconnect]
            max-retries = 3
            retry-interval = 1

            [[service]]
            name = "ssh"
            type = "tcp"
            local-port = 22

            [[service]]
            name = "dns"
            type = "udp"
            local-address = "10.0.0.53"
            local-port = 53
            remote-port = 20053
            "#,
        )
        .unwrap();

        assert_eq!(config.client.server_host(), "broker.example.com");
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services[0].local_address, "127.0.0.1");
        assert_eq!(config.services[1].remote_port, Some(20053));

        let record = config.client_record();
        assert_eq!(record.server_address, "broker.example.com");
        assert_eq!(record.server_port, 7000);
        assert_eq!(record.heartbeat_interval, 10);
        assert!(!record.use_tls);
    }
}
