use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Stable error codes carried in failure responses and error frames.
pub mod codes {
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const DUPLICATE_AUTH: &str = "DUPLICATE_AUTH";
    pub const CLIENT_LIMIT: &str = "CLIENT_LIMIT";
    pub const CLIENT_BUSY: &str = "CLIENT_BUSY";
    pub const SERVICE_LIMIT: &str = "SERVICE_LIMIT";
    pub const NAME_IN_USE: &str = "NAME_IN_USE";
    pub const PORT_IN_USE: &str = "PORT_IN_USE";
    pub const PORT_NOT_ALLOWED: &str = "PORT_NOT_ALLOWED";
    pub const UNKNOWN_SERVICE: &str = "UNKNOWN_SERVICE";
    pub const UNKNOWN_CONNECTION: &str = "UNKNOWN_CONNECTION";
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    pub const PERSISTENCE_FAILED: &str = "PERSISTENCE_FAILED";
    pub const SERVER_STOPPING: &str = "SERVER_STOPPING";
}

/// Milliseconds since the unix epoch, the `timestamp` of every emitted
/// frame.
pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|it| it.as_millis() as u64)
        .unwrap_or(0)
}

/// One frame on the control channel.
///
/// The payload is flattened into the object next to the envelope fields,
/// producing the external shape `{type, sessionId, data, timestamp}`.
/// `sessionId` correlates a request with its response; the server assigns
/// it during authentication and the client echoes it afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    #[serde(flatten)]
    pub payload: Payload,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub timestamp: u64,
}

impl ControlMessage {
    /// A frame outside any established session, `sessionId` is empty.
    pub fn new(payload: Payload) -> Self {
        Self::with_session(String::new(), payload)
    }

    pub fn with_session(session_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            payload,
            session_id: session_id.into(),
            timestamp: unix_ms(),
        }
    }
}

/// Control messages, tagged by the wire `type` with the body under `data`.
///
/// Frames the server issues deserialize strictly so a client notices a
/// contract drift at once; frames the server accepts stay lenient so newer
/// clients may attach fields an older server simply ignores.
///
/// An unrecognised `type` lands on [`Payload::Unknown`]. Receivers log and
/// discard it, only an unparseable frame fails the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Auth(ClientRecord),
    Heartbeat(Heartbeat),
    RegisterService(ServiceRecord),
    UnregisterService(UnregisterService),
    Response(Response),
    ProxyRequest(ProxyRequest),
    Notification(Notification),
    Error(ErrorInfo),
    DataConnection(DataConnection),
    #[serde(other)]
    Unknown,
}

/// The persisted identity a client presents in its `auth` frame. Runtime
/// counters never travel on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    #[serde(default)]
    pub tenant_id: String,
    pub client_id: String,
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub server_address: String,
    #[serde(default)]
    pub server_port: u16,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: u64,
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_heartbeat_timeout() -> u64 {
    90
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    /// Seconds between attempts.
    pub retry_interval: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 10,
            retry_interval: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub client_id: String,
    #[serde(default)]
    pub timestamp: u64,
}

/// What a dynamic service can carry over the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Tcp,
    Udp,
    Http,
    Https,
    Stcp,
    Sudp,
    Xtcp,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Http => "http",
            Self::Https => "https",
            Self::Stcp => "stcp",
            Self::Sudp => "sudp",
            Self::Xtcp => "xtcp",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A service a client asks the broker to expose, sent whole in
/// `register_service`.
///
/// `serviceId` may be left empty; the broker assigns one and returns it in
/// the registration response together with the chosen `remotePort`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub client_id: String,
    pub service_name: String,
    pub service_type: ServiceKind,
    pub local_address: String,
    pub local_port: u16,
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub custom_domains: Vec<String>,
    #[serde(default)]
    pub subdomain: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Advertised to the peer only, the spliced byte stream is never
    /// transformed.
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
    #[serde(default)]
    pub health_check_type: Option<String>,
    #[serde(default)]
    pub health_check_url: Option<String>,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_connections: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterService {
    #[serde(default)]
    pub service_id: String,
    pub service_name: String,
}

/// Server reply to any client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Response {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
}

impl Response {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            code: None,
            client_id: None,
            session_id: None,
            service_id: None,
            remote_port: None,
        }
    }

    pub fn failure(code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            code: Some(code.to_string()),
            client_id: None,
            session_id: None,
            service_id: None,
            remote_port: None,
        }
    }
}

/// Pushed by the server when a public connection arrived on a service
/// listener and waits to be paired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProxyRequest {
    pub connection_id: String,
    pub service_id: String,
    pub service_name: String,
    pub remote_address: String,
    pub remote_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Notification {
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub timestamp: u64,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
            timestamp: unix_ms(),
        }
    }
}

/// The first and only frame on a client-dialed data socket. Everything
/// after it is opaque bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataConnection {
    pub connection_id: String,
    pub client_id: String,
    #[serde(default)]
    pub service_id: Option<String>,
}
