use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

/// Envelope types shared by the orchestrator and every node.
///
/// Every message carries the protocol tag `yamlrpc: "1.0"` and a correlation
/// `id` chosen by the caller. The three shapes are told apart by their
/// payload key: `method` (request), `result` or `error`.
///
/// ```ignore
/// use node_protocol::envelope::{Message, Method};
///
/// let msg = Message::request("req-1-1", Method::Health, None);
/// assert_eq!(msg.id(), Some("req-1-1"));
/// ```
pub const PROTOCOL_NAME: &str = "yamlrpc";
pub const PROTOCOL_VERSION: &str = "1.0";

fn default_version() -> String {
    PROTOCOL_VERSION.to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "yamlrpc", default = "default_version")]
    pub version: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Payload of a successful call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultBody {
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(rename = "yamlrpc", default = "default_version")]
    pub version: String,
    pub result: ResultBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(rename = "yamlrpc", default = "default_version")]
    pub version: String,
    pub error: ErrorObject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Lets callers decode a frame without inspecting its shape first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Result(ResultMessage),
    Error(ErrorMessage),
}

impl Message {
    pub fn request(id: impl Into<String>, method: Method, params: Option<Value>) -> Self {
        Message::Request(Request {
            version: default_version(),
            method: method.to_string(),
            params,
            id: Some(id.into()),
        })
    }

    pub fn result(id: Option<String>, output: Value, metadata: Value) -> Self {
        Message::Result(ResultMessage {
            version: default_version(),
            result: ResultBody { output, metadata },
            id,
        })
    }

    pub fn error(id: Option<String>, code: ErrorCode, message: impl Into<String>, data: Option<Value>) -> Self {
        Self::error_with_code(id, code.code(), message, data)
    }

    pub fn error_with_code(id: Option<String>, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Message::Error(ErrorMessage {
            version: default_version(),
            error: ErrorObject {
                code,
                message: message.into(),
                data,
            },
            id,
        })
    }

    /// Correlation id, `None` when absent or empty.
    pub fn id(&self) -> Option<&str> {
        let id = match self {
            Message::Request(r) => r.id.as_deref(),
            Message::Result(r) => r.id.as_deref(),
            Message::Error(e) => e.id.as_deref(),
        };
        id.filter(|s| !s.is_empty())
    }

    pub fn version(&self) -> &str {
        match self {
            Message::Request(r) => &r.version,
            Message::Result(r) => &r.version,
            Message::Error(e) => &e.version,
        }
    }

    pub fn is_response(&self) -> bool {
        !matches!(self, Message::Request(_))
    }
}

/// Error taxonomy: a transport band borrowed from JSON-RPC and a node band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    NodeInitError,
    NodeConfigError,
    NodeValidationError,
    NodeExecutionTimeout,
    NodeResourceLimit,
    NodeInternalError,
}

impl ErrorCode {
    pub const fn code(self) -> i64 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::NodeInitError => -1000,
            ErrorCode::NodeConfigError => -1001,
            ErrorCode::NodeValidationError => -1002,
            ErrorCode::NodeExecutionTimeout => -1003,
            ErrorCode::NodeResourceLimit => -1004,
            ErrorCode::NodeInternalError => -1005,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        let found = match code {
            -32700 => ErrorCode::ParseError,
            -32600 => ErrorCode::InvalidRequest,
            -32601 => ErrorCode::MethodNotFound,
            -32602 => ErrorCode::InvalidParams,
            -32603 => ErrorCode::InternalError,
            -1000 => ErrorCode::NodeInitError,
            -1001 => ErrorCode::NodeConfigError,
            -1002 => ErrorCode::NodeValidationError,
            -1003 => ErrorCode::NodeExecutionTimeout,
            -1004 => ErrorCode::NodeResourceLimit,
            -1005 => ErrorCode::NodeInternalError,
            _ => return None,
        };
        Some(found)
    }

    /// True for the transport band (-32768..=-32000).
    pub fn is_transport_band(self) -> bool {
        (-32768..=-32000).contains(&self.code())
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "Parse error",
            ErrorCode::InvalidRequest => "Invalid request",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::InvalidParams => "Invalid params",
            ErrorCode::InternalError => "Internal error",
            ErrorCode::NodeInitError => "Node initialization error",
            ErrorCode::NodeConfigError => "Node configuration error",
            ErrorCode::NodeValidationError => "Input validation error",
            ErrorCode::NodeExecutionTimeout => "Execution timeout",
            ErrorCode::NodeResourceLimit => "Resource limit exceeded",
            ErrorCode::NodeInternalError => "Node internal error",
        }
    }
}

/// The standard methods every node answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display, Serialize, Deserialize)]
pub enum Method {
    #[strum(serialize = "node.info")]
    #[serde(rename = "node.info")]
    Info,
    #[strum(serialize = "node.validate")]
    #[serde(rename = "node.validate")]
    Validate,
    #[strum(serialize = "node.execute")]
    #[serde(rename = "node.execute")]
    Execute,
    #[strum(serialize = "node.health")]
    #[serde(rename = "node.health")]
    Health,
    #[strum(serialize = "node.shutdown")]
    #[serde(rename = "node.shutdown")]
    Shutdown,
}

impl Method {
    pub const ALL: [Method; 5] = [
        Method::Info,
        Method::Validate,
        Method::Execute,
        Method::Health,
        Method::Shutdown,
    ];
}

// -----------------------------------------------------------------------------
// Typed params and results for the standard methods
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    #[serde(rename = "type", default = "PortSpec::default_type")]
    pub kind: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl PortSpec {
    fn default_type() -> String {
        "string".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InfoResult {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub inputs: Vec<PortSpec>,
    #[serde(default)]
    pub outputs: Vec<PortSpec>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidateParams {
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ValidateResult {
    pub valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ValidateResult {
    pub fn ok() -> Self {
        Self { valid: true, ..Default::default() }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self { valid: false, errors, warnings: vec![] }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecuteParams {
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub context: Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    #[serde(default)]
    pub execution_time_ms: u64,
    #[serde(default)]
    pub memory_used_mb: f64,
    #[serde(default = "ExecutionMetadata::default_status")]
    pub status: String,
}

impl ExecutionMetadata {
    fn default_status() -> String {
        "success".to_string()
    }
}

/// `node.execute` answer: the node's output plus its run metadata.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub output: Value,
    pub metadata: ExecutionMetadata,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HealthResult {
    pub healthy: bool,
    #[serde(default)]
    pub uptime_seconds: u64,
    #[serde(default)]
    pub memory_mb: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl HealthResult {
    pub fn healthy() -> Self {
        Self { healthy: true, ..Default::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownParams {
    #[serde(default = "ShutdownParams::default_timeout")]
    pub timeout_seconds: u64,
}

impl ShutdownParams {
    pub const DEFAULT_TIMEOUT_SECONDS: u64 = 10;

    fn default_timeout() -> u64 {
        Self::DEFAULT_TIMEOUT_SECONDS
    }
}

impl Default for ShutdownParams {
    fn default() -> Self {
        Self { timeout_seconds: Self::DEFAULT_TIMEOUT_SECONDS }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShutdownResult {
    pub accepted: bool,
}

/// Produces `req-<unix-millis>-<counter>` ids, unique per generator.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    counter: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("req-{}-{}", Utc::now().timestamp_millis(), n)
    }
}
