//! IPC protocol types for lidguard-daemon.
//!
//! Shared by the daemon and `lidguard-ctl` so both sides agree on the wire
//! format. One newline-terminated JSON request per connection, answered by one
//! newline-terminated JSON response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

pub const SOCKET_ENV: &str = "LIDGUARD_SOCKET";
pub const SOCKET_FILE: &str = "daemon.sock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    Arm,
    Stop,
    Status,
    TestTrigger,
    GetHealth,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Arm => "arm",
            Method::Stop => "stop",
            Method::Status => "status",
            Method::TestTrigger => "test_trigger",
            Method::GetHealth => "get_health",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    /// Reserved. No method takes parameters yet, so only `null` or `{}` is
    /// accepted; see [`Request::check_params`].
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: None,
            params: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Rejects requests from a client speaking another protocol version.
    pub fn check_version(&self) -> Result<(), ErrorInfo> {
        if self.protocol_version == PROTOCOL_VERSION {
            return Ok(());
        }
        Err(ErrorInfo::new(
            "protocol_mismatch",
            format!(
                "Unsupported protocol_version {} (expected {})",
                self.protocol_version, PROTOCOL_VERSION
            ),
        ))
    }

    /// Rejects parameters, which no current method accepts.
    pub fn check_params(&self) -> Result<(), ErrorInfo> {
        match &self.params {
            None | Some(Value::Null) => Ok(()),
            Some(Value::Object(map)) if map.is_empty() => Ok(()),
            Some(_) => Err(ErrorInfo::new(
                "invalid_params",
                format!("{} takes no params", self.method.as_str()),
            )),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}
