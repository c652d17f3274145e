use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

/// Tool information advertised by a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

impl ToolDescriptor {
    /// Descriptor for a tool known only by name (declared in configuration)
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: None,
        }
    }

    /// Input schema, defaulting to an open object
    pub fn schema(&self) -> Value {
        self.input_schema
            .clone()
            .unwrap_or_else(|| serde_json::json!({"type": "object"}))
    }
}

/// Failure of a capability client operation
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CapabilityError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl CapabilityError {
    pub fn timeout(after: Duration) -> Self {
        CapabilityError::Timeout {
            after_ms: after.as_millis() as u64,
        }
    }

    /// Short label used for metrics and log fields
    pub fn label(&self) -> &'static str {
        match self {
            CapabilityError::Connection(_) => "connection",
            CapabilityError::Auth(_) => "auth",
            CapabilityError::Timeout { .. } => "timeout",
            CapabilityError::Protocol(_) => "protocol",
            CapabilityError::Remote { .. } => "remote",
            CapabilityError::Unavailable(_) => "unavailable",
        }
    }
}

impl From<reqwest::Error> for CapabilityError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CapabilityError::Timeout { after_ms: 0 }
        } else if err.is_decode() {
            CapabilityError::Protocol(err.to_string())
        } else {
            CapabilityError::Connection(err.to_string())
        }
    }
}

/// A requested remote operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub provider_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// Per-call timeout; the provider default applies when absent
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl ToolInvocation {
    pub fn new(provider_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            tool_name: tool_name.into(),
            arguments: Map::new(),
            timeout: None,
        }
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of one invocation; exactly one per `ToolInvocation`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub provider_id: String,
    pub tool_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CapabilityError>,
    pub latency_ms: u64,
}

impl ToolResult {
    pub fn ok(invocation: &ToolInvocation, payload: Value, latency: Duration) -> Self {
        Self {
            provider_id: invocation.provider_id.clone(),
            tool_name: invocation.tool_name.clone(),
            success: true,
            payload: Some(payload),
            error: None,
            latency_ms: latency.as_millis() as u64,
        }
    }

    pub fn failed(invocation: &ToolInvocation, error: CapabilityError, latency: Duration) -> Self {
        Self {
            provider_id: invocation.provider_id.clone(),
            tool_name: invocation.tool_name.clone(),
            success: false,
            payload: None,
            error: Some(error),
            latency_ms: latency.as_millis() as u64,
        }
    }
}
