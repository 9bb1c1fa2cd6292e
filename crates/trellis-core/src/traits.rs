use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Read-only snapshot of the executing context handed to providers.
///
/// Providers never see the live context; the snapshot is taken at call time
/// so parallel siblings observe identical state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextView {
    pub pipeline_id: String,
    pub step_name: String,
    pub trace_id: String,
    pub nesting_depth: usize,
    pub inputs: HashMap<String, Value>,
}

/// Request handed to a provider for a single call.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub provider_id: String,
    pub options: HashMap<String, Value>,
    pub prompt: String,
    pub context: ContextView,
}

/// Response metadata reported by providers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
}

/// A complete provider message. `payload` carries either free text
/// (`Value::String`) or structured data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub payload: Value,
    #[serde(default)]
    pub metadata: ProviderMetadata,
}

impl ProviderResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            payload: Value::String(text.into()),
            metadata: ProviderMetadata::default(),
        }
    }

    pub fn data(payload: Value) -> Self {
        Self {
            payload,
            metadata: ProviderMetadata::default(),
        }
    }
}

/// Transient-vs-permanent classification consumed by the retry layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Timeout,
    RateLimit,
    Temporary,
    Connection,
    Other,
}

impl ProviderErrorKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::RateLimit => "rate_limit",
            ProviderErrorKind::Temporary => "temporary_error",
            ProviderErrorKind::Connection => "connection_error",
            ProviderErrorKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Timeout, message)
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider error ({}): {}", self.kind.tag(), self.message)
    }
}

impl std::error::Error for ProviderError {}

/// External collaborator performing the actual model or tool call.
/// Opaque to the engine; implementations live outside this workspace.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;
}
