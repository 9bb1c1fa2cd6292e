use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Classification of every failure the engine can surface to a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Nesting depth reached the configured ceiling.
    MaxNestingDepthExceeded,

    /// A pipeline appeared twice in its own execution chain.
    CircularDependency,

    /// Cumulative step count across the root execution exceeded the limit.
    StepCountExceeded,

    /// Process memory crossed the hard limit.
    MemoryExceeded,

    /// Elapsed execution time crossed the hard limit.
    Timeout,

    /// A step output failed its declared schema.
    SchemaViolation,

    /// Two steps at the same pipeline level share a name.
    DuplicateStepName,

    /// A dotted output path did not resolve.
    PathNotFound,

    /// The provider reported a failure.
    ProviderError,

    /// The execution deadline cancelled in-flight work.
    Cancelled,

    /// Unexpected condition inside the engine.
    Internal,
}

impl ErrorKind {
    /// Safety failures terminate the whole execution and are never retried.
    pub fn is_safety(&self) -> bool {
        matches!(
            self,
            ErrorKind::MaxNestingDepthExceeded
                | ErrorKind::CircularDependency
                | ErrorKind::StepCountExceeded
                | ErrorKind::MemoryExceeded
                | ErrorKind::Timeout
        )
    }

    /// Only provider failures are candidates for the retry layer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::ProviderError)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::MaxNestingDepthExceeded => "MaxNestingDepthExceeded",
            ErrorKind::CircularDependency => "CircularDependency",
            ErrorKind::StepCountExceeded => "StepCountExceeded",
            ErrorKind::MemoryExceeded => "MemoryExceeded",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::SchemaViolation => "SchemaViolation",
            ErrorKind::DuplicateStepName => "DuplicateStepName",
            ErrorKind::PathNotFound => "PathNotFound",
            ErrorKind::ProviderError => "ProviderError",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// The error envelope surfaced to callers.
///
/// `chain` lists every pipeline id from the root to the level where the
/// failure happened; nested-pipeline errors grow the chain as they
/// propagate, so diagnostics always carry the full path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub chain: Vec<String>,
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default)]
    pub details: Value,
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            chain: Vec::new(),
            step: None,
            details: Value::Null,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn with_chain(mut self, chain: Vec<String>) -> Self {
        self.chain = chain;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Merge a detail entry into the envelope, preserving existing keys.
    pub fn annotate(mut self, key: &str, value: Value) -> Self {
        match &mut self.details {
            Value::Object(map) => {
                map.insert(key.to_string(), value);
            }
            Value::Null => {
                let mut map = serde_json::Map::new();
                map.insert(key.to_string(), value);
                self.details = Value::Object(map);
            }
            other => {
                let mut map = serde_json::Map::new();
                map.insert("details".to_string(), other.clone());
                map.insert(key.to_string(), value);
                self.details = Value::Object(map);
            }
        }
        self
    }

    /// Fill in the execution chain while propagating, without disturbing a
    /// chain recorded closer to the failure. Errors raised inside a nested
    /// pipeline already carry the full root-to-current chain; ancestors only
    /// supply theirs when nothing deeper did.
    pub fn ensure_chain(mut self, chain: Vec<String>) -> Self {
        if self.chain.is_empty() {
            self.chain = chain;
        }
        self
    }

    pub fn is_safety(&self) -> bool {
        self.kind.is_safety()
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(step) = &self.step {
            write!(f, " (step '{}')", step)?;
        }
        if !self.chain.is_empty() {
            write!(f, " [chain: {}]", self.chain.join(" -> "))?;
        }
        Ok(())
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::internal(format!("io error: {}", err))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::internal(format!("serialization error: {}", err))
    }
}
