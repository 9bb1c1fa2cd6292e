use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// A declarative execution plan. Immutable once execution starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub checkpoint_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<PathBuf>,
    #[serde(default)]
    pub defaults: HashMap<String, Value>,
    #[serde(default)]
    pub globals: HashMap<String, Value>,
    #[serde(default)]
    pub functions: HashMap<String, Value>,
    #[serde(default)]
    pub providers: HashMap<String, Value>,
    pub steps: Vec<Step>,
}

impl Pipeline {
    /// Convenience constructor for programmatic pipeline assembly.
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            description: None,
            checkpoint_enabled: false,
            workspace_dir: None,
            defaults: HashMap::new(),
            globals: HashMap::new(),
            functions: HashMap::new(),
            providers: HashMap::new(),
            steps,
        }
    }
}

/// A named, typed unit of work within a pipeline.
///
/// Common fields apply to every step kind; the kind-specific payload is
/// flattened so serialized steps read as a single record with a `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_to_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub continue_on_error: bool,
    /// Per-step timeout as a duration string ("250ms", "5s", "2m").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl Step {
    pub fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            condition: None,
            output_to_file: None,
            output_schema: None,
            continue_on_error: false,
            timeout: None,
            retry: None,
            kind,
        }
    }

    /// Stable tag used for dispatch tables, metrics and trace metadata.
    pub fn kind_tag(&self) -> &'static str {
        self.kind.tag()
    }
}

/// Kind-specific payload of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Single opaque provider invocation.
    Provider {
        provider: String,
        #[serde(default)]
        options: HashMap<String, Value>,
        prompt: Vec<PromptElement>,
        /// Simplified variant used by the `simplified_prompt` fallback.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        simplified_prompt: Option<Vec<PromptElement>>,
    },
    /// N provider calls launched together and joined as an ordered list.
    ParallelProvider { calls: Vec<ProviderCall> },
    /// Recursive invocation of another pipeline.
    Pipeline {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pipeline_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pipeline_file: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pipeline: Option<Box<Pipeline>>,
        #[serde(default)]
        inputs: HashMap<String, Value>,
        #[serde(default)]
        outputs: Vec<OutputMapping>,
        #[serde(default)]
        config: NestedConfig,
    },
    /// Iterate a data source, executing the inner steps once per item.
    ForEach {
        iterator: String,
        data_source: String,
        steps: Vec<Step>,
        #[serde(default)]
        parallel: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_parallel: Option<usize>,
    },
    /// Re-evaluate a condition against the updated context each iteration.
    While {
        condition: String,
        #[serde(default = "default_max_iterations")]
        max_iterations: u64,
        steps: Vec<Step>,
    },
    /// Evaluate an expression and execute the matching branch.
    Switch {
        expression: String,
        cases: HashMap<String, Vec<Step>>,
        #[serde(default)]
        default: Vec<Step>,
    },
    /// Apply declared operations to a value taken from the context.
    Transform {
        input: String,
        operations: Vec<TransformOp>,
    },
    /// Write values into the mutable variable state.
    SetVariable { variables: HashMap<String, Value> },
    /// Explicit checkpoint marker.
    Checkpoint {},
    /// Filesystem side effects under the workspace directory.
    FileOps { operations: Vec<FileOperation> },
}

impl StepKind {
    pub fn tag(&self) -> &'static str {
        match self {
            StepKind::Provider { .. } => "provider",
            StepKind::ParallelProvider { .. } => "parallel_provider",
            StepKind::Pipeline { .. } => "pipeline",
            StepKind::ForEach { .. } => "for_each",
            StepKind::While { .. } => "while",
            StepKind::Switch { .. } => "switch",
            StepKind::Transform { .. } => "transform",
            StepKind::SetVariable { .. } => "set_variable",
            StepKind::Checkpoint {} => "checkpoint",
            StepKind::FileOps { .. } => "file_ops",
        }
    }
}

fn default_max_iterations() -> u64 {
    100
}

/// One call within a `parallel_provider` fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCall {
    pub name: String,
    pub provider: String,
    #[serde(default)]
    pub options: HashMap<String, Value>,
    pub prompt: Vec<PromptElement>,
}

/// Building blocks of a provider prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PromptElement {
    Static {
        content: String,
    },
    File {
        path: PathBuf,
        #[serde(default)]
        vars: HashMap<String, Value>,
    },
    PreviousResponse {
        step: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extract: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<usize>,
        #[serde(default)]
        summary: bool,
    },
    SessionContext {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        include_last_n: Option<usize>,
    },
    ClaudeContinue {
        new_prompt: String,
    },
}

/// How a nested pipeline's results surface to its parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputMapping {
    /// Shorthand: copy the named child result.
    Name(String),
    /// Dotted traversal into the child results, stored under an alias.
    Path {
        path: String,
        #[serde(rename = "as")]
        alias: String,
        #[serde(default)]
        optional: bool,
    },
}

/// Configuration of a nested-pipeline step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NestedConfig {
    #[serde(default = "default_true")]
    pub inherit_context: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inheritance: Option<InheritanceSpec>,
}

impl Default for NestedConfig {
    fn default() -> Self {
        Self {
            inherit_context: true,
            inheritance: None,
        }
    }
}

/// Selective inheritance filters for nested pipelines.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InheritanceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_vars: Option<GlobalVarFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub providers: Option<ProviderOverride>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalVarFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<String>>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderOverride {
    #[serde(rename = "override", default)]
    pub overrides: HashMap<String, Value>,
}

/// Declarative data-transform operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformOp {
    Filter {
        field: String,
        #[serde(default)]
        compare: CompareOp,
        value: Value,
    },
    Aggregate {
        function: AggregateFn,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
    Join {
        #[serde(default = "default_separator")]
        separator: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    #[default]
    Eq,
    Ne,
    Gt,
    Lt,
    Contains,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    Sum,
    Avg,
    Count,
    Min,
    Max,
}

fn default_separator() -> String {
    ", ".to_string()
}

/// Filesystem operations available to `file_ops` steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FileOperation {
    Copy { from: String, to: String },
    Move { from: String, to: String },
    Delete { path: String },
    Validate {
        path: String,
        #[serde(default = "default_true")]
        must_exist: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_size: Option<u64>,
    },
    List {
        dir: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extension: Option<String>,
    },
    Convert {
        from: String,
        to: String,
        format: ConvertFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvertFormat {
    Json,
    Yaml,
}

/// Retry configuration for fallible steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Ceiling applied to every computed delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub retry_conditions: Vec<RetryCondition>,
    #[serde(default)]
    pub fallback_action: FallbackAction,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffKind::Exponential,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            retry_conditions: vec![
                RetryCondition::Timeout,
                RetryCondition::RateLimit,
                RetryCondition::ConnectionError,
            ],
            fallback_action: FallbackAction::GracefulDegradation,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-indexed), capped at the
    /// configured ceiling. The first retry always waits the base delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms;
        let raw = match self.backoff {
            BackoffKind::Exponential => base.saturating_mul(1u64 << attempt.min(32)),
            BackoffKind::Linear => base.saturating_mul(attempt as u64 + 1),
            BackoffKind::Fixed => base,
        };
        Duration::from_millis(raw.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCondition {
    Timeout,
    RateLimit,
    TemporaryError,
    ConnectionError,
}

impl RetryCondition {
    pub fn tag(&self) -> &'static str {
        match self {
            RetryCondition::Timeout => "timeout",
            RetryCondition::RateLimit => "rate_limit",
            RetryCondition::TemporaryError => "temporary_error",
            RetryCondition::ConnectionError => "connection_error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    #[default]
    GracefulDegradation,
    UseCachedResponse,
    SimplifiedPrompt,
    EmergencyResponse,
}

/// Engine-wide resource and recursion limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyLimits {
    pub max_nesting_depth: usize,
    pub max_total_steps: u64,
    pub memory_limit_bytes: u64,
    pub timeout_ms: u64,
    /// Fraction of a limit at which a soft warning is emitted.
    pub warning_threshold: f64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_nesting_depth: 10,
            max_total_steps: 1000,
            memory_limit_bytes: 1024 * 1024 * 1024,
            timeout_ms: 300_000,
            warning_threshold: 0.8,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

/// Parse duration strings like "250ms", "5s", "2m", "1h". A bare number is
/// taken as seconds.
pub fn parse_duration(duration_str: &str) -> anyhow::Result<Duration> {
    let duration_str = duration_str.trim();

    if let Some(ms) = duration_str.strip_suffix("ms") {
        let ms: u64 = ms.parse()?;
        Ok(Duration::from_millis(ms))
    } else if let Some(secs) = duration_str.strip_suffix('s') {
        let secs: u64 = secs.parse()?;
        Ok(Duration::from_secs(secs))
    } else if let Some(mins) = duration_str.strip_suffix('m') {
        let mins: u64 = mins.parse()?;
        Ok(Duration::from_secs(mins * 60))
    } else if let Some(hours) = duration_str.strip_suffix('h') {
        let hours: u64 = hours.parse()?;
        Ok(Duration::from_secs(hours * 3600))
    } else {
        let secs: u64 = duration_str.parse()?;
        Ok(Duration::from_secs(secs))
    }
}
