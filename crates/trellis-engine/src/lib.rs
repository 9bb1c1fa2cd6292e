//! Trellis Engine
//!
//! Executes declarative AI orchestration pipelines: named sequences of
//! typed steps that chain provider calls, data transforms, loops and,
//! recursively, other pipelines. The engine resolves `{{...}}` template
//! references between steps, enforces safety limits (nesting depth, cycle
//! detection, step and resource budgets), retries fallible steps with
//! configurable backoff and fallbacks, validates step outputs against
//! declared schemas, checkpoints results for resume, and records a span
//! tree per execution for inspection.
//!
//! Provider adapters are external collaborators behind the opaque
//! [`trellis_core::traits::Provider`] trait; the engine owns sequencing,
//! not the semantics of provider effects.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trellis_core::config::{Pipeline, PromptElement, Step, StepKind};
//! use trellis_engine::executor::{ExecutorOptions, PipelineExecutor};
//!
//! # async fn example(provider: Arc<dyn trellis_core::traits::Provider>) -> anyhow::Result<()> {
//! let pipeline = Pipeline::new(
//!     "summarize",
//!     vec![Step::new(
//!         "summary",
//!         StepKind::Provider {
//!             provider: "claude".to_string(),
//!             options: Default::default(),
//!             prompt: vec![PromptElement::Static {
//!                 content: "Summarize: {{inputs.text}}".to_string(),
//!             }],
//!             simplified_prompt: None,
//!         },
//!     )],
//! );
//!
//! let executor = PipelineExecutor::builder()
//!     .provider("claude", provider)
//!     .options(ExecutorOptions::default())
//!     .build();
//! let outcome = executor.execute(&pipeline).await?;
//! println!("results: {:?}", outcome.results);
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod context;
pub mod dispatcher;
pub mod events;
pub mod executor;
pub mod metrics;
mod nested;
pub mod registry;
pub mod robustness;
pub mod safety;
pub mod schema;
pub mod spans;
mod steps;
pub mod template;
pub mod validate;

pub use checkpoint::{Checkpoint, CheckpointManager};
pub use context::ExecutionContext;
pub use dispatcher::{Dispatcher, Environment};
pub use events::{EventBus, EventListener, EventType, ExecutionEvent, LogListener};
pub use executor::{ExecutionOutcome, ExecutorBuilder, ExecutorOptions, PipelineExecutor};
pub use metrics::{ExecutionMetrics, MetricsRecorder};
pub use registry::PipelineRegistry;
pub use safety::{SafetyGuard, SafetyWarning};
pub use spans::{PerformanceSummary, SearchField, Span, SpanNode, SpanStatus, TraceCollector};
pub use template::TemplateResolver;
pub use validate::validate_pipeline;
