//! Executor facade
//!
//! The single public entry point: build an executor with providers, a
//! pipeline registry and limits, then `execute` (or `resume`) a pipeline.
//! The facade creates the root context, prepares workspace directories,
//! runs the dispatcher under the configured deadline, and finalizes
//! (flush checkpoint, close spans) before returning results or the error
//! envelope.

use crate::checkpoint::CheckpointManager;
use crate::context::ExecutionContext;
use crate::dispatcher::{Dispatcher, Environment};
use crate::events::{EventBus, EventListener, LogListener};
use crate::metrics::{ExecutionMetrics, MetricsRecorder};
use crate::registry::PipelineRegistry;
use crate::robustness::ResponseCache;
use crate::safety::SafetyGuard;
use crate::spans::TraceCollector;
use log::{debug, info};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use trellis_core::config::{Pipeline, SafetyLimits};
use trellis_core::error::{EngineError, EngineResult};
use trellis_core::traits::Provider;

/// Per-execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecutorOptions {
    pub workspace_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub checkpoint_dir: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
    pub debug: bool,
}

/// Successful execution outcome: the per-step results plus the identifiers
/// needed to query the trace afterwards.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub results: HashMap<String, Value>,
    pub run_id: String,
    pub trace_id: String,
}

pub struct PipelineExecutor {
    providers: HashMap<String, Arc<dyn Provider>>,
    registry: PipelineRegistry,
    tracer: Arc<TraceCollector>,
    events: EventBus,
    metrics: Arc<MetricsRecorder>,
    cache: Arc<ResponseCache>,
    limits: SafetyLimits,
    options: ExecutorOptions,
}

impl PipelineExecutor {
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::default()
    }

    /// Execute a pipeline from the beginning.
    pub async fn execute(&self, pipeline: &Pipeline) -> EngineResult<ExecutionOutcome> {
        let manager = self.checkpoint_manager(pipeline);
        let ctx = ExecutionContext::new_root(pipeline);
        self.run(pipeline, ctx, manager).await
    }

    /// Execute a pipeline, restoring from the latest checkpoint when one
    /// exists. Steps completed before the checkpoint are not re-executed.
    pub async fn resume(&self, pipeline: &Pipeline) -> EngineResult<ExecutionOutcome> {
        let manager = self.checkpoint_manager(pipeline);
        let ctx = match &manager {
            Some(manager) => match manager.read_latest(&pipeline.name).await? {
                Some(checkpoint) => {
                    info!(
                        "resuming pipeline {} from step {}",
                        pipeline.name, checkpoint.step_index
                    );
                    manager.resume(pipeline, &checkpoint)
                }
                None => ExecutionContext::new_root(pipeline),
            },
            None => ExecutionContext::new_root(pipeline),
        };
        self.run(pipeline, ctx, manager).await
    }

    async fn run(
        &self,
        pipeline: &Pipeline,
        mut ctx: ExecutionContext,
        checkpoints: Option<CheckpointManager>,
    ) -> EngineResult<ExecutionOutcome> {
        crate::validate::validate_pipeline(pipeline)?;
        self.prepare_directories(pipeline, checkpoints.as_ref()).await?;

        let mut limits = self.limits.clone();
        if let Some(memory) = self.options.memory_limit_bytes {
            limits.memory_limit_bytes = memory;
        }
        if let Some(timeout) = self.options.timeout_ms {
            limits.timeout_ms = timeout;
        }

        let deadline = self
            .options
            .timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));

        let env = Arc::new(Environment {
            providers: self.providers.clone(),
            registry: self.registry.clone(),
            tracer: Arc::clone(&self.tracer),
            events: self.events.clone(),
            metrics: Arc::clone(&self.metrics),
            safety: SafetyGuard::new(limits),
            checkpoints,
            cache: Arc::clone(&self.cache),
            workspace_dir: self
                .options
                .workspace_dir
                .clone()
                .or_else(|| pipeline.workspace_dir.clone()),
            output_dir: self.options.output_dir.clone(),
            deadline,
            debug: self.options.debug,
        });
        let dispatcher = Dispatcher::new(Arc::clone(&env));

        let run_id = ctx.run_id.clone();
        let trace_id = ctx.trace_id.clone();

        match dispatcher.run_pipeline(pipeline, &mut ctx).await {
            Ok(results) => {
                // Flush a final snapshot so a later resume starts past the
                // last step.
                if pipeline.checkpoint_enabled {
                    dispatcher.write_checkpoint(&ctx).await;
                }
                env.tracer.close_open_spans(&trace_id, None);
                if env.debug {
                    let summary = env.tracer.performance_summary(&trace_id);
                    debug!(
                        "pipeline {} finished: {} spans, success rate {:.2}, max depth {}",
                        pipeline.name, summary.span_count, summary.success_rate, summary.max_depth
                    );
                }
                Ok(ExecutionOutcome {
                    results,
                    run_id,
                    trace_id,
                })
            }
            Err(err) => {
                // Partial results completed before the failure stay in the
                // checkpoint, allowing a later resume.
                if pipeline.checkpoint_enabled {
                    dispatcher.write_checkpoint(&ctx).await;
                }
                env.tracer
                    .close_open_spans(&trace_id, Some(err.message.clone()));
                Err(err
                    .ensure_chain(vec![pipeline.name.clone()])
                    .annotate("trace_id", json!(trace_id)))
            }
        }
    }

    fn checkpoint_manager(&self, pipeline: &Pipeline) -> Option<CheckpointManager> {
        match &self.options.checkpoint_dir {
            Some(dir) => Some(CheckpointManager::new(dir.clone())),
            None if pipeline.checkpoint_enabled => {
                // Checkpointing was requested without an explicit directory;
                // anchor it under the workspace.
                let base = self
                    .options
                    .workspace_dir
                    .clone()
                    .or_else(|| pipeline.workspace_dir.clone())?;
                Some(CheckpointManager::new(base.join("checkpoints")))
            }
            None => None,
        }
    }

    async fn prepare_directories(
        &self,
        pipeline: &Pipeline,
        checkpoints: Option<&CheckpointManager>,
    ) -> EngineResult<()> {
        for dir in [
            self.options
                .workspace_dir
                .clone()
                .or_else(|| pipeline.workspace_dir.clone()),
            self.options.output_dir.clone(),
            checkpoints.map(|m| m.directory().to_path_buf()),
        ]
        .into_iter()
        .flatten()
        {
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                EngineError::internal(format!(
                    "failed to create directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Span queries against past executions (tree, depth slices, failures,
    /// search, performance summary).
    pub fn tracer(&self) -> &TraceCollector {
        &self.tracer
    }

    pub async fn metrics(&self) -> ExecutionMetrics {
        self.metrics.snapshot().await
    }
}

/// Builder for `PipelineExecutor`.
#[derive(Default)]
pub struct ExecutorBuilder {
    providers: HashMap<String, Arc<dyn Provider>>,
    registry: PipelineRegistry,
    listeners: Vec<Arc<dyn EventListener>>,
    limits: SafetyLimits,
    options: ExecutorOptions,
    log_events: bool,
}

impl ExecutorBuilder {
    pub fn provider(mut self, id: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(id.into(), provider);
        self
    }

    /// Register a pipeline for `pipeline_ref` resolution in nested steps.
    pub fn register_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.registry.register(pipeline);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Forward execution events to the `log` facade.
    pub fn with_log_events(mut self) -> Self {
        self.log_events = true;
        self
    }

    pub fn safety_limits(mut self, limits: SafetyLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> PipelineExecutor {
        let mut events = EventBus::new();
        if self.log_events {
            events.add_listener(Arc::new(LogListener));
        }
        for listener in self.listeners {
            events.add_listener(listener);
        }

        PipelineExecutor {
            providers: self.providers,
            registry: self.registry,
            tracer: Arc::new(TraceCollector::new()),
            events,
            metrics: Arc::new(MetricsRecorder::new()),
            cache: Arc::new(ResponseCache::new()),
            limits: self.limits,
            options: self.options,
        }
    }
}
