//! Step dispatcher
//!
//! Drives the main execution loop: admit the step with the safety guard,
//! evaluate its condition, open a span, run the kind-specific handler
//! (with the retry loop for robust steps), validate the output schema,
//! store the result, and emit events, metrics and checkpoints. The
//! dispatcher owns sequencing; handlers own the semantics of their effects.

use crate::checkpoint::CheckpointManager;
use crate::context::ExecutionContext;
use crate::events::{EventBus, EventType, ExecutionEvent};
use crate::metrics::MetricsRecorder;
use crate::registry::PipelineRegistry;
use crate::robustness::{
    self, ErrorHistoryEntry, ResponseCache, RobustnessMetadata,
};
use crate::safety::SafetyGuard;
use crate::schema;
use crate::spans::{SpanStatus, TraceCollector};
use crate::template::TemplateResolver;
use crate::{nested, steps};
use log::{debug, error, info};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use trellis_core::config::{parse_duration, FallbackAction, Pipeline, RetryPolicy, Step, StepKind};
use trellis_core::error::{EngineError, EngineResult, ErrorKind};
use trellis_core::traits::Provider;

pub type DispatchFuture<'a, T> = Pin<Box<dyn Future<Output = EngineResult<T>> + Send + 'a>>;

/// Shared, read-only execution environment. Built once per execution by the
/// facade and handed to every handler through the dispatcher.
pub struct Environment {
    pub providers: HashMap<String, Arc<dyn Provider>>,
    pub registry: PipelineRegistry,
    pub tracer: Arc<TraceCollector>,
    pub events: EventBus,
    pub metrics: Arc<MetricsRecorder>,
    pub safety: SafetyGuard,
    pub checkpoints: Option<CheckpointManager>,
    pub cache: Arc<ResponseCache>,
    pub workspace_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    /// Pipeline-level deadline; crossing it cancels in-flight work.
    pub deadline: Option<Instant>,
    pub debug: bool,
}

impl Environment {
    pub fn remaining_time(&self) -> Option<std::time::Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Outcome of a single dispatched step.
#[derive(Debug)]
pub enum StepOutcome {
    Completed(Value),
    Skipped,
}

#[derive(Clone)]
pub struct Dispatcher {
    env: Arc<Environment>,
}

impl Dispatcher {
    pub fn new(env: Arc<Environment>) -> Self {
        Self { env }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// Execute a pipeline's steps in source order against a context,
    /// starting at `ctx.step_index` (non-zero after a checkpoint resume).
    pub fn run_pipeline<'a>(
        &'a self,
        pipeline: &'a Pipeline,
        ctx: &'a mut ExecutionContext,
    ) -> DispatchFuture<'a, HashMap<String, Value>> {
        Box::pin(async move {
            self.env
                .events
                .emit(
                    ExecutionEvent::new(EventType::PipelineStarted, &ctx.run_id, &ctx.pipeline_id)
                        .with_data("depth", json!(ctx.nesting_depth)),
                )
                .await;

            let result = self.run_steps(pipeline, ctx).await;

            let event_type = match &result {
                Ok(_) => EventType::PipelineCompleted,
                Err(_) => EventType::PipelineFailed,
            };
            self.env.metrics.record_pipeline(result.is_ok()).await;
            self.env
                .events
                .emit(ExecutionEvent::new(event_type, &ctx.run_id, &ctx.pipeline_id))
                .await;

            result
        })
    }

    async fn run_steps(
        &self,
        pipeline: &Pipeline,
        ctx: &mut ExecutionContext,
    ) -> EngineResult<HashMap<String, Value>> {
        let start_index = ctx.step_index;
        for (index, step) in pipeline.steps.iter().enumerate().skip(start_index) {
            debug!(
                "pipeline {} step {} ({}) [{}]",
                ctx.pipeline_id,
                index,
                step.name,
                step.kind_tag()
            );
            ctx.step_index = index;

            self.run_step(step, ctx).await?;

            ctx.step_index = index + 1;
            if pipeline.checkpoint_enabled {
                self.write_checkpoint(ctx).await;
            }
        }
        Ok(ctx.results.clone())
    }

    /// Inner steps of loops, branches and switch cases run through the same
    /// per-step path, minus checkpointing.
    pub(crate) fn run_inner_steps<'a>(
        &'a self,
        steps: &'a [Step],
        ctx: &'a mut ExecutionContext,
    ) -> DispatchFuture<'a, ()> {
        Box::pin(async move {
            for step in steps {
                self.run_step(step, ctx).await?;
            }
            Ok(())
        })
    }

    /// Dispatch one step end to end.
    pub(crate) async fn run_step(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
    ) -> EngineResult<StepOutcome> {
        self.check_deadline(ctx)?;

        // Safety admission: step count, then resource budgets.
        match self.env.safety.check_step_count(ctx) {
            Ok(Some(warning)) => self.emit_safety_warning(ctx, &warning).await,
            Ok(None) => {}
            Err(e) => return Err(e),
        }
        for warning in self.env.safety.check_resources(ctx)? {
            self.emit_safety_warning(ctx, &warning).await;
        }

        // Condition gate.
        if let Some(condition) = &step.condition {
            if !TemplateResolver::truthy(condition, ctx) {
                debug!("step {} skipped: condition '{}' is falsey", step.name, condition);
                ctx.log(&step.name, "skipped", json!({ "condition": condition }));
                self.env.metrics.record_skip().await;
                self.env
                    .events
                    .emit(
                        ExecutionEvent::new(EventType::StepSkipped, &ctx.run_id, &ctx.pipeline_id)
                            .with_step(&step.name),
                    )
                    .await;
                return Ok(StepOutcome::Skipped);
            }
        }

        let span_id = self
            .env
            .tracer
            .start_span(&step.name, step.kind_tag(), ctx);
        self.env
            .events
            .emit(
                ExecutionEvent::new(EventType::StepStarted, &ctx.run_id, &ctx.pipeline_id)
                    .with_step(&step.name)
                    .with_data("span_id", json!(span_id)),
            )
            .await;

        let outcome = self.run_step_guarded(step, ctx).await;
        ctx.pop_span();

        match outcome {
            Ok(value) => {
                self.env
                    .tracer
                    .end_span(&ctx.trace_id, &span_id, SpanStatus::Completed, None);
                self.env
                    .metrics
                    .record_step(step.kind_tag(), true, ctx.attempts(&step.name))
                    .await;
                self.env
                    .events
                    .emit(
                        ExecutionEvent::new(EventType::StepCompleted, &ctx.run_id, &ctx.pipeline_id)
                            .with_step(&step.name),
                    )
                    .await;
                info!("step {} completed", step.name);
                Ok(StepOutcome::Completed(value))
            }
            Err(err) => {
                let err = err
                    .annotate("span_id", json!(span_id))
                    .ensure_chain(ctx.execution_chain.clone());
                self.env.tracer.end_span(
                    &ctx.trace_id,
                    &span_id,
                    SpanStatus::Failed,
                    Some(err.message.clone()),
                );
                self.env
                    .metrics
                    .record_step(step.kind_tag(), false, ctx.attempts(&step.name))
                    .await;
                self.env
                    .events
                    .emit(
                        ExecutionEvent::new(EventType::StepFailed, &ctx.run_id, &ctx.pipeline_id)
                            .with_step(&step.name)
                            .with_data("error", json!(err.message)),
                    )
                    .await;
                error!("step {} failed: {}", step.name, err);

                if step.continue_on_error && !err.is_safety() && !err.is_cancelled() {
                    let marker = json!({
                        "failed": true,
                        "error": err.message,
                        "kind": err.kind.to_string(),
                    });
                    ctx.store_result(&step.name, marker.clone())?;
                    ctx.log(&step.name, "continued_after_error", json!(err.message));
                    return Ok(StepOutcome::Completed(marker));
                }
                Err(err)
            }
        }
    }

    /// Handler invocation wrapped with retry, schema validation, result
    /// storage and the output file write.
    async fn run_step_guarded(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
    ) -> EngineResult<Value> {
        let result = match &step.retry {
            Some(policy) => self.run_with_retry(step, policy, ctx).await?,
            None => {
                ctx.record_attempt(&step.name);
                self.run_kind(step, ctx, false).await?
            }
        };

        // Validate before anything is persisted or written out.
        let validated = match &step.output_schema {
            Some(declared) => match schema::validate(&result, declared) {
                Ok(unwrapped) => unwrapped.clone(),
                Err(violations) => {
                    return Err(EngineError::new(
                        ErrorKind::SchemaViolation,
                        format!(
                            "output of step '{}' violates its schema ({} violation{})",
                            step.name,
                            violations.len(),
                            if violations.len() == 1 { "" } else { "s" }
                        ),
                    )
                    .with_step(&step.name)
                    .with_chain(ctx.execution_chain.clone())
                    .with_details(schema::violations_to_details(&violations)));
                }
            },
            None => result,
        };

        ctx.store_result(&step.name, validated.clone())?;
        ctx.log(&step.name, "completed", json!({}));

        if step.retry.is_some() {
            let signature = ResponseCache::signature(&ctx.pipeline_id, &step.name);
            self.env.cache.store(&signature, validated.clone()).await;
        }

        if let Some(path) = &step.output_to_file {
            self.write_output_file(path, &validated, ctx).await?;
        }

        Ok(validated)
    }

    /// The retry loop for robust steps. Safety errors and cancellation pass
    /// through untouched; everything else is classified, retried while the
    /// policy allows, and resolved through the fallback action once
    /// exhausted.
    async fn run_with_retry(
        &self,
        step: &Step,
        policy: &RetryPolicy,
        ctx: &mut ExecutionContext,
    ) -> EngineResult<Value> {
        let started = Instant::now();
        let mut history: Vec<ErrorHistoryEntry> = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            ctx.record_attempt(&step.name);
            match self.run_kind(step, ctx, false).await {
                Ok(value) => {
                    if history.is_empty() {
                        return Ok(value);
                    }
                    let metadata = self.metadata(attempt + 1, &history, started, true);
                    return Ok(robustness::attach_metadata(value, &metadata));
                }
                Err(err) if err.is_safety() || err.is_cancelled() => return Err(err),
                Err(err) => {
                    history.push(ErrorHistoryEntry {
                        attempt: attempt + 1,
                        error_tag: robustness::error_tag(&err),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });

                    if attempt < policy.max_retries && robustness::retry_eligible(&err, policy) {
                        let delay = policy.delay_for_attempt(attempt);
                        debug!(
                            "step {} attempt {} failed ({}); retrying in {:?}",
                            step.name,
                            attempt + 1,
                            robustness::error_tag(&err),
                            delay
                        );
                        self.env
                            .events
                            .emit(
                                ExecutionEvent::new(
                                    EventType::StepRetrying,
                                    &ctx.run_id,
                                    &ctx.pipeline_id,
                                )
                                .with_step(&step.name)
                                .with_data("attempt", json!(attempt + 1))
                                .with_data("error", json!(err.message)),
                            )
                            .await;
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return self
                        .apply_fallback(step, policy, &err, history, attempt + 1, started, ctx)
                        .await;
                }
            }
        }
    }

    async fn apply_fallback(
        &self,
        step: &Step,
        policy: &RetryPolicy,
        err: &EngineError,
        mut history: Vec<ErrorHistoryEntry>,
        attempts: u32,
        started: Instant,
        ctx: &mut ExecutionContext,
    ) -> EngineResult<Value> {
        match policy.fallback_action {
            FallbackAction::GracefulDegradation => {
                let metadata = self.metadata(attempts, &history, started, true);
                Ok(robustness::attach_metadata(
                    robustness::degraded_result(err),
                    &metadata,
                ))
            }
            FallbackAction::UseCachedResponse => {
                let signature = ResponseCache::signature(&ctx.pipeline_id, &step.name);
                match self.env.cache.get(&signature).await {
                    Some(cached) => {
                        let metadata = self.metadata(attempts, &history, started, true);
                        let mut result = robustness::attach_metadata(cached, &metadata);
                        if let Value::Object(map) = &mut result {
                            map.insert("from_cache".to_string(), json!(true));
                        }
                        Ok(result)
                    }
                    None => {
                        let metadata = self.metadata(attempts, &history, started, true);
                        Ok(robustness::attach_metadata(
                            robustness::degraded_result(err),
                            &metadata,
                        ))
                    }
                }
            }
            FallbackAction::SimplifiedPrompt => {
                ctx.record_attempt(&step.name);
                match self.run_kind(step, ctx, true).await {
                    Ok(value) => {
                        let metadata = self.metadata(attempts + 1, &history, started, true);
                        Ok(robustness::attach_metadata(value, &metadata))
                    }
                    Err(simplified_err)
                        if simplified_err.is_safety() || simplified_err.is_cancelled() =>
                    {
                        Err(simplified_err)
                    }
                    Err(simplified_err) => {
                        history.push(ErrorHistoryEntry {
                            attempt: attempts + 1,
                            error_tag: robustness::error_tag(&simplified_err),
                            elapsed_ms: started.elapsed().as_millis() as u64,
                        });
                        let metadata = self.metadata(attempts + 1, &history, started, true);
                        Ok(robustness::attach_metadata(
                            robustness::degraded_result(&simplified_err),
                            &metadata,
                        ))
                    }
                }
            }
            FallbackAction::EmergencyResponse => {
                let metadata = self.metadata(attempts, &history, started, true);
                Ok(robustness::attach_metadata(
                    robustness::emergency_result(),
                    &metadata,
                ))
            }
        }
    }

    fn metadata(
        &self,
        attempts: u32,
        history: &[ErrorHistoryEntry],
        started: Instant,
        recovered: bool,
    ) -> RobustnessMetadata {
        RobustnessMetadata {
            attempt_number: attempts,
            total_attempts: attempts,
            execution_time_ms: started.elapsed().as_millis() as u64,
            error_history: history.to_vec(),
            recovery_successful: recovered,
        }
    }

    /// Kind-specific handler dispatch. `simplified` selects the simplified
    /// prompt variant during the `simplified_prompt` fallback.
    async fn run_kind(
        &self,
        step: &Step,
        ctx: &mut ExecutionContext,
        simplified: bool,
    ) -> EngineResult<Value> {
        let work = async {
            match &step.kind {
                StepKind::Provider {
                    provider,
                    options,
                    prompt,
                    simplified_prompt,
                } => {
                    let elements = if simplified {
                        simplified_prompt.as_ref().unwrap_or(prompt)
                    } else {
                        prompt
                    };
                    steps::provider::run_single(self, step, provider, options, elements, ctx).await
                }
                StepKind::ParallelProvider { calls } => {
                    steps::provider::run_parallel(self, step, calls, ctx).await
                }
                StepKind::Pipeline {
                    pipeline_ref,
                    pipeline_file,
                    pipeline,
                    inputs,
                    outputs,
                    config,
                } => {
                    nested::run(
                        self,
                        step,
                        pipeline_ref.as_deref(),
                        pipeline_file.as_deref(),
                        pipeline.as_deref(),
                        inputs,
                        outputs,
                        config,
                        ctx,
                    )
                    .await
                }
                StepKind::ForEach {
                    iterator,
                    data_source,
                    steps: inner,
                    parallel,
                    max_parallel,
                } => {
                    steps::loops::run_for_each(
                        self,
                        step,
                        iterator,
                        data_source,
                        inner,
                        *parallel,
                        *max_parallel,
                        ctx,
                    )
                    .await
                }
                StepKind::While {
                    condition,
                    max_iterations,
                    steps: inner,
                } => steps::loops::run_while(self, step, condition, *max_iterations, inner, ctx).await,
                StepKind::Switch {
                    expression,
                    cases,
                    default,
                } => steps::switch::run(self, step, expression, cases, default, ctx).await,
                StepKind::Transform { input, operations } => {
                    steps::transform::run(step, input, operations, ctx)
                }
                StepKind::SetVariable { variables } => {
                    steps::variables::run(self, step, variables, ctx).await
                }
                StepKind::Checkpoint {} => steps::checkpoint_step::run(self, ctx).await,
                StepKind::FileOps { operations } => {
                    steps::files::run(self, step, operations, ctx).await
                }
            }
        };

        match self.step_timeout(step)? {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::new(
                    ErrorKind::ProviderError,
                    format!("step '{}' timed out after {:?}", step.name, limit),
                )
                .with_step(&step.name)
                .with_chain(ctx.execution_chain.clone())
                .with_details(json!({ "error_kind": "timeout" }))),
            },
            None => work.await,
        }
    }

    fn step_timeout(&self, step: &Step) -> EngineResult<Option<std::time::Duration>> {
        match &step.timeout {
            Some(spec) => parse_duration(spec)
                .map(Some)
                .map_err(|e| {
                    EngineError::internal(format!(
                        "invalid timeout '{}' on step '{}': {}",
                        spec, step.name, e
                    ))
                    .with_step(&step.name)
                }),
            None => Ok(None),
        }
    }

    pub(crate) fn check_deadline(&self, ctx: &ExecutionContext) -> EngineResult<()> {
        if let Some(deadline) = self.env.deadline {
            if Instant::now() >= deadline {
                return Err(EngineError::new(
                    ErrorKind::Cancelled,
                    "pipeline deadline reached; in-flight work cancelled",
                )
                .with_chain(ctx.execution_chain.clone()));
            }
        }
        Ok(())
    }

    pub(crate) async fn write_checkpoint(&self, ctx: &ExecutionContext) {
        if let Some(manager) = &self.env.checkpoints {
            match manager.write(ctx).await {
                Ok(path) => {
                    self.env
                        .events
                        .emit(
                            ExecutionEvent::new(
                                EventType::CheckpointWritten,
                                &ctx.run_id,
                                &ctx.pipeline_id,
                            )
                            .with_data("path", json!(path.display().to_string())),
                        )
                        .await;
                }
                Err(e) => {
                    // Checkpointing is best-effort; execution continues.
                    error!("checkpoint write failed for {}: {}", ctx.pipeline_id, e);
                }
            }
        }
    }

    async fn emit_safety_warning(&self, ctx: &ExecutionContext, warning: &crate::safety::SafetyWarning) {
        self.env
            .events
            .emit(
                ExecutionEvent::new(EventType::SafetyWarning, &ctx.run_id, &ctx.pipeline_id)
                    .with_data("resource", json!(warning.resource))
                    .with_data("current", json!(warning.current))
                    .with_data("limit", json!(warning.limit)),
            )
            .await;
    }

    async fn write_output_file(
        &self,
        path: &str,
        value: &Value,
        ctx: &ExecutionContext,
    ) -> EngineResult<()> {
        let resolved = TemplateResolver::resolve_to_string(path, ctx);
        let base = self
            .env
            .output_dir
            .clone()
            .or_else(|| self.env.workspace_dir.clone());
        let target = match base {
            Some(base) if PathBuf::from(&resolved).is_relative() => base.join(&resolved),
            _ => PathBuf::from(&resolved),
        };

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Strings are written raw; structured payloads pretty-print.
        let contents = match value {
            Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other)?,
        };
        tokio::fs::write(&target, contents).await?;
        debug!("wrote step output to {}", target.display());
        Ok(())
    }
}
