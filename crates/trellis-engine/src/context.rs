use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use trellis_core::config::{GlobalVarFilter, InheritanceSpec, Pipeline};
use trellis_core::error::{EngineError, EngineResult, ErrorKind};
use trellis_core::traits::ContextView;
use uuid::Uuid;

/// One record in the per-execution log. Ephemeral: never checkpointed,
/// never restored on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: chrono::DateTime<Utc>,
    pub step_name: String,
    pub event: String,
    #[serde(default)]
    pub detail: Value,
}

/// Mutable state carried through one pipeline invocation.
///
/// A context is owned by exactly one executing routine. `globals`,
/// `functions` and `providers` are shared read-only views (`Arc`); a child
/// context built for a nested pipeline holds references, never deep copies.
/// The step counter is shared across the whole root execution so the safety
/// guard can enforce a cumulative ceiling.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub pipeline_id: String,
    pub run_id: String,
    pub trace_id: String,
    pub results: HashMap<String, Value>,
    pub inputs: HashMap<String, Value>,
    globals: Arc<HashMap<String, Value>>,
    functions: Arc<HashMap<String, Value>>,
    providers: Arc<HashMap<String, Value>>,
    pub workflow: HashMap<String, Value>,
    /// Mutable variable overlay written by `set_variable` steps. Reads of
    /// `global_vars.<name>` consult this overlay before the shared globals.
    pub variable_state: HashMap<String, Value>,
    pub step_index: usize,
    pub execution_log: Vec<LogEntry>,
    pub execution_chain: Vec<String>,
    pub nesting_depth: usize,
    pub parent_pipeline: Option<String>,
    pub start_time: SystemTime,
    started: Instant,
    span_stack: Vec<String>,
    total_steps: Arc<AtomicU64>,
    step_attempts: HashMap<String, u32>,
}

impl ExecutionContext {
    /// Root context for a top-level execution.
    pub fn new_root(pipeline: &Pipeline) -> Self {
        let run_id = Uuid::new_v4().to_string();
        let trace_id = Uuid::new_v4().to_string();
        let workflow = workflow_metadata(pipeline, &run_id, &trace_id);

        Self {
            pipeline_id: pipeline.name.clone(),
            run_id,
            trace_id,
            results: HashMap::new(),
            inputs: HashMap::new(),
            globals: Arc::new(pipeline.globals.clone()),
            functions: Arc::new(pipeline.functions.clone()),
            providers: Arc::new(pipeline.providers.clone()),
            workflow,
            variable_state: HashMap::new(),
            step_index: 0,
            execution_log: Vec::new(),
            execution_chain: vec![pipeline.name.clone()],
            nesting_depth: 0,
            parent_pipeline: None,
            start_time: SystemTime::now(),
            started: Instant::now(),
            span_stack: Vec::new(),
            total_steps: Arc::new(AtomicU64::new(0)),
            step_attempts: HashMap::new(),
        }
    }

    /// Child context for a nested pipeline invocation.
    ///
    /// Inheriting children share the parent's globals by reference; isolated
    /// children start with empty globals but keep functions and providers so
    /// provider lookup still works. Either way the child owns fresh results,
    /// log, step index and variable state.
    pub fn child(
        &self,
        child_pipeline: &Pipeline,
        inherit_context: bool,
        inheritance: Option<&InheritanceSpec>,
    ) -> Self {
        let globals = if inherit_context {
            match inheritance.and_then(|spec| spec.global_vars.as_ref()) {
                Some(filter) => Arc::new(filter_globals(&self.globals, filter)),
                None => Arc::clone(&self.globals),
            }
        } else {
            Arc::new(HashMap::new())
        };

        let providers = match inheritance.and_then(|spec| spec.providers.as_ref()) {
            Some(overrides) if !overrides.overrides.is_empty() => {
                let mut merged = (*self.providers).clone();
                merged.extend(overrides.overrides.clone());
                Arc::new(merged)
            }
            _ => Arc::clone(&self.providers),
        };

        let mut chain = self.execution_chain.clone();
        chain.push(child_pipeline.name.clone());

        Self {
            pipeline_id: child_pipeline.name.clone(),
            run_id: self.run_id.clone(),
            trace_id: self.trace_id.clone(),
            results: HashMap::new(),
            inputs: HashMap::new(),
            globals,
            functions: Arc::clone(&self.functions),
            providers,
            workflow: workflow_metadata(child_pipeline, &self.run_id, &self.trace_id),
            variable_state: HashMap::new(),
            step_index: 0,
            execution_log: Vec::new(),
            execution_chain: chain,
            nesting_depth: self.nesting_depth + 1,
            parent_pipeline: Some(self.pipeline_id.clone()),
            start_time: self.start_time,
            started: self.started,
            span_stack: self.span_stack.clone(),
            total_steps: Arc::clone(&self.total_steps),
            step_attempts: HashMap::new(),
        }
    }

    /// Fork for a loop iteration or parallel sibling. The fork reads the
    /// parent's state as of the fork point and owns its writes; the caller
    /// decides what merges back.
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Store a step result. Duplicate names at the same level are rejected;
    /// once stored, a result never changes for the lifetime of the pipeline.
    pub fn store_result(&mut self, step_name: &str, value: Value) -> EngineResult<()> {
        if self.results.contains_key(step_name) {
            return Err(EngineError::new(
                ErrorKind::DuplicateStepName,
                format!("step '{}' already produced a result", step_name),
            )
            .with_step(step_name)
            .with_chain(self.execution_chain.clone()));
        }
        self.results.insert(step_name.to_string(), value);
        Ok(())
    }

    pub fn get_result(&self, step_name: &str) -> Option<&Value> {
        self.results.get(step_name)
    }

    /// Look up a global, consulting the mutable variable overlay first.
    pub fn global(&self, name: &str) -> Option<&Value> {
        self.variable_state.get(name).or_else(|| self.globals.get(name))
    }

    pub fn globals(&self) -> &Arc<HashMap<String, Value>> {
        &self.globals
    }

    pub fn functions(&self) -> &Arc<HashMap<String, Value>> {
        &self.functions
    }

    pub fn provider_config(&self, provider_id: &str) -> Option<&Value> {
        self.providers.get(provider_id)
    }

    /// Read-only snapshot handed to providers at call time.
    pub fn snapshot_view(&self, step_name: &str) -> ContextView {
        ContextView {
            pipeline_id: self.pipeline_id.clone(),
            step_name: step_name.to_string(),
            trace_id: self.trace_id.clone(),
            nesting_depth: self.nesting_depth,
            inputs: self.inputs.clone(),
        }
    }

    pub fn log(&mut self, step_name: &str, event: &str, detail: Value) {
        self.execution_log.push(LogEntry {
            timestamp: Utc::now(),
            step_name: step_name.to_string(),
            event: event.to_string(),
            detail,
        });
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Count one admitted step; returns the new cumulative total across the
    /// whole root execution.
    pub fn count_step(&self) -> u64 {
        self.total_steps.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn total_steps(&self) -> u64 {
        self.total_steps.load(Ordering::SeqCst)
    }

    pub fn record_attempt(&mut self, step_name: &str) -> u32 {
        let count = self.step_attempts.entry(step_name.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn attempts(&self, step_name: &str) -> u32 {
        self.step_attempts.get(step_name).copied().unwrap_or(0)
    }

    pub fn push_span(&mut self, span_id: String) {
        self.span_stack.push(span_id);
    }

    pub fn pop_span(&mut self) -> Option<String> {
        self.span_stack.pop()
    }

    pub fn current_span(&self) -> Option<&String> {
        self.span_stack.last()
    }
}

fn workflow_metadata(pipeline: &Pipeline, run_id: &str, trace_id: &str) -> HashMap<String, Value> {
    let mut workflow = HashMap::new();
    workflow.insert("name".to_string(), json!(pipeline.name));
    workflow.insert(
        "description".to_string(),
        pipeline.description.clone().map(Value::String).unwrap_or(Value::Null),
    );
    workflow.insert("run_id".to_string(), json!(run_id));
    workflow.insert("trace_id".to_string(), json!(trace_id));
    workflow.insert("started_at".to_string(), json!(Utc::now().to_rfc3339()));
    for (key, value) in &pipeline.defaults {
        workflow.entry(key.clone()).or_insert_with(|| value.clone());
    }
    workflow
}

fn filter_globals(
    globals: &HashMap<String, Value>,
    filter: &GlobalVarFilter,
) -> HashMap<String, Value> {
    globals
        .iter()
        .filter(|(key, _)| match &filter.include {
            Some(include) => include.iter().any(|k| k == *key),
            None => true,
        })
        .filter(|(key, _)| !filter.exclude.iter().any(|k| k == *key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
