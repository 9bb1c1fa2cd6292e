//! Loop steps
//!
//! `for_each` iterates a data source, binding the iterator name into the
//! child inputs for each item; `while` re-checks its condition against the
//! updated context every iteration up to a ceiling. Each iteration runs on
//! a fork so inner step names never collide across iterations; only the
//! variable state carries forward, and only the aggregate result reaches
//! the parent.

use crate::context::ExecutionContext;
use crate::dispatcher::Dispatcher;
use crate::template::TemplateResolver;
use log::debug;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use trellis_core::config::Step;
use trellis_core::error::{EngineError, EngineResult};

const DEFAULT_MAX_PARALLEL: usize = 4;

#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_for_each(
    dispatcher: &Dispatcher,
    step: &Step,
    iterator: &str,
    data_source: &str,
    inner: &[Step],
    parallel: bool,
    max_parallel: Option<usize>,
    ctx: &mut ExecutionContext,
) -> EngineResult<Value> {
    let items = resolve_items(step, data_source, ctx)?;
    debug!(
        "for_each '{}': {} item(s), parallel={}",
        step.name,
        items.len(),
        parallel
    );

    if parallel {
        run_parallel_iterations(dispatcher, step, iterator, inner, items, max_parallel, ctx).await
    } else {
        run_sequential_iterations(dispatcher, iterator, inner, items, ctx).await
    }
}

async fn run_sequential_iterations(
    dispatcher: &Dispatcher,
    iterator: &str,
    inner: &[Step],
    items: Vec<Value>,
    ctx: &mut ExecutionContext,
) -> EngineResult<Value> {
    let mut carried_state = ctx.variable_state.clone();
    let mut collected = Vec::with_capacity(items.len());

    for item in items {
        let mut iteration_ctx = ctx.fork();
        iteration_ctx.variable_state = carried_state.clone();
        iteration_ctx.inputs.insert(iterator.to_string(), item.clone());

        dispatcher.run_inner_steps(inner, &mut iteration_ctx).await?;

        collected.push(iteration_result(&item, inner, &iteration_ctx));
        carried_state = iteration_ctx.variable_state;
    }

    // Sequential iterations feed variable updates back to the parent.
    ctx.variable_state = carried_state;
    Ok(Value::Array(collected))
}

async fn run_parallel_iterations(
    dispatcher: &Dispatcher,
    step: &Step,
    iterator: &str,
    inner: &[Step],
    items: Vec<Value>,
    max_parallel: Option<usize>,
    ctx: &mut ExecutionContext,
) -> EngineResult<Value> {
    let bound = max_parallel.unwrap_or(DEFAULT_MAX_PARALLEL).max(1);
    let semaphore = Arc::new(Semaphore::new(bound));
    let mut set: JoinSet<(usize, EngineResult<Value>)> = JoinSet::new();

    for (index, item) in items.iter().enumerate() {
        // Each iteration receives its own fork of the parent as it was at
        // fan-out; no sibling sees any other's writes.
        let mut iteration_ctx = ctx.fork();
        iteration_ctx.inputs.insert(iterator.to_string(), item.clone());

        let dispatcher = dispatcher.clone();
        let inner_steps: Vec<Step> = inner.to_vec();
        let semaphore = Arc::clone(&semaphore);
        let item = item.clone();

        set.spawn(async move {
            let outcome = async {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| EngineError::internal(format!("semaphore closed: {}", e)))?;
                dispatcher
                    .run_inner_steps(&inner_steps, &mut iteration_ctx)
                    .await?;
                Ok(iteration_result(&item, &inner_steps, &iteration_ctx))
            }
            .await;
            (index, outcome)
        });
    }

    let mut slots: Vec<Option<EngineResult<Value>>> = (0..items.len()).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        let (index, outcome) =
            joined.map_err(|e| EngineError::internal(format!("iteration join failed: {}", e)))?;
        slots[index] = Some(outcome);
    }

    // Collected in input order regardless of completion order.
    let mut collected = Vec::with_capacity(slots.len());
    for slot in slots {
        match slot {
            Some(Ok(value)) => collected.push(value),
            Some(Err(e)) => return Err(e.with_step(&step.name)),
            None => return Err(EngineError::internal("iteration produced no outcome")),
        }
    }
    Ok(Value::Array(collected))
}

pub(crate) async fn run_while(
    dispatcher: &Dispatcher,
    step: &Step,
    condition: &str,
    max_iterations: u64,
    inner: &[Step],
    ctx: &mut ExecutionContext,
) -> EngineResult<Value> {
    let mut carried_state = ctx.variable_state.clone();
    let mut iterations: u64 = 0;
    let mut collected = Vec::new();

    loop {
        if iterations >= max_iterations {
            debug!(
                "while '{}' stopped at the iteration ceiling {}",
                step.name, max_iterations
            );
            break;
        }

        // The condition is re-checked against the updated context.
        let mut probe = ctx.fork();
        probe.variable_state = carried_state.clone();
        if !TemplateResolver::truthy(condition, &probe) {
            break;
        }

        let mut iteration_ctx = probe;
        iteration_ctx
            .inputs
            .insert("iteration".to_string(), json!(iterations));
        dispatcher.run_inner_steps(inner, &mut iteration_ctx).await?;

        collected.push(iteration_result(&json!(iterations), inner, &iteration_ctx));
        carried_state = iteration_ctx.variable_state;
        iterations += 1;
    }

    ctx.variable_state = carried_state;
    Ok(json!({
        "iterations": iterations,
        "results": collected,
    }))
}

/// Per-iteration summary: the item plus every inner step's result.
fn iteration_result(item: &Value, inner: &[Step], iteration_ctx: &ExecutionContext) -> Value {
    let mut results = Map::new();
    for step in inner {
        if let Some(value) = iteration_ctx.get_result(&step.name) {
            results.insert(step.name.clone(), value.clone());
        }
    }
    json!({
        "item": item,
        "results": Value::Object(results),
    })
}

/// A data source resolves to an array directly, or to a comma-separated
/// string that is split and trimmed.
fn resolve_items(step: &Step, data_source: &str, ctx: &ExecutionContext) -> EngineResult<Vec<Value>> {
    match TemplateResolver::resolve(data_source, ctx) {
        Value::Array(items) => Ok(items),
        Value::String(s) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| Value::String(part.to_string()))
            .collect()),
        other => Err(EngineError::internal(format!(
            "data source '{}' resolved to {} (expected array or string)",
            data_source,
            match other {
                Value::Null => "null",
                Value::Bool(_) => "a boolean",
                Value::Number(_) => "a number",
                _ => "an object",
            }
        ))
        .with_step(&step.name)
        .with_chain(ctx.execution_chain.clone())),
    }
}
