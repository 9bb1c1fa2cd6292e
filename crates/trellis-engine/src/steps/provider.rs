//! Provider call steps
//!
//! Renders prompt elements against the context and invokes the opaque
//! `Provider` trait, always under a bounded timeout. The parallel variant
//! fans out N calls against a read-only snapshot taken at fan-out and joins
//! them as an ordered list.

use crate::context::ExecutionContext;
use crate::dispatcher::Dispatcher;
use crate::template::TemplateResolver;
use log::debug;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::timeout;
use trellis_core::config::{PromptElement, ProviderCall, Step};
use trellis_core::error::{EngineError, EngineResult, ErrorKind};
use trellis_core::traits::{Provider, ProviderRequest, ProviderResponse};
use trellis_core::value::{to_display_string, traverse, unwrap_result_envelope};

pub(crate) async fn run_single(
    dispatcher: &Dispatcher,
    step: &Step,
    provider_id: &str,
    options: &HashMap<String, Value>,
    prompt: &[PromptElement],
    ctx: &mut ExecutionContext,
) -> EngineResult<Value> {
    let provider = lookup_provider(dispatcher, provider_id, step, ctx)?;
    let rendered = render_prompt(prompt, ctx).await?;
    let request = ProviderRequest {
        provider_id: provider_id.to_string(),
        options: effective_options(provider_id, options, ctx),
        prompt: rendered,
        context: ctx.snapshot_view(&step.name),
    };

    let limit = call_limit(dispatcher);
    let response = bounded_call(dispatcher, provider, request, limit, step, ctx).await?;

    ctx.log(
        &step.name,
        "provider_response",
        json!({
            "provider": provider_id,
            "model": response.metadata.model,
            "cost": response.metadata.cost,
            "tokens": response.metadata.tokens,
        }),
    );
    Ok(response.payload)
}

pub(crate) async fn run_parallel(
    dispatcher: &Dispatcher,
    step: &Step,
    calls: &[ProviderCall],
    ctx: &mut ExecutionContext,
) -> EngineResult<Value> {
    // Every sibling sees the parent's state as it was at fan-out.
    let snapshot = ctx.fork();
    let limit = call_limit(dispatcher);

    let mut set: JoinSet<(usize, Result<ProviderResponse, EngineError>)> = JoinSet::new();
    for (index, call) in calls.iter().enumerate() {
        let provider = lookup_provider(dispatcher, &call.provider, step, ctx)?;
        let rendered = render_prompt(&call.prompt, &snapshot).await?;
        let request = ProviderRequest {
            provider_id: call.provider.clone(),
            options: effective_options(&call.provider, &call.options, &snapshot),
            prompt: rendered,
            context: snapshot.snapshot_view(&call.name),
        };
        let call_name = call.name.clone();
        let step_name = step.name.clone();
        let chain = ctx.execution_chain.clone();

        set.spawn(async move {
            let outcome = match timeout(limit, provider.call(request)).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(provider_err)) => Err(EngineError::new(
                    ErrorKind::ProviderError,
                    format!("call '{}' failed: {}", call_name, provider_err),
                )
                .with_step(step_name)
                .with_chain(chain)
                .with_details(json!({ "error_kind": provider_err.kind.tag() }))),
                Err(_) => Err(EngineError::new(
                    ErrorKind::ProviderError,
                    format!("call '{}' timed out after {:?}", call_name, limit),
                )
                .with_step(step_name)
                .with_chain(chain)
                .with_details(json!({ "error_kind": "timeout" }))),
            };
            (index, outcome)
        });
    }

    let mut slots: Vec<Option<Result<ProviderResponse, EngineError>>> =
        (0..calls.len()).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        let (index, outcome) =
            joined.map_err(|e| EngineError::internal(format!("parallel join failed: {}", e)))?;
        slots[index] = Some(outcome);
    }

    // Results merge in input order regardless of completion order; the
    // first failure (by input order) wins.
    let mut merged = Vec::with_capacity(calls.len());
    for (call, slot) in calls.iter().zip(slots) {
        let response = slot
            .ok_or_else(|| EngineError::internal("parallel call produced no outcome"))??;
        merged.push(json!({
            "name": call.name,
            "result": response.payload,
        }));
    }
    Ok(Value::Array(merged))
}

fn lookup_provider(
    dispatcher: &Dispatcher,
    provider_id: &str,
    step: &Step,
    ctx: &ExecutionContext,
) -> EngineResult<Arc<dyn Provider>> {
    dispatcher
        .env()
        .providers
        .get(provider_id)
        .cloned()
        .ok_or_else(|| {
            EngineError::internal(format!("no provider registered under '{}'", provider_id))
                .with_step(&step.name)
                .with_chain(ctx.execution_chain.clone())
        })
}

/// Step options resolved against the context, layered over the pipeline's
/// provider configuration.
fn effective_options(
    provider_id: &str,
    options: &HashMap<String, Value>,
    ctx: &ExecutionContext,
) -> HashMap<String, Value> {
    let mut merged: HashMap<String, Value> = match ctx.provider_config(provider_id) {
        Some(Value::Object(base)) => base.clone().into_iter().collect(),
        _ => HashMap::new(),
    };
    for (key, value) in options {
        merged.insert(key.clone(), TemplateResolver::resolve_value(value, ctx));
    }
    merged
}

/// Every provider await is bounded: by the remaining deadline when one is
/// set, otherwise by the safety time budget.
fn call_limit(dispatcher: &Dispatcher) -> Duration {
    dispatcher.env().remaining_time().unwrap_or_else(|| {
        Duration::from_millis(dispatcher.env().safety.limits().timeout_ms)
    })
}

async fn bounded_call(
    dispatcher: &Dispatcher,
    provider: Arc<dyn Provider>,
    request: ProviderRequest,
    limit: Duration,
    step: &Step,
    ctx: &ExecutionContext,
) -> EngineResult<ProviderResponse> {
    match timeout(limit, provider.call(request)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(provider_err)) => Err(EngineError::new(
            ErrorKind::ProviderError,
            provider_err.to_string(),
        )
        .with_step(&step.name)
        .with_chain(ctx.execution_chain.clone())
        .with_details(json!({ "error_kind": provider_err.kind.tag() }))),
        Err(_) => {
            // When the pipeline deadline was the binding constraint this is
            // a cancellation, not a provider timeout, and is not retryable.
            if dispatcher.check_deadline(ctx).is_err() {
                Err(EngineError::new(
                    ErrorKind::Cancelled,
                    format!("provider call in step '{}' cancelled by pipeline deadline", step.name),
                )
                .with_step(&step.name)
                .with_chain(ctx.execution_chain.clone()))
            } else {
                Err(EngineError::new(
                    ErrorKind::ProviderError,
                    format!("provider call in step '{}' timed out after {:?}", step.name, limit),
                )
                .with_step(&step.name)
                .with_chain(ctx.execution_chain.clone())
                .with_details(json!({ "error_kind": "timeout" })))
            }
        }
    }
}

/// Render prompt elements to the final prompt text, joined by blank lines.
pub(crate) async fn render_prompt(
    elements: &[PromptElement],
    ctx: &ExecutionContext,
) -> EngineResult<String> {
    let mut parts = Vec::with_capacity(elements.len());
    for element in elements {
        parts.push(render_element(element, ctx).await?);
    }
    Ok(parts.join("\n\n"))
}

async fn render_element(element: &PromptElement, ctx: &ExecutionContext) -> EngineResult<String> {
    match element {
        PromptElement::Static { content } => Ok(TemplateResolver::resolve_to_string(content, ctx)),
        PromptElement::File { path, vars } => {
            let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
                EngineError::internal(format!(
                    "failed to read prompt file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            // Explicit vars substitute first; the remainder resolves
            // against the context.
            let mut text = raw;
            for (name, value) in vars {
                let resolved = TemplateResolver::resolve_value(value, ctx);
                text = text.replace(
                    &format!("{{{{{}}}}}", name),
                    &to_display_string(&resolved),
                );
            }
            Ok(TemplateResolver::resolve_to_string(&text, ctx))
        }
        PromptElement::PreviousResponse {
            step,
            extract,
            max_length,
            summary,
        } => {
            let stored = ctx.get_result(step).ok_or_else(|| {
                EngineError::new(
                    ErrorKind::PathNotFound,
                    format!("prompt references missing step '{}'", step),
                )
                .with_chain(ctx.execution_chain.clone())
            })?;
            let unwrapped = unwrap_result_envelope(stored);
            let selected = match extract {
                Some(path) => traverse(unwrapped, path).ok_or_else(|| {
                    EngineError::new(
                        ErrorKind::PathNotFound,
                        format!("extract path '{}' not found in result of step '{}'", path, step),
                    )
                    .with_chain(ctx.execution_chain.clone())
                })?,
                None => unwrapped,
            };
            let mut text = to_display_string(selected);
            if let Some(max) = max_length {
                if text.chars().count() > *max {
                    text = text.chars().take(*max).collect();
                    if *summary {
                        text.push_str(" ...");
                    }
                }
            }
            Ok(text)
        }
        PromptElement::SessionContext {
            session_id,
            include_last_n,
        } => {
            // There is no persistent session store; the execution log of the
            // current run stands in as the session transcript.
            let n = include_last_n.unwrap_or(5);
            let tail: Vec<String> = ctx
                .execution_log
                .iter()
                .rev()
                .take(n)
                .map(|entry| format!("{}: {}", entry.step_name, entry.event))
                .collect();
            debug!("rendering session context '{}' from execution log", session_id);
            Ok(format!("[session {}]\n{}", session_id, tail.join("\n")))
        }
        PromptElement::ClaudeContinue { new_prompt } => {
            Ok(TemplateResolver::resolve_to_string(new_prompt, ctx))
        }
    }
}
