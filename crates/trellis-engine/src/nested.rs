//! Nested pipeline execution
//!
//! Resolves the child pipeline definition, builds a child context
//! (inherited or isolated), maps inputs against the parent, recurses
//! through the dispatcher, and extracts outputs per the step's output
//! spec. Nothing from the child is visible to the parent except through
//! that extraction.

use crate::context::ExecutionContext;
use crate::dispatcher::Dispatcher;
use crate::template::TemplateResolver;
use log::debug;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use trellis_core::config::{NestedConfig, OutputMapping, Pipeline, Step};
use trellis_core::error::{EngineError, EngineResult, ErrorKind};
use trellis_core::value::{traverse, unwrap_result_envelope};

#[allow(clippy::too_many_arguments)]
pub(crate) async fn run(
    dispatcher: &Dispatcher,
    step: &Step,
    pipeline_ref: Option<&str>,
    pipeline_file: Option<&Path>,
    inline: Option<&Pipeline>,
    inputs: &HashMap<String, Value>,
    outputs: &[OutputMapping],
    config: &NestedConfig,
    ctx: &mut ExecutionContext,
) -> EngineResult<Value> {
    let child_pipeline = dispatcher
        .env()
        .registry
        .resolve(
            &step.name,
            pipeline_ref,
            pipeline_file,
            inline,
            dispatcher.env().workspace_dir.as_deref(),
        )
        .await?;

    // Referenced and file-loaded children were never seen by the facade,
    // so preconditions are checked here before any child step executes.
    crate::validate::validate_pipeline(&child_pipeline)?;
    dispatcher.env().safety.check_cycle(ctx, &child_pipeline.name)?;
    dispatcher.env().safety.check_depth(ctx)?;

    let mut child_ctx = ctx.child(
        &child_pipeline,
        config.inherit_context,
        config.inheritance.as_ref(),
    );

    // Inputs resolve against the PARENT context, so templates like
    // {{steps.prep.result.value}} refer to the parent's results. When
    // inheriting with no explicit inputs, the parent's inputs carry through.
    if inputs.is_empty() && config.inherit_context {
        child_ctx.inputs = ctx.inputs.clone();
    } else {
        for (key, template) in inputs {
            let resolved = TemplateResolver::resolve_value(template, ctx);
            child_ctx.inputs.insert(key.clone(), resolved);
        }
    }

    debug!(
        "entering nested pipeline '{}' at depth {} (chain: {})",
        child_pipeline.name,
        child_ctx.nesting_depth,
        child_ctx.execution_chain.join(" -> ")
    );

    let child_chain = child_ctx.execution_chain.clone();
    let child_results = dispatcher
        .run_pipeline(&child_pipeline, &mut child_ctx)
        .await
        .map_err(|e| {
            // Failures below already carry the child's full chain, which
            // includes every ancestor of this step.
            e.ensure_chain(child_chain)
                .annotate("nested_step", Value::String(step.name.clone()))
        })?;

    extract_outputs(&step.name, &child_results, outputs, &child_ctx)
}

/// Extract the parent-visible result from the child's results map.
fn extract_outputs(
    step_name: &str,
    child_results: &HashMap<String, Value>,
    outputs: &[OutputMapping],
    child_ctx: &ExecutionContext,
) -> EngineResult<Value> {
    // No spec: every child result, unwrapped, keyed by child step name.
    if outputs.is_empty() {
        let map: Map<String, Value> = child_results
            .iter()
            .map(|(name, value)| (name.clone(), unwrap_result_envelope(value).clone()))
            .collect();
        return Ok(Value::Object(map));
    }

    let mut extracted = Map::new();
    for mapping in outputs {
        match mapping {
            OutputMapping::Name(name) => {
                let value = child_results.get(name).ok_or_else(|| {
                    EngineError::new(
                        ErrorKind::PathNotFound,
                        format!("child pipeline produced no result named '{}'", name),
                    )
                    .with_step(step_name)
                    .with_chain(child_ctx.execution_chain.clone())
                })?;
                extracted.insert(name.clone(), unwrap_result_envelope(value).clone());
            }
            OutputMapping::Path {
                path,
                alias,
                optional,
            } => {
                let (head, rest) = match path.split_once('.') {
                    Some((head, rest)) => (head, Some(rest)),
                    None => (path.as_str(), None),
                };
                let root = child_results.get(head).map(unwrap_result_envelope);
                let value = match (root, rest) {
                    (Some(root), Some(rest)) => traverse(root, rest).cloned(),
                    (Some(root), None) => Some(root.clone()),
                    (None, _) => None,
                };
                match value {
                    Some(value) => {
                        extracted.insert(alias.clone(), value);
                    }
                    None if *optional => {
                        extracted.insert(alias.clone(), Value::Null);
                    }
                    None => {
                        return Err(EngineError::new(
                            ErrorKind::PathNotFound,
                            format!("output path '{}' not found in child results", path),
                        )
                        .with_step(step_name)
                        .with_chain(child_ctx.execution_chain.clone()));
                    }
                }
            }
        }
    }
    Ok(Value::Object(extracted))
}
