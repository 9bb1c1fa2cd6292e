//! Static pipeline validation
//!
//! Checked once before execution starts: step names must be unique within
//! their containing step list, nested steps must name a child pipeline,
//! retry policies and timeout strings must be well formed, and declared
//! output schemas must use known type names. Catching these early keeps
//! runtime failures for runtime problems.

use std::collections::HashSet;
use trellis_core::config::{parse_duration, Pipeline, Step, StepKind};
use trellis_core::error::{EngineError, EngineResult};

pub fn validate_pipeline(pipeline: &Pipeline) -> EngineResult<()> {
    if pipeline.name.trim().is_empty() {
        return Err(EngineError::internal("pipeline name must not be empty"));
    }
    if pipeline.steps.is_empty() {
        return Err(EngineError::internal(format!(
            "pipeline '{}' declares no steps",
            pipeline.name
        )));
    }
    validate_steps(&pipeline.name, &pipeline.steps)
}

fn validate_steps(pipeline_name: &str, steps: &[Step]) -> EngineResult<()> {
    let mut seen = HashSet::new();
    for step in steps {
        if step.name.trim().is_empty() {
            return Err(EngineError::internal(format!(
                "pipeline '{}' contains a step with an empty name",
                pipeline_name
            )));
        }
        if !seen.insert(step.name.as_str()) {
            return Err(EngineError::internal(format!(
                "step name '{}' appears twice in pipeline '{}'",
                step.name, pipeline_name
            ))
            .with_step(&step.name));
        }
        validate_step(pipeline_name, step)?;
    }
    Ok(())
}

fn validate_step(pipeline_name: &str, step: &Step) -> EngineResult<()> {
    if let Some(timeout) = &step.timeout {
        parse_duration(timeout).map_err(|e| {
            EngineError::internal(format!(
                "step '{}' has an invalid timeout '{}': {}",
                step.name, timeout, e
            ))
            .with_step(&step.name)
        })?;
    }

    if let Some(policy) = &step.retry {
        if policy.max_delay_ms < policy.base_delay_ms {
            return Err(EngineError::internal(format!(
                "step '{}' caps retry delay at {} ms, below the base delay {} ms",
                step.name, policy.max_delay_ms, policy.base_delay_ms
            ))
            .with_step(&step.name));
        }
    }

    if let Some(schema) = &step.output_schema {
        validate_schema_types(&step.name, schema)?;
    }

    match &step.kind {
        StepKind::Pipeline {
            pipeline_ref,
            pipeline_file,
            pipeline,
            ..
        } => {
            if pipeline_ref.is_none() && pipeline_file.is_none() && pipeline.is_none() {
                return Err(EngineError::internal(format!(
                    "nested step '{}' names no pipeline (expected pipeline_ref, pipeline_file or an inline pipeline)",
                    step.name
                ))
                .with_step(&step.name));
            }
            if let Some(inline) = pipeline {
                validate_pipeline(inline)?;
            }
        }
        StepKind::ForEach { steps, iterator, .. } => {
            if iterator.trim().is_empty() {
                return Err(EngineError::internal(format!(
                    "for_each step '{}' declares an empty iterator name",
                    step.name
                ))
                .with_step(&step.name));
            }
            validate_steps(pipeline_name, steps)?;
        }
        StepKind::While {
            steps,
            max_iterations,
            ..
        } => {
            if *max_iterations == 0 {
                return Err(EngineError::internal(format!(
                    "while step '{}' allows zero iterations",
                    step.name
                ))
                .with_step(&step.name));
            }
            validate_steps(pipeline_name, steps)?;
        }
        StepKind::Switch { cases, default, .. } => {
            for branch in cases.values() {
                validate_steps(pipeline_name, branch)?;
            }
            validate_steps(pipeline_name, default)?;
        }
        StepKind::Provider { provider, .. } => {
            if provider.trim().is_empty() {
                return Err(EngineError::internal(format!(
                    "provider step '{}' names no provider",
                    step.name
                ))
                .with_step(&step.name));
            }
        }
        StepKind::ParallelProvider { calls } => {
            if calls.is_empty() {
                return Err(EngineError::internal(format!(
                    "parallel provider step '{}' declares no calls",
                    step.name
                ))
                .with_step(&step.name));
            }
            let mut names = HashSet::new();
            for call in calls {
                if !names.insert(call.name.as_str()) {
                    return Err(EngineError::internal(format!(
                        "parallel provider step '{}' repeats call name '{}'",
                        step.name, call.name
                    ))
                    .with_step(&step.name));
                }
            }
        }
        StepKind::Transform { operations, .. } => {
            if operations.is_empty() {
                return Err(EngineError::internal(format!(
                    "transform step '{}' declares no operations",
                    step.name
                ))
                .with_step(&step.name));
            }
        }
        StepKind::SetVariable { .. } | StepKind::Checkpoint {} | StepKind::FileOps { .. } => {}
    }
    Ok(())
}

const KNOWN_SCHEMA_TYPES: [&str; 7] = [
    "object", "array", "string", "number", "integer", "boolean", "null",
];

fn validate_schema_types(step_name: &str, schema: &serde_json::Value) -> EngineResult<()> {
    match schema {
        serde_json::Value::Object(map) => {
            if let Some(declared) = map.get("type") {
                let names: Vec<&str> = match declared {
                    serde_json::Value::String(s) => vec![s.as_str()],
                    serde_json::Value::Array(items) => {
                        items.iter().filter_map(|v| v.as_str()).collect()
                    }
                    _ => Vec::new(),
                };
                for name in names {
                    if !KNOWN_SCHEMA_TYPES.contains(&name) {
                        return Err(EngineError::internal(format!(
                            "step '{}' schema uses unknown type '{}'",
                            step_name, name
                        ))
                        .with_step(step_name));
                    }
                }
            }
            for value in map.values() {
                validate_schema_types(step_name, value)?;
            }
            Ok(())
        }
        serde_json::Value::Array(items) => {
            for item in items {
                validate_schema_types(step_name, item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
