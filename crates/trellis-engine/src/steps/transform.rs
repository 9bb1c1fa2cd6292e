//! Data-transform steps: filter, aggregate and join over a context value.

use crate::context::ExecutionContext;
use crate::template::TemplateResolver;
use serde_json::Value;
use trellis_core::config::{AggregateFn, CompareOp, Step, TransformOp};
use trellis_core::error::{EngineError, EngineResult};
use trellis_core::value::{as_number, number_value, to_display_string, traverse};

pub(crate) fn run(
    step: &Step,
    input: &str,
    operations: &[TransformOp],
    ctx: &ExecutionContext,
) -> EngineResult<Value> {
    let mut current = TemplateResolver::resolve(input, ctx);

    for operation in operations {
        current = match operation {
            TransformOp::Filter {
                field,
                compare,
                value,
            } => apply_filter(step, &current, field, *compare, value, ctx)?,
            TransformOp::Aggregate { function, field } => {
                apply_aggregate(step, &current, *function, field.as_deref())?
            }
            TransformOp::Join { separator } => apply_join(step, &current, separator)?,
        };
    }
    Ok(current)
}

fn apply_filter(
    step: &Step,
    current: &Value,
    field: &str,
    compare: CompareOp,
    target: &Value,
    ctx: &ExecutionContext,
) -> EngineResult<Value> {
    let items = as_array(step, current, "filter")?;
    let target = match target {
        Value::String(s) => TemplateResolver::resolve(s, ctx),
        other => other.clone(),
    };

    let kept = items
        .iter()
        .filter(|item| {
            let actual = if field.is_empty() {
                Some(*item)
            } else {
                traverse(item, field)
            };
            match actual {
                Some(actual) => matches(actual, compare, &target),
                None => false,
            }
        })
        .cloned()
        .collect();
    Ok(Value::Array(kept))
}

fn matches(actual: &Value, compare: CompareOp, target: &Value) -> bool {
    match compare {
        CompareOp::Eq => actual == target,
        CompareOp::Ne => actual != target,
        CompareOp::Gt => match (as_number(actual), as_number(target)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        CompareOp::Lt => match (as_number(actual), as_number(target)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        CompareOp::Contains => match (actual, target) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.contains(needle),
            _ => false,
        },
    }
}

fn apply_aggregate(
    step: &Step,
    current: &Value,
    function: AggregateFn,
    field: Option<&str>,
) -> EngineResult<Value> {
    let items = as_array(step, current, "aggregate")?;

    if function == AggregateFn::Count {
        return Ok(Value::from(items.len() as u64));
    }

    let numbers: Vec<f64> = items
        .iter()
        .filter_map(|item| {
            let target = match field {
                Some(field) => traverse(item, field)?,
                None => item,
            };
            as_number(target)
        })
        .collect();

    if numbers.is_empty() {
        return Ok(Value::Null);
    }

    let result = match function {
        AggregateFn::Sum => numbers.iter().sum(),
        AggregateFn::Avg => numbers.iter().sum::<f64>() / numbers.len() as f64,
        AggregateFn::Min => numbers.iter().cloned().fold(f64::INFINITY, f64::min),
        AggregateFn::Max => numbers.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        AggregateFn::Count => unreachable!(),
    };
    Ok(number_value(result))
}

fn apply_join(step: &Step, current: &Value, separator: &str) -> EngineResult<Value> {
    let items = as_array(step, current, "join")?;
    let joined = items
        .iter()
        .map(to_display_string)
        .collect::<Vec<_>>()
        .join(separator);
    Ok(Value::String(joined))
}

fn as_array<'a>(step: &Step, value: &'a Value, operation: &str) -> EngineResult<&'a Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        _ => Err(EngineError::internal(format!(
            "{} operation requires an array input",
            operation
        ))
        .with_step(&step.name)),
    }
}
