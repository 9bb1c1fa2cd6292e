//! Switch steps: evaluate an expression and execute the matching branch.

use crate::context::ExecutionContext;
use crate::dispatcher::Dispatcher;
use crate::template::TemplateResolver;
use log::debug;
use serde_json::{json, Value};
use std::collections::HashMap;
use trellis_core::config::Step;
use trellis_core::error::EngineResult;
use trellis_core::value::to_display_string;

pub(crate) async fn run(
    dispatcher: &Dispatcher,
    step: &Step,
    expression: &str,
    cases: &HashMap<String, Vec<Step>>,
    default: &[Step],
    ctx: &mut ExecutionContext,
) -> EngineResult<Value> {
    let selector = TemplateResolver::eval_expression(expression, ctx).unwrap_or(Value::Null);
    let key = to_display_string(&selector);

    let (matched, branch): (Value, &[Step]) = match cases.get(&key) {
        Some(branch) => (json!(key), branch.as_slice()),
        None => {
            debug!("switch '{}': no case for '{}', taking default", step.name, key);
            (Value::Null, default)
        }
    };

    // The chosen branch's steps execute at this pipeline level; their
    // results are stored under their own names.
    dispatcher.run_inner_steps(branch, ctx).await?;

    Ok(json!({
        "matched": matched,
        "value": selector,
        "executed": branch.iter().map(|s| s.name.clone()).collect::<Vec<_>>(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::config::Pipeline;

    #[test]
    fn test_selector_stringification() {
        let mut ctx = ExecutionContext::new_root(&Pipeline::new("p", Vec::new()));
        ctx.store_result("grade", json!({"band": "high"})).unwrap();

        let selector =
            TemplateResolver::eval("steps.grade.result.band", &ctx).unwrap_or(Value::Null);
        assert_eq!(to_display_string(&selector), "high");

        ctx.store_result("score", json!({"value": 3})).unwrap();
        let selector =
            TemplateResolver::eval("steps.score.result.value", &ctx).unwrap_or(Value::Null);
        assert_eq!(to_display_string(&selector), "3");
    }
}
