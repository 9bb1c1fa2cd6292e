//! Set-variable steps: resolve values and write them into the mutable
//! variable state. The shared globals themselves are never mutated.

use crate::context::ExecutionContext;
use crate::dispatcher::Dispatcher;
use crate::events::{EventType, ExecutionEvent};
use crate::template::TemplateResolver;
use serde_json::{Map, Value};
use std::collections::HashMap;
use trellis_core::config::Step;
use trellis_core::error::EngineResult;

pub(crate) async fn run(
    dispatcher: &Dispatcher,
    step: &Step,
    variables: &HashMap<String, Value>,
    ctx: &mut ExecutionContext,
) -> EngineResult<Value> {
    let mut written = Map::new();
    for (name, template) in variables {
        let resolved = TemplateResolver::resolve_value(template, ctx);
        ctx.variable_state.insert(name.clone(), resolved.clone());
        written.insert(name.clone(), resolved.clone());

        dispatcher
            .env()
            .events
            .emit(
                ExecutionEvent::new(EventType::VariableSet, &ctx.run_id, &ctx.pipeline_id)
                    .with_step(&step.name)
                    .with_data("name", Value::String(name.clone()))
                    .with_data("value", resolved),
            )
            .await;
    }
    Ok(Value::Object(written))
}
