//! Explicit checkpoint marker steps.

use crate::context::ExecutionContext;
use crate::dispatcher::Dispatcher;
use serde_json::{json, Value};
use trellis_core::error::{EngineError, EngineResult};

pub(crate) async fn run(
    dispatcher: &Dispatcher,
    ctx: &mut ExecutionContext,
) -> EngineResult<Value> {
    match &dispatcher.env().checkpoints {
        Some(manager) => {
            let path = manager.write(ctx).await?;
            Ok(json!({
                "checkpointed": true,
                "path": path.display().to_string(),
                "step_index": ctx.step_index,
            }))
        }
        None => Err(EngineError::internal(
            "checkpoint step requires a checkpoint directory",
        )
        .with_chain(ctx.execution_chain.clone())),
    }
}
