//! File operation steps
//!
//! Copy, move, delete, validate, list and convert files under the workspace
//! directory. Paths resolve templates against the context first; relative
//! paths are anchored at the workspace.

use crate::context::ExecutionContext;
use crate::dispatcher::Dispatcher;
use crate::template::TemplateResolver;
use log::debug;
use serde_json::{json, Value};
use std::path::PathBuf;
use trellis_core::config::{ConvertFormat, FileOperation, Step};
use trellis_core::error::{EngineError, EngineResult};

pub(crate) async fn run(
    dispatcher: &Dispatcher,
    step: &Step,
    operations: &[FileOperation],
    ctx: &mut ExecutionContext,
) -> EngineResult<Value> {
    let mut summaries = Vec::with_capacity(operations.len());
    for operation in operations {
        let summary = apply(dispatcher, step, operation, ctx)
            .await
            .map_err(|e| e.with_step(&step.name).with_chain(ctx.execution_chain.clone()))?;
        summaries.push(summary);
    }
    Ok(Value::Array(summaries))
}

async fn apply(
    dispatcher: &Dispatcher,
    step: &Step,
    operation: &FileOperation,
    ctx: &ExecutionContext,
) -> EngineResult<Value> {
    match operation {
        FileOperation::Copy { from, to } => {
            let from = resolve_path(dispatcher, from, ctx);
            let to = resolve_path(dispatcher, to, ctx);
            ensure_parent(&to).await?;
            let bytes = tokio::fs::copy(&from, &to).await.map_err(|e| {
                EngineError::internal(format!(
                    "copy {} -> {} failed: {}",
                    from.display(),
                    to.display(),
                    e
                ))
            })?;
            Ok(json!({"op": "copy", "from": from.display().to_string(),
                       "to": to.display().to_string(), "bytes": bytes}))
        }
        FileOperation::Move { from, to } => {
            let from = resolve_path(dispatcher, from, ctx);
            let to = resolve_path(dispatcher, to, ctx);
            ensure_parent(&to).await?;
            tokio::fs::rename(&from, &to).await.map_err(|e| {
                EngineError::internal(format!(
                    "move {} -> {} failed: {}",
                    from.display(),
                    to.display(),
                    e
                ))
            })?;
            Ok(json!({"op": "move", "from": from.display().to_string(),
                       "to": to.display().to_string()}))
        }
        FileOperation::Delete { path } => {
            let path = resolve_path(dispatcher, path, ctx);
            let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
                EngineError::internal(format!("delete {} failed: {}", path.display(), e))
            })?;
            if metadata.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
            Ok(json!({"op": "delete", "path": path.display().to_string()}))
        }
        FileOperation::Validate {
            path,
            must_exist,
            min_size,
        } => {
            let path = resolve_path(dispatcher, path, ctx);
            let metadata = tokio::fs::metadata(&path).await.ok();
            match (&metadata, must_exist) {
                (None, true) => {
                    return Err(EngineError::internal(format!(
                        "required file {} does not exist",
                        path.display()
                    )));
                }
                _ => {}
            }
            if let (Some(metadata), Some(min)) = (&metadata, min_size) {
                if metadata.len() < *min {
                    return Err(EngineError::internal(format!(
                        "file {} is {} bytes, below the required {}",
                        path.display(),
                        metadata.len(),
                        min
                    )));
                }
            }
            Ok(json!({
                "op": "validate",
                "path": path.display().to_string(),
                "exists": metadata.is_some(),
                "size": metadata.map(|m| m.len()),
            }))
        }
        FileOperation::List { dir, extension } => {
            let dir = resolve_path(dispatcher, dir, ctx);
            let mut names = Vec::new();
            let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
                EngineError::internal(format!("list {} failed: {}", dir.display(), e))
            })?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let keep = match extension {
                    Some(ext) => name.ends_with(&format!(".{}", ext.trim_start_matches('.'))),
                    None => true,
                };
                if keep {
                    names.push(name);
                }
            }
            names.sort();
            Ok(json!({"op": "list", "dir": dir.display().to_string(), "entries": names}))
        }
        FileOperation::Convert { from, to, format } => {
            let from = resolve_path(dispatcher, from, ctx);
            let to = resolve_path(dispatcher, to, ctx);
            let raw = tokio::fs::read_to_string(&from).await.map_err(|e| {
                EngineError::internal(format!("read {} failed: {}", from.display(), e))
            })?;
            // YAML parsing accepts JSON input too, so one parse covers both
            // source formats.
            let parsed: Value = serde_yaml::from_str(&raw).map_err(|e| {
                EngineError::internal(format!("parse {} failed: {}", from.display(), e))
            })?;
            let converted = match format {
                ConvertFormat::Json => serde_json::to_string_pretty(&parsed)?,
                ConvertFormat::Yaml => serde_yaml::to_string(&parsed).map_err(|e| {
                    EngineError::internal(format!("yaml serialization failed: {}", e))
                })?,
            };
            ensure_parent(&to).await?;
            tokio::fs::write(&to, converted).await?;
            debug!("converted {} -> {} for step {}", from.display(), to.display(), step.name);
            Ok(json!({"op": "convert", "from": from.display().to_string(),
                       "to": to.display().to_string()}))
        }
    }
}

fn resolve_path(dispatcher: &Dispatcher, template: &str, ctx: &ExecutionContext) -> PathBuf {
    let resolved = TemplateResolver::resolve_to_string(template, ctx);
    let path = PathBuf::from(&resolved);
    match &dispatcher.env().workspace_dir {
        Some(base) if path.is_relative() => base.join(path),
        _ => path,
    }
}

async fn ensure_parent(path: &PathBuf) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}
