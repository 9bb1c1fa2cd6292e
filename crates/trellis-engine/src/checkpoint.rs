//! Checkpointing
//!
//! Snapshots the results map after completed steps so a crashed execution
//! can resume. Layout: `<checkpoint_dir>/<pipeline_id>/<N>.json` with
//! `latest.json` as a pointer to the newest snapshot. Every write lands in
//! a temp file, is fsynced, then renamed into place; a crash mid-write can
//! never leave `latest.json` pointing at a partial file.

use crate::context::ExecutionContext;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use trellis_core::config::Pipeline;
use trellis_core::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub pipeline_id: String,
    pub step_index: usize,
    pub results: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LatestPointer {
    file: String,
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    directory: PathBuf,
}

impl CheckpointManager {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn pipeline_dir(&self, pipeline_id: &str) -> PathBuf {
        self.directory.join(pipeline_id)
    }

    /// Write a snapshot of the context and atomically repoint `latest.json`.
    pub async fn write(&self, ctx: &ExecutionContext) -> EngineResult<PathBuf> {
        let dir = self.pipeline_dir(&ctx.pipeline_id);
        tokio::fs::create_dir_all(&dir).await?;

        let checkpoint = Checkpoint {
            pipeline_id: ctx.pipeline_id.clone(),
            step_index: ctx.step_index,
            results: ctx.results.clone(),
            timestamp: Utc::now(),
        };

        let sequence = next_sequence(&dir).await?;
        let file_name = format!("{}.json", sequence);
        let target = dir.join(&file_name);

        write_atomic(&target, &serde_json::to_vec_pretty(&checkpoint)?).await?;

        let pointer = LatestPointer { file: file_name };
        write_atomic(&dir.join("latest.json"), &serde_json::to_vec(&pointer)?).await?;

        debug!(
            "checkpoint {} written for pipeline {} at step {}",
            sequence, ctx.pipeline_id, ctx.step_index
        );
        Ok(target)
    }

    /// Read the newest checkpoint, if any exists.
    pub async fn read_latest(&self, pipeline_id: &str) -> EngineResult<Option<Checkpoint>> {
        let dir = self.pipeline_dir(pipeline_id);
        let pointer_path = dir.join("latest.json");
        if !pointer_path.exists() {
            return Ok(None);
        }

        let pointer_bytes = tokio::fs::read(&pointer_path).await?;
        let pointer: LatestPointer = serde_json::from_slice(&pointer_bytes)?;

        let target = dir.join(&pointer.file);
        let bytes = tokio::fs::read(&target).await.map_err(|e| {
            EngineError::internal(format!(
                "latest pointer references unreadable checkpoint {}: {}",
                target.display(),
                e
            ))
        })?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)?;
        Ok(Some(checkpoint))
    }

    /// Rebuild a context from a checkpoint. Only `results` and `step_index`
    /// are restored; the execution log starts fresh.
    pub fn resume(&self, pipeline: &Pipeline, checkpoint: &Checkpoint) -> ExecutionContext {
        let mut ctx = ExecutionContext::new_root(pipeline);
        ctx.results = checkpoint.results.clone();
        ctx.step_index = checkpoint.step_index;
        ctx
    }
}

/// Next numeric sequence in a checkpoint directory.
async fn next_sequence(dir: &Path) -> EngineResult<u64> {
    let mut max = 0u64;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(".json") {
            if let Ok(n) = stem.parse::<u64>() {
                max = max.max(n);
            }
        }
    }
    Ok(max + 1)
}

/// Write bytes to a sibling temp file, fsync, then rename into place.
async fn write_atomic(target: &Path, bytes: &[u8]) -> EngineResult<()> {
    let tmp = target.with_extension("json.tmp");
    {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
    }
    tokio::fs::rename(&tmp, target).await?;
    Ok(())
}
