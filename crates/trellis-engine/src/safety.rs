//! Safety guard
//!
//! Consulted before every step and before every recursion: nesting depth,
//! cycle detection over the execution chain, cumulative step count, and
//! process resource budgets. Soft thresholds produce warnings; hard limits
//! fail the execution. Safety failures are terminal and never retried.

use crate::context::ExecutionContext;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::json;
use trellis_core::config::SafetyLimits;
use trellis_core::error::{EngineError, EngineResult, ErrorKind};

/// A soft-threshold crossing, emitted as an event but not fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyWarning {
    pub resource: String,
    pub current: u64,
    pub limit: u64,
}

pub struct SafetyGuard {
    limits: SafetyLimits,
}

impl SafetyGuard {
    pub fn new(limits: SafetyLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    /// Fails once the context is already at the depth ceiling, i.e. before
    /// a recursion that would exceed it.
    pub fn check_depth(&self, ctx: &ExecutionContext) -> EngineResult<()> {
        if ctx.nesting_depth >= self.limits.max_nesting_depth {
            return Err(EngineError::new(
                ErrorKind::MaxNestingDepthExceeded,
                format!(
                    "nesting depth {} reached the limit of {}",
                    ctx.nesting_depth, self.limits.max_nesting_depth
                ),
            )
            .with_chain(ctx.execution_chain.clone())
            .with_details(json!({
                "current": ctx.nesting_depth,
                "limit": self.limits.max_nesting_depth,
            })));
        }
        Ok(())
    }

    /// Detects a pipeline re-entering its own execution chain.
    pub fn check_cycle(&self, ctx: &ExecutionContext, child_pipeline_id: &str) -> EngineResult<()> {
        if ctx.execution_chain.iter().any(|id| id == child_pipeline_id) {
            let mut chain = ctx.execution_chain.clone();
            chain.push(child_pipeline_id.to_string());
            return Err(EngineError::new(
                ErrorKind::CircularDependency,
                format!(
                    "pipeline '{}' is already executing in this chain",
                    child_pipeline_id
                ),
            )
            .with_chain(chain)
            .with_details(json!({ "offender": child_pipeline_id })));
        }
        Ok(())
    }

    /// Admits one more step against the cumulative ceiling; returns a
    /// warning once the soft threshold is crossed.
    pub fn check_step_count(&self, ctx: &ExecutionContext) -> EngineResult<Option<SafetyWarning>> {
        let total = ctx.count_step();
        if total > self.limits.max_total_steps {
            return Err(EngineError::new(
                ErrorKind::StepCountExceeded,
                format!(
                    "cumulative step count {} exceeded the limit of {}",
                    total, self.limits.max_total_steps
                ),
            )
            .with_chain(ctx.execution_chain.clone())
            .with_details(json!({
                "current": total,
                "limit": self.limits.max_total_steps,
            })));
        }
        Ok(self.soft_warning("steps", total, self.limits.max_total_steps))
    }

    /// Checks memory and elapsed time against the configured budgets.
    pub fn check_resources(&self, ctx: &ExecutionContext) -> EngineResult<Vec<SafetyWarning>> {
        let mut warnings = Vec::new();

        if let Some(rss) = process_memory_bytes() {
            if rss > self.limits.memory_limit_bytes {
                return Err(EngineError::new(
                    ErrorKind::MemoryExceeded,
                    format!(
                        "process memory {} bytes exceeded the limit of {} bytes",
                        rss, self.limits.memory_limit_bytes
                    ),
                )
                .with_chain(ctx.execution_chain.clone())
                .with_details(json!({
                    "current": rss,
                    "limit": self.limits.memory_limit_bytes,
                })));
            }
            if let Some(warning) = self.soft_warning("memory", rss, self.limits.memory_limit_bytes) {
                warnings.push(warning);
            }
        }

        let elapsed = ctx.elapsed_ms();
        if elapsed > self.limits.timeout_ms {
            return Err(EngineError::new(
                ErrorKind::Timeout,
                format!(
                    "execution time {} ms exceeded the limit of {} ms",
                    elapsed, self.limits.timeout_ms
                ),
            )
            .with_chain(ctx.execution_chain.clone())
            .with_details(json!({
                "current": elapsed,
                "limit": self.limits.timeout_ms,
            })));
        }
        if let Some(warning) = self.soft_warning("time", elapsed, self.limits.timeout_ms) {
            warnings.push(warning);
        }

        Ok(warnings)
    }

    /// Root-to-current chain used by error formatting.
    pub fn chain(ctx: &ExecutionContext) -> Vec<String> {
        ctx.execution_chain.clone()
    }

    fn soft_warning(&self, resource: &str, current: u64, limit: u64) -> Option<SafetyWarning> {
        let threshold = (limit as f64 * self.limits.warning_threshold) as u64;
        if current >= threshold && current <= limit {
            warn!(
                "{} usage {} is above {:.0}% of the limit {}",
                resource,
                current,
                self.limits.warning_threshold * 100.0,
                limit
            );
            Some(SafetyWarning {
                resource: resource.to_string(),
                current,
                limit,
            })
        } else {
            None
        }
    }
}

/// Resident set size of the current process, when the platform exposes it.
#[cfg(target_os = "linux")]
fn process_memory_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
fn process_memory_bytes() -> Option<u64> {
    None
}
