//! Aggregate execution metrics, updated by the dispatcher.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub total_pipelines: u64,
    pub successful_pipelines: u64,
    pub failed_pipelines: u64,
    pub total_steps: u64,
    pub successful_steps: u64,
    pub failed_steps: u64,
    pub skipped_steps: u64,
    pub step_type_metrics: HashMap<String, StepTypeMetrics>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StepTypeMetrics {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub retry_count: u64,
}

#[derive(Debug, Default)]
pub struct MetricsRecorder {
    inner: RwLock<ExecutionMetrics>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_pipeline(&self, success: bool) {
        let mut metrics = self.inner.write().await;
        metrics.total_pipelines += 1;
        if success {
            metrics.successful_pipelines += 1;
        } else {
            metrics.failed_pipelines += 1;
        }
    }

    pub async fn record_step(&self, step_type: &str, success: bool, attempts: u32) {
        let mut metrics = self.inner.write().await;
        metrics.total_steps += 1;
        if success {
            metrics.successful_steps += 1;
        } else {
            metrics.failed_steps += 1;
        }

        let by_type = metrics
            .step_type_metrics
            .entry(step_type.to_string())
            .or_default();
        by_type.total_executions += 1;
        by_type.retry_count += attempts.saturating_sub(1) as u64;
        if success {
            by_type.successful_executions += 1;
        } else {
            by_type.failed_executions += 1;
        }
    }

    pub async fn record_skip(&self) {
        let mut metrics = self.inner.write().await;
        metrics.skipped_steps += 1;
    }

    pub async fn snapshot(&self) -> ExecutionMetrics {
        self.inner.read().await.clone()
    }
}
