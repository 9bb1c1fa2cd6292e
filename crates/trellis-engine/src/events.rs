//! Execution events
//!
//! The engine emits structured events on a sink interface; callers plug in
//! any observer. There is no long-running monitor inside the engine, and a
//! failing listener never fails the pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    PipelineStarted,
    PipelineCompleted,
    PipelineFailed,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepSkipped,
    StepRetrying,
    SafetyWarning,
    CheckpointWritten,
    VariableSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub pipeline_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default)]
    pub data: HashMap<String, Value>,
}

impl ExecutionEvent {
    pub fn new(event_type: EventType, run_id: &str, pipeline_id: &str) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            run_id: run_id.to_string(),
            pipeline_id: pipeline_id.to_string(),
            step_name: None,
            data: HashMap::new(),
        }
    }

    pub fn with_step(mut self, step_name: &str) -> Self {
        self.step_name = Some(step_name.to_string());
        self
    }

    pub fn with_data(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }
}

#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &ExecutionEvent) -> anyhow::Result<()>;
}

/// Fan-out to every registered listener. Listener failures are logged and
/// swallowed so observability never breaks execution.
#[derive(Default, Clone)]
pub struct EventBus {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: Arc<dyn EventListener>) {
        self.listeners.push(listener);
    }

    pub async fn emit(&self, event: ExecutionEvent) {
        for listener in &self.listeners {
            if let Err(e) = listener.on_event(&event).await {
                warn!("event listener failed: {}", e);
            }
        }
    }
}

/// Forwards events to the `log` facade.
pub struct LogListener;

#[async_trait]
impl EventListener for LogListener {
    async fn on_event(&self, event: &ExecutionEvent) -> anyhow::Result<()> {
        match event.event_type {
            EventType::PipelineFailed | EventType::StepFailed => warn!(
                "[{}] {:?} step={:?} data={:?}",
                event.pipeline_id, event.event_type, event.step_name, event.data
            ),
            EventType::PipelineStarted | EventType::PipelineCompleted => info!(
                "[{}] {:?} run={}",
                event.pipeline_id, event.event_type, event.run_id
            ),
            _ => debug!(
                "[{}] {:?} step={:?}",
                event.pipeline_id, event.event_type, event.step_name
            ),
        }
        Ok(())
    }
}
