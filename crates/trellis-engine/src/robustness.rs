//! Retry and fallback machinery
//!
//! The dispatcher drives the retry loop; this module owns classification,
//! the error history, fallback synthesis, and the metadata attached to
//! recovered results. Safety errors and cancellation pass straight through:
//! they are never observed as a retry outcome.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;
use trellis_core::config::{RetryCondition, RetryPolicy};
use trellis_core::error::{EngineError, ErrorKind};

/// One failed attempt, recorded in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorHistoryEntry {
    pub attempt: u32,
    pub error_tag: String,
    pub elapsed_ms: u64,
}

/// Metadata attached to the result of a robust step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobustnessMetadata {
    pub attempt_number: u32,
    pub total_attempts: u32,
    pub execution_time_ms: u64,
    pub error_history: Vec<ErrorHistoryEntry>,
    pub recovery_successful: bool,
}

/// Transient-error tag of a handler failure, as recorded in the history.
pub fn error_tag(error: &EngineError) -> String {
    if error.kind == ErrorKind::ProviderError {
        if let Some(tag) = error.details.get("error_kind").and_then(Value::as_str) {
            return tag.to_string();
        }
    }
    "other".to_string()
}

/// Map a handler failure to the retry condition it satisfies, if any.
pub fn classify(error: &EngineError) -> Option<RetryCondition> {
    match error_tag(error).as_str() {
        "timeout" => Some(RetryCondition::Timeout),
        "rate_limit" => Some(RetryCondition::RateLimit),
        "temporary_error" => Some(RetryCondition::TemporaryError),
        "connection_error" => Some(RetryCondition::ConnectionError),
        _ => None,
    }
}

/// Whether the policy permits another attempt for this failure.
pub fn retry_eligible(error: &EngineError, policy: &RetryPolicy) -> bool {
    if error.is_safety() || error.is_cancelled() {
        return false;
    }
    match classify(error) {
        Some(condition) => policy.retry_conditions.contains(&condition),
        None => false,
    }
}

/// Degraded success result synthesized when retries are exhausted.
pub fn degraded_result(error: &EngineError) -> Value {
    json!({
        "degraded_mode": true,
        "original_error": error_tag(error),
        "error_message": error.message,
    })
}

/// Minimal safe constant for the `emergency_response` fallback.
pub fn emergency_result() -> Value {
    json!({
        "degraded_mode": true,
        "status": "emergency_response",
        "response": Value::Null,
    })
}

/// Insert robustness metadata into an object result. Non-object results are
/// returned unchanged; their metadata still lands in the span.
pub fn attach_metadata(result: Value, metadata: &RobustnessMetadata) -> Value {
    match result {
        Value::Object(mut map) => {
            map.insert(
                "_robustness".to_string(),
                serde_json::to_value(metadata).unwrap_or(Value::Null),
            );
            Value::Object(map)
        }
        other => other,
    }
}

/// Most recent successful results for robust steps, keyed by step
/// signature. Backs the `use_cached_response` fallback.
#[derive(Debug, Default)]
pub struct ResponseCache {
    inner: RwLock<HashMap<String, Value>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signature(pipeline_id: &str, step_name: &str) -> String {
        format!("{}::{}", pipeline_id, step_name)
    }

    pub async fn store(&self, signature: &str, value: Value) {
        self.inner.write().await.insert(signature.to_string(), value);
    }

    pub async fn get(&self, signature: &str) -> Option<Value> {
        self.inner.read().await.get(signature).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::config::{BackoffKind, FallbackAction};

    fn provider_error(tag: &str) -> EngineError {
        EngineError::new(ErrorKind::ProviderError, "call failed")
            .with_details(json!({ "error_kind": tag }))
    }

    fn timeout_only_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            backoff: BackoffKind::Exponential,
            base_delay_ms: 10,
            max_delay_ms: 1000,
            retry_conditions: vec![RetryCondition::Timeout],
            fallback_action: FallbackAction::GracefulDegradation,
        }
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify(&provider_error("timeout")), Some(RetryCondition::Timeout));
        assert_eq!(
            classify(&provider_error("rate_limit")),
            Some(RetryCondition::RateLimit)
        );
        assert_eq!(classify(&provider_error("other")), None);
        assert_eq!(classify(&EngineError::internal("boom")), None);
    }

    #[test]
    fn test_eligibility_respects_conditions_and_safety() {
        let policy = timeout_only_policy();
        assert!(retry_eligible(&provider_error("timeout"), &policy));
        assert!(!retry_eligible(&provider_error("rate_limit"), &policy));
        assert!(!retry_eligible(
            &EngineError::new(ErrorKind::CircularDependency, "cycle"),
            &policy
        ));
        assert!(!retry_eligible(
            &EngineError::new(ErrorKind::Cancelled, "deadline"),
            &policy
        ));
    }

    #[test]
    fn test_degraded_result_shape() {
        let result = degraded_result(&provider_error("timeout"));
        assert_eq!(result["degraded_mode"], true);
        assert_eq!(result["original_error"], "timeout");
    }

    #[test]
    fn test_metadata_attachment() {
        let metadata = RobustnessMetadata {
            attempt_number: 3,
            total_attempts: 3,
            execution_time_ms: 40,
            error_history: vec![ErrorHistoryEntry {
                attempt: 1,
                error_tag: "timeout".into(),
                elapsed_ms: 12,
            }],
            recovery_successful: true,
        };
        let result = attach_metadata(json!({"degraded_mode": true}), &metadata);
        assert_eq!(result["_robustness"]["total_attempts"], 3);
        assert_eq!(result["_robustness"]["recovery_successful"], true);

        // Non-object results pass through untouched.
        let scalar = attach_metadata(json!("text"), &metadata);
        assert_eq!(scalar, json!("text"));
    }

    #[tokio::test]
    async fn test_response_cache_round_trip() {
        let cache = ResponseCache::new();
        let sig = ResponseCache::signature("p", "s");
        assert!(cache.get(&sig).await.is_none());
        cache.store(&sig, json!({"ok": true})).await;
        assert_eq!(cache.get(&sig).await, Some(json!({"ok": true})));
    }
}
