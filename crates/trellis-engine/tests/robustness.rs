//! Fallback behaviors of the retry layer: cached responses, simplified
//! prompts and emergency responses, plus backoff pacing.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use trellis_core::config::{
    BackoffKind, FallbackAction, Pipeline, PromptElement, RetryCondition, RetryPolicy, Step,
    StepKind,
};
use trellis_core::traits::{
    Provider, ProviderError, ProviderErrorKind, ProviderRequest, ProviderResponse,
};
use trellis_engine::executor::PipelineExecutor;

/// Switchable provider: succeeds until `broken` is flipped, then fails
/// with the configured kind.
struct SwitchableProvider {
    broken: AtomicBool,
    kind: ProviderErrorKind,
    calls: AtomicU32,
}

impl SwitchableProvider {
    fn working(kind: ProviderErrorKind) -> Self {
        Self {
            broken: AtomicBool::new(false),
            kind,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Provider for SwitchableProvider {
    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.broken.load(Ordering::SeqCst) {
            Err(ProviderError::new(self.kind, "provider is down"))
        } else {
            Ok(ProviderResponse::data(json!({
                "answer": format!("echo: {}", request.prompt),
            })))
        }
    }
}

fn robust_step(name: &str, prompt: &str, policy: RetryPolicy) -> Step {
    let mut step = Step::new(
        name,
        StepKind::Provider {
            provider: "p".to_string(),
            options: HashMap::new(),
            prompt: vec![PromptElement::Static {
                content: prompt.to_string(),
            }],
            simplified_prompt: None,
        },
    );
    step.retry = Some(policy);
    step
}

fn no_retry_policy(fallback: FallbackAction) -> RetryPolicy {
    RetryPolicy {
        max_retries: 0,
        backoff: BackoffKind::Fixed,
        base_delay_ms: 1,
        max_delay_ms: 10,
        retry_conditions: Vec::new(),
        fallback_action: fallback,
    }
}

#[tokio::test]
async fn cached_response_fallback_returns_last_success() {
    let provider = Arc::new(SwitchableProvider::working(ProviderErrorKind::Connection));
    let pipeline = Pipeline::new(
        "cachy",
        vec![robust_step(
            "ask",
            "what is up",
            no_retry_policy(FallbackAction::UseCachedResponse),
        )],
    );

    let executor = PipelineExecutor::builder()
        .provider("p", provider.clone())
        .build();

    // First run succeeds and seeds the cache.
    let first = executor.execute(&pipeline).await.unwrap();
    assert_eq!(first.results["ask"]["answer"], json!("echo: what is up"));

    // Second run fails; the step resolves from the cached success.
    provider.broken.store(true, Ordering::SeqCst);
    let second = executor.execute(&pipeline).await.unwrap();
    assert_eq!(second.results["ask"]["answer"], json!("echo: what is up"));
    assert_eq!(second.results["ask"]["from_cache"], json!(true));
    assert_eq!(
        second.results["ask"]["_robustness"]["recovery_successful"],
        json!(true)
    );
}

#[tokio::test]
async fn cached_fallback_degrades_when_cache_is_cold() {
    let provider = Arc::new(SwitchableProvider::working(ProviderErrorKind::Connection));
    provider.broken.store(true, Ordering::SeqCst);

    let pipeline = Pipeline::new(
        "coldcache",
        vec![robust_step(
            "ask",
            "anyone there",
            no_retry_policy(FallbackAction::UseCachedResponse),
        )],
    );

    let executor = PipelineExecutor::builder().provider("p", provider).build();
    let outcome = executor.execute(&pipeline).await.unwrap();
    assert_eq!(outcome.results["ask"]["degraded_mode"], json!(true));
    assert_eq!(outcome.results["ask"]["original_error"], json!("connection_error"));
}

#[tokio::test]
async fn simplified_prompt_fallback_retries_with_the_variant() {
    /// Fails on the full prompt, succeeds on the simplified one.
    struct PickyProvider {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Provider for PickyProvider {
        async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if request.prompt.contains("elaborate") {
                Err(ProviderError::new(
                    ProviderErrorKind::Temporary,
                    "too complex",
                ))
            } else {
                Ok(ProviderResponse::data(json!({"answer": "short and sweet"})))
            }
        }
    }

    let mut step = Step::new(
        "ask",
        StepKind::Provider {
            provider: "p".to_string(),
            options: HashMap::new(),
            prompt: vec![PromptElement::Static {
                content: "elaborate at great length".to_string(),
            }],
            simplified_prompt: Some(vec![PromptElement::Static {
                content: "answer briefly".to_string(),
            }]),
        },
    );
    step.retry = Some(no_retry_policy(FallbackAction::SimplifiedPrompt));

    let provider = Arc::new(PickyProvider {
        calls: AtomicU32::new(0),
    });
    let executor = PipelineExecutor::builder()
        .provider("p", provider.clone())
        .build();
    let outcome = executor
        .execute(&Pipeline::new("simpler", vec![step]))
        .await
        .unwrap();

    assert_eq!(outcome.results["ask"]["answer"], json!("short and sweet"));
    assert_eq!(
        outcome.results["ask"]["_robustness"]["recovery_successful"],
        json!(true)
    );
    // One full attempt plus one simplified attempt.
    assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn emergency_response_fallback_is_a_safe_constant() {
    let provider = Arc::new(SwitchableProvider::working(ProviderErrorKind::Temporary));
    provider.broken.store(true, Ordering::SeqCst);

    let pipeline = Pipeline::new(
        "lastresort",
        vec![robust_step(
            "ask",
            "please",
            no_retry_policy(FallbackAction::EmergencyResponse),
        )],
    );

    let executor = PipelineExecutor::builder().provider("p", provider).build();
    let outcome = executor.execute(&pipeline).await.unwrap();
    assert_eq!(outcome.results["ask"]["degraded_mode"], json!(true));
    assert_eq!(outcome.results["ask"]["status"], json!("emergency_response"));
}

#[tokio::test]
async fn exponential_backoff_paces_the_retries() {
    let provider = Arc::new(SwitchableProvider::working(ProviderErrorKind::RateLimit));
    provider.broken.store(true, Ordering::SeqCst);

    let policy = RetryPolicy {
        max_retries: 2,
        backoff: BackoffKind::Exponential,
        base_delay_ms: 40,
        max_delay_ms: 1000,
        retry_conditions: vec![RetryCondition::RateLimit],
        fallback_action: FallbackAction::GracefulDegradation,
    };
    let pipeline = Pipeline::new(
        "paced",
        vec![robust_step("ask", "slow down", policy)],
    );

    let executor = PipelineExecutor::builder()
        .provider("p", provider.clone())
        .build();

    let started = Instant::now();
    let outcome = executor.execute(&pipeline).await.unwrap();
    let elapsed = started.elapsed();

    // Delays of 40ms and 80ms separate the three attempts.
    assert!(elapsed.as_millis() >= 120, "elapsed {:?}", elapsed);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.results["ask"]["degraded_mode"], json!(true));
    assert_eq!(
        outcome.results["ask"]["_robustness"]["error_history"]
            .as_array()
            .unwrap()
            .len(),
        3
    );
}
