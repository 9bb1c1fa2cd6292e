//! Feature coverage for the step families: loops, switch, transforms,
//! variables, file operations, parallel provider fan-out, output files,
//! events and the trace inspection surface.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use trellis_core::config::{
    AggregateFn, CompareOp, ConvertFormat, FileOperation, Pipeline, PromptElement, ProviderCall,
    Step, StepKind, TransformOp,
};
use trellis_core::traits::{
    Provider, ProviderError, ProviderRequest, ProviderResponse,
};
use trellis_engine::executor::{ExecutorOptions, PipelineExecutor};
use trellis_engine::{EventListener, EventType, ExecutionEvent, SearchField};

/// Echoes prompt and bound inputs; sleeps longer for earlier items so
/// completion order inverts input order.
struct SlowFirstProvider;

#[async_trait]
impl Provider for SlowFirstProvider {
    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let item = request
            .context
            .inputs
            .get("item")
            .cloned()
            .unwrap_or(Value::Null);
        let delay = match item.as_str() {
            Some("first") => 30,
            Some("second") => 15,
            _ => 1,
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(ProviderResponse::data(json!({ "item": item, "prompt": request.prompt })))
    }
}

struct EchoProvider;

#[async_trait]
impl Provider for EchoProvider {
    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse::data(json!({ "prompt": request.prompt })))
    }
}

fn provider_step(name: &str, prompt: &str) -> Step {
    Step::new(
        name,
        StepKind::Provider {
            provider: "echo".to_string(),
            options: HashMap::new(),
            prompt: vec![PromptElement::Static {
                content: prompt.to_string(),
            }],
            simplified_prompt: None,
        },
    )
}

fn set_var(name: &str, variables: HashMap<String, Value>) -> Step {
    Step::new(name, StepKind::SetVariable { variables })
}

#[tokio::test]
async fn sequential_for_each_binds_iterator_and_collects_in_order() {
    let loop_step = Step::new(
        "visit_all",
        StepKind::ForEach {
            iterator: "item".to_string(),
            data_source: "{{steps.listing.result.names}}".to_string(),
            steps: vec![provider_step("visit", "visiting {{inputs.item}}")],
            parallel: false,
            max_parallel: None,
        },
    );

    struct NamesProvider;
    #[async_trait]
    impl Provider for NamesProvider {
        async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            if request.context.step_name == "listing" {
                Ok(ProviderResponse::data(json!({"names": ["x", "y"]})))
            } else {
                Ok(ProviderResponse::data(json!({"prompt": request.prompt})))
            }
        }
    }

    let executor = PipelineExecutor::builder()
        .provider("echo", Arc::new(NamesProvider))
        .build();
    let pipeline = Pipeline::new(
        "looped",
        vec![provider_step("listing", "list names"), loop_step],
    );
    let outcome = executor.execute(&pipeline).await.unwrap();

    let iterations = outcome.results["visit_all"].as_array().unwrap();
    assert_eq!(iterations.len(), 2);
    assert_eq!(iterations[0]["item"], json!("x"));
    assert_eq!(
        iterations[0]["results"]["visit"]["prompt"],
        json!("visiting x")
    );
    assert_eq!(iterations[1]["item"], json!("y"));
    // Inner step results stay inside the loop result.
    assert!(outcome.results.get("visit").is_none());
}

#[tokio::test]
async fn parallel_for_each_returns_input_order() {
    let loop_step = Step::new(
        "fan",
        StepKind::ForEach {
            iterator: "item".to_string(),
            data_source: "first, second, third".to_string(),
            steps: vec![provider_step("call", "{{inputs.item}}")],
            parallel: true,
            max_parallel: Some(3),
        },
    );

    let executor = PipelineExecutor::builder()
        .provider("echo", Arc::new(SlowFirstProvider))
        .build();
    let outcome = executor
        .execute(&Pipeline::new("ordered", vec![loop_step]))
        .await
        .unwrap();

    let iterations = outcome.results["fan"].as_array().unwrap();
    let order: Vec<&str> = iterations
        .iter()
        .map(|it| it["item"].as_str().unwrap())
        .collect();
    assert_eq!(order, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn while_loop_recheck_condition_against_updated_state() {
    let mut pipeline = Pipeline::new(
        "counter",
        vec![Step::new(
            "count_up",
            StepKind::While {
                condition: "global_vars.counter != 3".to_string(),
                max_iterations: 50,
                steps: vec![set_var(
                    "bump",
                    [(
                        "counter".to_string(),
                        json!("{{add(global_vars.counter, 1)}}"),
                    )]
                    .into_iter()
                    .collect(),
                )],
            },
        )],
    );
    pipeline.globals.insert("counter".to_string(), json!(0));

    let executor = PipelineExecutor::builder()
        .provider("echo", Arc::new(EchoProvider))
        .build();
    let outcome = executor.execute(&pipeline).await.unwrap();

    assert_eq!(outcome.results["count_up"]["iterations"], json!(3));
}

#[tokio::test]
async fn while_loop_stops_at_iteration_ceiling() {
    let pipeline = Pipeline::new(
        "forever",
        vec![Step::new(
            "spin",
            StepKind::While {
                condition: "true".to_string(),
                max_iterations: 4,
                steps: vec![set_var(
                    "noop",
                    [("x".to_string(), json!(1))].into_iter().collect(),
                )],
            },
        )],
    );

    let executor = PipelineExecutor::builder()
        .provider("echo", Arc::new(EchoProvider))
        .build();
    let outcome = executor.execute(&pipeline).await.unwrap();
    assert_eq!(outcome.results["spin"]["iterations"], json!(4));
}

#[tokio::test]
async fn switch_selects_matching_case() {
    struct BandProvider;
    #[async_trait]
    impl Provider for BandProvider {
        async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            if request.context.step_name == "grade" {
                Ok(ProviderResponse::data(json!({"band": "high"})))
            } else {
                Ok(ProviderResponse::data(json!({"prompt": request.prompt})))
            }
        }
    }

    let switch = Step::new(
        "route",
        StepKind::Switch {
            expression: "{{steps.grade.result.band}}".to_string(),
            cases: [
                (
                    "high".to_string(),
                    vec![provider_step("celebrate", "great")],
                ),
                ("low".to_string(), vec![provider_step("retry_plan", "plan")]),
            ]
            .into_iter()
            .collect(),
            default: vec![provider_step("shrug", "unknown")],
        },
    );

    let executor = PipelineExecutor::builder()
        .provider("echo", Arc::new(BandProvider))
        .build();
    let pipeline = Pipeline::new("switched", vec![provider_step("grade", "grade"), switch]);
    let outcome = executor.execute(&pipeline).await.unwrap();

    assert_eq!(outcome.results["route"]["matched"], json!("high"));
    assert!(outcome.results.contains_key("celebrate"));
    assert!(!outcome.results.contains_key("retry_plan"));
    assert!(!outcome.results.contains_key("shrug"));
}

#[tokio::test]
async fn transform_filters_aggregates_and_joins() {
    struct ScoresProvider;
    #[async_trait]
    impl Provider for ScoresProvider {
        async fn call(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse::data(json!([
                {"name": "a", "score": 8},
                {"name": "b", "score": 2},
                {"name": "c", "score": 7},
            ])))
        }
    }

    let pipeline = Pipeline::new(
        "shaped",
        vec![
            provider_step("scores", "score them"),
            Step::new(
                "passing_total",
                StepKind::Transform {
                    input: "{{steps.scores}}".to_string(),
                    operations: vec![
                        TransformOp::Filter {
                            field: "score".to_string(),
                            compare: CompareOp::Gt,
                            value: json!(5),
                        },
                        TransformOp::Aggregate {
                            function: AggregateFn::Sum,
                            field: Some("score".to_string()),
                        },
                    ],
                },
            ),
        ],
    );

    let executor = PipelineExecutor::builder()
        .provider("echo", Arc::new(ScoresProvider))
        .build();
    let outcome = executor.execute(&pipeline).await.unwrap();
    assert_eq!(outcome.results["passing_total"], json!(15));
}

#[tokio::test]
async fn parallel_provider_joins_as_ordered_list() {
    let calls = ["draft", "critique", "score"]
        .into_iter()
        .map(|name| ProviderCall {
            name: name.to_string(),
            provider: "echo".to_string(),
            options: HashMap::new(),
            prompt: vec![PromptElement::Static {
                content: format!("{} the text", name),
            }],
        })
        .collect();

    let pipeline = Pipeline::new(
        "fanout",
        vec![Step::new("burst", StepKind::ParallelProvider { calls })],
    );

    let executor = PipelineExecutor::builder()
        .provider("echo", Arc::new(EchoProvider))
        .build();
    let outcome = executor.execute(&pipeline).await.unwrap();

    let merged = outcome.results["burst"].as_array().unwrap();
    assert_eq!(merged.len(), 3);
    assert_eq!(merged[0]["name"], json!("draft"));
    assert_eq!(merged[0]["result"]["prompt"], json!("draft the text"));
    assert_eq!(merged[1]["name"], json!("critique"));
    assert_eq!(merged[2]["name"], json!("score"));
}

#[tokio::test]
async fn file_ops_work_under_the_workspace() {
    let workspace = tempfile::tempdir().unwrap();
    tokio::fs::write(workspace.path().join("config.json"), r#"{"key": "value"}"#)
        .await
        .unwrap();

    let pipeline = Pipeline::new(
        "filer",
        vec![Step::new(
            "organize",
            StepKind::FileOps {
                operations: vec![
                    FileOperation::Copy {
                        from: "config.json".to_string(),
                        to: "backup/config.json".to_string(),
                    },
                    FileOperation::Convert {
                        from: "config.json".to_string(),
                        to: "config.yaml".to_string(),
                        format: ConvertFormat::Yaml,
                    },
                    FileOperation::Validate {
                        path: "backup/config.json".to_string(),
                        must_exist: true,
                        min_size: Some(5),
                    },
                    FileOperation::List {
                        dir: ".".to_string(),
                        extension: Some("json".to_string()),
                    },
                ],
            },
        )],
    );

    let executor = PipelineExecutor::builder()
        .provider("echo", Arc::new(EchoProvider))
        .options(ExecutorOptions {
            workspace_dir: Some(workspace.path().to_path_buf()),
            ..Default::default()
        })
        .build();
    let outcome = executor.execute(&pipeline).await.unwrap();

    let summaries = outcome.results["organize"].as_array().unwrap();
    assert_eq!(summaries.len(), 4);
    assert_eq!(summaries[3]["entries"], json!(["config.json"]));

    let yaml = tokio::fs::read_to_string(workspace.path().join("config.yaml"))
        .await
        .unwrap();
    assert!(yaml.contains("key: value"));
}

#[tokio::test]
async fn output_to_file_writes_validated_payloads() {
    let out = tempfile::tempdir().unwrap();

    let mut step = provider_step("report", "write a report");
    step.output_to_file = Some("reports/latest.json".to_string());
    let pipeline = Pipeline::new("writer", vec![step]);

    let executor = PipelineExecutor::builder()
        .provider("echo", Arc::new(EchoProvider))
        .options(ExecutorOptions {
            output_dir: Some(out.path().to_path_buf()),
            ..Default::default()
        })
        .build();
    executor.execute(&pipeline).await.unwrap();

    let written = tokio::fs::read_to_string(out.path().join("reports/latest.json"))
        .await
        .unwrap();
    let parsed: Value = serde_json::from_str(&written).unwrap();
    assert_eq!(parsed["prompt"], json!("write a report"));
}

struct Recorder {
    seen: Mutex<Vec<(EventType, Option<String>)>>,
}

#[async_trait]
impl EventListener for Recorder {
    async fn on_event(&self, event: &ExecutionEvent) -> anyhow::Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push((event.event_type, event.step_name.clone()));
        Ok(())
    }
}

#[tokio::test]
async fn events_and_trace_surface_cover_the_execution() {
    let recorder = Arc::new(Recorder {
        seen: Mutex::new(Vec::new()),
    });

    let mut gated = provider_step("gated", "never");
    gated.condition = Some("false".to_string());
    let pipeline = Pipeline::new(
        "observed",
        vec![provider_step("work", "do work"), gated],
    );

    let executor = PipelineExecutor::builder()
        .provider("echo", Arc::new(EchoProvider))
        .listener(recorder.clone())
        .build();
    let outcome = executor.execute(&pipeline).await.unwrap();

    let seen = recorder.seen.lock().unwrap().clone();
    assert!(seen.contains(&(EventType::PipelineStarted, None)));
    assert!(seen.contains(&(EventType::StepStarted, Some("work".to_string()))));
    assert!(seen.contains(&(EventType::StepCompleted, Some("work".to_string()))));
    assert!(seen.contains(&(EventType::StepSkipped, Some("gated".to_string()))));
    assert!(seen.contains(&(EventType::PipelineCompleted, None)));

    // Trace queries over the same run.
    let tracer = executor.tracer();
    let tree = tracer.execution_tree(&outcome.trace_id);
    assert_eq!(tree.len(), 1); // only `work` opened a span
    assert_eq!(tree[0].span.step_name.as_deref(), Some("work"));

    let summary = tracer.performance_summary(&outcome.trace_id);
    assert_eq!(summary.span_count, 1);
    assert_eq!(summary.max_depth, 0);
    assert!((summary.success_rate - 1.0).abs() < f64::EPSILON);
    assert_eq!(summary.bottleneck.as_deref(), Some("work"));

    let hits = tracer.search_spans(&outcome.trace_id, "work", SearchField::StepName);
    assert_eq!(hits.len(), 1);
    assert!(tracer.failed_spans(&outcome.trace_id).is_empty());
}

#[tokio::test]
async fn unresolved_references_pass_through_to_the_provider() {
    let pipeline = Pipeline::new(
        "loose",
        vec![provider_step("echoed", "value: {{steps.ghost.result.x}}")],
    );

    let executor = PipelineExecutor::builder()
        .provider("echo", Arc::new(EchoProvider))
        .build();
    let outcome = executor.execute(&pipeline).await.unwrap();
    assert_eq!(
        outcome.results["echoed"]["prompt"],
        json!("value: {{steps.ghost.result.x}}")
    );
}

#[tokio::test]
async fn set_variable_values_are_visible_to_later_steps() {
    let pipeline = Pipeline::new(
        "vars",
        vec![
            set_var(
                "configure",
                [("mode".to_string(), json!("strict"))].into_iter().collect(),
            ),
            provider_step("use_it", "mode={{global_vars.mode}}"),
        ],
    );

    let executor = PipelineExecutor::builder()
        .provider("echo", Arc::new(EchoProvider))
        .build();
    let outcome = executor.execute(&pipeline).await.unwrap();
    assert_eq!(outcome.results["use_it"]["prompt"], json!("mode=strict"));
    assert_eq!(outcome.results["configure"], json!({"mode": "strict"}));
}

#[tokio::test]
async fn pipeline_deadline_cancels_in_flight_work() {
    use std::sync::atomic::{AtomicU32, Ordering};
    use trellis_core::config::RetryPolicy;
    use trellis_core::error::ErrorKind;

    struct SleepyProvider {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Provider for SleepyProvider {
        async fn call(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ProviderResponse::text("too late"))
        }
    }

    let provider = Arc::new(SleepyProvider {
        calls: AtomicU32::new(0),
    });

    // Even with a retry policy, cancellation is terminal.
    let mut step = provider_step("slow", "take your time");
    step.retry = Some(RetryPolicy::default());
    let pipeline = Pipeline::new("deadlined", vec![step]);

    let executor = PipelineExecutor::builder()
        .provider("echo", provider.clone())
        .options(ExecutorOptions {
            timeout_ms: Some(50),
            ..Default::default()
        })
        .build();

    let err = executor.execute(&pipeline).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Cancelled);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

    // The span closed rather than leaking open.
    let trace_id = err.details["trace_id"].as_str().unwrap();
    assert!(!executor.tracer().failed_spans(trace_id).is_empty());
}

#[tokio::test]
async fn explicit_checkpoint_step_writes_a_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(
        "marked",
        vec![
            provider_step("work", "do"),
            Step::new("mark", StepKind::Checkpoint {}),
        ],
    );

    let executor = PipelineExecutor::builder()
        .provider("echo", Arc::new(EchoProvider))
        .options(ExecutorOptions {
            checkpoint_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        })
        .build();
    let outcome = executor.execute(&pipeline).await.unwrap();
    assert_eq!(outcome.results["mark"]["checkpointed"], json!(true));

    let manager = trellis_engine::CheckpointManager::new(dir.path());
    let checkpoint = manager.read_latest("marked").await.unwrap().unwrap();
    assert!(checkpoint.results.contains_key("work"));
}
