//! Pipelines authored as YAML documents: the serialized step model parses
//! into the data model and executes end to end, including a nested child
//! loaded from a file relative to the workspace.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use trellis_core::config::{Pipeline, StepKind};
use trellis_core::traits::{
    Provider, ProviderError, ProviderRequest, ProviderResponse,
};
use trellis_engine::executor::{ExecutorOptions, PipelineExecutor};
use trellis_engine::registry::load_pipeline_file;

struct StubProvider;

#[async_trait]
impl Provider for StubProvider {
    async fn call(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        match request.context.step_name.as_str() {
            "collect" => Ok(ProviderResponse::data(json!({
                "articles": [
                    {"title": "intro", "words": 1200},
                    {"title": "teaser", "words": 150},
                    {"title": "deep dive", "words": 4800},
                ]
            }))),
            "grade" => Ok(ProviderResponse::data(json!({"score": 8.5}))),
            _ => Ok(ProviderResponse::data(json!({"prompt": request.prompt}))),
        }
    }
}

const PARENT_YAML: &str = r#"
name: editorial
description: Collect, grade and summarize long-form articles.
checkpoint_enabled: false
globals:
  min_words: 1000
steps:
  - name: collect
    type: provider
    provider: claude
    options:
      model: sonnet
      temperature: 0.2
    prompt:
      - type: static
        content: "List this week's articles."

  - name: long_reads
    type: transform
    input: "{{steps.collect.result.articles}}"
    operations:
      - op: filter
        field: words
        compare: gt
        value: 1000
      - op: aggregate
        function: count

  - name: grade
    type: provider
    provider: claude
    condition: "{{steps.long_reads}}"
    output_schema:
      type: object
      required: [score]
      properties:
        score:
          type: number
          minimum: 0
          maximum: 10
    retry:
      max_retries: 2
      backoff: exponential
      base_delay_ms: 5
      retry_conditions: [timeout]
      fallback_action: graceful_degradation
    prompt:
      - type: static
        content: "Grade the long reads."
      - type: previous_response
        step: collect
        extract: articles[0].title

  - name: digest
    type: pipeline
    pipeline_file: digest.yaml
    inputs:
      score: "{{steps.grade.result.score}}"
    outputs:
      - path: render.prompt
        as: body
"#;

const CHILD_YAML: &str = r#"
name: digest
steps:
  - name: render
    type: provider
    provider: claude
    prompt:
      - type: static
        content: "Write a digest for score {{inputs.score}}"
"#;

#[tokio::test]
async fn yaml_pipeline_parses_and_executes() {
    let workspace = tempfile::tempdir().unwrap();
    let parent_path = workspace.path().join("editorial.yaml");
    tokio::fs::write(&parent_path, PARENT_YAML).await.unwrap();
    tokio::fs::write(workspace.path().join("digest.yaml"), CHILD_YAML)
        .await
        .unwrap();

    let pipeline = load_pipeline_file(&parent_path).await.unwrap();
    assert_eq!(pipeline.name, "editorial");
    assert_eq!(pipeline.steps.len(), 4);
    assert_eq!(pipeline.globals["min_words"], json!(1000));

    // The tagged step model deserialized into the right kinds.
    assert_eq!(pipeline.steps[0].kind_tag(), "provider");
    assert_eq!(pipeline.steps[1].kind_tag(), "transform");
    assert_eq!(pipeline.steps[2].kind_tag(), "provider");
    assert_eq!(pipeline.steps[3].kind_tag(), "pipeline");
    match &pipeline.steps[0].kind {
        StepKind::Provider { options, .. } => {
            assert_eq!(options["model"], json!("sonnet"));
        }
        other => panic!("unexpected kind {:?}", other.tag()),
    }
    let retry = pipeline.steps[2].retry.as_ref().unwrap();
    assert_eq!(retry.max_retries, 2);

    let executor = PipelineExecutor::builder()
        .provider("claude", Arc::new(StubProvider))
        .options(ExecutorOptions {
            workspace_dir: Some(workspace.path().to_path_buf()),
            ..Default::default()
        })
        .build();

    let outcome = executor.execute(&pipeline).await.unwrap();

    // Two of three articles clear the word bar.
    assert_eq!(outcome.results["long_reads"], json!(2));
    assert_eq!(outcome.results["grade"], json!({"score": 8.5}));
    // The nested digest saw the parent's score and surfaced only the
    // mapped output.
    assert_eq!(
        outcome.results["digest"],
        json!({"body": "Write a digest for score 8.5"})
    );
}

#[tokio::test]
async fn yaml_round_trip_preserves_the_step_model() {
    let pipeline: Pipeline = serde_yaml::from_str(PARENT_YAML).unwrap();
    let serialized = serde_yaml::to_string(&pipeline).unwrap();
    let reparsed: Pipeline = serde_yaml::from_str(&serialized).unwrap();

    assert_eq!(reparsed.name, pipeline.name);
    assert_eq!(reparsed.steps.len(), pipeline.steps.len());
    for (a, b) in pipeline.steps.iter().zip(reparsed.steps.iter()) {
        assert_eq!(a.name, b.name);
        assert_eq!(a.kind_tag(), b.kind_tag());
    }
}
