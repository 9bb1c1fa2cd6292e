//! Pipeline resolution for nested steps
//!
//! A nested step names its child pipeline one of three ways, resolved in
//! precedence order: `pipeline_ref` (named registry), `pipeline_file`
//! (YAML or JSON on disk), or an inline `pipeline` definition.

use log::debug;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use trellis_core::config::Pipeline;
use trellis_core::error::{EngineError, EngineResult};

/// Named pipelines available to `pipeline_ref` steps. Built by the caller
/// before execution; read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct PipelineRegistry {
    named: HashMap<String, Arc<Pipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pipeline: Pipeline) {
        self.named.insert(pipeline.name.clone(), Arc::new(pipeline));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.named.get(name).cloned()
    }

    /// Resolve a nested step's child pipeline.
    pub async fn resolve(
        &self,
        step_name: &str,
        pipeline_ref: Option<&str>,
        pipeline_file: Option<&Path>,
        inline: Option<&Pipeline>,
        base_dir: Option<&Path>,
    ) -> EngineResult<Arc<Pipeline>> {
        if let Some(name) = pipeline_ref {
            return self.get(name).ok_or_else(|| {
                EngineError::internal(format!(
                    "pipeline '{}' is not registered",
                    name
                ))
                .with_step(step_name)
                .with_details(json!({ "pipeline_ref": name }))
            });
        }

        if let Some(file) = pipeline_file {
            let path = match base_dir {
                Some(base) if file.is_relative() => base.join(file),
                _ => PathBuf::from(file),
            };
            let pipeline = load_pipeline_file(&path).await?;
            return Ok(Arc::new(pipeline));
        }

        if let Some(pipeline) = inline {
            return Ok(Arc::new(pipeline.clone()));
        }

        Err(EngineError::internal(format!(
            "nested step '{}' names no pipeline (expected pipeline_ref, pipeline_file or an inline pipeline)",
            step_name
        ))
        .with_step(step_name))
    }
}

/// Load a pipeline definition from disk. YAML is the primary format and
/// also parses JSON documents.
pub async fn load_pipeline_file(path: &Path) -> EngineResult<Pipeline> {
    debug!("loading pipeline definition from {}", path.display());
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        EngineError::internal(format!(
            "failed to read pipeline file {}: {}",
            path.display(),
            e
        ))
    })?;

    serde_yaml::from_str(&raw).map_err(|e| {
        EngineError::internal(format!(
            "failed to parse pipeline file {}: {}",
            path.display(),
            e
        ))
        .with_details(json!({ "file": path.display().to_string() }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_registry_precedence_prefers_ref() {
        let mut registry = PipelineRegistry::new();
        registry.register(Pipeline::new("registered", Vec::new()));

        let inline = Pipeline::new("inline", Vec::new());
        let resolved = registry
            .resolve("child", Some("registered"), None, Some(&inline), None)
            .await
            .unwrap();
        assert_eq!(resolved.name, "registered");
    }

    #[tokio::test]
    async fn test_unregistered_ref_fails() {
        let registry = PipelineRegistry::new();
        let err = registry
            .resolve("child", Some("ghost"), None, None, None)
            .await
            .unwrap_err();
        assert!(err.message.contains("ghost"));
    }

    #[tokio::test]
    async fn test_file_resolution_relative_to_base_dir() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("sub.yaml");
        tokio::fs::write(
            &file,
            "name: sub\nsteps:\n  - name: noop\n    type: set_variable\n    variables:\n      done: true\n",
        )
        .await
        .unwrap();

        let registry = PipelineRegistry::new();
        let resolved = registry
            .resolve(
                "child",
                None,
                Some(Path::new("sub.yaml")),
                None,
                Some(dir.path()),
            )
            .await
            .unwrap();
        assert_eq!(resolved.name, "sub");
        assert_eq!(resolved.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_source_is_an_error() {
        let registry = PipelineRegistry::new();
        let err = registry.resolve("child", None, None, None, None).await.unwrap_err();
        assert!(err.message.contains("names no pipeline"));
    }

    #[tokio::test]
    async fn test_json_pipeline_file_parses() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("p.json");
        tokio::fs::write(
            &file,
            r#"{"name": "jsonpipe", "steps": [{"name": "v", "type": "set_variable", "variables": {"x": 1}}]}"#,
        )
        .await
        .unwrap();

        let pipeline = load_pipeline_file(&file).await.unwrap();
        assert_eq!(pipeline.name, "jsonpipe");
    }
}
