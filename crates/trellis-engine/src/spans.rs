//! Span tracing
//!
//! One span per step invocation, forming a tree via `parent_id`. Spans are
//! opened on step entry, closed on exit, and append-only once closed. The
//! tree is the debugging artifact; the collector also answers the stable
//! inspection queries (tree, depth slices, failures, search, summary).

use crate::context::ExecutionContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub pipeline_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub status: SpanStatus,
    pub depth: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// A span with its children, grouped by `parent_id`.
#[derive(Debug, Clone, Serialize)]
pub struct SpanNode {
    pub span: Span,
    pub children: Vec<SpanNode>,
}

/// Aggregated view of one trace.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSummary {
    pub total_duration_ms: u64,
    pub success_rate: f64,
    pub max_depth: usize,
    /// Step name of the longest completed span.
    pub bottleneck: Option<String>,
    pub span_count: usize,
    pub spans_by_depth: HashMap<usize, usize>,
}

/// Searchable span fields for `search_spans`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchField {
    PipelineId,
    StepName,
    Error,
    Any,
}

/// Collects spans per trace id. Interior mutability keeps the collector
/// shareable across the dispatcher and nested runners; critical sections
/// are short and never held across an await.
#[derive(Debug, Default)]
pub struct TraceCollector {
    spans: RwLock<HashMap<String, Vec<Span>>>,
}

impl TraceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a span for a step and push it onto the context's span stack.
    pub fn start_span(&self, step_name: &str, kind: &str, ctx: &mut ExecutionContext) -> String {
        let span_id = Uuid::new_v4().to_string();
        let mut metadata = HashMap::new();
        metadata.insert("step_type".to_string(), Value::String(kind.to_string()));

        let span = Span {
            id: span_id.clone(),
            parent_id: ctx.current_span().cloned(),
            pipeline_id: ctx.pipeline_id.clone(),
            step_name: Some(step_name.to_string()),
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            status: SpanStatus::Running,
            depth: ctx.nesting_depth,
            error: None,
            metadata,
        };

        if let Ok(mut spans) = self.spans.write() {
            spans.entry(ctx.trace_id.clone()).or_default().push(span);
        }
        ctx.push_span(span_id.clone());
        span_id
    }

    /// Close a span. Closed spans are never reopened.
    pub fn end_span(
        &self,
        trace_id: &str,
        span_id: &str,
        status: SpanStatus,
        error: Option<String>,
    ) {
        if let Ok(mut spans) = self.spans.write() {
            if let Some(trace) = spans.get_mut(trace_id) {
                if let Some(span) = trace.iter_mut().find(|s| s.id == span_id) {
                    if span.status != SpanStatus::Running {
                        return;
                    }
                    let end = Utc::now();
                    let millis = end
                        .signed_duration_since(span.start_time)
                        .num_milliseconds()
                        .max(0) as u64;
                    span.duration_ms = Some(millis);
                    span.end_time = Some(end);
                    span.status = status;
                    span.error = error;
                }
            }
        }
    }

    /// Close any still-running span in a trace; used on cancellation so the
    /// tree never leaks open spans.
    pub fn close_open_spans(&self, trace_id: &str, error: Option<String>) {
        let open: Vec<String> = self
            .spans_for(trace_id)
            .into_iter()
            .filter(|s| s.status == SpanStatus::Running)
            .map(|s| s.id)
            .collect();
        for span_id in open {
            self.end_span(trace_id, &span_id, SpanStatus::Failed, error.clone());
        }
    }

    pub fn spans_for(&self, trace_id: &str) -> Vec<Span> {
        self.spans
            .read()
            .ok()
            .and_then(|spans| spans.get(trace_id).cloned())
            .unwrap_or_default()
    }

    /// The span tree for a trace, grouped by parent id.
    pub fn execution_tree(&self, trace_id: &str) -> Vec<SpanNode> {
        let spans = self.spans_for(trace_id);
        build_forest(&spans, None)
    }

    pub fn spans_at_depth(&self, trace_id: &str, depth: usize) -> Vec<Span> {
        self.spans_for(trace_id)
            .into_iter()
            .filter(|s| s.depth == depth)
            .collect()
    }

    pub fn failed_spans(&self, trace_id: &str) -> Vec<Span> {
        self.spans_for(trace_id)
            .into_iter()
            .filter(|s| s.status == SpanStatus::Failed)
            .collect()
    }

    /// Substring search over a span field.
    pub fn search_spans(&self, trace_id: &str, pattern: &str, field: SearchField) -> Vec<Span> {
        let matches = |text: Option<&str>| text.map(|t| t.contains(pattern)).unwrap_or(false);
        self.spans_for(trace_id)
            .into_iter()
            .filter(|span| match field {
                SearchField::PipelineId => span.pipeline_id.contains(pattern),
                SearchField::StepName => matches(span.step_name.as_deref()),
                SearchField::Error => matches(span.error.as_deref()),
                SearchField::Any => {
                    span.pipeline_id.contains(pattern)
                        || matches(span.step_name.as_deref())
                        || matches(span.error.as_deref())
                }
            })
            .collect()
    }

    pub fn performance_summary(&self, trace_id: &str) -> PerformanceSummary {
        let spans = self.spans_for(trace_id);
        let span_count = spans.len();
        let closed = spans.iter().filter(|s| s.end_time.is_some()).count();
        let completed = spans
            .iter()
            .filter(|s| s.status == SpanStatus::Completed)
            .count();

        let mut spans_by_depth: HashMap<usize, usize> = HashMap::new();
        for span in &spans {
            *spans_by_depth.entry(span.depth).or_default() += 1;
        }

        let bottleneck = spans
            .iter()
            .filter(|s| s.duration_ms.is_some())
            .max_by_key(|s| s.duration_ms.unwrap_or(0))
            .and_then(|s| s.step_name.clone());

        PerformanceSummary {
            total_duration_ms: total_duration(&spans),
            success_rate: if closed == 0 {
                0.0
            } else {
                completed as f64 / closed as f64
            },
            max_depth: spans.iter().map(|s| s.depth).max().unwrap_or(0),
            bottleneck,
            span_count,
            spans_by_depth,
        }
    }
}

fn total_duration(spans: &[Span]) -> u64 {
    let start = spans.iter().map(|s| s.start_time).min();
    let end = spans.iter().filter_map(|s| s.end_time).max();
    match (start, end) {
        (Some(start), Some(end)) => end.signed_duration_since(start).num_milliseconds().max(0) as u64,
        _ => 0,
    }
}

fn build_forest(spans: &[Span], parent: Option<&str>) -> Vec<SpanNode> {
    spans
        .iter()
        .filter(|s| s.parent_id.as_deref() == parent)
        .map(|s| SpanNode {
            span: s.clone(),
            children: build_forest(spans, Some(&s.id)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::config::Pipeline;

    fn root_ctx() -> ExecutionContext {
        ExecutionContext::new_root(&Pipeline::new("trace-test", Vec::new()))
    }

    #[test]
    fn test_span_lifecycle_and_tree() {
        let collector = TraceCollector::new();
        let mut ctx = root_ctx();

        let outer = collector.start_span("outer", "pipeline", &mut ctx);
        let inner = collector.start_span("inner", "provider", &mut ctx);
        collector.end_span(&ctx.trace_id, &inner, SpanStatus::Completed, None);
        ctx.pop_span();
        collector.end_span(&ctx.trace_id, &outer, SpanStatus::Completed, None);
        ctx.pop_span();

        let tree = collector.execution_tree(&ctx.trace_id);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].span.step_name.as_deref(), Some("outer"));
        assert_eq!(tree[0].children.len(), 1);
        assert_eq!(tree[0].children[0].span.step_name.as_deref(), Some("inner"));
    }

    #[test]
    fn test_closed_spans_are_append_only() {
        let collector = TraceCollector::new();
        let mut ctx = root_ctx();

        let span = collector.start_span("s", "provider", &mut ctx);
        collector.end_span(&ctx.trace_id, &span, SpanStatus::Completed, None);
        // A second close attempt must not overwrite the recorded outcome.
        collector.end_span(
            &ctx.trace_id,
            &span,
            SpanStatus::Failed,
            Some("late".into()),
        );

        let spans = collector.spans_for(&ctx.trace_id);
        assert_eq!(spans[0].status, SpanStatus::Completed);
        assert!(spans[0].error.is_none());
    }

    #[test]
    fn test_failed_spans_and_search() {
        let collector = TraceCollector::new();
        let mut ctx = root_ctx();

        let ok = collector.start_span("fetch", "provider", &mut ctx);
        collector.end_span(&ctx.trace_id, &ok, SpanStatus::Completed, None);
        ctx.pop_span();
        let bad = collector.start_span("grade", "provider", &mut ctx);
        collector.end_span(
            &ctx.trace_id,
            &bad,
            SpanStatus::Failed,
            Some("schema violation".into()),
        );
        ctx.pop_span();

        let failed = collector.failed_spans(&ctx.trace_id);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].step_name.as_deref(), Some("grade"));

        let hits = collector.search_spans(&ctx.trace_id, "schema", SearchField::Error);
        assert_eq!(hits.len(), 1);
        let hits = collector.search_spans(&ctx.trace_id, "fetch", SearchField::Any);
        assert_eq!(hits.len(), 1);
        let hits = collector.search_spans(&ctx.trace_id, "fetch", SearchField::Error);
        assert!(hits.is_empty());
    }

    #[test]
    fn test_performance_summary() {
        let collector = TraceCollector::new();
        let mut ctx = root_ctx();

        for name in ["a", "b"] {
            let id = collector.start_span(name, "provider", &mut ctx);
            collector.end_span(&ctx.trace_id, &id, SpanStatus::Completed, None);
            ctx.pop_span();
        }
        let id = collector.start_span("c", "provider", &mut ctx);
        collector.end_span(&ctx.trace_id, &id, SpanStatus::Failed, Some("x".into()));
        ctx.pop_span();

        let summary = collector.performance_summary(&ctx.trace_id);
        assert_eq!(summary.span_count, 3);
        assert!((summary.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.max_depth, 0);
        assert_eq!(summary.spans_by_depth.get(&0), Some(&3));
    }

    #[test]
    fn test_close_open_spans() {
        let collector = TraceCollector::new();
        let mut ctx = root_ctx();
        collector.start_span("hung", "provider", &mut ctx);

        collector.close_open_spans(&ctx.trace_id, Some("cancelled".into()));
        let spans = collector.spans_for(&ctx.trace_id);
        assert_eq!(spans[0].status, SpanStatus::Failed);
        assert_eq!(spans[0].error.as_deref(), Some("cancelled"));
    }
}
