//! Ingestion
//!
//! Validates lifecycle requests, scopes them to the caller's project,
//! enforces payload limits and hands the resulting records to the store.

pub mod truncate;

use std::sync::Arc;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, IngestConfig};
use crate::error::{Error, Result};
use crate::models::{RecordStatus, Span, SpanType, Trace, TraceTotals};
use crate::storage::{Completion, SpanCompletion, TraceCompletion, TraceStore};

use self::truncate::{cap_error, enforce_record_limit, Truncatable};

/// Longest accepted name, user id, session id or model, in chars
pub const MAX_NAME_CHARS: usize = 255;

/// Most tags a trace may carry
pub const MAX_TAGS: usize = 50;

/// Tags longer than this are cut
pub const MAX_TAG_CHARS: usize = 100;

/// Largest token count one span may report per direction
pub const MAX_TOKENS: i64 = 1_000_000_000_000;

static PROJECT_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{1,100}$").unwrap_or_else(|e| unreachable!("static pattern: {e}"))
});

static RECORD_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_.:-]{1,128}$").unwrap_or_else(|e| unreachable!("static pattern: {e}"))
});

/// Request to open a trace
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTrace {
    /// Client-allocated id; generated when absent
    pub trace_id: Option<String>,
    /// Name of the run
    pub name: String,
    /// Must equal the caller's project when present
    pub project_id: Option<String>,
    /// Arbitrary key/value attributes, an object
    pub metadata: Option<Value>,
    #[serde(default)]
    /// Labels for filtering
    pub tags: Vec<String>,
    pub user_id: Option<String>,
    /// Session the trace belongs to
    pub session_id: Option<String>,
}

/// Request to open a span inside a trace
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSpan {
    /// Client-allocated id; generated when absent
    pub span_id: Option<String>,
    /// Name of the operation
    pub name: String,
    /// One of the span types, lowercase
    pub span_type: String,
    /// Enclosing span in the same trace
    pub parent_span_id: Option<String>,
    /// Input of the operation
    pub input_data: Option<Value>,
    /// Output, when known at creation
    pub output_data: Option<Value>,
    /// Arbitrary key/value attributes, an object
    pub metadata: Option<Value>,
    /// Model name, for llm spans
    pub model: Option<String>,
    /// Prompt tokens
    pub tokens_input: Option<i64>,
    /// Completion tokens
    pub tokens_output: Option<i64>,
    /// Cost in USD
    pub cost_usd: Option<f64>,
    /// Set when the span is recorded as failed
    pub error: Option<String>,
}

/// Request to close a span
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpanUpdate {
    /// Result of the operation; the stored output is kept when absent
    pub output_data: Option<Value>,
    /// Present when the span failed
    pub error: Option<String>,
    /// Prompt tokens
    pub tokens_input: Option<i64>,
    /// Completion tokens
    pub tokens_output: Option<i64>,
    /// Cost in USD
    pub cost_usd: Option<f64>,
    /// Merged into the stored metadata
    pub metadata: Option<Value>,
}

/// Request to close a trace
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceUpdate {
    /// Final output of the run
    pub output: Option<String>,
    /// Present when the trace failed
    pub error: Option<String>,
    /// Merged into the stored metadata
    pub metadata: Option<Value>,
}

/// Acknowledgement of a create request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    /// Id of the record
    pub id: String,
    /// False when the id already existed and nothing was written
    pub fresh: bool,
}

impl Created {
    /// Wire label: `created` or `already_exists`
    pub fn status(&self) -> &'static str {
        if self.fresh {
            "created"
        } else {
            "already_exists"
        }
    }
}

/// Write path of the service
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn TraceStore>,
    limits: IngestConfig,
    retention: chrono::Duration,
}

impl Ingestor {
    /// Create an ingestor writing to `store`
    pub fn new(store: Arc<dyn TraceStore>, limits: IngestConfig, retention: chrono::Duration) -> Self {
        Self {
            store,
            limits,
            retention,
        }
    }

    /// Create an ingestor from the `[ingest]` and `[retention]` sections
    pub fn from_config(store: Arc<dyn TraceStore>, config: &Config) -> Self {
        Self::new(store, config.ingest.clone(), config.retention.window())
    }

    /// The backing store
    pub fn store(&self) -> &Arc<dyn TraceStore> {
        &self.store
    }

    /// Open a trace owned by `project_id`
    pub async fn create_trace(&self, project_id: &str, req: NewTrace) -> Result<Created> {
        validate_project_id(project_id)?;
        if let Some(requested) = req.project_id.as_deref() {
            if requested != project_id {
                return Err(Error::Forbidden(format!(
                    "project mismatch: API key is for '{project_id}' but request is for '{requested}'"
                )));
            }
        }
        validate_name("name", &req.name)?;
        validate_optional("user_id", req.user_id.as_deref())?;
        validate_optional("session_id", req.session_id.as_deref())?;
        let tags = clean_tags(req.tags)?;
        let trace_id = allocate_id(req.trace_id)?;

        let mut trace = Trace::new(&trace_id, project_id, req.name, Utc::now(), self.retention);
        trace.metadata = object_or_empty("metadata", req.metadata)?;
        trace.tags = tags;
        trace.user_id = req.user_id;
        trace.session_id = req.session_id;
        self.fit("trace", &trace_id, &mut trace)?;

        let fresh = self.store.put_trace(&trace).await?;
        if !fresh {
            let existing = self.store.get_trace_record(&trace_id).await?;
            if existing.is_some_and(|t| t.project_id != project_id) {
                return Err(Error::Forbidden(format!(
                    "trace {trace_id} belongs to another project"
                )));
            }
            debug!(trace_id = %trace_id, "trace already exists, acknowledged");
        } else {
            info!(trace_id = %trace_id, project_id, name = %trace.name, "Created trace");
        }
        Ok(Created { id: trace_id, fresh })
    }

    /// Open a span in one of the caller's traces
    pub async fn create_span(&self, project_id: &str, trace_id: &str, req: NewSpan) -> Result<Created> {
        self.owned_trace(project_id, trace_id).await?;

        validate_name("name", &req.name)?;
        let span_type: SpanType = req.span_type.parse()?;
        validate_optional("model", req.model.as_deref())?;
        validate_usage(req.tokens_input, req.tokens_output, req.cost_usd)?;
        let span_id = allocate_id(req.span_id)?;

        if let Some(parent) = req.parent_span_id.as_deref() {
            if parent == span_id {
                return Err(Error::validation("a span cannot be its own parent"));
            }
            let parent_span = self.store.get_span(parent).await?;
            if !parent_span.is_some_and(|p| p.trace_id == trace_id) {
                return Err(Error::validation(format!(
                    "parent span {parent} not found in trace {trace_id}"
                )));
            }
        }

        let mut span = Span::new(&span_id, trace_id, req.name, span_type, Utc::now(), self.retention);
        span.parent_span_id = req.parent_span_id;
        span.input_data = req.input_data.unwrap_or_else(empty_object);
        span.output_data = req.output_data.unwrap_or_else(empty_object);
        span.metadata = object_or_empty("metadata", req.metadata)?;
        span.model = req.model;
        span.tokens_input = req.tokens_input;
        span.tokens_output = req.tokens_output;
        span.cost_usd = req.cost_usd;
        span.error = cap_error(req.error, self.limits.max_error_chars);
        self.fit("span", &span_id, &mut span)?;

        let fresh = self.store.put_span(&span).await?;
        if fresh {
            info!(span_id = %span_id, trace_id, name = %span.name, "Created span");
        } else {
            let existing = self.store.get_span(&span_id).await?;
            if existing.is_some_and(|s| s.trace_id != trace_id) {
                return Err(Error::Forbidden(format!(
                    "span {span_id} belongs to another trace"
                )));
            }
            debug!(span_id = %span_id, "span already exists, acknowledged");
        }
        Ok(Created { id: span_id, fresh })
    }

    /// Close a span in one of the caller's traces
    pub async fn complete_span(
        &self,
        project_id: &str,
        span_id: &str,
        req: SpanUpdate,
    ) -> Result<Completion<Span>> {
        validate_usage(req.tokens_input, req.tokens_output, req.cost_usd)?;

        let span = self
            .store
            .get_span(span_id)
            .await?
            .ok_or_else(|| Error::not_found("Span", span_id))?;
        let owner = self.store.get_trace_record(&span.trace_id).await?;
        if !owner.is_some_and(|t| t.project_id == project_id) {
            return Err(Error::Forbidden(format!(
                "span {span_id} belongs to a trace not owned by project {project_id}"
            )));
        }
        if span.is_complete() {
            debug!(span_id, "span already completed");
            return Ok(Completion::AlreadyCompleted(span));
        }

        let error = cap_error(req.error, self.limits.max_error_chars);
        let mut completion = SpanCompletion {
            end_time: Utc::now(),
            status: if error.is_some() {
                RecordStatus::Error
            } else {
                RecordStatus::Completed
            },
            output_data: req.output_data.unwrap_or_else(|| span.output_data.clone()),
            tokens_input: req.tokens_input,
            tokens_output: req.tokens_output,
            cost_usd: req.cost_usd,
            error,
            input_data: None,
            metadata: merge_metadata(&span.metadata, req.metadata)?,
        };

        let mut merged = span;
        completion.apply(&mut merged);
        let truncated = self.fit("span", span_id, &mut merged)?;
        completion.output_data = merged.output_data;
        if truncated.contains(&"input_data") {
            completion.input_data = Some(merged.input_data);
        }
        if truncated.contains(&"metadata") || completion.metadata.is_some() {
            completion.metadata = Some(merged.metadata);
        }

        let outcome = self.store.complete_span(span_id, completion).await?;
        info!(span_id, outcome = outcome.label(), "Completed span");
        Ok(outcome)
    }

    /// Close one of the caller's traces
    pub async fn complete_trace(
        &self,
        project_id: &str,
        trace_id: &str,
        req: TraceUpdate,
    ) -> Result<Completion<Trace>> {
        let trace = self
            .store
            .get_trace_record(trace_id)
            .await?
            .ok_or_else(|| Error::not_found("Trace", trace_id))?;
        if trace.project_id != project_id {
            return Err(Error::Forbidden(format!(
                "trace {trace_id} is not owned by project {project_id}"
            )));
        }
        if trace.is_complete() {
            debug!(trace_id, "trace already completed");
            return Ok(Completion::AlreadyCompleted(trace));
        }

        let error = cap_error(req.error, self.limits.max_error_chars);
        let mut completion = TraceCompletion {
            end_time: Utc::now(),
            status: if error.is_some() {
                RecordStatus::Error
            } else {
                RecordStatus::Completed
            },
            output: req.output,
            error,
            metadata: merge_metadata(&trace.metadata, req.metadata)?,
        };

        // Size against the widest totals the store could write.
        let mut merged = trace;
        completion.apply_fields(&mut merged);
        merged.finish(
            completion.end_time,
            completion.status,
            TraceTotals {
                span_count: i64::MAX,
                total_tokens: i64::MAX,
                total_cost_usd: f64::MAX,
            },
        );
        let truncated = self.fit("trace", trace_id, &mut merged)?;
        completion.output = merged.output;
        if truncated.contains(&"metadata") || completion.metadata.is_some() {
            completion.metadata = Some(merged.metadata);
        }

        let outcome = self.store.complete_trace(trace_id, completion).await?;
        let record = outcome.record();
        info!(
            trace_id,
            outcome = outcome.label(),
            span_count = record.span_count,
            total_tokens = record.total_tokens,
            "Completed trace"
        );
        Ok(outcome)
    }

    /// A trace of the caller's project; other projects' traces are not found
    pub async fn owned_trace(&self, project_id: &str, trace_id: &str) -> Result<Trace> {
        self.store
            .get_trace_record(trace_id)
            .await?
            .filter(|trace| trace.project_id == project_id)
            .ok_or_else(|| Error::not_found("Trace", trace_id))
    }

    fn fit<R: Truncatable>(&self, kind: &str, id: &str, record: &mut R) -> Result<Vec<&'static str>> {
        let truncated = enforce_record_limit(record, self.limits.max_record_bytes)?;
        for field in &truncated {
            warn!(kind, id, field, limit = self.limits.max_record_bytes, "Truncated oversized payload");
            metrics::counter!("llmtracer_payload_truncations_total", "field" => *field).increment(1);
        }
        Ok(truncated)
    }
}

/// Check a project id
pub fn validate_project_id(project_id: &str) -> Result<()> {
    if PROJECT_ID.is_match(project_id) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "invalid project_id '{project_id}': expected 1-100 of [A-Za-z0-9_-]"
        )))
    }
}

fn allocate_id(requested: Option<String>) -> Result<String> {
    match requested {
        Some(id) if RECORD_ID.is_match(&id) => Ok(id),
        Some(id) => Err(Error::validation(format!("invalid id '{id}'"))),
        None => Ok(Uuid::new_v4().to_string()),
    }
}

fn validate_name(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(format!("{field} must not be empty")));
    }
    validate_optional(field, Some(value))
}

fn validate_optional(field: &str, value: Option<&str>) -> Result<()> {
    match value {
        Some(v) if v.chars().count() > MAX_NAME_CHARS => Err(Error::validation(format!(
            "{field} exceeds {MAX_NAME_CHARS} chars"
        ))),
        _ => Ok(()),
    }
}

fn validate_usage(tokens_input: Option<i64>, tokens_output: Option<i64>, cost_usd: Option<f64>) -> Result<()> {
    for (field, tokens) in [("tokens_input", tokens_input), ("tokens_output", tokens_output)] {
        match tokens {
            Some(t) if t < 0 => {
                return Err(Error::validation(format!("{field} must not be negative")));
            }
            Some(t) if t > MAX_TOKENS => {
                return Err(Error::validation(format!("{field} exceeds {MAX_TOKENS}")));
            }
            _ => {}
        }
    }
    if cost_usd.is_some_and(|c| !c.is_finite() || c < 0.0) {
        return Err(Error::validation("cost_usd must be a non-negative number"));
    }
    Ok(())
}

fn clean_tags(tags: Vec<String>) -> Result<Vec<String>> {
    if tags.len() > MAX_TAGS {
        return Err(Error::validation(format!(
            "at most {MAX_TAGS} tags are allowed, got {}",
            tags.len()
        )));
    }
    Ok(tags
        .into_iter()
        .filter(|tag| !tag.trim().is_empty())
        .map(|tag| tag.chars().take(MAX_TAG_CHARS).collect())
        .collect())
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn object_or_empty(field: &str, value: Option<Value>) -> Result<Value> {
    match value {
        None | Some(Value::Null) => Ok(empty_object()),
        Some(object @ Value::Object(_)) => Ok(object),
        Some(_) => Err(Error::validation(format!("{field} must be a JSON object"))),
    }
}

/// Stored metadata with the update's keys laid over it; `None` when there is no update
fn merge_metadata(current: &Value, update: Option<Value>) -> Result<Option<Value>> {
    let update = match update {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Object(map)) => map,
        Some(_) => return Err(Error::validation("metadata must be a JSON object")),
    };
    let mut merged = match current {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    merged.extend(update);
    Ok(Some(Value::Object(merged)))
}
