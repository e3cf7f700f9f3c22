//! API handlers for the HTTP REST API

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::middleware::{ApiJson, Caller};
use crate::config::{AuthConfig, Config};
use crate::error::{Error, Result};
use crate::ingest::{Ingestor, NewSpan, NewTrace, SpanUpdate, TraceUpdate};
use crate::models::{
    ProjectStats, RecordStatus, Span, Trace, TraceListQuery, TracePage, DEFAULT_PAGE_LIMIT,
};
use crate::ratelimit::SlidingWindowLimiter;
use crate::storage::TraceStore;
use crate::tree::{build_forest, SpanNode};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Write path
    pub ingestor: Ingestor,
    /// Read path
    pub store: Arc<dyn TraceStore>,
    /// Admission control shared by every route
    pub limiter: Arc<SlidingWindowLimiter>,
    /// Key checking rules
    pub auth: Arc<AuthConfig>,
}

impl AppState {
    /// Wire the service around `store`
    pub fn new(store: Arc<dyn TraceStore>, config: &Config) -> Self {
        Self {
            ingestor: Ingestor::from_config(Arc::clone(&store), config),
            store,
            limiter: Arc::new(SlidingWindowLimiter::from_config(&config.rate_limit)),
            auth: Arc::new(config.auth.clone()),
        }
    }
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    /// `healthy` or `degraded`
    pub status: &'static str,
    /// Service name
    pub service: &'static str,
    /// Crate version
    pub version: &'static str,
    /// Storage backend in use
    pub storage: &'static str,
    /// Time of the check
    pub timestamp: chrono::DateTime<Utc>,
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (code, status) = match state.store.health_check().await {
        Ok(()) => (StatusCode::OK, "healthy"),
        Err(e) => {
            tracing::warn!(error = %e, "Storage health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "degraded")
        }
    };
    (
        code,
        Json(HealthResponse {
            status,
            service: "llmtracer",
            version: env!("CARGO_PKG_VERSION"),
            storage: state.store.kind(),
            timestamp: Utc::now(),
        }),
    )
}

/// Trace creation response
#[derive(Debug, Serialize, Deserialize)]
pub struct TraceCreated {
    /// Id of the trace
    pub trace_id: String,
    /// `created` or `already_exists`
    pub status: String,
}

/// Open a trace
pub async fn create_trace(
    State(state): State<AppState>,
    caller: Caller,
    ApiJson(req): ApiJson<NewTrace>,
) -> Result<Json<TraceCreated>> {
    let created = state.ingestor.create_trace(&caller.project_id, req).await?;
    Ok(Json(TraceCreated {
        status: created.status().to_string(),
        trace_id: created.id,
    }))
}

/// Span creation response
#[derive(Debug, Serialize, Deserialize)]
pub struct SpanCreated {
    /// Id of the span
    pub span_id: String,
    /// `created` or `already_exists`
    pub status: String,
}

/// Open a span in a trace
pub async fn create_span(
    State(state): State<AppState>,
    caller: Caller,
    Path(trace_id): Path<String>,
    ApiJson(req): ApiJson<NewSpan>,
) -> Result<Json<SpanCreated>> {
    let created = state
        .ingestor
        .create_span(&caller.project_id, &trace_id, req)
        .await?;
    Ok(Json(SpanCreated {
        status: created.status().to_string(),
        span_id: created.id,
    }))
}

/// Span completion response
#[derive(Debug, Serialize, Deserialize)]
pub struct SpanCompleted {
    /// Id of the span
    pub span_id: String,
    /// `completed` or `already_completed`
    pub status: String,
    /// When the span ended
    pub end_time: Option<chrono::DateTime<Utc>>,
    /// Duration in milliseconds
    pub duration_ms: Option<i64>,
}

/// Close a span
pub async fn complete_span(
    State(state): State<AppState>,
    caller: Caller,
    Path(span_id): Path<String>,
    body: Bytes,
) -> Result<Json<SpanCompleted>> {
    let req: SpanUpdate = optional_body(&body)?;
    let outcome = state
        .ingestor
        .complete_span(&caller.project_id, &span_id, req)
        .await?;
    let status = outcome.label().to_string();
    let span = outcome.into_record();
    Ok(Json(SpanCompleted {
        span_id: span.span_id,
        status,
        end_time: span.end_time,
        duration_ms: span.duration_ms,
    }))
}

/// Trace completion response
#[derive(Debug, Serialize, Deserialize)]
pub struct TraceCompleted {
    /// Id of the trace
    pub trace_id: String,
    /// `completed` or `already_completed`
    pub status: String,
    /// Duration in milliseconds
    pub duration_ms: Option<i64>,
    /// Spans aggregated at completion
    pub span_count: i64,
    /// Tokens aggregated at completion
    pub total_tokens: i64,
    /// Cost aggregated at completion, in USD
    pub total_cost_usd: f64,
}

/// Close a trace
pub async fn complete_trace(
    State(state): State<AppState>,
    caller: Caller,
    Path(trace_id): Path<String>,
    body: Bytes,
) -> Result<Json<TraceCompleted>> {
    let req: TraceUpdate = optional_body(&body)?;
    let outcome = state
        .ingestor
        .complete_trace(&caller.project_id, &trace_id, req)
        .await?;
    let status = outcome.label().to_string();
    let trace = outcome.into_record();
    Ok(Json(TraceCompleted {
        trace_id: trace.trace_id,
        status,
        duration_ms: trace.duration_ms,
        span_count: trace.span_count,
        total_tokens: trace.total_tokens,
        total_cost_usd: trace.total_cost_usd,
    }))
}

/// Completion bodies are optional: an empty body means "no fields"
fn optional_body<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| Error::validation(format!("invalid JSON body: {e}")))
}

/// Query parameters for listing traces
#[derive(Debug, Default, Deserialize)]
pub struct ListTracesParams {
    /// Cursor from the previous page
    pub cursor: Option<String>,
    /// Page size, 1 to 1000
    pub limit: Option<String>,
    pub user_id: Option<String>,
    /// Only traces of this session
    pub session_id: Option<String>,
    /// Comma separated; a trace matches when it carries any of them
    pub tags: Option<String>,
    /// Only traces in this status
    pub status: Option<String>,
}

impl ListTracesParams {
    /// Turn raw parameters into a query scoped to `project_id`
    pub fn into_query(self, project_id: &str) -> Result<TraceListQuery> {
        let limit = match self.limit.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_PAGE_LIMIT,
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::validation(format!("limit must be an integer, got '{raw}'")))?,
        };
        let status = self
            .status
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(str::parse::<RecordStatus>)
            .transpose()?;
        let tags: Vec<String> = self
            .tags
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut query = TraceListQuery::new(project_id)
            .with_limit(limit)
            .with_cursor(self.cursor.filter(|c| !c.is_empty()));
        query.user_id = self.user_id;
        query.session_id = self.session_id;
        query.tags = tags;
        query.status = status;
        query.validate()?;
        Ok(query)
    }
}

/// List the caller's traces, newest first
pub async fn list_traces(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<ListTracesParams>,
) -> Result<Json<TracePage>> {
    let query = params.into_query(&caller.project_id)?;
    let page = state.store.list_traces(&query).await?;
    Ok(Json(page))
}

/// Trace detail response
#[derive(Serialize)]
pub struct TraceView<'a> {
    /// The trace
    pub trace: &'a Trace,
    /// Its spans, unordered
    pub spans: &'a [Span],
    /// The spans as a forest
    pub tree: Vec<SpanNode<'a>>,
    /// Number of spans
    pub span_count: usize,
}

/// Get a trace with its spans and their tree
pub async fn get_trace(
    State(state): State<AppState>,
    caller: Caller,
    Path(trace_id): Path<String>,
) -> Result<Response> {
    let detail = state
        .store
        .get_trace(&trace_id)
        .await?
        .filter(|detail| detail.trace.project_id == caller.project_id)
        .ok_or_else(|| Error::not_found("Trace", &trace_id))?;

    let view = TraceView {
        trace: &detail.trace,
        spans: &detail.spans,
        tree: build_forest(&detail.spans),
        span_count: detail.spans.len(),
    };
    Ok(Json(view).into_response())
}

/// Aggregates of the caller's project
pub async fn get_stats(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<ProjectStats>> {
    Ok(Json(state.store.get_stats(&caller.project_id).await?))
}
