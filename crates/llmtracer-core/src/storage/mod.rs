//! Storage engine
//!
//! Persists traces and spans, answers listings with cursor pagination,
//! keeps per-project aggregates up to date and enforces retention.
//! Two backends implement [`TraceStore`]: [`MemoryStore`] for tests and
//! single-node deployments, [`PostgresStore`] for everything else.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{Config, StorageBackend};
use crate::error::{Error, Result};
use crate::models::{
    ProjectStats, PurgeReport, RecordStatus, Span, Trace, TraceDetail, TraceListQuery, TracePage,
};

/// Outcome of a completion request
#[derive(Debug, Clone, PartialEq)]
pub enum Completion<T> {
    /// The record was open and is now closed
    Completed(T),
    /// The record had already been closed; it is returned unchanged
    AlreadyCompleted(T),
}

impl<T> Completion<T> {
    /// The record after the request, whichever way it went
    pub fn record(&self) -> &T {
        match self {
            Self::Completed(record) | Self::AlreadyCompleted(record) => record,
        }
    }

    /// Consume into the record
    pub fn into_record(self) -> T {
        match self {
            Self::Completed(record) | Self::AlreadyCompleted(record) => record,
        }
    }

    /// Whether this request was a repeat
    pub fn is_repeat(&self) -> bool {
        matches!(self, Self::AlreadyCompleted(_))
    }

    /// Wire label: `completed` or `already_completed`
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::AlreadyCompleted(_) => "already_completed",
        }
    }
}

/// Fields written when a span closes
#[derive(Debug, Clone, PartialEq)]
pub struct SpanCompletion {
    /// Requested end time; clamped to the start time
    pub end_time: DateTime<Utc>,
    /// `Completed` or `Error`
    pub status: RecordStatus,
    /// Output to store
    pub output_data: serde_json::Value,
    /// Prompt tokens; kept when absent
    pub tokens_input: Option<i64>,
    /// Completion tokens; kept when absent
    pub tokens_output: Option<i64>,
    /// Cost in USD; kept when absent
    pub cost_usd: Option<f64>,
    /// Failure message
    pub error: Option<String>,
    /// Replacement for the stored input when size limits forced it smaller
    pub input_data: Option<serde_json::Value>,
    /// Replacement for the stored metadata when size limits forced it smaller
    pub metadata: Option<serde_json::Value>,
}

impl SpanCompletion {
    /// Close `span` in place. The end time never precedes the start time.
    pub fn apply(&self, span: &mut Span) {
        span.end_time = Some(self.end_time.max(span.start_time));
        span.calculate_duration();
        span.status = self.status;
        span.output_data = self.output_data.clone();
        if self.tokens_input.is_some() {
            span.tokens_input = self.tokens_input;
        }
        if self.tokens_output.is_some() {
            span.tokens_output = self.tokens_output;
        }
        if self.cost_usd.is_some() {
            span.cost_usd = self.cost_usd;
        }
        span.error = self.error.clone();
        if let Some(input) = &self.input_data {
            span.input_data = input.clone();
        }
        if let Some(metadata) = &self.metadata {
            span.metadata = metadata.clone();
        }
    }
}

/// Fields written when a trace closes
#[derive(Debug, Clone, PartialEq)]
pub struct TraceCompletion {
    /// Requested end time; clamped to the start time
    pub end_time: DateTime<Utc>,
    /// `Completed` or `Error`
    pub status: RecordStatus,
    /// Final output
    pub output: Option<String>,
    /// Failure message
    pub error: Option<String>,
    /// Replacement for the stored metadata when size limits forced it smaller
    pub metadata: Option<serde_json::Value>,
}

impl TraceCompletion {
    /// Write the caller-supplied fields; totals are filled in by the store
    pub fn apply_fields(&self, trace: &mut Trace) {
        trace.output = self.output.clone();
        trace.error = self.error.clone();
        if let Some(metadata) = &self.metadata {
            trace.metadata = metadata.clone();
        }
    }
}

/// Persistence operations shared by every backend
#[async_trait]
pub trait TraceStore: Send + Sync {
    /// Short backend name reported by the health endpoint
    fn kind(&self) -> &'static str;

    /// Insert a trace unless its id exists. Returns whether it was inserted.
    async fn put_trace(&self, trace: &Trace) -> Result<bool>;

    /// Insert a span unless its id exists. Returns whether it was inserted.
    async fn put_span(&self, span: &Span) -> Result<bool>;

    /// A trace record without its spans
    async fn get_trace_record(&self, trace_id: &str) -> Result<Option<Trace>>;

    /// A trace with all its retained spans, unordered
    async fn get_trace(&self, trace_id: &str) -> Result<Option<TraceDetail>>;

    /// A single span
    async fn get_span(&self, span_id: &str) -> Result<Option<Span>>;

    /// Close a span if it is still open
    async fn complete_span(
        &self,
        span_id: &str,
        completion: SpanCompletion,
    ) -> Result<Completion<Span>>;

    /// Close a trace if it is still open, aggregating its spans exactly once
    async fn complete_trace(
        &self,
        trace_id: &str,
        completion: TraceCompletion,
    ) -> Result<Completion<Trace>>;

    /// One page of a project's traces, newest first
    async fn list_traces(&self, query: &TraceListQuery) -> Result<TracePage>;

    /// Running aggregates of a project
    async fn get_stats(&self, project_id: &str) -> Result<ProjectStats>;

    /// Remove records whose retention elapsed before `now`
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeReport>;

    /// Verify the backend can serve requests
    async fn health_check(&self) -> Result<()>;
}

/// Sort key a listing resumes after
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorKey {
    /// Start time of the last trace served
    #[serde(rename = "t")]
    pub start_time: DateTime<Utc>,
    /// Id of the last trace served, breaks start time ties
    #[serde(rename = "id")]
    pub trace_id: String,
}

impl CursorKey {
    /// Position of `trace` in the listing order
    pub fn of(trace: &Trace) -> Self {
        Self {
            start_time: trace.start_time,
            trace_id: trace.trace_id.clone(),
        }
    }

    /// Opaque URL-safe token
    pub fn encode(&self) -> Result<String> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?))
    }

    /// Parse a token produced by [`CursorKey::encode`]
    pub fn decode(token: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| Error::validation("invalid cursor"))?;
        serde_json::from_slice(&bytes).map_err(|_| Error::validation("invalid cursor"))
    }
}

/// Decode the query's cursor, if any, after checking the page size
pub(crate) fn start_after(query: &TraceListQuery) -> Result<Option<CursorKey>> {
    query.validate()?;
    query.cursor.as_deref().map(CursorKey::decode).transpose()
}

/// Cut a `limit + 1` look-ahead fetch down to one page
pub(crate) fn into_page(mut traces: Vec<Trace>, limit: usize) -> Result<TracePage> {
    let next_cursor = if traces.len() > limit {
        traces.truncate(limit);
        traces.last().map(|last| CursorKey::of(last).encode()).transpose()?
    } else {
        None
    };
    Ok(TracePage::new(traces, next_cursor))
}

/// Open the backend selected in the configuration
pub async fn open_store(config: &Config) -> Result<Arc<dyn TraceStore>> {
    match config.database.backend {
        StorageBackend::Memory => {
            info!("Using in-memory trace store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Postgres => {
            let store = PostgresStore::connect(&config.database).await?;
            store.migrate().await?;
            info!("Using PostgreSQL trace store");
            Ok(Arc::new(store))
        }
    }
}

/// Run [`TraceStore::purge_expired`] every `every` until the task is aborted
pub fn spawn_purge_task(store: Arc<dyn TraceStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Retention sweep running every {:?}", every);

        loop {
            ticker.tick().await;
            match store.purge_expired(Utc::now()).await {
                Ok(report) if report.traces + report.spans > 0 => {
                    info!(traces = report.traces, spans = report.spans, "Purged expired records");
                    metrics::counter!("llmtracer_purged_records_total", "kind" => "trace")
                        .increment(report.traces);
                    metrics::counter!("llmtracer_purged_records_total", "kind" => "span")
                        .increment(report.spans);
                }
                Ok(_) => debug!("Retention sweep found nothing to purge"),
                Err(e) => warn!(error = %e, "Retention sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn cursor_survives_encoding() {
        let key = CursorKey {
            start_time: Utc::now(),
            trace_id: "t-42".to_string(),
        };
        let token = key.encode().unwrap();
        assert!(!token.contains('='));
        assert!(!token.contains('+') && !token.contains('/'));
        assert_eq!(CursorKey::decode(&token).unwrap(), key);
    }

    #[test]
    fn garbage_cursor_is_a_validation_error() {
        for token in ["%%%", "bm90IGpzb24", ""] {
            let err = CursorKey::decode(token).unwrap_err();
            assert_eq!(err.code(), "validation_error", "token {token:?}");
        }
    }

    #[test]
    fn look_ahead_row_becomes_the_cursor_boundary() {
        let now = Utc::now();
        let traces: Vec<Trace> = (0..3)
            .map(|i| Trace::new(format!("t{i}"), "p", "n", now - Duration::seconds(i), Duration::days(1)))
            .collect();

        let page = into_page(traces.clone(), 2).unwrap();
        assert_eq!(page.count, 2);
        assert!(page.has_more);
        let cursor = CursorKey::decode(page.next_cursor.as_deref().unwrap()).unwrap();
        assert_eq!(cursor.trace_id, "t1");

        let last = into_page(traces, 3).unwrap();
        assert!(!last.has_more);
        assert!(last.next_cursor.is_none());
    }

    #[test]
    fn span_completion_clamps_end_time_and_keeps_existing_usage() {
        let start = Utc::now();
        let mut span = Span::new("s", "t", "call", crate::models::SpanType::Llm, start, Duration::days(1));
        span.tokens_input = Some(7);

        SpanCompletion {
            end_time: start - Duration::seconds(5),
            status: RecordStatus::Completed,
            output_data: serde_json::json!({"answer": 42}),
            tokens_input: None,
            tokens_output: Some(3),
            cost_usd: None,
            error: None,
            input_data: None,
            metadata: None,
        }
        .apply(&mut span);

        assert_eq!(span.end_time, Some(start));
        assert_eq!(span.duration_ms, Some(0));
        assert_eq!(span.total_tokens(), 10);
        assert_eq!(span.status, RecordStatus::Completed);
    }

    #[tokio::test]
    async fn purge_task_sweeps_expired_traces() {
        let store: Arc<dyn TraceStore> = Arc::new(MemoryStore::new());
        let old = Trace::new("old", "p", "n", Utc::now() - Duration::days(2), Duration::days(1));
        store.put_trace(&old).await.unwrap();
        assert_eq!(store.get_stats("p").await.unwrap().total_traces, 1);

        let task = spawn_purge_task(Arc::clone(&store), std::time::Duration::from_millis(10));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        task.abort();

        assert!(store.get_trace_record("old").await.unwrap().is_none());
        assert_eq!(store.get_stats("p").await.unwrap().total_traces, 0);
    }
}
