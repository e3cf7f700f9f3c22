//! Trace data model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{RecordStatus, Span};

/// A trace represents one end-to-end unit of work (e.g. one agent run)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    /// Unique identifier, immutable after creation
    pub trace_id: String,

    /// Owning project, derived from the caller's API key
    pub project_id: String,

    /// Human-readable name
    pub name: String,

    /// Lifecycle status
    pub status: RecordStatus,

    /// When the trace started
    pub start_time: DateTime<Utc>,

    /// When the trace ended (if completed)
    pub end_time: Option<DateTime<Utc>>,

    /// Total duration in milliseconds
    pub duration_ms: Option<i64>,

    /// Final output
    pub output: Option<String>,

    /// Error message when the trace failed
    pub error: Option<String>,

    /// Additional metadata
    pub metadata: serde_json::Value,

    /// Tags for filtering
    pub tags: Vec<String>,

    /// End user the trace was recorded for
    pub user_id: Option<String>,

    /// Session the trace belongs to
    pub session_id: Option<String>,

    // Denormalized at completion time
    /// Number of spans in this trace
    pub span_count: i64,

    /// Input plus output tokens across all spans
    pub total_tokens: i64,

    /// Total cost in USD across all spans
    pub total_cost_usd: f64,

    /// After this instant the record may be purged
    pub ttl_expiry: DateTime<Utc>,
}

/// A trace with all its spans
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceDetail {
    /// The trace
    pub trace: Trace,

    /// All spans in this trace, unordered
    pub spans: Vec<Span>,
}

/// Aggregates stored on a trace when it completes
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TraceTotals {
    /// Number of spans
    pub span_count: i64,
    /// Sum of input and output tokens
    pub total_tokens: i64,
    /// Sum of span costs
    pub total_cost_usd: f64,
}

impl TraceTotals {
    /// Aggregate a trace's spans once; counts saturate instead of wrapping
    pub fn from_spans<'a>(spans: impl IntoIterator<Item = &'a Span>) -> Self {
        spans.into_iter().fold(Self::default(), |mut acc, span| {
            acc.span_count = acc.span_count.saturating_add(1);
            acc.total_tokens = acc.total_tokens.saturating_add(span.total_tokens());
            acc.total_cost_usd += span.cost_usd.unwrap_or(0.0);
            acc
        })
    }
}

impl Trace {
    /// Create an open trace starting at `start_time`
    pub fn new(
        trace_id: impl Into<String>,
        project_id: impl Into<String>,
        name: impl Into<String>,
        start_time: DateTime<Utc>,
        retention: Duration,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            project_id: project_id.into(),
            name: name.into(),
            status: RecordStatus::Open,
            start_time,
            end_time: None,
            duration_ms: None,
            output: None,
            error: None,
            metadata: serde_json::json!({}),
            tags: Vec::new(),
            user_id: None,
            session_id: None,
            span_count: 0,
            total_tokens: 0,
            total_cost_usd: 0.0,
            ttl_expiry: start_time + retention,
        }
    }

    /// Check if the trace is complete
    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the retention window has elapsed at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl_expiry <= now
    }

    /// Close the trace at `end_time`; `end_time` is clamped to `start_time`
    pub fn finish(&mut self, end_time: DateTime<Utc>, status: RecordStatus, totals: TraceTotals) {
        let end_time = end_time.max(self.start_time);
        self.end_time = Some(end_time);
        self.duration_ms = Some((end_time - self.start_time).num_milliseconds());
        self.status = status;
        self.span_count = totals.span_count;
        self.total_tokens = totals.total_tokens;
        self.total_cost_usd = totals.total_cost_usd;
    }

    /// Aggregates currently stored on the record
    pub fn totals(&self) -> TraceTotals {
        TraceTotals {
            span_count: self.span_count,
            total_tokens: self.total_tokens,
            total_cost_usd: self.total_cost_usd,
        }
    }
}

impl TraceDetail {
    /// Nested span forest for display
    pub fn tree(&self) -> Vec<crate::tree::SpanNode<'_>> {
        crate::tree::build_forest(&self.spans)
    }
}
