//! Span data model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::RecordStatus;
use crate::error::Error;

/// Kind of work a span represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanType {
    /// A model call
    Llm,
    /// A tool invocation
    Tool,
    /// An agent step
    Agent,
    /// A plain function
    Function,
    /// Document or vector retrieval
    Retrieval,
    /// Embedding computation
    Embedding,
    /// A chain of steps
    Chain,
    /// Anything else
    Other,
}

impl SpanType {
    /// Every accepted span type
    pub const ALL: [SpanType; 8] = [
        Self::Llm,
        Self::Tool,
        Self::Agent,
        Self::Function,
        Self::Retrieval,
        Self::Embedding,
        Self::Chain,
        Self::Other,
    ];

    /// Wire representation
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Tool => "tool",
            Self::Agent => "agent",
            Self::Function => "function",
            Self::Retrieval => "retrieval",
            Self::Embedding => "embedding",
            Self::Chain => "chain",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for SpanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpanType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                let allowed: Vec<&str> = Self::ALL.iter().map(|t| t.as_str()).collect();
                Error::validation(format!(
                    "invalid span_type '{s}', expected one of: {}",
                    allowed.join(", ")
                ))
            })
    }
}

/// A span represents a single operation within a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Unique identifier
    pub span_id: String,

    /// Trace this span belongs to
    pub trace_id: String,

    /// Parent span (None for a root span of the trace)
    pub parent_span_id: Option<String>,

    /// Name of the operation
    pub name: String,

    /// Kind of span
    pub span_type: SpanType,

    /// Lifecycle status
    pub status: RecordStatus,

    /// When the operation started
    pub start_time: DateTime<Utc>,

    /// When the operation ended; final once set
    pub end_time: Option<DateTime<Utc>>,

    /// Duration in milliseconds
    pub duration_ms: Option<i64>,

    /// Operation input
    pub input_data: serde_json::Value,

    /// Operation output
    pub output_data: serde_json::Value,

    /// Additional metadata
    pub metadata: serde_json::Value,

    // AI-specific fields
    /// Model name for llm spans (e.g. "gpt-4o")
    pub model: Option<String>,

    /// Input tokens
    pub tokens_input: Option<i64>,

    /// Output tokens
    pub tokens_output: Option<i64>,

    /// Cost in USD
    pub cost_usd: Option<f64>,

    /// Error message when the operation failed
    pub error: Option<String>,

    /// After this instant the record may be purged
    pub ttl_expiry: DateTime<Utc>,
}

impl Span {
    /// Create an open span starting at `start_time`
    pub fn new(
        span_id: impl Into<String>,
        trace_id: impl Into<String>,
        name: impl Into<String>,
        span_type: SpanType,
        start_time: DateTime<Utc>,
        retention: Duration,
    ) -> Self {
        Self {
            span_id: span_id.into(),
            trace_id: trace_id.into(),
            parent_span_id: None,
            name: name.into(),
            span_type,
            status: RecordStatus::Open,
            start_time,
            end_time: None,
            duration_ms: None,
            input_data: serde_json::json!({}),
            output_data: serde_json::json!({}),
            metadata: serde_json::json!({}),
            model: None,
            tokens_input: None,
            tokens_output: None,
            cost_usd: None,
            error: None,
            ttl_expiry: start_time + retention,
        }
    }

    /// Calculate duration from start and end times
    pub fn calculate_duration(&mut self) {
        if let Some(end_time) = self.end_time {
            self.duration_ms = Some((end_time - self.start_time).num_milliseconds());
        }
    }

    /// Check if this span represents an LLM call
    pub fn is_llm_call(&self) -> bool {
        self.span_type == SpanType::Llm || self.model.is_some()
    }

    /// Get total tokens used, saturating at `i64::MAX`
    pub fn total_tokens(&self) -> i64 {
        self.tokens_input
            .unwrap_or(0)
            .saturating_add(self.tokens_output.unwrap_or(0))
    }

    /// Check if the span is complete
    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the retention window has elapsed at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl_expiry <= now
    }
}
