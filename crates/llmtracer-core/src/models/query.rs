//! Query and response types shared between API and storage layers

use serde::{Deserialize, Serialize};

use super::{RecordStatus, Trace};
use crate::error::{Error, Result};

/// Default page size for trace listings
pub const DEFAULT_PAGE_LIMIT: usize = 50;

/// Largest page a caller may request
pub const MAX_PAGE_LIMIT: usize = 1000;

/// Query parameters for listing a project's traces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceListQuery {
    /// Project to list (required, never taken from the caller's input)
    pub project_id: String,

    /// Resume point returned by the previous page
    pub cursor: Option<String>,

    /// Maximum number of results
    pub limit: usize,

    /// Filter by user
    pub user_id: Option<String>,

    /// Filter by session
    pub session_id: Option<String>,

    /// Filter by tags (any match)
    pub tags: Vec<String>,

    /// Filter by status
    pub status: Option<RecordStatus>,
}

impl TraceListQuery {
    /// First page of a project's traces with the default limit
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            cursor: None,
            limit: DEFAULT_PAGE_LIMIT,
            user_id: None,
            session_id: None,
            tags: Vec::new(),
            status: None,
        }
    }

    /// Set the page size
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Resume after a previous page
    pub fn with_cursor(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }

    /// Reject page sizes outside `1..=MAX_PAGE_LIMIT`
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 || self.limit > MAX_PAGE_LIMIT {
            return Err(Error::validation(format!(
                "limit must be between 1 and {MAX_PAGE_LIMIT}, got {}",
                self.limit
            )));
        }
        Ok(())
    }

    /// Whether a trace passes the post-index filters
    pub fn matches(&self, trace: &Trace) -> bool {
        if let Some(user_id) = &self.user_id {
            if trace.user_id.as_ref() != Some(user_id) {
                return false;
            }
        }
        if let Some(session_id) = &self.session_id {
            if trace.session_id.as_ref() != Some(session_id) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if trace.status != status {
                return false;
            }
        }
        self.tags.is_empty() || self.tags.iter().any(|tag| trace.tags.contains(tag))
    }
}

/// One page of traces, newest first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracePage {
    /// Traces on this page
    pub traces: Vec<Trace>,

    /// Cursor for the next page; absent once the listing is exhausted
    pub next_cursor: Option<String>,

    /// Whether another page exists
    pub has_more: bool,

    /// Number of traces on this page
    pub count: usize,
}

impl TracePage {
    /// Assemble a page, deriving `has_more` and `count`
    pub fn new(traces: Vec<Trace>, next_cursor: Option<String>) -> Self {
        Self {
            count: traces.len(),
            has_more: next_cursor.is_some(),
            traces,
            next_cursor,
        }
    }
}

/// Running aggregates for one project
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectStats {
    /// Retained traces
    pub total_traces: i64,

    /// Spans of completed traces
    pub total_spans: i64,

    /// Tokens of completed traces
    pub total_tokens: i64,

    /// Cost of completed traces in USD
    pub total_cost: f64,
}

/// Outcome of a retention sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// Traces removed
    pub traces: u64,

    /// Spans removed
    pub spans: u64,
}
