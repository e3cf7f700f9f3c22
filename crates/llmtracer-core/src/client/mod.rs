//! Tracing client
//!
//! Instruments an application with traces and spans and ships their
//! lifecycle events to the ingestion service. Tracing never gets in the
//! application's way: every failure is logged as a warning and reported as
//! [`Delivery::Degraded`], nothing is raised to the caller.
//!
//! Two delivery modes exist:
//!
//! * [`Dispatcher`]: a background tokio task fed through a bounded queue.
//!   Submitting never waits; use [`Dispatcher::flush`] to wait for delivery.
//! * [`BlockingTransport`] behind an `Rc`: every event is sent before the
//!   call returns. Handles of this mode are neither `Send` nor `Sync`.
//!
//! ```no_run
//! use llmtracer::client::{scoped, SpanOutput, TracerConfig};
//! use llmtracer::models::SpanType;
//!
//! # async fn run() {
//! scoped(TracerConfig::from_env(), |tracer| async move {
//!     let trace = tracer.begin_trace("user-query", Default::default());
//!     let span = trace.begin_span("answer", SpanType::Llm, Default::default());
//!     span.end(SpanOutput::default());
//!     trace.end("done");
//! })
//! .await;
//! # }
//! ```

mod dispatch;
mod stack;
mod transport;

pub use dispatch::{DispatchStats, Dispatcher};
pub use stack::{Branch, SpanHandle, SpanOptions, SpanOutput, TraceHandle, TraceOptions, Tracer};
pub use transport::{BlockingTransport, HttpTransport};

use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::ingest::{NewSpan, NewTrace, SpanUpdate, TraceUpdate};

/// Default service address
pub const DEFAULT_URL: &str = "http://localhost:8001";

/// Per-request timeout; tracing must never hold the application up for long
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Events buffered by a [`Dispatcher`] before new ones are dropped
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Client settings
#[derive(Debug, Clone, PartialEq)]
pub struct TracerConfig {
    /// Base URL of the ingestion service
    pub base_url: String,
    /// Sent as `X-API-Key`
    pub api_key: Option<String>,
    /// Project of the traces; derived from the key when absent
    pub project_id: Option<String>,
    /// Master switch
    pub enabled: bool,
    /// Per-request timeout
    pub timeout: Duration,
    /// Queue size of the background dispatcher
    pub queue_capacity: usize,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_URL.to_string(),
            api_key: None,
            project_id: None,
            enabled: true,
            timeout: DEFAULT_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl TracerConfig {
    /// Settings from `TRACER_URL`, `TRACER_API_KEY`, `TRACER_PROJECT_ID` and
    /// `TRACING_ENABLED`
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Settings from an arbitrary variable lookup
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |name: &str| var(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_key = non_empty("TRACER_API_KEY");
        let project_id = non_empty("TRACER_PROJECT_ID")
            .or_else(|| api_key.as_deref().and_then(project_from_key));

        Self {
            base_url: non_empty("TRACER_URL").unwrap_or_else(|| DEFAULT_URL.to_string()),
            api_key,
            project_id,
            enabled: non_empty("TRACING_ENABLED").map_or(true, |v| v.eq_ignore_ascii_case("true")),
            ..Self::default()
        }
    }

    /// Whether events will actually be delivered
    pub fn is_active(&self) -> bool {
        self.enabled && self.api_key.is_some()
    }
}

fn project_from_key(key: &str) -> Option<String> {
    key.strip_prefix("project-")
        .filter(|p| !p.is_empty())
        .map(str::to_string)
}

/// Client-side failures. Never returned to instrumented code: they are
/// turned into [`Delivery::Degraded`] at the boundary.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The configured base URL is unusable
    #[error("invalid service URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The API key cannot be sent as a header
    #[error("invalid API key header: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),

    /// Network failure or timeout
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with a non-success status
    #[error("service responded {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, for the log
        body: String,
    },

    /// An event could not be encoded
    #[error("failed to encode event: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The dispatcher queue is full
    #[error("delivery queue is full")]
    QueueFull,

    /// The dispatcher was shut down
    #[error("dispatcher is shut down")]
    Closed,
}

/// Result of handing an event over for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The service acknowledged the event
    Delivered,
    /// Accepted by a [`Dispatcher`]; delivery happens in the background
    Queued,
    /// Tracing is disabled, nothing was sent
    Disabled,
    /// The event was lost; tracing degraded but the application goes on
    Degraded(String),
}

impl Delivery {
    /// Whether the event was lost
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(_))
    }
}

/// Log and count a lost event
pub(crate) fn degrade(kind: &'static str, error: &ClientError) -> Delivery {
    warn!(event = kind, error = %error, "Tracing degraded, event dropped");
    metrics::counter!("llmtracer_client_degraded_total", "event" => kind).increment(1);
    Delivery::Degraded(error.to_string())
}

/// A lifecycle event of a trace or span
#[derive(Debug, Clone)]
pub enum Event {
    /// A trace was opened
    TraceStarted(NewTrace),
    /// A span was opened in `trace_id`
    SpanStarted {
        /// Trace the span belongs to
        trace_id: String,
        /// The new span
        span: NewSpan,
    },
    /// A span was closed
    SpanEnded {
        /// Span being closed
        span_id: String,
        /// Fields recorded at the end
        update: SpanUpdate,
    },
    /// A trace was closed
    TraceEnded {
        /// Trace being closed
        trace_id: String,
        /// Fields recorded at the end
        update: TraceUpdate,
    },
}

impl Event {
    /// Short name for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TraceStarted(_) => "trace_started",
            Self::SpanStarted { .. } => "span_started",
            Self::SpanEnded { .. } => "span_ended",
            Self::TraceEnded { .. } => "trace_ended",
        }
    }
}

/// Where handles send their events
pub trait Sink {
    /// Hand over one event. Must not panic and must not raise.
    fn submit(&self, event: Event) -> Delivery;
}

impl<T: Sink + ?Sized> Sink for Rc<T> {
    fn submit(&self, event: Event) -> Delivery {
        (**self).submit(event)
    }
}

impl<T: Sink + ?Sized> Sink for Arc<T> {
    fn submit(&self, event: Event) -> Delivery {
        (**self).submit(event)
    }
}

/// Run `body` with a tracer whose dispatcher lives exactly as long as the
/// call: pending events are flushed and the connection released on return.
pub async fn scoped<F, Fut, T>(config: TracerConfig, body: F) -> T
where
    F: FnOnce(Tracer<Arc<Dispatcher>>) -> Fut,
    Fut: Future<Output = T>,
{
    let dispatcher = Arc::new(Dispatcher::spawn(&config));
    let tracer = Tracer::new(Arc::clone(&dispatcher), &config);

    let output = body(tracer).await;

    dispatcher.shutdown().await;
    info!("Tracing scope closed");
    output
}
