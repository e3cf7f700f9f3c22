//! Trace and span handles
//!
//! Every handle knows its trace and the stack of spans open in its flow of
//! execution. Parents are always explicit: a span opened from a
//! [`SpanHandle`] is that span's child, a span opened from a [`TraceHandle`]
//! is a root. A flow that splits into concurrent branches calls `fork()` to
//! get a [`Branch`] with a stack of its own.
//!
//! The `in_*` (async) and `with_*` (blocking) helpers run a body inside a
//! trace or span and close it from the body's `Result` on every return path,
//! early `?` returns included. Only a panic or a cancelled future leaves the
//! record open.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Delivery, Event, Sink, TracerConfig};
use crate::ingest::{NewSpan, NewTrace, SpanUpdate, TraceUpdate};
use crate::models::SpanType;

type Stack = Arc<Mutex<Vec<String>>>;

/// Optional attributes of a new trace
#[derive(Debug, Clone, Default)]
pub struct TraceOptions {
    /// Arbitrary key/value attributes
    pub metadata: Option<Value>,
    /// Labels for filtering
    pub tags: Vec<String>,
    /// End user the trace is recorded for
    pub user_id: Option<String>,
    /// Conversation or session the trace belongs to
    pub session_id: Option<String>,
}

/// Optional attributes of a new span
#[derive(Debug, Clone, Default)]
pub struct SpanOptions {
    /// Input of the operation
    pub input_data: Option<Value>,
    /// Arbitrary key/value attributes
    pub metadata: Option<Value>,
    /// Model name, for llm spans
    pub model: Option<String>,
}

/// What a successful span produced
#[derive(Debug, Clone, Default)]
pub struct SpanOutput {
    /// Result of the operation
    pub output_data: Option<Value>,
    /// Prompt tokens
    pub tokens_input: Option<i64>,
    /// Completion tokens
    pub tokens_output: Option<i64>,
    /// Cost in USD
    pub cost_usd: Option<f64>,
    /// Merged into the span's metadata
    pub metadata: Option<Value>,
}

impl SpanOutput {
    /// Output carrying `data`
    pub fn new(data: Value) -> Self {
        Self {
            output_data: Some(data),
            ..Self::default()
        }
    }

    /// Token usage of the operation
    #[must_use]
    pub fn tokens(mut self, input: i64, output: i64) -> Self {
        self.tokens_input = Some(input);
        self.tokens_output = Some(output);
        self
    }

    /// Cost of the operation in USD
    #[must_use]
    pub fn cost(mut self, usd: f64) -> Self {
        self.cost_usd = Some(usd);
        self
    }

    fn into_update(self) -> SpanUpdate {
        SpanUpdate {
            output_data: self.output_data,
            error: None,
            tokens_input: self.tokens_input,
            tokens_output: self.tokens_output,
            cost_usd: self.cost_usd,
            metadata: self.metadata,
        }
    }
}

/// Entry point of the client: opens traces
pub struct Tracer<S> {
    sink: S,
    enabled: bool,
    project_id: Option<String>,
}

impl<S: Sink + Clone> Tracer<S> {
    /// A tracer delivering to `sink`; disabled unless `config` is active
    pub fn new(sink: S, config: &TracerConfig) -> Self {
        let enabled = config.is_active();
        if enabled {
            info!(url = %config.base_url, "Tracing enabled");
        } else {
            info!("Tracing disabled, handles will record nothing");
        }
        Self {
            sink,
            enabled,
            project_id: config.project_id.clone(),
        }
    }

    /// A tracer that never delivers anything
    pub fn disabled(sink: S) -> Self {
        Self {
            sink,
            enabled: false,
            project_id: None,
        }
    }

    /// Whether events reach the sink
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Open a trace
    pub fn begin_trace(&self, name: impl Into<String>, options: TraceOptions) -> TraceHandle<S> {
        let flow = Flow {
            sink: self.sink.clone(),
            enabled: self.enabled,
            trace_id: Uuid::new_v4().to_string(),
            stack: Stack::default(),
        };
        flow.submit(Event::TraceStarted(NewTrace {
            trace_id: Some(flow.trace_id.clone()),
            name: name.into(),
            project_id: self.project_id.clone(),
            metadata: options.metadata,
            tags: options.tags,
            user_id: options.user_id,
            session_id: options.session_id,
        }));
        TraceHandle { flow, open: true }
    }

    /// Run `body` as a whole trace and close the trace from its result
    ///
    /// The body's [`Branch`] opens root spans of the trace.
    pub async fn in_trace<T, E, F, Fut>(
        &self,
        name: impl Into<String>,
        options: TraceOptions,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Branch<S>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize,
        E: fmt::Display,
    {
        let trace = self.begin_trace(name, options);
        let result = body(trace.fork()).await;
        trace.end_with(&result);
        result
    }

    /// Blocking form of [`Tracer::in_trace`]
    pub fn with_trace<T, E, F>(&self, name: impl Into<String>, options: TraceOptions, body: F) -> Result<T, E>
    where
        F: FnOnce(Branch<S>) -> Result<T, E>,
        T: Serialize,
        E: fmt::Display,
    {
        let trace = self.begin_trace(name, options);
        let result = body(trace.fork());
        trace.end_with(&result);
        result
    }
}

async fn run_in_span<S, T, E, F, Fut>(span: SpanHandle<S>, body: F) -> Result<T, E>
where
    S: Sink + Clone,
    F: FnOnce(Branch<S>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    T: Serialize,
    E: fmt::Display,
{
    let result = body(span.fork()).await;
    span.end_with(&result);
    result
}

fn run_with_span<S, T, E, F>(span: SpanHandle<S>, body: F) -> Result<T, E>
where
    S: Sink + Clone,
    F: FnOnce(Branch<S>) -> Result<T, E>,
    T: Serialize,
    E: fmt::Display,
{
    let result = body(span.fork());
    span.end_with(&result);
    result
}

/// Scope helpers shared by every handle that can open spans
macro_rules! span_scopes {
    ($handle:ident) => {
        impl<S: Sink + Clone> $handle<S> {
            /// Run `body` inside a new span and close the span from its result
            ///
            /// The body's [`Branch`] opens children of the new span.
            pub async fn in_span<T, E, F, Fut>(
                &self,
                name: impl Into<String>,
                span_type: SpanType,
                options: SpanOptions,
                body: F,
            ) -> Result<T, E>
            where
                F: FnOnce(Branch<S>) -> Fut,
                Fut: Future<Output = Result<T, E>>,
                T: Serialize,
                E: fmt::Display,
            {
                run_in_span(self.begin_span(name, span_type, options), body).await
            }

            /// Blocking form of `in_span`
            pub fn with_span<T, E, F>(
                &self,
                name: impl Into<String>,
                span_type: SpanType,
                options: SpanOptions,
                body: F,
            ) -> Result<T, E>
            where
                F: FnOnce(Branch<S>) -> Result<T, E>,
                T: Serialize,
                E: fmt::Display,
            {
                run_with_span(self.begin_span(name, span_type, options), body)
            }
        }
    };
}

span_scopes!(TraceHandle);
span_scopes!(SpanHandle);
span_scopes!(Branch);

/// One flow of execution inside a trace
struct Flow<S> {
    sink: S,
    enabled: bool,
    trace_id: String,
    stack: Stack,
}

impl<S: Sink + Clone> Flow<S> {
    fn submit(&self, event: Event) -> Delivery {
        if !self.enabled {
            return Delivery::Disabled;
        }
        self.sink.submit(event)
    }

    /// Same flow, same stack
    fn share(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            enabled: self.enabled,
            trace_id: self.trace_id.clone(),
            stack: Arc::clone(&self.stack),
        }
    }

    /// Same trace, empty stack
    fn fork(&self) -> Self {
        Self {
            stack: Stack::default(),
            ..self.share()
        }
    }

    fn open_span(
        &self,
        parent_span_id: Option<String>,
        name: String,
        span_type: SpanType,
        options: SpanOptions,
    ) -> SpanHandle<S> {
        let span_id = Uuid::new_v4().to_string();
        self.stack.lock().push(span_id.clone());
        self.submit(Event::SpanStarted {
            trace_id: self.trace_id.clone(),
            span: NewSpan {
                span_id: Some(span_id.clone()),
                name,
                span_type: span_type.as_str().to_string(),
                parent_span_id: parent_span_id.clone(),
                input_data: options.input_data,
                metadata: options.metadata,
                model: options.model,
                ..NewSpan::default()
            },
        });
        SpanHandle {
            flow: self.share(),
            span_id,
            parent_span_id,
            open: true,
        }
    }

    /// Remove `span_id` from the stack; false when it was not on top
    fn pop(&self, span_id: &str) -> bool {
        let mut stack = self.stack.lock();
        match stack.iter().rposition(|id| id == span_id) {
            Some(pos) if pos + 1 == stack.len() => {
                stack.pop();
                true
            }
            Some(pos) => {
                stack.remove(pos);
                false
            }
            None => false,
        }
    }

    fn depth(&self) -> usize {
        self.stack.lock().len()
    }
}

/// An open trace
pub struct TraceHandle<S: Sink + Clone> {
    flow: Flow<S>,
    open: bool,
}

impl<S: Sink + Clone> TraceHandle<S> {
    /// Id of the trace
    pub fn id(&self) -> &str {
        &self.flow.trace_id
    }

    /// Open a root span of the trace
    pub fn begin_span(
        &self,
        name: impl Into<String>,
        span_type: SpanType,
        options: SpanOptions,
    ) -> SpanHandle<S> {
        self.flow.open_span(None, name.into(), span_type, options)
    }

    /// A branch for work running concurrently with this flow
    pub fn fork(&self) -> Branch<S> {
        Branch {
            flow: self.flow.fork(),
            parent_span_id: None,
        }
    }

    /// Close the trace with its final output
    pub fn end(self, output: impl Into<String>) -> Delivery {
        self.finish(TraceUpdate {
            output: Some(output.into()),
            ..TraceUpdate::default()
        })
    }

    /// Close the trace as failed
    pub fn end_error(self, error: impl fmt::Display) -> Delivery {
        self.finish(TraceUpdate {
            error: Some(error.to_string()),
            ..TraceUpdate::default()
        })
    }

    /// Close the trace from the result of the work it measured. An `Ok`
    /// string becomes the output as is, other values their JSON text.
    pub fn end_with<T, E>(self, result: &Result<T, E>) -> Delivery
    where
        T: Serialize,
        E: fmt::Display,
    {
        match result {
            Ok(value) => {
                let output = match serde_json::to_value(value) {
                    Ok(Value::Null) => None,
                    Ok(Value::String(text)) => Some(text),
                    Ok(other) => Some(other.to_string()),
                    Err(e) => {
                        warn!(trace_id = %self.flow.trace_id, error = %e, "Trace output is not serializable");
                        None
                    }
                };
                self.finish(TraceUpdate {
                    output,
                    ..TraceUpdate::default()
                })
            }
            Err(e) => self.end_error(e),
        }
    }

    fn finish(mut self, update: TraceUpdate) -> Delivery {
        self.open = false;
        let still_open = self.flow.depth();
        if still_open > 0 {
            warn!(trace_id = %self.flow.trace_id, open_spans = still_open, "Trace ended before its spans");
        }
        self.flow.submit(Event::TraceEnded {
            trace_id: self.flow.trace_id.clone(),
            update,
        })
    }
}

impl<S: Sink + Clone> Drop for TraceHandle<S> {
    fn drop(&mut self) {
        if self.open {
            debug!(trace_id = %self.flow.trace_id, "Trace handle dropped without ending, trace stays open");
        }
    }
}

/// An open span
pub struct SpanHandle<S: Sink + Clone> {
    flow: Flow<S>,
    span_id: String,
    parent_span_id: Option<String>,
    open: bool,
}

impl<S: Sink + Clone> SpanHandle<S> {
    /// Id of the span
    pub fn id(&self) -> &str {
        &self.span_id
    }

    /// Id of the span's parent, none for a root span
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_span_id.as_deref()
    }

    /// Id of the span's trace
    pub fn trace_id(&self) -> &str {
        &self.flow.trace_id
    }

    /// Open a child span
    pub fn begin_span(
        &self,
        name: impl Into<String>,
        span_type: SpanType,
        options: SpanOptions,
    ) -> SpanHandle<S> {
        self.flow
            .open_span(Some(self.span_id.clone()), name.into(), span_type, options)
    }

    /// A branch whose spans are children of this span
    pub fn fork(&self) -> Branch<S> {
        Branch {
            flow: self.flow.fork(),
            parent_span_id: Some(self.span_id.clone()),
        }
    }

    /// Close the span successfully
    pub fn end(self, output: SpanOutput) -> Delivery {
        self.finish(output.into_update())
    }

    /// Close the span as failed
    pub fn end_error(self, error: impl fmt::Display) -> Delivery {
        self.finish(SpanUpdate {
            error: Some(error.to_string()),
            ..SpanUpdate::default()
        })
    }

    /// Close the span from the result of the operation it measured. An `Ok`
    /// value becomes the output (wrapped as `{"result": ..}` unless it is an
    /// object).
    pub fn end_with<T, E>(self, result: &Result<T, E>) -> Delivery
    where
        T: Serialize,
        E: fmt::Display,
    {
        match result {
            Ok(value) => {
                let output = match serde_json::to_value(value) {
                    Ok(object @ Value::Object(_)) => object,
                    Ok(other) => json!({ "result": other }),
                    Err(e) => {
                        warn!(span_id = %self.span_id, error = %e, "Span output is not serializable");
                        json!({})
                    }
                };
                self.end(SpanOutput::new(output))
            }
            Err(e) => self.end_error(e),
        }
    }

    fn finish(mut self, update: SpanUpdate) -> Delivery {
        self.open = false;
        if !self.flow.pop(&self.span_id) {
            warn!(
                span_id = %self.span_id,
                trace_id = %self.flow.trace_id,
                "Span ended out of order, closing it anyway"
            );
        }
        self.flow.submit(Event::SpanEnded {
            span_id: self.span_id.clone(),
            update,
        })
    }
}

impl<S: Sink + Clone> Drop for SpanHandle<S> {
    fn drop(&mut self) {
        if self.open {
            self.flow.pop(&self.span_id);
            debug!(
                span_id = %self.span_id,
                trace_id = %self.flow.trace_id,
                "Span handle dropped without ending, span stays open"
            );
        }
    }
}

/// Starting point for spans of a concurrent branch
pub struct Branch<S> {
    flow: Flow<S>,
    parent_span_id: Option<String>,
}

impl<S: Sink + Clone> Branch<S> {
    /// Id of the branch's trace
    pub fn trace_id(&self) -> &str {
        &self.flow.trace_id
    }

    /// Open a span under the point the branch was forked from
    pub fn begin_span(
        &self,
        name: impl Into<String>,
        span_type: SpanType,
        options: SpanOptions,
    ) -> SpanHandle<S> {
        self.flow
            .open_span(self.parent_span_id.clone(), name.into(), span_type, options)
    }
}
