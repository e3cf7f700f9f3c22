//! HTTP delivery of lifecycle events

use std::cell::Cell;
use std::marker::PhantomData;

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::{degrade, ClientError, Delivery, Event, Sink, TracerConfig};
use crate::api::middleware::API_KEY_HEADER;

/// Longest slice of an error body kept in a degradation reason
const MAX_REASON_CHARS: usize = 200;

/// A request ready to be sent
struct Outgoing {
    method: Method,
    url: Url,
    body: Value,
}

impl Outgoing {
    fn for_event(base: &Url, event: &Event) -> Result<Self, ClientError> {
        let (method, path, body) = match event {
            Event::TraceStarted(trace) => (Method::POST, "traces".to_string(), serde_json::to_value(trace)?),
            Event::SpanStarted { trace_id, span } => (
                Method::POST,
                format!("traces/{trace_id}/spans"),
                serde_json::to_value(span)?,
            ),
            Event::SpanEnded { span_id, update } => (
                Method::PATCH,
                format!("spans/{span_id}/complete"),
                serde_json::to_value(update)?,
            ),
            Event::TraceEnded { trace_id, update } => (
                Method::PATCH,
                format!("traces/{trace_id}/complete"),
                serde_json::to_value(update)?,
            ),
        };
        Ok(Self {
            method,
            url: base.join(&path)?,
            body,
        })
    }
}

/// Base URL with a trailing slash so relative joins keep its path
fn base_url(raw: &str) -> Result<Url, ClientError> {
    let mut raw = raw.trim().trim_end_matches('/').to_string();
    raw.push('/');
    Ok(Url::parse(&raw)?)
}

fn default_headers(config: &TracerConfig) -> Result<HeaderMap, ClientError> {
    let mut headers = HeaderMap::new();
    if let Some(key) = config.api_key.as_deref() {
        headers.insert(API_KEY_HEADER, HeaderValue::from_str(key)?);
    }
    Ok(headers)
}

/// Map a response to an acknowledgement. Repeats of an earlier event
/// (`already_exists`, `already_completed`) count as delivered.
fn acknowledge(event: &Event, status: StatusCode, body: &str) -> Result<(), ClientError> {
    if !status.is_success() {
        return Err(ClientError::Status {
            status: status.as_u16(),
            body: body.chars().take(MAX_REASON_CHARS).collect(),
        });
    }
    if body.contains("already_completed") || body.contains("already_exists") {
        debug!(event = event.kind(), "Service already had this event");
    }
    Ok(())
}

/// Asynchronous transport
#[derive(Clone)]
pub struct HttpTransport {
    base_url: Url,
    http: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport for the service in `config`
    pub fn new(config: &TracerConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .default_headers(default_headers(config)?)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            base_url: base_url(&config.base_url)?,
            http,
        })
    }

    /// Deliver one event; failures are logged and reported, never raised
    pub async fn send(&self, event: &Event) -> Delivery {
        match self.try_send(event).await {
            Ok(()) => Delivery::Delivered,
            Err(e) => degrade(event.kind(), &e),
        }
    }

    async fn try_send(&self, event: &Event) -> Result<(), ClientError> {
        let outgoing = Outgoing::for_event(&self.base_url, event)?;
        let response = self
            .http
            .request(outgoing.method, outgoing.url)
            .json(&outgoing.body)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        acknowledge(event, status, &body)
    }
}

/// Synchronous transport for single-threaded call sites.
///
/// Sends each event before returning. It is deliberately not `Sync`: share
/// it through an `Rc`, which keeps the handles using it on one thread.
/// Must not be used from inside an async runtime.
pub struct BlockingTransport {
    base_url: Url,
    http: reqwest::blocking::Client,
    _single_thread: PhantomData<Cell<()>>,
}

impl BlockingTransport {
    /// Build a transport for the service in `config`
    pub fn new(config: &TracerConfig) -> Result<Self, ClientError> {
        let http = reqwest::blocking::Client::builder()
            .default_headers(default_headers(config)?)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            base_url: base_url(&config.base_url)?,
            http,
            _single_thread: PhantomData,
        })
    }

    /// Deliver one event; failures are logged and reported, never raised
    pub fn send(&self, event: &Event) -> Delivery {
        match self.try_send(event) {
            Ok(()) => Delivery::Delivered,
            Err(e) => degrade(event.kind(), &e),
        }
    }

    fn try_send(&self, event: &Event) -> Result<(), ClientError> {
        let outgoing = Outgoing::for_event(&self.base_url, event)?;
        let response = self
            .http
            .request(outgoing.method, outgoing.url)
            .json(&outgoing.body)
            .send()?;
        let status = response.status();
        let body = response.text().unwrap_or_default();
        acknowledge(event, status, &body)
    }
}

impl Sink for BlockingTransport {
    fn submit(&self, event: Event) -> Delivery {
        self.send(&event)
    }
}
