//! # llmtracer
//!
//! Self-hosted tracing for LLM applications.
//!
//! llmtracer records what an LLM application did as traces of nested spans:
//! model calls, tool invocations, retrieval, agent steps. It measures tokens,
//! cost, latency and errors along the way.
//!
//! ## Architecture
//!
//! - **Client**: handles that attribute spans to their parents and ship
//!   lifecycle events in the background (or synchronously)
//! - **Admission control**: per-caller sliding-window rate limiting
//! - **Ingestion**: validation, project scoping and payload truncation
//! - **Storage**: PostgreSQL or in-memory store with cursor pagination,
//!   retention and running per-project aggregates
//! - **API**: REST API for ingestion and queries
//!
//! ## Quick Start
//!
//! ```bash
//! # Start the service
//! llmtracer serve
//!
//! # Browse recorded traces
//! llmtracer traces list --limit 20
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod ingest;
pub mod models;
pub mod ratelimit;
pub mod storage;
pub mod telemetry;
pub mod tree;

pub use config::Config;
pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::client::{SpanOptions, SpanOutput, TraceOptions, Tracer, TracerConfig};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::models::*;
    pub use crate::storage::{open_store, TraceStore};
}
