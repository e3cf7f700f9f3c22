//! Data models shared by the client, the ingestion service and the store

mod query;
mod span;
mod status;
mod trace;

pub use query::*;
pub use span::*;
pub use status::*;
pub use trace::*;
