//! REST API implementation
//!
//! This module provides the HTTP ingestion and query API.

pub mod handlers;
pub mod middleware;
pub mod routes;

pub use handlers::AppState;
pub use routes::create_router;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::HeaderValue;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::storage::TraceStore;

/// HTTP API server
pub struct HttpServer {
    state: AppState,
    cors_origins: Vec<String>,
}

impl HttpServer {
    /// Create a new HTTP server around existing state
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            cors_origins: Vec::new(),
        }
    }

    /// Create a server backed by `store` with the settings in `config`
    pub fn from_config(store: Arc<dyn TraceStore>, config: &Config) -> Self {
        Self {
            state: AppState::new(store, config),
            cors_origins: config.server.cors_origins.clone(),
        }
    }

    /// The full application: routes plus CORS and request tracing
    pub fn router(&self) -> Router {
        create_router(self.state.clone())
            .layer(cors_layer(&self.cors_origins))
            .layer(TraceLayer::new_for_http())
    }

    /// Start the HTTP server, returning once `shutdown` resolves and
    /// in-flight requests have finished
    pub async fn serve<F>(self, addr: &str, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::internal(format!("failed to bind {addr}: {e}")))?;

        info!("HTTP server listening on {}", addr);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::internal(e.to_string()))?;

        info!("HTTP server stopped");
        Ok(())
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring malformed CORS origin");
                None
            }
        })
        .collect();

    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(allowed))
    }
}
