//! Request guards: caller identity, admission control and error rendering

use std::net::SocketAddr;

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, ConnectInfo, FromRequest, FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{error, warn};

use super::handlers::AppState;
use crate::config::AuthConfig;
use crate::error::Error;
use crate::ingest::validate_project_id;

/// Header carrying the caller's API key
pub const API_KEY_HEADER: &str = "x-api-key";

const KEY_PREFIX: &str = "project-";

/// The authenticated caller of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// Key the request was made with, or the default key
    pub api_key: String,
    /// Project derived from the key
    pub project_id: String,
}

impl Caller {
    /// Resolve the caller from the request headers
    pub fn from_headers(headers: &HeaderMap, auth: &AuthConfig) -> Result<Self, Error> {
        let sent = headers
            .get(API_KEY_HEADER)
            .map(|v| {
                v.to_str()
                    .map(str::trim)
                    .map_err(|_| Error::Unauthorized("API key is not valid ASCII".to_string()))
            })
            .transpose()?
            .filter(|key| !key.is_empty());

        let api_key = match sent {
            Some(key) => {
                if auth.required && !auth.api_keys.iter().any(|k| k == key) {
                    return Err(Error::Unauthorized("invalid API key".to_string()));
                }
                key.to_string()
            }
            None if auth.required => {
                return Err(Error::Unauthorized(format!(
                    "missing API key, send it in the {API_KEY_HEADER} header"
                )))
            }
            None => auth.default_key.clone(),
        };

        let project_id = project_of(&api_key)?;
        Ok(Self {
            api_key,
            project_id,
        })
    }
}

/// Project encoded in a `project-{id}` key
pub fn project_of(api_key: &str) -> Result<String, Error> {
    let project = api_key
        .strip_prefix(KEY_PREFIX)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| {
            Error::validation(format!("invalid API key format, expected '{KEY_PREFIX}{{project_id}}'"))
        })?;
    validate_project_id(project)?;
    Ok(project.to_string())
}

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        Caller::from_headers(&parts.headers, &state.auth)
    }
}

/// JSON body extractor whose failures use the service's error format
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(json_rejection(rejection)),
        }
    }
}

fn json_rejection(rejection: JsonRejection) -> Error {
    Error::validation(rejection.body_text())
}

/// Rate-limit identity: the API key when it is a configured one, else the peer address
///
/// Unknown keys are not authenticated yet, so rotating them must not open
/// fresh windows.
pub fn identity_of(request: &Request, auth: &AuthConfig) -> String {
    if let Some(key) = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| auth.api_keys.iter().any(|known| known == k))
    {
        return key.to_string();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Admission control in front of the API routes
pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let identity = identity_of(&request, &state.auth);
    match state.limiter.check(&identity) {
        Ok(()) => next.run(request).await,
        Err(e) => {
            warn!(identity = %identity, path = %request.uri().path(), "Rate limit exceeded");
            metrics::counter!("llmtracer_requests_rejected_total").increment(1);
            e.into_response()
        }
    }
}

/// HTTP status of an error
pub fn status_of(error: &Error) -> StatusCode {
    match error {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        Error::Forbidden(_) => StatusCode::FORBIDDEN,
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        Error::Database(_) | Error::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Config(_) | Error::Internal(_) | Error::Io(_) | Error::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = status_of(&self);
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        }));
        let mut response = (status, body).into_response();

        if let Error::RateLimited { retry_after } = self {
            // whole seconds, rounded up so a retry never lands early
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
