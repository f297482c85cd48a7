//! HTTP surface: admission middleware, inspection and decision endpoints.

mod handlers;
mod middleware;
mod server;

pub use middleware::admission;
pub use server::HttpServer;

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::header::{HeaderName, RETRY_AFTER};
use axum::http::{Extensions, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::error;

use crate::config::TollgateConfig;
use crate::error::{Result, TollgateError};
use crate::ratelimit::{
    ConsumeResult, IdentityResolver, ProfileRegistry, RequestContext, TokenBucketLimiter,
};

/// Whole tokens left in the caller's bucket.
pub const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Everything a request needs to reach a decision.
pub struct AppState {
    pub registry: Arc<ProfileRegistry>,
    pub limiter: Arc<TokenBucketLimiter>,
    pub resolver: Arc<dyn IdentityResolver>,
    /// Route pattern to profile name
    pub bindings: HashMap<String, String>,
    pub namespace: String,
    pub api_key_header: HeaderName,
}

impl AppState {
    /// Assemble the request state from validated configuration.
    pub fn from_config(config: &TollgateConfig, limiter: Arc<TokenBucketLimiter>) -> Result<Self> {
        Ok(Self {
            registry: Arc::new(config.profile_registry()?),
            limiter,
            resolver: Arc::new(config.identity.resolver()),
            bindings: config.endpoint_bindings(),
            namespace: config.limiter.namespace.clone(),
            api_key_header: config.identity.header_name()?,
        })
    }

    fn identify(&self, headers: &HeaderMap, extensions: &Extensions) -> Result<String> {
        let ctx = RequestContext::from_headers(headers, extensions, &self.api_key_header);
        self.resolver.identify(&ctx)
    }
}

/// The service router with admission applied to every bound route.
pub fn router(state: Arc<AppState>) -> Router {
    let routes = Router::new()
        .route("/health", get(handlers::health))
        .route("/rate-limit/status", get(handlers::status))
        .route("/rate-limit/consume", post(handlers::consume));

    protect(routes, state)
}

/// Apply admission control to `routes`.
///
/// Only routes already added to `routes` are guarded, and only those whose
/// pattern is bound to a profile.
pub fn protect(routes: Router<Arc<AppState>>, state: Arc<AppState>) -> Router {
    routes
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::admission,
        ))
        .with_state(state)
}

/// A 429 carrying the retry hint.
fn too_many_requests(profile: &str, result: &ConsumeResult) -> Response {
    let body = Json(json!({
        "error": "Too many requests",
        "profile": profile,
        "retryAfterSeconds": result.retry_after_seconds,
    }));

    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    let headers = response.headers_mut();
    headers.insert(RETRY_AFTER, HeaderValue::from(result.retry_after_seconds));
    headers.insert(REMAINING_HEADER, HeaderValue::from(0u64));
    response
}

fn set_remaining(response: &mut Response, remaining: u64) {
    response
        .headers_mut()
        .insert(REMAINING_HEADER, HeaderValue::from(remaining));
}

/// Errors returned to HTTP callers.
#[derive(Debug)]
pub enum HttpError {
    /// The `profile` query parameter was absent
    MissingProfile,
    Limiter(TollgateError),
}

impl From<TollgateError> for HttpError {
    fn from(err: TollgateError) -> Self {
        HttpError::Limiter(err)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            HttpError::MissingProfile => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "Missing required query parameter 'profile'" }),
            ),
            HttpError::Limiter(err) => match &err {
                TollgateError::UnknownProfile(name) => (
                    StatusCode::BAD_REQUEST,
                    json!({ "error": err.to_string(), "profile": name }),
                ),
                TollgateError::Unidentified => (
                    StatusCode::BAD_REQUEST,
                    json!({ "error": err.to_string() }),
                ),
                TollgateError::StoreUnavailable(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    json!({ "error": "Rate limiter unavailable" }),
                ),
                TollgateError::Configuration(_) | TollgateError::Io(_) => {
                    error!(error = %err, "Request failed");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        json!({ "error": "Internal error" }),
                    )
                }
            },
        };

        (status, Json(body)).into_response()
    }
}
