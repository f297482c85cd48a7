//! Request handlers for the rate limit endpoints.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{Extensions, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use super::{set_remaining, too_many_requests, AppState, HttpError};
use crate::ratelimit::RateLimitStatus;

#[derive(Debug, Deserialize)]
pub struct ProfileQuery {
    profile: Option<String>,
}

impl ProfileQuery {
    fn profile(self) -> Result<String, HttpError> {
        self.profile
            .filter(|p| !p.is_empty())
            .ok_or(HttpError::MissingProfile)
    }
}

pub async fn health() -> &'static str {
    "OK"
}

/// `GET /rate-limit/status?profile=<name>`: the caller's bucket, without consuming.
pub async fn status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProfileQuery>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Result<Json<RateLimitStatus>, HttpError> {
    let profile = query.profile()?;
    // Unknown profiles are reported before identity problems.
    state.registry.resolve(&profile)?;
    let identity = state.identify(&headers, &extensions)?;

    let status = state
        .limiter
        .status(&state.registry, &state.namespace, &profile, &identity)
        .await?;

    Ok(Json(status))
}

/// `POST /rate-limit/consume?profile=<name>`: a decision for an out-of-process caller.
pub async fn consume(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProfileQuery>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Result<Response, HttpError> {
    let profile = query.profile()?;
    state.registry.resolve(&profile)?;
    let identity = state.identify(&headers, &extensions)?;

    let (profile, result) = state
        .limiter
        .admit(&state.registry, &state.namespace, &profile, &identity)
        .await?;

    if !result.consumed {
        return Ok(too_many_requests(profile.name(), &result));
    }

    let mut response = Json(result).into_response();
    set_remaining(&mut response, result.remaining_tokens);
    Ok(response)
}
