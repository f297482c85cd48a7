//! Admission control for bound routes.

use std::sync::Arc;

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use super::{set_remaining, too_many_requests, AppState, HttpError};

/// Charge the caller's bucket before the handler runs.
///
/// Routes without a profile binding pass through untouched. A denial
/// short-circuits with `429`; the handler never sees the request.
pub async fn admission(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let profile = request
        .extensions()
        .get::<MatchedPath>()
        .and_then(|path| state.bindings.get(path.as_str()))
        .cloned();

    let Some(profile) = profile else {
        return next.run(request).await;
    };

    let identity = match state.identify(request.headers(), request.extensions()) {
        Ok(identity) => identity,
        Err(err) => return HttpError::from(err).into_response(),
    };

    let result = match state
        .limiter
        .admit(&state.registry, &state.namespace, &profile, &identity)
        .await
    {
        Ok((_, result)) => result,
        Err(err) => return HttpError::from(err).into_response(),
    };

    if !result.consumed {
        debug!(
            identity = %identity,
            profile = %profile,
            path = %request.uri().path(),
            "Request rejected by rate limiter"
        );
        return too_many_requests(&profile, &result);
    }

    let mut response = next.run(request).await;
    set_remaining(&mut response, result.remaining_tokens);
    response
}
