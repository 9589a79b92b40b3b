//! Cross-cutting request handling: per-request deadline and access log

use std::time::Duration;

use axum::body::HttpBody;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tokio::time::Instant;
use tracing::info;

use super::ApiError;
use crate::Error;

/// Point in time by which the current request must have completed.
///
/// Inserted as a request extension so long waits inside a handler can
/// stop at the same instant the transport gives up.
#[derive(Clone, Copy, Debug)]
pub struct Deadline(pub Instant);

/// Bound every request by `timeout`.
///
/// Dropping the handler future on expiry also drops any child process it
/// started.
pub async fn deadline(
    State(timeout): State<Duration>,
    mut request: Request,
    next: Next,
) -> Response {
    let deadline = Instant::now() + timeout;
    request.extensions_mut().insert(Deadline(deadline));

    match tokio::time::timeout_at(deadline, next.run(request)).await {
        Ok(response) => response,
        Err(_) => ApiError::Failed(Error::timeout(
            "serve request",
            format!("no response within {timeout:?}"),
        ))
        .into_response(),
    }
}

/// One structured log line per request
pub async fn access_log(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let started = Instant::now();

    let response = next.run(request).await;

    let size = response.body().size_hint().exact().unwrap_or_default();
    info!(
        method = %method,
        status = response.status().as_u16(),
        uri = %uri,
        size,
        latency_ms = started.elapsed().as_millis() as u64,
        "Request served"
    );
    response
}
