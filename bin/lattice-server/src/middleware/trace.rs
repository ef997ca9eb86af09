//! Request tracing.
//!
//! Every request gets an `X-Trace-Id`: inherited from the caller when the
//! header carries a valid UUID, freshly minted otherwise. The id is
//! attached to the request span (so handler log lines carry it), exposed
//! to handlers through the request headers, and echoed on the response so
//! clients can correlate their own logs with ours.

use std::time::Instant;

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

/// Header carrying the per-request trace id.
pub const X_TRACE_ID: &str = "x-trace-id";

/// Middleware function for [`axum::middleware::from_fn`].
pub async fn trace_request(mut request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get(X_TRACE_ID)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value).ok())
        .unwrap_or_else(Uuid::new_v4);
    // A UUID always renders as a valid header value; if that ever stops
    // holding, we serve the request untagged rather than reject it.
    let header = HeaderValue::from_str(&trace_id.to_string()).ok();

    if let Some(value) = &header {
        request.headers_mut().insert(X_TRACE_ID, value.clone());
    }

    let span = info_span!(
        "request",
        trace_id = %trace_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    let started = Instant::now();
    let mut response = next.run(request).instrument(span).await;

    info!(
        trace_id = %trace_id,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request served"
    );

    if let Some(value) = header {
        response.headers_mut().insert(X_TRACE_ID, value);
    }
    response
}
