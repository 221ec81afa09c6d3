//! HTTP route handlers for the market data API.

pub mod coins;
pub mod markets;

use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;

use munin_shared::service::Resolved;

/// Response header naming the tier that answered a read: `redis`, `memory`,
/// `upstream` or `stale`.
pub const CACHE_SOURCE_HEADER: &str = "x-cache-source";

/// Optional identity forwarded by clients. It only enriches request logs;
/// nothing here verifies it.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The forwarded caller id, or `anonymous` when the header is absent or not
/// valid UTF-8.
fn caller(headers: &HeaderMap) -> &str {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("anonymous")
}

/// Wraps resolved data as a JSON response stamped with the cache source.
fn respond(resolved: Resolved) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        CACHE_SOURCE_HEADER,
        HeaderValue::from_static(resolved.source.as_str()),
    );
    (headers, Json(resolved.value)).into_response()
}
