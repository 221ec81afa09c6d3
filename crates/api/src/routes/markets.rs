//! Market listings endpoint.
//!
//! Proxies one page of CoinGecko's `/coins/markets` through the tiered cache.
//! The `x-cache-source` response header names the tier that answered.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;

use munin_shared::error::AppError;

use crate::routes::{caller, respond};
use crate::state::AppState;

fn default_vs() -> String {
    "usd".to_string()
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    50
}

#[derive(Deserialize)]
pub struct MarketsQuery {
    #[serde(default = "default_vs")]
    vs: String,
    #[serde(default = "default_page")]
    page: u32,
    #[serde(rename = "perPage", default = "default_per_page")]
    per_page: u32,
}

/// Lists one page of coins ordered by market cap.
///
/// The page is served from redis or the in-process cache when warm and only
/// falls through to CoinGecko on a miss.
#[utoipa::path(
    get,
    path = "/api/markets",
    tag = "Markets",
    summary = "List coin markets",
    description = "Returns one page of coins ordered by market cap, including 24h price change.",
    params(
        ("vs" = Option<String>, Query, description = "Quote currency (default `usd`)"),
        ("page" = Option<u32>, Query, description = "Page number, starting at 1"),
        ("perPage" = Option<u32>, Query, description = "Coins per page, between 1 and 250 (default 50)")
    ),
    responses(
        (status = 200, description = "One page of coin markets"),
        (status = 400, description = "Invalid query parameters", body = munin_shared::error::ErrorBody),
        (status = 502, description = "CoinGecko rejected the request or stayed unreachable", body = munin_shared::error::ErrorBody)
    )
)]
pub async fn list_markets(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<MarketsQuery>,
) -> Result<Response, AppError> {
    let resolved = state.service.markets(&q.vs, q.page, q.per_page).await?;

    tracing::info!(
        caller = caller(&headers),
        vs = %q.vs,
        page = q.page,
        per_page = q.per_page,
        source = resolved.source.as_str(),
        "markets request"
    );

    Ok(respond(resolved))
}
