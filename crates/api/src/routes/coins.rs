//! Coin detail and price history endpoints.
//!
//! Both proxy CoinGecko through the tiered cache. Coin ids are validated
//! before any cache or network access, so malformed ids never hit upstream.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;

use munin_shared::error::AppError;

use crate::routes::{caller, respond};
use crate::state::AppState;

fn default_vs() -> String {
    "usd".to_string()
}

fn default_days() -> u32 {
    1
}

#[derive(Deserialize)]
pub struct ChartQuery {
    #[serde(default = "default_vs")]
    vs: String,
    #[serde(default = "default_days")]
    days: u32,
}

/// Returns full market detail for one coin.
#[utoipa::path(
    get,
    path = "/api/coins/{id}",
    tag = "Coins",
    summary = "Get coin detail",
    description = "Returns market data for a single coin, without tickers or community statistics.",
    params(
        ("id" = String, Path, description = "CoinGecko coin id, e.g. `bitcoin`")
    ),
    responses(
        (status = 200, description = "Coin detail"),
        (status = 400, description = "Malformed coin id", body = munin_shared::error::ErrorBody),
        (status = 502, description = "CoinGecko rejected the request or stayed unreachable", body = munin_shared::error::ErrorBody)
    )
)]
pub async fn coin_detail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let resolved = state.service.coin(&id).await?;

    tracing::info!(
        caller = caller(&headers),
        coin = %id,
        source = resolved.source.as_str(),
        "coin request"
    );

    Ok(respond(resolved))
}

/// Returns price history for one coin.
///
/// Sub-daily ranges use minute resolution, anything longer is hourly.
#[utoipa::path(
    get,
    path = "/api/coins/{id}/chart",
    tag = "Coins",
    summary = "Get coin price history",
    description = "Returns price, market cap and volume series for the requested day range.",
    params(
        ("id" = String, Path, description = "CoinGecko coin id, e.g. `bitcoin`"),
        ("vs" = Option<String>, Query, description = "Quote currency (default `usd`)"),
        ("days" = Option<u32>, Query, description = "Day range, between 1 and 3650 (default 1)")
    ),
    responses(
        (status = 200, description = "Price history series"),
        (status = 400, description = "Malformed coin id or day range", body = munin_shared::error::ErrorBody),
        (status = 502, description = "CoinGecko rejected the request or stayed unreachable", body = munin_shared::error::ErrorBody)
    )
)]
pub async fn coin_chart(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<ChartQuery>,
) -> Result<Response, AppError> {
    let resolved = state.service.chart(&id, &q.vs, q.days).await?;

    tracing::info!(
        caller = caller(&headers),
        coin = %id,
        vs = %q.vs,
        days = q.days,
        source = resolved.source.as_str(),
        "chart request"
    );

    Ok(respond(resolved))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::routing::get;
    use axum::Router;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use std::sync::Arc;

    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use munin_shared::coingecko::{CoinGeckoClient, RetryConfig};
    use munin_shared::service::QueryService;
    use munin_shared::testing::MemoryDistributed;

    use crate::routes::CACHE_SOURCE_HEADER;
    use crate::state::AppState;

    use super::*;

    fn test_state(server: &MockServer) -> (AppState, Arc<MemoryDistributed>) {
        let fake = Arc::new(MemoryDistributed::new());
        let client = CoinGeckoClient::new()
            .with_base_url(server.uri())
            .with_retry(RetryConfig::new(2).with_base_delay_ms(1).without_jitter());
        let service = QueryService::new(fake.clone(), client);
        (AppState::new(service), fake)
    }

    fn app(state: AppState) -> Router {
        Router::new()
            .route("/api/coins/{id}", get(coin_detail))
            .route("/api/coins/{id}/chart", get(coin_chart))
            .with_state(state)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, HeaderMap, serde_json::Value) {
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        (status, headers, json)
    }

    #[tokio::test]
    async fn coin_detail_is_fetched_and_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/coins/bitcoin"))
            .and(query_param("market_data", "true"))
            .and(query_param("tickers", "false"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "bitcoin",
                "symbol": "btc",
                "market_data": { "current_price": { "usd": 64250.13 } }
            })))
            .expect(1)
            .mount(&server)
            .await;
        let (state, fake) = test_state(&server);

        let (status, headers, json) = get_json(app(state.clone()), "/api/coins/bitcoin").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[CACHE_SOURCE_HEADER], "upstream");
        assert_eq!(json["id"], "bitcoin");
        assert_eq!(fake.ttl_of("coin:bitcoin"), Some(20));

        let (_, headers, _) = get_json(app(state), "/api/coins/bitcoin").await;
        assert_eq!(headers[CACHE_SOURCE_HEADER], "redis");
    }

    #[tokio::test]
    async fn chart_defaults_to_one_day_at_minute_resolution() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/coins/bitcoin/market_chart"))
            .and(query_param("vs_currency", "usd"))
            .and(query_param("days", "1"))
            .and(query_param("interval", "minute"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "prices": [[1700000000000u64, 64000.0]] })),
            )
            .expect(1)
            .mount(&server)
            .await;
        let (state, fake) = test_state(&server);

        let (status, _, json) = get_json(app(state), "/api/coins/bitcoin/chart").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["prices"][0][1], 64000.0);
        assert_eq!(fake.ttl_of("chart:bitcoin:usd:1"), Some(20));
    }

    #[tokio::test]
    async fn chart_passes_currency_and_day_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/coins/ethereum/market_chart"))
            .and(query_param("vs_currency", "eur"))
            .and(query_param("days", "30"))
            .and(query_param("interval", "hourly"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "prices": [] })))
            .expect(1)
            .mount(&server)
            .await;
        let (state, _fake) = test_state(&server);

        let (status, _, _) = get_json(app(state), "/api/coins/ethereum/chart?vs=eur&days=30").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_coin_id_returns_400() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let (state, fake) = test_state(&server);

        let (status, _, json) = get_json(app(state), "/api/coins/Bitcoin").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "validation_error");
        assert!(fake.is_empty());
    }

    #[tokio::test]
    async fn days_out_of_range_returns_400() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let (state, _fake) = test_state(&server);

        let (status, _, json) = get_json(app(state), "/api/coins/bitcoin/chart?days=3651").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "validation_error");
        assert!(json["detail"].as_str().unwrap().contains("days"));
    }

    #[tokio::test]
    async fn unknown_coin_maps_to_502_with_upstream_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/coins/dogebonk"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        let (state, fake) = test_state(&server);

        let (status, _, json) = get_json(app(state), "/api/coins/dogebonk").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json["error"], "upstream_error");
        assert_eq!(json["status"], 404);
        assert!(fake.is_empty());
    }
}
