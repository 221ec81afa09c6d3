//! Munin API server.
//!
//! Crypto market data gateway backed by CoinGecko. Serves market listings,
//! coin detail and price history through a redis and in-process cache
//! hierarchy, and runs a background warmer that keeps the top market page hot.
//!
//! Environment variables:
//! - `PORT`: HTTP listen port (default: 8080)
//! - `REDIS_URL`: redis connection string (default: redis://127.0.0.1:6379)
//! - `SKIP_REDIS`: set to `1` to run without redis (memory tiers only)
//! - `COINGECKO_API_KEY`: demo API key sent to CoinGecko (optional)
//! - `WARM_INTERVAL_SECS`: seconds between warm cycles (default: 8)
//! - `RUST_LOG`: tracing env filter (default: info)

mod routes;
mod state;

use std::env;
use std::sync::Arc;

use axum::http::Method;
use axum::routing::get;
use axum::Json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;
use utoipa_swagger_ui::SwaggerUi;

use munin_shared::coingecko::CoinGeckoClient;
use munin_shared::redis::{DistributedCache, RedisCache};
use munin_shared::service::QueryService;

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Munin API",
        description = "Crypto market data gateway backed by CoinGecko",
        version = "1.0.0",
        license(name = "MIT")
    ),
    tags(
        (name = "Markets", description = "Market listing endpoints"),
        (name = "Coins", description = "Coin detail and price history endpoints")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let port = env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let redis_url =
        env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let api_key = env::var("COINGECKO_API_KEY").ok();
    let skip_redis = env::var("SKIP_REDIS").map(|v| v == "1").unwrap_or(false);

    let redis: Arc<dyn DistributedCache> = if skip_redis {
        tracing::info!("SKIP_REDIS set, serving from memory tiers only");
        Arc::new(RedisCache::disabled())
    } else {
        match RedisCache::connect(&redis_url).await {
            Ok(cache) => {
                if cache.ping().await {
                    tracing::info!(redis_url = %redis_url, "redis connected");
                } else {
                    tracing::warn!(redis_url = %redis_url, "redis ping failed, reads degrade to misses");
                }
                Arc::new(cache)
            }
            Err(fault) => {
                tracing::warn!(redis_url = %redis_url, %fault, "redis unavailable, serving from memory tiers only");
                Arc::new(RedisCache::disabled())
            }
        }
    };

    let client = CoinGeckoClient::new().with_api_key(api_key.clone());
    let state = AppState::new(QueryService::new(redis.clone(), client));

    // graceful shutdown: ctrl-c signals both the server and the warm loop
    let shutdown = tokio::signal::ctrl_c();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    // spawn the warmer as a background task in the same process
    let warm_client = CoinGeckoClient::new().with_api_key(api_key);
    tokio::spawn(async move {
        munin_ingestion::run_warm_loop(redis, warm_client, shutdown_rx).await;
    });

    let cors = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_origin(Any);

    let (router, api) = OpenApiRouter::with_openapi(ApiDoc::openapi())
        .routes(routes!(routes::markets::list_markets))
        .routes(routes!(routes::coins::coin_detail))
        .routes(routes!(routes::coins::coin_chart))
        .with_state(state)
        .split_for_parts();

    let app = router
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", api))
        .route(
            "/health",
            get(|| async {
                Json(serde_json::json!({
                    "ok": true,
                    "ts": chrono::Utc::now().timestamp_millis()
                }))
            }),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(port = %port, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.await;
            let _ = shutdown_tx.send(());
            tracing::info!("shutdown signal received");
        })
        .await
        .expect("server error");
}
