//! Background cache warmer for the hot top-markets query.
//!
//! Runs as a tokio task alongside the API server. Each cycle fetches the
//! canonical top-markets page straight from the upstream (no cache reads; the
//! task exists to refresh the cache) and writes two things to the distributed
//! tier: the full page under its markets key, and one derived price entry per
//! coin for later point lookups without re-fetching the whole list.
//!
//! A failed cycle only logs and moves on. Nothing is written on failure, so a
//! flaky upstream can never displace good cache entries; they simply age out
//! on their own TTLs.

use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use munin_shared::coingecko::CoinGeckoClient;
use munin_shared::error::AppError;
use munin_shared::keys;
use munin_shared::redis::DistributedCache;
use munin_shared::service::DISTRIBUTED_TTL_SECS;

/// The canonical hot query: top 50 coins by market cap in USD.
const WARM_VS: &str = "usd";
const WARM_PAGE: u32 = 1;
const WARM_PER_PAGE: u32 = 50;

/// Derived price entries outlive the page itself; point lookups tolerate more
/// staleness than the ranked list does.
const PRICE_TTL_SECS: u64 = 60;

/// Counts from one successful warm cycle.
#[derive(Debug, PartialEq, Eq)]
pub struct WarmStats {
    /// Items in the fetched page.
    pub coins: usize,
    /// Price entries written (items carrying both an id and a numeric price).
    pub prices_written: usize,
}

/// Main warm loop. Runs work-first, then sleeps `WARM_INTERVAL_SECS`
/// (default 8) between cycles until the shutdown signal is received.
pub async fn run_warm_loop(
    redis: Arc<dyn DistributedCache>,
    client: CoinGeckoClient,
    mut shutdown: oneshot::Receiver<()>,
) {
    let interval_secs: u64 = env::var("WARM_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8);

    tracing::info!(interval_secs, "cache warm loop started");

    let mut cycle: u64 = 0;

    loop {
        cycle += 1;
        let start = Instant::now();

        match warm_once(redis.as_ref(), &client).await {
            Ok(stats) => {
                tracing::info!(
                    job = "warm",
                    cycle,
                    coins = stats.coins,
                    prices_written = stats.prices_written,
                    duration_ms = start.elapsed().as_millis() as u64,
                    outcome = "success",
                    "warm cycle complete"
                );
            }
            Err(e) => {
                tracing::warn!(
                    job = "warm",
                    cycle,
                    duration_ms = start.elapsed().as_millis() as u64,
                    outcome = "error",
                    error = %e,
                    "warm cycle failed, cache left as-is"
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {}
            _ = &mut shutdown => {
                tracing::info!("cache warm loop shutting down");
                return;
            }
        }
    }
}

/// One warm cycle: fetch the canonical page, then write the page key and the
/// per-coin price index. Returns counts for the cycle log line.
///
/// Items missing an `id` or a numeric `current_price` are skipped rather than
/// written as junk keys.
pub async fn warm_once(
    redis: &dyn DistributedCache,
    client: &CoinGeckoClient,
) -> Result<WarmStats, AppError> {
    let page = client
        .fetch_markets(WARM_VS, WARM_PAGE, WARM_PER_PAGE, None)
        .await?
        .into_value();

    redis
        .set_json(
            &keys::markets(WARM_VS, WARM_PAGE, WARM_PER_PAGE),
            &page,
            DISTRIBUTED_TTL_SECS,
        )
        .await;

    let items = page.as_array().map(Vec::as_slice).unwrap_or_default();
    let mut prices: Vec<(String, Value)> = Vec::with_capacity(items.len());
    for item in items {
        let Some(id) = item.get("id").and_then(Value::as_str) else {
            continue;
        };
        let Some(price) = item.get("current_price").filter(|p| p.is_number()) else {
            continue;
        };
        prices.push((keys::price(id, WARM_VS), price.clone()));
    }
    let prices_written = prices.len();
    redis.set_json_many(&prices, PRICE_TTL_SECS).await;

    Ok(WarmStats {
        coins: items.len(),
        prices_written,
    })
}
