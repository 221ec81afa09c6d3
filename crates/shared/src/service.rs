//! Read-through query service fronting the upstream with two cache tiers.
//!
//! Resolution order for every query: distributed cache, then memory cache,
//! then upstream. The distributed tier is shared across process instances and
//! is the cheapest read when warm (populated here or by the background
//! warmer); the memory tier covers single-instance warm paths and rides out
//! distributed-tier outages; the upstream is the resolver of last resort,
//! protected by retry with jitter. Successful fetches populate both tiers;
//! failures are never cached.
//!
//! Concurrent misses for one key are coalesced: the first caller fetches,
//! later callers wait for it and then re-read the tiers. The gate is
//! best-effort, so callers that race past it simply fetch twice.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::cache::{Lookup, TtlCache};
use crate::coingecko::{CoinGeckoClient, Fetched};
use crate::error::AppError;
use crate::keys;
use crate::redis::DistributedCache;

/// Memory-tier TTL for markets pages and coin detail documents.
const LIST_DETAIL_TTL: Duration = Duration::from_secs(10);

/// Memory-tier TTL for charts; history moves slowly, cache it longer.
const CHART_TTL: Duration = Duration::from_secs(60);

/// TTL in seconds for every distributed-tier write made on the request path.
pub const DISTRIBUTED_TTL_SECS: u64 = 20;

/// How long a coalesced caller waits on the in-flight fetch before giving up
/// and fetching on its own.
const FOLLOWER_WAIT: Duration = Duration::from_secs(10);

const MAX_VS_LEN: usize = 12;
const MAX_PER_PAGE: u32 = 250;
const MAX_DAYS: u32 = 3650;
const MAX_ID_LEN: usize = 100;

/// Where a served payload came from. Exposed to callers as an informational
/// response annotation; not part of the body contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Redis,
    Memory,
    Upstream,
    Stale,
}

impl CacheSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Redis => "redis",
            Self::Memory => "memory",
            Self::Upstream => "upstream",
            Self::Stale => "stale",
        }
    }
}

/// A served payload plus the tier that answered it.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub value: Value,
    pub source: CacheSource,
}

enum Flight<'a> {
    Leader(FlightGuard<'a>),
    Follower(Arc<Notify>),
}

/// Registration of the leading fetch for a key. Dropping it removes the
/// in-flight entry and wakes waiters, which also covers the leader being
/// cancelled mid-fetch.
struct FlightGuard<'a> {
    map: &'a Mutex<HashMap<String, Arc<Notify>>>,
    key: String,
    notify: Arc<Notify>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.map.lock().unwrap().remove(&self.key);
        self.notify.notify_waiters();
    }
}

/// Cache-fronted access to the market-data queries.
///
/// Owns both memory tiers, the distributed handle, the upstream client, and
/// the in-flight map. Constructed once at startup and shared behind an `Arc`.
pub struct QueryService {
    redis: Arc<dyn DistributedCache>,
    client: CoinGeckoClient,
    list_detail_cache: TtlCache<Value>,
    chart_cache: TtlCache<Value>,
    in_flight: Mutex<HashMap<String, Arc<Notify>>>,
}

impl QueryService {
    pub fn new(redis: Arc<dyn DistributedCache>, client: CoinGeckoClient) -> Self {
        Self {
            redis,
            client,
            list_detail_cache: TtlCache::new(LIST_DETAIL_TTL),
            chart_cache: TtlCache::new(CHART_TTL),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides the memory-tier TTLs.
    pub fn with_memory_ttls(mut self, list_detail: Duration, chart: Duration) -> Self {
        self.list_detail_cache = TtlCache::new(list_detail);
        self.chart_cache = TtlCache::new(chart);
        self
    }

    /// One page of coin markets for a currency.
    pub async fn markets(
        &self,
        vs_currency: &str,
        page: u32,
        per_page: u32,
    ) -> Result<Resolved, AppError> {
        validate_vs(vs_currency)?;
        validate_page(page)?;
        validate_per_page(per_page)?;

        let key = keys::markets(vs_currency, page, per_page);
        self.resolve(key, &self.list_detail_cache, |stale| {
            self.client.fetch_markets(vs_currency, page, per_page, stale)
        })
        .await
    }

    /// Detail document for one coin.
    pub async fn coin(&self, id: &str) -> Result<Resolved, AppError> {
        validate_coin_id(id)?;

        let key = keys::coin(id);
        self.resolve(key, &self.list_detail_cache, |stale| {
            self.client.fetch_coin(id, stale)
        })
        .await
    }

    /// Price history for one coin over a day range.
    pub async fn chart(
        &self,
        id: &str,
        vs_currency: &str,
        days: u32,
    ) -> Result<Resolved, AppError> {
        validate_coin_id(id)?;
        validate_vs(vs_currency)?;
        validate_days(days)?;

        let key = keys::chart(id, vs_currency, days);
        self.resolve(key, &self.chart_cache, |stale| {
            self.client.fetch_market_chart(id, vs_currency, days, stale)
        })
        .await
    }

    /// The read-through walk shared by all query kinds.
    async fn resolve<F, Fut>(
        &self,
        key: String,
        tier: &TtlCache<Value>,
        fetch: F,
    ) -> Result<Resolved, AppError>
    where
        F: FnOnce(Option<Value>) -> Fut,
        Fut: Future<Output = Result<Fetched, AppError>>,
    {
        let mut stale = None;
        if let Some(hit) = self.check_tiers(&key, tier, &mut stale).await {
            return Ok(hit);
        }

        match self.begin_fetch(&key) {
            Flight::Leader(guard) => {
                let fetched = fetch(stale).await?;
                let resolved = self.finish_fetch(&key, tier, fetched).await;
                drop(guard);
                Ok(resolved)
            }
            Flight::Follower(notify) => {
                let notified = notify.notified();
                tokio::pin!(notified);
                // Arm the waiter before re-reading the tiers: notify_waiters
                // reaches only armed waiters, so a leader that finished
                // before this point shows up in the re-read, not as a wakeup.
                notified.as_mut().enable();

                if let Some(hit) = self.check_tiers(&key, tier, &mut stale).await {
                    return Ok(hit);
                }

                let _ = timeout(FOLLOWER_WAIT, notified).await;

                // the tiers now hold whatever the leader wrote
                if let Some(hit) = self.check_tiers(&key, tier, &mut stale).await {
                    return Ok(hit);
                }

                // leader failed or is still in flight; fetch on our own
                let fetched = fetch(stale).await?;
                Ok(self.finish_fetch(&key, tier, fetched).await)
            }
        }
    }

    /// One walk over both cache tiers. A live entry answers the request. An
    /// expired memory entry is evicted into `stale`, replacing any older
    /// candidate, so exhausted fetches can still fall back on it.
    async fn check_tiers(
        &self,
        key: &str,
        tier: &TtlCache<Value>,
        stale: &mut Option<Value>,
    ) -> Option<Resolved> {
        if let Some(value) = self.redis.get_json(key).await {
            return Some(Resolved {
                value,
                source: CacheSource::Redis,
            });
        }
        match tier.lookup(key) {
            Lookup::Hit(value) => Some(Resolved {
                value,
                source: CacheSource::Memory,
            }),
            Lookup::Stale(value) => {
                *stale = Some(value);
                None
            }
            Lookup::Miss => None,
        }
    }

    fn begin_fetch(&self, key: &str) -> Flight<'_> {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(notify) = in_flight.get(key) {
            return Flight::Follower(Arc::clone(notify));
        }
        let notify = Arc::new(Notify::new());
        in_flight.insert(key.to_string(), Arc::clone(&notify));
        Flight::Leader(FlightGuard {
            map: &self.in_flight,
            key: key.to_string(),
            notify,
        })
    }

    /// Populates both tiers on a fresh payload. Stale payloads are served
    /// as-is and deliberately not written back.
    async fn finish_fetch(&self, key: &str, tier: &TtlCache<Value>, fetched: Fetched) -> Resolved {
        match fetched {
            Fetched::Fresh(value) => {
                tier.set(key, value.clone());
                self.redis.set_json(key, &value, DISTRIBUTED_TTL_SECS).await;
                Resolved {
                    value,
                    source: CacheSource::Upstream,
                }
            }
            Fetched::Stale(value) => Resolved {
                value,
                source: CacheSource::Stale,
            },
        }
    }
}

fn validate_vs(vs_currency: &str) -> Result<(), AppError> {
    let well_formed = !vs_currency.is_empty()
        && vs_currency.len() <= MAX_VS_LEN
        && vs_currency
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    if !well_formed {
        return Err(AppError::Validation(format!(
            "vs must be a lowercase currency code of at most {MAX_VS_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_page(page: u32) -> Result<(), AppError> {
    if page < 1 {
        return Err(AppError::Validation("page must be at least 1".into()));
    }
    Ok(())
}

fn validate_per_page(per_page: u32) -> Result<(), AppError> {
    if !(1..=MAX_PER_PAGE).contains(&per_page) {
        return Err(AppError::Validation(format!(
            "perPage must be between 1 and {MAX_PER_PAGE}"
        )));
    }
    Ok(())
}

fn validate_days(days: u32) -> Result<(), AppError> {
    if !(1..=MAX_DAYS).contains(&days) {
        return Err(AppError::Validation(format!(
            "days must be between 1 and {MAX_DAYS}"
        )));
    }
    Ok(())
}

fn validate_coin_id(id: &str) -> Result<(), AppError> {
    let well_formed = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-'));
    if !well_formed {
        return Err(AppError::Validation(format!(
            "id must be 1 to {MAX_ID_LEN} characters: lowercase letters, digits, '.', '_' or '-'"
        )));
    }
    Ok(())
}
