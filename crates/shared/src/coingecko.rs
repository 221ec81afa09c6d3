//! CoinGecko API client with bounded retries and stale fallback.
//!
//! The client uses a tokio semaphore (8 permits) to keep concurrent calls well
//! under the demo-tier rate limit (~30 requests per minute). A single
//! `reqwest::Client` is reused for connection pooling. Retries apply only to
//! transient failures; other upstream statuses abort immediately so client
//! errors like 404 surface without burning attempts.
//!
//! See: <https://docs.coingecko.com/reference/introduction>

use std::sync::Arc;
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{header, Client, StatusCode};
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::error::AppError;

const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";

/// Statuses worth another attempt: rate limiting and transient server faults.
const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Characters escaped when a coin id is spliced into a URL path segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn is_retryable_status(status: StatusCode) -> bool {
    RETRYABLE_STATUSES.contains(&status.as_u16())
}

/// Retry tuning for upstream calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Additional attempts after the first (0 = no retries).
    pub max_retries: u32,
    /// Base delay before the first retry (ms).
    pub base_delay_ms: u64,
    /// Cap on the computed delay (ms).
    pub max_delay_ms: u64,
    /// Randomize each delay into the 75-100% window of its computed value.
    /// Always on outside tests; disabling it makes delays deterministic.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 300,
            max_delay_ms: 4_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_base_delay_ms(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    pub fn with_max_delay_ms(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retrying after the given 0-based failed attempt.
    ///
    /// Exponential in the attempt number, capped, then jittered into the
    /// 75-100% window so concurrent callers spread out instead of retrying in
    /// lockstep. Expected delay never decreases between attempts.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp_delay = self.base_delay_ms.saturating_mul(1 << attempt.min(10));
        let capped = exp_delay.min(self.max_delay_ms);
        if !self.jitter {
            return Duration::from_millis(capped);
        }
        let jitter_range = capped / 4;
        let jitter = rand::random::<u64>() % (jitter_range + 1);
        Duration::from_millis(capped - jitter_range + jitter)
    }
}

/// Outcome of a resilient fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    /// Payload decoded from a 2xx response on some attempt.
    Fresh(Value),
    /// The caller-supplied fallback, served because every attempt failed.
    /// Callers surface this distinctly so consumers know the data is old.
    Stale(Value),
}

impl Fetched {
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale(_))
    }

    pub fn into_value(self) -> Value {
        match self {
            Self::Fresh(value) | Self::Stale(value) => value,
        }
    }
}

/// HTTP client for the CoinGecko API.
///
/// Performs no caching of its own. Each logical query maps to one
/// [`Self::fetch_with_retry`] call; the cache tiers live in the query service
/// that owns this client.
pub struct CoinGeckoClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    retry: RetryConfig,
    semaphore: Arc<Semaphore>,
}

impl CoinGeckoClient {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            retry: RetryConfig::default(),
            semaphore: Arc::new(Semaphore::new(8)),
        }
    }

    /// Points the client at a different API root, e.g. a local mock server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Sends `x-cg-demo-api-key` on every request when set.
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Top coins by market cap for one currency and page.
    pub async fn fetch_markets(
        &self,
        vs_currency: &str,
        page: u32,
        per_page: u32,
        stale: Option<Value>,
    ) -> Result<Fetched, AppError> {
        let url = format!(
            "{}/coins/markets?vs_currency={vs_currency}&order=market_cap_desc&per_page={per_page}&page={page}&sparkline=false&price_change_percentage=24h",
            self.base_url
        );
        self.fetch_with_retry(&url, stale).await
    }

    /// Full detail document for one coin.
    pub async fn fetch_coin(&self, id: &str, stale: Option<Value>) -> Result<Fetched, AppError> {
        let url = format!(
            "{}/coins/{}?localization=false&tickers=false&market_data=true&community_data=false&developer_data=false&sparkline=false",
            self.base_url,
            utf8_percent_encode(id, PATH_SEGMENT)
        );
        self.fetch_with_retry(&url, stale).await
    }

    /// Price history for one coin. Sub-daily ranges use minute resolution,
    /// longer ranges hourly.
    pub async fn fetch_market_chart(
        &self,
        id: &str,
        vs_currency: &str,
        days: u32,
        stale: Option<Value>,
    ) -> Result<Fetched, AppError> {
        let interval = if days <= 1 { "minute" } else { "hourly" };
        let url = format!(
            "{}/coins/{}/market_chart?vs_currency={vs_currency}&days={days}&interval={interval}",
            self.base_url,
            utf8_percent_encode(id, PATH_SEGMENT)
        );
        self.fetch_with_retry(&url, stale).await
    }

    /// Issues `url` with up to `max_retries + 1` attempts.
    ///
    /// 2xx decodes and returns immediately. A status in the retryable set, a
    /// transport error, or an undecodable success body all count as transient
    /// failures and back off into the next attempt. Any other status is
    /// terminal and aborts the loop at once. When every attempt has failed the
    /// supplied `stale` value is served in place of an error; without one the
    /// call fails with the last observed status and detail.
    pub async fn fetch_with_retry(
        &self,
        url: &str,
        stale: Option<Value>,
    ) -> Result<Fetched, AppError> {
        let _permit = self.semaphore.acquire().await.expect("semaphore closed");

        let attempts = self.retry.max_retries + 1;
        let mut last_status: Option<u16> = None;
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry.delay_for_attempt(attempt - 1)).await;
            }

            let mut request = self
                .client
                .get(url)
                .header(header::ACCEPT, "application/json");
            if let Some(key) = &self.api_key {
                request = request.header("x-cg-demo-api-key", key);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        match response.json::<Value>().await {
                            Ok(value) => return Ok(Fetched::Fresh(value)),
                            Err(e) => {
                                last_status = None;
                                last_error = format!("failed to decode upstream body: {e}");
                                tracing::debug!(
                                    attempt = attempt + 1,
                                    attempts,
                                    error = %e,
                                    "upstream body decode failed"
                                );
                            }
                        }
                    } else if is_retryable_status(status) {
                        last_status = Some(status.as_u16());
                        last_error = format!("upstream returned status {status}");
                        tracing::debug!(
                            attempt = attempt + 1,
                            attempts,
                            status = status.as_u16(),
                            "retryable upstream status"
                        );
                    } else {
                        return Err(AppError::UpstreamStatus {
                            status: status.as_u16(),
                        });
                    }
                }
                Err(e) => {
                    last_status = None;
                    last_error = e.to_string();
                    tracing::debug!(
                        attempt = attempt + 1,
                        attempts,
                        error = %e,
                        "upstream request failed"
                    );
                }
            }
        }

        if let Some(value) = stale {
            tracing::warn!(url, last_error, "serving stale value after exhausted retries");
            return Ok(Fetched::Stale(value));
        }

        Err(AppError::UpstreamExhausted {
            attempts,
            last_status,
            detail: last_error,
        })
    }
}

impl Default for CoinGeckoClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    use super::*;

    /// Responds with a fixed status `failures` times, then 200 with `body`.
    struct FailThenSucceed {
        failures: u32,
        fail_status: u16,
        body: Value,
        calls: AtomicU32,
    }

    impl FailThenSucceed {
        fn new(failures: u32, fail_status: u16, body: Value) -> Self {
            Self {
                failures,
                fail_status,
                body,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl Respond for FailThenSucceed {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                ResponseTemplate::new(self.fail_status)
            } else {
                ResponseTemplate::new(200).set_body_json(self.body.clone())
            }
        }
    }

    fn test_client(server: &MockServer, max_retries: u32) -> CoinGeckoClient {
        CoinGeckoClient::new()
            .with_base_url(server.uri())
            .with_retry(
                RetryConfig::new(max_retries)
                    .with_base_delay_ms(1)
                    .without_jitter(),
            )
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let server = MockServer::start().await;
        let body = json!([{"id": "bitcoin", "current_price": 64000.5}]);

        Mock::given(method("GET"))
            .and(path("/coins/markets"))
            .respond_with(FailThenSucceed::new(2, 503, body.clone()))
            .expect(3)
            .mount(&server)
            .await;

        let client = test_client(&server, 2);
        let fetched = client.fetch_markets("usd", 1, 50, None).await.unwrap();

        assert_eq!(fetched, Fetched::Fresh(body));
    }

    #[tokio::test]
    async fn terminal_status_aborts_immediately() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/coins/definitely-not-a-coin"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server, 5);
        let err = client
            .fetch_coin("definitely-not-a-coin", None)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::UpstreamStatus { status: 404 }));
    }

    #[tokio::test]
    async fn stale_candidate_served_after_exhaustion() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/coins/markets"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let stale = json!([{"id": "bitcoin", "current_price": 63000.0}]);
        let client = test_client(&server, 2);
        let fetched = client
            .fetch_markets("usd", 1, 50, Some(stale.clone()))
            .await
            .unwrap();

        assert!(fetched.is_stale());
        assert_eq!(fetched.into_value(), stale);
    }

    #[tokio::test]
    async fn exhaustion_without_stale_is_an_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/coins/markets"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let client = test_client(&server, 2);
        let err = client.fetch_markets("usd", 1, 50, None).await.unwrap_err();

        match err {
            AppError::UpstreamExhausted {
                attempts,
                last_status,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_status, Some(500));
            }
            other => panic!("expected exhausted error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn markets_query_carries_expected_parameters() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/coins/markets"))
            .and(query_param("vs_currency", "eur"))
            .and(query_param("order", "market_cap_desc"))
            .and(query_param("per_page", "100"))
            .and(query_param("page", "2"))
            .and(query_param("sparkline", "false"))
            .and(query_param("price_change_percentage", "24h"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server, 0);
        client.fetch_markets("eur", 2, 100, None).await.unwrap();
    }

    #[tokio::test]
    async fn chart_interval_switches_at_one_day() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/coins/bitcoin/market_chart"))
            .and(query_param("interval", "minute"))
            .and(query_param("days", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"prices": []})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/coins/bitcoin/market_chart"))
            .and(query_param("interval", "hourly"))
            .and(query_param("days", "7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"prices": []})))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server, 0);
        client
            .fetch_market_chart("bitcoin", "usd", 1, None)
            .await
            .unwrap();
        client
            .fetch_market_chart("bitcoin", "usd", 7, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn api_key_header_sent_when_configured() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/coins/bitcoin"))
            .and(header("x-cg-demo-api-key", "demo-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "bitcoin"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server, 0).with_api_key(Some("demo-key".into()));
        client.fetch_coin("bitcoin", None).await.unwrap();
    }

    #[test]
    fn retryable_set_is_exact() {
        for status in RETRYABLE_STATUSES {
            assert!(is_retryable_status(StatusCode::from_u16(status).unwrap()));
        }
        for status in [400, 401, 404, 418, 501] {
            assert!(!is_retryable_status(StatusCode::from_u16(status).unwrap()));
        }
    }

    #[test]
    fn deterministic_delays_never_decrease() {
        let retry = RetryConfig::new(5)
            .with_base_delay_ms(100)
            .with_max_delay_ms(1_000)
            .without_jitter();

        let delays: Vec<_> = (0..6).map(|n| retry.delay_for_attempt(n)).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[5], Duration::from_millis(1_000));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn jittered_delay_stays_in_window() {
        let retry = RetryConfig::new(3)
            .with_base_delay_ms(400)
            .with_max_delay_ms(10_000);

        for attempt in 0..4 {
            let full = Duration::from_millis(400u64 << attempt);
            let floor = full.mul_f64(0.75);
            for _ in 0..50 {
                let delay = retry.delay_for_attempt(attempt);
                assert!(delay >= floor && delay <= full, "attempt {attempt}: {delay:?}");
            }
        }
    }
}
