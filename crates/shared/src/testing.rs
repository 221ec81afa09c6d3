//! Test fixtures shared across the workspace: an in-memory stand-in for the
//! distributed tier and a canned upstream payload.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::redis::DistributedCache;

/// In-memory [`DistributedCache`] with no faults and no expiry.
///
/// Records the TTL each write carried so tests can assert on the expiry
/// policy without a running store.
#[derive(Default)]
pub struct MemoryDistributed {
    entries: Mutex<HashMap<String, (Value, u64)>>,
}

impl MemoryDistributed {
    pub fn new() -> Self {
        Self::default()
    }

    /// TTL seconds recorded by the last write to `key`.
    pub fn ttl_of(&self, key: &str) -> Option<u64> {
        self.entries.lock().unwrap().get(key).map(|(_, ttl)| *ttl)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// All stored keys, sorted for stable assertions.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.entries.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl DistributedCache for MemoryDistributed {
    async fn get_json(&self, key: &str) -> Option<Value> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .map(|(value, _)| value.clone())
    }

    async fn set_json(&self, key: &str, value: &Value, ttl_secs: u64) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.clone(), ttl_secs));
    }

    async fn set_json_many(&self, entries: &[(String, Value)], ttl_secs: u64) {
        let mut map = self.entries.lock().unwrap();
        for (key, value) in entries {
            map.insert(key.clone(), (value.clone(), ttl_secs));
        }
    }

    async fn ping(&self) -> bool {
        true
    }
}

/// Two-coin top-markets page shaped like the upstream response.
pub fn sample_markets_page() -> Value {
    json!([
        {
            "id": "bitcoin",
            "symbol": "btc",
            "name": "Bitcoin",
            "image": "https://assets.coingecko.com/coins/images/1/large/bitcoin.png",
            "current_price": 64250.13,
            "market_cap_rank": 1,
            "price_change_percentage_24h": -1.2
        },
        {
            "id": "ethereum",
            "symbol": "eth",
            "name": "Ethereum",
            "image": "https://assets.coingecko.com/coins/images/279/large/ethereum.png",
            "current_price": 3412.55,
            "market_cap_rank": 2,
            "price_change_percentage_24h": 0.8
        }
    ])
}
