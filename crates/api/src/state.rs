//! Shared application state for the axum server.
//!
//! Holds the cache-fronted query service that answers every market data read.
//! The service owns both memory tiers and the redis handle, so state stays a
//! single cheaply clonable field.

use std::sync::Arc;

use munin_shared::service::QueryService;

/// Shared state passed to all axum handlers via `State<AppState>`.
#[derive(Clone)]
pub struct AppState {
    /// Query service fronting CoinGecko. Reads resolve redis first, then the
    /// in-process TTL caches, then the upstream fetcher.
    pub service: Arc<QueryService>,
}

impl AppState {
    pub fn new(service: QueryService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}
