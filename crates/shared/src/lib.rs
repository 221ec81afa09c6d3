//! Core of the munin gateway: cache tiers, the resilient upstream client,
//! and the read-through query service, shared by the API server and the
//! background cache warmer.

pub mod cache;
pub mod coingecko;
pub mod error;
pub mod keys;
pub mod redis;
pub mod service;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
