//! Cache key construction.
//!
//! Every cache tier (in-process and distributed) addresses entries by the same
//! string keys, so a value warmed by the background job is visible to request
//! handlers and vice versa. Keys embed every parameter that affects the
//! upstream response; two requests map to the same key only when the upstream
//! would return the same payload.

/// Key for a page of coin markets: `markets:<vs>:<page>:<per_page>`.
pub fn markets(vs_currency: &str, page: u32, per_page: u32) -> String {
    format!("markets:{vs_currency}:{page}:{per_page}")
}

/// Key for a single coin's detail document: `coin:<id>`.
pub fn coin(id: &str) -> String {
    format!("coin:{id}")
}

/// Key for a market chart: `chart:<id>:<vs>:<days>`.
pub fn chart(id: &str, vs_currency: &str, days: u32) -> String {
    format!("chart:{id}:{vs_currency}:{days}")
}

/// Key for a warmed spot price: `price:<id>:<vs>`.
///
/// Written by the cache warmer only; served as a lightweight price lookup
/// without a full markets fetch.
pub fn price(id: &str, vs_currency: &str) -> String {
    format!("price:{id}:{vs_currency}")
}
