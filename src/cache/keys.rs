//! Cache keys and data classes.

use std::time::Duration;

use crate::config::MicroCacheConfig;
use crate::transport::ApiRequest;

/// Freshness class of a read, selecting its micro-cache TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataClass {
    /// Last price, 24h stats.
    Ticker,
    /// Depth snapshots.
    OrderBook,
    /// Instrument and asset lists.
    Reference,
}

impl DataClass {
    pub fn ttl(&self, config: &MicroCacheConfig) -> Duration {
        let ms = match self {
            DataClass::Ticker => config.ticker_ttl_ms,
            DataClass::OrderBook => config.order_book_ttl_ms,
            DataClass::Reference => config.reference_ttl_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataClass::Ticker => "ticker",
            DataClass::OrderBook => "order_book",
            DataClass::Reference => "reference",
        }
    }
}

/// `endpoint` or `endpoint:SYMBOL`.
pub fn cache_key(endpoint: &str, symbol: Option<&str>) -> String {
    match symbol {
        Some(symbol) => format!("{}:{}", endpoint, symbol.to_ascii_uppercase()),
        None => endpoint.to_string(),
    }
}

/// Key derived from a request: method, path and query sorted by name, so
/// parameter order does not split the cache.
pub fn request_key(request: &ApiRequest) -> String {
    let mut query: Vec<_> = request.query.iter().collect();
    query.sort();

    let mut key = format!("{} {}", request.method.as_str(), request.path);
    for (i, (name, value)) in query.iter().enumerate() {
        key.push(if i == 0 { '?' } else { '&' });
        key.push_str(name);
        key.push('=');
        key.push_str(value);
    }
    key
}
