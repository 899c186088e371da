pub mod trade_cache;

pub use trade_cache::{CacheError, RecentTradeCache, TradeCacheConfig};
