//! Recent Trade Cache
//!
//! Bounded per-pair history of the most recent trades, kept in memory and
//! mirrored to a JSON file with debounced writes so it survives restarts
//! without amplifying write load. A corrupt file on load is treated as empty
//! state.
#![allow(dead_code)]

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{Trade, TradingPair};

#[derive(Debug, Clone)]
pub struct TradeCacheConfig {
    pub path: PathBuf,
    /// Most recent trades kept per pair
    pub max_trades_per_pair: usize,
    /// Quiet period before a dirty cache is written to disk
    pub save_debounce: Duration,
}

impl Default for TradeCacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/recent_trades.json"),
            max_trades_per_pair: 200,
            save_debounce: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub struct RecentTradeCache {
    config: TradeCacheConfig,
    buckets: DashMap<String, VecDeque<Trade>>,
    dirty: AtomicBool,
    flush_signal: Notify,
    // Serialises concurrent flushes (debounce worker vs shutdown)
    flush_lock: Mutex<()>,
}

impl RecentTradeCache {
    /// Create the cache, recovering previous state from disk when present.
    /// A parse failure is logged and treated as empty state.
    pub fn load(config: TradeCacheConfig) -> Self {
        let cache = Self {
            config,
            buckets: DashMap::new(),
            dirty: AtomicBool::new(false),
            flush_signal: Notify::new(),
            flush_lock: Mutex::new(()),
        };
        cache.recover();
        cache
    }

    fn recover(&self) {
        let raw = match std::fs::read_to_string(&self.config.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!("Cannot read trade cache {}: {}", self.config.path.display(), e);
                return;
            }
        };

        let parsed: HashMap<String, Vec<Trade>> = match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Trade cache corrupt, starting empty: {}", e);
                return;
            }
        };

        let mut total = 0usize;
        for (pair, trades) in parsed {
            total += trades.len();
            let mut bucket: VecDeque<Trade> = trades.into();
            bucket
                .make_contiguous()
                .sort_by_key(|t| t.timestamp);
            while bucket.len() > self.config.max_trades_per_pair {
                bucket.pop_front();
            }
            self.buckets.insert(pair, bucket);
        }
        info!(
            "Recovered {} cached trades across {} pairs",
            total,
            self.buckets.len()
        );
    }

    /// Insert a trade into its pair bucket. Duplicate trade ids are ignored;
    /// the oldest entries are evicted past the per-pair cap.
    pub fn insert(&self, trade: Trade) {
        let key = trade.pair.symbol();
        let mut bucket = self.buckets.entry(key).or_default();

        if bucket.iter().any(|t| t.trade_id == trade.trade_id) {
            return;
        }

        // Keep the bucket ordered by timestamp; trades arrive nearly sorted
        let insert_at = bucket
            .iter()
            .rposition(|t| t.timestamp <= trade.timestamp)
            .map(|i| i + 1)
            .unwrap_or(0);
        bucket.insert(insert_at, trade);

        while bucket.len() > self.config.max_trades_per_pair {
            bucket.pop_front();
        }
        drop(bucket);

        self.dirty.store(true, Ordering::Release);
        self.flush_signal.notify_one();
    }

    /// Most recent trades for a pair, newest first
    pub fn trades_for_pair(&self, pair: &TradingPair, limit: usize) -> Vec<Trade> {
        self.buckets
            .get(&pair.symbol())
            .map(|bucket| bucket.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Most recent trades across all pairs, newest first
    pub fn all_trades(&self, limit: usize) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.value().iter().cloned().collect::<Vec<_>>())
            .collect();
        trades.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        trades.truncate(limit);
        trades
    }

    pub fn contains(&self, pair: &TradingPair, trade_id: Uuid) -> bool {
        self.buckets
            .get(&pair.symbol())
            .map(|bucket| bucket.iter().any(|t| t.trade_id == trade_id))
            .unwrap_or(false)
    }

    /// Write the cache to disk now, regardless of the debounce state
    pub fn flush(&self) -> Result<(), CacheError> {
        let _guard = self.flush_lock.lock();

        let snapshot: HashMap<String, Vec<Trade>> = self
            .buckets
            .iter()
            .map(|bucket| (bucket.key().clone(), bucket.value().iter().cloned().collect()))
            .collect();

        if let Some(parent) = self.config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.config.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(&snapshot)?)?;
        std::fs::rename(&tmp, &self.config.path)?;

        self.dirty.store(false, Ordering::Release);
        crate::metrics::record_cache_flush();
        debug!("Trade cache flushed to {}", self.config.path.display());
        Ok(())
    }

    /// Debounced flush worker. Runs until the shutdown channel flips, then
    /// performs a final synchronous flush of any pending write.
    pub async fn run_flush_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Trade cache flush worker started (debounce {:?})",
            self.config.save_debounce
        );
        loop {
            tokio::select! {
                _ = self.flush_signal.notified() => {
                    // Debounce: absorb the burst before touching the disk
                    tokio::time::sleep(self.config.save_debounce).await;
                    if self.dirty.load(Ordering::Acquire) {
                        if let Err(e) = self.flush() {
                            warn!("Trade cache flush failed: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if self.dirty.load(Ordering::Acquire) {
                        if let Err(e) = self.flush() {
                            warn!("Final trade cache flush failed: {}", e);
                        }
                    }
                    info!("Trade cache flush worker stopped");
                    return;
                }
            }
        }
    }

}
