//! Matching Engine Types

use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::warn;

use crate::ledger::LedgerError;
use crate::models::{Order, TradingPair};

/// A crossing (buy, sell) pair selected for settlement
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub buy: Order,
    pub sell: Order,
    /// min(buy.remaining, sell.remaining)
    pub quantity: Decimal,
    /// Execution price under the maker-price rule
    pub price: Decimal,
}

impl MatchCandidate {
    pub fn quote_amount(&self) -> Decimal {
        self.price * self.quantity
    }
}

/// Result of one full matching cycle
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleOutcome {
    pub pairs_scanned: usize,
    pub matches_settled: usize,
}

impl CycleOutcome {
    pub fn matched(&self) -> bool {
        self.matches_settled > 0
    }
}

/// Matching engine errors
#[derive(Debug, thiserror::Error)]
pub enum MatchingError {
    #[error("Unknown trading pair: {0}")]
    UnknownPair(String),

    #[error("Matching cycle already in progress")]
    CycleBusy,

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Handle for requesting an on-demand matching cycle for one pair.
///
/// Order placement and stop-loss triggers enqueue work through this channel
/// instead of holding a reference to the engine, which keeps the dependency
/// graph acyclic (the engine drives Settlement, Settlement drives stop-loss,
/// stop-loss requests cycles).
#[derive(Clone)]
pub struct CycleRequester {
    tx: mpsc::UnboundedSender<TradingPair>,
}

impl CycleRequester {
    pub fn new(tx: mpsc::UnboundedSender<TradingPair>) -> Self {
        Self { tx }
    }

    pub fn request(&self, pair: &TradingPair) {
        if self.tx.send(pair.clone()).is_err() {
            warn!("Matching engine is gone; dropping cycle request for {}", pair);
        }
    }
}
