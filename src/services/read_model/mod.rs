//! Streaming Read Model
//!
//! The authoritative in-memory projection of orders, trades, and allocations
//! for every query on the hot path. Bootstraps over the ledger's streaming
//! channel (bypassing the 200-element REST page cap), then stays current via
//! the live-update subscription. When streaming is unavailable the model
//! reports not-ready and consumers fall back to page-capped REST queries:
//! degraded throughput, never correctness.
#![allow(dead_code)]

mod indices;
mod updates;

pub use indices::ProjectionIndices;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ledger::{
    codec, ActiveContract, LedgerApi, LedgerError, LedgerUpdate, Offset, TemplateId, REST_PAGE_CAP,
};
use crate::models::{Order, Trade, TradingPair};

use futures::StreamExt;

/// Remaining quantity below this is a rounding leftover of a fully-filled
/// order, not real liquidity
pub const MIN_REMAINING: Decimal = Decimal::from_parts(1, 0, 0, false, 7); // 1e-7

#[derive(Debug, Clone)]
pub struct ReadModelConfig {
    /// Per-template bootstrap drain timeout
    pub bootstrap_timeout: Duration,
    /// Attempts to open the bootstrap stream before degrading to REST
    pub max_bootstrap_retries: u32,
    pub bootstrap_retry_delay: Duration,
    /// Back-off before re-opening a closed live stream
    pub reconnect_delay: Duration,
    /// Periodic reconnect to pre-empt token expiry
    pub token_refresh_interval: Duration,
}

impl Default for ReadModelConfig {
    fn default() -> Self {
        Self {
            bootstrap_timeout: Duration::from_secs(60),
            max_bootstrap_retries: 5,
            bootstrap_retry_delay: Duration::from_secs(8),
            reconnect_delay: Duration::from_secs(3),
            token_refresh_interval: Duration::from_secs(240),
        }
    }
}

/// One pair's book: bids best-first, asks best-first
#[derive(Debug, Clone)]
pub struct OrderBookView {
    pub bids: Vec<Order>,
    pub asks: Vec<Order>,
}

impl OrderBookView {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.iter().find_map(|o| o.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.iter().find_map(|o| o.price)
    }
}

pub struct ReadModel {
    ledger: Arc<dyn LedgerApi>,
    indices: ProjectionIndices,
    ready: AtomicBool,
    last_offset: RwLock<Option<Offset>>,
    /// Party whose visibility the projection queries run under
    operator: String,
    config: ReadModelConfig,
}

impl ReadModel {
    pub fn new(ledger: Arc<dyn LedgerApi>, operator: String, config: ReadModelConfig) -> Self {
        Self {
            ledger,
            indices: ProjectionIndices::new(),
            ready: AtomicBool::new(false),
            last_offset: RwLock::new(None),
            operator,
            config,
        }
    }

    /// Streaming is up and the projection is authoritative
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn last_offset(&self) -> Option<Offset> {
        self.last_offset.read().clone()
    }

    // ==================== Bootstrap ====================

    /// Populate the projection by draining one bootstrap stream per template
    /// at a single snapshot offset. A per-template timeout resolves that
    /// template with whatever was drained; only a failure to open the stream
    /// at all counts against the retry budget.
    pub async fn bootstrap(&self) -> Result<(), LedgerError> {
        for attempt in 1..=self.config.max_bootstrap_retries {
            match self.try_bootstrap().await {
                Ok(()) => {
                    self.ready.store(true, Ordering::Release);
                    info!(
                        "Read model ready: {} orders, {} trades, {} allocations",
                        self.indices.order_count(),
                        self.indices.trade_count(),
                        self.indices.allocation_count(),
                    );
                    self.record_sizes();
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Bootstrap attempt {}/{} failed: {}",
                        attempt, self.config.max_bootstrap_retries, e
                    );
                    if attempt < self.config.max_bootstrap_retries {
                        tokio::time::sleep(self.config.bootstrap_retry_delay).await;
                    }
                }
            }
        }
        warn!("Bootstrap exhausted; read model degraded to REST fallback");
        Err(LedgerError::Transport(
            "Bootstrap stream unavailable".to_string(),
        ))
    }

    async fn try_bootstrap(&self) -> Result<(), LedgerError> {
        let offset = self.ledger.get_ledger_end().await?;
        info!("Bootstrapping read model at offset {}", offset);

        for template in TemplateId::ALL {
            let stream = self
                .ledger
                .stream_active_at_offset(&offset, &[template])
                .await?;

            let mut count = 0usize;
            let drain = async {
                futures::pin_mut!(stream);
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(contract) => {
                            self.apply_contract(contract);
                            count += 1;
                        }
                        Err(e) => warn!("Bootstrap stream element error: {}", e),
                    }
                }
            };

            match timeout(self.config.bootstrap_timeout, drain).await {
                Ok(()) => debug!("Bootstrapped {} {} contracts", count, template),
                // A slow template resolves with what was drained so far;
                // never fatal for the whole bootstrap
                Err(_) => warn!(
                    "Bootstrap of {} timed out after {} contracts",
                    template, count
                ),
            }
        }

        *self.last_offset.write() = Some(offset);
        Ok(())
    }

    // ==================== Projection writes ====================

    pub(crate) fn apply_contract(&self, contract: ActiveContract) {
        match contract.template_id {
            TemplateId::Order => match codec::order_from_contract(&contract) {
                Ok(order) => self.indices.insert_order(order),
                Err(e) => warn!("Skipping malformed order {}: {}", contract.contract_id, e),
            },
            TemplateId::Trade => match codec::trade_from_contract(&contract) {
                Ok(trade) => self.indices.insert_trade(trade),
                Err(e) => warn!("Skipping malformed trade {}: {}", contract.contract_id, e),
            },
            TemplateId::Allocation => self.indices.insert_allocation(contract),
        }
    }

    /// Apply one live update and persist its offset
    pub(crate) fn apply_update(&self, update: LedgerUpdate) {
        let offset = update.offset().clone();
        match update {
            LedgerUpdate::Created { contract, .. } => self.apply_contract(contract),
            LedgerUpdate::Archived {
                contract_id,
                template_id,
                ..
            } => {
                match template_id {
                    TemplateId::Order => {
                        self.indices.remove_order(&contract_id);
                    }
                    TemplateId::Trade => {
                        self.indices.remove_trade(&contract_id);
                    }
                    TemplateId::Allocation => {
                        self.indices.remove_allocation(&contract_id);
                    }
                };
            }
        }
        *self.last_offset.write() = Some(offset);
    }

    /// Speculative insert after a local create; the live stream converges on
    /// the same state
    pub fn insert_order(&self, order: Order) {
        self.indices.insert_order(order);
    }

    pub fn remove_order(&self, contract_id: &str) -> Option<Order> {
        self.indices.remove_order(contract_id)
    }

    pub fn update_order<F>(&self, contract_id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut Order),
    {
        self.indices.update_order(contract_id, mutate)
    }

    pub fn insert_trade(&self, trade: Trade) {
        self.indices.insert_trade(trade);
    }

    fn record_sizes(&self) {
        crate::metrics::record_read_model_size("order", self.indices.order_count());
        crate::metrics::record_read_model_size("trade", self.indices.trade_count());
        crate::metrics::record_read_model_size("allocation", self.indices.allocation_count());
    }

    // ==================== Query surface (synchronous, no I/O) ====================

    /// Orders still able to fill for a pair: live status and a remaining
    /// quantity above the rounding-leftover threshold
    pub fn open_orders_for_pair(&self, pair: &TradingPair) -> Vec<Order> {
        self.indices
            .orders_for_pair(pair)
            .into_iter()
            .filter(|o| o.status.is_live() && o.remaining() > MIN_REMAINING)
            .collect()
    }

    /// The same view, fetched over page-capped REST when streaming is down
    pub async fn open_orders_for_pair_live(
        &self,
        pair: &TradingPair,
    ) -> Result<Vec<Order>, LedgerError> {
        if self.is_ready() {
            return Ok(self.open_orders_for_pair(pair));
        }
        crate::metrics::record_rest_fallback();
        let contracts = self
            .ledger
            .query_active(&self.operator, &[TemplateId::Order], REST_PAGE_CAP)
            .await?;
        let mut orders = Vec::new();
        for contract in &contracts {
            match codec::order_from_contract(contract) {
                Ok(order) => {
                    if order.pair == *pair
                        && order.status.is_live()
                        && order.remaining() > MIN_REMAINING
                    {
                        orders.push(order);
                    }
                }
                Err(e) => warn!("Skipping malformed order {}: {}", contract.contract_id, e),
            }
        }
        Ok(orders)
    }

    /// Book view: bids price-descending, asks price-ascending, ties broken
    /// by earliest timestamp, market orders ahead of all limit orders
    pub fn order_book(&self, pair: &TradingPair) -> OrderBookView {
        let open = self.open_orders_for_pair(pair);
        let (mut bids, mut asks): (Vec<Order>, Vec<Order>) = open
            .into_iter()
            .partition(|o| matches!(o.side, crate::models::OrderSide::Buy));
        sort_bids(&mut bids);
        sort_asks(&mut asks);
        OrderBookView { bids, asks }
    }

    pub fn order_by_contract_id(&self, contract_id: &str) -> Option<Order> {
        self.indices.order_by_contract_id(contract_id)
    }

    pub fn order_by_order_id(&self, order_id: Uuid) -> Option<Order> {
        self.indices.order_by_order_id(order_id)
    }

    pub fn orders_for_party(&self, party: &str) -> Vec<Order> {
        self.indices.orders_for_owner(party)
    }

    pub fn trades_for_pair(&self, pair: &TradingPair, limit: usize) -> Vec<Trade> {
        let mut trades = self.indices.trades_for_pair(pair);
        sort_trades_desc(&mut trades);
        trades.truncate(limit);
        trades
    }

    pub fn all_trades(&self, limit: usize) -> Vec<Trade> {
        let mut trades = self.indices.all_trades();
        sort_trades_desc(&mut trades);
        trades.truncate(limit);
        trades
    }

    pub fn trades_for_party(&self, party: &str, limit: usize) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self
            .indices
            .all_trades()
            .into_iter()
            .filter(|t| t.buyer == party || t.seller == party)
            .collect();
        sort_trades_desc(&mut trades);
        trades.truncate(limit);
        trades
    }

    pub fn allocation_by_cid(&self, contract_id: &str) -> Option<ActiveContract> {
        self.indices.allocation_by_cid(contract_id)
    }

    /// Most recent execution price for a pair
    pub fn last_trade_price(&self, pair: &TradingPair) -> Option<Decimal> {
        self.trades_for_pair(pair, 1)
            .first()
            .map(|t| t.base_price)
    }

    /// Current market price estimate: order-book midpoint, else the best
    /// priced side, else the last trade
    pub fn market_price(&self, pair: &TradingPair) -> Option<Decimal> {
        let book = self.order_book(pair);
        match (book.best_bid(), book.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            (Some(bid), None) => Some(bid),
            (None, Some(ask)) => Some(ask),
            (None, None) => self.last_trade_price(pair),
        }
    }
}

// ============================================================================
// Sorting
// ============================================================================

/// Bids: market orders first (stable by placement time), then price
/// descending, ties by earliest timestamp
pub fn sort_bids(orders: &mut [Order]) {
    orders.sort_by(|a, b| match (a.price, b.price) {
        (None, None) => a.timestamp.cmp(&b.timestamp),
        (None, Some(_)) => CmpOrdering::Less,
        (Some(_), None) => CmpOrdering::Greater,
        (Some(pa), Some(pb)) => pb.cmp(&pa).then(a.timestamp.cmp(&b.timestamp)),
    });
}

/// Asks: market orders first (stable by placement time), then price
/// ascending, ties by earliest timestamp
pub fn sort_asks(orders: &mut [Order]) {
    orders.sort_by(|a, b| match (a.price, b.price) {
        (None, None) => a.timestamp.cmp(&b.timestamp),
        (None, Some(_)) => CmpOrdering::Less,
        (Some(_), None) => CmpOrdering::Greater,
        (Some(pa), Some(pb)) => pa.cmp(&pb).then(a.timestamp.cmp(&b.timestamp)),
    });
}

fn sort_trades_desc(trades: &mut [Trade]) {
    trades.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderMode, OrderSide, OrderStatus};
    use chrono::{Duration as ChronoDuration, Utc};
    use rust_decimal_macros::dec;

    fn order(
        cid: &str,
        side: OrderSide,
        price: Option<Decimal>,
        age_secs: i64,
    ) -> Order {
        Order {
            order_id: Uuid::new_v4(),
            contract_id: cid.to_string(),
            owner: "party::a".into(),
            pair: "CC/CBTC".parse().unwrap(),
            side,
            mode: if price.is_some() {
                OrderMode::Limit
            } else {
                OrderMode::Market
            },
            price,
            stop_price: None,
            quantity: dec!(1),
            filled: dec!(0),
            status: OrderStatus::Open,
            timestamp: Utc::now() - ChronoDuration::seconds(age_secs),
            allocation_ref: None,
            triggered_at: None,
        }
    }

    #[test]
    fn test_bid_sort_price_descending_time_tiebreak() {
        let mut bids = vec![
            order("#1", OrderSide::Buy, Some(dec!(99)), 10),
            order("#2", OrderSide::Buy, Some(dec!(101)), 5),
            order("#3", OrderSide::Buy, Some(dec!(101)), 20),
            order("#4", OrderSide::Buy, None, 1),
        ];
        sort_bids(&mut bids);
        assert_eq!(bids[0].contract_id, "#4"); // market first
        assert_eq!(bids[1].contract_id, "#3"); // 101, older
        assert_eq!(bids[2].contract_id, "#2"); // 101, newer
        assert_eq!(bids[3].contract_id, "#1"); // 99
    }

    #[test]
    fn test_ask_sort_price_ascending_time_tiebreak() {
        let mut asks = vec![
            order("#1", OrderSide::Sell, Some(dec!(102)), 10),
            order("#2", OrderSide::Sell, Some(dec!(100)), 5),
            order("#3", OrderSide::Sell, Some(dec!(100)), 20),
        ];
        sort_asks(&mut asks);
        assert_eq!(asks[0].contract_id, "#3");
        assert_eq!(asks[1].contract_id, "#2");
        assert_eq!(asks[2].contract_id, "#1");
    }

    #[test]
    fn test_min_remaining_filters_rounding_leftovers() {
        assert!(dec!(0.00000011) > MIN_REMAINING);
        assert!(dec!(0.00000009) < MIN_REMAINING);
        assert_eq!(MIN_REMAINING, dec!(0.0000001));
    }
}
