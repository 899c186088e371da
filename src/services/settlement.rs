//! Settlement Service
//!
//! Drives one match through atomic Delivery-versus-Payment completion:
//!
//! 1. Fill both orders on-ledger (buy first). Advancing `filled` before any
//!    transfer means a failure later never lets the next matching cycle
//!    rediscover the same pair.
//! 2. Execute the two allocation legs as executor (base seller->buyer,
//!    quote buyer->seller).
//! 3. Release reservations.
//! 4. Record the trade contract (best-effort).
//! 5. Notify the stop-loss engine.
//! 6. Publish events and append the trade to the recent-trade cache.
//!
//! Steps 5 and 6 never propagate errors above settlement.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cache::RecentTradeCache;
use crate::events::{EventHub, EventMessage};
use crate::ledger::retry::{with_retry_if, RetryPolicy};
use crate::ledger::{codec, LedgerApi, LedgerError, TemplateId, TransactionResult};
use crate::models::{Order, OrderStatus, Trade};
use crate::services::balances::BalanceReserver;
use crate::services::matching::MatchCandidate;
use crate::services::read_model::ReadModel;
use crate::services::stop_loss::StopLossEngine;

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Exchange party; executor of both allocation legs
    pub operator: String,
    /// Amounts below this are not worth a ledger operation
    pub dust_threshold: Decimal,
}

impl SettlementConfig {
    pub fn new(operator: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            dust_threshold: Decimal::from_parts(1, 0, 0, false, 6), // 1e-6
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    /// The buy order was consumed by another path; the match no longer
    /// exists and the settlement is abandoned
    #[error("Buy order {0} was consumed before settlement")]
    BuyOrderConsumed(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// What happened to one allocation leg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegOutcome {
    Executed,
    SkippedDust,
    SkippedNoAllocation,
    Failed,
}

pub struct Settlement {
    ledger: Arc<dyn LedgerApi>,
    read_model: Arc<ReadModel>,
    balances: Arc<BalanceReserver>,
    stop_loss: Arc<StopLossEngine>,
    events: Arc<EventHub>,
    trade_cache: Arc<RecentTradeCache>,
    config: SettlementConfig,
}

impl Settlement {
    pub fn new(
        ledger: Arc<dyn LedgerApi>,
        read_model: Arc<ReadModel>,
        balances: Arc<BalanceReserver>,
        stop_loss: Arc<StopLossEngine>,
        events: Arc<EventHub>,
        trade_cache: Arc<RecentTradeCache>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            ledger,
            read_model,
            balances,
            stop_loss,
            events,
            trade_cache,
            config,
        }
    }

    /// Settle one match end to end. Returns the trade, which carries a
    /// synthetic id when the on-ledger record could not be created.
    pub async fn settle(&self, candidate: MatchCandidate) -> Result<Trade, SettlementError> {
        let pair = candidate.buy.pair.clone();
        let quote_amount = candidate.quote_amount();
        info!(
            "Settling {} {} @ {} ({} <- {})",
            candidate.quantity, pair, candidate.price, candidate.buy.owner, candidate.sell.owner
        );

        // ---- Step 1: fill both orders, buy first ----
        match self.fill_order(&candidate.buy, candidate.quantity).await {
            Ok(result) => self.apply_fill(&candidate.buy, candidate.quantity, &result),
            Err(LedgerError::ContractNotFound(_)) => {
                // Another path consumed the buy order; the match is gone
                crate::metrics::record_settlement_failed(&pair.symbol());
                return Err(SettlementError::BuyOrderConsumed(
                    candidate.buy.contract_id.clone(),
                ));
            }
            Err(e) => {
                crate::metrics::record_settlement_failed(&pair.symbol());
                return Err(e.into());
            }
        }

        match self.fill_order(&candidate.sell, candidate.quantity).await {
            Ok(result) => self.apply_fill(&candidate.sell, candidate.quantity, &result),
            // The sell may have been consumed concurrently with the buy
            // fill; the buy side has already advanced, so settlement
            // proceeds with a warning
            Err(e) => warn!(
                "Sell-side fill failed after buy fill advanced ({}): {}",
                candidate.sell.contract_id, e
            ),
        }

        // ---- Step 2: execute the two allocation legs ----
        let base_leg = self
            .execute_leg(
                "base",
                candidate.sell.allocation_ref.as_deref(),
                candidate.quantity,
                &candidate.sell.owner,
            )
            .await;
        let quote_leg = self
            .execute_leg(
                "quote",
                candidate.buy.allocation_ref.as_deref(),
                quote_amount,
                &candidate.buy.owner,
            )
            .await;

        let mut trade = Trade::new(
            pair.clone(),
            candidate.buy.owner.clone(),
            candidate.sell.owner.clone(),
            candidate.price,
            candidate.quantity,
            candidate.buy.order_id,
            candidate.sell.order_id,
        );
        trade.sell_allocation_ref = candidate.sell.allocation_ref.clone();
        trade.buy_allocation_ref = candidate.buy.allocation_ref.clone();

        if let Some(failed_leg) = partial_settlement_leg(base_leg, quote_leg) {
            // One leg moved funds and the other did not. No automatic
            // reversal is attempted; operations investigates.
            error!(
                "PARTIAL SETTLEMENT on {}: {} leg failed (trade {})",
                pair, failed_leg, trade.trade_id
            );
            crate::metrics::record_partial_settlement(&pair.symbol(), failed_leg);
            self.events.publish(
                crate::events::topics::OPS,
                EventMessage::PartialSettlement {
                    trade_id: trade.trade_id,
                    pair: pair.symbol(),
                    failed_leg: failed_leg.to_string(),
                    timestamp: trade.timestamp.timestamp_millis(),
                },
            );
        }

        // ---- Step 3: release reservations ----
        self.balances
            .release_partial(candidate.sell.order_id, candidate.quantity);
        self.balances
            .release_partial(candidate.buy.order_id, quote_amount);

        // ---- Step 4: record the trade (best-effort) ----
        match self.record_trade(&trade).await {
            Ok(Some(contract_id)) => trade.contract_id = Some(contract_id),
            Ok(None) => {}
            Err(e) => warn!(
                "Trade record creation failed; keeping synthetic id {}: {}",
                trade.trade_id, e
            ),
        }
        self.read_model.insert_trade(trade.clone());

        // ---- Step 5: notify stop-loss ----
        self.stop_loss.check_triggers(&pair, candidate.price).await;

        // ---- Step 6: publish and cache ----
        self.publish(&trade, &candidate);
        crate::metrics::record_settlement(&pair.symbol());
        info!(
            "Settled trade {} on {}: {} @ {} (quote {})",
            trade.trade_id, pair, trade.base_amount, trade.base_price, trade.quote_amount
        );
        Ok(trade)
    }

    /// Exercise `FillOrder` with conflict retries; other error kinds are the
    /// caller's decision
    async fn fill_order(
        &self,
        order: &Order,
        quantity: Decimal,
    ) -> Result<TransactionResult, LedgerError> {
        let act_as = vec![self.config.operator.clone()];
        let read_as = vec![self.config.operator.clone(), order.owner.clone()];
        with_retry_if(
            RetryPolicy::generic_write(),
            "fill order",
            |e| matches!(e, LedgerError::Conflict(_)),
            || {
                self.ledger.submit_command(
                    &act_as,
                    &read_as,
                    codec::fill_order_command(&order.contract_id, quantity),
                )
            },
        )
        .await
    }

    /// Advance the projection with the post-fill order so the next cycle
    /// observes it without waiting for the live stream
    fn apply_fill(&self, order: &Order, quantity: Decimal, result: &TransactionResult) {
        if let Some(contract) = result.created_contract(TemplateId::Order) {
            match codec::order_from_contract(contract) {
                Ok(updated) => {
                    self.read_model.insert_order(updated);
                    return;
                }
                Err(e) => warn!("Unparseable post-fill order contract: {}", e),
            }
        }
        // No re-created contract: the order was fully consumed, or the
        // created event is not visible; mutate the projection in place
        let updated = self.read_model.update_order(&order.contract_id, |o| {
            o.filled += quantity;
            o.status = if o.is_fully_filled() {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
        });
        if updated {
            if let Some(current) = self.read_model.order_by_contract_id(&order.contract_id) {
                if current.status == OrderStatus::Filled {
                    self.read_model.remove_order(&order.contract_id);
                }
            }
        }
    }

    async fn execute_leg(
        &self,
        leg: &'static str,
        allocation_ref: Option<&str>,
        amount: Decimal,
        owner: &str,
    ) -> LegOutcome {
        if amount < self.config.dust_threshold {
            // Below dust the transfer costs more than it moves
            info!("Skipping {} leg: amount {} is dust", leg, amount);
            crate::metrics::record_dust_skip(leg);
            return LegOutcome::SkippedDust;
        }
        let allocation_ref = match allocation_ref {
            Some(r) => r,
            None => {
                warn!("Skipping {} leg for {}: no allocation attached", leg, owner);
                return LegOutcome::SkippedNoAllocation;
            }
        };
        match self
            .ledger
            .execute_allocation(allocation_ref, &self.config.operator, owner)
            .await
        {
            Ok(_) => {
                debug!("Executed {} leg: {} {} from {}", leg, amount, allocation_ref, owner);
                LegOutcome::Executed
            }
            Err(e) => {
                error!(
                    "{} leg failed ({} from {}): {}",
                    leg, allocation_ref, owner, e
                );
                LegOutcome::Failed
            }
        }
    }

    async fn record_trade(&self, trade: &Trade) -> Result<Option<String>, LedgerError> {
        let act_as = vec![self.config.operator.clone()];
        let read_as = vec![
            self.config.operator.clone(),
            trade.buyer.clone(),
            trade.seller.clone(),
        ];
        let result = self
            .ledger
            .submit_command(&act_as, &read_as, codec::trade_create_command(trade, &self.config.operator))
            .await?;
        Ok(result
            .created_contract(TemplateId::Trade)
            .map(|c| c.contract_id.clone()))
    }

    fn publish(&self, trade: &Trade, candidate: &MatchCandidate) {
        self.events.publish_trade(trade);
        self.events.publish_orderbook(
            &trade.pair,
            EventMessage::TradeExecuted {
                trade_id: trade.trade_id,
                pair: trade.pair.symbol(),
                base_price: trade.base_price,
                base_amount: trade.base_amount,
                buy_order_id: candidate.buy.order_id,
                sell_order_id: candidate.sell.order_id,
                timestamp: trade.timestamp.timestamp_millis(),
            },
        );
        self.events.publish_balance_update(&trade.buyer);
        if trade.seller != trade.buyer {
            self.events.publish_balance_update(&trade.seller);
        }
        self.trade_cache.insert(trade.clone());
    }
}

/// Exactly one executed leg with the other failed is a partial settlement;
/// returns the failed leg's name
fn partial_settlement_leg(base: LegOutcome, quote: LegOutcome) -> Option<&'static str> {
    match (base, quote) {
        (LegOutcome::Executed, LegOutcome::Failed) => Some("quote"),
        (LegOutcome::Failed, LegOutcome::Executed) => Some("base"),
        _ => None,
    }
}
