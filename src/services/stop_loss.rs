//! Stop-Loss Trigger Engine
//!
//! Holds stop orders out of the book and promotes each to a market order
//! exactly when its trigger condition is crossed. The primary trigger path
//! is Settlement calling [`StopLossEngine::check_triggers`] after every
//! trade; a backup poll covers price movements arriving from other sources.
#![allow(dead_code)]

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::{EventHub, EventMessage};
use crate::ledger::{codec, LedgerApi, LedgerError, TemplateId};
use crate::models::{OrderMode, OrderSide, OrderStatus, TradingPair};
use crate::services::matching::CycleRequester;
use crate::services::read_model::ReadModel;

/// One pending stop order, indexed by pair
#[derive(Debug, Clone)]
pub struct StopRegistration {
    pub order_id: Uuid,
    pub order_contract_id: String,
    pub party_id: String,
    pub pair: TradingPair,
    pub side: OrderSide,
    pub stop_price: Decimal,
    pub quantity: Decimal,
    pub allocation_ref: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl StopRegistration {
    /// Sell stops fire when the market trades at or below the stop price;
    /// buy stops at or above
    pub fn is_triggered_by(&self, last_trade_price: Decimal) -> bool {
        match self.side {
            OrderSide::Sell => last_trade_price <= self.stop_price,
            OrderSide::Buy => last_trade_price >= self.stop_price,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StopLossError {
    #[error("Stop order {0} is not registered")]
    NotRegistered(Uuid),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

pub struct StopLossEngine {
    ledger: Arc<dyn LedgerApi>,
    read_model: Arc<ReadModel>,
    events: Arc<EventHub>,
    cycles: CycleRequester,
    operator: String,
    registrations: DashMap<Uuid, StopRegistration>,
    by_pair: DashMap<String, HashSet<Uuid>>,
    backup_poll_interval: Duration,
}

impl StopLossEngine {
    pub fn new(
        ledger: Arc<dyn LedgerApi>,
        read_model: Arc<ReadModel>,
        events: Arc<EventHub>,
        cycles: CycleRequester,
        operator: String,
        backup_poll_interval: Duration,
    ) -> Self {
        Self {
            ledger,
            read_model,
            events,
            cycles,
            operator,
            registrations: DashMap::new(),
            by_pair: DashMap::new(),
            backup_poll_interval,
        }
    }

    pub fn register(&self, registration: StopRegistration) {
        crate::metrics::record_stop_registered(&registration.pair.symbol());
        self.by_pair
            .entry(registration.pair.symbol())
            .or_default()
            .insert(registration.order_id);
        info!(
            "Registered {} stop for {} at {} ({})",
            registration.side, registration.pair, registration.stop_price, registration.order_id
        );
        self.registrations
            .insert(registration.order_id, registration);
    }

    pub fn unregister(&self, order_id: Uuid) -> Option<StopRegistration> {
        let (_, registration) = self.registrations.remove(&order_id)?;
        if let Some(mut ids) = self.by_pair.get_mut(&registration.pair.symbol()) {
            ids.remove(&order_id);
        }
        Some(registration)
    }

    pub fn pending_for_pair(&self, pair: &TradingPair) -> Vec<StopRegistration> {
        self.by_pair
            .get(&pair.symbol())
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.registrations.get(id).map(|r| r.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.registrations.len()
    }

    /// Pairs that currently have pending stops
    fn pairs_with_pending(&self) -> Vec<TradingPair> {
        self.by_pair
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .filter_map(|entry| entry.key().parse().ok())
            .collect()
    }

    /// Evaluate every pending stop for `pair` against the executed price and
    /// promote the crossing ones, serially. A failed promotion never blocks
    /// the remaining triggers.
    pub async fn check_triggers(&self, pair: &TradingPair, last_trade_price: Decimal) {
        let crossed: Vec<StopRegistration> = self
            .pending_for_pair(pair)
            .into_iter()
            .filter(|r| r.is_triggered_by(last_trade_price))
            .collect();

        if crossed.is_empty() {
            return;
        }
        debug!(
            "{} stop(s) crossed on {} at price {}",
            crossed.len(),
            pair,
            last_trade_price
        );

        for registration in crossed {
            match self.trigger_one(&registration, last_trade_price).await {
                Ok(()) => {
                    self.unregister(registration.order_id);
                }
                Err(StopLossError::Ledger(LedgerError::ContractNotFound(_))) => {
                    // Order already consumed or cancelled; nothing to trigger
                    warn!(
                        "Stop order {} vanished before trigger; unregistering",
                        registration.order_id
                    );
                    self.unregister(registration.order_id);
                }
                Err(e) => {
                    error!(
                        "Failed to trigger stop order {}: {}",
                        registration.order_id, e
                    );
                }
            }
        }
    }

    async fn trigger_one(
        &self,
        registration: &StopRegistration,
        trigger_price: Decimal,
    ) -> Result<(), StopLossError> {
        let triggered_at = Utc::now();
        let command = codec::trigger_stop_loss_command(
            &registration.order_contract_id,
            triggered_at,
            trigger_price,
        );
        let act_as = vec![self.operator.clone()];
        let read_as = vec![self.operator.clone(), registration.party_id.clone()];
        let result = self.ledger.submit_command(&act_as, &read_as, command).await?;

        // Prefer the re-created contract from the transaction; fall back to
        // mutating the projection in place
        if let Some(contract) = result.created_contract(TemplateId::Order) {
            match codec::order_from_contract(contract) {
                Ok(order) => self.read_model.insert_order(order),
                Err(e) => warn!("Unparseable triggered order contract: {}", e),
            }
        } else {
            self.read_model
                .update_order(&registration.order_contract_id, |order| {
                    order.status = OrderStatus::Open;
                    order.mode = OrderMode::Market;
                    order.price = None;
                    order.triggered_at = Some(triggered_at);
                });
        }

        crate::metrics::record_stop_triggered(&registration.pair.symbol());
        self.events.publish_orderbook(
            &registration.pair,
            EventMessage::StopLossTriggered {
                order_id: registration.order_id,
                pair: registration.pair.symbol(),
                trigger_price,
                timestamp: triggered_at.timestamp_millis(),
            },
        );
        info!(
            "Stop order {} triggered at {} (stop {})",
            registration.order_id, trigger_price, registration.stop_price
        );

        // The promoted market order should match as soon as possible
        self.cycles.request(&registration.pair);
        Ok(())
    }

    /// Safety-net poll for price movements that arrive via sources other
    /// than local matches
    pub async fn run_backup_poll(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Stop-loss backup poll started (every {:?})",
            self.backup_poll_interval
        );
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Stop-loss backup poll stopped");
                    return;
                }
                _ = tokio::time::sleep(self.backup_poll_interval) => {
                    for pair in self.pairs_with_pending() {
                        if let Some(price) = self.read_model.market_price(&pair) {
                            self.check_triggers(&pair, price).await;
                        }
                    }
                }
            }
        }
    }
}
