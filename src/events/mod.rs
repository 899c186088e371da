//! Event Publication Hub
//!
//! In-process broadcast topics that the WebSocket layer (an external
//! collaborator) subscribes to. One bounded `tokio::sync::broadcast` channel
//! per topic, created lazily on first publish or subscribe.
//!
//! Topics: `orderbook:{pair}`, `trades:{pair}`, `trades:all`,
//! `balance:{party}`, `ops`.
#![allow(dead_code)]

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{Trade, TradingPair};

const CHANNEL_CAPACITY: usize = 1024;

/// A message on one of the hub's topics
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventMessage {
    NewOrder {
        order_id: Uuid,
        pair: String,
        side: String,
        mode: String,
        price: Option<Decimal>,
        quantity: Decimal,
        timestamp: i64,
    },
    OrderCancelled {
        order_id: Uuid,
        pair: String,
        timestamp: i64,
    },
    TradeExecuted {
        trade_id: Uuid,
        pair: String,
        base_price: Decimal,
        base_amount: Decimal,
        buy_order_id: Uuid,
        sell_order_id: Uuid,
        timestamp: i64,
    },
    StopLossTriggered {
        order_id: Uuid,
        pair: String,
        trigger_price: Decimal,
        timestamp: i64,
    },
    NewTrade {
        trade_id: Uuid,
        pair: String,
        buyer: String,
        seller: String,
        base_price: Decimal,
        base_amount: Decimal,
        quote_amount: Decimal,
        buy_order_id: Uuid,
        sell_order_id: Uuid,
        timestamp: i64,
    },
    BalanceUpdate {
        party_id: String,
        timestamp: i64,
    },
    /// Operational alert: one settlement leg executed, the other did not
    PartialSettlement {
        trade_id: Uuid,
        pair: String,
        failed_leg: String,
        timestamp: i64,
    },
}

/// Topic name helpers
pub mod topics {
    use crate::models::TradingPair;

    pub fn orderbook(pair: &TradingPair) -> String {
        format!("orderbook:{}", pair)
    }

    pub fn trades(pair: &TradingPair) -> String {
        format!("trades:{}", pair)
    }

    pub const TRADES_ALL: &str = "trades:all";

    pub fn balance(party: &str) -> String {
        format!("balance:{}", party)
    }

    /// Operational events (partial settlements and the like)
    pub const OPS: &str = "ops";
}

/// Broadcast hub with lazily-created per-topic channels
pub struct EventHub {
    channels: DashMap<String, broadcast::Sender<EventMessage>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<EventMessage> {
        self.channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Publish to a topic. Lagging or absent subscribers never fail the
    /// publisher.
    pub fn publish(&self, topic: &str, message: EventMessage) {
        let _ = self.sender(topic).send(message);
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<EventMessage> {
        self.sender(topic).subscribe()
    }

    /// Publish a trade to `trades:{pair}` and `trades:all`
    pub fn publish_trade(&self, trade: &Trade) {
        let message = EventMessage::NewTrade {
            trade_id: trade.trade_id,
            pair: trade.pair.symbol(),
            buyer: trade.buyer.clone(),
            seller: trade.seller.clone(),
            base_price: trade.base_price,
            base_amount: trade.base_amount,
            quote_amount: trade.quote_amount,
            buy_order_id: trade.buy_order_id,
            sell_order_id: trade.sell_order_id,
            timestamp: trade.timestamp.timestamp_millis(),
        };
        self.publish(&topics::trades(&trade.pair), message.clone());
        self.publish(topics::TRADES_ALL, message);
    }

    /// Publish an order-book event for a pair
    pub fn publish_orderbook(&self, pair: &TradingPair, message: EventMessage) {
        self.publish(&topics::orderbook(pair), message);
    }

    /// Hint a party's clients to re-fetch balances
    pub fn publish_balance_update(&self, party: &str) {
        self.publish(
            &topics::balance(party),
            EventMessage::BalanceUpdate {
                party_id: party.to_string(),
                timestamp: Utc::now().timestamp_millis(),
            },
        );
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
