use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::pair::TradingPair;

// Helper module to serialize DateTime as milliseconds timestamp
mod datetime_as_millis {
    use chrono::{DateTime, Utc};
    use serde::Serializer;

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(dt.timestamp_millis())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderMode {
    Limit,
    Market,
    StopLoss,
}

impl fmt::Display for OrderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderMode::Limit => write!(f, "limit"),
            OrderMode::Market => write!(f, "market"),
            OrderMode::StopLoss => write!(f, "stop_loss"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Order is active and visible to the matching view
    Open,
    /// Stop-loss order waiting for its trigger price
    PendingTrigger,
    /// Order is partially filled
    PartiallyFilled,
    /// Order is completely filled
    Filled,
    /// Order was cancelled
    Cancelled,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Open => write!(f, "open"),
            OrderStatus::PendingTrigger => write!(f, "pending_trigger"),
            OrderStatus::PartiallyFilled => write!(f, "partially_filled"),
            OrderStatus::Filled => write!(f, "filled"),
            OrderStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl OrderStatus {
    /// True while the order can still accumulate fills
    pub fn is_live(&self) -> bool {
        matches!(self, OrderStatus::Open | OrderStatus::PartiallyFilled)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled)
    }
}

/// An order as projected from the ledger
///
/// `contract_id` is the ledger-assigned identity and changes every time the
/// order contract is consumed and re-created (each fill). `order_id` is the
/// locally-generated identity and is stable across the whole lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: Uuid,
    pub contract_id: String,
    pub owner: String,
    pub pair: TradingPair,
    pub side: OrderSide,
    pub mode: OrderMode,
    /// Limit price; None for market orders (and for triggered stops)
    pub price: Option<Decimal>,
    /// Trigger threshold; present only while mode is StopLoss
    pub stop_price: Option<Decimal>,
    pub quantity: Decimal,
    pub filled: Decimal,
    pub status: OrderStatus,
    #[serde(serialize_with = "datetime_as_millis::serialize")]
    pub timestamp: DateTime<Utc>,
    /// Reference to the pre-locked allocation contract on the ledger
    pub allocation_ref: Option<String>,
    pub triggered_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn remaining(&self) -> Decimal {
        self.quantity - self.filled
    }

    pub fn is_fully_filled(&self) -> bool {
        self.remaining() <= Decimal::ZERO
    }
}

/// Order placement input, validated by the order service
#[derive(Debug, Clone, Deserialize)]
pub struct PlaceOrderRequest {
    pub party_id: String,
    pub pair: TradingPair,
    pub side: OrderSide,
    pub mode: OrderMode,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub allocation_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderResponse {
    pub order_id: Uuid,
    pub contract_id: String,
    pub pair: String,
    pub side: OrderSide,
    pub mode: OrderMode,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub quantity: Decimal,
    pub filled: Decimal,
    pub remaining: Decimal,
    pub status: OrderStatus,
    #[serde(serialize_with = "datetime_as_millis::serialize")]
    pub timestamp: DateTime<Utc>,
}

impl From<&Order> for OrderResponse {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.order_id,
            contract_id: order.contract_id.clone(),
            pair: order.pair.symbol(),
            side: order.side,
            mode: order.mode,
            price: order.price,
            stop_price: order.stop_price,
            quantity: order.quantity,
            filled: order.filled,
            remaining: order.remaining(),
            status: order.status,
            timestamp: order.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_order() -> Order {
        Order {
            order_id: Uuid::new_v4(),
            contract_id: "#1:0".to_string(),
            owner: "party::alice".to_string(),
            pair: "CC/CBTC".parse().unwrap(),
            side: OrderSide::Buy,
            mode: OrderMode::Limit,
            price: Some(dec!(100)),
            stop_price: None,
            quantity: dec!(3.0),
            filled: dec!(1.0),
            status: OrderStatus::PartiallyFilled,
            timestamp: Utc::now(),
            allocation_ref: None,
            triggered_at: None,
        }
    }

    #[test]
    fn test_remaining() {
        let order = sample_order();
        assert_eq!(order.remaining(), dec!(2.0));
        assert!(!order.is_fully_filled());
    }

    #[test]
    fn test_status_liveness() {
        assert!(OrderStatus::Open.is_live());
        assert!(OrderStatus::PartiallyFilled.is_live());
        assert!(!OrderStatus::PendingTrigger.is_live());
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_response_carries_remaining() {
        let order = sample_order();
        let resp = OrderResponse::from(&order);
        assert_eq!(resp.remaining, dec!(2.0));
        assert_eq!(resp.pair, "CC/CBTC");
    }
}
