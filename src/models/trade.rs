use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::pair::TradingPair;

/// An executed trade between a buy and a sell order
///
/// Immutable once created. `quote_amount` always equals
/// `base_price * base_amount` at full decimal precision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: Uuid,
    /// Ledger contract id of the trade record, when one was created
    pub contract_id: Option<String>,
    pub pair: TradingPair,
    pub buyer: String,
    pub seller: String,
    pub base_price: Decimal,
    pub base_amount: Decimal,
    pub quote_amount: Decimal,
    pub buy_order_id: Uuid,
    pub sell_order_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Allocation contract ids consumed by the two settlement legs
    pub sell_allocation_ref: Option<String>,
    pub buy_allocation_ref: Option<String>,
}

impl Trade {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pair: TradingPair,
        buyer: String,
        seller: String,
        base_price: Decimal,
        base_amount: Decimal,
        buy_order_id: Uuid,
        sell_order_id: Uuid,
    ) -> Self {
        Self {
            trade_id: Uuid::new_v4(),
            contract_id: None,
            pair,
            buyer,
            seller,
            base_price,
            base_amount,
            quote_amount: base_price * base_amount,
            buy_order_id,
            sell_order_id,
            timestamp: Utc::now(),
            sell_allocation_ref: None,
            buy_allocation_ref: None,
        }
    }
}
