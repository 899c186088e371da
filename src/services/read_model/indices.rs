//! Read Model Indices
//!
//! Point-lookup indices over the projected contracts. All containers support
//! concurrent reads with exclusive per-entry writes; the update worker is the
//! only writer on the live path, plus the speculative mutations applied by
//! the order and settlement services.

use dashmap::DashMap;
use std::collections::HashSet;
use uuid::Uuid;

use crate::ledger::ActiveContract;
use crate::models::{Order, Trade, TradingPair};

#[derive(Default)]
pub struct ProjectionIndices {
    orders_by_cid: DashMap<String, Order>,
    order_cid_by_order_id: DashMap<Uuid, String>,
    order_cids_by_pair: DashMap<String, HashSet<String>>,
    order_cids_by_owner: DashMap<String, HashSet<String>>,

    trades_by_cid: DashMap<String, Trade>,
    trade_cids_by_pair: DashMap<String, HashSet<String>>,

    allocations_by_cid: DashMap<String, ActiveContract>,
}

impl ProjectionIndices {
    pub fn new() -> Self {
        Self::default()
    }

    // ==================== Orders ====================

    pub fn insert_order(&self, order: Order) {
        let cid = order.contract_id.clone();

        // An order id maps to at most one live contract; replacing the
        // contract (a fill re-create) drops the stale projection first.
        if let Some(old_cid) = self.order_cid_by_order_id.get(&order.order_id) {
            let old_cid = old_cid.clone();
            if old_cid != cid {
                self.remove_order(&old_cid);
            }
        }

        self.order_cid_by_order_id.insert(order.order_id, cid.clone());
        self.order_cids_by_pair
            .entry(order.pair.symbol())
            .or_default()
            .insert(cid.clone());
        self.order_cids_by_owner
            .entry(order.owner.clone())
            .or_default()
            .insert(cid.clone());
        self.orders_by_cid.insert(cid, order);
    }

    pub fn remove_order(&self, contract_id: &str) -> Option<Order> {
        let (_, order) = self.orders_by_cid.remove(contract_id)?;
        if let Some(mut cids) = self.order_cids_by_pair.get_mut(&order.pair.symbol()) {
            cids.remove(contract_id);
        }
        if let Some(mut cids) = self.order_cids_by_owner.get_mut(&order.owner) {
            cids.remove(contract_id);
        }
        // Only unlink the order-id mapping if it still points at this
        // contract; a re-create may already have overwritten it
        if self
            .order_cid_by_order_id
            .get(&order.order_id)
            .map(|cid| *cid == contract_id)
            .unwrap_or(false)
        {
            self.order_cid_by_order_id.remove(&order.order_id);
        }
        Some(order)
    }

    pub fn order_by_contract_id(&self, contract_id: &str) -> Option<Order> {
        self.orders_by_cid.get(contract_id).map(|o| o.clone())
    }

    pub fn order_by_order_id(&self, order_id: Uuid) -> Option<Order> {
        let cid = self.order_cid_by_order_id.get(&order_id)?.clone();
        self.order_by_contract_id(&cid)
    }

    /// Mutate an order in place; returns false when the contract is unknown
    pub fn update_order<F>(&self, contract_id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut Order),
    {
        match self.orders_by_cid.get_mut(contract_id) {
            Some(mut order) => {
                mutate(&mut order);
                true
            }
            None => false,
        }
    }

    pub fn orders_for_pair(&self, pair: &TradingPair) -> Vec<Order> {
        self.order_cids_by_pair
            .get(&pair.symbol())
            .map(|cids| {
                cids.iter()
                    .filter_map(|cid| self.order_by_contract_id(cid))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn orders_for_owner(&self, owner: &str) -> Vec<Order> {
        self.order_cids_by_owner
            .get(owner)
            .map(|cids| {
                cids.iter()
                    .filter_map(|cid| self.order_by_contract_id(cid))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn order_count(&self) -> usize {
        self.orders_by_cid.len()
    }

    // ==================== Trades ====================

    pub fn insert_trade(&self, trade: Trade) {
        let cid = match &trade.contract_id {
            Some(cid) => cid.clone(),
            // Synthetic trades (record creation failed) are not indexed by
            // contract id; the trade cache still carries them
            None => return,
        };
        self.trade_cids_by_pair
            .entry(trade.pair.symbol())
            .or_default()
            .insert(cid.clone());
        self.trades_by_cid.insert(cid, trade);
    }

    pub fn remove_trade(&self, contract_id: &str) -> Option<Trade> {
        let (_, trade) = self.trades_by_cid.remove(contract_id)?;
        if let Some(mut cids) = self.trade_cids_by_pair.get_mut(&trade.pair.symbol()) {
            cids.remove(contract_id);
        }
        Some(trade)
    }

    pub fn trades_for_pair(&self, pair: &TradingPair) -> Vec<Trade> {
        self.trade_cids_by_pair
            .get(&pair.symbol())
            .map(|cids| {
                cids.iter()
                    .filter_map(|cid| self.trades_by_cid.get(cid.as_str()).map(|t| t.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all_trades(&self) -> Vec<Trade> {
        self.trades_by_cid.iter().map(|t| t.clone()).collect()
    }

    pub fn trade_count(&self) -> usize {
        self.trades_by_cid.len()
    }

    // ==================== Allocations ====================

    pub fn insert_allocation(&self, contract: ActiveContract) {
        self.allocations_by_cid
            .insert(contract.contract_id.clone(), contract);
    }

    pub fn remove_allocation(&self, contract_id: &str) -> Option<ActiveContract> {
        self.allocations_by_cid
            .remove(contract_id)
            .map(|(_, contract)| contract)
    }

    pub fn allocation_by_cid(&self, contract_id: &str) -> Option<ActiveContract> {
        self.allocations_by_cid.get(contract_id).map(|a| a.clone())
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations_by_cid.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderMode, OrderSide, OrderStatus};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn order(cid: &str, order_id: Uuid) -> Order {
        Order {
            order_id,
            contract_id: cid.to_string(),
            owner: "party::a".into(),
            pair: "CC/CBTC".parse().unwrap(),
            side: OrderSide::Buy,
            mode: OrderMode::Limit,
            price: Some(dec!(100)),
            stop_price: None,
            quantity: dec!(1),
            filled: dec!(0),
            status: OrderStatus::Open,
            timestamp: Utc::now(),
            allocation_ref: None,
            triggered_at: None,
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let indices = ProjectionIndices::new();
        let id = Uuid::new_v4();
        indices.insert_order(order("#1:0", id));

        assert!(indices.order_by_contract_id("#1:0").is_some());
        assert!(indices.order_by_order_id(id).is_some());
        assert_eq!(indices.orders_for_pair(&"CC/CBTC".parse().unwrap()).len(), 1);
        assert_eq!(indices.orders_for_owner("party::a").len(), 1);
    }

    #[test]
    fn test_recreate_replaces_stale_contract() {
        let indices = ProjectionIndices::new();
        let id = Uuid::new_v4();
        indices.insert_order(order("#1:0", id));
        indices.insert_order(order("#2:0", id));

        assert!(indices.order_by_contract_id("#1:0").is_none());
        let current = indices.order_by_order_id(id).unwrap();
        assert_eq!(current.contract_id, "#2:0");
        assert_eq!(indices.orders_for_pair(&"CC/CBTC".parse().unwrap()).len(), 1);
    }

    #[test]
    fn test_remove_cleans_every_index() {
        let indices = ProjectionIndices::new();
        let id = Uuid::new_v4();
        indices.insert_order(order("#1:0", id));
        let removed = indices.remove_order("#1:0").unwrap();
        assert_eq!(removed.order_id, id);

        assert!(indices.order_by_order_id(id).is_none());
        assert!(indices.orders_for_pair(&"CC/CBTC".parse().unwrap()).is_empty());
        assert!(indices.orders_for_owner("party::a").is_empty());
    }

    #[test]
    fn test_stale_archive_does_not_unlink_recreate() {
        let indices = ProjectionIndices::new();
        let id = Uuid::new_v4();
        indices.insert_order(order("#1:0", id));
        indices.insert_order(order("#2:0", id));
        // The live stream may deliver the archive of the consumed contract
        // after the speculative re-create was applied
        assert!(indices.remove_order("#1:0").is_none());
        assert!(indices.order_by_order_id(id).is_some());
    }

    #[test]
    fn test_update_in_place() {
        let indices = ProjectionIndices::new();
        indices.insert_order(order("#1:0", Uuid::new_v4()));
        assert!(indices.update_order("#1:0", |o| o.filled = dec!(0.5)));
        assert_eq!(
            indices.order_by_contract_id("#1:0").unwrap().filled,
            dec!(0.5)
        );
        assert!(!indices.update_order("#9:9", |o| o.filled = dec!(1)));
    }
}
