//! Order Service
//!
//! The sole public entry point for order placement, cancellation, and
//! lookups. Enforces input validation and the ordering invariant that a
//! balance reservation is established before the order contract is created
//! on the ledger, and released only after the ledger effect is observed.
#![allow(dead_code)]

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EventHub, EventMessage};
use crate::ledger::{codec, LedgerApi, LedgerError, TemplateId};
use crate::models::{
    Order, OrderMode, OrderResponse, OrderSide, OrderStatus, PlaceOrderRequest, TradingPair,
};
use crate::services::balances::{BalanceReserver, ReservationError};
use crate::services::matching::CycleRequester;
use crate::services::read_model::{OrderBookView, ReadModel};
use crate::services::stop_loss::{StopLossEngine, StopRegistration};

#[derive(Debug, Clone)]
pub struct OrderServiceConfig {
    /// Exchange operator party, co-signatory on every order
    pub operator: String,
    pub pairs: Vec<TradingPair>,
    /// Over-reservation factor for market buys
    pub market_slippage_buffer: Decimal,
}

impl OrderServiceConfig {
    pub fn new(operator: impl Into<String>, pairs: Vec<TradingPair>) -> Self {
        Self {
            operator: operator.into(),
            pairs,
            market_slippage_buffer: Decimal::new(5, 2), // 0.05
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Order not found")]
    NotFound,

    #[error("Order does not belong to the requesting party")]
    NotOwner,

    #[error("Order is already {0}")]
    AlreadyClosed(OrderStatus),

    #[error("Insufficient balance: required {required} {asset}, effective available {available}")]
    InsufficientBalance {
        asset: String,
        required: Decimal,
        available: Decimal,
    },

    #[error("Market order rejected: no opposing liquidity")]
    NoLiquidity,

    #[error(transparent)]
    Reservation(#[from] ReservationError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

pub struct OrderService {
    ledger: Arc<dyn LedgerApi>,
    read_model: Arc<ReadModel>,
    balances: Arc<BalanceReserver>,
    stop_loss: Arc<StopLossEngine>,
    events: Arc<EventHub>,
    cycles: CycleRequester,
    config: OrderServiceConfig,
}

impl OrderService {
    pub fn new(
        ledger: Arc<dyn LedgerApi>,
        read_model: Arc<ReadModel>,
        balances: Arc<BalanceReserver>,
        stop_loss: Arc<StopLossEngine>,
        events: Arc<EventHub>,
        cycles: CycleRequester,
        config: OrderServiceConfig,
    ) -> Self {
        Self {
            ledger,
            read_model,
            balances,
            stop_loss,
            events,
            cycles,
            config,
        }
    }

    // ==================== Placement ====================

    pub async fn place(&self, request: PlaceOrderRequest) -> Result<OrderResponse, OrderError> {
        self.validate(&request)?;

        let (asset, required) = self.reservation_for(&request)?;

        // Advisory check only: the ledger read may be stale or fail, and the
        // authoritative check happens at settlement. A failed read never
        // blocks placement.
        match self
            .ledger
            .get_available_balance(&request.party_id, &asset)
            .await
        {
            Ok(on_chain) => {
                let effective = on_chain - self.balances.reserved(&request.party_id, &asset);
                if effective < required {
                    crate::metrics::record_order_rejected("insufficient_balance");
                    return Err(OrderError::InsufficientBalance {
                        asset,
                        required,
                        available: effective,
                    });
                }
            }
            Err(e) => warn!(
                "Balance read failed for {} ({}); proceeding on reservation only: {}",
                request.party_id, asset, e
            ),
        }

        let order_id = Uuid::new_v4();
        self.balances
            .reserve(order_id, &request.party_id, &asset, required)?;

        let mut order = Order {
            order_id,
            contract_id: String::new(),
            owner: request.party_id.clone(),
            pair: request.pair.clone(),
            side: request.side,
            mode: request.mode,
            price: match request.mode {
                OrderMode::Limit => request.price,
                _ => None,
            },
            stop_price: match request.mode {
                OrderMode::StopLoss => request.stop_price,
                _ => None,
            },
            quantity: request.quantity,
            filled: Decimal::ZERO,
            status: match request.mode {
                OrderMode::StopLoss => OrderStatus::PendingTrigger,
                _ => OrderStatus::Open,
            },
            timestamp: Utc::now(),
            allocation_ref: request.allocation_ref.clone(),
            triggered_at: None,
        };

        let act_as = vec![request.party_id.clone(), self.config.operator.clone()];
        let read_as = vec![self.config.operator.clone(), request.party_id.clone()];
        let result = match self
            .ledger
            .submit_command(
                &act_as,
                &read_as,
                codec::order_create_command(&order, &self.config.operator),
            )
            .await
        {
            Ok(result) => result,
            Err(e) => {
                // The contract never existed; hand the funds back
                self.balances.release(order_id);
                crate::metrics::record_order_rejected("ledger_create_failed");
                return Err(e.into());
            }
        };

        if let Some(contract) = result.created_contract(TemplateId::Order) {
            order.contract_id = contract.contract_id.clone();
        } else {
            warn!(
                "Order create for {} returned no created event (tx {})",
                order_id, result.transaction_id
            );
        }

        // Speculative projection; the live stream converges on the same state
        self.read_model.insert_order(order.clone());

        crate::metrics::record_order_placed(
            &order.pair.symbol(),
            &order.side.to_string(),
            &order.mode.to_string(),
        );
        self.events.publish_orderbook(
            &order.pair,
            EventMessage::NewOrder {
                order_id,
                pair: order.pair.symbol(),
                side: order.side.to_string(),
                mode: order.mode.to_string(),
                price: order.price,
                quantity: order.quantity,
                timestamp: order.timestamp.timestamp_millis(),
            },
        );

        if order.mode == OrderMode::StopLoss {
            // Pending stops are invisible to the book; no matching cycle yet
            self.stop_loss.register(StopRegistration {
                order_id,
                order_contract_id: order.contract_id.clone(),
                party_id: order.owner.clone(),
                pair: order.pair.clone(),
                side: order.side,
                stop_price: order.stop_price.unwrap_or_default(),
                quantity: order.quantity,
                allocation_ref: order.allocation_ref.clone(),
                registered_at: order.timestamp,
            });
        } else {
            self.cycles.request(&order.pair);
        }

        info!(
            "Placed {} {} {} {} on {} (order {})",
            order.mode, order.side, order.quantity, asset, order.pair, order_id
        );
        Ok(OrderResponse::from(&order))
    }

    fn validate(&self, request: &PlaceOrderRequest) -> Result<(), OrderError> {
        if !self.config.pairs.contains(&request.pair) {
            return Err(OrderError::Validation(format!(
                "Unknown trading pair: {}",
                request.pair
            )));
        }
        if request.quantity <= Decimal::ZERO {
            return Err(OrderError::Validation(format!(
                "Quantity must be positive, got {}",
                request.quantity
            )));
        }
        match request.mode {
            OrderMode::Limit => {
                match request.price {
                    Some(price) if price > Decimal::ZERO => {}
                    Some(price) => {
                        return Err(OrderError::Validation(format!(
                            "Limit price must be positive, got {}",
                            price
                        )))
                    }
                    None => {
                        return Err(OrderError::Validation(
                            "Limit orders require a price".to_string(),
                        ))
                    }
                }
            }
            OrderMode::Market => {
                if request.price.is_some() {
                    return Err(OrderError::Validation(
                        "Market orders must not carry a price".to_string(),
                    ));
                }
            }
            OrderMode::StopLoss => {
                match request.stop_price {
                    Some(stop) if stop > Decimal::ZERO => {}
                    _ => {
                        return Err(OrderError::Validation(
                            "Stop-loss orders require a positive stop price".to_string(),
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    /// The (asset, amount) a placement must reserve: quote cover for buys
    /// (with a slippage buffer when the execution price is estimated), the
    /// base quantity for sells.
    fn reservation_for(
        &self,
        request: &PlaceOrderRequest,
    ) -> Result<(String, Decimal), OrderError> {
        match request.side {
            OrderSide::Sell => {
                // A market sell against an empty bid side would dangle
                // unfillable in the book
                if request.mode == OrderMode::Market
                    && self.read_model.order_book(&request.pair).best_bid().is_none()
                {
                    return Err(OrderError::NoLiquidity);
                }
                Ok((request.pair.base().to_string(), request.quantity))
            }
            OrderSide::Buy => {
                let asset = request.pair.quote().to_string();
                let buffer = Decimal::ONE + self.config.market_slippage_buffer;
                let amount = match request.mode {
                    OrderMode::Limit => {
                        request.quantity * request.price.unwrap_or_default()
                    }
                    OrderMode::Market => {
                        let book = self.read_model.order_book(&request.pair);
                        let estimated = book.best_ask().ok_or(OrderError::NoLiquidity)?;
                        request.quantity * estimated * buffer
                    }
                    // A stop buy becomes a market order at trigger time; the
                    // stop price is the best available estimate now
                    OrderMode::StopLoss => {
                        request.quantity * request.stop_price.unwrap_or_default() * buffer
                    }
                };
                Ok((asset, amount))
            }
        }
    }

    // ==================== Cancellation ====================

    /// Cancel by order id or order contract id. A concurrent consumption of
    /// the contract (`ContractNotFound`) counts as a successful cancel.
    pub async fn cancel(&self, reference: &str, party: &str) -> Result<OrderResponse, OrderError> {
        let order = self.lookup(reference).ok_or(OrderError::NotFound)?;
        if order.owner != party {
            return Err(OrderError::NotOwner);
        }
        if order.status.is_terminal() {
            return Err(OrderError::AlreadyClosed(order.status));
        }

        // Hand an unexecuted allocation back to the owner before archiving
        // the order that references it
        if let Some(allocation_ref) = &order.allocation_ref {
            let still_active = !self.read_model.is_ready()
                || self.read_model.allocation_by_cid(allocation_ref).is_some();
            if still_active {
                match self
                    .ledger
                    .withdraw_allocation(allocation_ref, &order.owner)
                    .await
                {
                    Ok(_) => debug!("Withdrew allocation {}", allocation_ref),
                    Err(LedgerError::ContractNotFound(_)) => {
                        debug!("Allocation {} already consumed", allocation_ref)
                    }
                    Err(e) => warn!(
                        "Allocation withdrawal failed for {}; continuing cancel: {}",
                        allocation_ref, e
                    ),
                }
            }
        }

        let act_as = vec![order.owner.clone()];
        let read_as = vec![order.owner.clone(), self.config.operator.clone()];
        match self
            .ledger
            .submit_command(
                &act_as,
                &read_as,
                codec::cancel_order_command(&order.contract_id),
            )
            .await
        {
            Ok(_) => {}
            // The order was consumed by settlement while the cancel was in
            // flight; from the caller's view the order is gone either way
            Err(LedgerError::ContractNotFound(_)) => {
                debug!(
                    "Cancel raced settlement on {}; treating as cancelled",
                    order.contract_id
                )
            }
            Err(e) => return Err(e.into()),
        }

        self.balances.release(order.order_id);
        self.read_model.remove_order(&order.contract_id);
        if order.mode == OrderMode::StopLoss {
            self.stop_loss.unregister(order.order_id);
        }

        crate::metrics::record_order_cancelled(&order.pair.symbol());
        self.events.publish_orderbook(
            &order.pair,
            EventMessage::OrderCancelled {
                order_id: order.order_id,
                pair: order.pair.symbol(),
                timestamp: Utc::now().timestamp_millis(),
            },
        );
        self.events.publish_balance_update(&order.owner);

        info!("Cancelled order {} ({})", order.order_id, order.pair);
        let mut cancelled = order;
        cancelled.status = OrderStatus::Cancelled;
        Ok(OrderResponse::from(&cancelled))
    }

    fn lookup(&self, reference: &str) -> Option<Order> {
        if let Ok(order_id) = reference.parse::<Uuid>() {
            if let Some(order) = self.read_model.order_by_order_id(order_id) {
                return Some(order);
            }
        }
        self.read_model.order_by_contract_id(reference)
    }

    // ==================== Queries ====================

    pub fn order_status(&self, reference: &str) -> Option<OrderResponse> {
        self.lookup(reference).map(|o| OrderResponse::from(&o))
    }

    pub fn orders_for_party(&self, party: &str) -> Vec<OrderResponse> {
        self.read_model
            .orders_for_party(party)
            .iter()
            .map(OrderResponse::from)
            .collect()
    }

    pub fn order_book(&self, pair: &TradingPair) -> OrderBookView {
        self.read_model.order_book(pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{
        ActiveContract, LedgerCommand, LedgerUpdate, Offset, TransactionResult,
    };
    use crate::services::read_model::ReadModelConfig;
    use async_trait::async_trait;
    use dashmap::DashMap;
    use futures::stream::BoxStream;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
    use std::time::Duration;

    struct MockLedger {
        balances: DashMap<(String, String), Decimal>,
        cancelled: Mutex<Vec<String>>,
        withdrawn: Mutex<Vec<String>>,
        missing_contracts: Mutex<Vec<String>>,
        fail_create: Mutex<bool>,
        fail_balance_read: Mutex<bool>,
        create_counter: AtomicU64,
    }

    impl MockLedger {
        fn new() -> Self {
            Self {
                balances: DashMap::new(),
                cancelled: Mutex::new(Vec::new()),
                withdrawn: Mutex::new(Vec::new()),
                missing_contracts: Mutex::new(Vec::new()),
                fail_create: Mutex::new(false),
                fail_balance_read: Mutex::new(false),
                create_counter: AtomicU64::new(0),
            }
        }

        fn set_balance(&self, party: &str, asset: &str, amount: Decimal) {
            self.balances
                .insert((party.to_string(), asset.to_string()), amount);
        }
    }

    #[async_trait]
    impl LedgerApi for MockLedger {
        async fn submit_command(
            &self,
            _act_as: &[String],
            _read_as: &[String],
            command: LedgerCommand,
        ) -> Result<TransactionResult, LedgerError> {
            match command {
                LedgerCommand::Create {
                    template: TemplateId::Order,
                    payload,
                } => {
                    if *self.fail_create.lock() {
                        return Err(LedgerError::Transport("ledger down".into()));
                    }
                    let n = self.create_counter.fetch_add(1, AtomicOrdering::SeqCst);
                    Ok(TransactionResult {
                        transaction_id: format!("tx-{}", n),
                        created: vec![ActiveContract {
                            contract_id: format!("#order:{}", n),
                            template_id: TemplateId::Order,
                            payload,
                        }],
                        archived: Vec::new(),
                    })
                }
                LedgerCommand::Exercise {
                    contract_id,
                    choice,
                    ..
                } if choice == "CancelOrder" => {
                    if self
                        .missing_contracts
                        .lock()
                        .iter()
                        .any(|c| c == &contract_id)
                    {
                        return Err(LedgerError::ContractNotFound(contract_id));
                    }
                    self.cancelled.lock().push(contract_id);
                    Ok(TransactionResult::default())
                }
                other => panic!("unexpected command: {:?}", other),
            }
        }

        async fn query_active(
            &self,
            _party: &str,
            _templates: &[TemplateId],
            _page_size: usize,
        ) -> Result<Vec<ActiveContract>, LedgerError> {
            Ok(Vec::new())
        }

        async fn stream_active_at_offset(
            &self,
            _offset: &Offset,
            _templates: &[TemplateId],
        ) -> Result<BoxStream<'static, Result<ActiveContract, LedgerError>>, LedgerError> {
            Ok(futures::stream::empty().boxed())
        }

        async fn stream_updates(
            &self,
            _from_offset: &Offset,
            _templates: &[TemplateId],
        ) -> Result<BoxStream<'static, Result<LedgerUpdate, LedgerError>>, LedgerError> {
            Ok(futures::stream::pending().boxed())
        }

        async fn execute_allocation(
            &self,
            _allocation_ref: &str,
            _executor: &str,
            _owner_hint: &str,
        ) -> Result<TransactionResult, LedgerError> {
            Ok(TransactionResult::default())
        }

        async fn withdraw_allocation(
            &self,
            allocation_ref: &str,
            _owner: &str,
        ) -> Result<TransactionResult, LedgerError> {
            self.withdrawn.lock().push(allocation_ref.to_string());
            Ok(TransactionResult::default())
        }

        async fn get_ledger_end(&self) -> Result<Offset, LedgerError> {
            Ok(Offset("0000".into()))
        }

        async fn get_available_balance(
            &self,
            party: &str,
            asset: &str,
        ) -> Result<Decimal, LedgerError> {
            if *self.fail_balance_read.lock() {
                return Err(LedgerError::Transport("balance endpoint down".into()));
            }
            Ok(self
                .balances
                .get(&(party.to_string(), asset.to_string()))
                .map(|b| *b)
                .unwrap_or(dec!(1000000)))
        }
    }

    struct Harness {
        ledger: Arc<MockLedger>,
        read_model: Arc<ReadModel>,
        balances: Arc<BalanceReserver>,
        stop_loss: Arc<StopLossEngine>,
        events: Arc<EventHub>,
        service: OrderService,
    }

    async fn harness() -> Harness {
        let ledger = Arc::new(MockLedger::new());
        let read_model = Arc::new(ReadModel::new(
            ledger.clone(),
            "party::operator".into(),
            ReadModelConfig::default(),
        ));
        read_model.bootstrap().await.unwrap();
        let balances = Arc::new(BalanceReserver::new());
        let events = Arc::new(EventHub::new());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let cycles = CycleRequester::new(tx);
        let stop_loss = Arc::new(StopLossEngine::new(
            ledger.clone(),
            read_model.clone(),
            events.clone(),
            cycles.clone(),
            "party::operator".into(),
            Duration::from_secs(5),
        ));
        let service = OrderService::new(
            ledger.clone(),
            read_model.clone(),
            balances.clone(),
            stop_loss.clone(),
            events.clone(),
            cycles,
            OrderServiceConfig::new("party::operator", vec!["CC/CBTC".parse().unwrap()]),
        );
        Harness {
            ledger,
            read_model,
            balances,
            stop_loss,
            events,
            service,
        }
    }

    fn limit_buy(quantity: Decimal, price: Decimal) -> PlaceOrderRequest {
        PlaceOrderRequest {
            party_id: "party::alice".into(),
            pair: "CC/CBTC".parse().unwrap(),
            side: OrderSide::Buy,
            mode: OrderMode::Limit,
            quantity,
            price: Some(price),
            stop_price: None,
            allocation_ref: Some("#alloc:a".into()),
        }
    }

    #[tokio::test]
    async fn test_place_limit_buy_reserves_quote() {
        let h = harness().await;
        let response = h.service.place(limit_buy(dec!(1.0), dec!(100))).await.unwrap();

        assert_eq!(response.status, OrderStatus::Open);
        assert_eq!(h.balances.reserved("party::alice", "CBTC"), dec!(100));
        assert!(h
            .read_model
            .order_by_order_id(response.order_id)
            .is_some());
    }

    #[tokio::test]
    async fn test_place_sell_reserves_base() {
        let h = harness().await;
        let request = PlaceOrderRequest {
            side: OrderSide::Sell,
            ..limit_buy(dec!(2.5), dec!(100))
        };
        h.service.place(request).await.unwrap();
        assert_eq!(h.balances.reserved("party::alice", "CC"), dec!(2.5));
        assert_eq!(h.balances.reserved("party::alice", "CBTC"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_market_buy_without_liquidity_rejected() {
        let h = harness().await;
        let request = PlaceOrderRequest {
            mode: OrderMode::Market,
            price: None,
            ..limit_buy(dec!(1), dec!(0))
        };
        let result = h.service.place(request).await;
        assert!(matches!(result, Err(OrderError::NoLiquidity)));
        assert_eq!(h.balances.reserved("party::alice", "CBTC"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_market_sell_without_bids_rejected() {
        let h = harness().await;
        let request = PlaceOrderRequest {
            side: OrderSide::Sell,
            mode: OrderMode::Market,
            price: None,
            ..limit_buy(dec!(1), dec!(0))
        };
        assert!(matches!(
            h.service.place(request).await,
            Err(OrderError::NoLiquidity)
        ));
        assert_eq!(h.balances.reserved("party::alice", "CC"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_market_buy_reserves_with_slippage_buffer() {
        let h = harness().await;
        // Seed an ask at 100 so the market buy has an estimated price
        let ask = Order {
            order_id: Uuid::new_v4(),
            contract_id: "#ask:0".into(),
            owner: "party::bob".into(),
            pair: "CC/CBTC".parse().unwrap(),
            side: OrderSide::Sell,
            mode: OrderMode::Limit,
            price: Some(dec!(100)),
            stop_price: None,
            quantity: dec!(5),
            filled: Decimal::ZERO,
            status: OrderStatus::Open,
            timestamp: Utc::now(),
            allocation_ref: None,
            triggered_at: None,
        };
        h.read_model.insert_order(ask);

        let request = PlaceOrderRequest {
            mode: OrderMode::Market,
            price: None,
            ..limit_buy(dec!(2), dec!(0))
        };
        h.service.place(request).await.unwrap();
        // 2 x 100 x 1.05
        assert_eq!(h.balances.reserved("party::alice", "CBTC"), dec!(210.00));
    }

    #[tokio::test]
    async fn test_validation_failures() {
        let h = harness().await;

        let unknown_pair = PlaceOrderRequest {
            pair: "XX/YY".parse().unwrap(),
            ..limit_buy(dec!(1), dec!(100))
        };
        assert!(matches!(
            h.service.place(unknown_pair).await,
            Err(OrderError::Validation(_))
        ));

        let zero_qty = limit_buy(dec!(0), dec!(100));
        assert!(matches!(
            h.service.place(zero_qty).await,
            Err(OrderError::Validation(_))
        ));

        let no_price = PlaceOrderRequest {
            price: None,
            ..limit_buy(dec!(1), dec!(100))
        };
        assert!(matches!(
            h.service.place(no_price).await,
            Err(OrderError::Validation(_))
        ));

        let market_with_price = PlaceOrderRequest {
            mode: OrderMode::Market,
            ..limit_buy(dec!(1), dec!(100))
        };
        assert!(matches!(
            h.service.place(market_with_price).await,
            Err(OrderError::Validation(_))
        ));

        let stop_without_trigger = PlaceOrderRequest {
            mode: OrderMode::StopLoss,
            price: None,
            stop_price: None,
            ..limit_buy(dec!(1), dec!(100))
        };
        assert!(matches!(
            h.service.place(stop_without_trigger).await,
            Err(OrderError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_insufficient_effective_balance_rejected() {
        let h = harness().await;
        h.ledger.set_balance("party::alice", "CBTC", dec!(150));

        // First order consumes 100 of the 150
        h.service.place(limit_buy(dec!(1), dec!(100))).await.unwrap();
        // Second order needs 100 but only 50 is effectively free
        let result = h.service.place(limit_buy(dec!(1), dec!(100))).await;
        assert!(matches!(
            result,
            Err(OrderError::InsufficientBalance { .. })
        ));
        assert_eq!(h.balances.reserved("party::alice", "CBTC"), dec!(100));
    }

    #[tokio::test]
    async fn test_balance_read_failure_does_not_block() {
        let h = harness().await;
        *h.ledger.fail_balance_read.lock() = true;
        let response = h.service.place(limit_buy(dec!(1), dec!(100))).await;
        assert!(response.is_ok());
    }

    #[tokio::test]
    async fn test_create_failure_releases_reservation() {
        let h = harness().await;
        *h.ledger.fail_create.lock() = true;
        let result = h.service.place(limit_buy(dec!(1), dec!(100))).await;
        assert!(matches!(result, Err(OrderError::Ledger(_))));
        assert_eq!(h.balances.reserved("party::alice", "CBTC"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_place_then_cancel_round_trips_reservation() {
        let h = harness().await;
        let pair: TradingPair = "CC/CBTC".parse().unwrap();
        let mut book_rx = h
            .events
            .subscribe(&crate::events::topics::orderbook(&pair));

        let placed = h.service.place(limit_buy(dec!(1), dec!(100))).await.unwrap();
        assert_eq!(h.balances.reserved("party::alice", "CBTC"), dec!(100));
        assert!(matches!(
            book_rx.recv().await,
            Ok(EventMessage::NewOrder { .. })
        ));

        let cancelled = h
            .service
            .cancel(&placed.order_id.to_string(), "party::alice")
            .await
            .unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(h.balances.reserved("party::alice", "CBTC"), Decimal::ZERO);
        assert!(h.read_model.order_by_order_id(placed.order_id).is_none());
        assert!(matches!(
            book_rx.recv().await,
            Ok(EventMessage::OrderCancelled { .. })
        ));
        // The pre-locked allocation went back to the owner
        assert_eq!(h.ledger.withdrawn.lock().clone(), vec!["#alloc:a".to_string()]);
    }

    #[tokio::test]
    async fn test_double_cancel_is_noop_on_reservations() {
        let h = harness().await;
        let placed = h.service.place(limit_buy(dec!(1), dec!(100))).await.unwrap();
        h.service
            .cancel(&placed.order_id.to_string(), "party::alice")
            .await
            .unwrap();

        let second = h
            .service
            .cancel(&placed.order_id.to_string(), "party::alice")
            .await;
        assert!(matches!(second, Err(OrderError::NotFound)));
        assert_eq!(h.balances.reserved("party::alice", "CBTC"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_cancel_by_wrong_party_rejected() {
        let h = harness().await;
        let placed = h.service.place(limit_buy(dec!(1), dec!(100))).await.unwrap();
        let result = h
            .service
            .cancel(&placed.order_id.to_string(), "party::mallory")
            .await;
        assert!(matches!(result, Err(OrderError::NotOwner)));
        assert_eq!(h.balances.reserved("party::alice", "CBTC"), dec!(100));
    }

    #[tokio::test]
    async fn test_cancel_contract_not_found_is_success() {
        let h = harness().await;
        let placed = h.service.place(limit_buy(dec!(1), dec!(100))).await.unwrap();
        h.ledger
            .missing_contracts
            .lock()
            .push(placed.contract_id.clone());

        let cancelled = h
            .service
            .cancel(&placed.order_id.to_string(), "party::alice")
            .await
            .unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(h.balances.reserved("party::alice", "CBTC"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_stop_loss_registers_and_stays_off_book() {
        let h = harness().await;
        let request = PlaceOrderRequest {
            party_id: "party::alice".into(),
            pair: "CC/CBTC".parse().unwrap(),
            side: OrderSide::Sell,
            mode: OrderMode::StopLoss,
            quantity: dec!(1),
            price: None,
            stop_price: Some(dec!(48)),
            allocation_ref: Some("#alloc:stop".into()),
        };
        let placed = h.service.place(request).await.unwrap();

        assert_eq!(placed.status, OrderStatus::PendingTrigger);
        assert_eq!(h.stop_loss.pending_count(), 1);
        // Invisible to the matching view until promoted
        let pair: TradingPair = "CC/CBTC".parse().unwrap();
        assert!(h.read_model.open_orders_for_pair(&pair).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stop_loss_unregisters() {
        let h = harness().await;
        let request = PlaceOrderRequest {
            party_id: "party::alice".into(),
            pair: "CC/CBTC".parse().unwrap(),
            side: OrderSide::Sell,
            mode: OrderMode::StopLoss,
            quantity: dec!(1),
            price: None,
            stop_price: Some(dec!(48)),
            allocation_ref: None,
        };
        let placed = h.service.place(request).await.unwrap();
        assert_eq!(h.stop_loss.pending_count(), 1);

        h.service
            .cancel(&placed.order_id.to_string(), "party::alice")
            .await
            .unwrap();
        assert_eq!(h.stop_loss.pending_count(), 0);
    }
}
