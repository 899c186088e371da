//! Matching Engine
//!
//! Periodically (and on demand) pairs crossing orders per trading pair under
//! price-time priority and hands each match to Settlement. Exactly one cycle
//! runs at a time across the whole process; contract ids change with every
//! ledger mutation, and the single-cycle rule removes write-write races on
//! them. HTTP and WebSocket handlers never match themselves; they enqueue
//! work through [`CycleRequester`].

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::book;
use super::types::{CycleOutcome, MatchingError};
use crate::models::{OrderSide, TradingPair};
use crate::services::read_model::{sort_asks, sort_bids, ReadModel};
use crate::services::settlement::Settlement;

#[derive(Debug, Clone)]
pub struct MatchingConfig {
    pub pairs: Vec<TradingPair>,
    /// Cycle interval while the book is active
    pub base_interval: Duration,
    /// After `medium_idle_threshold` idle cycles
    pub medium_idle_interval: Duration,
    /// After `slow_idle_threshold` idle cycles
    pub slow_idle_interval: Duration,
    pub medium_idle_threshold: u32,
    pub slow_idle_threshold: u32,
    /// A cycle guard held longer than this is considered stuck and is
    /// forcibly released
    pub watchdog: Duration,
    /// TTL of the self-rematch guard on a (buy, sell) contract pair
    pub rematch_cooldown: Duration,
    /// Minimum spacing between externally-triggered cycles
    pub trigger_throttle: Duration,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            pairs: Vec::new(),
            base_interval: Duration::from_secs(2),
            medium_idle_interval: Duration::from_secs(10),
            slow_idle_interval: Duration::from_secs(30),
            medium_idle_threshold: 5,
            slow_idle_threshold: 20,
            watchdog: Duration::from_secs(25),
            rematch_cooldown: Duration::from_secs(30),
            trigger_throttle: Duration::from_secs(2),
        }
    }
}

pub struct MatchingEngine {
    config: MatchingConfig,
    read_model: Arc<ReadModel>,
    settlement: Arc<Settlement>,

    /// Holds the acquisition instant of the active cycle
    in_progress: Mutex<Option<Instant>>,
    /// (buy contract id, sell contract id) pairs recently handed to
    /// settlement; suppressed until the cooldown expires
    recently_matched: DashMap<(String, String), Instant>,
    /// Targets that arrived while a cycle was busy
    pending_pairs: Mutex<HashSet<TradingPair>>,

    poll_interval_ms: AtomicU64,
    idle_cycles: AtomicU32,
    last_trigger: Mutex<Instant>,

    /// On-demand targets from [`CycleRequester`] holders; consumed by
    /// [`MatchingEngine::run_loop`]
    requests_rx: Mutex<Option<mpsc::UnboundedReceiver<TradingPair>>>,
}

impl MatchingEngine {
    pub fn new(
        config: MatchingConfig,
        read_model: Arc<ReadModel>,
        settlement: Arc<Settlement>,
        requests: mpsc::UnboundedReceiver<TradingPair>,
    ) -> Self {
        let base_ms = config.base_interval.as_millis() as u64;
        Self {
            config,
            read_model,
            settlement,
            in_progress: Mutex::new(None),
            recently_matched: DashMap::new(),
            pending_pairs: Mutex::new(HashSet::new()),
            poll_interval_ms: AtomicU64::new(base_ms),
            idle_cycles: AtomicU32::new(0),
            last_trigger: Mutex::new(Instant::now() - Duration::from_secs(3600)),
            requests_rx: Mutex::new(Some(requests)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.load(Ordering::Relaxed))
    }

    pub fn idle_cycles(&self) -> u32 {
        self.idle_cycles.load(Ordering::Relaxed)
    }

    // ==================== Cycle guard ====================

    /// Acquire the single-cycle guard. A guard held past the watchdog is
    /// considered stuck (a wedged ledger call) and is taken over.
    fn try_acquire(&self) -> bool {
        let mut slot = self.in_progress.lock();
        match *slot {
            Some(started) if started.elapsed() < self.config.watchdog => false,
            Some(started) => {
                warn!(
                    "Cycle guard stuck for {:?}; forcing release",
                    started.elapsed()
                );
                *slot = Some(Instant::now());
                true
            }
            None => {
                *slot = Some(Instant::now());
                true
            }
        }
    }

    fn release(&self) {
        *self.in_progress.lock() = None;
    }

    fn is_busy(&self) -> bool {
        self.in_progress
            .lock()
            .map(|started| started.elapsed() < self.config.watchdog)
            .unwrap_or(false)
    }

    // ==================== Cycle execution ====================

    /// Run one matching cycle over `target` (or every configured pair).
    /// When a cycle is already active, a target is queued for the drain
    /// phase and `CycleBusy` is returned.
    pub async fn run_cycle(
        &self,
        target: Option<&TradingPair>,
    ) -> Result<CycleOutcome, MatchingError> {
        if let Some(pair) = target {
            if !self.config.pairs.contains(pair) {
                return Err(MatchingError::UnknownPair(pair.symbol()));
            }
        }

        if !self.try_acquire() {
            if let Some(pair) = target {
                self.pending_pairs.lock().insert(pair.clone());
                debug!("Cycle busy; queued {}", pair);
            }
            return Err(MatchingError::CycleBusy);
        }

        let started = Instant::now();
        let pairs: Vec<TradingPair> = match target {
            Some(pair) => vec![pair.clone()],
            None => self.config.pairs.clone(),
        };

        let mut outcome = CycleOutcome::default();
        for pair in &pairs {
            outcome.pairs_scanned += 1;
            match self.match_pair(pair).await {
                Ok(true) => outcome.matches_settled += 1,
                Ok(false) => {}
                Err(e) => {
                    // Contract ids may have changed under us; give this pair
                    // up for the cycle and move on
                    error!("Matching failed for {}: {}", pair, e);
                }
            }
        }

        self.release();

        // Drain targets queued while the cycle was busy, each once
        let queued: Vec<TradingPair> = self.pending_pairs.lock().drain().collect();
        for pair in queued {
            if !self.try_acquire() {
                break;
            }
            match self.match_pair(&pair).await {
                Ok(true) => outcome.matches_settled += 1,
                Ok(false) => {}
                Err(e) => error!("Matching failed for queued {}: {}", pair, e),
            }
            self.release();
        }

        self.note_cycle_outcome(&outcome);
        crate::metrics::record_match_cycle(started.elapsed().as_secs_f64(), outcome.matched());
        debug!(
            "Cycle complete: {} pairs scanned, {} matched in {:?}",
            outcome.pairs_scanned,
            outcome.matches_settled,
            started.elapsed()
        );
        Ok(outcome)
    }

    /// Scan one pair's book and settle the best crossing candidate, if any.
    /// At most one match per pair per cycle.
    async fn match_pair(&self, pair: &TradingPair) -> Result<bool, MatchingError> {
        self.purge_expired_rematch();

        let orders = self.read_model.open_orders_for_pair_live(pair).await?;
        if orders.is_empty() {
            return Ok(false);
        }

        let (mut buys, mut sells): (Vec<_>, Vec<_>) = orders
            .into_iter()
            .partition(|o| matches!(o.side, OrderSide::Buy));
        sort_bids(&mut buys);
        sort_asks(&mut sells);

        let last_trade = self.read_model.last_trade_price(pair);
        let candidate = book::select_match(
            &buys,
            &sells,
            |buy_cid, sell_cid| {
                self.recently_matched
                    .contains_key(&(buy_cid.to_string(), sell_cid.to_string()))
            },
            last_trade,
        );

        let candidate = match candidate {
            Some(candidate) => candidate,
            None => return Ok(false),
        };

        debug!(
            "Match on {}: {} @ {} ({} x {})",
            pair,
            candidate.quantity,
            candidate.price,
            candidate.buy.contract_id,
            candidate.sell.contract_id
        );
        // Suppress this contract pair for the cooldown regardless of the
        // settlement outcome; retrying a failed pair immediately would just
        // repeat the failure
        self.recently_matched.insert(
            (
                candidate.buy.contract_id.clone(),
                candidate.sell.contract_id.clone(),
            ),
            Instant::now(),
        );

        match self.settlement.settle(candidate).await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Settlement failed on {}: {}", pair, e);
                Ok(false)
            }
        }
    }

    fn purge_expired_rematch(&self) {
        let cooldown = self.config.rematch_cooldown;
        self.recently_matched
            .retain(|_, marked| marked.elapsed() < cooldown);
    }

    // ==================== Adaptive polling ====================

    fn reset_poll(&self) {
        self.idle_cycles.store(0, Ordering::Relaxed);
        let base = self.config.base_interval.as_millis() as u64;
        self.poll_interval_ms.store(base, Ordering::Relaxed);
        crate::metrics::record_poll_interval(base);
    }

    fn note_cycle_outcome(&self, outcome: &CycleOutcome) {
        if outcome.matched() {
            self.reset_poll();
            return;
        }
        let idle = self.idle_cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let interval = if idle >= self.config.slow_idle_threshold {
            self.config.slow_idle_interval
        } else if idle >= self.config.medium_idle_threshold {
            self.config.medium_idle_interval
        } else {
            self.config.base_interval
        };
        let ms = interval.as_millis() as u64;
        self.poll_interval_ms.store(ms, Ordering::Relaxed);
        crate::metrics::record_poll_interval(ms);
    }

    // ==================== Scheduling loop ====================

    /// Drive the engine until shutdown: periodic cycles at the adaptive
    /// interval, plus on-demand targeted cycles from the request channel.
    /// External triggers reset the poll interval to base and are throttled
    /// to one trigger-driven cycle per `trigger_throttle`; excess targets
    /// are coalesced into `pending_pairs`.
    pub async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut requests = match self.requests_rx.lock().take() {
            Some(rx) => rx,
            None => {
                error!("Matching loop started twice; refusing to run");
                return;
            }
        };
        info!(
            "Matching loop started for {} pairs (base interval {:?})",
            self.config.pairs.len(),
            self.config.base_interval
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.poll_interval()) => {
                    if let Err(e) = self.run_cycle(None).await {
                        debug!("Scheduled cycle skipped: {}", e);
                    }
                }
                request = requests.recv() => {
                    let Some(first) = request else { break };
                    let mut targets = HashSet::new();
                    targets.insert(first);
                    while let Ok(pair) = requests.try_recv() {
                        targets.insert(pair);
                    }

                    self.reset_poll();
                    let throttled = self.last_trigger.lock().elapsed()
                        < self.config.trigger_throttle;
                    if throttled || self.is_busy() {
                        // Coalesced; the next cycle (at base interval) or
                        // the active cycle's drain phase picks these up
                        self.pending_pairs.lock().extend(targets);
                    } else {
                        *self.last_trigger.lock() = Instant::now();
                        for pair in targets {
                            if let Err(e) = self.run_cycle(Some(&pair)).await {
                                debug!("Triggered cycle for {} skipped: {}", pair, e);
                            }
                        }
                    }
                }
            }
        }
        info!("Matching loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{RecentTradeCache, TradeCacheConfig};
    use crate::events::EventHub;
    use crate::ledger::{
        ActiveContract, LedgerApi, LedgerCommand, LedgerError, LedgerUpdate, Offset, TemplateId,
        TransactionResult, codec,
    };
    use super::super::types::CycleRequester;
    use crate::models::{Order, OrderMode, OrderStatus};
    use crate::services::balances::BalanceReserver;
    use crate::services::read_model::ReadModelConfig;
    use crate::services::settlement::SettlementConfig;
    use crate::services::stop_loss::StopLossEngine;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use futures::stream::BoxStream;
    use futures::StreamExt;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicU64;
    use uuid::Uuid;

    /// Permissive ledger: every fill succeeds and re-creates the order,
    /// every allocation executes
    struct HappyLedger {
        orders: dashmap::DashMap<String, Order>,
        settled: AtomicU64,
        fill_counter: AtomicU64,
    }

    impl HappyLedger {
        fn new() -> Self {
            Self {
                orders: dashmap::DashMap::new(),
                settled: AtomicU64::new(0),
                fill_counter: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl LedgerApi for HappyLedger {
        async fn submit_command(
            &self,
            _act_as: &[String],
            _read_as: &[String],
            command: LedgerCommand,
        ) -> Result<TransactionResult, LedgerError> {
            match command {
                LedgerCommand::Exercise {
                    contract_id,
                    choice,
                    argument,
                    ..
                } if choice == "FillOrder" => {
                    let quantity: Decimal =
                        argument["fillQuantity"].as_str().unwrap().parse().unwrap();
                    let (_, mut order) = self
                        .orders
                        .remove(&contract_id)
                        .ok_or(LedgerError::ContractNotFound(contract_id))?;
                    order.filled += quantity;
                    order.status = if order.is_fully_filled() {
                        OrderStatus::Filled
                    } else {
                        OrderStatus::PartiallyFilled
                    };
                    let created = if order.status == OrderStatus::Filled {
                        Vec::new()
                    } else {
                        let n = self.fill_counter.fetch_add(1, Ordering::SeqCst);
                        order.contract_id = format!("{}:f{}", order.contract_id, n);
                        self.orders
                            .insert(order.contract_id.clone(), order.clone());
                        let payload = match codec::order_create_command(&order, "op") {
                            LedgerCommand::Create { payload, .. } => payload,
                            _ => unreachable!(),
                        };
                        vec![ActiveContract {
                            contract_id: order.contract_id.clone(),
                            template_id: TemplateId::Order,
                            payload,
                        }]
                    };
                    Ok(TransactionResult {
                        transaction_id: "tx".into(),
                        created,
                        archived: Vec::new(),
                    })
                }
                LedgerCommand::Create {
                    template: TemplateId::Trade,
                    payload,
                } => {
                    self.settled.fetch_add(1, Ordering::SeqCst);
                    Ok(TransactionResult {
                        transaction_id: "tx".into(),
                        created: vec![ActiveContract {
                            contract_id: format!(
                                "#trade:{}",
                                self.settled.load(Ordering::SeqCst)
                            ),
                            template_id: TemplateId::Trade,
                            payload,
                        }],
                        archived: Vec::new(),
                    })
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
            _allocation_ref: &str,
            _owner: &str,
        ) -> Result<TransactionResult, LedgerError> {
            Ok(TransactionResult::default())
        }

        async fn get_ledger_end(&self) -> Result<Offset, LedgerError> {
            Ok(Offset("0000".into()))
        }

        async fn get_available_balance(
            &self,
            _party: &str,
            _asset: &str,
        ) -> Result<Decimal, LedgerError> {
            Ok(dec!(1000000))
        }
    }

    struct Harness {
        ledger: Arc<HappyLedger>,
        read_model: Arc<ReadModel>,
        engine: MatchingEngine,
    }

    async fn harness(pairs: Vec<TradingPair>) -> Harness {
        let ledger = Arc::new(HappyLedger::new());
        let read_model = Arc::new(ReadModel::new(
            ledger.clone(),
            "party::operator".into(),
            ReadModelConfig::default(),
        ));
        // Mark ready so queries stay on the in-memory path
        read_model.bootstrap().await.unwrap();
        let events = Arc::new(EventHub::new());
        let balances = Arc::new(BalanceReserver::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let stop_loss = Arc::new(StopLossEngine::new(
            ledger.clone(),
            read_model.clone(),
            events.clone(),
            CycleRequester::new(tx),
            "party::operator".into(),
            Duration::from_secs(5),
        ));
        let cache_dir = std::env::temp_dir().join(format!("engine-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&cache_dir).unwrap();
        let trade_cache = Arc::new(RecentTradeCache::load(TradeCacheConfig {
            path: cache_dir.join("trades.json"),
            ..Default::default()
        }));
        let settlement = Arc::new(Settlement::new(
            ledger.clone(),
            read_model.clone(),
            balances,
            stop_loss,
            events,
            trade_cache,
            SettlementConfig::new("party::operator"),
        ));
        let engine = MatchingEngine::new(
            MatchingConfig {
                pairs,
                ..Default::default()
            },
            read_model.clone(),
            settlement,
            rx,
        );
        Harness {
            ledger,
            read_model,
            engine,
        }
    }

    fn seed_order(
        h: &Harness,
        cid: &str,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
        age_secs: i64,
    ) -> Order {
        let order = Order {
            order_id: Uuid::new_v4(),
            contract_id: cid.to_string(),
            owner: format!("party::{}", cid),
            pair: "CC/CBTC".parse().unwrap(),
            side,
            mode: OrderMode::Limit,
            price: Some(price),
            stop_price: None,
            quantity,
            filled: Decimal::ZERO,
            status: OrderStatus::Open,
            timestamp: Utc::now() - ChronoDuration::seconds(age_secs),
            allocation_ref: Some(format!("#alloc:{}", cid)),
            triggered_at: None,
        };
        h.ledger.orders.insert(cid.to_string(), order.clone());
        h.read_model.insert_order(order.clone());
        order
    }

    fn pair() -> TradingPair {
        "CC/CBTC".parse().unwrap()
    }

    #[tokio::test]
    async fn test_one_match_per_pair_per_cycle() {
        let h = harness(vec![pair()]).await;
        seed_order(&h, "#b1", OrderSide::Buy, dec!(50), dec!(1), 10);
        seed_order(&h, "#b2", OrderSide::Buy, dec!(50), dec!(1), 5);
        seed_order(&h, "#s1", OrderSide::Sell, dec!(50), dec!(1), 10);
        seed_order(&h, "#s2", OrderSide::Sell, dec!(50), dec!(1), 5);

        let outcome = h.engine.run_cycle(None).await.unwrap();
        assert_eq!(outcome.matches_settled, 1);
        assert_eq!(h.ledger.settled.load(Ordering::SeqCst), 1);

        // The next cycle settles the second crossing pair
        let outcome = h.engine.run_cycle(None).await.unwrap();
        assert_eq!(outcome.matches_settled, 1);
        assert_eq!(h.ledger.settled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_price_time_priority_fills_older_sell() {
        let h = harness(vec![pair()]).await;
        seed_order(&h, "#b", OrderSide::Buy, dec!(50), dec!(1), 0);
        let old_sell = seed_order(&h, "#s-old", OrderSide::Sell, dec!(50), dec!(1), 60);
        let new_sell = seed_order(&h, "#s-new", OrderSide::Sell, dec!(50), dec!(1), 1);

        h.engine.run_cycle(None).await.unwrap();

        // The older sell matched and is gone; the newer one is still open
        assert!(h.read_model.order_by_order_id(old_sell.order_id).is_none());
        let survivor = h.read_model.order_by_order_id(new_sell.order_id).unwrap();
        assert_eq!(survivor.status, OrderStatus::Open);
    }

    #[tokio::test]
    async fn test_no_cross_no_match() {
        let h = harness(vec![pair()]).await;
        seed_order(&h, "#b", OrderSide::Buy, dec!(49), dec!(1), 0);
        seed_order(&h, "#s", OrderSide::Sell, dec!(50), dec!(1), 0);

        let outcome = h.engine.run_cycle(None).await.unwrap();
        assert_eq!(outcome.matches_settled, 0);
        assert_eq!(h.ledger.settled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_busy_guard_queues_target() {
        let h = harness(vec![pair()]).await;
        assert!(h.engine.try_acquire());

        let result = h.engine.run_cycle(Some(&pair())).await;
        assert!(matches!(result, Err(MatchingError::CycleBusy)));
        assert!(h.engine.pending_pairs.lock().contains(&pair()));

        h.engine.release();
    }

    #[tokio::test]
    async fn test_watchdog_takes_over_stuck_guard() {
        let h = harness(vec![pair()]).await;
        // Simulate a guard stuck past the watchdog
        *h.engine.in_progress.lock() =
            Some(Instant::now() - h.engine.config.watchdog - Duration::from_secs(1));

        assert!(h.engine.try_acquire());
        h.engine.release();
    }

    #[tokio::test]
    async fn test_unknown_pair_rejected() {
        let h = harness(vec![pair()]).await;
        let unknown: TradingPair = "XX/YY".parse().unwrap();
        assert!(matches!(
            h.engine.run_cycle(Some(&unknown)).await,
            Err(MatchingError::UnknownPair(_))
        ));
    }

    #[tokio::test]
    async fn test_adaptive_polling_backs_off_and_resets() {
        let h = harness(vec![pair()]).await;
        assert_eq!(h.engine.poll_interval(), Duration::from_secs(2));

        // Idle cycles escalate the interval at the thresholds
        for _ in 0..h.engine.config.medium_idle_threshold {
            h.engine.run_cycle(None).await.unwrap();
        }
        assert_eq!(h.engine.poll_interval(), Duration::from_secs(10));

        for _ in 0..(h.engine.config.slow_idle_threshold - h.engine.config.medium_idle_threshold) {
            h.engine.run_cycle(None).await.unwrap();
        }
        assert_eq!(h.engine.poll_interval(), Duration::from_secs(30));

        // A match resets to base
        seed_order(&h, "#b", OrderSide::Buy, dec!(50), dec!(1), 0);
        seed_order(&h, "#s", OrderSide::Sell, dec!(50), dec!(1), 0);
        h.engine.run_cycle(None).await.unwrap();
        assert_eq!(h.engine.poll_interval(), Duration::from_secs(2));
        assert_eq!(h.engine.idle_cycles(), 0);
    }

    #[tokio::test]
    async fn test_rematch_guard_suppresses_and_expires() {
        let h = harness(vec![pair()]).await;
        h.engine.recently_matched.insert(
            ("#b".to_string(), "#s".to_string()),
            Instant::now() - Duration::from_secs(60),
        );
        h.engine
            .recently_matched
            .insert(("#b2".to_string(), "#s2".to_string()), Instant::now());

        h.engine.purge_expired_rematch();
        assert!(!h
            .engine
            .recently_matched
            .contains_key(&("#b".to_string(), "#s".to_string())));
        assert!(h
            .engine
            .recently_matched
            .contains_key(&("#b2".to_string(), "#s2".to_string())));
    }
}
