//! Position State Machine
//!
//! Per-account session tracking:
//! - NO_SESSION → HOLDING_ASSET via BUY (session auto-starts)
//! - HOLDING_ASSET ⇄ HOLDING_CASH via SELL / BUY
//! - explicit `end_session` → NO_SESSION
//!
//! Validity check, sizing, execution and the state transition run as one
//! unit per account. Nothing is mutated unless the order was filled.

pub mod accountant;

pub use accountant::{pair_trades, summarize, Pairing, PerformanceSummary, TradePair};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{AccountSettings, TradeMode};
use crate::error::{EngineError, EngineResult};
use crate::execution::{OrderExecutor, OrderRequest};
use crate::types::{AccountBalances, AccountId, TradeAction};

/// Price move (percent) a round trip must exceed to cover fees on both legs
pub fn break_even_move_percent(fee_rate: f64) -> f64 {
    2.0 * fee_rate * 100.0
}

/// What the account currently holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    #[default]
    NoSession,
    HoldingAsset,
    HoldingCash,
}

impl PositionState {
    /// BUY from NO_SESSION or HOLDING_CASH, SELL only from HOLDING_ASSET
    pub fn allows(&self, action: TradeAction) -> bool {
        matches!(
            (self, action),
            (PositionState::NoSession, TradeAction::Buy)
                | (PositionState::HoldingCash, TradeAction::Buy)
                | (PositionState::HoldingAsset, TradeAction::Sell)
        )
    }

    /// State after a filled trade
    pub fn after(action: TradeAction) -> Self {
        match action {
            TradeAction::Buy => PositionState::HoldingAsset,
            TradeAction::Sell => PositionState::HoldingCash,
        }
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionState::NoSession => write!(f, "NO_SESSION"),
            PositionState::HoldingAsset => write!(f, "HOLDING_ASSET"),
            PositionState::HoldingCash => write!(f, "HOLDING_CASH"),
        }
    }
}

/// Session state for one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountPositionState {
    pub current_position: PositionState,
    pub session_id: Uuid,
    /// Asset quantity both legs of the session trade
    pub session_amount: f64,
    /// Portfolio value at session start, P/L baseline
    pub initial_value: f64,
    pub trade_count: u32,
    pub started_at: DateTime<Utc>,
}

/// One executed trade; never mutated after creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub action: TradeAction,
    pub quantity: f64,
    pub unit_price: f64,
    pub total_value: f64,
    pub fee_amount: f64,
    /// 0-100
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
    /// Per-account sequence, starting at 1
    pub sequence: u64,
}

/// A trade the gate wants placed
#[derive(Debug, Clone, PartialEq)]
pub struct TradeIntent {
    pub action: TradeAction,
    /// Reference price the trade is sized at
    pub price: f64,
    pub confidence: f64,
    /// Overrides the configured percentage when no session quantity exists
    pub size_percent: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Result of one attempted trade
#[derive(Debug, Clone, PartialEq)]
pub enum TradeOutcome {
    Executed(TradeRecord),
    /// Refused before any order was sent
    Rejected { reason: String },
    /// Sent (or attempted) but not filled; state untouched
    ExecutionFailed { reason: String },
}

impl TradeOutcome {
    pub fn is_executed(&self) -> bool {
        matches!(self, TradeOutcome::Executed(_))
    }
}

/// Summary handed back when a session is closed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub trade_count: u32,
    pub initial_value: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub final_position: PositionState,
    pub pairs: Vec<TradePair>,
    pub performance: PerformanceSummary,
}

// ─────────────────────────────────────────────────────────────────────────────
// Keyed store
// ─────────────────────────────────────────────────────────────────────────────

/// Account id → session state
pub trait PositionStore: Send + Sync {
    fn get(&self, account: &AccountId) -> Option<AccountPositionState>;
    fn put(&self, account: &AccountId, state: AccountPositionState);
    fn remove(&self, account: &AccountId) -> Option<AccountPositionState>;
}

#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    states: RwLock<HashMap<AccountId, AccountPositionState>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PositionStore for MemoryPositionStore {
    fn get(&self, account: &AccountId) -> Option<AccountPositionState> {
        self.states.read().ok()?.get(account).cloned()
    }

    fn put(&self, account: &AccountId, state: AccountPositionState) {
        if let Ok(mut states) = self.states.write() {
            states.insert(account.clone(), state);
        }
    }

    fn remove(&self, account: &AccountId) -> Option<AccountPositionState> {
        self.states.write().ok()?.remove(account)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Validates, sizes, executes and records trades
pub struct PositionManager {
    store: Arc<dyn PositionStore>,
    executor: Arc<dyn OrderExecutor>,
    ledger: RwLock<HashMap<AccountId, Vec<TradeRecord>>>,
    in_flight: Mutex<HashMap<AccountId, Arc<AsyncMutex<()>>>>,
    execution_timeout: Duration,
}

impl PositionManager {
    pub fn new(
        store: Arc<dyn PositionStore>,
        executor: Arc<dyn OrderExecutor>,
        execution_timeout: Duration,
    ) -> Self {
        Self {
            store,
            executor,
            ledger: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            execution_timeout,
        }
    }

    fn account_lock(&self, account: &AccountId) -> EngineResult<Arc<AsyncMutex<()>>> {
        let mut locks = self.in_flight.lock().map_err(|_| {
            EngineError::InvariantViolation("position lock table poisoned".to_string())
        })?;
        Ok(locks
            .entry(account.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone())
    }

    pub fn state(&self, account: &AccountId) -> Option<AccountPositionState> {
        self.store.get(account)
    }

    pub fn position(&self, account: &AccountId) -> PositionState {
        self.store
            .get(account)
            .map(|s| s.current_position)
            .unwrap_or_default()
    }

    /// Executed trades for the account, in execution order
    pub fn trades(&self, account: &AccountId) -> Vec<TradeRecord> {
        self.ledger
            .read()
            .ok()
            .and_then(|l| l.get(account).cloned())
            .unwrap_or_default()
    }

    pub fn performance(&self, account: &AccountId, fee_rate: f64) -> EngineResult<PerformanceSummary> {
        summarize(&self.trades(account), fee_rate)
    }

    pub async fn balances(&self, account: &AccountId) -> EngineResult<AccountBalances> {
        self.executor.balances(account).await
    }

    /// Validate → size → check → execute → transition, atomically per account.
    /// A second trade for an account with one in flight is rejected.
    pub async fn execute_trade(
        &self,
        account: &AccountId,
        settings: &AccountSettings,
        intent: TradeIntent,
    ) -> EngineResult<TradeOutcome> {
        let lock = self.account_lock(account)?;
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!(account = %account, "⏳ Trade already in flight, rejecting");
                return Ok(reject("another trade is in flight for this account"));
            }
        };

        let state = self.store.get(account);
        let position = state
            .as_ref()
            .map(|s| s.current_position)
            .unwrap_or_default();

        if !position.allows(intent.action) {
            warn!(
                account = %account,
                action = %intent.action,
                position = %position,
                "🚫 Illegal trade for current position"
            );
            return Ok(reject(format!("{} not allowed while {}", intent.action, position)));
        }

        if !(intent.price.is_finite() && intent.price > 0.0) {
            return Ok(reject(format!("invalid reference price {}", intent.price)));
        }

        let balances = match tokio::time::timeout(
            self.execution_timeout,
            self.executor.balances(account),
        )
        .await
        {
            Ok(Ok(b)) => b,
            Ok(Err(e)) => return Ok(failed(format!("balance lookup failed: {}", e))),
            Err(_) => return Ok(failed("balance lookup timed out".to_string())),
        };

        let quantity = size_trade(state.as_ref(), settings, &intent, &balances);
        if !(quantity.is_finite() && quantity > 0.0) {
            return Ok(reject(format!("computed quantity {} is not tradable", quantity)));
        }

        let total_value = quantity * intent.price;
        if total_value < settings.min_trade_value {
            warn!(
                account = %account,
                total_value,
                min = settings.min_trade_value,
                "🚫 Trade below minimum value"
            );
            return Ok(reject(format!(
                "trade value {:.2} below minimum {:.2}",
                total_value, settings.min_trade_value
            )));
        }

        let fee_amount = total_value * settings.fee_rate;
        match intent.action {
            TradeAction::Buy if total_value + fee_amount > balances.cash => {
                return Ok(reject(format!(
                    "insufficient cash: need {:.2}, have {:.2}",
                    total_value + fee_amount,
                    balances.cash
                )));
            }
            TradeAction::Sell if quantity > balances.asset + f64::EPSILON => {
                return Ok(reject(format!(
                    "insufficient asset: need {:.8}, have {:.8}",
                    quantity, balances.asset
                )));
            }
            _ => {}
        }

        let order = OrderRequest {
            account_id: account.clone(),
            action: intent.action,
            quantity,
            reference_price: intent.price,
        };

        let ack = match tokio::time::timeout(self.execution_timeout, self.executor.execute(&order))
            .await
        {
            Ok(Ok(ack)) => ack,
            Ok(Err(e)) => {
                warn!(account = %account, error = %e, "❌ Order execution failed");
                return Ok(failed(e.to_string()));
            }
            Err(_) => {
                let e = EngineError::Timeout {
                    collaborator: "executor",
                    after_ms: self.execution_timeout.as_millis() as u64,
                };
                warn!(account = %account, error = %e, "⏱️ Order execution timed out");
                return Ok(failed(e.to_string()));
            }
        };

        if !ack.is_filled() {
            warn!(account = %account, message = %ack.message, "❌ Order not filled");
            return Ok(failed(format!("order not filled: {}", ack.message)));
        }

        // Filled: transition state and record the trade
        let mut next = state.unwrap_or_else(|| {
            let initial_value = balances.total_value(intent.price);
            info!(
                account = %account,
                initial_value,
                "🆕 Session auto-started"
            );
            AccountPositionState {
                current_position: PositionState::NoSession,
                session_id: Uuid::new_v4(),
                session_amount: quantity,
                initial_value,
                trade_count: 0,
                started_at: intent.timestamp,
            }
        });
        next.current_position = PositionState::after(intent.action);
        next.trade_count += 1;

        let record = {
            let mut ledger = self.ledger.write().map_err(|_| {
                EngineError::InvariantViolation("trade ledger poisoned".to_string())
            })?;
            let trades = ledger.entry(account.clone()).or_default();
            let record = TradeRecord {
                action: intent.action,
                quantity,
                unit_price: intent.price,
                total_value,
                fee_amount,
                confidence: intent.confidence.clamp(0.0, 100.0),
                timestamp: intent.timestamp,
                session_id: next.session_id,
                sequence: trades.len() as u64 + 1,
            };
            trades.push(record.clone());
            record
        };

        self.store.put(account, next.clone());

        info!(
            account = %account,
            action = %record.action,
            quantity = record.quantity,
            price = record.unit_price,
            total = record.total_value,
            fee = record.fee_amount,
            position = %next.current_position,
            order_id = ack.order_id.as_deref().unwrap_or_default(),
            "✅ Trade executed"
        );

        Ok(TradeOutcome::Executed(record))
    }

    /// Close the account's session; `None` if there was none
    pub async fn end_session(
        &self,
        account: &AccountId,
        fee_rate: f64,
        ended_at: DateTime<Utc>,
    ) -> EngineResult<Option<SessionSummary>> {
        let lock = self.account_lock(account)?;
        let _guard = lock.lock().await;

        let Some(state) = self.store.remove(account) else {
            return Ok(None);
        };

        let session_trades: Vec<TradeRecord> = self
            .trades(account)
            .into_iter()
            .filter(|t| t.session_id == state.session_id)
            .collect();
        let pairing = pair_trades(&session_trades)?;
        let performance = summarize(&session_trades, fee_rate)?;

        info!(
            account = %account,
            session = %state.session_id,
            trades = state.trade_count,
            net = performance.net_profit_loss,
            "🏁 Session ended"
        );

        Ok(Some(SessionSummary {
            session_id: state.session_id,
            trade_count: state.trade_count,
            initial_value: state.initial_value,
            started_at: state.started_at,
            ended_at,
            final_position: state.current_position,
            pairs: pairing.pairs,
            performance,
        }))
    }
}

/// Session quantity if one is tracked, otherwise percentage or fixed sizing
fn size_trade(
    state: Option<&AccountPositionState>,
    settings: &AccountSettings,
    intent: &TradeIntent,
    balances: &AccountBalances,
) -> f64 {
    if let Some(s) = state {
        if s.session_amount > 0.0 {
            return s.session_amount;
        }
    }

    match settings.trade_mode {
        TradeMode::Fixed => settings.fixed_quantity,
        TradeMode::Percentage => {
            let percent = intent
                .size_percent
                .unwrap_or(settings.trade_percent)
                .clamp(1.0, 100.0);
            match intent.action {
                TradeAction::Buy => balances.cash * percent / 100.0 / intent.price,
                TradeAction::Sell => balances.asset * percent / 100.0,
            }
        }
    }
}

fn reject(reason: impl Into<String>) -> TradeOutcome {
    TradeOutcome::Rejected {
        reason: reason.into(),
    }
}

fn failed(reason: String) -> TradeOutcome {
    TradeOutcome::ExecutionFailed { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{MockOrderExecutor, OrderAck, PaperExecutor};
    use async_trait::async_trait;

    fn settings() -> AccountSettings {
        AccountSettings {
            trade_percent: 10.0,
            ..AccountSettings::default()
        }
    }

    fn intent(action: TradeAction, price: f64) -> TradeIntent {
        TradeIntent {
            action,
            price,
            confidence: 80.0,
            size_percent: None,
            timestamp: Utc::now(),
        }
    }

    fn paper_manager(cash: f64) -> PositionManager {
        PositionManager::new(
            Arc::new(MemoryPositionStore::new()),
            Arc::new(PaperExecutor::new(AccountBalances { cash, asset: 0.0 }, 0.01)),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn transition_table() {
        assert!(PositionState::NoSession.allows(TradeAction::Buy));
        assert!(!PositionState::NoSession.allows(TradeAction::Sell));
        assert!(PositionState::HoldingCash.allows(TradeAction::Buy));
        assert!(!PositionState::HoldingCash.allows(TradeAction::Sell));
        assert!(PositionState::HoldingAsset.allows(TradeAction::Sell));
        assert!(!PositionState::HoldingAsset.allows(TradeAction::Buy));
    }

    #[test]
    fn break_even_is_twice_the_fee() {
        assert!((break_even_move_percent(0.01) - 2.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn sell_without_session_is_rejected_without_state_change() {
        let manager = paper_manager(1000.0);
        let account = AccountId::new("acct");

        let outcome = manager
            .execute_trade(&account, &settings(), intent(TradeAction::Sell, 100.0))
            .await
            .unwrap();
        assert!(matches!(outcome, TradeOutcome::Rejected { .. }));
        assert!(manager.state(&account).is_none());
        assert!(manager.trades(&account).is_empty());
    }

    #[tokio::test]
    async fn session_round_trips_the_same_quantity() {
        let manager = paper_manager(1000.0);
        let account = AccountId::new("acct");

        let buy = manager
            .execute_trade(&account, &settings(), intent(TradeAction::Buy, 100.0))
            .await
            .unwrap();
        let TradeOutcome::Executed(buy) = buy else {
            panic!("expected executed buy, got {:?}", buy);
        };
        // 10% of 1000 cash at 100
        assert!((buy.quantity - 1.0).abs() < 1e-12);
        assert!((buy.fee_amount - 1.0).abs() < 1e-12);
        assert_eq!(manager.position(&account), PositionState::HoldingAsset);

        let state = manager.state(&account).unwrap();
        assert_eq!(state.trade_count, 1);
        assert!((state.initial_value - 1000.0).abs() < 1e-9);

        // A second BUY is illegal while holding the asset
        let again = manager
            .execute_trade(&account, &settings(), intent(TradeAction::Buy, 100.0))
            .await
            .unwrap();
        assert!(matches!(again, TradeOutcome::Rejected { .. }));
        assert_eq!(manager.state(&account).unwrap(), state);

        let sell = manager
            .execute_trade(&account, &settings(), intent(TradeAction::Sell, 120.0))
            .await
            .unwrap();
        let TradeOutcome::Executed(sell) = sell else {
            panic!("expected executed sell, got {:?}", sell);
        };
        assert_eq!(sell.quantity, buy.quantity);
        assert_eq!(sell.sequence, 2);
        assert_eq!(sell.session_id, buy.session_id);
        assert_eq!(manager.position(&account), PositionState::HoldingCash);

        let summary = manager
            .end_session(&account, 0.01, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.trade_count, 2);
        assert_eq!(summary.pairs.len(), 1);
        assert!((summary.performance.gross_profit_loss - 20.0).abs() < 1e-9);
        assert_eq!(manager.position(&account), PositionState::NoSession);
        assert!(manager.end_session(&account, 0.01, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn below_minimum_value_is_never_sent() {
        let mut executor = MockOrderExecutor::new();
        executor
            .expect_balances()
            .returning(|_| Ok(AccountBalances { cash: 50.0, asset: 0.0 }));
        executor.expect_execute().never();

        let manager = PositionManager::new(
            Arc::new(MemoryPositionStore::new()),
            Arc::new(executor),
            Duration::from_secs(1),
        );
        // 10% of 50 = 5 < 10 minimum
        let outcome = manager
            .execute_trade(&AccountId::new("acct"), &settings(), intent(TradeAction::Buy, 100.0))
            .await
            .unwrap();
        assert!(matches!(outcome, TradeOutcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn fixed_mode_uses_configured_quantity() {
        let manager = paper_manager(1000.0);
        let fixed = AccountSettings {
            trade_mode: TradeMode::Fixed,
            fixed_quantity: 0.25,
            ..AccountSettings::default()
        };
        let outcome = manager
            .execute_trade(&AccountId::new("acct"), &fixed, intent(TradeAction::Buy, 100.0))
            .await
            .unwrap();
        let TradeOutcome::Executed(record) = outcome else {
            panic!("expected execution");
        };
        assert_eq!(record.quantity, 0.25);
    }

    #[tokio::test]
    async fn unfilled_order_leaves_state_unchanged() {
        let mut executor = MockOrderExecutor::new();
        executor
            .expect_balances()
            .returning(|_| Ok(AccountBalances { cash: 1000.0, asset: 0.0 }));
        executor
            .expect_execute()
            .times(1)
            .returning(|_| Ok(OrderAck::rejected("venue closed")));

        let manager = PositionManager::new(
            Arc::new(MemoryPositionStore::new()),
            Arc::new(executor),
            Duration::from_secs(1),
        );
        let account = AccountId::new("acct");
        let outcome = manager
            .execute_trade(&account, &settings(), intent(TradeAction::Buy, 100.0))
            .await
            .unwrap();
        assert!(matches!(outcome, TradeOutcome::ExecutionFailed { .. }));
        assert!(manager.state(&account).is_none());
        assert!(manager.trades(&account).is_empty());
    }

    struct SlowExecutor;

    #[async_trait]
    impl OrderExecutor for SlowExecutor {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn execute(&self, _order: &OrderRequest) -> EngineResult<OrderAck> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(OrderAck::filled("late", "too late"))
        }

        async fn balances(&self, _account: &AccountId) -> EngineResult<AccountBalances> {
            Ok(AccountBalances { cash: 1000.0, asset: 0.0 })
        }
    }

    #[tokio::test]
    async fn execution_timeout_leaves_state_unchanged() {
        let manager = PositionManager::new(
            Arc::new(MemoryPositionStore::new()),
            Arc::new(SlowExecutor),
            Duration::from_millis(20),
        );
        let account = AccountId::new("acct");
        let outcome = manager
            .execute_trade(&account, &settings(), intent(TradeAction::Buy, 100.0))
            .await
            .unwrap();
        match outcome {
            TradeOutcome::ExecutionFailed { reason } => assert!(reason.contains("timed out")),
            other => panic!("expected timeout failure, got {:?}", other),
        }
        assert_eq!(manager.position(&account), PositionState::NoSession);
    }

    #[tokio::test]
    async fn concurrent_trade_for_same_account_is_rejected() {
        let manager = Arc::new(PositionManager::new(
            Arc::new(MemoryPositionStore::new()),
            Arc::new(SlowExecutor),
            Duration::from_secs(2),
        ));
        let account = AccountId::new("acct");

        let first = {
            let manager = manager.clone();
            let account = account.clone();
            tokio::spawn(async move {
                manager
                    .execute_trade(&account, &settings(), intent(TradeAction::Buy, 100.0))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = manager
            .execute_trade(&account, &settings(), intent(TradeAction::Buy, 100.0))
            .await
            .unwrap();
        assert!(matches!(second, TradeOutcome::Rejected { .. }));

        let first = first.await.unwrap().unwrap();
        assert!(first.is_executed());
        assert_eq!(manager.trades(&account).len(), 1);
    }
}
