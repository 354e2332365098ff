//! Order execution collaborator
//!
//! The engine emits `{action, quantity, reference_price}` and gets back an
//! acknowledgement. An acknowledgement without an order id is a failed fill.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::PaperConfig;
use crate::error::{EngineError, EngineResult};
use crate::types::{AccountBalances, AccountId, TradeAction};

/// Order sent to the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub account_id: AccountId,
    pub action: TradeAction,
    /// Asset units
    pub quantity: f64,
    /// Price the engine sized the order at
    pub reference_price: f64,
}

impl OrderRequest {
    pub fn notional(&self) -> f64 {
        self.quantity * self.reference_price
    }
}

/// Executor acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    /// `None` means the order was not filled
    pub order_id: Option<String>,
    pub message: String,
}

impl OrderAck {
    pub fn filled(order_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            order_id: Some(order_id.into()),
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            order_id: None,
            message: message.into(),
        }
    }

    pub fn is_filled(&self) -> bool {
        self.order_id.is_some()
    }
}

/// Places orders and reports balances
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    /// Executor name for logging
    fn name(&self) -> &'static str;

    async fn execute(&self, order: &OrderRequest) -> EngineResult<OrderAck>;

    async fn balances(&self, account: &AccountId) -> EngineResult<AccountBalances>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Paper executor
// ─────────────────────────────────────────────────────────────────────────────

/// Simulated executor: fills at the reference price and charges the fee on
/// every leg. Accounts start from the configured balances on first use.
pub struct PaperExecutor {
    accounts: RwLock<HashMap<AccountId, AccountBalances>>,
    initial: AccountBalances,
    fee_rate: f64,
    /// Every n-th order is left unfilled (0 = never)
    fill_failure_every: u64,
    orders_seen: AtomicU64,
}

impl PaperExecutor {
    pub fn new(initial: AccountBalances, fee_rate: f64) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            initial,
            fee_rate,
            fill_failure_every: 0,
            orders_seen: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &PaperConfig, fee_rate: f64) -> Self {
        Self::new(
            AccountBalances {
                cash: config.initial_cash,
                asset: config.initial_asset,
            },
            fee_rate,
        )
        .with_fill_failure_every(config.fill_failure_every)
    }

    pub fn with_fill_failure_every(mut self, every: u64) -> Self {
        self.fill_failure_every = every;
        self
    }

    /// Seed or overwrite one account's balances
    pub fn set_balances(&self, account: &AccountId, balances: AccountBalances) {
        if let Ok(mut accounts) = self.accounts.write() {
            accounts.insert(account.clone(), balances);
        }
    }

    fn current(&self, account: &AccountId) -> AccountBalances {
        self.accounts
            .read()
            .ok()
            .and_then(|a| a.get(account).copied())
            .unwrap_or(self.initial)
    }
}

#[async_trait]
impl OrderExecutor for PaperExecutor {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn execute(&self, order: &OrderRequest) -> EngineResult<OrderAck> {
        if !(order.quantity.is_finite() && order.quantity > 0.0) {
            return Err(EngineError::Validation(format!(
                "invalid order quantity {}",
                order.quantity
            )));
        }
        if !(order.reference_price.is_finite() && order.reference_price > 0.0) {
            return Err(EngineError::Validation(format!(
                "invalid reference price {}",
                order.reference_price
            )));
        }

        let seen = self.orders_seen.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fill_failure_every > 0 && seen % self.fill_failure_every == 0 {
            warn!(account = %order.account_id, order = seen, "[PAPER] Simulated fill failure");
            return Ok(OrderAck::rejected("simulated fill failure"));
        }

        let mut accounts = self.accounts.write().map_err(|_| {
            EngineError::InvariantViolation("paper balances lock poisoned".to_string())
        })?;
        let balances = accounts
            .entry(order.account_id.clone())
            .or_insert(self.initial);

        let notional = order.notional();
        let fee = notional * self.fee_rate;

        match order.action {
            TradeAction::Buy => {
                if balances.cash < notional + fee {
                    warn!(
                        account = %order.account_id,
                        cash = balances.cash,
                        needed = notional + fee,
                        "[PAPER] Insufficient cash"
                    );
                    return Ok(OrderAck::rejected("insufficient cash"));
                }
                balances.cash -= notional + fee;
                balances.asset += order.quantity;
            }
            TradeAction::Sell => {
                if balances.asset + f64::EPSILON < order.quantity {
                    warn!(
                        account = %order.account_id,
                        asset = balances.asset,
                        needed = order.quantity,
                        "[PAPER] Insufficient asset"
                    );
                    return Ok(OrderAck::rejected("insufficient asset"));
                }
                balances.asset = (balances.asset - order.quantity).max(0.0);
                balances.cash += notional - fee;
            }
        }

        let order_id = format!("paper-{}", Uuid::new_v4());
        info!(
            account = %order.account_id,
            action = %order.action,
            quantity = order.quantity,
            price = order.reference_price,
            fee,
            cash = balances.cash,
            asset = balances.asset,
            "📝 [PAPER] Filled"
        );

        Ok(OrderAck::filled(
            order_id,
            format!("{} {:.8} @ {:.4}", order.action, order.quantity, order.reference_price),
        ))
    }

    async fn balances(&self, account: &AccountId) -> EngineResult<AccountBalances> {
        Ok(self.current(account))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(action: TradeAction, quantity: f64, price: f64) -> OrderRequest {
        OrderRequest {
            account_id: AccountId::new("paper-1"),
            action,
            quantity,
            reference_price: price,
        }
    }

    #[tokio::test]
    async fn buy_then_sell_charges_fee_on_both_legs() {
        let exec = PaperExecutor::new(AccountBalances { cash: 1000.0, asset: 0.0 }, 0.01);

        let ack = exec.execute(&order(TradeAction::Buy, 1.0, 100.0)).await.unwrap();
        assert!(ack.is_filled());
        let b = exec.balances(&AccountId::new("paper-1")).await.unwrap();
        assert!((b.cash - 899.0).abs() < 1e-9);
        assert_eq!(b.asset, 1.0);

        exec.execute(&order(TradeAction::Sell, 1.0, 110.0)).await.unwrap();
        let b = exec.balances(&AccountId::new("paper-1")).await.unwrap();
        assert!((b.cash - 1007.9).abs() < 1e-9);
        assert_eq!(b.asset, 0.0);
    }

    #[tokio::test]
    async fn insufficient_funds_leave_balances_untouched() {
        let exec = PaperExecutor::new(AccountBalances { cash: 50.0, asset: 0.0 }, 0.01);

        let ack = exec.execute(&order(TradeAction::Buy, 1.0, 100.0)).await.unwrap();
        assert!(!ack.is_filled());
        let ack = exec.execute(&order(TradeAction::Sell, 1.0, 100.0)).await.unwrap();
        assert!(!ack.is_filled());

        let b = exec.balances(&AccountId::new("paper-1")).await.unwrap();
        assert_eq!(b, AccountBalances { cash: 50.0, asset: 0.0 });
    }

    #[tokio::test]
    async fn failure_injection_hits_every_nth_order() {
        let exec = PaperExecutor::new(AccountBalances { cash: 1000.0, asset: 0.0 }, 0.0)
            .with_fill_failure_every(2);

        assert!(exec.execute(&order(TradeAction::Buy, 0.1, 100.0)).await.unwrap().is_filled());
        assert!(!exec.execute(&order(TradeAction::Buy, 0.1, 100.0)).await.unwrap().is_filled());
        assert!(exec.execute(&order(TradeAction::Buy, 0.1, 100.0)).await.unwrap().is_filled());
    }

    #[tokio::test]
    async fn invalid_orders_are_validation_errors() {
        let exec = PaperExecutor::new(AccountBalances::default(), 0.01);
        let err = exec.execute(&order(TradeAction::Buy, 0.0, 100.0)).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        let err = exec.execute(&order(TradeAction::Buy, 1.0, f64::NAN)).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
