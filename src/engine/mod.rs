//! Decision cycle orchestrator
//!
//! One cycle per account: snapshot → detector + correlator → gate →
//! position manager → decision log. A cycle for an account that is still
//! running is skipped, not queued. The global switch is checked first and
//! never cancels calls already in flight.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::advisor::Advisor;
use crate::config::{AccountSettings, AppConfig};
use crate::correlator::{CombinedSignal, MultiFactorCorrelator};
use crate::error::{EngineError, EngineResult};
use crate::execution::OrderExecutor;
use crate::gate::{adjusted_confidence, Clock, DecisionGate, GateDecision, GateInput};
use crate::history::{MarketSnapshot, ReferenceHistory, TickHistory};
use crate::patterns::{PatternAnalysis, PatternDetector};
use crate::persistence::{
    DecisionLog, DecisionRecord, DecisionRoute, MemoryDecisionLog, TradeJournal,
};
use crate::position::{
    MemoryPositionStore, PerformanceSummary, PositionManager, PositionStore, SessionSummary,
    TradeIntent, TradeOutcome, TradeRecord,
};
use crate::types::{AccountBalances, AccountId, ReferencePrice};

/// Result of one decision cycle
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Global switch is off
    Disabled,
    /// Previous cycle still running, or nothing to evaluate
    Skipped { reason: String },
    /// Gate did not escalate (no pattern, threshold, HOLD, cooldown)
    Abstained(GateDecision),
    /// Escalated or fell back, but the final action is HOLD
    Hold(GateDecision),
    Rejected {
        decision: GateDecision,
        reason: String,
    },
    Executed {
        decision: GateDecision,
        trade: TradeRecord,
    },
    ExecutionFailed {
        decision: GateDecision,
        reason: String,
    },
}

impl CycleOutcome {
    pub fn decision(&self) -> Option<&GateDecision> {
        match self {
            CycleOutcome::Disabled | CycleOutcome::Skipped { .. } => None,
            CycleOutcome::Abstained(d) | CycleOutcome::Hold(d) => Some(d),
            CycleOutcome::Rejected { decision, .. }
            | CycleOutcome::Executed { decision, .. }
            | CycleOutcome::ExecutionFailed { decision, .. } => Some(decision),
        }
    }

    pub fn trade(&self) -> Option<&TradeRecord> {
        match self {
            CycleOutcome::Executed { trade, .. } => Some(trade),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Disabled => "disabled",
            CycleOutcome::Skipped { .. } => "skipped",
            CycleOutcome::Abstained(_) => "abstained",
            CycleOutcome::Hold(_) => "hold",
            CycleOutcome::Rejected { .. } => "rejected",
            CycleOutcome::Executed { .. } => "executed",
            CycleOutcome::ExecutionFailed { .. } => "execution_failed",
        }
    }
}

/// Removes the account from the running set when the cycle ends
struct CycleGuard<'a> {
    running: &'a Mutex<HashSet<AccountId>>,
    account: AccountId,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.account);
        }
    }
}

struct MarketHistory {
    ticks: TickHistory,
    references: ReferenceHistory,
}

pub struct TradingEngine {
    enabled: AtomicBool,
    clock: Arc<dyn Clock>,
    detector: PatternDetector,
    correlator: MultiFactorCorrelator,
    gate: DecisionGate,
    positions: PositionManager,
    decisions: Arc<dyn DecisionLog>,
    journal: Option<Arc<TradeJournal>>,
    market: RwLock<MarketHistory>,
    default_settings: AccountSettings,
    accounts: RwLock<HashMap<AccountId, AccountSettings>>,
    running: Mutex<HashSet<AccountId>>,
    executor: Arc<dyn OrderExecutor>,
    execution_timeout: std::time::Duration,
}

impl TradingEngine {
    pub fn new(
        config: &AppConfig,
        advisor: Arc<dyn Advisor>,
        executor: Arc<dyn OrderExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let execution_timeout = config.engine.execution_timeout();
        Self {
            enabled: AtomicBool::new(config.engine.enabled),
            detector: PatternDetector::new(&config.patterns),
            correlator: MultiFactorCorrelator::new(&config.correlator),
            gate: DecisionGate::new(advisor, clock.clone(), &config.engine),
            positions: PositionManager::new(
                Arc::new(MemoryPositionStore::new()),
                executor.clone(),
                execution_timeout,
            ),
            clock,
            decisions: Arc::new(MemoryDecisionLog::default()),
            journal: None,
            market: RwLock::new(MarketHistory {
                ticks: TickHistory::default(),
                references: ReferenceHistory::default(),
            }),
            default_settings: config.account.clone(),
            accounts: RwLock::new(HashMap::new()),
            running: Mutex::new(HashSet::new()),
            executor,
            execution_timeout,
        }
    }

    pub fn with_decision_log(mut self, decisions: Arc<dyn DecisionLog>) -> Self {
        self.decisions = decisions;
        self
    }

    pub fn with_trade_journal(mut self, journal: Arc<TradeJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Replace the in-memory position store; call before any trade
    pub fn with_position_store(mut self, store: Arc<dyn PositionStore>) -> Self {
        self.positions = PositionManager::new(store, self.executor.clone(), self.execution_timeout);
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Switch and accounts
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "🔌 Engine switch changed");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Register per-account settings; unregistered accounts use the defaults
    pub fn register_account(&self, account: AccountId, settings: AccountSettings) -> EngineResult<()> {
        let settings = settings.validate()?;
        let mut accounts = self.accounts.write().map_err(|_| {
            EngineError::InvariantViolation("account settings table poisoned".to_string())
        })?;
        accounts.insert(account, settings);
        Ok(())
    }

    pub fn account_settings(&self, account: &AccountId) -> AccountSettings {
        self.accounts
            .read()
            .ok()
            .and_then(|a| a.get(account).cloned())
            .unwrap_or_else(|| self.default_settings.clone())
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn decisions(&self) -> &dyn DecisionLog {
        self.decisions.as_ref()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Market data
    // ─────────────────────────────────────────────────────────────────────────

    /// Append an asset observation; returns false for out-of-order ticks
    pub fn ingest_tick(&self, value: f64, timestamp: DateTime<Utc>) -> bool {
        match self.market.write() {
            Ok(mut market) => market.ticks.push(value, timestamp).is_some(),
            Err(_) => false,
        }
    }

    pub fn ingest_reference(&self, price: ReferencePrice) {
        if let Ok(mut market) = self.market.write() {
            market.references.push(price);
        }
    }

    /// Immutable view of the current history
    pub fn snapshot(&self, as_of: DateTime<Utc>) -> EngineResult<MarketSnapshot> {
        let market = self.market.read().map_err(|_| {
            EngineError::InvariantViolation("market history poisoned".to_string())
        })?;
        Ok(MarketSnapshot::capture(
            &market.ticks,
            &market.references,
            as_of,
        ))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Cycle
    // ─────────────────────────────────────────────────────────────────────────

    fn claim_cycle(&self, account: &AccountId) -> EngineResult<Option<CycleGuard<'_>>> {
        let mut running = self.running.lock().map_err(|_| {
            EngineError::InvariantViolation("cycle guard table poisoned".to_string())
        })?;
        if !running.insert(account.clone()) {
            return Ok(None);
        }
        Ok(Some(CycleGuard {
            running: &self.running,
            account: account.clone(),
        }))
    }

    /// Run one decision cycle for the account
    pub async fn run_cycle(&self, account: &AccountId) -> EngineResult<CycleOutcome> {
        if !self.is_enabled() {
            return Ok(CycleOutcome::Disabled);
        }

        let Some(_guard) = self.claim_cycle(account)? else {
            warn!(account = %account, "⏭️ Previous cycle still running, skipping");
            return Ok(CycleOutcome::Skipped {
                reason: "previous cycle still running".to_string(),
            });
        };

        let settings = self.account_settings(account);
        let snapshot = self.snapshot(self.clock.now())?;
        let Some(price) = snapshot.latest_price() else {
            return Ok(CycleOutcome::Skipped {
                reason: "no market data".to_string(),
            });
        };

        // Both are pure over the snapshot
        let analysis = self.detector.analyze(&snapshot);
        let signal = match self.correlator.evaluate(&snapshot) {
            Ok(signal) => signal,
            Err(e) => {
                error!(account = %account, error = %e, "🚨 Correlator failed");
                return Err(e);
            }
        };

        // Accounts that will not trade never spend advisor calls or cooldown slots
        if !settings.auto_trading_enabled {
            let decision = GateDecision::abstain(
                adjusted_confidence(&analysis, &signal),
                "auto trading disabled",
            );
            info!(account = %account, suggestion = %analysis.suggestion, "Auto trading disabled, not escalating");
            let outcome = CycleOutcome::Abstained(decision);
            self.record_decision(account, &snapshot, price, &analysis, &signal, &outcome);
            return Ok(outcome);
        }

        let balances = match self.positions.balances(account).await {
            Ok(b) => b,
            Err(e) => {
                warn!(account = %account, error = %e, "Balance lookup failed, advising on empty balances");
                AccountBalances::default()
            }
        };

        let decision = self
            .gate
            .decide(
                GateInput {
                    account,
                    settings: &settings,
                    snapshot: &snapshot,
                    analysis: &analysis,
                    signal: &signal,
                    balances,
                },
                self.decisions.as_ref(),
            )
            .await?;

        let outcome = match decision.action.action() {
            None if decision.route == DecisionRoute::Abstain => {
                CycleOutcome::Abstained(decision)
            }
            None => CycleOutcome::Hold(decision),
            Some(action) => {
                let intent = TradeIntent {
                    action,
                    price,
                    confidence: decision.confidence,
                    size_percent: decision.size_percent,
                    timestamp: snapshot.as_of,
                };
                match self.positions.execute_trade(account, &settings, intent).await? {
                    TradeOutcome::Executed(trade) => {
                        if let Some(journal) = &self.journal {
                            if let Err(e) = journal.record(account, &trade) {
                                warn!(account = %account, error = %e, "Failed to journal trade");
                            }
                        }
                        CycleOutcome::Executed {
                            decision: decision,
                            trade,
                        }
                    }
                    TradeOutcome::Rejected { reason } => CycleOutcome::Rejected {
                        decision: decision,
                        reason,
                    },
                    TradeOutcome::ExecutionFailed { reason } => CycleOutcome::ExecutionFailed {
                        decision: decision,
                        reason,
                    },
                }
            }
        };

        self.record_decision(account, &snapshot, price, &analysis, &signal, &outcome);

        Ok(outcome)
    }

    /// Append the cycle's decision record and log the cycle summary
    fn record_decision(
        &self,
        account: &AccountId,
        snapshot: &MarketSnapshot,
        price: f64,
        analysis: &PatternAnalysis,
        signal: &CombinedSignal,
        outcome: &CycleOutcome,
    ) {
        let Some(decision) = outcome.decision() else {
            return;
        };

        let record = DecisionRecord {
            timestamp: snapshot.as_of,
            account_id: account.to_string(),
            price,
            pattern_types: analysis.pattern_types(),
            pattern_confidence: analysis.confidence,
            suggestion: analysis.suggestion,
            confidence_boost: signal.confidence_boost,
            manipulation_type: signal.manipulation_type,
            route: decision.route,
            action: decision.action,
            confidence: decision.confidence.clamp(0.0, 100.0),
            executed: outcome.trade().is_some(),
            reasoning: match outcome {
                CycleOutcome::Rejected { reason, .. } | CycleOutcome::ExecutionFailed { reason, .. } => {
                    format!("{} ({})", decision.reasoning, reason)
                }
                _ => decision.reasoning.clone(),
            },
        };
        if let Err(e) = self.decisions.append(record) {
            warn!(account = %account, error = %e, "Failed to append decision record");
        }

        info!(
            account = %account,
            price,
            patterns = analysis.patterns.len(),
            suggestion = %analysis.suggestion,
            market = %signal.market_direction,
            manipulation = %signal.manipulation_type,
            route = %decision.route,
            action = %decision.action,
            confidence = decision.confidence,
            outcome = outcome.label(),
            "🔁 Cycle complete"
        );
    }

    /// Close the account's session and report its round trips
    pub async fn end_session(&self, account: &AccountId) -> EngineResult<Option<SessionSummary>> {
        let fee_rate = self.account_settings(account).fee_rate;
        self.positions
            .end_session(account, fee_rate, self.clock.now())
            .await
    }

    pub fn performance(&self, account: &AccountId) -> EngineResult<PerformanceSummary> {
        let fee_rate = self.account_settings(account).fee_rate;
        self.positions.performance(account, fee_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::{DisabledAdvisor, MockAdvisor};
    use crate::execution::PaperExecutor;
    use crate::gate::ManualClock;
    use crate::types::Suggestion;
    use chrono::Duration;

    fn engine(advisor: Arc<dyn Advisor>, clock: Arc<ManualClock>) -> TradingEngine {
        let config = AppConfig::default();
        let executor = Arc::new(PaperExecutor::new(
            AccountBalances {
                cash: 1000.0,
                asset: 0.0,
            },
            config.account.fee_rate,
        ));
        TradingEngine::new(&config, advisor, executor, clock)
    }

    fn feed(engine: &TradingEngine, clock: &ManualClock, start: DateTime<Utc>, prices: &[f64]) {
        for (i, p) in prices.iter().enumerate() {
            let ts = start + Duration::minutes(i as i64);
            engine.ingest_tick(*p, ts);
            clock.set(ts);
        }
    }

    #[tokio::test]
    async fn disabled_engine_does_nothing() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = engine(Arc::new(DisabledAdvisor), clock);
        engine.set_enabled(false);
        let outcome = engine.run_cycle(&AccountId::new("a")).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Disabled);
        assert!(engine.decisions().is_empty());
    }

    #[tokio::test]
    async fn empty_history_is_skipped() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = engine(Arc::new(DisabledAdvisor), clock);
        let outcome = engine.run_cycle(&AccountId::new("a")).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Skipped { .. }));
    }

    #[test]
    fn reentrant_cycle_is_refused_until_guard_drops() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = engine(Arc::new(DisabledAdvisor), clock);
        let account = AccountId::new("a");

        let first = engine.claim_cycle(&account).unwrap();
        assert!(first.is_some());
        assert!(engine.claim_cycle(&account).unwrap().is_none());
        // Other accounts are independent
        assert!(engine.claim_cycle(&AccountId::new("b")).unwrap().is_some());

        drop(first);
        assert!(engine.claim_cycle(&account).unwrap().is_some());
    }

    #[tokio::test]
    async fn flat_market_abstains_and_is_logged() {
        let mut advisor = MockAdvisor::new();
        advisor.expect_advise().never();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = engine(Arc::new(advisor), clock.clone());
        feed(&engine, &clock, Utc::now(), &[100.0; 8]);

        let outcome = engine.run_cycle(&AccountId::new("a")).await.unwrap();
        let CycleOutcome::Abstained(decision) = outcome else {
            panic!("expected abstain, got {:?}", outcome);
        };
        assert_eq!(decision.route, DecisionRoute::Abstain);
        assert_eq!(engine.decisions().len(), 1);
    }

    #[tokio::test]
    async fn fallback_sell_without_position_is_rejected() {
        // Advisor down, strong organic drop: fallback SELL, but no session exists
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = engine(Arc::new(DisabledAdvisor), clock.clone());
        feed(
            &engine,
            &clock,
            Utc::now(),
            &[100.0, 99.0, 98.0, 97.0, 96.0, 95.0],
        );

        let account = AccountId::new("a");
        let outcome = engine.run_cycle(&account).await.unwrap();
        match &outcome {
            CycleOutcome::Rejected { decision, .. } => {
                assert_eq!(decision.route, DecisionRoute::Fallback);
                assert_eq!(decision.action, Suggestion::Sell);
            }
            other => panic!("expected rejected sell, got {:?}", other),
        }
        assert!(engine.positions().state(&account).is_none());

        let logged = engine
            .decisions()
            .similar(&[crate::patterns::PatternType::ConsecutiveDrops], 5);
        assert_eq!(logged.len(), 1);
        assert!(!logged[0].executed);
    }

    #[tokio::test]
    async fn auto_trading_off_never_escalates() {
        let mut advisor = MockAdvisor::new();
        advisor.expect_advise().never();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = engine(Arc::new(advisor), clock.clone());
        let account = AccountId::new("manual");
        engine
            .register_account(
                account.clone(),
                AccountSettings {
                    auto_trading_enabled: false,
                    ..AccountSettings::default()
                },
            )
            .unwrap();
        feed(
            &engine,
            &clock,
            Utc::now(),
            &[100.0, 99.0, 98.0, 97.0, 96.0, 95.0],
        );

        // Strong organic drop that would otherwise escalate
        let outcome = engine.run_cycle(&account).await.unwrap();
        let CycleOutcome::Abstained(decision) = &outcome else {
            panic!("expected abstain, got {:?}", outcome);
        };
        assert_eq!(decision.route, DecisionRoute::Abstain);
        assert!(decision.reasoning.contains("auto trading disabled"));
        assert!(decision.adjusted_confidence >= 70.0);
        assert!(engine.gate.last_advisor_call(&account).is_none());
        assert!(engine.positions().trades(&account).is_empty());
        assert_eq!(engine.decisions().len(), 1);
    }

    #[test]
    fn invalid_account_settings_are_refused() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = engine(Arc::new(DisabledAdvisor), clock);
        let err = engine
            .register_account(
                AccountId::new("bad"),
                AccountSettings {
                    min_confidence: 20.0,
                    ..AccountSettings::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
