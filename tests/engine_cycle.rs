//! End-to-end decision cycles through the public API

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tradegate::advisor::{Advisor, AdvisorRequest};
use tradegate::config::AppConfig;
use tradegate::execution::PaperExecutor;
use tradegate::gate::ManualClock;
use tradegate::persistence::{CsvDecisionLog, DecisionRoute, TradeJournal};
use tradegate::position::PositionState;
use tradegate::types::{AccountBalances, AccountId, ReferenceInstrument, ReferencePrice, TradeAction};
use tradegate::{CycleOutcome, EngineError, EngineResult, TradingEngine};

/// Advisor that replays canned answers and counts calls
struct ScriptedAdvisor {
    responses: Mutex<VecDeque<Value>>,
    calls: AtomicUsize,
}

impl ScriptedAdvisor {
    fn new(responses: Vec<Value>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Advisor for ScriptedAdvisor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn advise(&self, _request: &AdvisorRequest) -> EngineResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| EngineError::ExternalCall {
                collaborator: "advisor",
                message: "script exhausted".to_string(),
            })
    }
}

struct Harness {
    engine: TradingEngine,
    clock: Arc<ManualClock>,
    start: DateTime<Utc>,
    minute: i64,
}

impl Harness {
    fn new(engine: impl FnOnce(Arc<ManualClock>) -> TradingEngine) -> Self {
        let start = Utc::now() - Duration::hours(1);
        let clock = Arc::new(ManualClock::new(start));
        Self {
            engine: engine(clock.clone()),
            clock,
            start,
            minute: 0,
        }
    }

    /// One observation per minute for the asset and all three references
    fn push(&mut self, asset: f64, primary: f64, secondary: f64, rate: f64) {
        let ts = self.start + Duration::minutes(self.minute);
        self.minute += 1;
        self.engine.ingest_tick(asset, ts);
        for (instrument, value) in [
            (ReferenceInstrument::Primary, primary),
            (ReferenceInstrument::Secondary, secondary),
            (ReferenceInstrument::ExchangeRate, rate),
        ] {
            self.engine.ingest_reference(ReferencePrice {
                instrument,
                value,
                timestamp: ts,
            });
        }
        self.clock.set(ts);
    }

    /// Asset moves while every reference stays flat
    fn push_asset(&mut self, prices: &[f64]) {
        for p in prices {
            self.push(*p, 50_000.0, 3_000.0, 32.0);
        }
    }
}

fn paper_engine(advisor: Arc<dyn Advisor>, clock: Arc<ManualClock>) -> TradingEngine {
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

fn temp_data_dir(test_name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "tradegate_it_{}_{}",
        test_name,
        uuid::Uuid::new_v4()
    ))
}

#[tokio::test]
async fn fast_path_buy_then_advised_sell_round_trip() {
    let advisor = Arc::new(ScriptedAdvisor::new(vec![json!({
        "action": "SELL",
        "confidence": 85,
        "sizePercent": 50,
        "reasoning": "spike after rebound, take profit",
        "expectedOutcome": "lock in gain"
    })]));
    let data_dir = temp_data_dir("round_trip");
    let journal = Arc::new(TradeJournal::open(&data_dir).unwrap());

    let advisor_handle = advisor.clone();
    let journal_handle = journal.clone();
    let mut h = Harness::new(move |clock| {
        paper_engine(advisor_handle, clock)
            .with_decision_log(Arc::new(CsvDecisionLog::open(&data_dir, 100).unwrap()))
            .with_trade_journal(journal_handle)
    });
    let account = AccountId::new("paper");

    // Three uncorroborated 0.2 drops, then an uptick: bottom reversal on a fake drop
    h.push_asset(&[100.0, 100.0, 99.8, 99.6, 99.4, 99.5]);
    let buy = h.engine.run_cycle(&account).await.unwrap();
    let CycleOutcome::Executed { decision, trade } = &buy else {
        panic!("expected fast-path buy, got {:?}", buy);
    };
    assert_eq!(decision.route, DecisionRoute::FastPath);
    assert_eq!(trade.action, TradeAction::Buy);
    // 5% of 1000 cash
    assert!((trade.total_value - 50.0).abs() < 1e-6);
    assert_eq!(advisor.calls(), 0);
    assert_eq!(
        h.engine.positions().position(&account),
        PositionState::HoldingAsset
    );

    // Sharp spike: detector suggests SELL, advisor agrees
    h.push_asset(&[99.6, 99.7, 100.2]);
    let sell = h.engine.run_cycle(&account).await.unwrap();
    let CycleOutcome::Executed { decision, trade: sold } = &sell else {
        panic!("expected advised sell, got {:?}", sell);
    };
    assert_eq!(decision.route, DecisionRoute::Advisor);
    assert_eq!(sold.action, TradeAction::Sell);
    // Session quantity reused, advisor size ignored
    assert_eq!(sold.quantity, trade.quantity);
    assert!(decision.adjusted_confidence > 100.0);
    assert_eq!(advisor.calls(), 1);
    assert_eq!(
        h.engine.positions().position(&account),
        PositionState::HoldingCash
    );

    let performance = h.engine.performance(&account).unwrap();
    assert_eq!(performance.pairs, 1);
    assert_eq!(performance.wins, 1);
    assert!(performance.gross_profit_loss > 0.0);
    // A 0.7% move does not cover 2% of round-trip fees
    assert!(performance.net_profit_loss < 0.0);

    let journaled = journal.load(&account).unwrap();
    assert_eq!(journaled, h.engine.positions().trades(&account));

    let summary = h.engine.end_session(&account).await.unwrap().unwrap();
    assert_eq!(summary.trade_count, 2);
    assert_eq!(summary.pairs.len(), 1);
    assert_eq!(
        h.engine.positions().position(&account),
        PositionState::NoSession
    );

    assert_eq!(h.engine.decisions().len(), 2);

    let _ = std::fs::remove_dir_all(journal.path().parent().unwrap());
}

#[tokio::test]
async fn malformed_advice_falls_back_and_cooldown_limits_calls() {
    let advisor = Arc::new(ScriptedAdvisor::new(vec![json!({"thoughts": "unsure"})]));
    let advisor_handle = advisor.clone();
    let mut h = Harness::new(move |clock| paper_engine(advisor_handle, clock));
    let account = AccountId::new("paper");

    // Organic decline: asset and both references fall together
    h.push(100.0, 50_000.0, 3_000.0, 32.0);
    h.push(99.0, 49_500.0, 2_970.0, 32.0);
    h.push(98.0, 49_000.0, 2_940.0, 32.0);
    h.push(97.0, 48_500.0, 2_910.0, 32.0);

    let first = h.engine.run_cycle(&account).await.unwrap();
    match &first {
        CycleOutcome::Rejected { decision, reason } => {
            assert_eq!(decision.route, DecisionRoute::Fallback);
            assert_eq!(decision.action.action(), Some(TradeAction::Sell));
            assert!(reason.contains("not allowed"));
        }
        other => panic!("expected rejected fallback sell, got {:?}", other),
    }
    assert_eq!(advisor.calls(), 1);

    // One minute later: still inside the two-minute cooldown
    h.push(96.0, 48_000.0, 2_880.0, 32.0);
    let second = h.engine.run_cycle(&account).await.unwrap();
    let CycleOutcome::Abstained(decision) = &second else {
        panic!("expected cooldown abstain, got {:?}", second);
    };
    assert!(decision.reasoning.contains("cooldown"));
    assert_eq!(advisor.calls(), 1);
    assert!(h.engine.positions().trades(&account).is_empty());
}

#[test]
fn switch_off_short_circuits_cycle() {
    let advisor = Arc::new(ScriptedAdvisor::new(Vec::new()));
    let advisor_handle = advisor.clone();
    let mut h = Harness::new(move |clock| paper_engine(advisor_handle, clock));
    h.push_asset(&[100.0, 99.0, 98.0, 97.0]);

    h.engine.set_enabled(false);
    let outcome = tokio_test::block_on(h.engine.run_cycle(&AccountId::new("paper"))).unwrap();
    assert_eq!(outcome, CycleOutcome::Disabled);
    assert_eq!(advisor.calls(), 0);
    assert!(h.engine.decisions().is_empty());
}
