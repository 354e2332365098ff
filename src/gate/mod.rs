//! Signal Combiner / Decision Gate
//!
//! Merges detector and correlator output into one action:
//! - fast path: strong bottom reversal on a fake drop buys without the advisor
//! - escalation: advisor consulted only above the account's confidence floor,
//!   on a non-HOLD suggestion, once per cooldown interval
//! - fallback: advisor failure or malformed output degrades to the
//!   deterministic suggestion at 80% of its confidence

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::advisor::{Advisor, AdvisorDecision, AdvisorRequest, MarketSummary};
use crate::config::{AccountSettings, EngineConfig};
use crate::correlator::{CombinedSignal, ManipulationType};
use crate::error::{EngineError, EngineResult};
use crate::history::MarketSnapshot;
use crate::patterns::{PatternAnalysis, PatternType};
use crate::persistence::{DecisionLog, DecisionRoute};
use crate::types::{AccountBalances, AccountId, Suggestion};

/// Bottom-reversal confidence needed for the fast path
pub const FAST_PATH_MIN_CONFIDENCE: f64 = 85.0;
/// Fallback confidence as a fraction of the adjusted confidence
pub const FALLBACK_CONFIDENCE_FACTOR: f64 = 0.8;
/// Similar past decisions passed to the advisor
pub const ADVISOR_HISTORY_LIMIT: usize = 10;
/// Recent ticks passed to the advisor
const ADVISOR_RECENT_TICKS: usize = 20;

// ─────────────────────────────────────────────────────────────────────────────
// Clock
// ─────────────────────────────────────────────────────────────────────────────

/// Wall-clock source for cooldowns
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock moved by hand, for tests and historical replay
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.write() {
            *now = to;
        }
    }

    pub fn advance(&self, by: ChronoDuration) {
        if let Ok(mut now) = self.now.write() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.read().map(|n| *n).unwrap_or_else(|_| Utc::now())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Gate
// ─────────────────────────────────────────────────────────────────────────────

/// Everything the gate looks at for one account and cycle
pub struct GateInput<'a> {
    pub account: &'a AccountId,
    pub settings: &'a AccountSettings,
    pub snapshot: &'a MarketSnapshot,
    pub analysis: &'a PatternAnalysis,
    pub signal: &'a CombinedSignal,
    pub balances: AccountBalances,
}

/// Chosen action and how it was reached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub route: DecisionRoute,
    pub action: Suggestion,
    /// Confidence attached to the action (not clamped)
    pub confidence: f64,
    /// Pattern confidence plus correlator boost (not clamped)
    pub adjusted_confidence: f64,
    /// Size override for percentage sizing
    pub size_percent: Option<f64>,
    pub reasoning: String,
}

impl GateDecision {
    /// HOLD without escalating
    pub fn abstain(adjusted_confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            route: DecisionRoute::Abstain,
            action: Suggestion::Hold,
            confidence: adjusted_confidence,
            adjusted_confidence,
            size_percent: None,
            reasoning: reasoning.into(),
        }
    }
}

/// `pattern confidence + correlator boost`, deliberately unclamped
pub fn adjusted_confidence(analysis: &PatternAnalysis, signal: &CombinedSignal) -> f64 {
    analysis.confidence + signal.confidence_boost
}

/// Bottom reversal ≥85 while the correlator flags a fake drop
pub fn is_fast_path(analysis: &PatternAnalysis, signal: &CombinedSignal) -> bool {
    signal.manipulation_type == ManipulationType::FakeDrop
        && analysis
            .get(PatternType::BottomReversal)
            .map(|p| p.confidence >= FAST_PATH_MIN_CONFIDENCE)
            .unwrap_or(false)
}

pub struct DecisionGate {
    advisor: Arc<dyn Advisor>,
    clock: Arc<dyn Clock>,
    cooldown: ChronoDuration,
    advisor_timeout: Duration,
    fast_path_size_percent: f64,
    /// Last advisor call per account
    last_advisor_call: Mutex<HashMap<AccountId, DateTime<Utc>>>,
}

impl DecisionGate {
    pub fn new(advisor: Arc<dyn Advisor>, clock: Arc<dyn Clock>, config: &EngineConfig) -> Self {
        Self {
            advisor,
            clock,
            cooldown: config.advisor_cooldown(),
            advisor_timeout: config.advisor_timeout(),
            fast_path_size_percent: config.fast_path_size_percent,
            last_advisor_call: Mutex::new(HashMap::new()),
        }
    }

    pub fn last_advisor_call(&self, account: &AccountId) -> Option<DateTime<Utc>> {
        self.last_advisor_call
            .lock()
            .ok()
            .and_then(|calls| calls.get(account).copied())
    }

    /// Cooldown elapsed; when it has, the call slot is taken immediately
    fn try_claim_advisor(&self, account: &AccountId) -> EngineResult<bool> {
        let now = self.clock.now();
        let mut calls = self.last_advisor_call.lock().map_err(|_| {
            EngineError::InvariantViolation("advisor cooldown table poisoned".to_string())
        })?;
        if let Some(last) = calls.get(account) {
            if now - *last < self.cooldown {
                return Ok(false);
            }
        }
        calls.insert(account.clone(), now);
        Ok(true)
    }

    pub async fn decide(
        &self,
        input: GateInput<'_>,
        decisions: &dyn DecisionLog,
    ) -> EngineResult<GateDecision> {
        let analysis = input.analysis;
        let signal = input.signal;
        let min_confidence = input.settings.min_confidence;
        let adjusted = adjusted_confidence(analysis, signal);

        if is_fast_path(analysis, signal) {
            info!(
                account = %input.account,
                adjusted_confidence = adjusted,
                "⚡ Fast path: bottom reversal on fake drop, buying without advisor"
            );
            return Ok(GateDecision {
                route: DecisionRoute::FastPath,
                action: Suggestion::Buy,
                confidence: adjusted,
                adjusted_confidence: adjusted,
                size_percent: Some(self.fast_path_size_percent),
                reasoning: "bottom reversal confirmed by fake drop".to_string(),
            });
        }

        if !analysis.has_patterns() {
            return Ok(GateDecision::abstain(adjusted, "no pattern detected"));
        }
        if adjusted < min_confidence {
            return Ok(GateDecision::abstain(
                adjusted,
                format!("confidence {:.1} below minimum {:.0}", adjusted, min_confidence),
            ));
        }
        if analysis.suggestion == Suggestion::Hold {
            return Ok(GateDecision::abstain(adjusted, "detector suggests HOLD"));
        }
        if !self.try_claim_advisor(input.account)? {
            debug!(account = %input.account, "Advisor cooldown active");
            return Ok(GateDecision::abstain(adjusted, "advisor cooldown active"));
        }

        let request = AdvisorRequest {
            account_id: input.account.to_string(),
            market_snapshot: MarketSummary {
                price: input.snapshot.latest_price().unwrap_or_default(),
                recent_ticks: input
                    .snapshot
                    .ticks
                    .iter()
                    .take(ADVISOR_RECENT_TICKS)
                    .cloned()
                    .collect(),
            },
            pattern_analysis: analysis.clone(),
            correlator_signal: signal.clone(),
            account_balances: input.balances,
            adjusted_confidence: adjusted,
            min_confidence,
            max_loss_percent: input.settings.max_loss_percent,
            history: decisions.similar(&analysis.pattern_types(), ADVISOR_HISTORY_LIMIT),
        };

        info!(
            account = %input.account,
            advisor = self.advisor.name(),
            suggestion = %analysis.suggestion,
            adjusted_confidence = adjusted,
            "🧠 Escalating to advisor"
        );

        let raw = match tokio::time::timeout(self.advisor_timeout, self.advisor.advise(&request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout {
                collaborator: "advisor",
                after_ms: self.advisor_timeout.as_millis() as u64,
            }),
        };

        let validated = raw.and_then(|value| AdvisorDecision::from_value(&value));
        match validated {
            Ok(decision) if decision.is_usable() => {
                Ok(self.accept_advice(input.account, decision, adjusted, min_confidence))
            }
            Ok(decision) => {
                warn!(
                    account = %input.account,
                    fields = ?decision.defaulted_fields,
                    "⚠️ Advisor output unusable, using fallback"
                );
                Ok(fallback(analysis, adjusted, "advisor output unusable"))
            }
            Err(e) => {
                warn!(account = %input.account, error = %e, "⚠️ Advisor failed, using fallback");
                Ok(fallback(analysis, adjusted, &format!("advisor failed: {}", e)))
            }
        }
    }

    fn accept_advice(
        &self,
        account: &AccountId,
        decision: AdvisorDecision,
        adjusted: f64,
        min_confidence: f64,
    ) -> GateDecision {
        let action = if decision.action != Suggestion::Hold && decision.confidence >= min_confidence
        {
            decision.action
        } else {
            Suggestion::Hold
        };
        let size_percent = if decision.defaulted_fields.contains(&"sizePercent") {
            None
        } else {
            Some(decision.size_percent)
        };

        info!(
            account = %account,
            advised = %decision.action,
            action = %action,
            confidence = decision.confidence,
            "🧠 Advisor decision"
        );

        GateDecision {
            route: DecisionRoute::Advisor,
            action,
            confidence: decision.confidence,
            adjusted_confidence: adjusted,
            size_percent,
            reasoning: decision.reasoning,
        }
    }
}

/// Detector suggestion at 80% of the adjusted confidence; the escalation
/// threshold was already cleared, so it is not applied a second time
fn fallback(analysis: &PatternAnalysis, adjusted: f64, reason: &str) -> GateDecision {
    let confidence = adjusted * FALLBACK_CONFIDENCE_FACTOR;
    GateDecision {
        route: DecisionRoute::Fallback,
        action: analysis.suggestion,
        confidence,
        adjusted_confidence: adjusted,
        size_percent: None,
        reasoning: format!("{}; deterministic {} at {:.1}", reason, analysis.suggestion, confidence),
    }
}
