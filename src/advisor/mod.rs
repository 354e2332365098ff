//! Advisor collaborator
//!
//! The advisor is an external, probabilistic decision maker. Its output is
//! never trusted: every field is validated and replaced by a safe default
//! (HOLD, confidence 0) when missing or out of range.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use crate::correlator::CombinedSignal;
use crate::error::{EngineError, EngineResult};
use crate::patterns::PatternAnalysis;
use crate::persistence::DecisionRecord;
use crate::types::{AccountBalances, PriceTick, Suggestion};

/// Advisor size suggestion used when the field is missing or invalid
pub const DEFAULT_SIZE_PERCENT: f64 = 5.0;

/// Market data shown to the advisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSummary {
    pub price: f64,
    /// Newest-first recent ticks
    pub recent_ticks: Vec<PriceTick>,
}

/// Everything the advisor receives for one decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisorRequest {
    pub account_id: String,
    pub market_snapshot: MarketSummary,
    pub pattern_analysis: PatternAnalysis,
    pub correlator_signal: CombinedSignal,
    pub account_balances: AccountBalances,
    /// Pattern confidence after the correlator boost
    pub adjusted_confidence: f64,
    pub min_confidence: f64,
    pub max_loss_percent: f64,
    /// Similar past decisions, read-only context
    pub history: Vec<DecisionRecord>,
}

/// Validated advisor answer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdvisorDecision {
    pub action: Suggestion,
    /// 0-100
    pub confidence: f64,
    /// 1-100
    pub size_percent: f64,
    pub reasoning: String,
    pub expected_outcome: String,
    /// Names of fields that were missing or malformed
    pub defaulted_fields: Vec<&'static str>,
}

impl AdvisorDecision {
    /// The decision fields that matter for trading were both usable
    pub fn is_usable(&self) -> bool {
        !self
            .defaulted_fields
            .iter()
            .any(|f| *f == "action" || *f == "confidence")
    }

    /// Validate raw advisor output field by field
    pub fn from_value(value: &Value) -> EngineResult<Self> {
        let obj = value.as_object().ok_or_else(|| {
            EngineError::Validation("advisor response is not a JSON object".to_string())
        })?;

        let mut defaulted = Vec::new();

        let action = match obj
            .get("action")
            .and_then(Value::as_str)
            .and_then(Suggestion::from_str)
        {
            Some(a) => a,
            None => {
                defaulted.push("action");
                Suggestion::Hold
            }
        };

        let confidence = match obj.get("confidence").and_then(Value::as_f64) {
            Some(c) if (0.0..=100.0).contains(&c) => c,
            _ => {
                defaulted.push("confidence");
                0.0
            }
        };

        let size_percent = match obj
            .get("sizePercent")
            .or_else(|| obj.get("size_percent"))
            .and_then(Value::as_f64)
        {
            Some(s) if s.is_finite() && s > 0.0 => s.clamp(1.0, 100.0),
            _ => {
                defaulted.push("sizePercent");
                DEFAULT_SIZE_PERCENT
            }
        };

        let reasoning = match obj.get("reasoning").and_then(Value::as_str) {
            Some(r) => r.to_string(),
            None => {
                defaulted.push("reasoning");
                String::new()
            }
        };

        let expected_outcome = match obj
            .get("expectedOutcome")
            .or_else(|| obj.get("expected_outcome"))
            .and_then(Value::as_str)
        {
            Some(e) => e.to_string(),
            None => {
                defaulted.push("expectedOutcome");
                String::new()
            }
        };

        if !defaulted.is_empty() {
            warn!(fields = ?defaulted, "⚠️ Advisor response had missing/malformed fields");
        }

        Ok(Self {
            action,
            confidence,
            size_percent,
            reasoning,
            expected_outcome,
            defaulted_fields: defaulted,
        })
    }
}

/// External advisor
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Advisor: Send + Sync {
    /// Advisor name for logging
    fn name(&self) -> &'static str;

    /// Ask for a decision; raw output is validated by the caller
    async fn advise(&self, request: &AdvisorRequest) -> EngineResult<Value>;
}

/// Advisor that is never available; every escalation degrades to the fallback
#[derive(Debug, Clone, Default)]
pub struct DisabledAdvisor;

#[async_trait]
impl Advisor for DisabledAdvisor {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn advise(&self, _request: &AdvisorRequest) -> EngineResult<Value> {
        Err(EngineError::ExternalCall {
            collaborator: "advisor",
            message: "no advisor configured".to_string(),
        })
    }
}

/// Advisor reached over HTTP: POSTs the request as JSON, expects a JSON object back
pub struct HttpAdvisor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAdvisor {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build advisor HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Advisor for HttpAdvisor {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn advise(&self, request: &AdvisorRequest) -> EngineResult<Value> {
        let external = |e: reqwest::Error| EngineError::ExternalCall {
            collaborator: "advisor",
            message: e.to_string(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(external)?;

        if !response.status().is_success() {
            return Err(EngineError::ExternalCall {
                collaborator: "advisor",
                message: format!("HTTP {}", response.status()),
            });
        }

        response.json::<Value>().await.map_err(external)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn well_formed_response_passes() {
        let value = json!({
            "action": "buy",
            "confidence": 82.5,
            "sizePercent": 10,
            "reasoning": "bottom reversal with fake drop",
            "expectedOutcome": "+0.5% within 10 minutes"
        });
        let decision = AdvisorDecision::from_value(&value).unwrap();
        assert_eq!(decision.action, Suggestion::Buy);
        assert_eq!(decision.confidence, 82.5);
        assert_eq!(decision.size_percent, 10.0);
        assert!(decision.defaulted_fields.is_empty());
        assert!(decision.is_usable());
    }

    #[test]
    fn malformed_fields_fall_back_to_safe_defaults() {
        let value = json!({
            "action": "YOLO",
            "confidence": 250,
            "sizePercent": -3,
        });
        let decision = AdvisorDecision::from_value(&value).unwrap();
        assert_eq!(decision.action, Suggestion::Hold);
        assert_eq!(decision.confidence, 0.0);
        assert_eq!(decision.size_percent, DEFAULT_SIZE_PERCENT);
        assert!(!decision.is_usable());
        assert!(decision.defaulted_fields.contains(&"reasoning"));
    }

    #[test]
    fn oversized_percent_is_clamped() {
        let value = json!({"action": "SELL", "confidence": 90, "sizePercent": 400});
        let decision = AdvisorDecision::from_value(&value).unwrap();
        assert_eq!(decision.size_percent, 100.0);
        assert!(decision.is_usable());
    }

    #[test]
    fn non_object_is_rejected() {
        let err = AdvisorDecision::from_value(&json!("BUY")).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn disabled_advisor_always_fails() {
        let request = AdvisorRequest {
            account_id: "a".to_string(),
            market_snapshot: MarketSummary {
                price: 1.0,
                recent_ticks: Vec::new(),
            },
            pattern_analysis: crate::patterns::PatternDetector::default().analyze_window(&[], &[]),
            correlator_signal: CombinedSignal {
                overall_score: 50.0,
                market_direction: Default::default(),
                is_manipulated: false,
                manipulation_type: Default::default(),
                confidence_boost: 0.0,
                currency_driven: false,
                factors: Vec::new(),
            },
            account_balances: AccountBalances::default(),
            adjusted_confidence: 0.0,
            min_confidence: 70.0,
            max_loss_percent: 10.0,
            history: Vec::new(),
        };
        let err = DisabledAdvisor.advise(&request).await.unwrap_err();
        assert!(matches!(err, EngineError::ExternalCall { .. }));
    }
}
