//! Per-account trading settings

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Lowest accepted `min_confidence`
pub const MIN_CONFIDENCE_FLOOR: f64 = 50.0;
/// Highest accepted `min_confidence`
pub const MIN_CONFIDENCE_CEILING: f64 = 100.0;

/// How trade quantity is computed when no session quantity is tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TradeMode {
    /// Percentage of the relevant balance
    #[default]
    Percentage,
    /// Configured absolute quantity
    Fixed,
}

/// Settings governing one account's trading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSettings {
    /// Minimum adjusted confidence for advisor escalation (50-100)
    pub min_confidence: f64,
    pub trade_mode: TradeMode,
    /// Percent of balance per trade in percentage mode (clamped to 1-100)
    pub trade_percent: f64,
    /// Asset quantity per trade in fixed mode
    pub fixed_quantity: f64,
    /// Flat fee per executed leg (0.01 = 1%)
    pub fee_rate: f64,
    /// Trades below this quote value are rejected before execution
    pub min_trade_value: f64,
    pub auto_trading_enabled: bool,
    /// Carried through to the advisor context; no stop-loss path reads it
    pub max_loss_percent: f64,
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self {
            min_confidence: 70.0,
            trade_mode: TradeMode::Percentage,
            trade_percent: 5.0,
            fixed_quantity: 0.001,
            fee_rate: 0.01,
            min_trade_value: 10.0,
            auto_trading_enabled: true,
            max_loss_percent: 10.0,
        }
    }
}

impl AccountSettings {
    /// Check ranges; `trade_percent` is clamped rather than rejected
    pub fn validate(mut self) -> EngineResult<Self> {
        if !(MIN_CONFIDENCE_FLOOR..=MIN_CONFIDENCE_CEILING).contains(&self.min_confidence) {
            return Err(EngineError::Config(format!(
                "min_confidence {:.1} outside [{:.0}, {:.0}]",
                self.min_confidence, MIN_CONFIDENCE_FLOOR, MIN_CONFIDENCE_CEILING
            )));
        }
        if !(0.0..1.0).contains(&self.fee_rate) {
            return Err(EngineError::Config(format!(
                "fee_rate {} must be in [0, 1)",
                self.fee_rate
            )));
        }
        if self.trade_mode == TradeMode::Fixed && self.fixed_quantity <= 0.0 {
            return Err(EngineError::Config(
                "fixed_quantity must be positive in fixed mode".to_string(),
            ));
        }
        if self.min_trade_value < 0.0 {
            return Err(EngineError::Config(
                "min_trade_value cannot be negative".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.max_loss_percent) {
            return Err(EngineError::Config(format!(
                "max_loss_percent {} outside [0, 100]",
                self.max_loss_percent
            )));
        }
        self.trade_percent = self.trade_percent.clamp(1.0, 100.0);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = AccountSettings::default().validate().unwrap();
        assert_eq!(settings.min_confidence, 70.0);
        assert_eq!(settings.trade_percent, 5.0);
    }

    #[test]
    fn min_confidence_range_is_enforced() {
        let low = AccountSettings {
            min_confidence: 45.0,
            ..Default::default()
        };
        assert!(low.validate().is_err());

        let high = AccountSettings {
            min_confidence: 100.5,
            ..Default::default()
        };
        assert!(high.validate().is_err());
    }

    #[test]
    fn trade_percent_is_clamped() {
        let settings = AccountSettings {
            trade_percent: 250.0,
            ..Default::default()
        }
        .validate()
        .unwrap();
        assert_eq!(settings.trade_percent, 100.0);

        let settings = AccountSettings {
            trade_percent: 0.2,
            ..Default::default()
        }
        .validate()
        .unwrap();
        assert_eq!(settings.trade_percent, 1.0);
    }
}
