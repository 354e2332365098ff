//! Multi-Factor Correlator
//!
//! Separates organic market movement from single-venue manipulation by scoring
//! the asset against independent references:
//! - Primary reference correlation (35)
//! - Secondary reference correlation (20)
//! - Currency / exchange-rate impact (25)
//! - Manipulation-run detection (20)
//!
//! Weights are fixed and sum to 100. Factors short on data score a neutral 50
//! and never fail the cycle.

pub mod factors;

pub use factors::{
    signed_correlation, FactorName, FactorScore, ManipulationType, MIN_FACTOR_SAMPLES,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::CorrelatorConfig;
use crate::error::{EngineError, EngineResult};
use crate::history::MarketSnapshot;
use crate::types::{MarketDirection, ReferenceInstrument};

use factors::{
    score_currency, score_manipulation, score_reference, PRIMARY_DIRECTION_THRESHOLD,
    SECONDARY_DIRECTION_THRESHOLD,
};

/// Combined score at or above this is bullish
const BULLISH_THRESHOLD: f64 = 60.0;
/// Combined score at or below this is bearish
const BEARISH_THRESHOLD: f64 = 40.0;
/// Confidence boost when a drop looks fake (expect reversion upward)
pub const FAKE_DROP_BOOST: f64 = 20.0;
/// Confidence penalty when a rise looks fake
pub const FAKE_RISE_BOOST: f64 = -15.0;

/// Correlator output for one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedSignal {
    /// Weighted mean of factor scores (0-100)
    pub overall_score: f64,
    pub market_direction: MarketDirection,
    pub is_manipulated: bool,
    pub manipulation_type: ManipulationType,
    /// Added to the pattern confidence by the decision gate
    pub confidence_boost: f64,
    /// Exchange rate and asset moved together
    pub currency_driven: bool,
    pub factors: Vec<FactorScore>,
}

impl CombinedSignal {
    pub fn factor(&self, name: FactorName) -> Option<&FactorScore> {
        self.factors.iter().find(|f| f.factor == name)
    }
}

/// Merge factor scores into a combined signal
pub fn combine(
    factors: Vec<FactorScore>,
    manipulation_type: ManipulationType,
    currency_driven: bool,
) -> EngineResult<CombinedSignal> {
    let total_weight: f64 = factors.iter().map(|f| f.weight).sum();
    if (total_weight - 100.0).abs() > f64::EPSILON {
        error!(total_weight, "🚨 Factor weights do not sum to 100");
        return Err(EngineError::InvariantViolation(format!(
            "factor weights sum to {} instead of 100",
            total_weight
        )));
    }

    let overall_score =
        (factors.iter().map(|f| f.score * f.weight).sum::<f64>() / total_weight).clamp(0.0, 100.0);

    let market_direction = if overall_score >= BULLISH_THRESHOLD {
        MarketDirection::Bullish
    } else if overall_score <= BEARISH_THRESHOLD {
        MarketDirection::Bearish
    } else {
        MarketDirection::Neutral
    };

    let confidence_boost = match manipulation_type {
        ManipulationType::FakeDrop => FAKE_DROP_BOOST,
        ManipulationType::FakeRise => FAKE_RISE_BOOST,
        ManipulationType::None => 0.0,
    };

    Ok(CombinedSignal {
        overall_score,
        market_direction,
        is_manipulated: manipulation_type != ManipulationType::None,
        manipulation_type,
        confidence_boost,
        currency_driven,
        factors,
    })
}

/// Scores the asset against reference instruments
#[derive(Debug, Clone)]
pub struct MultiFactorCorrelator {
    window_minutes: i64,
    manipulation_scan_ticks: usize,
}

impl MultiFactorCorrelator {
    pub fn new(config: &CorrelatorConfig) -> Self {
        Self {
            window_minutes: config.window_minutes,
            manipulation_scan_ticks: config.manipulation_scan_ticks,
        }
    }

    /// Evaluate all four factors over the snapshot
    pub fn evaluate(&self, snapshot: &MarketSnapshot) -> EngineResult<CombinedSignal> {
        let ticks = snapshot.ticks_within(self.window_minutes, usize::MAX);

        let primary = score_reference(
            FactorName::PrimaryReference,
            snapshot.references_within(ReferenceInstrument::Primary, self.window_minutes),
            ticks,
            PRIMARY_DIRECTION_THRESHOLD,
        );
        let secondary = score_reference(
            FactorName::SecondaryReference,
            snapshot.references_within(ReferenceInstrument::Secondary, self.window_minutes),
            ticks,
            SECONDARY_DIRECTION_THRESHOLD,
        );
        let (currency, currency_driven) = score_currency(
            snapshot.references_within(ReferenceInstrument::ExchangeRate, self.window_minutes),
            ticks,
        );

        let scan = &ticks[..ticks.len().min(self.manipulation_scan_ticks)];
        let (manipulation, manipulation_type) = score_manipulation(scan, &primary, &secondary);

        for f in [&primary, &secondary, &currency, &manipulation] {
            debug!(
                factor = %f.factor,
                score = f.score,
                direction = %f.direction,
                "{}",
                f.description
            );
        }

        combine(
            vec![primary, secondary, currency, manipulation],
            manipulation_type,
            currency_driven,
        )
    }
}

impl Default for MultiFactorCorrelator {
    fn default() -> Self {
        Self::new(&CorrelatorConfig::default())
    }
}
