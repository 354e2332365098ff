//! Individual factor scorers
//!
//! Every scorer needs at least [`MIN_FACTOR_SAMPLES`] samples in its window and
//! otherwise returns a neutral 50 flagged as insufficient data.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::EngineError;
use crate::types::{percent_change, MarketDirection, PriceTick, ReferencePrice};

/// Samples required by each factor
pub const MIN_FACTOR_SAMPLES: usize = 3;

pub const PRIMARY_REFERENCE_WEIGHT: u32 = 35;
pub const SECONDARY_REFERENCE_WEIGHT: u32 = 20;
pub const CURRENCY_IMPACT_WEIGHT: u32 = 25;
pub const MANIPULATION_WEIGHT: u32 = 20;

const _: () = assert!(
    PRIMARY_REFERENCE_WEIGHT + SECONDARY_REFERENCE_WEIGHT + CURRENCY_IMPACT_WEIGHT + MANIPULATION_WEIGHT
        == 100
);

const NEUTRAL_SCORE: f64 = 50.0;

/// Reference change (abs %) that makes the primary reference directional
pub const PRIMARY_DIRECTION_THRESHOLD: f64 = 0.1;
/// Reference change (abs %) that makes the secondary reference directional
pub const SECONDARY_DIRECTION_THRESHOLD: f64 = 0.15;

/// Exchange-rate change (abs %) that makes the currency factor directional
const CURRENCY_THRESHOLD: f64 = 0.2;
/// Rate and asset must both exceed this (abs %) to flag a currency-driven move
const CURRENCY_DRIVEN_THRESHOLD: f64 = 0.1;

/// Absolute per-tick change that counts toward a manipulation run
const MANIPULATION_TICK_THRESHOLD: f64 = 0.05;
const MANIPULATION_MIN_RUN: usize = 3;
/// Single-tick percent move treated as manipulation under a stable market
const MANIPULATION_SINGLE_MOVE_PERCENT: f64 = 0.3;

/// The four fixed factors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FactorName {
    PrimaryReference,
    SecondaryReference,
    CurrencyImpact,
    Manipulation,
}

impl FactorName {
    pub fn weight(&self) -> u32 {
        match self {
            FactorName::PrimaryReference => PRIMARY_REFERENCE_WEIGHT,
            FactorName::SecondaryReference => SECONDARY_REFERENCE_WEIGHT,
            FactorName::CurrencyImpact => CURRENCY_IMPACT_WEIGHT,
            FactorName::Manipulation => MANIPULATION_WEIGHT,
        }
    }
}

impl fmt::Display for FactorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactorName::PrimaryReference => write!(f, "PRIMARY_REFERENCE"),
            FactorName::SecondaryReference => write!(f, "SECONDARY_REFERENCE"),
            FactorName::CurrencyImpact => write!(f, "CURRENCY_IMPACT"),
            FactorName::Manipulation => write!(f, "MANIPULATION"),
        }
    }
}

/// Outcome of one factor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorScore {
    pub factor: FactorName,
    /// 0-100
    pub score: f64,
    pub direction: MarketDirection,
    pub weight: f64,
    pub description: String,
    /// Scored neutral because the window held too few samples
    pub insufficient_data: bool,
}

impl FactorScore {
    fn new(factor: FactorName, score: f64, direction: MarketDirection, description: String) -> Self {
        Self {
            factor,
            score: score.clamp(0.0, 100.0),
            direction,
            weight: factor.weight() as f64,
            description,
            insufficient_data: false,
        }
    }

    pub fn insufficient(factor: FactorName, available: usize) -> Self {
        Self {
            factor,
            score: NEUTRAL_SCORE,
            direction: MarketDirection::Neutral,
            weight: factor.weight() as f64,
            description: EngineError::DataInsufficient {
                needed: MIN_FACTOR_SAMPLES,
                available,
            }
            .to_string(),
            insufficient_data: true,
        }
    }
}

/// Kind of single-venue manipulation identified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManipulationType {
    FakeDrop,
    FakeRise,
    #[default]
    None,
}

impl fmt::Display for ManipulationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManipulationType::FakeDrop => write!(f, "FAKE_DROP"),
            ManipulationType::FakeRise => write!(f, "FAKE_RISE"),
            ManipulationType::None => write!(f, "NONE"),
        }
    }
}

/// Ratio of the smaller to the larger move, negative when directions differ
pub fn signed_correlation(a: f64, b: f64) -> f64 {
    let (abs_a, abs_b) = (a.abs(), b.abs());
    let max = abs_a.max(abs_b);
    if max == 0.0 {
        return 0.0;
    }
    let ratio = abs_a.min(abs_b) / max;
    if a.signum() == b.signum() {
        ratio
    } else {
        -ratio
    }
}

fn asset_change(ticks: &[PriceTick]) -> f64 {
    match (ticks.last(), ticks.first()) {
        (Some(oldest), Some(newest)) if ticks.len() >= 2 => {
            percent_change(oldest.value, newest.value)
        }
        _ => 0.0,
    }
}

fn reference_change(samples: &[ReferencePrice]) -> f64 {
    match (samples.last(), samples.first()) {
        (Some(oldest), Some(newest)) if samples.len() >= 2 => {
            percent_change(oldest.value, newest.value)
        }
        _ => 0.0,
    }
}

/// Score how the asset moves relative to a reference instrument
pub fn score_reference(
    factor: FactorName,
    reference: &[ReferencePrice],
    ticks: &[PriceTick],
    threshold: f64,
) -> FactorScore {
    let available = reference.len().min(ticks.len());
    if available < MIN_FACTOR_SAMPLES {
        return FactorScore::insufficient(factor, available);
    }

    let ref_change = reference_change(reference);
    let asset = asset_change(ticks);
    let correlation = signed_correlation(ref_change, asset);

    let (score, direction) = if ref_change > threshold {
        let score = if asset > 0.0 {
            80.0 // asset confirms
        } else if asset < 0.0 {
            60.0 // asset diverges
        } else {
            70.0
        };
        (score, MarketDirection::Bullish)
    } else if ref_change < -threshold {
        let score = if asset < 0.0 {
            20.0
        } else if asset > 0.0 {
            40.0
        } else {
            30.0
        };
        (score, MarketDirection::Bearish)
    } else {
        (NEUTRAL_SCORE, MarketDirection::Neutral)
    };

    FactorScore::new(
        factor,
        score,
        direction,
        format!(
            "reference {:+.3}% vs asset {:+.3}% (corr {:+.2})",
            ref_change, asset, correlation
        ),
    )
}

/// Score the exchange-rate impact; also reports whether the move looks currency-driven
pub fn score_currency(rate: &[ReferencePrice], ticks: &[PriceTick]) -> (FactorScore, bool) {
    if rate.len() < MIN_FACTOR_SAMPLES {
        return (
            FactorScore::insufficient(FactorName::CurrencyImpact, rate.len()),
            false,
        );
    }

    let rate_change = reference_change(rate);
    let asset = asset_change(ticks);

    let currency_driven = rate_change.abs() > CURRENCY_DRIVEN_THRESHOLD
        && asset.abs() > CURRENCY_DRIVEN_THRESHOLD
        && rate_change.signum() == asset.signum();

    let (score, direction) = if rate_change > CURRENCY_THRESHOLD {
        (70.0, MarketDirection::Bullish)
    } else if rate_change < -CURRENCY_THRESHOLD {
        (35.0, MarketDirection::Bearish)
    } else {
        (NEUTRAL_SCORE, MarketDirection::Neutral)
    };

    let mut description = format!("rate {:+.3}%", rate_change);
    if currency_driven {
        description.push_str(", currency-driven");
    }

    (
        FactorScore::new(FactorName::CurrencyImpact, score, direction, description),
        currency_driven,
    )
}

/// Longest stretch of consecutive ticks whose delta satisfies `pred`
fn longest_run(ticks: &[PriceTick], pred: impl Fn(f64) -> bool) -> usize {
    let mut longest = 0;
    let mut current = 0;
    for t in ticks {
        if pred(t.delta_from_prev) {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    longest
}

/// Look for uncorroborated runs anywhere in the scanned ticks
pub fn score_manipulation(
    ticks: &[PriceTick],
    primary: &FactorScore,
    secondary: &FactorScore,
) -> (FactorScore, ManipulationType) {
    if ticks.len() < MIN_FACTOR_SAMPLES {
        return (
            FactorScore::insufficient(FactorName::Manipulation, ticks.len()),
            ManipulationType::None,
        );
    }

    // Both references must be measurable and flat
    let market_stable = !primary.insufficient_data
        && !secondary.insufficient_data
        && primary.direction == MarketDirection::Neutral
        && secondary.direction == MarketDirection::Neutral;

    let drops = longest_run(ticks, |d| d < -MANIPULATION_TICK_THRESHOLD);
    let rises = longest_run(ticks, |d| d > MANIPULATION_TICK_THRESHOLD);
    let newest_move = ticks[0].percent_delta;

    if market_stable && drops >= MANIPULATION_MIN_RUN {
        return (
            FactorScore::new(
                FactorName::Manipulation,
                80.0,
                MarketDirection::Bullish,
                format!("{} uncorroborated drops, expect reversion", drops),
            ),
            ManipulationType::FakeDrop,
        );
    }

    if market_stable && rises >= MANIPULATION_MIN_RUN && primary.direction != MarketDirection::Bullish
    {
        return (
            FactorScore::new(
                FactorName::Manipulation,
                25.0,
                MarketDirection::Bearish,
                format!("{} uncorroborated rises", rises),
            ),
            ManipulationType::FakeRise,
        );
    }

    if market_stable && newest_move.abs() > MANIPULATION_SINGLE_MOVE_PERCENT {
        return if newest_move < 0.0 {
            (
                FactorScore::new(
                    FactorName::Manipulation,
                    70.0,
                    MarketDirection::Bullish,
                    format!("single uncorroborated drop of {:.3}%", newest_move.abs()),
                ),
                ManipulationType::FakeDrop,
            )
        } else {
            (
                FactorScore::new(
                    FactorName::Manipulation,
                    35.0,
                    MarketDirection::Bearish,
                    format!("single uncorroborated rise of {:.3}%", newest_move),
                ),
                ManipulationType::FakeRise,
            )
        };
    }

    (
        FactorScore::new(
            FactorName::Manipulation,
            NEUTRAL_SCORE,
            MarketDirection::Neutral,
            "no manipulation run".to_string(),
        ),
        ManipulationType::None,
    )
}
