//! Short-term Pattern Detector
//!
//! Scans the newest-first tick window for named shapes:
//! - Consecutive drop/rise runs
//! - Single-tick shocks (sudden drop / spike)
//! - Cross-venue divergence (manipulation vs market-driven)
//! - Recovery after a dip
//! - Bottom reversal (run of drops followed by an uptick)
//!
//! Thresholds are fixed constants. The detector holds no mutable state, so
//! analyzing the same snapshot twice always yields the same result.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::config::PatternsConfig;
use crate::history::MarketSnapshot;
use crate::types::{percent_change, PriceTick, ReferenceInstrument, ReferencePrice, Suggestion};

// ─────────────────────────────────────────────────────────────────
// Thresholds
// ─────────────────────────────────────────────────────────────────

/// Minimum same-sign run length
const RUN_MIN_LEN: usize = 2;
/// Newest-tick percent move that counts as a shock
const SHOCK_PERCENT: f64 = 0.2;
/// Reference change below this (abs %) is considered stable
const REFERENCE_STABLE_PERCENT: f64 = 0.15;
/// Asset change above this (abs %) is considered a move
const ASSET_MOVED_PERCENT: f64 = 0.25;
/// Fixed confidence of a market-driven move
const MARKET_DRIVEN_CONFIDENCE: f64 = 60.0;
/// Recovery must retrace more than this percent of the dip
const RECOVERY_MIN_PERCENT: f64 = 50.0;
/// Minimum drops before the uptick for a bottom reversal
const BOTTOM_MIN_DROPS: usize = 3;
/// Upper bound for most pattern confidences
const CONFIDENCE_CAP: f64 = 95.0;
const RECOVERY_CONFIDENCE_CAP: f64 = 85.0;
/// Baseline confidence cap when nothing fires
const BASELINE_CAP: f64 = 25.0;

/// Closed set of detectable shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatternType {
    ConsecutiveDrops,
    ConsecutiveRises,
    SuddenDrop,
    SuddenSpike,
    /// Asset moved while the primary reference stayed flat
    Manipulation,
    /// Asset moved together with the primary reference
    MarketDriven,
    Recovery,
    BottomReversal,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::ConsecutiveDrops => "CONSECUTIVE_DROPS",
            PatternType::ConsecutiveRises => "CONSECUTIVE_RISES",
            PatternType::SuddenDrop => "SUDDEN_DROP",
            PatternType::SuddenSpike => "SUDDEN_SPIKE",
            PatternType::Manipulation => "MANIPULATION",
            PatternType::MarketDriven => "MARKET_DRIVEN",
            PatternType::Recovery => "RECOVERY",
            PatternType::BottomReversal => "BOTTOM_REVERSAL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim() {
            "CONSECUTIVE_DROPS" => Some(PatternType::ConsecutiveDrops),
            "CONSECUTIVE_RISES" => Some(PatternType::ConsecutiveRises),
            "SUDDEN_DROP" => Some(PatternType::SuddenDrop),
            "SUDDEN_SPIKE" => Some(PatternType::SuddenSpike),
            "MANIPULATION" => Some(PatternType::Manipulation),
            "MARKET_DRIVEN" => Some(PatternType::MarketDriven),
            "RECOVERY" => Some(PatternType::Recovery),
            "BOTTOM_REVERSAL" => Some(PatternType::BottomReversal),
            _ => None,
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A shape found in the current window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedPattern {
    pub pattern_type: PatternType,
    /// 0-100
    pub confidence: f64,
    pub description: String,
}

impl DetectedPattern {
    fn new(pattern_type: PatternType, confidence: f64, description: String) -> Self {
        Self {
            pattern_type,
            confidence: confidence.clamp(0.0, 100.0),
            description,
        }
    }
}

/// Detector output for one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternAnalysis {
    pub patterns: Vec<DetectedPattern>,
    pub suggestion: Suggestion,
    /// Overall confidence (0-100)
    pub confidence: f64,
    /// Ticks that were inside the lookback window
    pub data_points: usize,
}

impl PatternAnalysis {
    pub fn has_patterns(&self) -> bool {
        !self.patterns.is_empty()
    }

    pub fn has(&self, pattern_type: PatternType) -> bool {
        self.patterns.iter().any(|p| p.pattern_type == pattern_type)
    }

    pub fn get(&self, pattern_type: PatternType) -> Option<&DetectedPattern> {
        self.patterns.iter().find(|p| p.pattern_type == pattern_type)
    }

    pub fn pattern_types(&self) -> Vec<PatternType> {
        self.patterns.iter().map(|p| p.pattern_type).collect()
    }
}

/// Pattern detector over a fixed lookback
#[derive(Debug, Clone)]
pub struct PatternDetector {
    lookback_minutes: i64,
    max_records: usize,
}

impl PatternDetector {
    pub fn new(config: &PatternsConfig) -> Self {
        Self {
            lookback_minutes: config.lookback_minutes,
            max_records: config.max_records,
        }
    }

    /// Analyze the asset window of a snapshot against its primary reference.
    /// The reference is cut to the span the asset ticks actually cover, which
    /// is shorter than the lookback when `max_records` truncates the ticks.
    pub fn analyze(&self, snapshot: &MarketSnapshot) -> PatternAnalysis {
        let ticks = snapshot.ticks_within(self.lookback_minutes, self.max_records);
        let reference =
            snapshot.references_within(ReferenceInstrument::Primary, self.lookback_minutes);
        let reference = match ticks.last() {
            Some(oldest) => {
                let n = reference
                    .iter()
                    .take_while(|r| r.timestamp >= oldest.timestamp)
                    .count();
                &reference[..n]
            }
            None => &reference[..0],
        };
        self.analyze_window(ticks, reference)
    }

    /// Analyze explicit newest-first windows
    pub fn analyze_window(
        &self,
        ticks: &[PriceTick],
        reference: &[ReferencePrice],
    ) -> PatternAnalysis {
        let mut patterns = Vec::new();

        if let Some(p) = detect_consecutive_run(ticks) {
            patterns.push(p);
        }
        if let Some(p) = detect_shock(ticks) {
            patterns.push(p);
        }
        if let Some(p) = detect_divergence(ticks, reference) {
            patterns.push(p);
        }
        if let Some(p) = detect_recovery(ticks) {
            patterns.push(p);
        }
        if let Some(p) = detect_bottom_reversal(ticks) {
            patterns.push(p);
        }

        for p in &patterns {
            debug!(pattern = %p.pattern_type, confidence = p.confidence, "{}", p.description);
        }

        let suggestion = resolve_suggestion(&patterns);
        let confidence = overall_confidence(&patterns, ticks.len());

        PatternAnalysis {
            patterns,
            suggestion,
            confidence,
            data_points: ticks.len(),
        }
    }
}

impl Default for PatternDetector {
    fn default() -> Self {
        Self::new(&PatternsConfig::default())
    }
}

// ─────────────────────────────────────────────────────────────────
// Individual detectors
// ─────────────────────────────────────────────────────────────────

/// Run of same-sign deltas from the newest tick backward
fn detect_consecutive_run(ticks: &[PriceTick]) -> Option<DetectedPattern> {
    let newest = ticks.first()?;
    if newest.delta_from_prev == 0.0 {
        return None;
    }
    let falling = newest.delta_from_prev < 0.0;

    let run: Vec<&PriceTick> = ticks
        .iter()
        .take_while(|t| {
            if falling {
                t.delta_from_prev < 0.0
            } else {
                t.delta_from_prev > 0.0
            }
        })
        .collect();

    let count = run.len();
    if count < RUN_MIN_LEN {
        return None;
    }

    let magnitude: f64 = run.iter().map(|t| t.percent_delta.abs()).sum();
    let confidence = (40.0 + count as f64 * 15.0 + magnitude * 5.0).min(CONFIDENCE_CAP);

    let (pattern_type, label) = if falling {
        (PatternType::ConsecutiveDrops, "drops")
    } else {
        (PatternType::ConsecutiveRises, "rises")
    };

    Some(DetectedPattern::new(
        pattern_type,
        confidence,
        format!("{} consecutive {} totalling {:.3}%", count, label, magnitude),
    ))
}

/// Newest tick moved more than the shock threshold
fn detect_shock(ticks: &[PriceTick]) -> Option<DetectedPattern> {
    let newest = ticks.first()?;
    let percent = newest.percent_delta.abs();
    if percent <= SHOCK_PERCENT {
        return None;
    }

    let confidence = (40.0 + percent * 30.0).min(CONFIDENCE_CAP);
    let (pattern_type, label) = if newest.percent_delta < 0.0 {
        (PatternType::SuddenDrop, "drop")
    } else {
        (PatternType::SuddenSpike, "spike")
    };

    Some(DetectedPattern::new(
        pattern_type,
        confidence,
        format!("Sudden {} of {:.3}% in one tick", label, percent),
    ))
}

/// Compare the asset's window change to the primary reference's
fn detect_divergence(ticks: &[PriceTick], reference: &[ReferencePrice]) -> Option<DetectedPattern> {
    if ticks.len() < 2 || reference.len() < 2 {
        return None;
    }

    let asset_change = percent_change(ticks[ticks.len() - 1].value, ticks[0].value);
    let ref_change = percent_change(reference[reference.len() - 1].value, reference[0].value);

    let reference_stable = ref_change.abs() < REFERENCE_STABLE_PERCENT;
    let asset_moved = asset_change.abs() > ASSET_MOVED_PERCENT;

    if reference_stable && asset_moved {
        let confidence = (60.0 + asset_change.abs() * 10.0).min(CONFIDENCE_CAP);
        return Some(DetectedPattern::new(
            PatternType::Manipulation,
            confidence,
            format!(
                "Asset moved {:+.3}% while reference moved {:+.3}%",
                asset_change, ref_change
            ),
        ));
    }

    let same_sign = asset_change != 0.0 && asset_change.signum() == ref_change.signum();
    if ref_change.abs() > REFERENCE_STABLE_PERCENT && same_sign {
        return Some(DetectedPattern::new(
            PatternType::MarketDriven,
            MARKET_DRIVEN_CONFIDENCE,
            format!(
                "Asset {:+.3}% follows reference {:+.3}%",
                asset_change, ref_change
            ),
        ));
    }

    None
}

/// Dip followed by a rebound over the four newest ticks
fn detect_recovery(ticks: &[PriceTick]) -> Option<DetectedPattern> {
    if ticks.len() < 4 {
        return None;
    }
    let (p0, p1, p2, p3) = (ticks[0].value, ticks[1].value, ticks[2].value, ticks[3].value);

    if !(p3 > p2 && p2 < p1 && p1 < p0) {
        return None;
    }

    let recovery_percent = (p0 - p2) / (p3 - p2) * 100.0;
    if recovery_percent <= RECOVERY_MIN_PERCENT {
        return None;
    }

    let confidence = (50.0 + recovery_percent * 0.3).min(RECOVERY_CONFIDENCE_CAP);
    Some(DetectedPattern::new(
        PatternType::Recovery,
        confidence,
        format!("Recovered {:.1}% of the dip", recovery_percent),
    ))
}

/// Uptick after an unbroken run of at least three drops
fn detect_bottom_reversal(ticks: &[PriceTick]) -> Option<DetectedPattern> {
    let newest = ticks.first()?;
    if newest.delta_from_prev <= 0.0 {
        return None;
    }

    let drops: Vec<&PriceTick> = ticks
        .iter()
        .skip(1)
        .take_while(|t| t.delta_from_prev < 0.0)
        .collect();

    let prior_drops = drops.len();
    if prior_drops < BOTTOM_MIN_DROPS {
        return None;
    }

    let total_drop_amount: f64 = drops.iter().map(|t| t.delta_from_prev.abs()).sum();
    let total_drop_percent: f64 = drops.iter().map(|t| t.percent_delta.abs()).sum();
    let confidence =
        (60.0 + prior_drops as f64 * 8.0 + total_drop_percent * 3.0).min(CONFIDENCE_CAP);

    Some(DetectedPattern::new(
        PatternType::BottomReversal,
        confidence,
        format!(
            "Uptick after {} drops (-{:.4} / -{:.3}%)",
            prior_drops, total_drop_amount, total_drop_percent
        ),
    ))
}

// ─────────────────────────────────────────────────────────────────
// Aggregation
// ─────────────────────────────────────────────────────────────────

/// First matching rule wins
fn resolve_suggestion(patterns: &[DetectedPattern]) -> Suggestion {
    let has = |t: PatternType| patterns.iter().any(|p| p.pattern_type == t);
    let manipulated = has(PatternType::Manipulation);

    // Bottom reversal outranks recovery; both buy
    if has(PatternType::BottomReversal) || has(PatternType::Recovery) {
        Suggestion::Buy
    } else if has(PatternType::ConsecutiveDrops) && !manipulated {
        Suggestion::Sell
    } else if has(PatternType::ConsecutiveDrops) {
        Suggestion::Hold
    } else if has(PatternType::SuddenSpike) {
        Suggestion::Sell
    } else {
        // Rises, manipulated drops and everything else wait
        Suggestion::Hold
    }
}

fn overall_confidence(patterns: &[DetectedPattern], data_points: usize) -> f64 {
    if patterns.is_empty() {
        return (data_points as f64 * 3.0).min(BASELINE_CAP);
    }

    let max = patterns
        .iter()
        .map(|p| p.confidence)
        .fold(f64::MIN, f64::max);
    let mean = patterns.iter().map(|p| p.confidence).sum::<f64>() / patterns.len() as f64;

    (max * 0.7 + mean * 0.3).clamp(0.0, 100.0)
}
