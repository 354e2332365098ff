//! Core types used throughout TradeGate
//!
//! Defines common data structures for ticks, reference prices, actions and balances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Account identifier (one position state machine per account)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Independent instruments used to corroborate the asset's moves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceInstrument {
    /// Same asset quoted on a large external venue
    Primary,
    /// A second, broader market reference (e.g. index or major pair)
    Secondary,
    /// Exchange rate between the asset's quote currency and the reference currency
    ExchangeRate,
}

impl ReferenceInstrument {
    pub const ALL: [ReferenceInstrument; 3] = [
        ReferenceInstrument::Primary,
        ReferenceInstrument::Secondary,
        ReferenceInstrument::ExchangeRate,
    ];

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "primary" | "ref1" => Some(ReferenceInstrument::Primary),
            "secondary" | "ref2" => Some(ReferenceInstrument::Secondary),
            "fx" | "rate" | "exchange_rate" => Some(ReferenceInstrument::ExchangeRate),
            _ => None,
        }
    }
}

impl fmt::Display for ReferenceInstrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceInstrument::Primary => write!(f, "PRIMARY"),
            ReferenceInstrument::Secondary => write!(f, "SECONDARY"),
            ReferenceInstrument::ExchangeRate => write!(f, "FX"),
        }
    }
}

/// One observation of the monitored asset, with fields derived from its predecessor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    /// Observed price
    pub value: f64,
    /// Observation time
    pub timestamp: DateTime<Utc>,
    /// Absolute change from the previous tick (0 for the first tick)
    pub delta_from_prev: f64,
    /// Percent change from the previous tick (0 for the first tick)
    pub percent_delta: f64,
    /// Seconds elapsed since the previous tick
    pub seconds_since_last: i64,
}

impl PriceTick {
    /// Build a tick relative to its predecessor (if any)
    pub fn from_observation(
        value: f64,
        timestamp: DateTime<Utc>,
        previous: Option<&PriceTick>,
    ) -> Self {
        match previous {
            Some(prev) => {
                let delta = value - prev.value;
                let percent = if prev.value != 0.0 {
                    delta / prev.value * 100.0
                } else {
                    0.0
                };
                Self {
                    value,
                    timestamp,
                    delta_from_prev: delta,
                    percent_delta: percent,
                    seconds_since_last: (timestamp - prev.timestamp).num_seconds().max(0),
                }
            }
            None => Self {
                value,
                timestamp,
                delta_from_prev: 0.0,
                percent_delta: 0.0,
                seconds_since_last: 0,
            },
        }
    }
}

/// Price snapshot for a reference instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferencePrice {
    pub instrument: ReferenceInstrument,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Trading action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    pub fn opposite(&self) -> Self {
        match self {
            TradeAction::Buy => TradeAction::Sell,
            TradeAction::Sell => TradeAction::Buy,
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeAction::Buy => write!(f, "BUY"),
            TradeAction::Sell => write!(f, "SELL"),
        }
    }
}

/// Suggested action from the detector, the advisor or the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Suggestion {
    Buy,
    Sell,
    #[default]
    Hold,
}

impl Suggestion {
    /// Tradeable action, if any
    pub fn action(&self) -> Option<TradeAction> {
        match self {
            Suggestion::Buy => Some(TradeAction::Buy),
            Suggestion::Sell => Some(TradeAction::Sell),
            Suggestion::Hold => None,
        }
    }

    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Some(Suggestion::Buy),
            "SELL" => Some(Suggestion::Sell),
            "HOLD" => Some(Suggestion::Hold),
            _ => None,
        }
    }
}

impl From<TradeAction> for Suggestion {
    fn from(action: TradeAction) -> Self {
        match action {
            TradeAction::Buy => Suggestion::Buy,
            TradeAction::Sell => Suggestion::Sell,
        }
    }
}

impl fmt::Display for Suggestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Suggestion::Buy => write!(f, "BUY"),
            Suggestion::Sell => write!(f, "SELL"),
            Suggestion::Hold => write!(f, "HOLD"),
        }
    }
}

/// Market direction as judged by a factor or the combined signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketDirection {
    Bullish,
    Bearish,
    #[default]
    Neutral,
}

impl fmt::Display for MarketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketDirection::Bullish => write!(f, "BULLISH"),
            MarketDirection::Bearish => write!(f, "BEARISH"),
            MarketDirection::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// Balances available to an account
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AccountBalances {
    /// Quote currency available
    pub cash: f64,
    /// Asset units held
    pub asset: f64,
}

impl AccountBalances {
    /// Total value at a given price
    pub fn total_value(&self, price: f64) -> f64 {
        self.cash + self.asset * price
    }
}

/// Percent change from `oldest` to `newest`; 0 when `oldest` is zero
pub fn percent_change(oldest: f64, newest: f64) -> f64 {
    if oldest == 0.0 {
        0.0
    } else {
        (newest - oldest) / oldest * 100.0
    }
}
