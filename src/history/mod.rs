//! Tick and reference-price history
//!
//! Holds the monitored asset's ticks and each reference instrument's samples,
//! pruned by age and record count. Consumers never touch the live buffers:
//! they receive an immutable [`MarketSnapshot`] with newest-first windows.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::types::{PriceTick, ReferenceInstrument, ReferencePrice};

/// Rolling history of asset ticks
#[derive(Debug, Clone)]
pub struct TickHistory {
    /// Oldest first
    ticks: VecDeque<PriceTick>,
    max_len: usize,
    max_age_secs: i64,
}

impl TickHistory {
    pub fn new(max_len: usize, max_age_secs: i64) -> Self {
        Self {
            ticks: VecDeque::with_capacity(max_len),
            max_len,
            max_age_secs,
        }
    }

    /// Append an observation; out-of-order observations are dropped
    pub fn push(&mut self, value: f64, timestamp: DateTime<Utc>) -> Option<&PriceTick> {
        if let Some(last) = self.ticks.back() {
            if timestamp < last.timestamp {
                return None;
            }
        }

        let tick = PriceTick::from_observation(value, timestamp, self.ticks.back());
        self.ticks.push_back(tick);

        // Trim old data
        let cutoff = timestamp - Duration::seconds(self.max_age_secs);
        while let Some(front) = self.ticks.front() {
            if front.timestamp < cutoff {
                self.ticks.pop_front();
            } else {
                break;
            }
        }

        // Keep only max_len most recent
        while self.ticks.len() > self.max_len {
            self.ticks.pop_front();
        }

        self.ticks.back()
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn latest(&self) -> Option<&PriceTick> {
        self.ticks.back()
    }

    /// All retained ticks, newest first
    pub fn newest_first(&self) -> Vec<PriceTick> {
        self.ticks.iter().rev().cloned().collect()
    }
}

impl Default for TickHistory {
    fn default() -> Self {
        Self::new(500, 3600)
    }
}

/// Rolling history per reference instrument
#[derive(Debug, Clone)]
pub struct ReferenceHistory {
    samples: HashMap<ReferenceInstrument, VecDeque<ReferencePrice>>,
    max_len: usize,
    max_age_secs: i64,
}

impl ReferenceHistory {
    pub fn new(max_len: usize, max_age_secs: i64) -> Self {
        Self {
            samples: HashMap::new(),
            max_len,
            max_age_secs,
        }
    }

    pub fn push(&mut self, price: ReferencePrice) {
        let max_len = self.max_len;
        let max_age_secs = self.max_age_secs;
        let history = self
            .samples
            .entry(price.instrument)
            .or_insert_with(|| VecDeque::with_capacity(max_len));

        if let Some(last) = history.back() {
            if price.timestamp < last.timestamp {
                return;
            }
        }

        let cutoff = price.timestamp - Duration::seconds(max_age_secs);
        history.push_back(price);

        while let Some(front) = history.front() {
            if front.timestamp < cutoff {
                history.pop_front();
            } else {
                break;
            }
        }
        while history.len() > max_len {
            history.pop_front();
        }
    }

    pub fn latest(&self, instrument: ReferenceInstrument) -> Option<&ReferencePrice> {
        self.samples.get(&instrument).and_then(|h| h.back())
    }

    fn newest_first(&self) -> HashMap<ReferenceInstrument, Vec<ReferencePrice>> {
        self.samples
            .iter()
            .map(|(instrument, history)| (*instrument, history.iter().rev().cloned().collect()))
            .collect()
    }
}

impl Default for ReferenceHistory {
    fn default() -> Self {
        Self::new(500, 3600)
    }
}

/// Immutable view of recent market data, shared by detector and correlator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// Point in time the windows are measured from
    pub as_of: DateTime<Utc>,
    /// Asset ticks, newest first
    pub ticks: Vec<PriceTick>,
    /// Reference samples per instrument, newest first
    pub references: HashMap<ReferenceInstrument, Vec<ReferencePrice>>,
}

impl MarketSnapshot {
    pub fn capture(
        ticks: &TickHistory,
        references: &ReferenceHistory,
        as_of: DateTime<Utc>,
    ) -> Self {
        Self {
            as_of,
            ticks: ticks.newest_first(),
            references: references.newest_first(),
        }
    }

    /// Build directly from newest-first vectors
    pub fn from_parts(
        as_of: DateTime<Utc>,
        ticks: Vec<PriceTick>,
        references: HashMap<ReferenceInstrument, Vec<ReferencePrice>>,
    ) -> Self {
        Self {
            as_of,
            ticks,
            references,
        }
    }

    pub fn latest_price(&self) -> Option<f64> {
        self.ticks.first().map(|t| t.value)
    }

    /// Newest-first ticks inside the lookback window, capped at `max_records`
    pub fn ticks_within(&self, minutes: i64, max_records: usize) -> &[PriceTick] {
        let cutoff = self.as_of - Duration::minutes(minutes);
        let n = self
            .ticks
            .iter()
            .take(max_records)
            .take_while(|t| t.timestamp >= cutoff)
            .count();
        &self.ticks[..n]
    }

    /// Newest-first reference samples inside the lookback window
    pub fn references_within(
        &self,
        instrument: ReferenceInstrument,
        minutes: i64,
    ) -> &[ReferencePrice] {
        let cutoff = self.as_of - Duration::minutes(minutes);
        match self.references.get(&instrument) {
            Some(samples) => {
                let n = samples.iter().take_while(|r| r.timestamp >= cutoff).count();
                &samples[..n]
            }
            None => &[],
        }
    }
}
