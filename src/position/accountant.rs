//! FIFO trade pairing and performance analytics
//!
//! Each SELL closes the oldest still-open BUY of the same account. Trades are
//! ordered by timestamp, ties broken by sequence number.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::error;

use super::TradeRecord;
use crate::error::{EngineError, EngineResult};
use crate::types::TradeAction;

/// One closed round trip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradePair {
    pub buy: TradeRecord,
    pub sell: TradeRecord,
}

impl TradePair {
    /// Gross P/L in cash, before fees
    pub fn profit_loss(&self) -> f64 {
        self.sell.total_value - self.buy.total_value
    }

    /// `(sellTotal - buyTotal) / buyTotal * 100`
    pub fn profit_loss_percent(&self) -> f64 {
        if self.buy.total_value <= 0.0 {
            return 0.0;
        }
        self.profit_loss() / self.buy.total_value * 100.0
    }

    pub fn is_win(&self) -> bool {
        self.profit_loss() > 0.0
    }
}

/// Result of pairing a trade history
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pairing {
    pub pairs: Vec<TradePair>,
    /// Buys not yet closed, oldest first
    pub open_buys: Vec<TradeRecord>,
}

/// Pair every SELL with the oldest unmatched BUY
pub fn pair_trades(trades: &[TradeRecord]) -> EngineResult<Pairing> {
    let mut ordered: Vec<&TradeRecord> = trades.iter().collect();
    ordered.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then(a.sequence.cmp(&b.sequence))
    });

    let mut open: VecDeque<&TradeRecord> = VecDeque::new();
    let mut pairs = Vec::new();

    for trade in ordered {
        match trade.action {
            TradeAction::Buy => open.push_back(trade),
            TradeAction::Sell => match open.pop_front() {
                Some(buy) => pairs.push(TradePair {
                    buy: buy.clone(),
                    sell: trade.clone(),
                }),
                None => {
                    error!(
                        sequence = trade.sequence,
                        session = %trade.session_id,
                        "🚨 SELL without an open BUY, FIFO queue out of sync"
                    );
                    return Err(EngineError::InvariantViolation(format!(
                        "sell #{} has no open buy to pair with",
                        trade.sequence
                    )));
                }
            },
        }
    }

    Ok(Pairing {
        pairs,
        open_buys: open.into_iter().cloned().collect(),
    })
}

/// Aggregate analytics for one account
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub pairs: usize,
    pub wins: usize,
    /// Fraction of pairs with positive P/L (0-1)
    pub success_rate: f64,
    /// Sum of paired P/L before fees
    pub gross_profit_loss: f64,
    pub total_buy_volume: f64,
    pub total_sell_volume: f64,
    /// `fee_rate * (buy volume + sell volume)`
    pub fees: f64,
    pub net_profit_loss: f64,
    pub open_buys: usize,
}

/// Pair the history and compute fee-adjusted results
pub fn summarize(trades: &[TradeRecord], fee_rate: f64) -> EngineResult<PerformanceSummary> {
    let pairing = pair_trades(trades)?;

    let wins = pairing.pairs.iter().filter(|p| p.is_win()).count();
    let gross_profit_loss: f64 = pairing.pairs.iter().map(TradePair::profit_loss).sum();

    let volume = |action: TradeAction| -> f64 {
        trades
            .iter()
            .filter(|t| t.action == action)
            .map(|t| t.total_value)
            .sum()
    };
    let total_buy_volume = volume(TradeAction::Buy);
    let total_sell_volume = volume(TradeAction::Sell);
    let fees = fee_rate * (total_buy_volume + total_sell_volume);

    let success_rate = if pairing.pairs.is_empty() {
        0.0
    } else {
        wins as f64 / pairing.pairs.len() as f64
    };

    Ok(PerformanceSummary {
        pairs: pairing.pairs.len(),
        wins,
        success_rate,
        gross_profit_loss,
        total_buy_volume,
        total_sell_volume,
        fees,
        net_profit_loss: gross_profit_loss - fees,
        open_buys: pairing.open_buys.len(),
    })
}
