//! Decision log and trade journal
//!
//! - `DecisionLog`: append-only record of each cycle, read back only as
//!   similarity context for the advisor
//! - `MemoryDecisionLog`: bounded in-process log
//! - `CsvDecisionLog`: same lookups, every record also appended to CSV
//! - `TradeJournal`: CSV journal of executed trades

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::correlator::ManipulationType;
use crate::patterns::PatternType;
use crate::position::TradeRecord;
use crate::types::{AccountId, Suggestion, TradeAction};

/// Records kept in memory for similarity lookups
pub const DEFAULT_LOG_CAPACITY: usize = 1_000;

const DECISIONS_FILE: &str = "decisions.csv";
const TRADES_FILE: &str = "trades.csv";

/// How the cycle reached its action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionRoute {
    /// Deterministic bottom-reversal + fake-drop buy
    FastPath,
    /// Advisor answered with a usable decision
    Advisor,
    /// Advisor failed or was malformed; deterministic suggestion used
    Fallback,
    /// Nothing escalated (no pattern, low confidence, HOLD or cooldown)
    Abstain,
}

impl fmt::Display for DecisionRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionRoute::FastPath => write!(f, "FAST_PATH"),
            DecisionRoute::Advisor => write!(f, "ADVISOR"),
            DecisionRoute::Fallback => write!(f, "FALLBACK"),
            DecisionRoute::Abstain => write!(f, "ABSTAIN"),
        }
    }
}

/// Inputs and outcome of one decision cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub timestamp: DateTime<Utc>,
    pub account_id: String,
    pub price: f64,
    pub pattern_types: Vec<PatternType>,
    pub pattern_confidence: f64,
    pub suggestion: Suggestion,
    pub confidence_boost: f64,
    pub manipulation_type: ManipulationType,
    pub route: DecisionRoute,
    /// Action chosen by the gate
    pub action: Suggestion,
    /// Confidence of the chosen action, clamped to 0-100
    pub confidence: f64,
    /// An order was filled for this decision
    pub executed: bool,
    pub reasoning: String,
}

impl DecisionRecord {
    pub fn shares_pattern_with(&self, pattern_types: &[PatternType]) -> bool {
        self.pattern_types.iter().any(|p| pattern_types.contains(p))
    }
}

/// Append-only decision log with read-only similarity lookups
pub trait DecisionLog: Send + Sync {
    fn append(&self, record: DecisionRecord) -> Result<()>;

    /// Most recent records sharing at least one pattern type, newest first
    fn similar(&self, pattern_types: &[PatternType], limit: usize) -> Vec<DecisionRecord>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory decision log, oldest records evicted past capacity
#[derive(Debug)]
pub struct MemoryDecisionLog {
    records: RwLock<VecDeque<DecisionRecord>>,
    capacity: usize,
}

impl MemoryDecisionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, record: DecisionRecord) {
        if let Ok(mut records) = self.records.write() {
            records.push_back(record);
            while records.len() > self.capacity {
                records.pop_front();
            }
        }
    }
}

impl Default for MemoryDecisionLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl DecisionLog for MemoryDecisionLog {
    fn append(&self, record: DecisionRecord) -> Result<()> {
        self.push(record);
        Ok(())
    }

    fn similar(&self, pattern_types: &[PatternType], limit: usize) -> Vec<DecisionRecord> {
        if pattern_types.is_empty() || limit == 0 {
            return Vec::new();
        }
        match self.records.read() {
            Ok(records) => records
                .iter()
                .rev()
                .filter(|r| r.shares_pattern_with(pattern_types))
                .take(limit)
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CSV storage
// ─────────────────────────────────────────────────────────────────────────────

/// Flat CSV row for a decision; pattern types are `|`-joined
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DecisionRow {
    timestamp: DateTime<Utc>,
    account_id: String,
    price: f64,
    pattern_types: String,
    pattern_confidence: f64,
    suggestion: Suggestion,
    confidence_boost: f64,
    manipulation_type: ManipulationType,
    route: DecisionRoute,
    action: Suggestion,
    confidence: f64,
    executed: bool,
    reasoning: String,
}

impl From<&DecisionRecord> for DecisionRow {
    fn from(record: &DecisionRecord) -> Self {
        Self {
            timestamp: record.timestamp,
            account_id: record.account_id.clone(),
            price: record.price,
            pattern_types: record
                .pattern_types
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join("|"),
            pattern_confidence: record.pattern_confidence,
            suggestion: record.suggestion,
            confidence_boost: record.confidence_boost,
            manipulation_type: record.manipulation_type,
            route: record.route,
            action: record.action,
            confidence: record.confidence,
            executed: record.executed,
            reasoning: record.reasoning.clone(),
        }
    }
}

impl From<DecisionRow> for DecisionRecord {
    fn from(row: DecisionRow) -> Self {
        Self {
            timestamp: row.timestamp,
            account_id: row.account_id,
            price: row.price,
            pattern_types: row
                .pattern_types
                .split('|')
                .filter_map(PatternType::from_str)
                .collect(),
            pattern_confidence: row.pattern_confidence,
            suggestion: row.suggestion,
            confidence_boost: row.confidence_boost,
            manipulation_type: row.manipulation_type,
            route: row.route,
            action: row.action,
            confidence: row.confidence,
            executed: row.executed,
            reasoning: row.reasoning,
        }
    }
}

fn create_writer(path: &Path) -> Result<csv::Writer<fs::File>> {
    let file_has_data = path.exists() && fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open CSV file {}", path.display()))?;

    Ok(WriterBuilder::new()
        .has_headers(!file_has_data)
        .from_writer(file))
}

/// Decision log persisted to `<data_dir>/decisions.csv`
///
/// Existing rows are loaded on open so similarity context survives restarts.
pub struct CsvDecisionLog {
    memory: MemoryDecisionLog,
    writer: Mutex<csv::Writer<fs::File>>,
    path: PathBuf,
}

impl CsvDecisionLog {
    pub fn open(data_dir: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir).context("Failed to create data directory")?;
        let path = data_dir.join(DECISIONS_FILE);

        let memory = MemoryDecisionLog::new(capacity);
        let mut loaded = 0usize;
        if path.exists() {
            let mut reader = ReaderBuilder::new()
                .has_headers(true)
                .from_path(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            for row in reader.deserialize::<DecisionRow>() {
                match row {
                    Ok(row) => {
                        memory.push(row.into());
                        loaded += 1;
                    }
                    Err(e) => warn!(error = %e, "Skipping unreadable decision row"),
                }
            }
        }

        let writer = create_writer(&path)?;
        info!(path = %path.display(), loaded, "📒 Decision log opened");

        Ok(Self {
            memory,
            writer: Mutex::new(writer),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DecisionLog for CsvDecisionLog {
    fn append(&self, record: DecisionRecord) -> Result<()> {
        {
            let mut writer = self
                .writer
                .lock()
                .map_err(|_| anyhow::anyhow!("decision writer lock poisoned"))?;
            writer
                .serialize(DecisionRow::from(&record))
                .context("Failed to write decision record")?;
            writer.flush().context("Failed to flush decision writer")?;
        }
        self.memory.push(record);
        Ok(())
    }

    fn similar(&self, pattern_types: &[PatternType], limit: usize) -> Vec<DecisionRecord> {
        self.memory.similar(pattern_types, limit)
    }

    fn len(&self) -> usize {
        self.memory.len()
    }
}

/// Journal row for one executed trade
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TradeRow {
    timestamp: DateTime<Utc>,
    account_id: String,
    session_id: Uuid,
    sequence: u64,
    action: TradeAction,
    quantity: f64,
    unit_price: f64,
    total_value: f64,
    fee_amount: f64,
    confidence: f64,
}

/// Append-only CSV journal of executed trades at `<data_dir>/trades.csv`
pub struct TradeJournal {
    writer: Mutex<csv::Writer<fs::File>>,
    path: PathBuf,
}

impl TradeJournal {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir).context("Failed to create data directory")?;
        let path = data_dir.join(TRADES_FILE);
        let writer = create_writer(&path)?;
        Ok(Self {
            writer: Mutex::new(writer),
            path,
        })
    }

    pub fn record(&self, account: &AccountId, trade: &TradeRecord) -> Result<()> {
        let row = TradeRow {
            timestamp: trade.timestamp,
            account_id: account.as_str().to_string(),
            session_id: trade.session_id,
            sequence: trade.sequence,
            action: trade.action,
            quantity: trade.quantity,
            unit_price: trade.unit_price,
            total_value: trade.total_value,
            fee_amount: trade.fee_amount,
            confidence: trade.confidence,
        };

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("trade journal lock poisoned"))?;
        writer
            .serialize(&row)
            .context("Failed to write trade record")?;
        writer.flush().context("Failed to flush trade journal")?;
        debug!(account = %account, sequence = trade.sequence, "Trade journaled");
        Ok(())
    }

    /// Read back every journaled trade for one account, in file order
    pub fn load(&self, account: &AccountId) -> Result<Vec<TradeRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .from_path(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;

        let mut trades = Vec::new();
        for row in reader.deserialize::<TradeRow>() {
            let row = row.context("Failed to parse trade row")?;
            if row.account_id != account.as_str() {
                continue;
            }
            trades.push(TradeRecord {
                action: row.action,
                quantity: row.quantity,
                unit_price: row.unit_price,
                total_value: row.total_value,
                fee_amount: row.fee_amount,
                confidence: row.confidence,
                timestamp: row.timestamp,
                session_id: row.session_id,
                sequence: row.sequence,
            });
        }
        Ok(trades)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn temp_data_dir(test_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tradegate_persistence_{}_{}", test_name, Uuid::new_v4()))
    }

    fn record(minutes: i64, patterns: Vec<PatternType>, action: Suggestion) -> DecisionRecord {
        DecisionRecord {
            timestamp: Utc::now() + Duration::minutes(minutes),
            account_id: "acct-1".to_string(),
            price: 100.0,
            pattern_types: patterns,
            pattern_confidence: 75.0,
            suggestion: action,
            confidence_boost: 0.0,
            manipulation_type: ManipulationType::None,
            route: DecisionRoute::Fallback,
            action,
            confidence: 60.0,
            executed: false,
            reasoning: "test".to_string(),
        }
    }

    #[test]
    fn similar_returns_newest_overlapping_records() {
        let log = MemoryDecisionLog::default();
        log.append(record(0, vec![PatternType::ConsecutiveDrops], Suggestion::Sell))
            .unwrap();
        log.append(record(1, vec![PatternType::SuddenSpike], Suggestion::Sell))
            .unwrap();
        log.append(record(
            2,
            vec![PatternType::BottomReversal, PatternType::ConsecutiveDrops],
            Suggestion::Buy,
        ))
        .unwrap();

        let similar = log.similar(&[PatternType::ConsecutiveDrops], 10);
        assert_eq!(similar.len(), 2);
        assert_eq!(similar[0].action, Suggestion::Buy);
        assert_eq!(similar[1].action, Suggestion::Sell);

        assert_eq!(log.similar(&[PatternType::ConsecutiveDrops], 1).len(), 1);
        assert!(log.similar(&[], 10).is_empty());
        assert!(log.similar(&[PatternType::Recovery], 10).is_empty());
    }

    #[test]
    fn memory_log_evicts_oldest_past_capacity() {
        let log = MemoryDecisionLog::new(2);
        for i in 0..3 {
            log.append(record(i, vec![PatternType::Recovery], Suggestion::Buy))
                .unwrap();
        }
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn csv_log_survives_reopen() {
        let data_dir = temp_data_dir("decisions");
        {
            let log = CsvDecisionLog::open(&data_dir, 100).unwrap();
            log.append(record(
                0,
                vec![PatternType::BottomReversal, PatternType::Manipulation],
                Suggestion::Buy,
            ))
            .unwrap();
            log.append(record(1, Vec::new(), Suggestion::Hold)).unwrap();
        }

        let reopened = CsvDecisionLog::open(&data_dir, 100).unwrap();
        assert_eq!(reopened.len(), 2);
        let similar = reopened.similar(&[PatternType::Manipulation], 5);
        assert_eq!(similar.len(), 1);
        assert_eq!(
            similar[0].pattern_types,
            vec![PatternType::BottomReversal, PatternType::Manipulation]
        );

        let content = fs::read_to_string(reopened.path()).unwrap();
        assert_eq!(content.lines().filter(|l| l.starts_with("timestamp")).count(), 1);

        let _ = fs::remove_dir_all(&data_dir);
    }

    #[test]
    fn journal_filters_by_account() {
        let data_dir = temp_data_dir("journal");
        let journal = TradeJournal::open(&data_dir).unwrap();
        let trade = TradeRecord {
            action: TradeAction::Buy,
            quantity: 0.5,
            unit_price: 100.0,
            total_value: 50.0,
            fee_amount: 0.5,
            confidence: 80.0,
            timestamp: Utc::now(),
            session_id: Uuid::new_v4(),
            sequence: 1,
        };
        journal.record(&AccountId::new("a"), &trade).unwrap();
        journal.record(&AccountId::new("b"), &trade).unwrap();

        let loaded = journal.load(&AccountId::new("a")).unwrap();
        assert_eq!(loaded, vec![trade]);
        assert!(journal.load(&AccountId::new("c")).unwrap().is_empty());

        let _ = fs::remove_dir_all(&data_dir);
    }
}
