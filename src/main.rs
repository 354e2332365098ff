//! TradeGate - replay runner
//!
//! Replays a CSV of asset and reference observations through the decision
//! engine with the paper executor.
//!
//! Usage: tradegate [observations.csv]
//!
//! CSV columns: `timestamp,instrument,value` where `instrument` is `asset`
//! or a reference name (`primary`, `secondary`, `fx`).

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tradegate::advisor::{Advisor, DisabledAdvisor, HttpAdvisor};
use tradegate::config::AppConfig;
use tradegate::execution::PaperExecutor;
use tradegate::gate::ManualClock;
use tradegate::persistence::{CsvDecisionLog, TradeJournal, DEFAULT_LOG_CAPACITY};
use tradegate::types::{AccountId, ReferenceInstrument, ReferencePrice};
use tradegate::{CycleOutcome, TradingEngine};

const PAPER_ACCOUNT: &str = "paper";

#[derive(Debug, Deserialize)]
struct Observation {
    timestamp: DateTime<Utc>,
    instrument: String,
    value: f64,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_observations(path: &Path) -> Result<Vec<Observation>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut rows = Vec::new();
    for (line, row) in reader.deserialize::<Observation>().enumerate() {
        match row {
            Ok(row) => rows.push(row),
            Err(e) => warn!(line = line + 2, error = %e, "Skipping unreadable observation"),
        }
    }
    rows.sort_by_key(|r| r.timestamp);
    Ok(rows)
}

async fn replay(
    engine: &TradingEngine,
    clock: &ManualClock,
    observations: &[Observation],
    account: &AccountId,
    cycle_interval: Duration,
) -> Result<()> {
    let mut last_cycle: Option<DateTime<Utc>> = None;
    let mut executed = 0usize;

    for obs in observations {
        clock.set(obs.timestamp);

        if obs.instrument.eq_ignore_ascii_case("asset") {
            if !engine.ingest_tick(obs.value, obs.timestamp) {
                warn!(timestamp = %obs.timestamp, "Out-of-order tick dropped");
                continue;
            }
        } else {
            match ReferenceInstrument::from_str(&obs.instrument) {
                Some(instrument) => engine.ingest_reference(ReferencePrice {
                    instrument,
                    value: obs.value,
                    timestamp: obs.timestamp,
                }),
                None => warn!(instrument = %obs.instrument, "Unknown instrument, skipping"),
            }
            continue;
        }

        let due = last_cycle
            .map(|last| obs.timestamp - last >= cycle_interval)
            .unwrap_or(true);
        if !due {
            continue;
        }
        last_cycle = Some(obs.timestamp);

        match engine.run_cycle(account).await {
            Ok(CycleOutcome::Executed { trade, .. }) => {
                executed += 1;
                info!(
                    action = %trade.action,
                    quantity = trade.quantity,
                    price = trade.unit_price,
                    "💰 Replay trade"
                );
            }
            Ok(_) => {}
            Err(e) if e.is_recoverable() => {
                warn!(error = %e, "Cycle failed, continuing");
            }
            Err(e) => {
                error!(error = %e, "🚨 Unrecoverable engine error, stopping replay");
                return Err(e.into());
            }
        }
    }

    info!(observations = observations.len(), executed, "✅ Replay finished");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_logging(config.logging.json);

    info!("🚀 TradeGate starting");
    info!(config = %config, "Configuration loaded");

    let input: PathBuf = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| Path::new(&config.persistence.data_dir).join("observations.csv"));
    let observations = load_observations(&input)?;
    let Some(first) = observations.first() else {
        warn!(path = %input.display(), "No observations to replay");
        return Ok(());
    };

    let advisor: Arc<dyn Advisor> = match &config.advisor.endpoint {
        Some(endpoint) => Arc::new(HttpAdvisor::new(
            endpoint.clone(),
            config.engine.advisor_timeout(),
        )?),
        None => {
            warn!("No advisor endpoint configured, escalations use the deterministic fallback");
            Arc::new(DisabledAdvisor)
        }
    };
    let executor = Arc::new(PaperExecutor::from_config(
        &config.paper,
        config.account.fee_rate,
    ));
    let clock = Arc::new(ManualClock::new(first.timestamp));

    let mut engine = TradingEngine::new(&config, advisor, executor, clock.clone());
    if config.persistence.csv_enabled {
        let data_dir = Path::new(&config.persistence.data_dir);
        engine = engine
            .with_decision_log(Arc::new(CsvDecisionLog::open(
                data_dir,
                DEFAULT_LOG_CAPACITY,
            )?))
            .with_trade_journal(Arc::new(TradeJournal::open(data_dir)?));
    }

    let account = AccountId::new(PAPER_ACCOUNT);
    let cycle_interval = Duration::seconds(config.engine.cycle_interval_secs as i64);

    tokio::select! {
        result = replay(&engine, &clock, &observations, &account, cycle_interval) => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("🛑 Interrupted, stopping replay");
        }
    }

    let performance = engine.performance(&account)?;
    info!(
        pairs = performance.pairs,
        wins = performance.wins,
        success_rate = performance.success_rate,
        gross = performance.gross_profit_loss,
        fees = performance.fees,
        net = performance.net_profit_loss,
        open_buys = performance.open_buys,
        "📊 Performance"
    );

    if let Some(summary) = engine.end_session(&account).await? {
        info!(
            session = %summary.session_id,
            trades = summary.trade_count,
            position = %summary.final_position,
            net = summary.performance.net_profit_loss,
            "🏁 Session closed"
        );
    }

    Ok(())
}
