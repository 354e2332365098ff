//! Configuration management for TradeGate
//!
//! Loads from TOML files + environment variables via .env

mod types;

pub use types::*;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub patterns: PatternsConfig,
    pub correlator: CorrelatorConfig,
    pub account: AccountSettings,
    pub advisor: AdvisorConfig,
    pub paper: PaperConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Global enable switch, checked at the start of every cycle
    pub enabled: bool,
    /// Cadence of decision cycles in seconds
    pub cycle_interval_secs: u64,
    /// Minimum wall-clock interval between advisor calls per account
    pub advisor_cooldown_secs: u64,
    /// Advisor call timeout in milliseconds
    pub advisor_timeout_ms: u64,
    /// Order execution timeout in milliseconds
    pub execution_timeout_ms: u64,
    /// Trade size (percent of balance) used by the deterministic fast path
    pub fast_path_size_percent: f64,
}

impl EngineConfig {
    pub fn advisor_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.advisor_cooldown_secs as i64)
    }

    pub fn advisor_timeout(&self) -> Duration {
        Duration::from_millis(self.advisor_timeout_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cycle_interval_secs: 30,
            advisor_cooldown_secs: 120,
            advisor_timeout_ms: 15_000,
            execution_timeout_ms: 10_000,
            fast_path_size_percent: 5.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatternsConfig {
    /// Lookback window in minutes
    pub lookback_minutes: i64,
    /// Maximum ticks considered per cycle
    pub max_records: usize,
}

impl Default for PatternsConfig {
    fn default() -> Self {
        Self {
            lookback_minutes: 30,
            max_records: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorrelatorConfig {
    /// Per-factor lookback window in minutes
    pub window_minutes: i64,
    /// Ticks scanned by the manipulation factor
    pub manipulation_scan_ticks: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            window_minutes: 15,
            manipulation_scan_ticks: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AdvisorConfig {
    /// HTTP endpoint of the advisor; unset disables escalation
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaperConfig {
    pub initial_cash: f64,
    pub initial_asset: f64,
    /// Fail every Nth order (0 = never)
    pub fill_failure_every: u64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_cash: 1000.0,
            initial_asset: 0.0,
            fill_failure_every: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory
    pub data_dir: String,
    /// Enable CSV logging
    pub csv_enabled: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            csv_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of human-readable output
    pub json: bool,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // Engine defaults
            .set_default("engine.enabled", true)?
            .set_default("engine.cycle_interval_secs", 30)?
            .set_default("engine.advisor_cooldown_secs", 120)?
            .set_default("engine.advisor_timeout_ms", 15_000)?
            .set_default("engine.execution_timeout_ms", 10_000)?
            .set_default("engine.fast_path_size_percent", 5.0)?
            // Pattern detector defaults
            .set_default("patterns.lookback_minutes", 30)?
            .set_default("patterns.max_records", 20)?
            // Correlator defaults
            .set_default("correlator.window_minutes", 15)?
            .set_default("correlator.manipulation_scan_ticks", 10)?
            // Account defaults
            .set_default("account.min_confidence", 70.0)?
            .set_default("account.trade_mode", "percentage")?
            .set_default("account.trade_percent", 5.0)?
            .set_default("account.fixed_quantity", 0.001)?
            .set_default("account.fee_rate", 0.01)?
            .set_default("account.min_trade_value", 10.0)?
            .set_default("account.auto_trading_enabled", true)?
            .set_default("account.max_loss_percent", 10.0)?
            // Paper executor defaults
            .set_default("paper.initial_cash", 1000.0)?
            .set_default("paper.initial_asset", 0.0)?
            .set_default("paper.fill_failure_every", 0)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.csv_enabled", true)?
            // Logging defaults
            .set_default("logging.json", false)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (TRADEGATE_*)
            .add_source(Environment::with_prefix("TRADEGATE").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let mut app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.account = app_config
            .account
            .validate()
            .context("Invalid account settings")?;

        Ok(app_config)
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "enabled={} cooldown={}s min_conf={:.0} mode={:?} pct={:.1} fee={:.3} advisor={}",
            self.engine.enabled,
            self.engine.advisor_cooldown_secs,
            self.account.min_confidence,
            self.account.trade_mode,
            self.account.trade_percent,
            self.account.fee_rate,
            self.advisor.endpoint.as_deref().unwrap_or("disabled"),
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
