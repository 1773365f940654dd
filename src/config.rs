//! Engine configuration: TOML file deserialized with serde, environment
//! loaded through dotenvy, logging initialized from the config with an
//! `EnvFilter` override via `RUST_LOG`.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

use crate::error::{ConfigError, Result};
use crate::orchestrator::StrategyKind;
use crate::risk::RiskConfig;
use crate::snapshot::SnapshotConfig;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub strategies: Vec<StrategyDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit JSON log lines instead of the human format.
    pub log_json: bool,
    /// Milliseconds between synthetic feed ticks.
    pub tick_interval_ms: u64,
    /// Seconds between system-status heartbeat events.
    pub status_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            tick_interval_ms: 1000,
            status_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub name: String,
    /// Symbols the synthetic feed generates ticks for.
    pub symbols: Vec<String>,
    /// Starting mid price of the synthetic walk.
    pub start_price: f64,
    /// Maximum per-tick drift of the synthetic walk.
    pub walk_step_pct: f64,
    pub initial_balances: HashMap<String, Decimal>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        let mut initial_balances = HashMap::new();
        initial_balances.insert("BTC".to_string(), dec!(1));
        initial_balances.insert("USDT".to_string(), dec!(50000));
        Self {
            name: "paper".to_string(),
            symbols: vec!["BTC-USDT".to_string()],
            start_price: 50000.0,
            walk_step_pct: 0.0005,
            initial_balances,
        }
    }
}

/// One strategy instance to create at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyDef {
    pub kind: String,
    #[serde(default)]
    pub autostart: bool,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl Config {
    /// Load from a TOML file. Reads `.env` first so the file may reference
    /// environment-provided values via `RUST_LOG` and friends.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        dotenvy::dotenv().ok();
        let raw = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        let config: Config = toml::from_str(&raw).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configs whose startup strategies could never be created.
    pub fn validate(&self) -> Result<()> {
        for def in &self.strategies {
            StrategyKind::from_str(&def.kind).map_err(|_| ConfigError::InvalidValue {
                field: "strategies.kind",
                reason: format!("unknown strategy kind: {}", def.kind),
            })?;
            if !def.config.contains_key("symbol") {
                return Err(ConfigError::MissingField {
                    field: "strategies.config.symbol",
                }
                .into());
            }
        }
        Ok(())
    }

    /// Install the global tracing subscriber. `RUST_LOG` overrides the
    /// configured level.
    pub fn init_logging(&self) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.engine.log_level));
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        if self.engine.log_json {
            builder.json().init();
        } else {
            builder.init();
        }
    }
}
