use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

use crate::error::BridgeError;
use crate::model::{SymbolSpec, Timeframe};

/// Legacy connector variables, applied last so they win over files and prefixed env.
pub const LEGACY_ENV_KEYS: [(&str, &str); 5] = [
    ("MT5_FILES_DIR", "bridge.files_dir"),
    ("MT5_PRIMARY_SYMBOL", "bridge.primary_symbol"),
    ("MT5_PRICE_FILE", "bridge.price_file"),
    ("MT5_TIMEOUT_SEC", "bridge.heartbeat_timeout_secs"),
    ("MT5_SKIP_HIST_LOG", "bridge.skip_history_on_connect"),
];

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub paper: PaperConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_symbol() -> String {
    "XAUUSD".to_string()
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_poll_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct BridgeConfig {
    pub files_dir: Option<PathBuf>,
    #[serde(default = "default_symbol")]
    pub primary_symbol: String,
    pub price_file: Option<String>,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub skip_history_on_connect: bool,
    #[serde(default = "default_poll_ms")]
    pub poll_interval_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            files_dir: None,
            primary_symbol: default_symbol(),
            price_file: None,
            heartbeat_timeout_secs: default_heartbeat_secs(),
            skip_history_on_connect: true,
            poll_interval_ms: default_poll_ms(),
        }
    }
}

impl BridgeConfig {
    /// Resolves the shared directory. Absence is fatal, and only checked at startup.
    pub fn require_files_dir(&self) -> Result<PathBuf, BridgeError> {
        let dir = self
            .files_dir
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| {
                BridgeError::Config("files_dir is not set (MT5_FILES_DIR)".to_string())
            })?;
        if !dir.is_dir() {
            return Err(BridgeError::Config(format!(
                "files directory not found: {}",
                dir.display()
            )));
        }
        Ok(dir)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IntervalConfig {
    pub price_ms: u64,
    pub tick_ms: u64,
    pub account_ms: u64,
    pub positions_ms: u64,
    pub orders_ms: u64,
    pub order_book_ms: u64,
    pub closed_trades_ms: u64,
    pub rates_ms: u64,
    pub symbol_info_ms: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            price_ms: 1_000,
            tick_ms: 1_000,
            account_ms: 2_000,
            positions_ms: 2_000,
            orders_ms: 2_000,
            order_book_ms: 2_000,
            closed_trades_ms: 10_000,
            rates_ms: 10_000,
            symbol_info_ms: 3_600_000,
        }
    }
}

/// Volatility-anchored stop-loss / take-profit policy for buy and sell commands.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProtectionConfig {
    pub enabled: bool,
    pub timeframe: Timeframe,
    pub period: usize,
    pub sl_multiplier: Decimal,
    pub tp_multiplier: Decimal,
    pub reward_ratio: Option<Decimal>,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeframe: Timeframe::M15,
            period: 14,
            sl_multiplier: dec!(1.5),
            tp_multiplier: dec!(3.0),
            reward_ratio: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    pub symbols: Vec<String>,
    pub timer_ms: u64,
    pub intervals: IntervalConfig,
    pub deviation_points: u32,
    pub default_magic: i64,
    pub history_days: i64,
    pub bars: usize,
    pub idempotency_ttl_secs: u64,
    pub api_port: Option<u16>,
    pub protection: ProtectionConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            timer_ms: 500,
            intervals: IntervalConfig::default(),
            deviation_points: 10,
            default_magic: crate::model::DEFAULT_MAGIC_NUMBER,
            history_days: 30,
            bars: 200,
            idempotency_ttl_secs: 300,
            api_port: None,
            protection: ProtectionConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Symbols the agent publishes per-symbol files for; falls back to the primary symbol.
    pub fn symbols_or(&self, primary: &str) -> Vec<String> {
        if self.symbols.is_empty() {
            vec![primary.to_string()]
        } else {
            self.symbols.clone()
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PaperInstrument {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub digits: u32,
    pub point: Decimal,
    pub contract_size: Decimal,
    pub volume_min: Decimal,
    pub volume_max: Decimal,
    pub volume_step: Decimal,
    pub tick_value: Decimal,
    pub stops_level: u32,
    pub freeze_level: u32,
    pub swap_long: Decimal,
    pub swap_short: Decimal,
}

impl Default for PaperInstrument {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            bid: dec!(2310.12),
            ask: dec!(2310.42),
            digits: 2,
            point: dec!(0.01),
            contract_size: dec!(100),
            volume_min: dec!(0.01),
            volume_max: dec!(100),
            volume_step: dec!(0.01),
            tick_value: dec!(1),
            stops_level: 20,
            freeze_level: 0,
            swap_long: dec!(-25.5),
            swap_short: dec!(12.1),
        }
    }
}

impl PaperInstrument {
    pub fn spec(&self) -> SymbolSpec {
        SymbolSpec {
            symbol: self.symbol.clone(),
            digits: self.digits,
            point: self.point,
            contract_size: self.contract_size,
            volume_min: self.volume_min,
            volume_max: self.volume_max,
            volume_step: self.volume_step,
            tick_size: self.point,
            tick_value: self.tick_value,
            stops_level: self.stops_level,
            freeze_level: self.freeze_level,
            swap_type: 1,
            swap_long: self.swap_long,
            swap_short: self.swap_short,
            trade_mode: 4,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PaperConfig {
    pub login: u64,
    pub name: String,
    pub server: String,
    pub company: String,
    pub currency: String,
    pub balance: Decimal,
    pub leverage: u32,
    /// Maximum random-walk step per agent tick, in points. Zero keeps quotes static.
    pub random_walk_points: u32,
    /// Synthetic depth levels per side. Zero means the venue reports no order book.
    pub book_depth: usize,
    pub instruments: Vec<PaperInstrument>,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            login: 5_000_001,
            name: "Paper Account".to_string(),
            server: "Paper-Server".to_string(),
            company: "File Bridge".to_string(),
            currency: "USD".to_string(),
            balance: dec!(10000),
            leverage: 100,
            random_walk_points: 0,
            book_depth: 5,
            instruments: vec![PaperInstrument::default()],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let home = env::var("HOME").unwrap_or_else(|_| ".".into());

        let builder = Config::builder()
            // 1. Global config from ~/.file-bridge/config.{toml,json,ini}
            .add_source(File::with_name(&format!("{}/.file-bridge/config", home)).required(false))
            // 2. Project config
            .add_source(File::with_name("config/bridge").required(false))
            // 3. Local overrides (not checked in)
            .add_source(File::with_name("config/local").required(false))
            // 4. Prefixed environment, e.g. FILEBRIDGE__AGENT__TIMER_MS
            .add_source(Environment::with_prefix("FILEBRIDGE").separator("__"));

        Self::from_builder(builder, |key| env::var(key).ok())
    }

    /// Finishes a builder by layering the legacy `MT5_*` variables on top.
    pub fn from_builder<F>(
        builder: ConfigBuilder<DefaultState>,
        lookup: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = builder;
        for (env_key, config_key) in LEGACY_ENV_KEYS {
            if let Some(value) = lookup(env_key).filter(|v| !v.trim().is_empty()) {
                builder = builder.set_override(config_key, value)?;
            }
        }
        builder.build()?.try_deserialize()
    }

    pub fn files_dir(&self) -> Result<PathBuf, BridgeError> {
        self.bridge.require_files_dir()
    }
}
