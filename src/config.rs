//! Application Configuration
//!
//! Layered configuration: `config/default.toml` (optional) overridden by
//! `CLOB_`-prefixed environment variables (`CLOB_MATCHING__BASE_INTERVAL_MS`
//! etc.). `.env` files are honoured by the caller via `dotenvy`. Missing
//! ledger settings are fatal before the engine opens its ports.

use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::TradeCacheConfig;
use crate::ledger::json_api::JsonApiConfig;
use crate::ledger::token::TokenSource;
use crate::models::TradingPair;
use crate::services::matching::MatchingConfig;
use crate::services::orders::OrderServiceConfig;
use crate::services::read_model::ReadModelConfig;
use crate::services::settlement::SettlementConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Missing required configuration: {0}")]
    Missing(&'static str),

    #[error("Invalid configuration value for {field}: {value}")]
    Invalid { field: &'static str, value: String },
}

fn default_environment() -> String {
    "development".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Ledger JSON API base URL, e.g. `https://ledger:7575`
    #[serde(default)]
    pub ledger_http_url: String,
    /// Ledger WebSocket base URL, e.g. `wss://ledger:7575`
    #[serde(default)]
    pub ledger_ws_url: String,
    /// Exchange operator party id
    #[serde(default)]
    pub operator_party: String,
    /// Operator access token (or a file that holds it)
    #[serde(default)]
    pub ledger_token: Option<String>,
    #[serde(default)]
    pub ledger_token_file: Option<PathBuf>,

    #[serde(default)]
    pub matching_engine: MatchingSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub stop_loss: StopLossSettings,
    #[serde(default)]
    pub order: OrderSettings,

    /// Minimum asset unit worth an on-ledger transfer
    #[serde(default = "defaults::dust_threshold")]
    pub dust_threshold: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatchingSettings {
    pub base_interval_ms: u64,
    pub medium_idle_interval_ms: u64,
    pub slow_idle_interval_ms: u64,
    pub watchdog_ms: u64,
    pub rematch_cooldown_ms: u64,
    pub trading_pairs: Vec<String>,
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            base_interval_ms: 2000,
            medium_idle_interval_ms: 10_000,
            slow_idle_interval_ms: 30_000,
            watchdog_ms: 25_000,
            rematch_cooldown_ms: 30_000,
            trading_pairs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub max_trades_per_pair: usize,
    pub save_debounce_ms: u64,
    pub file_path: PathBuf,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_trades_per_pair: 200,
            save_debounce_ms: 2000,
            file_path: PathBuf::from("data/recent_trades.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StopLossSettings {
    pub backup_poll_ms: u64,
}

impl Default for StopLossSettings {
    fn default() -> Self {
        Self {
            backup_poll_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrderSettings {
    pub market_slippage_buffer: Decimal,
}

impl Default for OrderSettings {
    fn default() -> Self {
        Self {
            market_slippage_buffer: Decimal::new(5, 2),
        }
    }
}

mod defaults {
    use rust_decimal::Decimal;

    pub fn dust_threshold() -> Decimal {
        Decimal::from_parts(1, 0, 0, false, 6) // 1e-6
    }
}

impl AppConfig {
    /// Load from `config/default.toml` (optional) plus `CLOB_*` environment
    /// overrides, then validate the required ledger settings.
    pub fn load() -> Result<Self, ConfigError> {
        let config: AppConfig = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(
                config::Environment::with_prefix("CLOB")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("matching_engine.trading_pairs")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ledger_http_url.is_empty() {
            return Err(ConfigError::Missing("ledger_http_url"));
        }
        if self.ledger_ws_url.is_empty() {
            return Err(ConfigError::Missing("ledger_ws_url"));
        }
        if self.operator_party.is_empty() {
            return Err(ConfigError::Missing("operator_party"));
        }
        if self.ledger_token.is_none() && self.ledger_token_file.is_none() {
            return Err(ConfigError::Missing("ledger_token or ledger_token_file"));
        }
        if self.matching_engine.trading_pairs.is_empty() {
            return Err(ConfigError::Missing("matching_engine.trading_pairs"));
        }
        self.trading_pairs()?;
        Ok(())
    }

    /// Configured pairs, in order
    pub fn trading_pairs(&self) -> Result<Vec<TradingPair>, ConfigError> {
        self.matching_engine
            .trading_pairs
            .iter()
            .map(|raw| {
                raw.parse().map_err(|_| ConfigError::Invalid {
                    field: "matching_engine.trading_pairs",
                    value: raw.clone(),
                })
            })
            .collect()
    }

    pub fn token_source(&self) -> TokenSource {
        match (&self.ledger_token, &self.ledger_token_file) {
            (Some(token), _) => TokenSource::Static(token.clone()),
            (None, Some(path)) => TokenSource::File(path.clone()),
            // validate() guarantees one of the two is present
            (None, None) => TokenSource::Static(String::new()),
        }
    }

    pub fn json_api_config(&self) -> JsonApiConfig {
        JsonApiConfig::new(self.ledger_http_url.clone(), self.ledger_ws_url.clone())
    }

    pub fn read_model_config(&self) -> ReadModelConfig {
        ReadModelConfig::default()
    }

    pub fn matching_config(&self) -> Result<MatchingConfig, ConfigError> {
        Ok(MatchingConfig {
            pairs: self.trading_pairs()?,
            base_interval: Duration::from_millis(self.matching_engine.base_interval_ms),
            medium_idle_interval: Duration::from_millis(
                self.matching_engine.medium_idle_interval_ms,
            ),
            slow_idle_interval: Duration::from_millis(self.matching_engine.slow_idle_interval_ms),
            watchdog: Duration::from_millis(self.matching_engine.watchdog_ms),
            rematch_cooldown: Duration::from_millis(self.matching_engine.rematch_cooldown_ms),
            ..Default::default()
        })
    }

    pub fn trade_cache_config(&self) -> TradeCacheConfig {
        TradeCacheConfig {
            path: self.cache.file_path.clone(),
            max_trades_per_pair: self.cache.max_trades_per_pair,
            save_debounce: Duration::from_millis(self.cache.save_debounce_ms),
        }
    }

    pub fn settlement_config(&self) -> SettlementConfig {
        SettlementConfig {
            operator: self.operator_party.clone(),
            dust_threshold: self.dust_threshold,
        }
    }

    pub fn order_service_config(&self) -> Result<OrderServiceConfig, ConfigError> {
        Ok(OrderServiceConfig {
            operator: self.operator_party.clone(),
            pairs: self.trading_pairs()?,
            market_slippage_buffer: self.order.market_slippage_buffer,
        })
    }

    pub fn backup_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_loss.backup_poll_ms)
    }
}
