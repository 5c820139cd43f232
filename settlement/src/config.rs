//! Configuration for settlement engine

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Settlement engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Commission charged to the winning carrier, as a fraction of the offer price
    #[serde(with = "rust_decimal::serde::str")]
    pub commission_rate: Decimal,

    /// Embedded ledger store (data dir, RocksDB tuning, lock wait bound)
    pub ledger: freight_ledger::Config,

    /// Idempotency record retention
    pub idempotency: IdempotencyConfig,

    /// Side-effect dispatcher
    pub dispatcher: DispatcherConfig,

    /// Log output
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "freight-settlement".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            commission_rate: Decimal::new(1, 2), // 1%
            ledger: freight_ledger::Config::default(),
            idempotency: IdempotencyConfig::default(),
            dispatcher: DispatcherConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Idempotency configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// Records older than this are purged and no longer replayed
    pub retention_hours: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            retention_hours: 24,
        }
    }
}

impl IdempotencyConfig {
    /// Retention as a chrono duration (capped at ten years)
    pub fn retention(&self) -> chrono::Duration {
        const MAX_RETENTION_HOURS: u64 = 24 * 365 * 10;
        chrono::Duration::hours(self.retention_hours.min(MAX_RETENTION_HOURS) as i64)
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Bounded queue size; side effects beyond it are dropped
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of plain text
    pub json: bool,

    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.ledger = freight_ledger::Config::from_env()?;

        if let Ok(rate) = std::env::var("FREIGHT_COMMISSION_RATE") {
            config.commission_rate = rate.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid FREIGHT_COMMISSION_RATE: {}", e))
            })?;
        }

        if let Ok(hours) = std::env::var("FREIGHT_IDEMPOTENCY_RETENTION_HOURS") {
            config.idempotency.retention_hours = hours.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid FREIGHT_IDEMPOTENCY_RETENTION_HOURS: {}", e))
            })?;
        }

        if let Ok(json) = std::env::var("FREIGHT_LOG_JSON") {
            config.logging.json = matches!(json.as_str(), "1" | "true" | "yes");
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.commission_rate < Decimal::ZERO || self.commission_rate >= Decimal::ONE {
            return Err(crate::Error::Config(format!(
                "commission_rate must be in [0, 1), got {}",
                self.commission_rate
            )));
        }
        if self.dispatcher.queue_capacity == 0 {
            return Err(crate::Error::Config(
                "dispatcher.queue_capacity must be positive".to_string(),
            ));
        }
        if self.ledger.locks.timeout_ms == 0 {
            return Err(crate::Error::Config(
                "ledger.locks.timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Config rooted at `data_dir` (tests, embedded use)
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let mut config = Config::default();
        config.ledger.data_dir = data_dir.into();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_commission_is_one_percent() {
        let config = Config::default();
        assert_eq!(config.commission_rate, Decimal::new(1, 2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_nested_ledger_table() {
        let config: Config = toml::from_str(
            r#"
            commission_rate = "0.025"

            [ledger]
            data_dir = "/srv/freight"

            [ledger.locks]
            timeout_ms = 750

            [dispatcher]
            queue_capacity = 16
            "#,
        )
        .unwrap();

        assert_eq!(config.commission_rate, Decimal::new(25, 3));
        assert_eq!(config.ledger.data_dir, PathBuf::from("/srv/freight"));
        assert_eq!(config.ledger.locks.timeout_ms, 750);
        assert_eq!(config.dispatcher.queue_capacity, 16);
        assert_eq!(config.idempotency.retention_hours, 24);
    }

    #[test]
    fn test_rejects_out_of_range_rate() {
        let mut config = Config::default();
        config.commission_rate = Decimal::ONE;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));

        config.commission_rate = Decimal::new(-1, 2);
        assert!(config.validate().is_err());

        config.commission_rate = Decimal::ZERO;
        assert!(config.validate().is_ok());
    }
}
