//! Configuration for fee-ledger-service.

use service_core::config::{env_opt, env_or, env_required, Config as CommonConfig};
use service_core::error::AppError;
use std::time::Duration;

/// Prefix for layered common settings (`FEE_LEDGER__PORT`, ...).
pub const CONFIG_PREFIX: &str = "FEE_LEDGER";

#[derive(Debug, Clone)]
pub struct FeeLedgerConfig {
    pub common: CommonConfig,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub ledger: LedgerPolicyConfig,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Transaction bounds and payment policy limits.
#[derive(Debug, Clone)]
pub struct LedgerPolicyConfig {
    /// Deadline for one rollover or payment transaction.
    pub transaction_timeout_ms: u64,
    /// Postgres `lock_timeout` applied inside ledger transactions.
    pub lock_timeout_ms: u64,
    /// Rows per batched obligation insert during rollover.
    pub rollover_batch_size: usize,
    pub max_advance_periods: i32,
}

impl Default for LedgerPolicyConfig {
    fn default() -> Self {
        Self {
            transaction_timeout_ms: 5_000,
            lock_timeout_ms: 2_000,
            rollover_batch_size: 500,
            max_advance_periods: 24,
        }
    }
}

impl LedgerPolicyConfig {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.transaction_timeout_ms == 0 {
            return Err(config_error("FEE_LEDGER_TX_TIMEOUT_MS must be positive"));
        }
        if self.lock_timeout_ms == 0 || self.lock_timeout_ms > self.transaction_timeout_ms {
            return Err(config_error(
                "FEE_LEDGER_LOCK_TIMEOUT_MS must be positive and not exceed the transaction timeout",
            ));
        }
        if self.rollover_batch_size == 0 {
            return Err(config_error("FEE_LEDGER_ROLLOVER_BATCH_SIZE must be positive"));
        }
        if self.max_advance_periods < 1 {
            return Err(config_error("FEE_LEDGER_MAX_ADVANCE_PERIODS must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    /// When unset, events are only written to the log.
    pub webhook_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_ms: 3_000,
        }
    }
}

fn config_error(msg: &str) -> AppError {
    AppError::ConfigError(anyhow::anyhow!("{}", msg))
}

impl FeeLedgerConfig {
    /// Load configuration from `.env`, the optional `configuration` file and
    /// environment variables.
    pub fn from_env() -> Result<Self, AppError> {
        let common = CommonConfig::load_with_prefix(CONFIG_PREFIX)?;

        let ledger = LedgerPolicyConfig {
            transaction_timeout_ms: env_or("FEE_LEDGER_TX_TIMEOUT_MS", 5_000)?,
            lock_timeout_ms: env_or("FEE_LEDGER_LOCK_TIMEOUT_MS", 2_000)?,
            rollover_batch_size: env_or("FEE_LEDGER_ROLLOVER_BATCH_SIZE", 500)?,
            max_advance_periods: env_or("FEE_LEDGER_MAX_ADVANCE_PERIODS", 24)?,
        };
        ledger.validate()?;

        let database = DatabaseConfig {
            url: env_required("FEE_LEDGER_DATABASE_URL")?,
            max_connections: env_or("FEE_LEDGER_DB_MAX_CONNECTIONS", 10)?,
            min_connections: env_or("FEE_LEDGER_DB_MIN_CONNECTIONS", 1)?,
        };
        if database.min_connections > database.max_connections {
            return Err(config_error(
                "FEE_LEDGER_DB_MIN_CONNECTIONS exceeds FEE_LEDGER_DB_MAX_CONNECTIONS",
            ));
        }

        Ok(Self {
            common,
            service_name: env_or("FEE_LEDGER_SERVICE_NAME", "fee-ledger-service".to_string())?,
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: env_or("FEE_LEDGER_LOG_LEVEL", "info".to_string())?,
            otlp_endpoint: env_opt("FEE_LEDGER_OTLP_ENDPOINT"),
            database,
            ledger,
            notifications: NotificationConfig {
                webhook_url: env_opt("FEE_LEDGER_NOTIFICATION_WEBHOOK_URL"),
                timeout_ms: env_or("FEE_LEDGER_NOTIFICATION_TIMEOUT_MS", 3_000)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_valid() {
        assert!(LedgerPolicyConfig::default().validate().is_ok());
    }

    #[test]
    fn lock_timeout_cannot_exceed_transaction_timeout() {
        let policy = LedgerPolicyConfig {
            transaction_timeout_ms: 1_000,
            lock_timeout_ms: 2_000,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn zero_batch_size_rejected() {
        let policy = LedgerPolicyConfig {
            rollover_batch_size: 0,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }
}
