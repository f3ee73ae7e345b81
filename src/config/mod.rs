//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL and Oracle password carry credentials, so
//! they are wrapped in `secrecy::SecretString` to keep them out of logs.

use crate::error::{Error, Result};
use crate::outbox::Strategy;
use secrecy::SecretString;
use std::time::Duration;

/// Which database engine holds the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    /// Only the probe strategy; needs the `oracle` cargo feature.
    Oracle,
}

impl std::str::FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Backend::Postgres),
            "oracle" => Ok(Backend::Oracle),
            other => Err(Error::Config(format!(
                "unknown outbox backend '{other}' (expected 'postgres' or 'oracle')"
            ))),
        }
    }
}

/// Connection settings for the selected backend.
#[derive(Debug, Clone)]
pub enum Store {
    Postgres { url: SecretString },
    Oracle(OracleConfig),
}

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub username: String,
    pub password: SecretString,
    /// Easy Connect string or TNS alias, e.g. "localhost:1521/free".
    pub connect_string: String,
}

#[derive(Debug)]
pub struct Config {
    pub store: Store,
    pub strategy: Strategy,
    /// Ask the skip-locked strategy for ascending id order.
    pub fifo: bool,
    pub max_connections: u32,
    /// How long an idle worker waits before claiming again.
    pub poll_interval: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let backend = optional_var("OUTBOX_BACKEND")?.unwrap_or(Backend::Postgres);
        let (store, strategy) = match backend {
            Backend::Postgres => (
                Store::Postgres {
                    url: SecretString::from(required_var("DATABASE_URL")?),
                },
                optional_var("OUTBOX_STRATEGY")?.unwrap_or(Strategy::SkipLocked),
            ),
            Backend::Oracle => {
                let strategy = optional_var("OUTBOX_STRATEGY")?.unwrap_or(Strategy::Probe);
                if strategy != Strategy::Probe {
                    return Err(Error::Config(format!(
                        "the oracle backend supports only the probe strategy, not {strategy}"
                    )));
                }
                let oracle = OracleConfig {
                    username: required_var("ORACLE_USER")?,
                    password: SecretString::from(required_var("ORACLE_PASSWORD")?),
                    connect_string: required_var("ORACLE_CONNECT_STRING")?,
                };
                (Store::Oracle(oracle), strategy)
            }
        };

        Ok(Self {
            store,
            strategy,
            fifo: optional_var("OUTBOX_FIFO")?.unwrap_or(false),
            max_connections: optional_var("DB_MAX_CONNECTIONS")?.unwrap_or(10),
            poll_interval: Duration::from_millis(
                optional_var("OUTBOX_POLL_INTERVAL_MS")?.unwrap_or(500),
            ),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid value '{raw}' for {name}: {e}"))),
        Err(_) => Ok(None),
    }
}
