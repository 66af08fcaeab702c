use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use commission_engine::ExecutorSettings;

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub database_url: String,
    pub redis_url: String,
    pub database_max_connections: u32,
    pub stats_channel: String,
    pub transfer_timeout: Duration,
    pub finalize_attempts: u32,
    pub finalize_backoff: Duration,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = lookup("DATABASE_URL").context("DATABASE_URL is required")?;
        let redis_url = lookup("REDIS_URL").context("REDIS_URL is required")?;
        let stats_channel =
            lookup("STATS_CHANNEL").unwrap_or_else(|| "commissions.stats".to_string());
        let database_max_connections = parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?;
        let transfer_timeout_ms = parse_or(&lookup, "TRANSFER_TIMEOUT_MS", 30_000)?;
        let finalize_attempts = parse_or(&lookup, "FINALIZE_ATTEMPTS", 3)?;
        let finalize_backoff_ms = parse_or(&lookup, "FINALIZE_BACKOFF_MS", 250)?;

        Ok(Self {
            database_url,
            redis_url,
            database_max_connections,
            stats_channel,
            transfer_timeout: Duration::from_millis(transfer_timeout_ms),
            finalize_attempts,
            finalize_backoff: Duration::from_millis(finalize_backoff_ms),
        })
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            transfer_timeout: self.transfer_timeout,
            finalize_attempts: self.finalize_attempts,
            finalize_backoff: self.finalize_backoff,
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a number, got {raw:?}")),
        None => Ok(default),
    }
}
