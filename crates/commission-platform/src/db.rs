use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;

use crate::config::ServiceConfig;

/// How long a unit of work waits for a free connection before giving up.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn pool_options(config: &ServiceConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.database_max_connections.max(1))
        .acquire_timeout(ACQUIRE_TIMEOUT)
}

pub async fn connect_database(config: &ServiceConfig) -> Result<PgPool> {
    let pool = pool_options(config)
        .connect(&config.database_url)
        .await
        .context("failed to connect to the commission database")?;

    info!(
        max_connections = config.database_max_connections,
        "commission database pool ready"
    );
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_connections: u32) -> ServiceConfig {
        ServiceConfig {
            database_url: "postgres://localhost/commissions".to_string(),
            redis_url: "redis://localhost".to_string(),
            database_max_connections: max_connections,
            stats_channel: "commissions.stats".to_string(),
            transfer_timeout: Duration::from_secs(30),
            finalize_attempts: 3,
            finalize_backoff: Duration::from_millis(250),
        }
    }

    #[test]
    fn pool_follows_configured_size() {
        let options = pool_options(&config(4));
        assert_eq!(options.get_max_connections(), 4);
        assert_eq!(options.get_acquire_timeout(), ACQUIRE_TIMEOUT);
    }

    #[test]
    fn zero_sized_pool_is_raised_to_one() {
        assert_eq!(pool_options(&config(0)).get_max_connections(), 1);
    }
}
