use std::sync::Arc;

use anyhow::{Context, Result};
use commission_core::PaymentProvider;
use commission_engine::CommissionService;
use tracing::info;

use crate::config::ServiceConfig;
use crate::db::connect_database;
use crate::pg_store::PgCommissionStore;
use crate::redis_bus::RedisBus;
use crate::stats::RedisStatsRefresher;

/// Builds the commission service over Postgres, with stats refreshes handed
/// to the ops worker through Redis.
pub async fn commission_service(
    config: &ServiceConfig,
    provider: Arc<dyn PaymentProvider>,
) -> Result<CommissionService<PgCommissionStore>> {
    let pool = connect_database(config).await?;
    let store = PgCommissionStore::new(pool);
    store
        .ensure_schema()
        .await
        .context("failed to prepare commission schema")?;

    let redis = RedisBus::connect(&config.redis_url)?;
    let stats = RedisStatsRefresher::new(redis, config.stats_channel.clone());

    info!(
        stats_channel = %config.stats_channel,
        transfer_timeout_ms = config.transfer_timeout.as_millis() as u64,
        "commission service ready"
    );

    Ok(CommissionService::new(
        Arc::new(store),
        provider,
        Arc::new(stats),
        config.executor_settings(),
    ))
}
