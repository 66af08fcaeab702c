use anyhow::{Context, Result};
use commission_core::CommissionStore;
use commission_platform::{
    PgCommissionStore, RedisBus, ServiceConfig, StatsRefreshRequested, connect_database,
    decode_message,
};
use futures_util::StreamExt;
use redis::Msg;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "commission_ops=info".to_string()),
        )
        .init();

    let config = ServiceConfig::from_env()?;
    let pool = connect_database(&config).await?;
    let store = PgCommissionStore::new(pool);
    store
        .ensure_schema()
        .await
        .context("failed to prepare commission schema")?;
    let redis = RedisBus::connect(&config.redis_url)?;

    let mut pubsub = redis.subscribe(&config.stats_channel).await?;
    let mut messages = pubsub.on_message();

    info!("ops worker subscribed to {}", config.stats_channel);

    loop {
        let msg = messages
            .next()
            .await
            .with_context(|| format!("{} stream ended unexpectedly", config.stats_channel))?;
        if let Err(err) = handle_message(&store, msg).await {
            error!("failed to refresh commission stats: {err:#}");
        }
    }
}

async fn handle_message(store: &PgCommissionStore, msg: Msg) -> Result<()> {
    let event: StatsRefreshRequested = decode_message(&msg)?;

    let summary = store
        .summarize(event.beneficiary_id)
        .await
        .with_context(|| format!("failed to summarize {}", event.beneficiary_id))?;
    store.refresh_cached_stats(&summary).await?;

    info!(
        beneficiary_id = %event.beneficiary_id,
        pending = summary.pending_count,
        approved = summary.approved_count,
        paid = summary.paid_count,
        "commission stats refreshed"
    );
    Ok(())
}
