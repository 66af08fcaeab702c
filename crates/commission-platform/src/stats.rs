use async_trait::async_trait;
use chrono::Utc;
use commission_core::StatsRefresher;
use tracing::debug;
use uuid::Uuid;

use crate::events::StatsRefreshRequested;
use crate::redis_bus::RedisBus;

/// Hands the recomputation to the ops worker over Redis.
#[derive(Clone)]
pub struct RedisStatsRefresher {
    bus: RedisBus,
    channel: String,
}

impl RedisStatsRefresher {
    pub fn new(bus: RedisBus, channel: impl Into<String>) -> Self {
        Self {
            bus,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl StatsRefresher for RedisStatsRefresher {
    async fn refresh(&self, beneficiary_id: Uuid) -> anyhow::Result<()> {
        let event = StatsRefreshRequested {
            beneficiary_id,
            requested_at: Utc::now(),
        };
        let receivers = self.bus.publish_json(&self.channel, &event).await?;

        debug!(
            %beneficiary_id,
            channel = %self.channel,
            receivers,
            "stats refresh requested"
        );
        Ok(())
    }
}
