use async_trait::async_trait;
use uuid::Uuid;

/// Post-transition hook that recomputes cached figures on a beneficiary's
/// profile. Callers log failures and carry on.
#[async_trait]
pub trait StatsRefresher: Send + Sync {
    async fn refresh(&self, beneficiary_id: Uuid) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatsRefresher;

#[async_trait]
impl StatsRefresher for NoopStatsRefresher {
    async fn refresh(&self, _beneficiary_id: Uuid) -> anyhow::Result<()> {
        Ok(())
    }
}
