use commission_core::StatsRefresher;
use tracing::warn;
use uuid::Uuid;

/// Runs after the transition has committed; a failing hook never undoes it.
pub(crate) async fn refresh_stats(stats: &dyn StatsRefresher, beneficiary_id: Uuid) {
    if let Err(err) = stats.refresh(beneficiary_id).await {
        warn!(%beneficiary_id, "stats refresh failed: {err:#}");
    }
}
