use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use commission_core::StatsRefresher;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Remembers every refresh request; can be told to fail.
#[derive(Default)]
pub struct RecordingStatsRefresher {
    refreshed: Mutex<Vec<Uuid>>,
    failing: AtomicBool,
}

impl RecordingStatsRefresher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn refreshed(&self) -> Vec<Uuid> {
        self.refreshed.lock().await.clone()
    }
}

#[async_trait]
impl StatsRefresher for RecordingStatsRefresher {
    async fn refresh(&self, beneficiary_id: Uuid) -> anyhow::Result<()> {
        self.refreshed.lock().await.push(beneficiary_id);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("stats cache unreachable");
        }
        Ok(())
    }
}
