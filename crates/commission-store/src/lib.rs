pub mod memory;
pub mod provider;
pub mod stats;

pub use memory::{InMemoryCommissionStore, InMemoryUnitOfWork};
pub use provider::{ScriptedPaymentProvider, ScriptedTransfer};
pub use stats::RecordingStatsRefresher;
