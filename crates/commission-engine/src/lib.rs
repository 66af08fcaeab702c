pub mod aggregator;
pub mod error;
pub mod executor;
mod hooks;
pub mod service;
pub mod state_machine;

pub use aggregator::{PayoutAggregator, Preparation};
pub use error::PayoutError;
pub use executor::{ExecutorSettings, TransferExecutor};
pub use service::CommissionService;
pub use state_machine::CommissionStateMachine;
