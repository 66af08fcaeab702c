pub mod error;
pub mod models;
pub mod outcomes;
pub mod provider;
pub mod stats;
pub mod storage;

pub use error::{CommissionError, StoreError};
pub use models::{
    BASE_AMOUNT_SCALE, BeneficiaryAccount, Commission, CommissionStatus, CommissionSummary,
    NewCommission, PayoutRecord, PayoutStatus, RATE_SCALE, commission_amount,
};
pub use outcomes::{
    ApproveOutcome, BulkApproveOutcome, BulkMarkPaidOutcome, MarkPaidOutcome, PayoutOutcome,
};
pub use provider::{AccountStatus, PaymentProvider, TransferError, TransferReceipt, TransferRequest};
pub use stats::{NoopStatsRefresher, StatsRefresher};
pub use storage::{CommissionSelection, CommissionStore, UnitOfWork};
