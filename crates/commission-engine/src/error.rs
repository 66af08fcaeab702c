use commission_core::{CommissionStatus, PayoutStatus, StoreError, TransferError};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PayoutError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("transfer for payout {payout_id} has an unknown outcome: {reason}")]
    TransferIndeterminate { payout_id: Uuid, reason: String },

    #[error(
        "payout {payout_id} includes commission {commission_id} in status {status}, expected APPROVED"
    )]
    IncludedCommissionNotPayable {
        payout_id: Uuid,
        commission_id: Uuid,
        status: CommissionStatus,
    },

    #[error(
        "payout {payout_id} was already submitted but commission {commission_id} is {status}; left pending for reconciliation"
    )]
    NeedsReconciliation {
        payout_id: Uuid,
        commission_id: Uuid,
        status: CommissionStatus,
    },

    #[error("payout {payout_id} transfer {transfer_id} was accepted but finalization failed: {source}")]
    FinalizationFailed {
        payout_id: Uuid,
        transfer_id: String,
        #[source]
        source: StoreError,
    },

    #[error("payout {payout_id} invariant violated: {message}")]
    InvariantViolation { payout_id: Uuid, message: String },

    #[error("payout {0} not found")]
    PayoutNotFound(Uuid),

    #[error("payout {payout_id} is already {status}")]
    PayoutAlreadyFinal {
        payout_id: Uuid,
        status: PayoutStatus,
    },

    #[error("account status lookup for beneficiary {beneficiary_id} failed: {source}")]
    AccountSync {
        beneficiary_id: Uuid,
        #[source]
        source: TransferError,
    },
}

impl PayoutError {
    /// Whether the caller may try again later without risking a double payout.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransferIndeterminate { .. }
                | Self::FinalizationFailed { .. }
                | Self::AccountSync { .. }
                | Self::Store(StoreError::Unavailable(_))
        )
    }
}
