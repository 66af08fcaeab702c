use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::CommissionStatus;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApproveOutcome {
    Approved,
    AlreadyApproved,
    AlreadyPaid,
    NotFound,
    UnexpectedStatus(CommissionStatus),
}

impl ApproveOutcome {
    /// True for every outcome a repeated click should render as success.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Approved | Self::AlreadyApproved | Self::AlreadyPaid)
    }
}

/// Result of recording an off-platform payment for an approved commission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MarkPaidOutcome {
    Paid,
    AlreadyPaid,
    StillPending,
    /// Approved but included in a payout whose transfer is not settled yet.
    InPendingPayout,
    NotFound,
    UnexpectedStatus(CommissionStatus),
}

impl MarkPaidOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Paid | Self::AlreadyPaid)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BulkApproveOutcome {
    pub approved_count: u64,
    pub skipped_count: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BulkMarkPaidOutcome {
    pub paid_count: u64,
    pub skipped_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PayoutOutcome {
    Completed {
        payout_id: Uuid,
        amount: Decimal,
        transfer_id: String,
    },
    Failed {
        payout_id: Uuid,
        reason: String,
    },
    NoAccount,
    AccountNotReady,
    NothingToPay,
}

impl PayoutOutcome {
    pub fn payout_id(&self) -> Option<Uuid> {
        match self {
            Self::Completed { payout_id, .. } | Self::Failed { payout_id, .. } => Some(*payout_id),
            Self::NoAccount | Self::AccountNotReady | Self::NothingToPay => None,
        }
    }
}
