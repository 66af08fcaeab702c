use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountStatus {
    pub payouts_enabled: bool,
    pub external_account_reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferRequest {
    pub amount: Decimal,
    pub destination_reference: String,
    /// Always the payout id; a repeated call with the same key must not move
    /// money twice.
    pub idempotency_key: String,
    pub payout_id: Uuid,
    pub beneficiary_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferReceipt {
    pub transfer_id: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    /// The provider definitely did not move the money.
    #[error("transfer rejected: {0}")]
    Rejected(String),

    /// The effect on the provider side is unknown (network error, timeout).
    #[error("transfer outcome unknown: {0}")]
    Indeterminate(String),
}

/// External payment provider. Clients are constructed at startup and
/// injected, never reached through a global.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn account_status(
        &self,
        beneficiary_id: Uuid,
    ) -> Result<Option<AccountStatus>, TransferError>;

    async fn create_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<TransferReceipt, TransferError>;
}
