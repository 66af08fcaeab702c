use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CommissionError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CommissionStatus {
    Pending,
    Approved,
    Paid,
    /// A stored value this crate does not know how to transition.
    Unrecognized(String),
}

impl CommissionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Paid => "PAID",
            Self::Unrecognized(raw) => raw.as_str(),
        }
    }

    /// Exact match on the stored spelling, the same comparison the database
    /// applies when filtering by status.
    pub fn parse(value: &str) -> Self {
        match value {
            "PENDING" => Self::Pending,
            "APPROVED" => Self::Approved,
            "PAID" => Self::Paid,
            _ => Self::Unrecognized(value.to_string()),
        }
    }

    /// The only status reachable from this one in a single step.
    pub fn next(&self) -> Option<CommissionStatus> {
        match self {
            Self::Pending => Some(Self::Approved),
            Self::Approved => Some(Self::Paid),
            Self::Paid | Self::Unrecognized(_) => None,
        }
    }
}

impl fmt::Display for CommissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PayoutStatus {
    Pending,
    Completed,
    Failed,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A commission as handed over by the referral subsystem, before it is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCommission {
    pub beneficiary_id: Uuid,
    pub referral_id: Uuid,
    pub rate: Decimal,
    pub base_amount: Decimal,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Commission {
    pub id: Uuid,
    pub beneficiary_id: Uuid,
    pub referral_id: Uuid,
    pub rate: Decimal,
    pub base_amount: Decimal,
    pub amount: Decimal,
    pub status: CommissionStatus,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub created_at: DateTime<Utc>,
}

impl Commission {
    /// Snapshots the rate and base amount and fixes `amount` for good.
    pub fn record(new: NewCommission, now: DateTime<Utc>) -> Result<Self, CommissionError> {
        if new.base_amount < Decimal::ZERO {
            return Err(CommissionError::Invalid(format!(
                "base_amount must not be negative, got {}",
                new.base_amount
            )));
        }
        if new.rate < Decimal::ZERO || new.rate > Decimal::ONE {
            return Err(CommissionError::Invalid(format!(
                "rate must be between 0 and 1, got {}",
                new.rate
            )));
        }
        if new.base_amount.normalize().scale() > BASE_AMOUNT_SCALE {
            return Err(CommissionError::Invalid(format!(
                "base_amount allows at most {BASE_AMOUNT_SCALE} decimal places, got {}",
                new.base_amount
            )));
        }
        if new.rate.normalize().scale() > RATE_SCALE {
            return Err(CommissionError::Invalid(format!(
                "rate allows at most {RATE_SCALE} decimal places, got {}",
                new.rate
            )));
        }
        if new.period_start > new.period_end {
            return Err(CommissionError::Invalid(format!(
                "period_start {} is after period_end {}",
                new.period_start, new.period_end
            )));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            beneficiary_id: new.beneficiary_id,
            referral_id: new.referral_id,
            rate: new.rate,
            base_amount: new.base_amount,
            amount: commission_amount(new.base_amount, new.rate),
            status: CommissionStatus::Pending,
            period_start: new.period_start,
            period_end: new.period_end,
            created_at: now,
        })
    }
}

/// Decimal places kept for a base amount; matches the storage column.
pub const BASE_AMOUNT_SCALE: u32 = 2;
/// Decimal places kept for a rate; matches the storage column.
pub const RATE_SCALE: u32 = 6;

pub fn commission_amount(base_amount: Decimal, rate: Decimal) -> Decimal {
    (base_amount * rate).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PayoutRecord {
    pub id: Uuid,
    pub beneficiary_id: Uuid,
    pub amount: Decimal,
    pub status: PayoutStatus,
    pub external_transfer_id: Option<String>,
    pub error_message: Option<String>,
    pub included_commission_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    /// Set once a transfer request may have reached the provider.
    pub submitted_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl PayoutRecord {
    /// Freezes the selection: the amount is the sum at this instant and the
    /// included ids never change afterwards.
    pub fn pending(beneficiary_id: Uuid, selection: &[Commission], now: DateTime<Utc>) -> Self {
        let mut included_commission_ids: Vec<Uuid> = selection.iter().map(|c| c.id).collect();
        included_commission_ids.sort();

        Self {
            id: Uuid::new_v4(),
            beneficiary_id,
            amount: selection.iter().map(|c| c.amount).sum(),
            status: PayoutStatus::Pending,
            external_transfer_id: None,
            error_message: None,
            included_commission_ids,
            created_at: now,
            submitted_at: None,
            finalized_at: None,
        }
    }

    pub fn mark_submitted(&mut self, now: DateTime<Utc>) {
        if self.submitted_at.is_none() {
            self.submitted_at = Some(now);
        }
    }

    pub fn complete(&mut self, transfer_id: &str, now: DateTime<Utc>) {
        self.status = PayoutStatus::Completed;
        self.external_transfer_id = Some(transfer_id.to_string());
        self.error_message = None;
        self.finalized_at = Some(now);
    }

    pub fn fail(&mut self, reason: &str, now: DateTime<Utc>) {
        self.status = PayoutStatus::Failed;
        self.error_message = Some(reason.to_string());
        self.finalized_at = Some(now);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BeneficiaryAccount {
    pub beneficiary_id: Uuid,
    pub external_account_reference: String,
    pub payouts_enabled: bool,
    pub updated_at: DateTime<Utc>,
}

/// Cached aggregate figures for a beneficiary's profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommissionSummary {
    pub beneficiary_id: Uuid,
    pub pending_count: i64,
    pub pending_amount: Decimal,
    pub approved_count: i64,
    pub approved_amount: Decimal,
    pub paid_count: i64,
    pub paid_amount: Decimal,
}

impl CommissionSummary {
    pub fn from_commissions(beneficiary_id: Uuid, commissions: &[Commission]) -> Self {
        let mut summary = Self {
            beneficiary_id,
            ..Self::default()
        };

        for commission in commissions.iter().filter(|c| c.beneficiary_id == beneficiary_id) {
            match commission.status {
                CommissionStatus::Pending => {
                    summary.pending_count += 1;
                    summary.pending_amount += commission.amount;
                }
                CommissionStatus::Approved => {
                    summary.approved_count += 1;
                    summary.approved_amount += commission.amount;
                }
                CommissionStatus::Paid => {
                    summary.paid_count += 1;
                    summary.paid_amount += commission.amount;
                }
                CommissionStatus::Unrecognized(_) => {}
            }
        }

        summary
    }
}
