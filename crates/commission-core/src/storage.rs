use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    BeneficiaryAccount, Commission, CommissionStatus, CommissionSummary, PayoutRecord,
};

/// Predicate for [`UnitOfWork::lock_commissions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommissionSelection {
    pub beneficiary_id: Uuid,
    /// `None` means every commission of the beneficiary.
    pub ids: Option<Vec<Uuid>>,
    pub status: Option<CommissionStatus>,
    /// Skip commissions already included in a payout that is still pending.
    pub unclaimed: bool,
}

impl CommissionSelection {
    pub fn by_ids(beneficiary_id: Uuid, ids: &[Uuid]) -> Self {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();

        Self {
            beneficiary_id,
            ids: Some(ids),
            status: None,
            unclaimed: false,
        }
    }

    pub fn payable(beneficiary_id: Uuid, ids: Option<&[Uuid]>) -> Self {
        let ids = ids.map(|ids| {
            let mut ids = ids.to_vec();
            ids.sort();
            ids.dedup();
            ids
        });

        Self {
            beneficiary_id,
            ids,
            status: Some(CommissionStatus::Approved),
            unclaimed: true,
        }
    }

    /// Narrows the selection to commissions no pending payout includes.
    pub fn unclaimed_only(mut self) -> Self {
        self.unclaimed = true;
        self
    }

    /// Row-local part of the predicate; `unclaimed` needs payout data and is
    /// checked by the store.
    pub fn matches(&self, commission: &Commission) -> bool {
        commission.beneficiary_id == self.beneficiary_id
            && self
                .ids
                .as_ref()
                .is_none_or(|ids| ids.binary_search(&commission.id).is_ok())
            && self
                .status
                .as_ref()
                .is_none_or(|status| &commission.status == status)
    }
}

/// A transaction against the store. Dropping it without [`UnitOfWork::commit`]
/// discards its writes and releases its locks.
#[async_trait]
pub trait UnitOfWork: Send {
    async fn lock_account(
        &mut self,
        beneficiary_id: Uuid,
    ) -> Result<Option<BeneficiaryAccount>, StoreError>;

    /// Exclusively locks every commission matching `selection`, in id order,
    /// and returns them as seen after the locks were granted.
    async fn lock_commissions(
        &mut self,
        selection: &CommissionSelection,
    ) -> Result<Vec<Commission>, StoreError>;

    async fn update_commission_status(
        &mut self,
        ids: &[Uuid],
        status: &CommissionStatus,
    ) -> Result<u64, StoreError>;

    async fn lock_payout(&mut self, payout_id: Uuid) -> Result<Option<PayoutRecord>, StoreError>;

    async fn insert_payout(&mut self, payout: &PayoutRecord) -> Result<(), StoreError>;

    /// Persists status, transfer id, error message and finalization time.
    async fn update_payout(&mut self, payout: &PayoutRecord) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CommissionStore: Send + Sync {
    type Tx: UnitOfWork + 'static;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    async fn insert_commission(&self, commission: &Commission) -> Result<(), StoreError>;
    async fn commission(&self, commission_id: Uuid) -> Result<Option<Commission>, StoreError>;
    async fn commissions_for(&self, beneficiary_id: Uuid) -> Result<Vec<Commission>, StoreError>;

    async fn payout(&self, payout_id: Uuid) -> Result<Option<PayoutRecord>, StoreError>;
    async fn payouts_for(&self, beneficiary_id: Uuid) -> Result<Vec<PayoutRecord>, StoreError>;

    async fn account(&self, beneficiary_id: Uuid)
    -> Result<Option<BeneficiaryAccount>, StoreError>;
    async fn upsert_account(&self, account: &BeneficiaryAccount) -> Result<(), StoreError>;

    async fn summarize(&self, beneficiary_id: Uuid) -> Result<CommissionSummary, StoreError>;
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, Utc};
    use rust_decimal::Decimal;

    use super::*;

    fn commission(beneficiary_id: Uuid, status: CommissionStatus) -> Commission {
        Commission {
            id: Uuid::new_v4(),
            beneficiary_id,
            referral_id: Uuid::new_v4(),
            rate: Decimal::new(1, 1),
            base_amount: Decimal::new(100, 0),
            amount: Decimal::new(1000, 2),
            status,
            period_start: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            period_end: NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn payable_selection_without_ids_matches_every_approved_row() {
        let beneficiary_id = Uuid::new_v4();
        let selection = CommissionSelection::payable(beneficiary_id, None);

        assert!(selection.matches(&commission(beneficiary_id, CommissionStatus::Approved)));
        assert!(!selection.matches(&commission(beneficiary_id, CommissionStatus::Pending)));
        assert!(!selection.matches(&commission(Uuid::new_v4(), CommissionStatus::Approved)));
        assert!(selection.unclaimed);
    }

    #[test]
    fn id_selection_ignores_status_and_dedups() {
        let beneficiary_id = Uuid::new_v4();
        let paid = commission(beneficiary_id, CommissionStatus::Paid);
        let other = commission(beneficiary_id, CommissionStatus::Pending);
        let selection = CommissionSelection::by_ids(beneficiary_id, &[paid.id, paid.id]);

        assert_eq!(selection.ids.as_ref().map(Vec::len), Some(1));
        assert!(selection.matches(&paid));
        assert!(!selection.matches(&other));
    }

    #[test]
    fn empty_explicit_subset_matches_nothing() {
        let beneficiary_id = Uuid::new_v4();
        let selection = CommissionSelection::payable(beneficiary_id, Some(&[]));

        assert!(!selection.matches(&commission(beneficiary_id, CommissionStatus::Approved)));
    }
}
