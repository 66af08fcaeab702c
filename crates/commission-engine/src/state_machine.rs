use std::sync::Arc;

use commission_core::{
    ApproveOutcome, BulkApproveOutcome, BulkMarkPaidOutcome, CommissionSelection,
    CommissionStatus, CommissionStore, MarkPaidOutcome, StatsRefresher, StoreError, UnitOfWork,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::hooks::refresh_stats;

enum SingleTransition {
    Transitioned,
    NotFound,
    Current(CommissionStatus),
    /// In the `from` status, but included in a payout still awaiting its transfer.
    Claimed,
}

struct BulkTransition {
    transitioned: u64,
    skipped: u64,
}

/// Enforces `PENDING -> APPROVED -> PAID` one step at a time, under row locks.
pub struct CommissionStateMachine<S> {
    store: Arc<S>,
    stats: Arc<dyn StatsRefresher>,
}

impl<S: CommissionStore> CommissionStateMachine<S> {
    pub fn new(store: Arc<S>, stats: Arc<dyn StatsRefresher>) -> Self {
        Self { store, stats }
    }

    pub async fn approve_one(
        &self,
        commission_id: Uuid,
        beneficiary_id: Uuid,
    ) -> Result<ApproveOutcome, StoreError> {
        let outcome = match self
            .transition_one(
                commission_id,
                beneficiary_id,
                CommissionStatus::Pending,
                CommissionStatus::Approved,
            )
            .await?
        {
            SingleTransition::Transitioned => ApproveOutcome::Approved,
            SingleTransition::NotFound => ApproveOutcome::NotFound,
            SingleTransition::Current(CommissionStatus::Approved) => {
                ApproveOutcome::AlreadyApproved
            }
            SingleTransition::Current(CommissionStatus::Paid) => ApproveOutcome::AlreadyPaid,
            SingleTransition::Current(other) => ApproveOutcome::UnexpectedStatus(other),
            SingleTransition::Claimed => ApproveOutcome::UnexpectedStatus(CommissionStatus::Pending),
        };

        info!(%commission_id, %beneficiary_id, ?outcome, "approve commission");
        Ok(outcome)
    }

    /// Records a payment made outside the platform. Moves no money, and refuses
    /// commissions that a pending payout is about to transfer.
    pub async fn mark_paid_one(
        &self,
        commission_id: Uuid,
        beneficiary_id: Uuid,
    ) -> Result<MarkPaidOutcome, StoreError> {
        let outcome = match self
            .transition_one(
                commission_id,
                beneficiary_id,
                CommissionStatus::Approved,
                CommissionStatus::Paid,
            )
            .await?
        {
            SingleTransition::Transitioned => MarkPaidOutcome::Paid,
            SingleTransition::NotFound => MarkPaidOutcome::NotFound,
            SingleTransition::Current(CommissionStatus::Pending) => MarkPaidOutcome::StillPending,
            SingleTransition::Current(CommissionStatus::Paid) => MarkPaidOutcome::AlreadyPaid,
            SingleTransition::Current(other) => MarkPaidOutcome::UnexpectedStatus(other),
            SingleTransition::Claimed => MarkPaidOutcome::InPendingPayout,
        };

        info!(%commission_id, %beneficiary_id, ?outcome, "mark commission paid");
        Ok(outcome)
    }

    pub async fn approve_bulk(
        &self,
        commission_ids: &[Uuid],
        beneficiary_id: Uuid,
    ) -> Result<BulkApproveOutcome, StoreError> {
        let result = self
            .transition_bulk(
                commission_ids,
                beneficiary_id,
                CommissionStatus::Pending,
                CommissionStatus::Approved,
            )
            .await?;

        info!(
            %beneficiary_id,
            approved = result.transitioned,
            skipped = result.skipped,
            "bulk approve commissions"
        );
        Ok(BulkApproveOutcome {
            approved_count: result.transitioned,
            skipped_count: result.skipped,
        })
    }

    pub async fn mark_paid_bulk(
        &self,
        commission_ids: &[Uuid],
        beneficiary_id: Uuid,
    ) -> Result<BulkMarkPaidOutcome, StoreError> {
        let result = self
            .transition_bulk(
                commission_ids,
                beneficiary_id,
                CommissionStatus::Approved,
                CommissionStatus::Paid,
            )
            .await?;

        info!(
            %beneficiary_id,
            paid = result.transitioned,
            skipped = result.skipped,
            "bulk mark commissions paid"
        );
        Ok(BulkMarkPaidOutcome {
            paid_count: result.transitioned,
            skipped_count: result.skipped,
        })
    }

    async fn transition_one(
        &self,
        commission_id: Uuid,
        beneficiary_id: Uuid,
        from: CommissionStatus,
        to: CommissionStatus,
    ) -> Result<SingleTransition, StoreError> {
        let mut tx = self.store.begin().await?;
        let locked = tx
            .lock_commissions(&CommissionSelection::by_ids(
                beneficiary_id,
                &[commission_id],
            ))
            .await?;

        let Some(commission) = locked.into_iter().next() else {
            return Ok(SingleTransition::NotFound);
        };
        if commission.status != from {
            return Ok(SingleTransition::Current(commission.status));
        }
        if to == CommissionStatus::Paid {
            let unclaimed = tx
                .lock_commissions(
                    &CommissionSelection::by_ids(beneficiary_id, &[commission_id])
                        .unclaimed_only(),
                )
                .await?;
            if unclaimed.is_empty() {
                return Ok(SingleTransition::Claimed);
            }
        }

        tx.update_commission_status(&[commission_id], &to).await?;
        tx.commit().await?;

        refresh_stats(self.stats.as_ref(), beneficiary_id).await;
        Ok(SingleTransition::Transitioned)
    }

    /// Locks the whole id set up front, then moves only the rows currently in
    /// `from`. Everything else counts as skipped, including rows a pending
    /// payout holds when moving to PAID.
    async fn transition_bulk(
        &self,
        commission_ids: &[Uuid],
        beneficiary_id: Uuid,
        from: CommissionStatus,
        to: CommissionStatus,
    ) -> Result<BulkTransition, StoreError> {
        let selection = CommissionSelection::by_ids(beneficiary_id, commission_ids);
        let requested = selection.ids.as_ref().map_or(0, Vec::len) as u64;
        if requested == 0 {
            return Ok(BulkTransition {
                transitioned: 0,
                skipped: 0,
            });
        }

        let mut tx = self.store.begin().await?;
        let locked = tx.lock_commissions(&selection).await?;
        let (mut eligible, ineligible): (Vec<_>, Vec<_>) =
            locked.into_iter().partition(|c| c.status == from);

        if to == CommissionStatus::Paid && !eligible.is_empty() {
            let unclaimed: Vec<Uuid> = tx
                .lock_commissions(&selection.clone().unclaimed_only())
                .await?
                .into_iter()
                .map(|c| c.id)
                .collect();
            eligible.retain(|c| {
                let free = unclaimed.contains(&c.id);
                if !free {
                    debug!(commission_id = %c.id, "skipping commission held by a pending payout");
                }
                free
            });
        }

        for commission in &ineligible {
            debug!(
                commission_id = %commission.id,
                status = %commission.status,
                "skipping commission in bulk transition"
            );
        }

        let eligible_ids: Vec<Uuid> = eligible.iter().map(|c| c.id).collect();
        let transitioned = if eligible_ids.is_empty() {
            0
        } else {
            let updated = tx.update_commission_status(&eligible_ids, &to).await?;
            tx.commit().await?;
            updated
        };

        if transitioned > 0 {
            refresh_stats(self.stats.as_ref(), beneficiary_id).await;
        }

        Ok(BulkTransition {
            transitioned,
            skipped: requested - transitioned,
        })
    }
}
