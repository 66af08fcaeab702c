use std::sync::Arc;

use chrono::Utc;
use commission_core::{
    ApproveOutcome, BeneficiaryAccount, BulkApproveOutcome, BulkMarkPaidOutcome, Commission,
    CommissionError, CommissionStore, MarkPaidOutcome, NewCommission, PaymentProvider,
    PayoutOutcome, PayoutRecord, StatsRefresher, StoreError,
};
use tracing::info;
use uuid::Uuid;

use crate::aggregator::{PayoutAggregator, Preparation};
use crate::error::PayoutError;
use crate::executor::{ExecutorSettings, TransferExecutor};
use crate::state_machine::CommissionStateMachine;

/// Entry point for callers that are already authorized to act on commissions.
pub struct CommissionService<S> {
    store: Arc<S>,
    provider: Arc<dyn PaymentProvider>,
    state_machine: CommissionStateMachine<S>,
    aggregator: PayoutAggregator<S>,
    executor: TransferExecutor<S>,
}

impl<S: CommissionStore> CommissionService<S> {
    pub fn new(
        store: Arc<S>,
        provider: Arc<dyn PaymentProvider>,
        stats: Arc<dyn StatsRefresher>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            state_machine: CommissionStateMachine::new(Arc::clone(&store), Arc::clone(&stats)),
            aggregator: PayoutAggregator::new(Arc::clone(&store)),
            executor: TransferExecutor::new(
                Arc::clone(&store),
                Arc::clone(&provider),
                stats,
                settings,
            ),
            store,
            provider,
        }
    }

    pub async fn record_commission(
        &self,
        new: NewCommission,
    ) -> Result<Commission, CommissionError> {
        let commission = Commission::record(new, Utc::now())?;
        self.store.insert_commission(&commission).await?;

        info!(
            commission_id = %commission.id,
            beneficiary_id = %commission.beneficiary_id,
            amount = %commission.amount,
            "commission recorded"
        );
        Ok(commission)
    }

    pub async fn approve_commission(
        &self,
        commission_id: Uuid,
        beneficiary_id: Uuid,
    ) -> Result<ApproveOutcome, StoreError> {
        self.state_machine
            .approve_one(commission_id, beneficiary_id)
            .await
    }

    /// Manual mark-paid for money sent outside the platform. Payouts through
    /// the provider go through [`Self::execute_payout`] instead.
    pub async fn mark_commission_paid(
        &self,
        commission_id: Uuid,
        beneficiary_id: Uuid,
    ) -> Result<MarkPaidOutcome, StoreError> {
        self.state_machine
            .mark_paid_one(commission_id, beneficiary_id)
            .await
    }

    pub async fn bulk_approve(
        &self,
        commission_ids: &[Uuid],
        beneficiary_id: Uuid,
    ) -> Result<BulkApproveOutcome, StoreError> {
        self.state_machine
            .approve_bulk(commission_ids, beneficiary_id)
            .await
    }

    pub async fn bulk_mark_paid(
        &self,
        commission_ids: &[Uuid],
        beneficiary_id: Uuid,
    ) -> Result<BulkMarkPaidOutcome, StoreError> {
        self.state_machine
            .mark_paid_bulk(commission_ids, beneficiary_id)
            .await
    }

    pub async fn execute_payout(
        &self,
        beneficiary_id: Uuid,
        commission_ids: Option<&[Uuid]>,
    ) -> Result<PayoutOutcome, PayoutError> {
        match self.aggregator.prepare(beneficiary_id, commission_ids).await? {
            Preparation::Ready {
                payout,
                destination_reference,
            } => self.executor.execute(&payout, &destination_reference).await,
            Preparation::NoAccount => Ok(PayoutOutcome::NoAccount),
            Preparation::AccountNotReady => Ok(PayoutOutcome::AccountNotReady),
            Preparation::NothingToPay => Ok(PayoutOutcome::NothingToPay),
        }
    }

    /// Re-sends a payout that is still PENDING with its original idempotency
    /// key, so a transfer the provider already made is returned, not repeated.
    pub async fn resume_payout(&self, payout_id: Uuid) -> Result<PayoutOutcome, PayoutError> {
        let payout = self
            .store
            .payout(payout_id)
            .await?
            .ok_or(PayoutError::PayoutNotFound(payout_id))?;
        if payout.status.is_final() {
            return Err(PayoutError::PayoutAlreadyFinal {
                payout_id,
                status: payout.status,
            });
        }

        let Some(account) = self.store.account(payout.beneficiary_id).await? else {
            return Ok(PayoutOutcome::NoAccount);
        };

        info!(%payout_id, "resuming pending payout");
        self.executor
            .execute(&payout, &account.external_account_reference)
            .await
    }

    /// Pulls the provider's view of the account into the local row the
    /// aggregator locks.
    pub async fn sync_account(
        &self,
        beneficiary_id: Uuid,
    ) -> Result<Option<BeneficiaryAccount>, PayoutError> {
        let status = self
            .provider
            .account_status(beneficiary_id)
            .await
            .map_err(|source| PayoutError::AccountSync {
                beneficiary_id,
                source,
            })?;

        let Some(status) = status else {
            return Ok(None);
        };

        let account = BeneficiaryAccount {
            beneficiary_id,
            external_account_reference: status.external_account_reference,
            payouts_enabled: status.payouts_enabled,
            updated_at: Utc::now(),
        };
        self.store.upsert_account(&account).await?;

        info!(
            %beneficiary_id,
            payouts_enabled = account.payouts_enabled,
            "beneficiary account synced"
        );
        Ok(Some(account))
    }

    pub async fn commission(&self, commission_id: Uuid) -> Result<Option<Commission>, StoreError> {
        self.store.commission(commission_id).await
    }

    pub async fn payout(&self, payout_id: Uuid) -> Result<Option<PayoutRecord>, StoreError> {
        self.store.payout(payout_id).await
    }

    pub async fn payouts_for(&self, beneficiary_id: Uuid) -> Result<Vec<PayoutRecord>, StoreError> {
        self.store.payouts_for(beneficiary_id).await
    }
}
