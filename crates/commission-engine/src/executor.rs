use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use commission_core::{
    CommissionSelection, CommissionStatus, CommissionStore, PaymentProvider, PayoutOutcome,
    PayoutRecord, PayoutStatus, StatsRefresher, StoreError, TransferError, TransferRequest,
    UnitOfWork,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::PayoutError;
use crate::hooks::refresh_stats;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub transfer_timeout: Duration,
    pub finalize_attempts: u32,
    pub finalize_backoff: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            transfer_timeout: Duration::from_secs(30),
            finalize_attempts: 3,
            finalize_backoff: Duration::from_millis(250),
        }
    }
}

/// Included commissions found in an unexpected state while finalizing.
struct Finalized {
    anomalies: Vec<String>,
}

/// Calls the provider for a prepared payout and settles the local records.
pub struct TransferExecutor<S> {
    store: Arc<S>,
    provider: Arc<dyn PaymentProvider>,
    stats: Arc<dyn StatsRefresher>,
    settings: ExecutorSettings,
}

impl<S: CommissionStore> TransferExecutor<S> {
    pub fn new(
        store: Arc<S>,
        provider: Arc<dyn PaymentProvider>,
        stats: Arc<dyn StatsRefresher>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            provider,
            stats,
            settings,
        }
    }

    pub async fn execute(
        &self,
        payout: &PayoutRecord,
        destination_reference: &str,
    ) -> Result<PayoutOutcome, PayoutError> {
        self.verify_included(payout).await?;

        let request = TransferRequest {
            amount: payout.amount,
            destination_reference: destination_reference.to_string(),
            idempotency_key: payout.id.to_string(),
            payout_id: payout.id,
            beneficiary_id: payout.beneficiary_id,
        };

        let result = match tokio::time::timeout(
            self.settings.transfer_timeout,
            self.provider.create_transfer(&request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransferError::Indeterminate(format!(
                "no answer within {:?}",
                self.settings.transfer_timeout
            ))),
        };

        match result {
            Ok(receipt) => self.settle(payout, &receipt.transfer_id).await,
            Err(TransferError::Rejected(reason)) => {
                self.record_rejection(payout.id, &reason).await?;
                warn!(payout_id = %payout.id, %reason, "transfer rejected");
                Ok(PayoutOutcome::Failed {
                    payout_id: payout.id,
                    reason,
                })
            }
            Err(TransferError::Indeterminate(reason)) => {
                warn!(payout_id = %payout.id, %reason, "transfer outcome unknown, payout left pending");
                Err(PayoutError::TransferIndeterminate {
                    payout_id: payout.id,
                    reason,
                })
            }
        }
    }

    /// Re-locks the included commissions right before the transfer and marks
    /// the payout as submitted. A commission no longer APPROVED fails a payout
    /// that was never submitted; once a request may have reached the provider
    /// the payout stays PENDING and is handed over for reconciliation.
    async fn verify_included(&self, payout: &PayoutRecord) -> Result<(), PayoutError> {
        let mut tx = self.store.begin().await?;
        let mut current = tx
            .lock_payout(payout.id)
            .await?
            .ok_or(PayoutError::PayoutNotFound(payout.id))?;
        if current.status.is_final() {
            return Err(PayoutError::PayoutAlreadyFinal {
                payout_id: payout.id,
                status: current.status,
            });
        }

        let locked = tx
            .lock_commissions(&CommissionSelection::by_ids(
                current.beneficiary_id,
                &current.included_commission_ids,
            ))
            .await?;

        let offending = current.included_commission_ids.iter().find_map(|id| {
            match locked.iter().find(|c| c.id == *id) {
                Some(c) if c.status == CommissionStatus::Approved => None,
                Some(c) => Some((*id, c.status.clone())),
                None => Some((*id, CommissionStatus::Unrecognized("MISSING".to_string()))),
            }
        });

        let Some((commission_id, status)) = offending else {
            current.mark_submitted(Utc::now());
            tx.update_payout(&current).await?;
            tx.commit().await?;
            return Ok(());
        };

        if let Some(submitted_at) = current.submitted_at {
            error!(
                payout_id = %payout.id,
                %commission_id,
                %status,
                %submitted_at,
                "submitted payout includes a commission that is no longer payable"
            );
            return Err(PayoutError::NeedsReconciliation {
                payout_id: payout.id,
                commission_id,
                status,
            });
        }

        current.fail(
            &format!("commission {commission_id} is {status}, expected APPROVED"),
            Utc::now(),
        );
        tx.update_payout(&current).await?;
        tx.commit().await?;

        error!(
            payout_id = %payout.id,
            %commission_id,
            %status,
            "included commission is no longer payable"
        );
        Err(PayoutError::IncludedCommissionNotPayable {
            payout_id: payout.id,
            commission_id,
            status,
        })
    }

    async fn record_rejection(&self, payout_id: Uuid, reason: &str) -> Result<(), PayoutError> {
        let mut tx = self.store.begin().await?;
        let mut payout = tx
            .lock_payout(payout_id)
            .await?
            .ok_or(PayoutError::PayoutNotFound(payout_id))?;
        if payout.status != PayoutStatus::Pending {
            return Err(PayoutError::PayoutAlreadyFinal {
                payout_id,
                status: payout.status,
            });
        }

        payout.fail(reason, Utc::now());
        tx.update_payout(&payout).await?;
        tx.commit().await?;
        Ok(())
    }

    /// The transfer happened; keep trying until the records say so too.
    async fn settle(
        &self,
        payout: &PayoutRecord,
        transfer_id: &str,
    ) -> Result<PayoutOutcome, PayoutError> {
        let attempts = self.settings.finalize_attempts.max(1);
        let mut attempt = 0;

        let finalized = loop {
            attempt += 1;
            match self.finalize_once(payout.id, transfer_id).await {
                Ok(finalized) => break finalized,
                Err(PayoutError::Store(source)) if attempt < attempts => {
                    warn!(
                        payout_id = %payout.id,
                        attempt,
                        "finalization failed, retrying: {source}"
                    );
                    tokio::time::sleep(self.settings.finalize_backoff).await;
                }
                Err(PayoutError::Store(source)) => {
                    error!(
                        payout_id = %payout.id,
                        %transfer_id,
                        "transfer accepted but payout could not be finalized: {source}"
                    );
                    return Err(PayoutError::FinalizationFailed {
                        payout_id: payout.id,
                        transfer_id: transfer_id.to_string(),
                        source,
                    });
                }
                Err(other) => return Err(other),
            }
        };

        refresh_stats(self.stats.as_ref(), payout.beneficiary_id).await;

        if !finalized.anomalies.is_empty() {
            let message = finalized.anomalies.join("; ");
            error!(payout_id = %payout.id, %transfer_id, %message, "payout completed with anomalies");
            return Err(PayoutError::InvariantViolation {
                payout_id: payout.id,
                message,
            });
        }

        info!(
            payout_id = %payout.id,
            beneficiary_id = %payout.beneficiary_id,
            amount = %payout.amount,
            %transfer_id,
            "payout completed"
        );
        Ok(PayoutOutcome::Completed {
            payout_id: payout.id,
            amount: payout.amount,
            transfer_id: transfer_id.to_string(),
        })
    }

    /// Marks the payout COMPLETED and every included commission PAID in one
    /// unit of work.
    async fn finalize_once(
        &self,
        payout_id: Uuid,
        transfer_id: &str,
    ) -> Result<Finalized, PayoutError> {
        let mut tx = self.store.begin().await?;
        let mut payout = tx
            .lock_payout(payout_id)
            .await?
            .ok_or(PayoutError::PayoutNotFound(payout_id))?;

        match payout.status {
            PayoutStatus::Pending => {}
            PayoutStatus::Completed
                if payout.external_transfer_id.as_deref() == Some(transfer_id) =>
            {
                return Ok(Finalized {
                    anomalies: Vec::new(),
                });
            }
            status => {
                return Err(PayoutError::InvariantViolation {
                    payout_id,
                    message: format!(
                        "provider accepted transfer {transfer_id} for a payout already {status}"
                    ),
                });
            }
        }

        let locked = tx
            .lock_commissions(&CommissionSelection::by_ids(
                payout.beneficiary_id,
                &payout.included_commission_ids,
            ))
            .await?;

        let mut payable = Vec::with_capacity(locked.len());
        let mut anomalies = Vec::new();
        for id in &payout.included_commission_ids {
            match locked.iter().find(|c| c.id == *id) {
                Some(c) if c.status == CommissionStatus::Approved => payable.push(*id),
                Some(c) => anomalies.push(format!("commission {id} was {}", c.status)),
                None => anomalies.push(format!("commission {id} missing")),
            }
        }

        if !payable.is_empty() {
            tx.update_commission_status(&payable, &CommissionStatus::Paid)
                .await?;
        }
        payout.complete(transfer_id, Utc::now());
        tx.update_payout(&payout).await?;
        tx.commit().await?;

        Ok(Finalized { anomalies })
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use commission_core::{Commission, NewCommission};
    use commission_store::{
        InMemoryCommissionStore, RecordingStatsRefresher, ScriptedPaymentProvider,
        ScriptedTransfer,
    };
    use rust_decimal::Decimal;

    use super::*;

    struct Fixture {
        store: Arc<InMemoryCommissionStore>,
        provider: Arc<ScriptedPaymentProvider>,
        stats: Arc<RecordingStatsRefresher>,
        executor: TransferExecutor<InMemoryCommissionStore>,
    }

    fn fixture(settings: ExecutorSettings) -> Fixture {
        let store = Arc::new(InMemoryCommissionStore::new());
        let provider = Arc::new(ScriptedPaymentProvider::new());
        let stats = Arc::new(RecordingStatsRefresher::new());
        let executor = TransferExecutor::new(
            Arc::clone(&store),
            provider.clone() as Arc<dyn PaymentProvider>,
            stats.clone() as Arc<dyn StatsRefresher>,
            settings,
        );
        Fixture {
            store,
            provider,
            stats,
            executor,
        }
    }

    fn quick() -> ExecutorSettings {
        ExecutorSettings {
            transfer_timeout: Duration::from_secs(5),
            finalize_attempts: 3,
            finalize_backoff: Duration::from_millis(1),
        }
    }

    /// Two approved commissions (20.00 and 15.00) in a committed PENDING payout.
    async fn prepared(store: &InMemoryCommissionStore) -> (PayoutRecord, Vec<Commission>) {
        let beneficiary_id = Uuid::new_v4();
        let mut rows = Vec::new();
        for cents in [2000, 1500] {
            let mut commission = Commission::record(
                NewCommission {
                    beneficiary_id,
                    referral_id: Uuid::new_v4(),
                    rate: Decimal::ONE,
                    base_amount: Decimal::new(cents, 2),
                    period_start: NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
                    period_end: NaiveDate::from_ymd_opt(2026, 9, 30).unwrap(),
                },
                Utc::now(),
            )
            .unwrap();
            commission.status = CommissionStatus::Approved;
            store.insert_commission(&commission).await.unwrap();
            rows.push(commission);
        }

        let payout = PayoutRecord::pending(beneficiary_id, &rows, Utc::now());
        let mut tx = store.begin().await.unwrap();
        tx.insert_payout(&payout).await.unwrap();
        tx.commit().await.unwrap();
        (payout, rows)
    }

    async fn statuses(store: &InMemoryCommissionStore, rows: &[Commission]) -> Vec<CommissionStatus> {
        let mut out = Vec::new();
        for row in rows {
            out.push(store.commission(row.id).await.unwrap().unwrap().status);
        }
        out
    }

    #[tokio::test]
    async fn accepted_transfer_completes_payout_and_pays_commissions() {
        let f = fixture(quick());
        let (payout, rows) = prepared(&f.store).await;

        let outcome = f.executor.execute(&payout, "acct_1").await.unwrap();

        assert_eq!(
            outcome,
            PayoutOutcome::Completed {
                payout_id: payout.id,
                amount: Decimal::new(3500, 2),
                transfer_id: "tr_1".to_string(),
            }
        );
        let stored = f.store.payout(payout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Completed);
        assert_eq!(stored.external_transfer_id.as_deref(), Some("tr_1"));
        assert_eq!(
            statuses(&f.store, &rows).await,
            vec![CommissionStatus::Paid, CommissionStatus::Paid]
        );
        assert_eq!(f.stats.refreshed().await, vec![payout.beneficiary_id]);

        let requests = f.provider.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].idempotency_key, payout.id.to_string());
        assert_eq!(requests[0].amount, Decimal::new(3500, 2));
        assert_eq!(requests[0].destination_reference, "acct_1");
    }

    #[tokio::test]
    async fn rejected_transfer_fails_payout_and_keeps_commissions_approved() {
        let f = fixture(quick());
        let (payout, rows) = prepared(&f.store).await;
        f.provider
            .push(ScriptedTransfer::Reject("account not ready".to_string()))
            .await;

        let outcome = f.executor.execute(&payout, "acct_1").await.unwrap();

        assert_eq!(
            outcome,
            PayoutOutcome::Failed {
                payout_id: payout.id,
                reason: "account not ready".to_string(),
            }
        );
        let stored = f.store.payout(payout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("account not ready"));
        assert_eq!(stored.external_transfer_id, None);
        assert_eq!(
            statuses(&f.store, &rows).await,
            vec![CommissionStatus::Approved, CommissionStatus::Approved]
        );
    }

    #[tokio::test]
    async fn indeterminate_transfer_leaves_everything_pending() {
        let f = fixture(quick());
        let (payout, rows) = prepared(&f.store).await;
        f.provider
            .push(ScriptedTransfer::Indeterminate("502 from upstream".to_string()))
            .await;

        let err = f.executor.execute(&payout, "acct_1").await.unwrap_err();

        assert!(matches!(err, PayoutError::TransferIndeterminate { .. }));
        assert!(err.is_retryable());
        let stored = f.store.payout(payout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Pending);
        assert_eq!(
            statuses(&f.store, &rows).await,
            vec![CommissionStatus::Approved, CommissionStatus::Approved]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_indeterminate_never_rejected() {
        let f = fixture(quick());
        let (payout, _) = prepared(&f.store).await;
        f.provider.push(ScriptedTransfer::Hang).await;

        let err = f.executor.execute(&payout, "acct_1").await.unwrap_err();

        assert!(matches!(err, PayoutError::TransferIndeterminate { .. }));
        let stored = f.store.payout(payout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Pending);
        assert_eq!(stored.error_message, None);
    }

    #[tokio::test]
    async fn finalization_is_retried_until_it_sticks() {
        let f = fixture(quick());
        let (payout, rows) = prepared(&f.store).await;
        f.store.fail_next_commits(2);

        let outcome = f.executor.settle(&payout, "tr_manual").await.unwrap();

        assert!(matches!(outcome, PayoutOutcome::Completed { .. }));
        assert_eq!(
            statuses(&f.store, &rows).await,
            vec![CommissionStatus::Paid, CommissionStatus::Paid]
        );
    }

    #[tokio::test]
    async fn exhausted_finalization_keeps_payout_pending_and_retryable() {
        let f = fixture(quick());
        let (payout, rows) = prepared(&f.store).await;
        f.store.fail_next_commits(3);

        let err = f.executor.settle(&payout, "tr_9").await.unwrap_err();

        match &err {
            PayoutError::FinalizationFailed { transfer_id, .. } => assert_eq!(transfer_id, "tr_9"),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.is_retryable());
        let stored = f.store.payout(payout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Pending);
        assert_eq!(
            statuses(&f.store, &rows).await,
            vec![CommissionStatus::Approved, CommissionStatus::Approved]
        );
    }

    #[tokio::test]
    async fn commission_paid_elsewhere_fails_payout_before_transfer() {
        let f = fixture(quick());
        let (payout, rows) = prepared(&f.store).await;

        let mut tx = f.store.begin().await.unwrap();
        tx.lock_commissions(&CommissionSelection::by_ids(
            payout.beneficiary_id,
            &[rows[0].id],
        ))
        .await
        .unwrap();
        tx.update_commission_status(&[rows[0].id], &CommissionStatus::Paid)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let err = f.executor.execute(&payout, "acct_1").await.unwrap_err();

        assert!(matches!(
            err,
            PayoutError::IncludedCommissionNotPayable { commission_id, .. } if commission_id == rows[0].id
        ));
        assert!(f.provider.requests().await.is_empty());
        let stored = f.store.payout(payout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Failed);
        assert_eq!(stored.submitted_at, None);
        assert_eq!(
            f.store.commission(rows[1].id).await.unwrap().unwrap().status,
            CommissionStatus::Approved
        );
    }

    #[tokio::test]
    async fn submitted_payout_is_never_failed_by_the_recheck() {
        let f = fixture(quick());
        let (payout, rows) = prepared(&f.store).await;
        f.provider.push(ScriptedTransfer::LostResponse).await;
        f.executor.execute(&payout, "acct_1").await.unwrap_err();
        let submitted = f.store.payout(payout.id).await.unwrap().unwrap();
        assert!(submitted.submitted_at.is_some());

        let mut tx = f.store.begin().await.unwrap();
        tx.lock_commissions(&CommissionSelection::by_ids(
            payout.beneficiary_id,
            &[rows[0].id],
        ))
        .await
        .unwrap();
        tx.update_commission_status(&[rows[0].id], &CommissionStatus::Paid)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let err = f.executor.execute(&payout, "acct_1").await.unwrap_err();

        assert!(matches!(
            err,
            PayoutError::NeedsReconciliation { commission_id, .. } if commission_id == rows[0].id
        ));
        assert!(!err.is_retryable());
        assert_eq!(f.provider.requests().await.len(), 1);
        let stored = f.store.payout(payout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Pending);
        assert_eq!(stored.submitted_at, submitted.submitted_at);
    }

    #[tokio::test]
    async fn finished_payout_is_not_executed_again() {
        let f = fixture(quick());
        let (payout, _) = prepared(&f.store).await;
        f.executor.execute(&payout, "acct_1").await.unwrap();

        let err = f.executor.execute(&payout, "acct_1").await.unwrap_err();

        assert!(matches!(
            err,
            PayoutError::PayoutAlreadyFinal {
                status: PayoutStatus::Completed,
                ..
            }
        ));
        assert_eq!(f.provider.transfers_created().await, 1);
    }
}
