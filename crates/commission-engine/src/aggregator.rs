use std::sync::Arc;

use chrono::Utc;
use commission_core::{
    CommissionSelection, CommissionStore, PayoutRecord, StoreError, UnitOfWork,
};
use tracing::info;
use uuid::Uuid;

/// What the aggregator handed over, or why nothing was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preparation {
    Ready {
        payout: PayoutRecord,
        destination_reference: String,
    },
    NoAccount,
    AccountNotReady,
    NothingToPay,
}

pub struct PayoutAggregator<S> {
    store: Arc<S>,
}

impl<S: CommissionStore> PayoutAggregator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Selects the payable commissions and commits a PENDING payout for them.
    /// Without `commission_ids`, every approved commission is included.
    pub async fn prepare(
        &self,
        beneficiary_id: Uuid,
        commission_ids: Option<&[Uuid]>,
    ) -> Result<Preparation, StoreError> {
        let mut tx = self.store.begin().await?;

        // Account row first, then commission rows.
        let Some(account) = tx.lock_account(beneficiary_id).await? else {
            return Ok(Preparation::NoAccount);
        };
        if !account.payouts_enabled {
            return Ok(Preparation::AccountNotReady);
        }

        let selected = tx
            .lock_commissions(&CommissionSelection::payable(beneficiary_id, commission_ids))
            .await?;
        if selected.is_empty() {
            return Ok(Preparation::NothingToPay);
        }

        let payout = PayoutRecord::pending(beneficiary_id, &selected, Utc::now());
        tx.insert_payout(&payout).await?;
        tx.commit().await?;

        info!(
            payout_id = %payout.id,
            %beneficiary_id,
            amount = %payout.amount,
            commissions = payout.included_commission_ids.len(),
            "payout prepared"
        );

        Ok(Preparation::Ready {
            payout,
            destination_reference: account.external_account_reference,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use commission_core::{
        BeneficiaryAccount, Commission, CommissionStatus, NewCommission, PayoutStatus,
    };
    use commission_store::InMemoryCommissionStore;
    use rust_decimal::Decimal;

    use super::*;

    async fn seed(
        store: &InMemoryCommissionStore,
        beneficiary_id: Uuid,
        amount_cents: i64,
        status: CommissionStatus,
    ) -> Commission {
        let mut commission = Commission::record(
            NewCommission {
                beneficiary_id,
                referral_id: Uuid::new_v4(),
                rate: Decimal::ONE,
                base_amount: Decimal::new(amount_cents, 2),
                period_start: NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
                period_end: NaiveDate::from_ymd_opt(2026, 9, 30).unwrap(),
            },
            Utc::now(),
        )
        .unwrap();
        commission.status = status;
        store.insert_commission(&commission).await.unwrap();
        commission
    }

    async fn account(store: &InMemoryCommissionStore, beneficiary_id: Uuid, enabled: bool) {
        store
            .upsert_account(&BeneficiaryAccount {
                beneficiary_id,
                external_account_reference: format!("acct_{beneficiary_id}"),
                payouts_enabled: enabled,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    fn ready(preparation: Preparation) -> (PayoutRecord, String) {
        match preparation {
            Preparation::Ready {
                payout,
                destination_reference,
            } => (payout, destination_reference),
            other => panic!("expected a prepared payout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn default_selection_takes_every_approved_commission_only() {
        let store = Arc::new(InMemoryCommissionStore::new());
        let beneficiary_id = Uuid::new_v4();
        account(&store, beneficiary_id, true).await;
        let c1 = seed(&store, beneficiary_id, 2000, CommissionStatus::Approved).await;
        let c2 = seed(&store, beneficiary_id, 1500, CommissionStatus::Pending).await;

        let aggregator = PayoutAggregator::new(Arc::clone(&store));
        let (payout, destination) = ready(aggregator.prepare(beneficiary_id, None).await.unwrap());

        assert_eq!(payout.amount, Decimal::new(2000, 2));
        assert_eq!(payout.included_commission_ids, vec![c1.id]);
        assert_eq!(destination, format!("acct_{beneficiary_id}"));
        let stored = store.payout(payout.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Pending);
        assert_eq!(
            store.commission(c2.id).await.unwrap().unwrap().status,
            CommissionStatus::Pending
        );
    }

    #[tokio::test]
    async fn explicit_subset_limits_selection() {
        let store = Arc::new(InMemoryCommissionStore::new());
        let beneficiary_id = Uuid::new_v4();
        account(&store, beneficiary_id, true).await;
        let c1 = seed(&store, beneficiary_id, 2000, CommissionStatus::Approved).await;
        let _c2 = seed(&store, beneficiary_id, 3000, CommissionStatus::Approved).await;
        let foreign = seed(&store, Uuid::new_v4(), 9900, CommissionStatus::Approved).await;

        let aggregator = PayoutAggregator::new(Arc::clone(&store));
        let (payout, _) = ready(
            aggregator
                .prepare(beneficiary_id, Some(&[c1.id, foreign.id]))
                .await
                .unwrap(),
        );

        assert_eq!(payout.included_commission_ids, vec![c1.id]);
        assert_eq!(payout.amount, Decimal::new(2000, 2));
    }

    #[tokio::test]
    async fn preconditions_fail_before_any_payout_exists() {
        let store = Arc::new(InMemoryCommissionStore::new());
        let aggregator = PayoutAggregator::new(Arc::clone(&store));

        let no_account = Uuid::new_v4();
        seed(&store, no_account, 2000, CommissionStatus::Approved).await;
        assert_eq!(
            aggregator.prepare(no_account, None).await.unwrap(),
            Preparation::NoAccount
        );

        let disabled = Uuid::new_v4();
        account(&store, disabled, false).await;
        seed(&store, disabled, 2000, CommissionStatus::Approved).await;
        assert_eq!(
            aggregator.prepare(disabled, None).await.unwrap(),
            Preparation::AccountNotReady
        );

        let empty = Uuid::new_v4();
        account(&store, empty, true).await;
        seed(&store, empty, 2000, CommissionStatus::Pending).await;
        assert_eq!(
            aggregator.prepare(empty, None).await.unwrap(),
            Preparation::NothingToPay
        );
        assert_eq!(
            aggregator.prepare(empty, Some(&[])).await.unwrap(),
            Preparation::NothingToPay
        );

        for beneficiary_id in [no_account, disabled, empty] {
            assert!(store.payouts_for(beneficiary_id).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn second_payout_cannot_reselect_claimed_commissions() {
        let store = Arc::new(InMemoryCommissionStore::new());
        let beneficiary_id = Uuid::new_v4();
        account(&store, beneficiary_id, true).await;
        seed(&store, beneficiary_id, 2000, CommissionStatus::Approved).await;

        let aggregator = PayoutAggregator::new(Arc::clone(&store));
        ready(aggregator.prepare(beneficiary_id, None).await.unwrap());

        assert_eq!(
            aggregator.prepare(beneficiary_id, None).await.unwrap(),
            Preparation::NothingToPay
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_prepares_never_share_a_commission() {
        let store = Arc::new(InMemoryCommissionStore::new());
        let beneficiary_id = Uuid::new_v4();
        account(&store, beneficiary_id, true).await;
        for _ in 0..5 {
            seed(&store, beneficiary_id, 1000, CommissionStatus::Approved).await;
        }

        let aggregator = Arc::new(PayoutAggregator::new(Arc::clone(&store)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let aggregator = Arc::clone(&aggregator);
                tokio::spawn(async move { aggregator.prepare(beneficiary_id, None).await })
            })
            .collect();

        let mut prepared = 0;
        for handle in handles {
            if let Preparation::Ready { .. } = handle.await.unwrap().unwrap() {
                prepared += 1;
            }
        }

        assert_eq!(prepared, 1);
        let payouts = store.payouts_for(beneficiary_id).await.unwrap();
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].included_commission_ids.len(), 5);
        assert_eq!(payouts[0].amount, Decimal::new(5000, 2));
    }
}
