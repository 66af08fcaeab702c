use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use commission_core::{
    BeneficiaryAccount, Commission, CommissionSelection, CommissionStatus, CommissionStore,
    CommissionSummary, PayoutRecord, PayoutStatus, StoreError, UnitOfWork,
};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

type RowLock = Arc<Mutex<()>>;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum RowKey {
    Account(Uuid),
    Commission(Uuid),
    Payout(Uuid),
}

#[derive(Default)]
struct Tables {
    commissions: HashMap<Uuid, Commission>,
    payouts: HashMap<Uuid, PayoutRecord>,
    accounts: HashMap<Uuid, BeneficiaryAccount>,
}

impl Tables {
    fn is_claimed(&self, commission_id: Uuid) -> bool {
        self.payouts.values().any(|payout| {
            payout.status == PayoutStatus::Pending
                && payout.included_commission_ids.contains(&commission_id)
        })
    }
}

#[derive(Default)]
struct Shared {
    tables: RwLock<Tables>,
    row_locks: std::sync::Mutex<HashMap<RowKey, RowLock>>,
    unavailable: AtomicBool,
    failing_commits: AtomicU32,
}

/// Process-local store with real per-row exclusive locks. Used by tests and
/// single-process deployments.
#[derive(Clone, Default)]
pub struct InMemoryCommissionStore {
    shared: Arc<Shared>,
}

impl InMemoryCommissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The next `count` commits fail and roll back.
    pub fn fail_next_commits(&self, count: u32) {
        self.shared.failing_commits.store(count, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        ensure_available(&self.shared)
    }

    #[cfg(test)]
    fn tracked_row_locks(&self) -> usize {
        self.shared
            .row_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn ensure_available(shared: &Shared) -> Result<(), StoreError> {
    if shared.unavailable.load(Ordering::SeqCst) {
        return Err(StoreError::Unavailable(
            "in-memory store switched off".to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl CommissionStore for InMemoryCommissionStore {
    type Tx = InMemoryUnitOfWork;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        self.ensure_available()?;

        Ok(InMemoryUnitOfWork {
            shared: Arc::clone(&self.shared),
            held: HeldLocks {
                shared: Arc::clone(&self.shared),
                guards: HashMap::new(),
            },
            commission_writes: HashMap::new(),
            payout_writes: HashMap::new(),
        })
    }

    async fn insert_commission(&self, commission: &Commission) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut tables = self.shared.tables.write().await;
        if tables.commissions.contains_key(&commission.id) {
            return Err(StoreError::Conflict {
                entity: "commission",
                id: commission.id,
            });
        }
        tables
            .commissions
            .insert(commission.id, commission.clone());
        Ok(())
    }

    async fn commission(&self, commission_id: Uuid) -> Result<Option<Commission>, StoreError> {
        self.ensure_available()?;
        let tables = self.shared.tables.read().await;
        Ok(tables.commissions.get(&commission_id).cloned())
    }

    async fn commissions_for(&self, beneficiary_id: Uuid) -> Result<Vec<Commission>, StoreError> {
        self.ensure_available()?;
        let tables = self.shared.tables.read().await;
        let mut rows: Vec<Commission> = tables
            .commissions
            .values()
            .filter(|c| c.beneficiary_id == beneficiary_id)
            .cloned()
            .collect();
        rows.sort_by_key(|c| (c.created_at, c.id));
        Ok(rows)
    }

    async fn payout(&self, payout_id: Uuid) -> Result<Option<PayoutRecord>, StoreError> {
        self.ensure_available()?;
        let tables = self.shared.tables.read().await;
        Ok(tables.payouts.get(&payout_id).cloned())
    }

    async fn payouts_for(&self, beneficiary_id: Uuid) -> Result<Vec<PayoutRecord>, StoreError> {
        self.ensure_available()?;
        let tables = self.shared.tables.read().await;
        let mut rows: Vec<PayoutRecord> = tables
            .payouts
            .values()
            .filter(|p| p.beneficiary_id == beneficiary_id)
            .cloned()
            .collect();
        rows.sort_by_key(|p| (p.created_at, p.id));
        Ok(rows)
    }

    async fn account(
        &self,
        beneficiary_id: Uuid,
    ) -> Result<Option<BeneficiaryAccount>, StoreError> {
        self.ensure_available()?;
        let tables = self.shared.tables.read().await;
        Ok(tables.accounts.get(&beneficiary_id).cloned())
    }

    async fn upsert_account(&self, account: &BeneficiaryAccount) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut tables = self.shared.tables.write().await;
        tables
            .accounts
            .insert(account.beneficiary_id, account.clone());
        Ok(())
    }

    async fn summarize(&self, beneficiary_id: Uuid) -> Result<CommissionSummary, StoreError> {
        let rows = self.commissions_for(beneficiary_id).await?;
        Ok(CommissionSummary::from_commissions(beneficiary_id, &rows))
    }
}

/// Row guards of one unit of work. Releasing them forgets every row lock
/// nobody else is holding or waiting on.
struct HeldLocks {
    shared: Arc<Shared>,
    guards: HashMap<RowKey, OwnedMutexGuard<()>>,
}

impl HeldLocks {
    fn contains(&self, key: &RowKey) -> bool {
        self.guards.contains_key(key)
    }
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        let keys: Vec<RowKey> = self.guards.drain().map(|(key, _guard)| key).collect();
        let mut locks = self
            .shared
            .row_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            if locks.get(&key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(&key);
            }
        }
    }
}

pub struct InMemoryUnitOfWork {
    shared: Arc<Shared>,
    held: HeldLocks,
    commission_writes: HashMap<Uuid, CommissionStatus>,
    payout_writes: HashMap<Uuid, PayoutRecord>,
}

impl InMemoryUnitOfWork {
    /// Locks are taken in key order and are re-entrant within one unit of work.
    async fn acquire(&mut self, mut keys: Vec<RowKey>) {
        keys.sort();
        keys.dedup();

        for key in keys {
            if self.held.contains(&key) {
                continue;
            }
            let row_lock = {
                let mut locks = self
                    .shared
                    .row_locks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                Arc::clone(locks.entry(key).or_default())
            };
            let guard = row_lock.lock_owned().await;
            self.held.guards.insert(key, guard);
        }
    }

    fn visible_commissions(
        &self,
        tables: &Tables,
        selection: &CommissionSelection,
    ) -> Vec<Commission> {
        let mut rows: Vec<Commission> = tables
            .commissions
            .values()
            .map(|commission| {
                let mut commission = commission.clone();
                if let Some(status) = self.commission_writes.get(&commission.id) {
                    commission.status = status.clone();
                }
                commission
            })
            .filter(|commission| selection.matches(commission))
            .filter(|commission| !selection.unclaimed || !tables.is_claimed(commission.id))
            .collect();
        rows.sort_by_key(|c| c.id);
        rows
    }

    fn ensure_held(&self, key: RowKey) -> Result<(), StoreError> {
        if self.held.contains(&key) {
            return Ok(());
        }
        Err(StoreError::Backend(format!(
            "{key:?} written without holding its lock"
        )))
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn lock_account(
        &mut self,
        beneficiary_id: Uuid,
    ) -> Result<Option<BeneficiaryAccount>, StoreError> {
        ensure_available(&self.shared)?;
        self.acquire(vec![RowKey::Account(beneficiary_id)]).await;
        let tables = self.shared.tables.read().await;
        Ok(tables.accounts.get(&beneficiary_id).cloned())
    }

    async fn lock_commissions(
        &mut self,
        selection: &CommissionSelection,
    ) -> Result<Vec<Commission>, StoreError> {
        ensure_available(&self.shared)?;

        let candidates: Vec<RowKey> = {
            let tables = self.shared.tables.read().await;
            self.visible_commissions(&tables, selection)
                .iter()
                .map(|c| RowKey::Commission(c.id))
                .collect()
        };
        self.acquire(candidates).await;

        // Re-check after waiting: another unit of work may have moved a row on.
        let tables = self.shared.tables.read().await;
        Ok(self
            .visible_commissions(&tables, selection)
            .into_iter()
            .filter(|c| self.held.contains(&RowKey::Commission(c.id)))
            .collect())
    }

    async fn update_commission_status(
        &mut self,
        ids: &[Uuid],
        status: &CommissionStatus,
    ) -> Result<u64, StoreError> {
        ensure_available(&self.shared)?;
        for id in ids {
            self.ensure_held(RowKey::Commission(*id))?;
        }

        let tables = self.shared.tables.read().await;
        let mut updated = 0;
        for id in ids {
            if tables.commissions.contains_key(id) {
                self.commission_writes.insert(*id, status.clone());
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn lock_payout(&mut self, payout_id: Uuid) -> Result<Option<PayoutRecord>, StoreError> {
        ensure_available(&self.shared)?;
        self.acquire(vec![RowKey::Payout(payout_id)]).await;
        if let Some(staged) = self.payout_writes.get(&payout_id) {
            return Ok(Some(staged.clone()));
        }
        let tables = self.shared.tables.read().await;
        Ok(tables.payouts.get(&payout_id).cloned())
    }

    async fn insert_payout(&mut self, payout: &PayoutRecord) -> Result<(), StoreError> {
        ensure_available(&self.shared)?;
        let exists = {
            let tables = self.shared.tables.read().await;
            tables.payouts.contains_key(&payout.id)
        };
        if exists || self.payout_writes.contains_key(&payout.id) {
            return Err(StoreError::Conflict {
                entity: "payout",
                id: payout.id,
            });
        }

        self.acquire(vec![RowKey::Payout(payout.id)]).await;
        self.payout_writes.insert(payout.id, payout.clone());
        Ok(())
    }

    async fn update_payout(&mut self, payout: &PayoutRecord) -> Result<(), StoreError> {
        ensure_available(&self.shared)?;
        self.ensure_held(RowKey::Payout(payout.id))?;

        let current = match self.payout_writes.get(&payout.id) {
            Some(staged) => staged.clone(),
            None => {
                let tables = self.shared.tables.read().await;
                tables
                    .payouts
                    .get(&payout.id)
                    .cloned()
                    .ok_or_else(|| StoreError::Backend(format!("payout {} missing", payout.id)))?
            }
        };

        // Amount and included ids are fixed at creation.
        let updated = PayoutRecord {
            status: payout.status,
            external_transfer_id: payout.external_transfer_id.clone(),
            error_message: payout.error_message.clone(),
            submitted_at: payout.submitted_at,
            finalized_at: payout.finalized_at,
            ..current
        };
        self.payout_writes.insert(payout.id, updated);
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        ensure_available(&self.shared)?;
        let injected = self
            .shared
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable(
                "injected commit failure".to_string(),
            ));
        }

        let Self {
            shared,
            held,
            commission_writes,
            payout_writes,
        } = self;

        {
            let mut tables = shared.tables.write().await;
            for (id, status) in commission_writes {
                if let Some(commission) = tables.commissions.get_mut(&id) {
                    commission.status = status;
                }
            }
            for (id, payout) in payout_writes {
                tables.payouts.insert(id, payout);
            }
        }

        drop(held);
        Ok(())
    }
}
