use async_trait::async_trait;
use chrono::{DateTime, Utc};
use commission_core::{
    BeneficiaryAccount, Commission, CommissionSelection, CommissionStatus, CommissionStore,
    CommissionSummary, PayoutRecord, PayoutStatus, StoreError, UnitOfWork,
};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS commissions (
        id UUID PRIMARY KEY,
        beneficiary_id UUID NOT NULL,
        referral_id UUID NOT NULL,
        rate NUMERIC(9, 6) NOT NULL,
        base_amount NUMERIC(18, 2) NOT NULL,
        amount NUMERIC(18, 2) NOT NULL,
        status TEXT NOT NULL,
        period_start DATE NOT NULL,
        period_end DATE NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS commissions_beneficiary_status_idx ON commissions (beneficiary_id, status)",
    r#"
    CREATE TABLE IF NOT EXISTS beneficiary_accounts (
        beneficiary_id UUID PRIMARY KEY,
        external_account_reference TEXT NOT NULL,
        payouts_enabled BOOLEAN NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS payouts (
        id UUID PRIMARY KEY,
        beneficiary_id UUID NOT NULL,
        amount NUMERIC(18, 2) NOT NULL,
        status TEXT NOT NULL,
        external_transfer_id TEXT,
        error_message TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        submitted_at TIMESTAMPTZ,
        finalized_at TIMESTAMPTZ
    )
    "#,
    "ALTER TABLE payouts ADD COLUMN IF NOT EXISTS submitted_at TIMESTAMPTZ",
    "CREATE INDEX IF NOT EXISTS payouts_beneficiary_idx ON payouts (beneficiary_id, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS payout_commissions (
        payout_id UUID NOT NULL REFERENCES payouts (id),
        commission_id UUID NOT NULL REFERENCES commissions (id),
        PRIMARY KEY (payout_id, commission_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS payout_commissions_commission_idx ON payout_commissions (commission_id)",
    r#"
    CREATE TABLE IF NOT EXISTS beneficiary_commission_stats (
        beneficiary_id UUID PRIMARY KEY,
        pending_count BIGINT NOT NULL,
        pending_amount NUMERIC(18, 2) NOT NULL,
        approved_count BIGINT NOT NULL,
        approved_amount NUMERIC(18, 2) NOT NULL,
        paid_count BIGINT NOT NULL,
        paid_amount NUMERIC(18, 2) NOT NULL,
        refreshed_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

const COMMISSION_COLUMNS: &str = "c.id, c.beneficiary_id, c.referral_id, c.rate, c.base_amount, \
     c.amount, c.status, c.period_start, c.period_end, c.created_at";

const PAYOUT_COLUMNS: &str = "p.id, p.beneficiary_id, p.amount, p.status, \
     p.external_transfer_id, p.error_message, p.created_at, p.submitted_at, \
     p.finalized_at, \
     ARRAY(SELECT pc.commission_id FROM payout_commissions pc \
           WHERE pc.payout_id = p.id ORDER BY pc.commission_id) AS included_commission_ids";

const ACCOUNT_COLUMNS: &str =
    "beneficiary_id, external_account_reference, payouts_enabled, updated_at";

/// Postgres-backed commission store. Row locks are `SELECT ... FOR UPDATE`
/// inside the unit of work's transaction.
#[derive(Clone)]
pub struct PgCommissionStore {
    pool: PgPool,
}

impl PgCommissionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&self.pool)
                .await
                .map_err(backend_error)?;
        }
        Ok(())
    }

    /// Upserts the cached per-status figures shown on a beneficiary's profile.
    pub async fn refresh_cached_stats(
        &self,
        summary: &CommissionSummary,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO beneficiary_commission_stats (
                beneficiary_id, pending_count, pending_amount, approved_count,
                approved_amount, paid_count, paid_amount, refreshed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (beneficiary_id) DO UPDATE SET
                pending_count = EXCLUDED.pending_count,
                pending_amount = EXCLUDED.pending_amount,
                approved_count = EXCLUDED.approved_count,
                approved_amount = EXCLUDED.approved_amount,
                paid_count = EXCLUDED.paid_count,
                paid_amount = EXCLUDED.paid_amount,
                refreshed_at = EXCLUDED.refreshed_at
            "#,
        )
        .bind(summary.beneficiary_id)
        .bind(summary.pending_count)
        .bind(summary.pending_amount)
        .bind(summary.approved_count)
        .bind(summary.approved_amount)
        .bind(summary.paid_count)
        .bind(summary.paid_amount)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(backend_error)?;

        Ok(())
    }
}

#[async_trait]
impl CommissionStore for PgCommissionStore {
    type Tx = PgUnitOfWork;

    async fn begin(&self) -> Result<PgUnitOfWork, StoreError> {
        let tx = self.pool.begin().await.map_err(backend_error)?;
        Ok(PgUnitOfWork { tx })
    }

    async fn insert_commission(&self, commission: &Commission) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO commissions (
                id, beneficiary_id, referral_id, rate, base_amount, amount, status,
                period_start, period_end, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            "#,
        )
        .bind(commission.id)
        .bind(commission.beneficiary_id)
        .bind(commission.referral_id)
        .bind(commission.rate)
        .bind(commission.base_amount)
        .bind(commission.amount)
        .bind(commission.status.as_str())
        .bind(commission.period_start)
        .bind(commission.period_end)
        .bind(commission.created_at)
        .execute(&self.pool)
        .await
        .map_err(|err| conflict_or_backend(err, "commission", commission.id))?;

        Ok(())
    }

    async fn commission(&self, commission_id: Uuid) -> Result<Option<Commission>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COMMISSION_COLUMNS} FROM commissions c WHERE c.id = $1"
        ))
        .bind(commission_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_error)?;

        row.as_ref().map(commission_from_row).transpose()
    }

    async fn commissions_for(&self, beneficiary_id: Uuid) -> Result<Vec<Commission>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COMMISSION_COLUMNS} FROM commissions c \
             WHERE c.beneficiary_id = $1 ORDER BY c.created_at, c.id"
        ))
        .bind(beneficiary_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_error)?;

        rows.iter().map(commission_from_row).collect()
    }

    async fn payout(&self, payout_id: Uuid) -> Result<Option<PayoutRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts p WHERE p.id = $1"
        ))
        .bind(payout_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_error)?;

        row.as_ref().map(payout_from_row).transpose()
    }

    async fn payouts_for(&self, beneficiary_id: Uuid) -> Result<Vec<PayoutRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts p \
             WHERE p.beneficiary_id = $1 ORDER BY p.created_at, p.id"
        ))
        .bind(beneficiary_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_error)?;

        rows.iter().map(payout_from_row).collect()
    }

    async fn account(
        &self,
        beneficiary_id: Uuid,
    ) -> Result<Option<BeneficiaryAccount>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM beneficiary_accounts WHERE beneficiary_id = $1"
        ))
        .bind(beneficiary_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_error)?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn upsert_account(&self, account: &BeneficiaryAccount) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO beneficiary_accounts (
                beneficiary_id, external_account_reference, payouts_enabled, updated_at
            )
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (beneficiary_id) DO UPDATE SET
                external_account_reference = EXCLUDED.external_account_reference,
                payouts_enabled = EXCLUDED.payouts_enabled,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(account.beneficiary_id)
        .bind(&account.external_account_reference)
        .bind(account.payouts_enabled)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend_error)?;

        Ok(())
    }

    async fn summarize(&self, beneficiary_id: Uuid) -> Result<CommissionSummary, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS commission_count, COALESCE(SUM(amount), 0) AS total
            FROM commissions
            WHERE beneficiary_id = $1
            GROUP BY status
            "#,
        )
        .bind(beneficiary_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_error)?;

        let mut summary = CommissionSummary {
            beneficiary_id,
            ..CommissionSummary::default()
        };
        for row in &rows {
            let status: String = row.try_get("status").map_err(backend_error)?;
            let count: i64 = row.try_get("commission_count").map_err(backend_error)?;
            let total: Decimal = row.try_get("total").map_err(backend_error)?;
            add_status_totals(&mut summary, &CommissionStatus::parse(&status), count, total);
        }

        Ok(summary)
    }
}

pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn lock_account(
        &mut self,
        beneficiary_id: Uuid,
    ) -> Result<Option<BeneficiaryAccount>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM beneficiary_accounts \
             WHERE beneficiary_id = $1 FOR UPDATE"
        ))
        .bind(beneficiary_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(backend_error)?;

        row.as_ref().map(account_from_row).transpose()
    }

    // Postgres re-evaluates the row predicate once a lock is granted. The
    // pending-payout check is a fresh snapshot per statement, and payout
    // preparation holds the account lock, so two preparations cannot both
    // see a commission as unclaimed.
    async fn lock_commissions(
        &mut self,
        selection: &CommissionSelection,
    ) -> Result<Vec<Commission>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COMMISSION_COLUMNS}
            FROM commissions c
            WHERE c.beneficiary_id = $1
              AND ($2::uuid[] IS NULL OR c.id = ANY($2))
              AND ($3::text IS NULL OR c.status = $3)
              AND (NOT $4 OR NOT EXISTS (
                    SELECT 1
                    FROM payout_commissions pc
                    JOIN payouts p ON p.id = pc.payout_id
                    WHERE pc.commission_id = c.id AND p.status = 'PENDING'
              ))
            ORDER BY c.id
            FOR UPDATE OF c
            "#
        ))
        .bind(selection.beneficiary_id)
        .bind(selection.ids.clone())
        .bind(selection.status.as_ref().map(|status| status.as_str().to_string()))
        .bind(selection.unclaimed)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(backend_error)?;

        rows.iter().map(commission_from_row).collect()
    }

    async fn update_commission_status(
        &mut self,
        ids: &[Uuid],
        status: &CommissionStatus,
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            "UPDATE commissions SET status = $2, updated_at = $3 WHERE id = ANY($1)",
        )
        .bind(ids.to_vec())
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await
        .map_err(backend_error)?;

        Ok(result.rows_affected())
    }

    async fn lock_payout(&mut self, payout_id: Uuid) -> Result<Option<PayoutRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PAYOUT_COLUMNS} FROM payouts p WHERE p.id = $1 FOR UPDATE OF p"
        ))
        .bind(payout_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(backend_error)?;

        row.as_ref().map(payout_from_row).transpose()
    }

    async fn insert_payout(&mut self, payout: &PayoutRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO payouts (
                id, beneficiary_id, amount, status, external_transfer_id,
                error_message, created_at, submitted_at, finalized_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(payout.id)
        .bind(payout.beneficiary_id)
        .bind(payout.amount)
        .bind(payout.status.as_str())
        .bind(&payout.external_transfer_id)
        .bind(&payout.error_message)
        .bind(payout.created_at)
        .bind(payout.submitted_at)
        .bind(payout.finalized_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|err| conflict_or_backend(err, "payout", payout.id))?;

        sqlx::query(
            r#"
            INSERT INTO payout_commissions (payout_id, commission_id)
            SELECT $1, commission_id FROM UNNEST($2::uuid[]) AS commission_id
            "#,
        )
        .bind(payout.id)
        .bind(payout.included_commission_ids.clone())
        .execute(&mut *self.tx)
        .await
        .map_err(backend_error)?;

        Ok(())
    }

    async fn update_payout(&mut self, payout: &PayoutRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE payouts
            SET status = $2, external_transfer_id = $3, error_message = $4,
                submitted_at = $5, finalized_at = $6
            WHERE id = $1
            "#,
        )
        .bind(payout.id)
        .bind(payout.status.as_str())
        .bind(&payout.external_transfer_id)
        .bind(&payout.error_message)
        .bind(payout.submitted_at)
        .bind(payout.finalized_at)
        .execute(&mut *self.tx)
        .await
        .map_err(backend_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Backend(format!(
                "payout {} does not exist",
                payout.id
            )));
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(backend_error)
    }
}

fn commission_from_row(row: &PgRow) -> Result<Commission, StoreError> {
    let status: String = row.try_get("status").map_err(backend_error)?;

    Ok(Commission {
        id: row.try_get("id").map_err(backend_error)?,
        beneficiary_id: row.try_get("beneficiary_id").map_err(backend_error)?,
        referral_id: row.try_get("referral_id").map_err(backend_error)?,
        rate: row.try_get("rate").map_err(backend_error)?,
        base_amount: row.try_get("base_amount").map_err(backend_error)?,
        amount: row.try_get("amount").map_err(backend_error)?,
        status: CommissionStatus::parse(&status),
        period_start: row.try_get("period_start").map_err(backend_error)?,
        period_end: row.try_get("period_end").map_err(backend_error)?,
        created_at: row.try_get("created_at").map_err(backend_error)?,
    })
}

fn payout_from_row(row: &PgRow) -> Result<PayoutRecord, StoreError> {
    let id: Uuid = row.try_get("id").map_err(backend_error)?;
    let status: String = row.try_get("status").map_err(backend_error)?;
    let finalized_at: Option<DateTime<Utc>> = row.try_get("finalized_at").map_err(backend_error)?;

    Ok(PayoutRecord {
        id,
        beneficiary_id: row.try_get("beneficiary_id").map_err(backend_error)?,
        amount: row.try_get("amount").map_err(backend_error)?,
        status: decode_payout_status(id, &status)?,
        external_transfer_id: row.try_get("external_transfer_id").map_err(backend_error)?,
        error_message: row.try_get("error_message").map_err(backend_error)?,
        included_commission_ids: row
            .try_get("included_commission_ids")
            .map_err(backend_error)?,
        created_at: row.try_get("created_at").map_err(backend_error)?,
        submitted_at: row.try_get("submitted_at").map_err(backend_error)?,
        finalized_at,
    })
}

fn account_from_row(row: &PgRow) -> Result<BeneficiaryAccount, StoreError> {
    Ok(BeneficiaryAccount {
        beneficiary_id: row.try_get("beneficiary_id").map_err(backend_error)?,
        external_account_reference: row
            .try_get("external_account_reference")
            .map_err(backend_error)?,
        payouts_enabled: row.try_get("payouts_enabled").map_err(backend_error)?,
        updated_at: row.try_get("updated_at").map_err(backend_error)?,
    })
}

fn decode_payout_status(payout_id: Uuid, raw: &str) -> Result<PayoutStatus, StoreError> {
    PayoutStatus::parse(raw).ok_or_else(|| StoreError::Corrupt {
        entity: "payout",
        id: payout_id,
        message: format!("unknown payout status {raw:?}"),
    })
}

fn add_status_totals(
    summary: &mut CommissionSummary,
    status: &CommissionStatus,
    count: i64,
    total: Decimal,
) {
    let (count_slot, amount_slot) = match status {
        CommissionStatus::Pending => (&mut summary.pending_count, &mut summary.pending_amount),
        CommissionStatus::Approved => (&mut summary.approved_count, &mut summary.approved_amount),
        CommissionStatus::Paid => (&mut summary.paid_count, &mut summary.paid_amount),
        CommissionStatus::Unrecognized(_) => return,
    };
    *count_slot += count;
    *amount_slot += total;
}

fn backend_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(err.to_string())
        }
        other => StoreError::Backend(other.to_string()),
    }
}

fn conflict_or_backend(err: sqlx::Error, entity: &'static str, id: Uuid) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::Conflict { entity, id };
        }
    }
    backend_error(err)
}
