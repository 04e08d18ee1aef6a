use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use conductor_core::credit::CreditReservation;
use conductor_core::error::{ConductorError, LedgerError};
use conductor_core::run::RunId;
use sqlx::prelude::FromRow;
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::db::db_err;
use crate::run_store::parse_ts;

/// Credit reservation ledger. Reserve must precede any consume; release
/// happens exactly once per run, triggered only by a terminal-state side
/// effect, never by the supervisor directly.
#[derive(Clone)]
pub struct CreditLedger {
    pool: Arc<SqlitePool>,
}

#[derive(Debug, FromRow)]
struct ReservationRow {
    run_id: String,
    tenant_id: String,
    reserved: i64,
    consumed: i64,
    max_amount: i64,
    expires_at: String,
    released: i64,
    created_at: String,
}

impl CreditLedger {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    /// Add credits to a tenant's available balance.
    pub async fn grant(&self, tenant_id: &str, amount: i64) -> Result<(), ConductorError> {
        sqlx::query(
            r#"
            INSERT INTO tenant_balances (tenant_id, available) VALUES (?, ?)
            ON CONFLICT(tenant_id) DO UPDATE SET available = available + excluded.available
            "#,
        )
        .bind(tenant_id)
        .bind(amount)
        .execute(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn balance(&self, tenant_id: &str) -> Result<i64, ConductorError> {
        let available: Option<i64> =
            sqlx::query_scalar("SELECT available FROM tenant_balances WHERE tenant_id = ?")
                .bind(tenant_id)
                .fetch_optional(self.pool.as_ref())
                .await
                .map_err(db_err)?;
        Ok(available.unwrap_or(0))
    }

    /// Create the single active reservation for a run, debiting the tenant's
    /// balance by `amount`. Fails with `InsufficientCredits` (writing
    /// nothing) when the balance cannot cover it.
    pub async fn reserve(
        &self,
        tenant_id: &str,
        run_id: RunId,
        amount: i64,
        max_amount: i64,
        ttl: Duration,
    ) -> Result<CreditReservation, ConductorError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM credit_reservations WHERE run_id = ? AND released = 0",
        )
        .bind(run_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        if existing.is_some() {
            return Err(LedgerError::ReservationExists { run_id }.into());
        }

        let available = balance_in_tx(&mut tx, tenant_id).await?;
        if available < amount {
            return Err(LedgerError::InsufficientCredits {
                tenant_id: tenant_id.to_string(),
                requested: amount,
                available,
            }
            .into());
        }

        debit_in_tx(&mut tx, tenant_id, amount).await?;

        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1));
        sqlx::query(
            r#"
            INSERT INTO credit_reservations
                (run_id, tenant_id, reserved, consumed, max_amount, expires_at, released, created_at)
            VALUES (?, ?, ?, 0, ?, ?, 0, ?)
            "#,
        )
        .bind(run_id.to_string())
        .bind(tenant_id)
        .bind(amount)
        .bind(max_amount)
        .bind(expires_at.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        Ok(CreditReservation {
            run_id,
            tenant_id: tenant_id.to_string(),
            reserved: amount,
            consumed: 0,
            max_amount,
            expires_at,
            released: false,
            created_at: now,
        })
    }

    /// Unconsumed headroom on the run's active reservation. An expired
    /// reservation no longer grants headroom.
    pub async fn available(&self, run_id: RunId) -> Result<i64, ConductorError> {
        let reservation = self.active_reservation(run_id).await?;
        match reservation {
            Some(r) if r.expires_at <= Utc::now() => Err(LedgerError::ReservationExpired {
                run_id,
                expired_at: r.expires_at,
            }
            .into()),
            Some(r) => Ok(r.reserved - r.consumed),
            None => Err(LedgerError::ReservationMissing { run_id }.into()),
        }
    }

    /// Debit `amount` against the run's reservation. Fails closed: nothing is
    /// written when the debit would exceed `max_amount`, or when a needed
    /// top-up exceeds the tenant's balance. A debit past `reserved` but
    /// within `max_amount` tops the reservation up from the balance, keeping
    /// `consumed <= reserved` true throughout.
    pub async fn consume(&self, run_id: RunId, amount: i64) -> Result<(), ConductorError> {
        if amount <= 0 {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = active_reservation_in_tx(&mut tx, run_id).await?;
        let Some(r) = row else {
            return Err(LedgerError::ReservationMissing { run_id }.into());
        };
        if r.expires_at <= Utc::now() {
            return Err(LedgerError::ReservationExpired {
                run_id,
                expired_at: r.expires_at,
            }
            .into());
        }

        let target = r.consumed + amount;
        if target > r.max_amount {
            return Err(LedgerError::MaxAmountExceeded {
                run_id,
                consumed: r.consumed,
                requested: amount,
                max_amount: r.max_amount,
            }
            .into());
        }

        let mut reserved = r.reserved;
        if target > reserved {
            let top_up = target - reserved;
            let available = balance_in_tx(&mut tx, &r.tenant_id).await?;
            if available < top_up {
                return Err(LedgerError::InsufficientCredits {
                    tenant_id: r.tenant_id.clone(),
                    requested: top_up,
                    available,
                }
                .into());
            }
            debit_in_tx(&mut tx, &r.tenant_id, top_up).await?;
            reserved += top_up;
        }

        sqlx::query(
            "UPDATE credit_reservations SET reserved = ?, consumed = ? WHERE run_id = ? AND released = 0",
        )
        .bind(reserved)
        .bind(target)
        .bind(run_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Return the unconsumed remainder to the tenant's balance and mark the
    /// reservation released. Idempotent: a second call refunds nothing.
    pub async fn release(&self, run_id: RunId) -> Result<i64, ConductorError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let Some(r) = active_reservation_in_tx(&mut tx, run_id).await? else {
            return Ok(0);
        };

        let refund = r.reserved - r.consumed;
        if refund > 0 {
            sqlx::query(
                r#"
                INSERT INTO tenant_balances (tenant_id, available) VALUES (?, ?)
                ON CONFLICT(tenant_id) DO UPDATE SET available = available + excluded.available
                "#,
            )
            .bind(&r.tenant_id)
            .bind(refund)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        sqlx::query("UPDATE credit_reservations SET released = 1 WHERE run_id = ? AND released = 0")
            .bind(run_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(refund)
    }

    /// Release every unreleased reservation whose TTL has passed, refunding
    /// the unconsumed remainder. Returns how many were swept. Timestamps are
    /// compared after parsing; the stored text is not ordered reliably enough
    /// to filter in SQL.
    pub async fn sweep_expired(&self) -> Result<u64, ConductorError> {
        let now = Utc::now();
        let rows = sqlx::query_as::<_, ReservationRow>(
            "SELECT * FROM credit_reservations WHERE released = 0",
        )
        .fetch_all(self.pool.as_ref())
        .await
        .map_err(db_err)?;

        let mut swept = 0;
        for row in rows {
            let r = parse_reservation_row(row)?;
            if r.expires_at <= now {
                self.release(r.run_id).await?;
                swept += 1;
            }
        }
        Ok(swept)
    }

    pub async fn active_reservation(
        &self,
        run_id: RunId,
    ) -> Result<Option<CreditReservation>, ConductorError> {
        let row = sqlx::query_as::<_, ReservationRow>(
            "SELECT * FROM credit_reservations WHERE run_id = ? AND released = 0",
        )
        .bind(run_id.to_string())
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(db_err)?;
        row.map(parse_reservation_row).transpose()
    }
}

async fn balance_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    tenant_id: &str,
) -> Result<i64, ConductorError> {
    let available: Option<i64> =
        sqlx::query_scalar("SELECT available FROM tenant_balances WHERE tenant_id = ?")
            .bind(tenant_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?;
    Ok(available.unwrap_or(0))
}

async fn debit_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    tenant_id: &str,
    amount: i64,
) -> Result<(), ConductorError> {
    sqlx::query("UPDATE tenant_balances SET available = available - ? WHERE tenant_id = ?")
        .bind(amount)
        .bind(tenant_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    Ok(())
}

async fn active_reservation_in_tx(
    tx: &mut Transaction<'_, Sqlite>,
    run_id: RunId,
) -> Result<Option<ReservationParsed>, ConductorError> {
    let row = sqlx::query_as::<_, ReservationRow>(
        "SELECT * FROM credit_reservations WHERE run_id = ? AND released = 0",
    )
    .bind(run_id.to_string())
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_err)?;

    row.map(|r| {
        Ok(ReservationParsed {
            tenant_id: r.tenant_id,
            reserved: r.reserved,
            consumed: r.consumed,
            max_amount: r.max_amount,
            expires_at: parse_ts(&r.expires_at)?,
        })
    })
    .transpose()
}

struct ReservationParsed {
    tenant_id: String,
    reserved: i64,
    consumed: i64,
    max_amount: i64,
    expires_at: chrono::DateTime<Utc>,
}

fn parse_reservation_row(row: ReservationRow) -> Result<CreditReservation, ConductorError> {
    Ok(CreditReservation {
        run_id: row
            .run_id
            .parse()
            .map_err(|e: uuid::Error| {
                ConductorError::Infra(conductor_core::error::InfraError::Database(e.to_string()))
            })?,
        tenant_id: row.tenant_id,
        reserved: row.reserved,
        consumed: row.consumed,
        max_amount: row.max_amount,
        expires_at: parse_ts(&row.expires_at)?,
        released: row.released != 0,
        created_at: parse_ts(&row.created_at)?,
    })
}
