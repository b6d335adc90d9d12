//! The authoritative per-user balance and transaction log.
//!
//! Every mutation goes through [`LedgerStore::apply_entry`]; everything else
//! is a snapshot read. The `balances` row is maintained in the same
//! transaction that appends the entry, so the incrementally kept balance and
//! the entry log can never drift apart.

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{Currency, LedgerEntry, LedgerReason};

#[derive(Clone)]
pub struct LedgerStore {
    pool: SqlitePool,
}

impl LedgerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Applies a signed balance delta atomically.
    ///
    /// Debits are a conditional decrement: if the balance would go negative
    /// the whole transaction rolls back with `InsufficientFunds`. A second
    /// topup referencing the same invoice hits the partial unique index and
    /// rolls back with `DuplicateInvoiceCredit`, an idempotency layer that
    /// holds even if a caller bypasses the reconciliation engine.
    pub async fn apply_entry(
        &self,
        user_id: &str,
        currency: Currency,
        delta: i64,
        reason: LedgerReason,
        invoice_id: Option<&str>,
    ) -> Result<LedgerEntry, StoreError> {
        let mut tx = self.pool.begin().await?;

        if delta < 0 {
            let res = sqlx::query(
                r#"UPDATE balances SET balance = balance + ?3
                   WHERE user_id = ?1 AND currency = ?2 AND balance + ?3 >= 0"#,
            )
            .bind(user_id)
            .bind(currency)
            .bind(delta)
            .execute(tx.as_mut())
            .await?;

            if res.rows_affected() == 0 {
                let balance: i64 = sqlx::query_scalar(
                    r#"SELECT COALESCE(
                         (SELECT balance FROM balances WHERE user_id = ?1 AND currency = ?2), 0)"#,
                )
                .bind(user_id)
                .bind(currency)
                .fetch_one(tx.as_mut())
                .await?;
                return Err(StoreError::InsufficientFunds {
                    balance,
                    requested: -delta,
                });
            }
        } else {
            sqlx::query(
                r#"INSERT INTO balances (user_id, currency, balance) VALUES (?1, ?2, ?3)
                   ON CONFLICT (user_id, currency) DO UPDATE SET balance = balance + excluded.balance"#,
            )
            .bind(user_id)
            .bind(currency)
            .bind(delta)
            .execute(tx.as_mut())
            .await?;
        }

        let entry = LedgerEntry {
            entry_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            currency,
            delta,
            reason,
            invoice_id: invoice_id.map(str::to_string),
            created_at: Utc::now(),
        };

        let res = sqlx::query(
            r#"INSERT INTO ledger_entries (entry_id, user_id, currency, delta, reason, invoice_id, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
        )
        .bind(&entry.entry_id)
        .bind(&entry.user_id)
        .bind(entry.currency)
        .bind(entry.delta)
        .bind(entry.reason)
        .bind(entry.invoice_id.as_deref())
        .bind(entry.created_at)
        .execute(tx.as_mut())
        .await;

        if let Err(e) = res {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.is_unique_violation() {
                    return Err(StoreError::DuplicateInvoiceCredit(
                        invoice_id.unwrap_or_default().to_string(),
                    ));
                }
            }
            return Err(e.into());
        }

        tx.commit().await?;
        Ok(entry)
    }

    /// The incrementally maintained balance for one user/currency pair.
    pub async fn current_balance(
        &self,
        user_id: &str,
        currency: Currency,
    ) -> Result<i64, StoreError> {
        let balance: Option<i64> =
            sqlx::query_scalar(r#"SELECT balance FROM balances WHERE user_id = ?1 AND currency = ?2"#)
                .bind(user_id)
                .bind(currency)
                .fetch_optional(&self.pool)
                .await?;
        Ok(balance.unwrap_or(0))
    }

    /// All non-zero balances for a user.
    pub async fn balances(&self, user_id: &str) -> Result<Vec<(Currency, i64)>, StoreError> {
        let rows: Vec<(Currency, i64)> =
            sqlx::query_as(r#"SELECT currency, balance FROM balances WHERE user_id = ?1"#)
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    /// Sum of the entry log for a user/currency pair. Always equal to
    /// [`current_balance`](Self::current_balance); exposed so callers can
    /// audit that.
    pub async fn entry_sum(&self, user_id: &str, currency: Currency) -> Result<i64, StoreError> {
        let sum: i64 = sqlx::query_scalar(
            r#"SELECT COALESCE(SUM(delta), 0) FROM ledger_entries
               WHERE user_id = ?1 AND currency = ?2"#,
        )
        .bind(user_id)
        .bind(currency)
        .fetch_one(&self.pool)
        .await?;
        Ok(sum)
    }

    /// Entries back-referencing one invoice, oldest first.
    pub async fn entries_for_invoice(
        &self,
        invoice_id: &str,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query_as::<_, LedgerEntry>(
            r#"SELECT entry_id, user_id, currency, delta, reason, invoice_id, created_at
               FROM ledger_entries WHERE invoice_id = ?1 ORDER BY created_at ASC"#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
