//! SQLite-backed idempotency store and analysis ledger.
//!
//! One [`SqlitePool`] serves both traits. The schema is created on connect
//! (`CREATE TABLE IF NOT EXISTS`); richer migrations belong to the host
//! application.
//!
//! # Atomic debit
//!
//! [`AnalysisLedger::persist_and_debit`] runs in a single transaction:
//! re-read the balance, insert the analysis row, then decrement with a
//! guarded `UPDATE ... WHERE balance >= 1`. Any failure drops the
//! transaction, which rolls all three back.
//!
//! Timestamps are stored as RFC 3339 text with microsecond precision.

use super::{AnalysisLedger, IdempotencyStore, NewAnalysis, Payer, StoredAnalysis};
use crate::classify::ContractType;
use crate::config::IntakeOptions;
use crate::error::StoreError;
use crate::idempotency::{IdempotencyRecord, IdempotencyStatus};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS accounts (
        id      TEXT PRIMARY KEY,
        balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS guest_quotas (
        guest_id TEXT PRIMARY KEY,
        used     INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analyses (
        id            TEXT PRIMARY KEY,
        payer_kind    TEXT NOT NULL,
        payer_id      TEXT NOT NULL,
        contract_type TEXT NOT NULL,
        filename      TEXT NOT NULL,
        payload_json  TEXT NOT NULL,
        created_at    TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS idempotency_keys (
        key           TEXT PRIMARY KEY,
        fingerprint   TEXT NOT NULL,
        status        TEXT NOT NULL,
        result_id     TEXT,
        locked_until  TEXT,
        expires_at    TEXT NOT NULL,
        error_code    TEXT,
        error_message TEXT,
        created_at    TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_analyses_payer ON analyses (payer_kind, payer_id)",
];

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|v| v.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("invalid timestamp {value}: {e}")))
}

/// SQLite implementation of [`IdempotencyStore`] and [`AnalysisLedger`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    guest_quota: i64,
}

impl SqliteStore {
    /// Wrap an existing pool and create the schema.
    pub async fn new(pool: SqlitePool, guest_quota: i64) -> Result<Self, StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        debug!("sqlite schema ready");
        Ok(Self {
            pool,
            guest_quota: guest_quota.max(0),
        })
    }

    /// Open (creating if needed) the database at `url`, e.g.
    /// `sqlite:/var/lib/contract-intake/intake.db`, with WAL enabled.
    pub async fn connect(url: &str, guest_quota: i64) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        info!(url, "sqlite store connected");
        Self::new(pool, guest_quota).await
    }

    /// [`SqliteStore::connect`] with the guest quota from `options`.
    pub async fn from_config(url: &str, options: &IntakeOptions) -> Result<Self, StoreError> {
        Self::connect(url, options.guest_quota).await
    }

    /// Private in-memory database on a single connection.
    pub async fn in_memory(guest_quota: i64) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::new(pool, guest_quota).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Set an account's credit balance, creating the account if needed.
    pub async fn set_balance(&self, account: &str, credits: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, balance) VALUES (?1, ?2)
            ON CONFLICT(id) DO UPDATE SET balance = excluded.balance
            "#,
        )
        .bind(account)
        .bind(credits.max(0))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn analysis_count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM analyses")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn map_record(row: SqliteRow) -> Result<IdempotencyRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let locked_until: Option<String> = row.try_get("locked_until")?;
    let expires_at: String = row.try_get("expires_at")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(IdempotencyRecord {
        key: row.try_get("key")?,
        fingerprint: row.try_get("fingerprint")?,
        status: IdempotencyStatus::parse(&status)
            .ok_or_else(|| StoreError::Backend(format!("unknown idempotency status {status}")))?,
        result_id: row.try_get("result_id")?,
        locked_until: locked_until.as_deref().map(parse_ts).transpose()?,
        expires_at: parse_ts(&expires_at)?,
        error_code: row.try_get("error_code")?,
        error_message: row.try_get("error_message")?,
        created_at: parse_ts(&created_at)?,
    })
}

fn map_analysis(row: SqliteRow) -> Result<StoredAnalysis, StoreError> {
    let payer_kind: String = row.try_get("payer_kind")?;
    let payer_id: String = row.try_get("payer_id")?;
    let payer = match payer_kind.as_str() {
        "account" => Payer::Account(payer_id),
        "guest" => Payer::Guest(payer_id),
        other => return Err(StoreError::Backend(format!("unknown payer kind {other}"))),
    };
    let contract_type: String = row.try_get("contract_type")?;
    let payload_json: String = row.try_get("payload_json")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(StoredAnalysis {
        id: row.try_get("id")?,
        payer,
        contract_type: ContractType::from_label(&contract_type).unwrap_or(ContractType::Other),
        filename: row.try_get("filename")?,
        payload: serde_json::from_str(&payload_json)
            .map_err(|e| StoreError::Backend(format!("corrupt analysis payload: {e}")))?,
        created_at: parse_ts(&created_at)?,
    })
}

fn payer_kind(payer: &Payer) -> &'static str {
    match payer {
        Payer::Account(_) => "account",
        Payer::Guest(_) => "guest",
    }
}

#[async_trait]
impl IdempotencyStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT key, fingerprint, status, result_id, locked_until, expires_at,
                   error_code, error_message, created_at
            FROM idempotency_keys WHERE key = ?1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(map_record).transpose()
    }

    async fn insert(&self, record: &IdempotencyRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, fingerprint, status, result_id, locked_until,
                                          expires_at, error_code, error_message, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(key) DO NOTHING
            "#,
        )
        .bind(&record.key)
        .bind(&record.fingerprint)
        .bind(record.status.as_str())
        .bind(&record.result_id)
        .bind(record.locked_until.map(format_ts))
        .bind(format_ts(record.expires_at))
        .bind(&record.error_code)
        .bind(&record.error_message)
        .bind(format_ts(record.created_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_succeeded(
        &self,
        key: &str,
        created_at: DateTime<Utc>,
        result_id: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET status = ?3, result_id = ?4, locked_until = NULL
            WHERE key = ?1 AND created_at = ?2
            "#,
        )
        .bind(key)
        .bind(format_ts(created_at))
        .bind(IdempotencyStatus::Succeeded.as_str())
        .bind(result_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        key: &str,
        created_at: DateTime<Utc>,
        code: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET status = ?3, error_code = ?4, error_message = ?5, locked_until = NULL
            WHERE key = ?1 AND created_at = ?2
            "#,
        )
        .bind(key)
        .bind(format_ts(created_at))
        .bind(IdempotencyStatus::Failed.as_str())
        .bind(code)
        .bind(message)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn remove(&self, key: &str, created_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE key = ?1 AND created_at = ?2")
            .bind(key)
            .bind(format_ts(created_at))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl AnalysisLedger for SqliteStore {
    async fn remaining(&self, payer: &Payer) -> Result<i64, StoreError> {
        match payer {
            Payer::Account(id) => {
                let balance: Option<i64> =
                    sqlx::query_scalar("SELECT balance FROM accounts WHERE id = ?1")
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await?;
                Ok(balance.unwrap_or(0))
            }
            Payer::Guest(id) => {
                let used: Option<i64> =
                    sqlx::query_scalar("SELECT used FROM guest_quotas WHERE guest_id = ?1")
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await?;
                Ok(self.guest_quota - used.unwrap_or(0))
            }
        }
    }

    async fn persist_and_debit(&self, analysis: &NewAnalysis) -> Result<i64, StoreError> {
        let payload_json = serde_json::to_string(&analysis.payload)
            .map_err(|e| StoreError::Backend(format!("cannot encode analysis payload: {e}")))?;
        let mut tx = self.pool.begin().await?;

        match &analysis.payer {
            Payer::Account(id) => {
                let balance: Option<i64> =
                    sqlx::query_scalar("SELECT balance FROM accounts WHERE id = ?1")
                        .bind(id)
                        .fetch_optional(&mut *tx)
                        .await?;
                if balance.unwrap_or(0) < 1 {
                    return Err(analysis.payer.exhausted());
                }
            }
            Payer::Guest(id) => {
                sqlx::query(
                    "INSERT INTO guest_quotas (guest_id, used) VALUES (?1, 0) ON CONFLICT(guest_id) DO NOTHING",
                )
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query(
            r#"
            INSERT INTO analyses (id, payer_kind, payer_id, contract_type, filename,
                                  payload_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&analysis.id)
        .bind(payer_kind(&analysis.payer))
        .bind(analysis.payer.id())
        .bind(analysis.contract_type.as_str())
        .bind(&analysis.filename)
        .bind(&payload_json)
        .bind(format_ts(Utc::now()))
        .execute(&mut *tx)
        .await?;

        let remaining = match &analysis.payer {
            Payer::Account(id) => {
                let updated = sqlx::query(
                    "UPDATE accounts SET balance = balance - 1 WHERE id = ?1 AND balance >= 1",
                )
                .bind(id)
                .execute(&mut *tx)
                .await?;
                if updated.rows_affected() != 1 {
                    return Err(analysis.payer.exhausted());
                }
                sqlx::query_scalar::<_, i64>("SELECT balance FROM accounts WHERE id = ?1")
                    .bind(id)
                    .fetch_one(&mut *tx)
                    .await?
            }
            Payer::Guest(id) => {
                let updated = sqlx::query(
                    "UPDATE guest_quotas SET used = used + 1 WHERE guest_id = ?1 AND used < ?2",
                )
                .bind(id)
                .bind(self.guest_quota)
                .execute(&mut *tx)
                .await?;
                if updated.rows_affected() != 1 {
                    return Err(analysis.payer.exhausted());
                }
                let used: i64 = sqlx::query_scalar("SELECT used FROM guest_quotas WHERE guest_id = ?1")
                    .bind(id)
                    .fetch_one(&mut *tx)
                    .await?;
                self.guest_quota - used
            }
        };

        tx.commit().await?;
        info!(analysis_id = %analysis.id, payer = %analysis.payer, remaining, "analysis persisted and debited");
        Ok(remaining)
    }

    async fn load_analysis(&self, id: &str) -> Result<Option<StoredAnalysis>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, payer_kind, payer_id, contract_type, filename, payload_json, created_at
            FROM analyses WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(map_analysis).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::tests::sample_payload;
    use crate::config::IdempotencyConfig;

    fn analysis(id: &str, payer: Payer) -> NewAnalysis {
        NewAnalysis {
            id: id.into(),
            payer,
            contract_type: ContractType::Freelance,
            filename: "mission.pdf".into(),
            payload: sample_payload(),
        }
    }

    #[tokio::test]
    async fn account_debit_is_transactional() {
        let store = SqliteStore::in_memory(1).await.unwrap();
        store.set_balance("acc", 1).await.unwrap();
        let payer = Payer::Account("acc".into());

        assert_eq!(store.persist_and_debit(&analysis("a1", payer.clone())).await.unwrap(), 0);
        let err = store.persist_and_debit(&analysis("a2", payer.clone())).await.unwrap_err();
        assert!(matches!(err, StoreError::InsufficientBalance(_)));
        assert_eq!(store.analysis_count().await.unwrap(), 1);
        assert_eq!(store.remaining(&payer).await.unwrap(), 0);

        let loaded = store.load_analysis("a1").await.unwrap().unwrap();
        assert_eq!(loaded.payer, payer);
        assert_eq!(loaded.contract_type, ContractType::Freelance);
        assert_eq!(loaded.payload, sample_payload());
    }

    #[tokio::test]
    async fn duplicate_analysis_id_rolls_back_debit() {
        let store = SqliteStore::in_memory(1).await.unwrap();
        store.set_balance("acc", 5).await.unwrap();
        let payer = Payer::Account("acc".into());
        store.persist_and_debit(&analysis("dup", payer.clone())).await.unwrap();
        assert!(store.persist_and_debit(&analysis("dup", payer.clone())).await.is_err());
        assert_eq!(store.remaining(&payer).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn guest_quota_is_enforced() {
        let store = SqliteStore::in_memory(2).await.unwrap();
        let guest = Payer::Guest("g1".into());
        assert_eq!(store.remaining(&guest).await.unwrap(), 2);
        assert_eq!(store.persist_and_debit(&analysis("a1", guest.clone())).await.unwrap(), 1);
        assert_eq!(store.persist_and_debit(&analysis("a2", guest.clone())).await.unwrap(), 0);
        let err = store.persist_and_debit(&analysis("a3", guest)).await.unwrap_err();
        assert!(matches!(err, StoreError::QuotaExhausted(_)));
        assert_eq!(store.analysis_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn idempotency_lifecycle() {
        let store = SqliteStore::in_memory(1).await.unwrap();
        let rec = IdempotencyRecord::pending("k", "fp", Utc::now(), &IdempotencyConfig::default());
        assert!(store.insert(&rec).await.unwrap());
        assert!(!store.insert(&rec).await.unwrap());

        let loaded = store.get("k").await.unwrap().unwrap();
        assert_eq!(loaded.status, IdempotencyStatus::Pending);
        assert!(loaded.locked_until.is_some());

        store
            .mark_failed("k", rec.created_at, "TEXT_EMPTY", "too little text")
            .await
            .unwrap();
        let failed = store.get("k").await.unwrap().unwrap();
        assert_eq!(failed.status, IdempotencyStatus::Failed);
        assert_eq!(failed.error_code.as_deref(), Some("TEXT_EMPTY"));
        assert!(failed.locked_until.is_none());

        assert!(store.remove("k", failed.created_at).await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
        assert!(matches!(
            store.mark_succeeded("k", rec.created_at, "r").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn superseded_record_is_not_overwritten() {
        let store = SqliteStore::in_memory(1).await.unwrap();
        let config = IdempotencyConfig::default();
        let old = IdempotencyRecord::pending("k", "fp", Utc::now() - chrono::Duration::minutes(5), &config);
        store.insert(&old).await.unwrap();
        assert!(store.remove("k", old.created_at).await.unwrap());
        let new = IdempotencyRecord::pending("k", "fp", Utc::now(), &config);
        store.insert(&new).await.unwrap();

        assert!(matches!(
            store.mark_succeeded("k", old.created_at, "stale").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.mark_failed("k", old.created_at, "X", "late").await.is_err());

        let current = store.get("k").await.unwrap().unwrap();
        assert_eq!(current.status, IdempotencyStatus::Pending);
        assert!(current.result_id.is_none());
        assert!(current.error_code.is_none());

        store.mark_succeeded("k", new.created_at, "r").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap().result_id.as_deref(), Some("r"));
    }
}
