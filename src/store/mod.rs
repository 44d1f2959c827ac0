//! Persistence collaborators.
//!
//! The pipeline talks to storage only through the traits in this module:
//!
//! * [`IdempotencyStore`]: idempotency records (one row per key, unique).
//! * [`AnalysisLedger`]: analysis rows plus the credit / guest-quota
//!   counters, mutated together in [`AnalysisLedger::persist_and_debit`].
//! * [`ObjectStore`]: uploaded documents as opaque byte buffers.
//!
//! [`memory`] and [`fs`] implementations are always available; the SQLite
//! implementation in [`sqlite`] sits behind the default `sqlite` feature.

pub mod fs;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use fs::FsObjectStore;
pub use memory::{MemoryObjectStore, MemoryStore};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use crate::analysis::AnalysisPayload;
use crate::classify::ContractType;
use crate::error::StoreError;
use crate::idempotency::IdempotencyRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who pays for an analysis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Payer {
    /// Registered account with a credit balance.
    Account(String),
    /// Anonymous session with a small free quota.
    Guest(String),
}

impl Payer {
    pub fn id(&self) -> &str {
        match self {
            Payer::Account(id) | Payer::Guest(id) => id,
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Payer::Guest(_))
    }

    /// Error reported when this payer has nothing left to spend.
    pub fn exhausted(&self) -> StoreError {
        match self {
            Payer::Account(id) => StoreError::InsufficientBalance(id.clone()),
            Payer::Guest(id) => StoreError::QuotaExhausted(id.clone()),
        }
    }
}

impl fmt::Display for Payer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payer::Account(id) => write!(f, "account:{id}"),
            Payer::Guest(id) => write!(f, "guest:{id}"),
        }
    }
}

/// An analysis about to be persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAnalysis {
    pub id: String,
    pub payer: Payer,
    pub contract_type: ContractType,
    pub filename: String,
    pub payload: AnalysisPayload,
}

/// A persisted analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAnalysis {
    pub id: String,
    pub payer: Payer,
    pub contract_type: ContractType,
    pub filename: String,
    pub payload: AnalysisPayload,
    pub created_at: DateTime<Utc>,
}

/// Persisted idempotency records.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Insert a new record. `Ok(false)` when the key already exists.
    async fn insert(&self, record: &IdempotencyRecord) -> Result<bool, StoreError>;

    /// PENDING → SUCCEEDED, releasing the lock.
    ///
    /// Only the record created at `created_at` is updated; a record that
    /// replaced it after our lock expired yields [`StoreError::NotFound`].
    async fn mark_succeeded(
        &self,
        key: &str,
        created_at: DateTime<Utc>,
        result_id: &str,
    ) -> Result<(), StoreError>;

    /// PENDING → FAILED, releasing the lock. Same ownership rule as
    /// [`IdempotencyStore::mark_succeeded`].
    async fn mark_failed(
        &self,
        key: &str,
        created_at: DateTime<Utc>,
        code: &str,
        message: &str,
    ) -> Result<(), StoreError>;

    /// Delete the record for `key` only if it is still the one created at
    /// `created_at`. `Ok(false)` when it was replaced or removed meanwhile.
    async fn remove(&self, key: &str, created_at: DateTime<Utc>) -> Result<bool, StoreError>;
}

/// Analyses and the balances that pay for them.
#[async_trait]
pub trait AnalysisLedger: Send + Sync {
    /// Credits (accounts) or free analyses (guests) left.
    async fn remaining(&self, payer: &Payer) -> Result<i64, StoreError>;

    /// Re-check the balance, store the analysis and debit one unit, all or
    /// nothing. Returns the remaining balance.
    async fn persist_and_debit(&self, analysis: &NewAnalysis) -> Result<i64, StoreError>;

    async fn load_analysis(&self, id: &str) -> Result<Option<StoredAnalysis>, StoreError>;
}

/// Uploaded documents.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object. [`StoreError::NotFound`] when absent.
    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, path: &str) -> Result<(), StoreError>;
}

/// Reject empty, absolute and parent-relative object paths.
pub(crate) fn validate_object_path(path: &str) -> Result<(), StoreError> {
    let invalid = path.is_empty()
        || path.starts_with('/')
        || path.starts_with('\\')
        || path.contains(':')
        || path.split(['/', '\\']).any(|seg| seg == ".." || seg.is_empty());
    if invalid {
        Err(StoreError::InvalidPath(path.to_string()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_paths() {
        assert!(validate_object_path("uploads/2024/contract.pdf").is_ok());
        for bad in ["", "/etc/passwd", "../x", "a/../b", "a//b", "C:\\x", "a\\..\\b"] {
            assert!(
                matches!(validate_object_path(bad), Err(StoreError::InvalidPath(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn payer_serde_and_display() {
        let p = Payer::Guest("sess-1".into());
        assert_eq!(serde_json::to_string(&p).unwrap(), r#"{"kind":"guest","id":"sess-1"}"#);
        assert_eq!(p.to_string(), "guest:sess-1");
        assert!(matches!(
            Payer::Account("a".into()).exhausted(),
            StoreError::InsufficientBalance(ref a) if a == "a"
        ));
    }
}
