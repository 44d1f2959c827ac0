//! In-memory stores for tests and single-process deployments.
//!
//! [`MemoryStore`] keeps idempotency records, balances and analyses behind a
//! single mutex, so [`AnalysisLedger::persist_and_debit`] is all-or-nothing
//! by construction.

use super::{AnalysisLedger, IdempotencyStore, NewAnalysis, ObjectStore, Payer, StoredAnalysis};
use crate::config::IntakeOptions;
use crate::error::StoreError;
use crate::idempotency::{IdempotencyRecord, IdempotencyStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct State {
    idempotency: HashMap<String, IdempotencyRecord>,
    balances: HashMap<String, i64>,
    guest_used: HashMap<String, i64>,
    analyses: HashMap<String, StoredAnalysis>,
}

/// Idempotency records plus the analysis ledger.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    guest_quota: i64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty store granting one free analysis per guest.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            guest_quota: 1,
        }
    }

    /// Empty store using the configured guest quota.
    pub fn from_config(options: &IntakeOptions) -> Self {
        Self::new().with_guest_quota(options.guest_quota)
    }

    pub fn with_guest_quota(mut self, quota: i64) -> Self {
        self.guest_quota = quota.max(0);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Set an account's credit balance, creating the account if needed.
    pub fn set_balance(&self, account: &str, credits: i64) {
        self.state().balances.insert(account.to_string(), credits);
    }

    pub fn analysis_count(&self) -> usize {
        self.state().analyses.len()
    }
}

fn owned_record<'a>(
    state: &'a mut State,
    key: &str,
    created_at: DateTime<Utc>,
) -> Result<&'a mut IdempotencyRecord, StoreError> {
    state
        .idempotency
        .get_mut(key)
        .filter(|record| record.created_at == created_at)
        .ok_or_else(|| StoreError::NotFound(key.to_string()))
}

#[async_trait]
impl IdempotencyStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self.state().idempotency.get(key).cloned())
    }

    async fn insert(&self, record: &IdempotencyRecord) -> Result<bool, StoreError> {
        let mut state = self.state();
        if state.idempotency.contains_key(&record.key) {
            return Ok(false);
        }
        state.idempotency.insert(record.key.clone(), record.clone());
        Ok(true)
    }

    async fn mark_succeeded(
        &self,
        key: &str,
        created_at: DateTime<Utc>,
        result_id: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        let record = owned_record(&mut state, key, created_at)?;
        record.status = IdempotencyStatus::Succeeded;
        record.result_id = Some(result_id.to_string());
        record.locked_until = None;
        Ok(())
    }

    async fn mark_failed(
        &self,
        key: &str,
        created_at: DateTime<Utc>,
        code: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        let record = owned_record(&mut state, key, created_at)?;
        record.status = IdempotencyStatus::Failed;
        record.error_code = Some(code.to_string());
        record.error_message = Some(message.to_string());
        record.locked_until = None;
        Ok(())
    }

    async fn remove(&self, key: &str, created_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.state();
        match state.idempotency.get(key) {
            Some(record) if record.created_at == created_at => {
                state.idempotency.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl AnalysisLedger for MemoryStore {
    async fn remaining(&self, payer: &Payer) -> Result<i64, StoreError> {
        let state = self.state();
        Ok(match payer {
            Payer::Account(id) => state.balances.get(id).copied().unwrap_or(0),
            Payer::Guest(id) => self.guest_quota - state.guest_used.get(id).copied().unwrap_or(0),
        })
    }

    async fn persist_and_debit(&self, analysis: &NewAnalysis) -> Result<i64, StoreError> {
        let mut state = self.state();
        let remaining = match &analysis.payer {
            Payer::Account(id) => {
                let balance = state.balances.get(id).copied().unwrap_or(0);
                if balance < 1 {
                    return Err(analysis.payer.exhausted());
                }
                state.balances.insert(id.clone(), balance - 1);
                balance - 1
            }
            Payer::Guest(id) => {
                let used = state.guest_used.get(id).copied().unwrap_or(0);
                if used >= self.guest_quota {
                    return Err(analysis.payer.exhausted());
                }
                state.guest_used.insert(id.clone(), used + 1);
                self.guest_quota - used - 1
            }
        };
        state.analyses.insert(
            analysis.id.clone(),
            StoredAnalysis {
                id: analysis.id.clone(),
                payer: analysis.payer.clone(),
                contract_type: analysis.contract_type,
                filename: analysis.filename.clone(),
                payload: analysis.payload.clone(),
                created_at: Utc::now(),
            },
        );
        Ok(remaining)
    }

    async fn load_analysis(&self, id: &str) -> Result<Option<StoredAnalysis>, StoreError> {
        Ok(self.state().analyses.get(id).cloned())
    }
}

/// Object store backed by a hash map.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_deletes: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent delete fail with a backend error.
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects().contains_key(path)
    }

    fn objects(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        match self.objects.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        self.objects()
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError> {
        super::validate_object_path(path)?;
        self.objects().insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(format!("delete of '{path}' refused")));
        }
        self.objects().remove(path);
        Ok(())
    }
}
