//! Exactly-once execution keyed by a client-supplied idempotency key.
//!
//! ## Protocol
//!
//! ```text
//! absent ──insert──▶ PENDING ──ok──▶ SUCCEEDED   (replayed until expiry)
//!                       │
//!                       └──err──▶ FAILED         (same fingerprint may retry)
//! ```
//!
//! Two layers of protection:
//!
//! * **In-process**: an async mutex per key ([`KeyLocks`]). A duplicate
//!   request in the same process waits for the first one, then re-reads the
//!   record and replays it.
//! * **Cross-process**: the persisted PENDING record, the store's unique key
//!   and the lock timeout. A live PENDING owned by another worker yields
//!   [`PipelineError::IdempotencyInProgress`]; a PENDING whose lock expired
//!   is treated as abandoned and superseded.

use crate::config::IdempotencyConfig;
use crate::error::PipelineError;
use crate::store::IdempotencyStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Insert attempts before a contended key is reported as in progress.
const MAX_INSERT_ATTEMPTS: usize = 3;

/// Lifecycle state of an [`IdempotencyRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    Pending,
    Succeeded,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub fingerprint: String,
    pub status: IdempotencyStatus,
    pub result_id: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Fresh PENDING record locked from `now`.
    pub fn pending(key: &str, fingerprint: &str, now: DateTime<Utc>, config: &IdempotencyConfig) -> Self {
        Self {
            key: key.to_string(),
            fingerprint: fingerprint.to_string(),
            status: IdempotencyStatus::Pending,
            result_id: None,
            locked_until: Some(now + config.lock_timeout()),
            expires_at: now + config.record_ttl(),
            error_code: None,
            error_message: None,
            created_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// PENDING and still inside its lock window.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.status == IdempotencyStatus::Pending
            && self.locked_until.is_some_and(|until| now < until)
    }
}

/// Result of [`IdempotencyCoordinator::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum Execution<T> {
    /// The operation ran in this call.
    Fresh { result_id: String, value: T },
    /// A previous call already succeeded; the operation was not invoked.
    Replayed { result_id: String },
}

impl<T> Execution<T> {
    pub fn result_id(&self) -> &str {
        match self {
            Execution::Fresh { result_id, .. } | Execution::Replayed { result_id } => result_id,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, Execution::Replayed { .. })
    }
}

// ── In-process key locks ─────────────────────────────────────────────────

/// Per-key async mutexes. Share one instance between coordinators that use
/// the same store.
#[derive(Debug, Default)]
pub struct KeyLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        lock_map(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn acquire(&self, key: &str) -> KeyLease {
        let mutex = {
            let mut map = lock_map(&self.inner);
            Arc::clone(map.entry(key.to_string()).or_default())
        };
        let guard = mutex.lock_owned().await;
        KeyLease {
            map: Arc::clone(&self.inner),
            key: key.to_string(),
            guard: Some(guard),
        }
    }
}

fn lock_map<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Held key lock. Dropping it releases the key and forgets the map entry
/// when nobody else holds or awaits it.
struct KeyLease {
    map: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = lock_map(&self.map);
        if map.get(&self.key).is_some_and(|m| Arc::strong_count(m) == 1) {
            map.remove(&self.key);
        }
    }
}

// ── Coordinator ──────────────────────────────────────────────────────────

enum Decision {
    Replay(String),
    Supersede,
    Locked,
}

enum Claim {
    /// Someone else finished the key while we waited.
    Done(String),
    /// Our PENDING record, identified by its creation time.
    Owned(DateTime<Utc>),
}

/// Runs an operation at most once per idempotency key.
pub struct IdempotencyCoordinator {
    store: Arc<dyn IdempotencyStore>,
    config: IdempotencyConfig,
    locks: Arc<KeyLocks>,
}

impl IdempotencyCoordinator {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        Self {
            store,
            config,
            locks: Arc::new(KeyLocks::new()),
        }
    }

    /// Use a shared lock map.
    pub fn with_locks(mut self, locks: Arc<KeyLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn locks(&self) -> &Arc<KeyLocks> {
        &self.locks
    }

    /// Run `op` unless `key` already succeeded.
    ///
    /// `op` returns the id of the durable result together with its value;
    /// the id is what later calls replay.
    ///
    /// # Errors
    /// - [`PipelineError::IdempotencyKeyConflict`] when `key` was used with
    ///   another fingerprint. `op` is not invoked.
    /// - [`PipelineError::IdempotencyInProgress`] when another worker holds
    ///   a live lock on `key`.
    /// - Whatever `op` returns; the record is then marked FAILED.
    pub async fn execute<T, F, Fut>(
        &self,
        key: &str,
        fingerprint: &str,
        op: F,
    ) -> Result<Execution<T>, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(String, T), PipelineError>>,
    {
        // Cheap path: conflicts and replays need no lock.
        if let Some(record) = self.store.get(key).await? {
            if let Decision::Replay(result_id) = self.decide(&record, fingerprint, Utc::now())? {
                debug!(key, "idempotent replay");
                return Ok(Execution::Replayed { result_id });
            }
        }

        let _lease = self.locks.acquire(key).await;
        let created_at = match self.claim(key, fingerprint).await? {
            Claim::Done(result_id) => {
                debug!(key, "idempotent replay after wait");
                return Ok(Execution::Replayed { result_id });
            }
            Claim::Owned(created_at) => created_at,
        };
        info!(key, "idempotency key claimed");

        match op().await {
            Ok((result_id, value)) => {
                if let Err(e) = self.store.mark_succeeded(key, created_at, &result_id).await {
                    // The result is durable; a stuck PENDING only delays replays
                    // until the lock times out.
                    warn!(key, error = %e, "could not mark idempotency key succeeded");
                } else {
                    info!(key, result_id = %result_id, "idempotency key succeeded");
                }
                Ok(Execution::Fresh { result_id, value })
            }
            Err(err) => {
                if let Err(e) = self
                    .store
                    .mark_failed(key, created_at, err.code(), &err.to_string())
                    .await
                {
                    warn!(key, error = %e, "could not mark idempotency key failed");
                } else {
                    info!(key, code = err.code(), "idempotency key failed");
                }
                Err(err)
            }
        }
    }

    /// Insert our PENDING record, superseding expired, failed or abandoned
    /// ones.
    async fn claim(&self, key: &str, fingerprint: &str) -> Result<Claim, PipelineError> {
        for _ in 0..MAX_INSERT_ATTEMPTS {
            let now = Utc::now();
            if let Some(record) = self.store.get(key).await? {
                match self.decide(&record, fingerprint, now)? {
                    Decision::Replay(result_id) => return Ok(Claim::Done(result_id)),
                    Decision::Locked => {
                        return Err(PipelineError::IdempotencyInProgress {
                            key: key.to_string(),
                        })
                    }
                    Decision::Supersede => {
                        info!(key, status = %record.status, "superseding idempotency record");
                        if !self.store.remove(key, record.created_at).await? {
                            continue;
                        }
                    }
                }
            }
            let record = IdempotencyRecord::pending(key, fingerprint, now, &self.config);
            if self.store.insert(&record).await? {
                return Ok(Claim::Owned(record.created_at));
            }
            debug!(key, "lost idempotency insert race, re-reading");
        }
        Err(PipelineError::IdempotencyInProgress {
            key: key.to_string(),
        })
    }

    fn decide(
        &self,
        record: &IdempotencyRecord,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<Decision, PipelineError> {
        if record.is_expired(now) {
            return Ok(Decision::Supersede);
        }
        if record.fingerprint != fingerprint {
            warn!(key = %record.key, "idempotency key reused with a different fingerprint");
            return Err(PipelineError::IdempotencyKeyConflict {
                key: record.key.clone(),
            });
        }
        match record.status {
            IdempotencyStatus::Succeeded => match &record.result_id {
                Some(id) => Ok(Decision::Replay(id.clone())),
                None => Err(PipelineError::Internal(format!(
                    "idempotency record '{}' succeeded without a result id",
                    record.key
                ))),
            },
            IdempotencyStatus::Failed => Ok(Decision::Supersede),
            IdempotencyStatus::Pending if record.is_locked(now) => Ok(Decision::Locked),
            IdempotencyStatus::Pending => Ok(Decision::Supersede),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator() -> (IdempotencyCoordinator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let c = IdempotencyCoordinator::new(store.clone(), IdempotencyConfig::default());
        (c, store)
    }

    #[tokio::test]
    async fn first_call_runs_and_succeeds() {
        let (c, store) = coordinator();
        let out = c
            .execute("k1", "fp", || async { Ok(("r1".to_string(), 42)) })
            .await
            .unwrap();
        assert_eq!(
            out,
            Execution::Fresh {
                result_id: "r1".into(),
                value: 42
            }
        );
        let rec = store.get("k1").await.unwrap().unwrap();
        assert_eq!(rec.status, IdempotencyStatus::Succeeded);
        assert_eq!(rec.result_id.as_deref(), Some("r1"));
        assert!(rec.locked_until.is_none());
        assert!(c.locks().is_empty());
    }

    #[tokio::test]
    async fn second_call_replays_without_running() {
        let (c, _) = coordinator();
        c.execute("k", "fp", || async { Ok(("r".to_string(), ())) })
            .await
            .unwrap();
        let runs = AtomicUsize::new(0);
        let out = c
            .execute("k", "fp", || async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(("other".to_string(), ()))
            })
            .await
            .unwrap();
        assert_eq!(out, Execution::Replayed { result_id: "r".into() });
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fingerprint_mismatch_is_a_conflict() {
        let (c, _) = coordinator();
        c.execute("k", "fp-a", || async { Ok(("r".to_string(), ())) })
            .await
            .unwrap();
        let runs = AtomicUsize::new(0);
        let err = c
            .execute("k", "fp-b", || async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(("x".to_string(), ()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::IdempotencyKeyConflict { ref key } if key == "k"));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_is_recorded_and_retry_allowed() {
        let (c, store) = coordinator();
        let err = c
            .execute::<(), _, _>("k", "fp", || async {
                Err(PipelineError::TextTooShort { length: 12 })
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TEXT_TOO_SHORT");
        let rec = store.get("k").await.unwrap().unwrap();
        assert_eq!(rec.status, IdempotencyStatus::Failed);
        assert_eq!(rec.error_code.as_deref(), Some("TEXT_TOO_SHORT"));

        let out = c
            .execute("k", "fp", || async { Ok(("r2".to_string(), 1)) })
            .await
            .unwrap();
        assert!(!out.is_replay());
        assert_eq!(out.result_id(), "r2");
    }

    #[tokio::test]
    async fn failed_key_with_new_fingerprint_still_conflicts() {
        let (c, _) = coordinator();
        let _ = c
            .execute::<(), _, _>("k", "fp", || async { Err(PipelineError::PasswordRequired) })
            .await;
        let err = c
            .execute("k", "other", || async { Ok(("r".to_string(), ())) })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::IdempotencyKeyConflict { .. }));
    }

    #[tokio::test]
    async fn live_foreign_lock_is_in_progress() {
        let (c, store) = coordinator();
        let rec = IdempotencyRecord::pending("k", "fp", Utc::now(), &IdempotencyConfig::default());
        assert!(store.insert(&rec).await.unwrap());
        let err = c
            .execute("k", "fp", || async { Ok(("r".to_string(), ())) })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::IdempotencyInProgress { .. }));
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn expired_lock_is_superseded() {
        let (c, store) = coordinator();
        let mut rec = IdempotencyRecord::pending(
            "k",
            "fp",
            Utc::now() - Duration::minutes(5),
            &IdempotencyConfig::default(),
        );
        rec.locked_until = Some(Utc::now() - Duration::minutes(3));
        store.insert(&rec).await.unwrap();

        let out = c
            .execute("k", "fp", || async { Ok(("fresh".to_string(), ())) })
            .await
            .unwrap();
        assert_eq!(out.result_id(), "fresh");
        assert!(!out.is_replay());
    }

    #[tokio::test]
    async fn expired_record_frees_the_key() {
        let (c, store) = coordinator();
        let mut rec = IdempotencyRecord::pending("k", "old-fp", Utc::now(), &IdempotencyConfig::default());
        rec.status = IdempotencyStatus::Succeeded;
        rec.result_id = Some("old".into());
        rec.locked_until = None;
        rec.expires_at = Utc::now() - Duration::seconds(1);
        store.insert(&rec).await.unwrap();

        let out = c
            .execute("k", "new-fp", || async { Ok(("new".to_string(), ())) })
            .await
            .unwrap();
        assert_eq!(out.result_id(), "new");
        assert_eq!(store.get("k").await.unwrap().unwrap().fingerprint, "new-fp");
    }

    #[tokio::test]
    async fn late_finish_leaves_the_new_owner_alone() {
        let (c, store) = coordinator();
        let taken_over = store.clone();
        let out = c
            .execute("k", "fp", || async move {
                // Our lock lapsed and another worker superseded the record.
                let ours = taken_over.get("k").await?.expect("claimed record");
                taken_over.remove("k", ours.created_at).await?;
                let theirs = IdempotencyRecord::pending(
                    "k",
                    "fp",
                    ours.created_at + Duration::seconds(1),
                    &IdempotencyConfig::default(),
                );
                taken_over.insert(&theirs).await?;
                Ok(("late".to_string(), ()))
            })
            .await
            .unwrap();
        assert_eq!(out.result_id(), "late");

        let rec = store.get("k").await.unwrap().unwrap();
        assert_eq!(rec.status, IdempotencyStatus::Pending);
        assert!(rec.result_id.is_none());
        assert!(rec.locked_until.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicates_run_once() {
        let (c, _) = coordinator();
        let c = Arc::new(c);
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = Arc::clone(&c);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                c.execute("same", "fp", || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    Ok(("only".to_string(), ()))
                })
                .await
            }));
        }

        let mut fresh = 0;
        for h in handles {
            let out = h.await.unwrap().unwrap();
            assert_eq!(out.result_id(), "only");
            if !out.is_replay() {
                fresh += 1;
            }
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(fresh, 1);
        assert!(c.locks().is_empty());
    }

    #[test]
    fn status_strings() {
        for s in [
            IdempotencyStatus::Pending,
            IdempotencyStatus::Succeeded,
            IdempotencyStatus::Failed,
        ] {
            assert_eq!(IdempotencyStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(
            serde_json::to_string(&IdempotencyStatus::Succeeded).unwrap(),
            "\"SUCCEEDED\""
        );
    }
}
