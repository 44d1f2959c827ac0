//! Exactly-once analysis: idempotent replays, conflicts and billing.

use async_trait::async_trait;
use contract_intake::pipeline::llm::CompletionRequest;
use contract_intake::store::MemoryStore;
use contract_intake::{
    AnalysisLedger, AnalysisOrchestrator, AnalysisRequest, Analyzer, ContractType, IdempotencyCoordinator,
    IdempotencyStatus, IdempotencyStore, LlmClient, LlmError, Payer, PipelineConfig, PipelineError,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const VALID_REPLY: &str = r#"{
    "summary": "Mutual NDA between Acme SAS and Globex Ltd.",
    "contract_type": "nda",
    "parties": ["Acme SAS", "Globex Ltd"],
    "risk_score": 35,
    "clauses": [{"title": "Duration", "risk_level": "medium",
                 "explanation": "Obligations last ten years."}],
    "red_flags": [],
    "missing_clauses": ["Return of materials"]
}"#;

const CONTRACT: &str = "NON-DISCLOSURE AGREEMENT between Acme SAS and Globex Ltd. The Receiving \
    Party shall keep all Confidential Information secret for ten years.";

/// Answers from a script, then repeats the last entry. Counts calls.
struct ScriptedLlm {
    replies: Mutex<Vec<Result<String, LlmError>>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    fn new(replies: Vec<Result<String, LlmError>>) -> Arc<Self> {
        Self::with_delay(replies, Duration::ZERO)
    }

    fn valid() -> Arc<Self> {
        Self::new(vec![Ok(VALID_REPLY.to_string())])
    }

    fn with_delay(replies: Vec<Result<String, LlmError>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _request: &CompletionRequest) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut replies = self.replies.lock().unwrap();
        if replies.len() > 1 {
            replies.remove(0)
        } else {
            replies[0].clone()
        }
    }
}

fn orchestrator<S>(store: Arc<S>, llm: Arc<ScriptedLlm>) -> AnalysisOrchestrator
where
    S: IdempotencyStore + AnalysisLedger + 'static,
{
    let config = PipelineConfig::default();
    let mut analysis = config.analysis.clone();
    analysis.retry_backoff_ms = 1;
    AnalysisOrchestrator::new(
        Analyzer::new(llm, analysis.clone()),
        IdempotencyCoordinator::new(store.clone(), config.idempotency.clone()),
        store,
        analysis,
    )
}

fn request(payer: Payer, key: &str) -> AnalysisRequest {
    AnalysisRequest {
        payer,
        clean_text: CONTRACT.to_string(),
        contract_type: ContractType::Nda,
        filename: "nda.pdf".to_string(),
        idempotency_key: key.to_string(),
    }
}

fn account() -> Payer {
    Payer::Account("acct-1".into())
}

async fn balance(store: &MemoryStore, payer: &Payer) -> i64 {
    store.remaining(payer).await.unwrap()
}

// ── Fresh and replayed runs ──────────────────────────────────────────────

#[tokio::test]
async fn success_debits_exactly_one_credit() {
    let store = Arc::new(MemoryStore::new());
    store.set_balance("acct-1", 3);
    let llm = ScriptedLlm::valid();
    let orch = orchestrator(store.clone(), llm.clone());

    let outcome = orch.run(&request(account(), "k1")).await.unwrap();

    assert!(!outcome.is_replay);
    assert_eq!(outcome.remaining_balance, Some(2));
    assert_eq!(outcome.payload.risk_score, 35);
    assert_eq!(balance(&store, &account()).await, 2);
    assert_eq!(store.analysis_count(), 1);
    assert_eq!(llm.calls(), 1);

    let record = store.get("k1").await.unwrap().unwrap();
    assert_eq!(record.status, IdempotencyStatus::Succeeded);
    assert_eq!(record.result_id.as_deref(), Some(outcome.analysis_id.as_str()));
}

#[tokio::test]
async fn replay_returns_the_stored_analysis_without_charging() {
    let store = Arc::new(MemoryStore::new());
    store.set_balance("acct-1", 1);
    let llm = ScriptedLlm::valid();
    let orch = orchestrator(store.clone(), llm.clone());

    let first = orch.run(&request(account(), "k1")).await.unwrap();
    // Balance is now 0: a replay must still succeed.
    let second = orch.run(&request(account(), "k1")).await.unwrap();

    assert!(second.is_replay);
    assert_eq!(second.analysis_id, first.analysis_id);
    assert_eq!(second.payload, first.payload);
    assert_eq!(second.remaining_balance, Some(0));
    assert_eq!(llm.calls(), 1);
    assert_eq!(store.analysis_count(), 1);
}

#[tokio::test]
async fn same_key_different_request_is_a_conflict() {
    let store = Arc::new(MemoryStore::new());
    store.set_balance("acct-1", 5);
    let llm = ScriptedLlm::valid();
    let orch = orchestrator(store.clone(), llm.clone());

    orch.run(&request(account(), "k1")).await.unwrap();
    let mut other = request(account(), "k1");
    other.filename = "other.pdf".into();
    let err = orch.run(&other).await.unwrap_err();

    assert!(matches!(err, PipelineError::IdempotencyKeyConflict { ref key } if key == "k1"));
    assert_eq!(llm.calls(), 1);
    assert_eq!(balance(&store, &account()).await, 4);
}

#[tokio::test]
async fn distinct_keys_run_separately() {
    let store = Arc::new(MemoryStore::new());
    store.set_balance("acct-1", 5);
    let llm = ScriptedLlm::valid();
    let orch = orchestrator(store.clone(), llm.clone());

    let a = orch.run(&request(account(), "k1")).await.unwrap();
    let b = orch.run(&request(account(), "k2")).await.unwrap();

    assert_ne!(a.analysis_id, b.analysis_id);
    assert_eq!(balance(&store, &account()).await, 3);
    assert_eq!(llm.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_are_charged_once() {
    let store = Arc::new(MemoryStore::new());
    store.set_balance("acct-1", 10);
    let llm = ScriptedLlm::with_delay(vec![Ok(VALID_REPLY.to_string())], Duration::from_millis(50));
    let orch = Arc::new(orchestrator(store.clone(), llm.clone()));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.run(&request(account(), "double-click")).await })
        })
        .collect();

    let mut ids = HashSet::new();
    let mut fresh = 0;
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        if !outcome.is_replay {
            fresh += 1;
        }
        ids.insert(outcome.analysis_id);
    }

    assert_eq!(fresh, 1);
    assert_eq!(ids.len(), 1);
    assert_eq!(llm.calls(), 1);
    assert_eq!(balance(&store, &account()).await, 9);
    assert_eq!(store.analysis_count(), 1);
}

// ── Failures ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn invalid_analysis_is_not_charged_and_can_be_retried() {
    let store = Arc::new(MemoryStore::new());
    store.set_balance("acct-1", 2);
    let garbage = Ok("I cannot produce JSON today.".to_string());
    let llm = ScriptedLlm::new(vec![
        garbage.clone(),
        garbage.clone(),
        garbage,
        Ok(VALID_REPLY.to_string()),
    ]);
    let orch = orchestrator(store.clone(), llm.clone());

    let err = orch.run(&request(account(), "k1")).await.unwrap_err();
    let errors = match err {
        PipelineError::AnalysisInvalid { errors } => errors,
        other => panic!("expected AnalysisInvalid, got {other:?}"),
    };
    assert_eq!(errors.len(), 3);
    assert_eq!(llm.calls(), 3);
    assert_eq!(balance(&store, &account()).await, 2);
    let record = store.get("k1").await.unwrap().unwrap();
    assert_eq!(record.status, IdempotencyStatus::Failed);
    assert_eq!(record.error_code.as_deref(), Some("ANALYSIS_INVALID"));

    let retry = orch.run(&request(account(), "k1")).await.unwrap();
    assert!(!retry.is_replay);
    assert_eq!(balance(&store, &account()).await, 1);
}

#[tokio::test]
async fn provider_failure_is_not_charged() {
    let store = Arc::new(MemoryStore::new());
    store.set_balance("acct-1", 2);
    let llm = ScriptedLlm::new(vec![Err(LlmError::Unavailable("no API key".into()))]);
    let orch = orchestrator(store.clone(), llm.clone());

    let err = orch.run(&request(account(), "k1")).await.unwrap_err();

    assert!(matches!(err, PipelineError::Llm(LlmError::Unavailable(_))));
    assert_eq!(balance(&store, &account()).await, 2);
    assert_eq!(store.analysis_count(), 0);
}

#[tokio::test]
async fn empty_balance_fails_before_the_llm() {
    let store = Arc::new(MemoryStore::new());
    let llm = ScriptedLlm::valid();
    let orch = orchestrator(store.clone(), llm.clone());

    let err = orch.run(&request(account(), "k1")).await.unwrap_err();

    assert!(matches!(err, PipelineError::InsufficientBalance { ref account } if account == "acct-1"));
    assert_eq!(err.code(), "INSUFFICIENT_BALANCE");
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn guest_gets_one_free_analysis() {
    let store = Arc::new(MemoryStore::new());
    let llm = ScriptedLlm::valid();
    let orch = orchestrator(store.clone(), llm.clone());
    let guest = Payer::Guest("session-9".into());

    let first = orch.run(&request(guest.clone(), "g1")).await.unwrap();
    assert_eq!(first.remaining_balance, Some(0));

    let err = orch.run(&request(guest, "g2")).await.unwrap_err();
    assert!(matches!(err, PipelineError::GuestQuotaExhausted { .. }));
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn guest_quota_comes_from_the_environment() {
    let config = PipelineConfig::from_lookup(|key| {
        (key == "CONTRACT_INTAKE_GUEST_QUOTA").then(|| "3".to_string())
    })
    .unwrap();
    assert_eq!(config.intake.guest_quota, 3);

    let store = Arc::new(MemoryStore::from_config(&config.intake));
    let llm = ScriptedLlm::valid();
    let orch = orchestrator(store.clone(), llm.clone());
    let guest = Payer::Guest("session-3".into());

    for (key, left) in [("q1", 2), ("q2", 1), ("q3", 0)] {
        let outcome = orch.run(&request(guest.clone(), key)).await.unwrap();
        assert_eq!(outcome.remaining_balance, Some(left));
    }
    let err = orch.run(&request(guest, "q4")).await.unwrap_err();
    assert!(matches!(err, PipelineError::GuestQuotaExhausted { .. }));
    assert_eq!(llm.calls(), 3);
}

// ── SQLite ledger ────────────────────────────────────────────────────────

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use contract_intake::store::SqliteStore;

    #[tokio::test]
    async fn replay_and_billing_over_sqlite() {
        let store = Arc::new(SqliteStore::in_memory(1).await.unwrap());
        store.set_balance("acct-1", 2).await.unwrap();
        let llm = ScriptedLlm::valid();
        let orch = orchestrator(store.clone(), llm.clone());

        let first = orch.run(&request(account(), "k1")).await.unwrap();
        let second = orch.run(&request(account(), "k1")).await.unwrap();

        assert!(!first.is_replay);
        assert!(second.is_replay);
        assert_eq!(second.payload, first.payload);
        assert_eq!(store.remaining(&account()).await.unwrap(), 1);
        assert_eq!(store.analysis_count().await.unwrap(), 1);
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn failed_run_leaves_sqlite_balance_alone() {
        let store = Arc::new(SqliteStore::in_memory(1).await.unwrap());
        store.set_balance("acct-1", 1).await.unwrap();
        let llm = ScriptedLlm::new(vec![Err(LlmError::Unavailable("down".into()))]);
        let orch = orchestrator(store.clone(), llm);

        orch.run(&request(account(), "k1")).await.unwrap_err();

        assert_eq!(store.remaining(&account()).await.unwrap(), 1);
        assert_eq!(store.analysis_count().await.unwrap(), 0);
        let record = store.get("k1").await.unwrap().unwrap();
        assert_eq!(record.status, IdempotencyStatus::Failed);
    }

    #[tokio::test]
    async fn configured_guest_quota_applies_to_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("intake.db").display());
        let config = PipelineConfig::from_lookup(|key| {
            (key == "CONTRACT_INTAKE_GUEST_QUOTA").then(|| "3".to_string())
        })
        .unwrap();
        let store = Arc::new(SqliteStore::from_config(&url, &config.intake).await.unwrap());
        let orch = orchestrator(store.clone(), ScriptedLlm::valid());
        let guest = Payer::Guest("session-3".into());

        assert_eq!(store.remaining(&guest).await.unwrap(), 3);
        for key in ["q1", "q2", "q3"] {
            orch.run(&request(guest.clone(), key)).await.unwrap();
        }
        let err = orch.run(&request(guest, "q4")).await.unwrap_err();
        assert!(matches!(err, PipelineError::GuestQuotaExhausted { .. }));
        assert_eq!(store.analysis_count().await.unwrap(), 3);
    }
}
