//! # contract-intake
//!
//! Turn an uploaded PDF contract into LLM-ready text and a contract-type
//! label, then run a paid analysis exactly once per logical request.
//!
//! ## Why this crate?
//!
//! Contract uploads are hostile input: 400-page annexes, image-only scans,
//! encrypted files, pages that hang the parser. Users also double-click and
//! retry on flaky networks, and every analysis costs a credit. This crate
//! bounds the document work (size, pages, per-page deadlines) and makes the
//! billing step idempotent, so a retried request replays the stored result
//! instead of charging twice.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF bytes
//!  │
//!  ├─ 1. Extract    page text in waves, per-page timeout (spawn_blocking)
//!  ├─ 2. Layout     fragment positions → form likelihood   (concurrent with 1)
//!  ├─ 3. Normalize  12 deterministic cleanup rules, headings, token estimate
//!  ├─ 4. Classify   heuristic, then rate-limited LLM fallback
//!  └─ 5. Analyze    idempotent: LLM + schema repair, persist + debit in one tx
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use contract_intake::{
//!     AnalysisOrchestrator, Analyzer, DocumentIntake, EdgequakeLlm, IdempotencyCoordinator,
//!     Payer, PdfiumEngine, PipelineConfig, TypeClassifier,
//! };
//! use contract_intake::store::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::from_env()?;
//!     let llm = Arc::new(EdgequakeLlm::from_settings(&config.llm)?);
//!
//!     let classifier = Arc::new(
//!         TypeClassifier::from_config(config.classifier.clone()).with_llm(llm.clone()),
//!     );
//!     let intake = DocumentIntake::new(Arc::new(PdfiumEngine::new()), &config, classifier);
//!
//!     let store = Arc::new(MemoryStore::new());
//!     store.set_balance("acct-42", 3);
//!     let orchestrator = AnalysisOrchestrator::new(
//!         Analyzer::new(llm, config.analysis.clone()),
//!         IdempotencyCoordinator::new(store.clone(), config.idempotency.clone()),
//!         store,
//!         config.analysis.clone(),
//!     );
//!
//!     let prepared = intake.prepare(std::fs::read("contract.pdf")?).await?;
//!     let request = prepared.analysis_request(
//!         Payer::Account("acct-42".into()),
//!         "contract.pdf",
//!         "3f1c-upload-17",
//!     );
//!     let outcome = orchestrator.run(&request).await?;
//!     println!("risk {} (replay: {})", outcome.payload.risk_score, outcome.is_replay);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature   | Default | Description |
//! |-----------|---------|-------------|
//! | `sqlite`  | on      | [`store::SqliteStore`]: SQLite ledger + idempotency store via sqlx |
//! | `bundled` | off     | Embed the pdfium library in the binary (`pdfium-auto/bundled`) |
//!
//! ## PDF engine
//!
//! [`PdfiumEngine`] binds pdfium through `pdfium-auto`, which downloads and
//! caches the library on first use. [`pipeline::engine::MemoryEngine`]
//! serves pre-extracted pages and needs no native library.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod analysis;
pub mod classify;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod intake;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use analysis::{AnalysisPayload, Analyzer, Clause, RiskLevel};
pub use classify::{ContractType, DetectionResult, DetectionSource, TokenBucket, TypeClassifier};
pub use config::{
    AnalysisConfig, ClassifierConfig, ExtractionOptions, ExtractionOptionsBuilder, IdempotencyConfig,
    IntakeOptions, LayoutOptions, LlmSettings, NormalizationOptions, PipelineConfig,
};
pub use error::{EngineError, LlmError, PageError, PipelineError, StoreError};
pub use idempotency::{Execution, IdempotencyCoordinator, IdempotencyRecord, IdempotencyStatus, KeyLocks};
pub use intake::{DocumentIntake, PreparedDocument};
pub use orchestrator::{fingerprint, AnalysisOrchestrator, AnalysisOutcome, AnalysisRequest};
pub use output::{DocumentMetadata, ExtractionResult, NormalizationResult};
pub use pipeline::engine::{MemoryEngine, PdfEngine, PdfiumEngine};
pub use pipeline::extract::Extractor;
pub use pipeline::layout::{compute_form_likelihood, LayoutInfo, LayoutScorer};
pub use pipeline::llm::{EdgequakeLlm, LlmClient};
pub use pipeline::normalize::Normalizer;
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use store::{AnalysisLedger, IdempotencyStore, ObjectStore, Payer};
