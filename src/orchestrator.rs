//! Exactly-once paid analysis.
//!
//! [`AnalysisOrchestrator::run`] wraps the analysis call and the
//! persist-and-debit step in [`IdempotencyCoordinator::execute`]:
//!
//! ```text
//! fingerprint ─▶ execute(key, fp, ─┬─ balance pre-check
//!                                  ├─ Analyzer::analyze (LLM + repair)
//!                                  └─ persist analysis + debit 1 (one transaction))
//!             ─▶ Fresh    → payload from this call
//!             ─▶ Replayed → stored payload, no LLM call, no debit
//! ```

use crate::analysis::{AnalysisPayload, Analyzer};
use crate::classify::ContractType;
use crate::config::AnalysisConfig;
use crate::error::PipelineError;
use crate::idempotency::{Execution, IdempotencyCoordinator};
use crate::store::{AnalysisLedger, NewAnalysis, Payer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// One analysis request.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub payer: Payer,
    pub clean_text: String,
    pub contract_type: ContractType,
    pub filename: String,
    pub idempotency_key: String,
}

/// What the caller gets back, fresh or replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub analysis_id: String,
    pub payload: AnalysisPayload,
    pub is_replay: bool,
    /// Balance (or guest quota) left after this request, when known.
    pub remaining_balance: Option<i64>,
}

/// SHA-256 over the payer, a prefix of the clean text, the contract type
/// and the filename, `\0`-separated, hex-encoded.
pub fn fingerprint(
    payer: &Payer,
    clean_text: &str,
    contract_type: ContractType,
    filename: &str,
    prefix_chars: usize,
) -> String {
    let payer = payer.to_string();
    let prefix: String = clean_text.chars().take(prefix_chars).collect();
    let mut hasher = Sha256::new();
    for part in [
        payer.as_str(),
        prefix.as_str(),
        contract_type.as_str(),
        filename,
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

pub struct AnalysisOrchestrator {
    analyzer: Analyzer,
    coordinator: IdempotencyCoordinator,
    ledger: Arc<dyn AnalysisLedger>,
    config: AnalysisConfig,
}

impl AnalysisOrchestrator {
    pub fn new(
        analyzer: Analyzer,
        coordinator: IdempotencyCoordinator,
        ledger: Arc<dyn AnalysisLedger>,
        config: AnalysisConfig,
    ) -> Self {
        Self {
            analyzer,
            coordinator,
            ledger,
            config,
        }
    }

    /// Run the analysis at most once for `request.idempotency_key`.
    ///
    /// # Errors
    /// - [`PipelineError::IdempotencyKeyConflict`] when the key was used for
    ///   a different request.
    /// - [`PipelineError::InsufficientBalance`] /
    ///   [`PipelineError::GuestQuotaExhausted`] when nothing is left to spend.
    /// - Analysis and storage errors; the balance is untouched.
    pub async fn run(&self, request: &AnalysisRequest) -> Result<AnalysisOutcome, PipelineError> {
        let fp = fingerprint(
            &request.payer,
            &request.clean_text,
            request.contract_type,
            &request.filename,
            self.config.fingerprint_prefix_chars,
        );

        let execution = self
            .coordinator
            .execute(&request.idempotency_key, &fp, || self.perform(request))
            .await?;

        match execution {
            Execution::Fresh {
                result_id,
                value: (payload, remaining),
            } => Ok(AnalysisOutcome {
                analysis_id: result_id,
                payload,
                is_replay: false,
                remaining_balance: Some(remaining),
            }),
            Execution::Replayed { result_id } => {
                let stored = self.ledger.load_analysis(&result_id).await?.ok_or_else(|| {
                    PipelineError::Internal(format!(
                        "idempotency key '{}' points at missing analysis '{result_id}'",
                        request.idempotency_key
                    ))
                })?;
                let remaining_balance = match self.ledger.remaining(&request.payer).await {
                    Ok(n) => Some(n),
                    Err(e) => {
                        warn!(error = %e, "could not read balance for replay");
                        None
                    }
                };
                info!(analysis_id = %result_id, "analysis replayed");
                Ok(AnalysisOutcome {
                    analysis_id: stored.id,
                    payload: stored.payload,
                    is_replay: true,
                    remaining_balance,
                })
            }
        }
    }

    async fn perform(
        &self,
        request: &AnalysisRequest,
    ) -> Result<(String, (AnalysisPayload, i64)), PipelineError> {
        // Fail before paying for an LLM call; the transaction re-checks.
        if self.ledger.remaining(&request.payer).await? < 1 {
            return Err(request.payer.exhausted().into());
        }

        let payload = self
            .analyzer
            .analyze(request.contract_type, &request.clean_text)
            .await?;

        let analysis_id = Uuid::new_v4().to_string();
        let remaining = self
            .ledger
            .persist_and_debit(&NewAnalysis {
                id: analysis_id.clone(),
                payer: request.payer.clone(),
                contract_type: request.contract_type,
                filename: request.filename.clone(),
                payload: payload.clone(),
            })
            .await?;
        info!(
            analysis_id = %analysis_id,
            payer = %request.payer,
            remaining,
            "analysis stored"
        );
        Ok((analysis_id, (payload, remaining)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(payer: &Payer, text: &str, filename: &str) -> String {
        fingerprint(payer, text, ContractType::Nda, filename, 1000)
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let p = Payer::Account("acc".into());
        let a = fp(&p, "text", "a.pdf");
        assert_eq!(a, fp(&p, "text", "a.pdf"));
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_covers_every_input() {
        let acc = Payer::Account("acc".into());
        let base = fp(&acc, "text", "a.pdf");
        assert_ne!(base, fp(&Payer::Guest("acc".into()), "text", "a.pdf"));
        assert_ne!(base, fp(&acc, "other", "a.pdf"));
        assert_ne!(base, fp(&acc, "text", "b.pdf"));
        assert_ne!(base, fingerprint(&acc, "text", ContractType::Quote, "a.pdf", 1000));
    }

    #[test]
    fn fingerprint_only_reads_the_prefix() {
        let acc = Payer::Account("acc".into());
        let long_a = format!("{}tail A", "x".repeat(1000));
        let long_b = format!("{}tail B", "x".repeat(1000));
        assert_eq!(fp(&acc, &long_a, "f"), fp(&acc, &long_b, "f"));
    }

    #[test]
    fn separators_prevent_ambiguity() {
        let acc = Payer::Account("acc".into());
        assert_ne!(fp(&acc, "ab", "c"), fp(&acc, "a", "bc"));
    }
}
