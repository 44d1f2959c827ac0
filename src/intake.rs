//! Document intake: bytes in, LLM-ready text plus a contract label out.
//!
//! ## Flow
//!
//! ```text
//! bytes ─┬─ Extractor ──▶ raw text ──▶ Normalizer ──▶ clean text ─┐
//!        │                                                       ├─▶ TypeClassifier
//!        └─ LayoutScorer ──▶ form likelihood ────────────────────┘
//! ```
//!
//! Extraction and layout scoring run concurrently on the same buffer. The
//! layout pass is advisory: when it fails, classification proceeds without
//! the form override. The raw extraction text is dropped as soon as it has
//! been normalised.

use crate::classify::{ContractType, DetectionResult, TypeClassifier};
use crate::config::{IntakeOptions, PipelineConfig};
use crate::error::PipelineError;
use crate::orchestrator::AnalysisRequest;
use crate::output::{ExtractionSummary, NormalizationResult};
use crate::pipeline::engine::PdfEngine;
use crate::pipeline::extract::Extractor;
use crate::pipeline::layout::{FormIndicators, LayoutScorer};
use crate::pipeline::normalize::Normalizer;
use crate::progress::ProgressCallback;
use crate::store::{ObjectStore, Payer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Everything the analysis step needs from an uploaded document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedDocument {
    pub summary: ExtractionSummary,
    pub normalization: NormalizationResult,
    /// `None` when layout scoring was disabled or failed.
    pub form_likelihood: Option<f64>,
    pub form_indicators: Option<FormIndicators>,
    pub detection: DetectionResult,
    pub duration_ms: u64,
}

impl PreparedDocument {
    pub fn contract_type(&self) -> ContractType {
        self.detection.contract_type
    }

    pub fn clean_text(&self) -> &str {
        &self.normalization.clean_text
    }

    /// Build the orchestrator request for this document.
    pub fn analysis_request(
        &self,
        payer: Payer,
        filename: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> AnalysisRequest {
        AnalysisRequest {
            payer,
            clean_text: self.normalization.clean_text.clone(),
            contract_type: self.detection.contract_type,
            filename: filename.into(),
            idempotency_key: idempotency_key.into(),
        }
    }
}

/// Extractor, layout scorer, normalizer and classifier wired together.
pub struct DocumentIntake {
    extractor: Extractor,
    layout: Option<LayoutScorer>,
    normalizer: Normalizer,
    classifier: Arc<TypeClassifier>,
    options: IntakeOptions,
}

impl DocumentIntake {
    /// Wire every stage to `engine` using `config`.
    pub fn new(engine: Arc<dyn PdfEngine>, config: &PipelineConfig, classifier: Arc<TypeClassifier>) -> Self {
        Self {
            extractor: Extractor::new(Arc::clone(&engine), config.extraction.clone()),
            layout: Some(LayoutScorer::new(engine, config.layout.clone())),
            normalizer: Normalizer::new(config.normalization.clone()),
            classifier,
            options: config.intake.clone(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.extractor = self.extractor.with_progress(progress);
        self
    }

    /// Skip the layout pass (no form override).
    pub fn without_layout(mut self) -> Self {
        self.layout = None;
        self
    }

    /// Extract, score, normalise and classify `bytes`.
    ///
    /// # Errors
    /// Extraction and normalisation errors, unchanged. Layout failures and
    /// classification problems are never fatal.
    pub async fn prepare(&self, bytes: impl Into<Arc<[u8]>>) -> Result<PreparedDocument, PipelineError> {
        let start = Instant::now();
        let bytes: Arc<[u8]> = bytes.into();

        let (extraction, layout) = match &self.layout {
            Some(scorer) => {
                let (extraction, layout) = tokio::join!(
                    self.extractor.extract(Arc::clone(&bytes)),
                    scorer.score(Arc::clone(&bytes)),
                );
                (extraction?, Some(layout))
            }
            None => (self.extractor.extract(bytes).await?, None),
        };

        let layout = match layout {
            Some(Ok(info)) => Some(info),
            Some(Err(e)) => {
                warn!(error = %e, code = e.code(), "layout scoring failed, classifying without it");
                None
            }
            None => None,
        };

        let normalization = self.normalizer.normalize(
            &extraction.raw_text,
            extraction.page_count,
            &extraction.metadata,
        )?;
        let summary = ExtractionSummary::from(extraction);

        let form_likelihood = layout.as_ref().map(|l| l.form_likelihood);
        let detection = self
            .classifier
            .classify(&normalization.clean_text, form_likelihood)
            .await;

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            pages = summary.page_count,
            clean_chars = normalization.stats.clean_length,
            tokens = normalization.approx_token_count,
            contract_type = detection.contract_type.as_str(),
            confidence = detection.confidence,
            form_likelihood,
            duration_ms,
            "document prepared"
        );

        Ok(PreparedDocument {
            summary,
            normalization,
            form_likelihood,
            form_indicators: layout.map(|l| l.form_indicators),
            detection,
            duration_ms,
        })
    }

    /// Fetch `path` from `store` and [`prepare`](Self::prepare) it.
    ///
    /// When `delete_after_processing` is set the object is deleted
    /// afterwards, whether or not preparation succeeded. Delete failures
    /// are logged only.
    pub async fn prepare_from_store(
        &self,
        store: &dyn ObjectStore,
        path: &str,
    ) -> Result<PreparedDocument, PipelineError> {
        let bytes = store.get(path).await?;
        let prepared = self.prepare(bytes).await;

        if self.options.delete_after_processing {
            match store.delete(path).await {
                Ok(()) => info!(path, "uploaded object deleted"),
                Err(e) => warn!(path, error = %e, "could not delete uploaded object"),
            }
        }
        prepared
    }
}
