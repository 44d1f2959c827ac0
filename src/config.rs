//! Configuration types for the intake pipeline.
//!
//! Every tunable lives in [`PipelineConfig`], built once at process start
//! (via [`PipelineConfig::default`], the per-component builders, or
//! [`PipelineConfig::from_env`]) and passed by reference into each component.
//! Nothing in the library reads the environment lazily at call time.
//!
//! Range-limited knobs are clamped by their builder setters, so
//! `ExtractionOptions::builder().max_concurrency(64)` silently yields 8.
//! `build()` still validates the remaining invariants.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::warn;

// ── Extraction ───────────────────────────────────────────────────────────

/// Options for [`crate::pipeline::extract::Extractor`].
#[derive(Clone, Serialize, Deserialize)]
pub struct ExtractionOptions {
    /// User password for encrypted documents.
    #[serde(skip_serializing)]
    pub password: Option<String>,

    /// Pages extracted concurrently per wave. Range: 1–8. Default: 4.
    ///
    /// Bounds the peak memory and CPU a single large PDF can claim.
    pub max_concurrency: usize,

    /// Per-page extraction deadline in milliseconds. Range: 200–3000. Default: 800.
    ///
    /// A page exceeding it is replaced by a placeholder and recorded in
    /// `timed_out_pages`; the document itself still succeeds.
    pub per_page_timeout_ms: u64,

    /// Maximum accepted input size in bytes. Default: 10 MiB.
    pub max_size_bytes: usize,

    /// Maximum accepted page count. Default: 500.
    pub max_pages: usize,

    /// Minimum alphanumeric characters (and total characters) the combined
    /// text must contain. Default: 50.
    pub min_text_length: usize,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            password: None,
            max_concurrency: 4,
            per_page_timeout_ms: 800,
            max_size_bytes: 10 * 1024 * 1024,
            max_pages: 500,
            min_text_length: 50,
        }
    }
}

impl fmt::Debug for ExtractionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionOptions")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("max_concurrency", &self.max_concurrency)
            .field("per_page_timeout_ms", &self.per_page_timeout_ms)
            .field("max_size_bytes", &self.max_size_bytes)
            .field("max_pages", &self.max_pages)
            .field("min_text_length", &self.min_text_length)
            .finish()
    }
}

impl ExtractionOptions {
    /// Create a new builder for `ExtractionOptions`.
    pub fn builder() -> ExtractionOptionsBuilder {
        ExtractionOptionsBuilder {
            options: Self::default(),
        }
    }

    pub fn per_page_timeout(&self) -> Duration {
        Duration::from_millis(self.per_page_timeout_ms)
    }
}

/// Builder for [`ExtractionOptions`].
#[derive(Debug)]
pub struct ExtractionOptionsBuilder {
    options: ExtractionOptions,
}

impl ExtractionOptionsBuilder {
    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.options.password = Some(pwd.into());
        self
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.options.max_concurrency = n.clamp(1, 8);
        self
    }

    pub fn per_page_timeout_ms(mut self, ms: u64) -> Self {
        self.options.per_page_timeout_ms = ms.clamp(200, 3000);
        self
    }

    pub fn max_size_bytes(mut self, n: usize) -> Self {
        self.options.max_size_bytes = n;
        self
    }

    pub fn max_pages(mut self, n: usize) -> Self {
        self.options.max_pages = n;
        self
    }

    pub fn min_text_length(mut self, n: usize) -> Self {
        self.options.min_text_length = n;
        self
    }

    /// Build the options, validating constraints.
    pub fn build(self) -> Result<ExtractionOptions, PipelineError> {
        let o = &self.options;
        if o.max_size_bytes == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_size_bytes must be ≥ 1".into(),
            ));
        }
        if o.max_pages == 0 {
            return Err(PipelineError::InvalidConfig("max_pages must be ≥ 1".into()));
        }
        Ok(self.options)
    }
}

// ── Normalisation ────────────────────────────────────────────────────────

/// Options for [`crate::pipeline::normalize::Normalizer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizationOptions {
    /// Cleaned text shorter than this fails with `TextTooShort`. Default: 200.
    pub min_length: usize,
    /// Cleaned text is truncated to this many characters. Default: 200 000.
    pub max_length: usize,
}

impl Default for NormalizationOptions {
    fn default() -> Self {
        Self {
            min_length: 200,
            max_length: 200_000,
        }
    }
}

// ── Layout ───────────────────────────────────────────────────────────────

/// Options for [`crate::pipeline::layout::LayoutScorer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutOptions {
    /// Fragments taller than this (in points) count as headings. Default: 14.
    pub heading_min_height: f32,
    /// X-position bucket tolerance in points. Default: 5.
    pub x_tolerance: f32,
    /// Members a bucket needs to count as a column. Default: 5.
    pub min_column_members: usize,
    /// Columns a page needs to be table-like. Default: 3.
    pub min_table_columns: usize,
    /// Same password as extraction; layout re-opens the document.
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            heading_min_height: 14.0,
            x_tolerance: 5.0,
            min_column_members: 5,
            min_table_columns: 3,
            password: None,
        }
    }
}

// ── Classification ───────────────────────────────────────────────────────

/// Thresholds and limits for [`crate::classify::TypeClassifier`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Heuristic confidence at or above which the LLM is skipped. Default: 0.8.
    pub heuristic_accept_threshold: f64,
    /// LLM confidence at or above which the LLM answer wins outright. Default: 0.7.
    pub llm_trust_threshold: f64,
    /// Form-likelihood at or above which the document is forced to
    /// `administrative-form`. Default: 0.44.
    pub form_override_threshold: f64,
    /// Confidence reported for the forced form label. Default: 0.85.
    pub form_override_confidence: f64,
    /// Token bucket capacity for LLM classification calls. Default: 5.
    pub rate_limit_capacity: u32,
    /// Token bucket refill rate in tokens per second. Default: 0.5.
    pub rate_limit_refill_per_sec: f64,
    /// Whether the LLM fallback is consulted at all. Default: true.
    pub llm_enabled: bool,
    /// Maximum excerpt size sent to the LLM, in characters. Default: 1200.
    pub excerpt_max_chars: usize,
    /// Sampling temperature for the classification call. Default: 0.0.
    pub temperature: f32,
    /// Output token cap for the classification call. Default: 200.
    pub max_tokens: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            heuristic_accept_threshold: 0.8,
            llm_trust_threshold: 0.7,
            form_override_threshold: 0.44,
            form_override_confidence: 0.85,
            rate_limit_capacity: 5,
            rate_limit_refill_per_sec: 0.5,
            llm_enabled: true,
            excerpt_max_chars: 1200,
            temperature: 0.0,
            max_tokens: 200,
        }
    }
}

// ── Idempotency ──────────────────────────────────────────────────────────

/// Timing for [`crate::idempotency::IdempotencyCoordinator`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Lifetime of a PENDING lock before another worker may supersede it. Default: 120 s.
    pub lock_timeout_secs: i64,
    /// Lifetime of any record before it is purged and the key reusable. Default: 24 h.
    pub record_ttl_secs: i64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 120,
            record_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl IdempotencyConfig {
    pub fn lock_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lock_timeout_secs)
    }

    pub fn record_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.record_ttl_secs)
    }
}

// ── Analysis ─────────────────────────────────────────────────────────────

/// Options for [`crate::analysis::Analyzer`] and the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Repair prompts sent after the first invalid answer. Default: 2.
    pub max_repair_attempts: u32,
    /// Clean text beyond this many characters is cut before prompting. Default: 60 000.
    pub max_input_chars: usize,
    /// Sampling temperature. Default: 0.2.
    pub temperature: f32,
    /// Output token cap. Default: 4096.
    pub max_tokens: usize,
    /// Transport retries per LLM call on rate-limit / transient errors. Default: 3.
    pub max_retries: u32,
    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,
    /// Clean-text prefix length folded into the request fingerprint. Default: 1000.
    pub fingerprint_prefix_chars: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_repair_attempts: 2,
            max_input_chars: 60_000,
            temperature: 0.2,
            max_tokens: 4096,
            max_retries: 3,
            retry_backoff_ms: 500,
            fingerprint_prefix_chars: 1000,
        }
    }
}

// ── LLM provider selection ───────────────────────────────────────────────

/// Which provider/model the [`crate::pipeline::llm::EdgequakeLlm`] adapter binds to.
///
/// Both `None` means auto-detection from the provider API-key variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmSettings {
    /// Provider name, e.g. "openai", "anthropic", "ollama".
    pub provider_name: Option<String>,
    /// Model identifier, e.g. "gpt-4.1-mini".
    pub model: Option<String>,
}

// ── Billing / intake ─────────────────────────────────────────────────────

/// Guest quota and upload housekeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeOptions {
    /// Free analyses granted to each guest session. Default: 1.
    pub guest_quota: i64,
    /// Delete the uploaded object once it has been processed. Default: true.
    pub delete_after_processing: bool,
}

impl Default for IntakeOptions {
    fn default() -> Self {
        Self {
            guest_quota: 1,
            delete_after_processing: true,
        }
    }
}

// ── Aggregate ────────────────────────────────────────────────────────────

/// Complete configuration for every pipeline component.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub extraction: ExtractionOptions,
    pub normalization: NormalizationOptions,
    pub layout: LayoutOptions,
    pub classifier: ClassifierConfig,
    pub idempotency: IdempotencyConfig,
    pub analysis: AnalysisConfig,
    pub llm: LlmSettings,
    pub intake: IntakeOptions,
}

impl PipelineConfig {
    /// Build the configuration from `CONTRACT_INTAKE_*` environment variables.
    ///
    /// Call once at process start. Unset variables keep their defaults;
    /// unparseable values are logged and ignored.
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`PipelineConfig::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = ExtractionOptions::builder();
        if let Some(pwd) = lookup("CONTRACT_INTAKE_PDF_PASSWORD").filter(|p| !p.is_empty()) {
            builder = builder.password(pwd);
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "CONTRACT_INTAKE_MAX_CONCURRENCY") {
            builder = builder.max_concurrency(n);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "CONTRACT_INTAKE_PAGE_TIMEOUT_MS") {
            builder = builder.per_page_timeout_ms(ms);
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "CONTRACT_INTAKE_MAX_SIZE_BYTES") {
            builder = builder.max_size_bytes(n);
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "CONTRACT_INTAKE_MAX_PAGES") {
            builder = builder.max_pages(n);
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "CONTRACT_INTAKE_MIN_TEXT_LENGTH") {
            builder = builder.min_text_length(n);
        }
        let extraction = builder.build()?;

        let mut config = PipelineConfig {
            layout: LayoutOptions {
                password: extraction.password.clone(),
                ..LayoutOptions::default()
            },
            extraction,
            ..PipelineConfig::default()
        };

        if let Some(v) = parse_var::<bool, _>(&lookup, "CONTRACT_INTAKE_CLASSIFIER_LLM") {
            config.classifier.llm_enabled = v;
        }
        if let Some(v) = parse_var::<f64, _>(&lookup, "CONTRACT_INTAKE_FORM_THRESHOLD") {
            config.classifier.form_override_threshold = v.clamp(0.0, 1.0);
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, "CONTRACT_INTAKE_CLASSIFIER_BURST") {
            config.classifier.rate_limit_capacity = v.max(1);
        }
        if let Some(v) = parse_var::<f64, _>(&lookup, "CONTRACT_INTAKE_CLASSIFIER_REFILL") {
            config.classifier.rate_limit_refill_per_sec = v.max(0.0);
        }
        if let Some(v) = parse_var::<i64, _>(&lookup, "CONTRACT_INTAKE_LOCK_TIMEOUT_SECS") {
            config.idempotency.lock_timeout_secs = v.max(1);
        }
        if let Some(v) = parse_var::<i64, _>(&lookup, "CONTRACT_INTAKE_RECORD_TTL_SECS") {
            config.idempotency.record_ttl_secs = v.max(1);
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, "CONTRACT_INTAKE_REPAIR_ATTEMPTS") {
            config.analysis.max_repair_attempts = v;
        }
        if let Some(v) = parse_var::<i64, _>(&lookup, "CONTRACT_INTAKE_GUEST_QUOTA") {
            config.intake.guest_quota = v.max(0);
        }
        config.llm.provider_name = lookup("CONTRACT_INTAKE_LLM_PROVIDER").filter(|s| !s.is_empty());
        config.llm.model = lookup("CONTRACT_INTAKE_LLM_MODEL").filter(|s| !s.is_empty());

        if config.idempotency.lock_timeout_secs >= config.idempotency.record_ttl_secs {
            return Err(PipelineError::InvalidConfig(format!(
                "lock timeout ({}s) must be shorter than record TTL ({}s)",
                config.idempotency.lock_timeout_secs, config.idempotency.record_ttl_secs
            )));
        }

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable configuration value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn extraction_defaults() {
        let o = ExtractionOptions::default();
        assert_eq!(o.max_concurrency, 4);
        assert_eq!(o.per_page_timeout_ms, 800);
        assert_eq!(o.max_size_bytes, 10 * 1024 * 1024);
        assert_eq!(o.max_pages, 500);
        assert_eq!(o.min_text_length, 50);
    }

    #[test]
    fn builder_clamps_ranges() {
        let o = ExtractionOptions::builder()
            .max_concurrency(64)
            .per_page_timeout_ms(10)
            .build()
            .unwrap();
        assert_eq!(o.max_concurrency, 8);
        assert_eq!(o.per_page_timeout_ms, 200);

        let o = ExtractionOptions::builder()
            .max_concurrency(0)
            .per_page_timeout_ms(60_000)
            .build()
            .unwrap();
        assert_eq!(o.max_concurrency, 1);
        assert_eq!(o.per_page_timeout_ms, 3000);
    }

    #[test]
    fn builder_rejects_zero_limits() {
        assert!(ExtractionOptions::builder().max_pages(0).build().is_err());
        assert!(ExtractionOptions::builder().max_size_bytes(0).build().is_err());
    }

    #[test]
    fn debug_redacts_password() {
        let o = ExtractionOptions::builder().password("hunter2").build().unwrap();
        let dbg = format!("{o:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn from_lookup_applies_and_clamps() {
        let cfg = PipelineConfig::from_lookup(lookup_from(&[
            ("CONTRACT_INTAKE_MAX_CONCURRENCY", "12"),
            ("CONTRACT_INTAKE_PAGE_TIMEOUT_MS", "1500"),
            ("CONTRACT_INTAKE_CLASSIFIER_LLM", "false"),
            ("CONTRACT_INTAKE_LLM_PROVIDER", "openai"),
            ("CONTRACT_INTAKE_PDF_PASSWORD", "secret"),
        ]))
        .unwrap();
        assert_eq!(cfg.extraction.max_concurrency, 8);
        assert_eq!(cfg.extraction.per_page_timeout_ms, 1500);
        assert!(!cfg.classifier.llm_enabled);
        assert_eq!(cfg.llm.provider_name.as_deref(), Some("openai"));
        assert_eq!(cfg.layout.password.as_deref(), Some("secret"));
    }

    #[test]
    fn from_lookup_ignores_garbage() {
        let cfg = PipelineConfig::from_lookup(lookup_from(&[
            ("CONTRACT_INTAKE_MAX_PAGES", "lots"),
            ("CONTRACT_INTAKE_FORM_THRESHOLD", "NaN-ish"),
        ]))
        .unwrap();
        assert_eq!(cfg.extraction.max_pages, 500);
        assert!((cfg.classifier.form_override_threshold - 0.44).abs() < f64::EPSILON);
    }

    #[test]
    fn from_lookup_rejects_lock_longer_than_ttl() {
        let res = PipelineConfig::from_lookup(lookup_from(&[
            ("CONTRACT_INTAKE_LOCK_TIMEOUT_SECS", "7200"),
            ("CONTRACT_INTAKE_RECORD_TTL_SECS", "3600"),
        ]));
        assert!(matches!(res, Err(PipelineError::InvalidConfig(_))));
    }
}
