//! Error types for the contract-intake library.
//!
//! Two distinct error types reflect two distinct failure modes, as with the
//! rest of the pipeline:
//!
//! * [`PipelineError`]: **Fatal**: the stage cannot proceed (wrong password,
//!   file too large, text too short, idempotency conflict, insufficient
//!   balance). Returned as `Err(PipelineError)` from every public operation.
//!
//! * [`PageError`]: **Non-fatal**: a single page timed out or produced no
//!   text while the rest of the document is fine. Recorded in
//!   [`crate::output::ExtractionResult`] and reported to the progress callback.
//!
//! Collaborator errors ([`LlmError`], [`StoreError`], [`EngineError`]) are
//! kept separate so adapters can be written without depending on the full
//! taxonomy; they convert into [`PipelineError`] at the stage boundary.
//!
//! Every fatal error carries a machine-readable code via
//! [`PipelineError::code`], suitable for API responses and for the
//! `error_code` column of a FAILED idempotency record.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All fatal errors returned by the contract-intake library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Extraction errors ─────────────────────────────────────────────────
    /// The PDF is encrypted and no password was supplied.
    #[error("PDF is encrypted and requires a password")]
    PasswordRequired,

    /// A password was supplied but the document rejected it.
    #[error("Wrong password for encrypted PDF")]
    PasswordInvalid,

    /// The document (or one of its pages) could not be parsed.
    #[error("PDF parsing failed{}: {}", page_suffix(.page), .cause.as_deref().unwrap_or("unknown cause"))]
    ParseFailed {
        page: Option<usize>,
        cause: Option<String>,
    },

    /// Input buffer exceeds the configured size limit.
    #[error("PDF is {size} bytes, exceeding the {max} byte limit")]
    FileTooLarge { size: usize, max: usize },

    /// Document has more pages than the configured limit.
    #[error("PDF has {count} pages, exceeding the {max} page limit")]
    TooManyPages { count: usize, max: usize },

    /// Extraction produced too little text (scanned or image-only PDF).
    #[error("PDF contains too little extractable text ({length} chars)")]
    TextEmpty { length: usize },

    // ── Normalisation errors ─────────────────────────────────────────────
    /// Normalised text is below the minimum usable length.
    #[error("Normalised text is too short for analysis ({length} chars)")]
    TextTooShort { length: usize },

    // ── Analysis errors ──────────────────────────────────────────────────
    /// The LLM kept returning output that fails schema validation.
    #[error("Analysis output failed validation after repairs: {}", .errors.join("; "))]
    AnalysisInvalid { errors: Vec<String> },

    /// The LLM provider call itself failed.
    #[error(transparent)]
    Llm(#[from] LlmError),

    // ── Idempotency / billing errors ─────────────────────────────────────
    /// The idempotency key was already used for a different request.
    #[error("Idempotency key '{key}' was already used with different request parameters")]
    IdempotencyKeyConflict { key: String },

    /// Another worker currently holds the persisted lock for this key.
    #[error("A request with idempotency key '{key}' is already in progress")]
    IdempotencyInProgress { key: String },

    /// Account has no credit left.
    #[error("Insufficient balance for account '{account}'")]
    InsufficientBalance { account: String },

    /// Guest session has used up its free analyses.
    #[error("Guest quota exhausted for '{guest}'")]
    GuestQuotaExhausted { guest: String },

    // ── Collaborator errors ──────────────────────────────────────────────
    /// The object store has nothing at the requested path.
    #[error("Object not found: '{path}'")]
    ObjectNotFound { path: String },

    /// Persistence backend failure.
    #[error("Storage error: {0}")]
    Storage(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (task panic, poisoned lock).
    #[error("Internal error: {0}")]
    Internal(String),
}

fn page_suffix(page: &Option<usize>) -> String {
    page.map(|p| format!(" on page {p}")).unwrap_or_default()
}

impl PipelineError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PasswordRequired => "PASSWORD_REQUIRED",
            Self::PasswordInvalid => "PASSWORD_INVALID",
            Self::ParseFailed { .. } => "PARSE_FAILED",
            Self::FileTooLarge { .. } => "FILE_TOO_LARGE",
            Self::TooManyPages { .. } => "TOO_MANY_PAGES",
            Self::TextEmpty { .. } => "TEXT_EMPTY",
            Self::TextTooShort { .. } => "TEXT_TOO_SHORT",
            Self::AnalysisInvalid { .. } => "ANALYSIS_INVALID",
            Self::Llm(e) => e.code(),
            Self::IdempotencyKeyConflict { .. } => "IDEMPOTENCY_KEY_CONFLICT",
            Self::IdempotencyInProgress { .. } => "IDEMPOTENCY_IN_PROGRESS",
            Self::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            Self::GuestQuotaExhausted { .. } => "GUEST_QUOTA_EXHAUSTED",
            Self::ObjectNotFound { .. } => "OBJECT_NOT_FOUND",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller may reasonably retry the same request later.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Llm(e) => e.is_retryable(),
            Self::IdempotencyInProgress { .. } | Self::Storage(_) => true,
            _ => false,
        }
    }
}

/// A non-fatal error for a single page.
///
/// Stored in [`crate::output::ExtractionResult::page_errors`]; extraction of
/// the remaining pages continues.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PageError {
    /// Page text extraction exceeded the per-page deadline.
    #[error("Page {page}: extraction timed out after {timeout_ms}ms")]
    Timeout { page: usize, timeout_ms: u64 },

    /// Page was read but yielded no text (likely an image-only page).
    #[error("Page {page}: no extractable text")]
    NoText { page: usize },
}

impl PageError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "PAGE_TIMEOUT",
            Self::NoText { .. } => "PAGE_NO_TEXT",
        }
    }

    /// 1-indexed page number the error refers to.
    pub fn page(&self) -> usize {
        match self {
            Self::Timeout { page, .. } | Self::NoText { page } => *page,
        }
    }
}

/// Failure reported by an [`crate::pipeline::llm::LlmClient`].
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    /// HTTP 429 or provider-side quota; back off and retry.
    #[error("LLM provider rate limited the request")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Timeout, 5xx, connection reset: retrying may succeed.
    #[error("Transient LLM failure: {0}")]
    Transient(String),

    /// Provider not configured, auth failure, or a non-retryable 4xx.
    #[error("LLM provider unavailable: {0}")]
    Unavailable(String),
}

impl LlmError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "LLM_RATE_LIMITED",
            Self::Transient(_) => "LLM_TRANSIENT",
            Self::Unavailable(_) => "LLM_UNAVAILABLE",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_))
    }
}

/// Failure reported by a persistence or object-store collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient balance for account '{0}'")]
    InsufficientBalance(String),

    #[error("guest quota exhausted for '{0}'")]
    QuotaExhausted(String),

    #[error("invalid object path: {0}")]
    InvalidPath(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        Self::Backend(value.to_string())
    }
}

impl From<StoreError> for PipelineError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound(path) => Self::ObjectNotFound { path },
            StoreError::InsufficientBalance(account) => Self::InsufficientBalance { account },
            StoreError::QuotaExhausted(guest) => Self::GuestQuotaExhausted { guest },
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Failure reported by a [`crate::pipeline::engine::PdfEngine`].
///
/// Engines only produce a message; the extractor classifies it into
/// password / parse errors.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_failed_display_with_page() {
        let e = PipelineError::ParseFailed {
            page: Some(3),
            cause: Some("bad xref".into()),
        };
        let msg = e.to_string();
        assert!(msg.contains("on page 3"), "got: {msg}");
        assert!(msg.contains("bad xref"), "got: {msg}");
    }

    #[test]
    fn parse_failed_display_without_page() {
        let e = PipelineError::ParseFailed {
            page: None,
            cause: None,
        };
        assert_eq!(e.to_string(), "PDF parsing failed: unknown cause");
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(PipelineError::PasswordRequired.code(), "PASSWORD_REQUIRED");
        assert_eq!(
            PipelineError::TextEmpty { length: 1 }.code(),
            "TEXT_EMPTY"
        );
        assert_eq!(
            PipelineError::Llm(LlmError::RateLimited {
                retry_after_secs: None
            })
            .code(),
            "LLM_RATE_LIMITED"
        );
        assert_eq!(
            PageError::Timeout {
                page: 2,
                timeout_ms: 800
            }
            .code(),
            "PAGE_TIMEOUT"
        );
    }

    #[test]
    fn analysis_invalid_lists_errors() {
        let e = PipelineError::AnalysisInvalid {
            errors: vec!["summary is empty".into(), "risk_score out of range".into()],
        };
        let msg = e.to_string();
        assert!(msg.contains("summary is empty; risk_score out of range"));
    }

    #[test]
    fn store_errors_map_to_billing_errors() {
        let e: PipelineError = StoreError::InsufficientBalance("acct-1".into()).into();
        assert!(matches!(e, PipelineError::InsufficientBalance { ref account } if account == "acct-1"));

        let e: PipelineError = StoreError::NotFound("uploads/a.pdf".into()).into();
        assert_eq!(e.code(), "OBJECT_NOT_FOUND");

        let e: PipelineError = StoreError::Backend("disk full".into()).into();
        assert!(e.retryable());
    }

    #[test]
    fn retryable_llm_errors() {
        assert!(PipelineError::Llm(LlmError::Transient("503".into())).retryable());
        assert!(!PipelineError::Llm(LlmError::Unavailable("401".into())).retryable());
        assert!(!PipelineError::PasswordInvalid.retryable());
    }
}
