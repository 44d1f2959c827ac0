//! Document stages for contract intake.
//!
//! Each submodule implements exactly one transformation step so each can be
//! tested on its own and the PDF backend can be swapped without touching the
//! text stages.
//!
//! ## Data Flow
//!
//! ```text
//!            ┌──▶ extract ──▶ normalize ──┐
//! bytes ─────┤                            ├──▶ classify ──▶ analysis
//!            └──▶ layout (form score) ────┘
//! ```
//!
//! 1. [`engine`]:    PDF backend trait; pdfium in production, in-memory in tests
//! 2. [`extract`]:   page text in bounded-concurrency waves with per-page deadlines
//! 3. [`normalize`]: deterministic cleanup rules, heading and title detection
//! 4. [`layout`]:    positional form-likelihood score, independent of `extract`
//! 5. [`llm`]:       provider client with retry/backoff, the only stage with network I/O

pub mod engine;
pub mod extract;
pub mod layout;
pub mod llm;
pub mod normalize;

/// Separator inserted by the extractor between two pages.
///
/// `page` is the 1-indexed number of the page that follows.
pub(crate) fn page_marker(page: usize) -> String {
    format!("\n\n[[PAGE {page}]]\n\n")
}

/// Regex source matching one [`page_marker`] line.
pub(crate) const PAGE_MARKER_PATTERN: &str = r"(?m)^\[\[PAGE \d+\]\]$";

/// Text substituted for a page whose extraction timed out.
pub(crate) fn timeout_placeholder(page: usize) -> String {
    format!("[page {page}: text extraction timed out]")
}
