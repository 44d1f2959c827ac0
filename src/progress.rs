//! Progress-callback trait for per-page extraction events.
//!
//! Pass an [`Arc<dyn ExtractionProgressCallback>`] to
//! [`crate::pipeline::extract::Extractor::with_progress`] to receive events as
//! pages are extracted. Callers can forward them to a channel, a job record
//! or a progress bar; the library does not care.
//!
//! # Example
//!
//! ```rust
//! use contract_intake::ExtractionProgressCallback;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for CountingCallback {
//!     fn on_page_complete(&self, page_num: usize, total_pages: usize, text_len: usize) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("Page {}/{} extracted ({} chars)", page_num, total_pages, text_len);
//!     }
//! }
//! ```

use crate::error::PageError;
use std::sync::Arc;

/// Called by the extractor as it processes each page.
///
/// Pages inside one batch run concurrently, so `on_page_start`,
/// `on_page_complete` and `on_page_timeout` may be called from different
/// threads. All methods default to no-ops.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once the document is open and its page count known.
    fn on_extraction_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called before a page's text extraction is scheduled (1-indexed).
    fn on_page_start(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called when a page's text is available.
    ///
    /// `text_len` is the character count of the page text.
    fn on_page_complete(&self, page_num: usize, total_pages: usize, text_len: usize) {
        let _ = (page_num, total_pages, text_len);
    }

    /// Called when a page is replaced by a placeholder after its deadline.
    fn on_page_timeout(&self, error: &PageError) {
        let _ = error;
    }

    /// Called once after the last batch.
    fn on_extraction_complete(&self, total_pages: usize, timed_out: usize) {
        let _ = (total_pages, timed_out);
    }
}

/// A no-op implementation, used when no callback is configured.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;
