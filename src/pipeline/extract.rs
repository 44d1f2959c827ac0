//! Text extraction: page text in bounded waves with per-page deadlines.
//!
//! ## Why waves?
//!
//! Pages are processed in sequential batches of `max_concurrency`. Within a
//! batch every page runs on its own blocking thread; the next batch starts
//! only when the current one is finished. This bounds the CPU and memory a
//! single 500-page upload can claim.
//!
//! ## Partial failure
//!
//! Each page races its extraction against `per_page_timeout_ms`. A page that
//! loses the race is replaced by a placeholder and recorded in
//! `timed_out_pages`; the document still succeeds. Any other page error
//! aborts the whole call with `ParseFailed`.

use crate::config::ExtractionOptions;
use crate::error::{EngineError, PageError, PipelineError};
use crate::output::{DocumentMetadata, ExtractionResult, MemoryStats};
use crate::pipeline::engine::{DocumentGuard, PdfDocumentHandle, PdfEngine};
use crate::pipeline::{page_marker, timeout_placeholder};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Extracts page text from PDF buffers with a configured [`PdfEngine`].
#[derive(Clone)]
pub struct Extractor {
    engine: Arc<dyn PdfEngine>,
    options: ExtractionOptions,
    progress: ProgressCallback,
}

/// Outcome of one page task.
enum PageOutcome {
    Text(String),
    TimedOut,
}

impl Extractor {
    pub fn new(engine: Arc<dyn PdfEngine>, options: ExtractionOptions) -> Self {
        Self {
            engine,
            options,
            progress: Arc::new(NoopProgressCallback),
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn options(&self) -> &ExtractionOptions {
        &self.options
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Extract the text of every page of `bytes`.
    ///
    /// # Errors
    /// `FileTooLarge`, `PasswordRequired`, `PasswordInvalid`, `ParseFailed`,
    /// `TooManyPages` and `TextEmpty`. Page timeouts are not errors.
    pub async fn extract(
        &self,
        bytes: impl Into<Arc<[u8]>>,
    ) -> Result<ExtractionResult, PipelineError> {
        let total_start = Instant::now();
        let bytes: Arc<[u8]> = bytes.into();
        let opts = &self.options;

        // ── Step 1: Size gate ────────────────────────────────────────────
        if bytes.len() > opts.max_size_bytes {
            return Err(PipelineError::FileTooLarge {
                size: bytes.len(),
                max: opts.max_size_bytes,
            });
        }

        // ── Step 2: Open ─────────────────────────────────────────────────
        let engine = Arc::clone(&self.engine);
        let password = opts.password.clone();
        let input = Arc::clone(&bytes);
        let opened = tokio::task::spawn_blocking(move || engine.open(input, password.as_deref()))
            .await
            .map_err(|e| PipelineError::Internal(format!("Open task panicked: {e}")))?;
        let handle = opened.map_err(|e| classify_open_error(&e, opts.password.is_some()))?;
        let guard = DocumentGuard::new(handle);
        let handle = Arc::clone(guard.handle());

        // ── Step 3: Page limit ───────────────────────────────────────────
        let page_count = handle.page_count();
        if page_count > opts.max_pages {
            return Err(PipelineError::TooManyPages {
                count: page_count,
                max: opts.max_pages,
            });
        }
        info!(
            engine = self.engine.name(),
            pages = page_count,
            bytes = bytes.len(),
            "PDF opened"
        );

        // ── Step 4: Metadata (best-effort) ───────────────────────────────
        let metadata = read_metadata(Arc::clone(&handle)).await;

        // ── Step 5: Pages in waves ───────────────────────────────────────
        self.progress.on_extraction_start(page_count);
        let timeout = opts.per_page_timeout();
        let indices: Vec<usize> = (0..page_count).collect();
        let mut texts: Vec<Option<String>> = Vec::with_capacity(page_count);
        let mut durations: Vec<u64> = Vec::with_capacity(page_count);
        let mut timed_out_pages = Vec::new();
        let mut page_errors = Vec::new();

        for (batch_no, batch) in indices.chunks(opts.max_concurrency).enumerate() {
            debug!(batch = batch_no + 1, pages = batch.len(), "extracting batch");
            let tasks = batch.iter().map(|&index| {
                let handle = Arc::clone(&handle);
                let progress = Arc::clone(&self.progress);
                async move {
                    progress.on_page_start(index + 1, page_count);
                    let start = Instant::now();
                    let outcome = extract_page(handle, index, timeout).await;
                    (index, outcome, start.elapsed().as_millis() as u64)
                }
            });

            // join_all preserves input order, so page order survives
            for (index, outcome, elapsed) in join_all(tasks).await {
                let page_num = index + 1;
                durations.push(elapsed);
                match outcome? {
                    PageOutcome::Text(text) => {
                        let len = text.chars().count();
                        if text.trim().is_empty() {
                            page_errors.push(PageError::NoText { page: page_num });
                        }
                        self.progress.on_page_complete(page_num, page_count, len);
                        texts.push(Some(text));
                    }
                    PageOutcome::TimedOut => {
                        let err = PageError::Timeout {
                            page: page_num,
                            timeout_ms: opts.per_page_timeout_ms,
                        };
                        warn!(page = page_num, timeout_ms = opts.per_page_timeout_ms, "page extraction timed out");
                        self.progress.on_page_timeout(&err);
                        page_errors.push(err);
                        timed_out_pages.push(page_num);
                        texts.push(None);
                    }
                }
            }
        }

        // ── Step 6: Validate real content ────────────────────────────────
        let (alnum, measured) = texts
            .iter()
            .flatten()
            .fold((0usize, 0usize), |(alnum, total), t| {
                (
                    alnum + t.chars().filter(|c| c.is_alphanumeric()).count(),
                    total + t.trim().chars().count(),
                )
            });
        if alnum < opts.min_text_length || measured < opts.min_text_length {
            return Err(PipelineError::TextEmpty { length: measured });
        }

        // ── Step 7: Assemble ─────────────────────────────────────────────
        let raw_text = join_pages(texts);
        let text_length = raw_text.chars().count();
        let memory = MemoryStats::estimate(bytes.len(), raw_text.len(), page_count);
        let total_duration_ms = total_start.elapsed().as_millis() as u64;

        self.progress
            .on_extraction_complete(page_count, timed_out_pages.len());
        info!(
            pages = page_count,
            chars = text_length,
            timed_out = timed_out_pages.len(),
            duration_ms = total_duration_ms,
            peak_estimate = memory.estimated_peak_bytes,
            "extraction complete"
        );

        drop(guard);
        Ok(ExtractionResult {
            raw_text,
            page_count,
            text_length,
            metadata,
            engine_used: self.engine.name().to_string(),
            per_page_durations_ms: durations,
            timed_out_pages,
            page_errors,
            total_duration_ms,
            memory,
        })
    }
}

/// Map an engine open failure onto the fatal taxonomy.
pub(crate) fn classify_open_error(err: &EngineError, password_supplied: bool) -> PipelineError {
    let msg = err.message.to_lowercase();
    if msg.contains("password") {
        if password_supplied {
            PipelineError::PasswordInvalid
        } else {
            PipelineError::PasswordRequired
        }
    } else {
        PipelineError::ParseFailed {
            page: None,
            cause: Some(err.message.clone()),
        }
    }
}

async fn read_metadata(handle: Arc<dyn PdfDocumentHandle>) -> DocumentMetadata {
    match tokio::task::spawn_blocking(move || handle.metadata()).await {
        Ok(Ok(meta)) => meta,
        Ok(Err(e)) => {
            warn!(error = %e, "metadata unreadable, continuing without it");
            DocumentMetadata::default()
        }
        Err(e) => {
            warn!(error = %e, "metadata task failed, continuing without it");
            DocumentMetadata::default()
        }
    }
}

/// Race one page's text extraction against `timeout`.
///
/// The blocking thread is not cancelled on timeout; its result is discarded.
async fn extract_page(
    handle: Arc<dyn PdfDocumentHandle>,
    index: usize,
    timeout: std::time::Duration,
) -> Result<PageOutcome, PipelineError> {
    let task = tokio::task::spawn_blocking(move || handle.page_text(index));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(Ok(text))) => Ok(PageOutcome::Text(text)),
        Ok(Ok(Err(e))) => Err(PipelineError::ParseFailed {
            page: Some(index + 1),
            cause: Some(e.message),
        }),
        Ok(Err(join)) => Err(PipelineError::Internal(format!(
            "Page {} task panicked: {join}",
            index + 1
        ))),
        Err(_) => Ok(PageOutcome::TimedOut),
    }
}

/// Join page texts in order, substituting placeholders for timed-out pages.
fn join_pages(texts: Vec<Option<String>>) -> String {
    let mut out = String::new();
    for (i, text) in texts.into_iter().enumerate() {
        let page_num = i + 1;
        if i > 0 {
            out.push_str(&page_marker(page_num));
        }
        match text {
            Some(t) => out.push_str(t.trim_end()),
            None => out.push_str(&timeout_placeholder(page_num)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::engine::{MemoryEngine, MemoryPage};
    use std::time::Duration;

    const BODY: &str = "This agreement is entered into between the parties named below \
                        and sets out the terms of service.";

    fn extractor(engine: MemoryEngine) -> Extractor {
        Extractor::new(Arc::new(engine), ExtractionOptions::default())
    }

    fn pdf_bytes() -> Vec<u8> {
        b"%PDF-1.5 placeholder".to_vec()
    }

    #[tokio::test]
    async fn extracts_pages_in_order() {
        let pages: Vec<String> = (1..=5).map(|i| format!("Page {i}. {BODY}")).collect();
        let engine = MemoryEngine::from_texts(pages);
        let ex = Extractor::new(
            Arc::new(engine),
            ExtractionOptions::builder().max_concurrency(2).build().unwrap(),
        );
        let result = ex.extract(pdf_bytes()).await.unwrap();
        assert_eq!(result.page_count, 5);
        assert_eq!(result.engine_used, "memory");
        assert_eq!(result.per_page_durations_ms.len(), 5);
        assert!(result.timed_out_pages.is_empty());
        let positions: Vec<usize> = (1..=5)
            .map(|i| result.raw_text.find(&format!("Page {i}.")).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(result.raw_text.contains("[[PAGE 2]]"));
        assert_eq!(result.text_length, result.raw_text.chars().count());
    }

    #[tokio::test]
    async fn rejects_oversized_input() {
        let ex = Extractor::new(
            Arc::new(MemoryEngine::from_texts([BODY])),
            ExtractionOptions::builder().max_size_bytes(4).build().unwrap(),
        );
        let err = ex.extract(pdf_bytes()).await.unwrap_err();
        assert!(matches!(err, PipelineError::FileTooLarge { max: 4, .. }));
    }

    #[tokio::test]
    async fn password_handling() {
        let engine = MemoryEngine::from_texts([BODY]).with_password("s3cret");

        let err = extractor(engine.clone()).extract(pdf_bytes()).await.unwrap_err();
        assert!(matches!(err, PipelineError::PasswordRequired));

        let wrong = ExtractionOptions::builder().password("guess").build().unwrap();
        let err = Extractor::new(Arc::new(engine.clone()), wrong)
            .extract(pdf_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::PasswordInvalid));

        let right = ExtractionOptions::builder().password("s3cret").build().unwrap();
        let ok = Extractor::new(Arc::new(engine), right)
            .extract(pdf_bytes())
            .await
            .unwrap();
        assert_eq!(ok.page_count, 1);
    }

    #[tokio::test]
    async fn corrupt_input_is_parse_failed() {
        let engine = MemoryEngine::from_texts([BODY]).failing_open("invalid cross-reference table");
        let err = extractor(engine).extract(pdf_bytes()).await.unwrap_err();
        match err {
            PipelineError::ParseFailed { page, cause } => {
                assert_eq!(page, None);
                assert!(cause.unwrap().contains("cross-reference"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn too_many_pages() {
        let engine = MemoryEngine::from_texts([BODY, BODY, BODY]);
        let ex = Extractor::new(
            Arc::new(engine.clone()),
            ExtractionOptions::builder().max_pages(2).build().unwrap(),
        );
        let err = ex.extract(pdf_bytes()).await.unwrap_err();
        assert!(matches!(err, PipelineError::TooManyPages { count: 3, max: 2 }));
        assert_eq!(engine.close_count(), 1);
    }

    #[tokio::test]
    async fn single_letter_page_is_text_empty() {
        let err = extractor(MemoryEngine::from_texts(["X"]))
            .extract(pdf_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::TextEmpty { length: 1 }));
    }

    #[tokio::test]
    async fn punctuation_only_text_is_text_empty() {
        let noise = "-. ".repeat(40);
        let err = extractor(MemoryEngine::from_texts([noise]))
            .extract(pdf_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::TextEmpty { .. }));
    }

    #[tokio::test]
    async fn slow_page_is_replaced_by_placeholder() {
        let engine = MemoryEngine::new(vec![
            MemoryPage::text(BODY),
            MemoryPage::text("never seen").with_delay(Duration::from_millis(1200)),
            MemoryPage::text(BODY),
        ]);
        let ex = Extractor::new(
            Arc::new(engine),
            ExtractionOptions::builder().per_page_timeout_ms(200).build().unwrap(),
        );
        let result = ex.extract(pdf_bytes()).await.unwrap();
        assert_eq!(result.timed_out_pages, vec![2]);
        assert!(result.raw_text.contains("[page 2: text extraction timed out]"));
        assert!(!result.raw_text.contains("never seen"));
        assert_eq!(result.page_errors[0].code(), "PAGE_TIMEOUT");
    }

    #[tokio::test]
    async fn failing_page_aborts_with_page_number() {
        let engine = MemoryEngine::new(vec![
            MemoryPage::text(BODY),
            MemoryPage::text(BODY).failing("content stream is corrupted"),
        ]);
        let err = extractor(engine.clone()).extract(pdf_bytes()).await.unwrap_err();
        assert!(matches!(err, PipelineError::ParseFailed { page: Some(2), .. }));
        assert_eq!(engine.close_count(), 1);
    }

    #[tokio::test]
    async fn metadata_failure_is_not_fatal() {
        let engine = MemoryEngine::from_texts([BODY]).without_metadata();
        let result = extractor(engine.clone()).extract(pdf_bytes()).await.unwrap();
        assert_eq!(result.metadata, DocumentMetadata::default());
        assert_eq!(engine.close_count(), 1);
    }

    #[tokio::test]
    async fn empty_page_is_recorded() {
        let engine = MemoryEngine::from_texts([BODY, "   "]);
        let result = extractor(engine).extract(pdf_bytes()).await.unwrap();
        assert_eq!(result.page_errors, vec![PageError::NoText { page: 2 }]);
        assert_eq!(result.memory.input_bytes, pdf_bytes().len());
        assert_eq!(
            result.memory.estimated_peak_bytes,
            result.memory.input_bytes + result.memory.text_bytes + 2 * 1024
        );
    }
}
