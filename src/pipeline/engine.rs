//! PDF engine abstraction: open a byte buffer, read page text and positioned
//! text fragments.
//!
//! ## Why a trait?
//!
//! The extractor and layout scorer only need four operations (page count,
//! metadata, page text, page fragments). Hiding pdfium behind
//! [`PdfEngine`] lets tests drive both stages with [`MemoryEngine`], where
//! page latency, encryption and failures are scripted, without a pdfium
//! shared library on the machine.
//!
//! ## Why re-open per call?
//!
//! A `pdfium_render` document borrows the library binding it was loaded
//! from, so it cannot be stored next to that binding in a `'static` handle.
//! [`PdfiumDocument`] keeps the shared byte buffer instead and loads the
//! document inside each blocking call. Callers always run these calls on
//! `tokio::task::spawn_blocking`.

use crate::error::EngineError;
use crate::output::DocumentMetadata;
use pdfium_render::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One text fragment with its bounding box in PDF user space
/// (origin bottom-left, `top` is the upper edge).
#[derive(Debug, Clone, PartialEq)]
pub struct RawFragment {
    pub text: String,
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl RawFragment {
    pub fn new(text: impl Into<String>, left: f32, top: f32, width: f32, height: f32) -> Self {
        Self {
            text: text.into(),
            left,
            top,
            width,
            height,
        }
    }
}

/// All fragments of one page plus the page height needed to flip y.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageFragments {
    pub page_height: f32,
    pub fragments: Vec<RawFragment>,
}

/// A PDF backend.
pub trait PdfEngine: Send + Sync {
    /// Short engine identifier, reported as `engine_used`.
    fn name(&self) -> &'static str;

    /// Open a document. Blocking; run on `spawn_blocking`.
    ///
    /// Errors carry the backend's message verbatim so the caller can tell
    /// password failures from corrupt input.
    fn open(
        &self,
        bytes: Arc<[u8]>,
        password: Option<&str>,
    ) -> Result<Arc<dyn PdfDocumentHandle>, EngineError>;
}

/// An open document. Every method is blocking.
pub trait PdfDocumentHandle: Send + Sync {
    fn page_count(&self) -> usize;

    fn metadata(&self) -> Result<DocumentMetadata, EngineError>;

    /// Plain text of a page (0-indexed).
    fn page_text(&self, index: usize) -> Result<String, EngineError>;

    /// Positioned text fragments of a page (0-indexed).
    fn page_fragments(&self, index: usize) -> Result<PageFragments, EngineError>;

    /// Release backend resources. Idempotent.
    fn close(&self);
}

/// Closes the wrapped document when dropped, on success and error paths alike.
pub struct DocumentGuard {
    handle: Arc<dyn PdfDocumentHandle>,
}

impl DocumentGuard {
    pub fn new(handle: Arc<dyn PdfDocumentHandle>) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &Arc<dyn PdfDocumentHandle> {
        &self.handle
    }
}

impl Drop for DocumentGuard {
    fn drop(&mut self) {
        self.handle.close();
    }
}

// ── pdfium ───────────────────────────────────────────────────────────────

/// The production engine, backed by pdfium via `pdfium-render`.
///
/// The pdfium shared library is located (and downloaded on first use) by
/// `pdfium-auto`; a missing library surfaces as an [`EngineError`] on open.
#[derive(Debug, Default, Clone)]
pub struct PdfiumEngine;

impl PdfiumEngine {
    pub fn new() -> Self {
        Self
    }
}

fn bind() -> Result<Pdfium, EngineError> {
    pdfium_auto::bind_pdfium_silent()
        .map_err(|e| EngineError::new(format!("pdfium unavailable: {e}")))
}

impl PdfEngine for PdfiumEngine {
    fn name(&self) -> &'static str {
        "pdfium"
    }

    fn open(
        &self,
        bytes: Arc<[u8]>,
        password: Option<&str>,
    ) -> Result<Arc<dyn PdfDocumentHandle>, EngineError> {
        let pdfium = bind()?;
        let page_count = {
            let document = pdfium
                .load_pdf_from_byte_slice(&bytes, password)
                .map_err(|e| EngineError::new(format!("{e:?}")))?;
            document.pages().len() as usize
        };
        debug!(page_count, "pdfium opened document");
        Ok(Arc::new(PdfiumDocument {
            bytes,
            password: password.map(str::to_string),
            page_count,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Handle returned by [`PdfiumEngine::open`].
pub struct PdfiumDocument {
    bytes: Arc<[u8]>,
    password: Option<String>,
    page_count: usize,
    closed: AtomicBool,
}

impl PdfiumDocument {
    fn with_document<T>(
        &self,
        f: impl FnOnce(&PdfDocument<'_>) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::new("document already closed"));
        }
        let pdfium = bind()?;
        let document = pdfium
            .load_pdf_from_byte_slice(&self.bytes, self.password.as_deref())
            .map_err(|e| EngineError::new(format!("{e:?}")))?;
        f(&document)
    }

    fn page_index(&self, index: usize) -> Result<u16, EngineError> {
        if index >= self.page_count {
            return Err(EngineError::new(format!(
                "page index {index} out of range (pages={})",
                self.page_count
            )));
        }
        u16::try_from(index).map_err(|_| EngineError::new(format!("page index {index} too large")))
    }
}

impl PdfDocumentHandle for PdfiumDocument {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn metadata(&self) -> Result<DocumentMetadata, EngineError> {
        self.with_document(|document| {
            let metadata = document.metadata();
            let get = |tag: PdfDocumentMetadataTagType| -> Option<String> {
                metadata.get(tag).and_then(|t| {
                    let v = t.value().trim().to_string();
                    (!v.is_empty()).then_some(v)
                })
            };
            Ok(DocumentMetadata {
                title: get(PdfDocumentMetadataTagType::Title),
                author: get(PdfDocumentMetadataTagType::Author),
                producer: get(PdfDocumentMetadataTagType::Producer),
                creator: get(PdfDocumentMetadataTagType::Creator),
                created_at: get(PdfDocumentMetadataTagType::CreationDate),
            })
        })
    }

    fn page_text(&self, index: usize) -> Result<String, EngineError> {
        let idx = self.page_index(index)?;
        self.with_document(|document| {
            let page = document
                .pages()
                .get(idx)
                .map_err(|e| EngineError::new(format!("{e:?}")))?;
            let text = page
                .text()
                .map_err(|e| EngineError::new(format!("{e:?}")))?;
            Ok(text.all())
        })
    }

    fn page_fragments(&self, index: usize) -> Result<PageFragments, EngineError> {
        let idx = self.page_index(index)?;
        self.with_document(|document| {
            let page = document
                .pages()
                .get(idx)
                .map_err(|e| EngineError::new(format!("{e:?}")))?;
            let page_height = page.height().value;
            let text = page
                .text()
                .map_err(|e| EngineError::new(format!("{e:?}")))?;
            let fragments = text
                .segments()
                .iter()
                .filter_map(|segment| {
                    let value = segment.text();
                    if value.trim().is_empty() {
                        return None;
                    }
                    let bounds = segment.bounds();
                    Some(RawFragment {
                        text: value,
                        left: bounds.left().value,
                        top: bounds.top().value,
                        width: bounds.width().value,
                        height: bounds.height().value,
                    })
                })
                .collect();
            Ok(PageFragments {
                page_height,
                fragments,
            })
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ── In-memory engine ─────────────────────────────────────────────────────

/// One scripted page for [`MemoryEngine`].
#[derive(Debug, Clone, Default)]
pub struct MemoryPage {
    pub text: String,
    pub fragments: PageFragments,
    /// Blocking sleep before `page_text` returns.
    pub delay: Option<Duration>,
    /// When set, `page_text` and `page_fragments` fail with this message.
    pub failure: Option<String>,
}

impl MemoryPage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_fragments(mut self, page_height: f32, fragments: Vec<RawFragment>) -> Self {
        self.fragments = PageFragments {
            page_height,
            fragments,
        };
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }
}

/// Engine over pre-extracted pages.
///
/// Ignores the byte buffer. Useful in tests and when text was already
/// extracted upstream.
#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    pages: Arc<Vec<MemoryPage>>,
    metadata: Option<DocumentMetadata>,
    password: Option<String>,
    open_failure: Option<String>,
    closes: Arc<AtomicUsize>,
}

impl MemoryEngine {
    pub fn new(pages: Vec<MemoryPage>) -> Self {
        Self {
            pages: Arc::new(pages),
            metadata: Some(DocumentMetadata::default()),
            ..Self::default()
        }
    }

    pub fn from_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(MemoryPage::text).collect())
    }

    pub fn with_metadata(mut self, metadata: DocumentMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Make metadata reads fail.
    pub fn without_metadata(mut self) -> Self {
        self.metadata = None;
        self
    }

    /// Require this password on open.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Make every open fail with `message`.
    pub fn failing_open(mut self, message: impl Into<String>) -> Self {
        self.open_failure = Some(message.into());
        self
    }

    /// Number of documents opened by this engine that have been closed.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl PdfEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(
        &self,
        _bytes: Arc<[u8]>,
        password: Option<&str>,
    ) -> Result<Arc<dyn PdfDocumentHandle>, EngineError> {
        if let Some(msg) = &self.open_failure {
            return Err(EngineError::new(msg.clone()));
        }
        if let Some(expected) = &self.password {
            match password {
                None => return Err(EngineError::new("document requires a password")),
                Some(p) if p != expected => return Err(EngineError::new("incorrect password")),
                Some(_) => {}
            }
        }
        Ok(Arc::new(MemoryDocument {
            pages: Arc::clone(&self.pages),
            metadata: self.metadata.clone(),
            closed: AtomicBool::new(false),
            closes: Arc::clone(&self.closes),
        }))
    }
}

struct MemoryDocument {
    pages: Arc<Vec<MemoryPage>>,
    metadata: Option<DocumentMetadata>,
    closed: AtomicBool,
    closes: Arc<AtomicUsize>,
}

impl MemoryDocument {
    fn page(&self, index: usize) -> Result<&MemoryPage, EngineError> {
        let page = self
            .pages
            .get(index)
            .ok_or_else(|| EngineError::new(format!("page index {index} out of range")))?;
        match &page.failure {
            Some(msg) => Err(EngineError::new(msg.clone())),
            None => Ok(page),
        }
    }
}

impl PdfDocumentHandle for MemoryDocument {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn metadata(&self) -> Result<DocumentMetadata, EngineError> {
        self.metadata
            .clone()
            .ok_or_else(|| EngineError::new("metadata dictionary unreadable"))
    }

    fn page_text(&self, index: usize) -> Result<String, EngineError> {
        let page = self.page(index)?;
        if let Some(delay) = page.delay {
            std::thread::sleep(delay);
        }
        Ok(page.text.clone())
    }

    fn page_fragments(&self, index: usize) -> Result<PageFragments, EngineError> {
        Ok(self.page(index)?.fragments.clone())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}
