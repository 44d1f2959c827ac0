//! Result records produced by the document stages.
//!
//! All records are plain serde-serialisable data so callers can log them,
//! return them from an API, or persist them without conversion.

use crate::error::PageError;
use serde::{Deserialize, Serialize};

/// Document-level metadata read from the PDF info dictionary.
///
/// Every field is optional; metadata extraction is best-effort and a
/// failure yields `DocumentMetadata::default()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub producer: Option<String>,
    pub creator: Option<String>,
    /// Raw creation date as stored in the document (e.g. `D:20240131120000Z`).
    pub created_at: Option<String>,
}

/// Memory accounting for a single extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Size of the input buffer in bytes.
    pub input_bytes: usize,
    /// Size of the combined extracted text in bytes.
    pub text_bytes: usize,
    /// Rough peak estimate: input + text + 1 KiB per page.
    pub estimated_peak_bytes: usize,
}

impl MemoryStats {
    pub fn estimate(input_bytes: usize, text_bytes: usize, page_count: usize) -> Self {
        Self {
            input_bytes,
            text_bytes,
            estimated_peak_bytes: input_bytes + text_bytes + page_count * 1024,
        }
    }
}

/// Output of [`crate::pipeline::extract::Extractor::extract`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    /// Page texts in page order, separated by page-boundary markers.
    pub raw_text: String,
    pub page_count: usize,
    /// Character count of `raw_text`.
    pub text_length: usize,
    pub metadata: DocumentMetadata,
    /// Name of the engine that produced the text (e.g. `"pdfium"`).
    pub engine_used: String,
    /// Wall-clock extraction time per page, in page order.
    pub per_page_durations_ms: Vec<u64>,
    /// 1-indexed page numbers replaced by a placeholder after timing out.
    pub timed_out_pages: Vec<usize>,
    /// Non-fatal page errors (timeouts and empty pages).
    pub page_errors: Vec<PageError>,
    pub total_duration_ms: u64,
    pub memory: MemoryStats,
}

/// Counters reported by [`crate::pipeline::normalize::Normalizer`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizationStats {
    pub raw_length: usize,
    pub clean_length: usize,
    /// Fraction of characters removed as repeated header/footer lines.
    pub header_footer_removed_ratio: f64,
    pub hyphen_joins: usize,
    pub lines_merged: usize,
    pub truncated: bool,
}

/// A detected heading in the cleaned text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heading {
    /// 1 (article/part), 2 (section) or 3 (clause).
    pub level: u8,
    pub text: String,
    /// 0-indexed line number within `clean_text`.
    pub line_index: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sections {
    pub title: Option<String>,
    pub headings: Vec<Heading>,
}

/// Output of [`crate::pipeline::normalize::Normalizer::normalize`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizationResult {
    pub clean_text: String,
    /// `ceil(clean_length / 4)`.
    pub approx_token_count: usize,
    pub stats: NormalizationStats,
    pub sections: Sections,
}

/// What survives of an [`ExtractionResult`] once its raw text has been
/// normalised and dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionSummary {
    pub page_count: usize,
    pub metadata: DocumentMetadata,
    pub engine_used: String,
    pub timed_out_pages: Vec<usize>,
    pub total_duration_ms: u64,
    pub memory: MemoryStats,
}

impl From<ExtractionResult> for ExtractionSummary {
    fn from(r: ExtractionResult) -> Self {
        Self {
            page_count: r.page_count,
            metadata: r.metadata,
            engine_used: r.engine_used,
            timed_out_pages: r.timed_out_pages,
            total_duration_ms: r.total_duration_ms,
            memory: r.memory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_estimate_adds_one_kib_per_page() {
        let m = MemoryStats::estimate(10_000, 2_000, 3);
        assert_eq!(m.estimated_peak_bytes, 10_000 + 2_000 + 3 * 1024);
    }

    #[test]
    fn summary_drops_raw_text() {
        let r = ExtractionResult {
            raw_text: "hello".into(),
            page_count: 1,
            text_length: 5,
            metadata: DocumentMetadata::default(),
            engine_used: "memory".into(),
            per_page_durations_ms: vec![3],
            timed_out_pages: vec![],
            page_errors: vec![],
            total_duration_ms: 4,
            memory: MemoryStats::estimate(100, 5, 1),
        };
        let s = ExtractionSummary::from(r);
        let json = serde_json::to_string(&s).unwrap();
        assert!(!json.contains("hello"));
        assert_eq!(s.page_count, 1);
    }
}
