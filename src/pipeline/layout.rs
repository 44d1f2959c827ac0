//! Layout scoring: estimate how much a document looks like a form.
//!
//! ## Why positional data?
//!
//! Administrative forms and contracts share vocabulary ("nom", "adresse",
//! "signature") but not geometry. Forms are made of short label fragments
//! lined up in a few columns, with checkboxes and trailing colons; contracts
//! are long justified lines. This module re-opens the document, reads every
//! positioned text fragment and turns those shapes into a bounded score.
//!
//! The score is a hand-tuned heuristic over a handful of densities, not a
//! trained model. [`compute_form_likelihood`] is a pure function of
//! [`FormSignals`] so its thresholds can be tested without a PDF.

use crate::config::LayoutOptions;
use crate::error::PipelineError;
use crate::pipeline::engine::{DocumentGuard, PageFragments, PdfEngine};
use crate::pipeline::extract::classify_open_error;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// A text fragment with a top-left origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    /// 1-indexed page number.
    pub page: usize,
    pub text: String,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A page whose fragments line up in several populated columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRegion {
    pub page: usize,
    /// Buckets holding at least `min_column_members` fragments.
    pub columns: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormIndicators {
    pub checkbox_count: usize,
    pub colon_label_count: usize,
    pub field_label_count: usize,
}

/// Normalised inputs to [`compute_form_likelihood`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FormSignals {
    /// Colon-terminated labels / fragments.
    pub colon_label_density: f64,
    /// Fragments naming a personal or administrative field / fragments.
    pub field_label_density: f64,
    pub checkbox_count: usize,
    /// Fragments of at most 30 characters / fragments.
    pub short_line_density: f64,
    /// Distinct x positions (per page, after bucketing) / fragments.
    pub unique_x_density: f64,
    /// Largest number of x buckets with at least 3 members on any page.
    pub column_count: usize,
}

/// Output of [`LayoutScorer::score`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutInfo {
    pub text_blocks: Vec<TextBlock>,
    pub headings: Vec<TextBlock>,
    pub table_like_regions: Vec<TableRegion>,
    pub form_indicators: FormIndicators,
    pub signals: FormSignals,
    /// In `[0, 1]`.
    pub form_likelihood: f64,
}

// ── Fragment classes ─────────────────────────────────────────────────────

const CHECKBOX_GLYPHS: &[char] = &[
    '☐', '☑', '☒', '□', '▢', '▣', '◻', '◼', '❏', '❐', '❑', '❒', '⬜', '🗹', '🗷',
];

static RE_FIELD_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:nom|prénom|prenom|nom de naissance|adresse|code postal|ville|commune|téléphone|telephone|tél|courriel|e-mail|email|date de naissance|lieu de naissance|nationalité|profession|situation familiale|numéro de sécurité sociale|n° de sécurité sociale|signature|fait à|name|first name|last name|surname|address|postal code|zip code|city|phone|date of birth|place of birth|nationality|occupation|social security number)\b",
    )
    .unwrap()
});

fn is_checkbox(text: &str) -> bool {
    text.chars().any(|c| CHECKBOX_GLYPHS.contains(&c))
}

fn is_colon_label(text: &str) -> bool {
    let t = text.trim();
    let len = t.chars().count();
    t.ends_with(':') && (3..=50).contains(&len)
}

fn is_field_label(text: &str) -> bool {
    RE_FIELD_LABEL.is_match(text)
}

// ── Scoring ──────────────────────────────────────────────────────────────

/// Combine layout signals into a form-likelihood in `[0, 1]`.
///
/// Contributions:
/// - colon-label density  >0.15 / >0.08 / >0.04 → +0.35 / +0.25 / +0.15
/// - field-label density  >0.10 / >0.05 / >0.02 → +0.25 / +0.15 / +0.08
/// - checkbox count       ≥10 / ≥5 / ≥2         → +0.25 / +0.15 / +0.08
/// - short-line density   >0.6 / >0.4 / >0.25   → +0.15 / +0.10 / +0.05
/// - unique-x density <0.15 with ≥3 columns → +0.15, <0.25 with ≥2 → +0.08
///
/// Numbered-article contracts have many "Article N :" lines but almost no
/// field names; that combination subtracts 0.10.
pub fn compute_form_likelihood(s: &FormSignals) -> f64 {
    let mut score = 0.0;

    score += tier(s.colon_label_density, &[(0.15, 0.35), (0.08, 0.25), (0.04, 0.15)]);
    score += tier(s.field_label_density, &[(0.10, 0.25), (0.05, 0.15), (0.02, 0.08)]);
    score += match s.checkbox_count {
        n if n >= 10 => 0.25,
        n if n >= 5 => 0.15,
        n if n >= 2 => 0.08,
        _ => 0.0,
    };
    score += tier(s.short_line_density, &[(0.6, 0.15), (0.4, 0.10), (0.25, 0.05)]);
    if s.unique_x_density < 0.15 && s.column_count >= 3 {
        score += 0.15;
    } else if s.unique_x_density < 0.25 && s.column_count >= 2 {
        score += 0.08;
    }

    if s.colon_label_density > 0.15 && s.field_label_density < 0.015 {
        score -= 0.10;
    }
    score.clamp(0.0, 1.0)
}

/// First `(threshold, weight)` whose threshold `value` strictly exceeds.
fn tier(value: f64, tiers: &[(f64, f64)]) -> f64 {
    tiers
        .iter()
        .find(|(threshold, _)| value > *threshold)
        .map(|(_, weight)| *weight)
        .unwrap_or(0.0)
}

/// Sizes of the x buckets of one page. A new bucket starts when a position
/// is more than `tolerance` to the right of the current bucket's first member.
fn bucket_sizes(mut xs: Vec<f32>, tolerance: f32) -> Vec<usize> {
    xs.sort_by(|a, b| a.total_cmp(b));
    let mut sizes = Vec::new();
    let mut start: Option<f32> = None;
    for x in xs {
        match start {
            Some(s) if x - s <= tolerance => {
                if let Some(last) = sizes.last_mut() {
                    *last += 1;
                }
            }
            _ => {
                start = Some(x);
                sizes.push(1);
            }
        }
    }
    sizes
}

/// Pure analysis of positioned fragments (one entry per page, in order).
pub fn analyze_pages(pages: &[PageFragments], options: &LayoutOptions) -> LayoutInfo {
    let mut text_blocks = Vec::new();
    let mut headings = Vec::new();
    let mut table_like_regions = Vec::new();
    let mut indicators = FormIndicators::default();
    let mut short_lines = 0usize;
    let mut unique_x = 0usize;
    let mut column_count = 0usize;

    for (i, page) in pages.iter().enumerate() {
        let page_num = i + 1;
        let mut xs = Vec::with_capacity(page.fragments.len());
        for f in &page.fragments {
            let text = f.text.trim();
            if text.is_empty() {
                continue;
            }
            let block = TextBlock {
                page: page_num,
                text: text.to_string(),
                x: f.left,
                y: page.page_height - f.top,
                width: f.width,
                height: f.height,
            };
            if block.height > options.heading_min_height {
                headings.push(block.clone());
            }
            if is_checkbox(text) {
                indicators.checkbox_count += 1;
            }
            if is_colon_label(text) {
                indicators.colon_label_count += 1;
            }
            if is_field_label(text) {
                indicators.field_label_count += 1;
            }
            if text.chars().count() <= 30 {
                short_lines += 1;
            }
            xs.push(block.x);
            text_blocks.push(block);
        }

        let sizes = bucket_sizes(xs, options.x_tolerance);
        unique_x += sizes.len();
        column_count = column_count.max(sizes.iter().filter(|n| **n >= 3).count());
        let populated = sizes
            .iter()
            .filter(|n| **n >= options.min_column_members)
            .count();
        if populated >= options.min_table_columns {
            table_like_regions.push(TableRegion {
                page: page_num,
                columns: populated,
            });
        }
    }

    let total = text_blocks.len();
    let density = |n: usize| if total == 0 { 0.0 } else { n as f64 / total as f64 };
    let signals = FormSignals {
        colon_label_density: density(indicators.colon_label_count),
        field_label_density: density(indicators.field_label_count),
        checkbox_count: indicators.checkbox_count,
        short_line_density: density(short_lines),
        unique_x_density: if total == 0 { 1.0 } else { density(unique_x) },
        column_count,
    };
    let form_likelihood = compute_form_likelihood(&signals);

    LayoutInfo {
        text_blocks,
        headings,
        table_like_regions,
        form_indicators: indicators,
        signals,
        form_likelihood,
    }
}

// ── Scorer ───────────────────────────────────────────────────────────────

/// Re-opens a PDF buffer and scores its layout.
#[derive(Clone)]
pub struct LayoutScorer {
    engine: Arc<dyn PdfEngine>,
    options: LayoutOptions,
}

impl LayoutScorer {
    pub fn new(engine: Arc<dyn PdfEngine>, options: LayoutOptions) -> Self {
        Self { engine, options }
    }

    /// Read every page's fragments and compute [`LayoutInfo`].
    ///
    /// Independent of the extractor: the buffer is opened again here.
    pub async fn score(&self, bytes: impl Into<Arc<[u8]>>) -> Result<LayoutInfo, PipelineError> {
        let start = Instant::now();
        let bytes: Arc<[u8]> = bytes.into();
        let engine = Arc::clone(&self.engine);
        let password = self.options.password.clone();

        let pages = tokio::task::spawn_blocking(move || {
            let handle = engine
                .open(bytes, password.as_deref())
                .map_err(|e| classify_open_error(&e, password.is_some()))?;
            let guard = DocumentGuard::new(handle);
            let handle = guard.handle();
            let pages = (0..handle.page_count())
                .map(|i| {
                    handle
                        .page_fragments(i)
                        .map_err(|e| PipelineError::ParseFailed {
                            page: Some(i + 1),
                            cause: Some(e.message),
                        })
                })
                .collect::<Result<Vec<_>, _>>();
            pages
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("Layout task panicked: {e}")))??;

        let info = analyze_pages(&pages, &self.options);
        debug!(signals = ?info.signals, "layout signals");
        info!(
            pages = pages.len(),
            fragments = info.text_blocks.len(),
            tables = info.table_like_regions.len(),
            form_likelihood = info.form_likelihood,
            duration_ms = start.elapsed().as_millis() as u64,
            "layout scored"
        );
        Ok(info)
    }
}
