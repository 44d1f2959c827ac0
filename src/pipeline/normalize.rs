//! Normalisation: deterministic cleanup of extracted contract text.
//!
//! ## Why normalise before prompting?
//!
//! Raw PDF text is noisy in ways that cost tokens and confuse models:
//! ligature glyphs, hyphenated line wraps, running headers repeated on
//! every page, page numbers, and hard line breaks in the middle of
//! sentences. This module removes that noise with cheap, deterministic
//! rules and never rewrites wording. Each rule is a pure function and is
//! tested on its own.
//!
//! ## Rule Order
//!
//! Page markers are split out first so header/footer detection can count
//! lines per page. Ligatures and hyphenation are fixed before lines are
//! compared, and whitespace is collapsed before the line-merge pass so that
//! merge decisions see trimmed lines. The minimum-length check runs before
//! truncation.

use crate::config::NormalizationOptions;
use crate::error::PipelineError;
use crate::output::{DocumentMetadata, Heading, NormalizationResult, NormalizationStats, Sections};
use crate::pipeline::PAGE_MARKER_PATTERN;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Applies the cleanup rules with configured length bounds.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    options: NormalizationOptions,
}

impl Normalizer {
    pub fn new(options: NormalizationOptions) -> Self {
        Self { options }
    }

    /// Clean `raw_text` (as produced by the extractor) into LLM-ready text.
    ///
    /// Rules (applied in order):
    /// 1. Split on page markers
    /// 2. Ligatures and typographic punctuation to ASCII
    /// 3. Join hyphenated line wraps
    /// 4. Bullet glyphs to `- `
    /// 5. Remove header/footer lines repeated on at least half the pages
    /// 6. Remove page-number lines and producer signatures
    /// 7. Collapse whitespace and merge wrapped lines
    /// 8. Strip control characters, normalise non-breaking spaces
    /// 9. Trim and enforce the minimum length
    /// 10. Truncate to the maximum length
    /// 11. Detect title and headings
    /// 12. Estimate tokens
    ///
    /// # Errors
    /// `TextTooShort` when fewer than `min_length` characters survive.
    pub fn normalize(
        &self,
        raw_text: &str,
        page_count: usize,
        metadata: &DocumentMetadata,
    ) -> Result<NormalizationResult, PipelineError> {
        let raw_length = raw_text.chars().count();

        let pages = split_pages(raw_text);
        let mut hyphen_joins = 0;
        let pages: Vec<String> = pages
            .into_iter()
            .map(|page| {
                let s = normalise_typography(&page);
                let (s, joins) = join_hyphenated_words(&s);
                hyphen_joins += joins;
                normalise_bullets(&s)
            })
            .collect();

        let before_chars: usize = pages.iter().map(|p| p.chars().count()).sum();
        let (pages, removed_chars) = if page_count >= 2 {
            remove_repeated_lines(&pages)
        } else {
            (pages, 0)
        };
        let header_footer_removed_ratio = if before_chars == 0 {
            0.0
        } else {
            removed_chars as f64 / before_chars as f64
        };

        let text = pages.join("\n\n");
        let text = remove_noise_lines(&text, metadata);
        let (text, lines_merged) = collapse_whitespace(&text);
        let text = strip_control_chars(&text);

        let text = text.trim();
        let clean_length = text.chars().count();
        if clean_length < self.options.min_length {
            return Err(PipelineError::TextTooShort {
                length: clean_length,
            });
        }

        let (clean_text, truncated) = truncate_chars(text, self.options.max_length);
        let clean_length = clean_text.chars().count();

        let mut sections = detect_sections(&clean_text);
        if sections.title.is_none() {
            sections.title = metadata
                .title
                .as_ref()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty());
        }

        let stats = NormalizationStats {
            raw_length,
            clean_length,
            header_footer_removed_ratio,
            hyphen_joins,
            lines_merged,
            truncated,
        };
        debug!(headings = sections.headings.len(), title = ?sections.title, "sections detected");
        info!(
            raw = raw_length,
            clean = clean_length,
            header_footer_ratio = header_footer_removed_ratio,
            hyphen_joins,
            lines_merged,
            truncated,
            "normalisation complete"
        );

        Ok(NormalizationResult {
            approx_token_count: clean_length.div_ceil(4),
            clean_text,
            stats,
            sections,
        })
    }
}

// ── Rule 1: Split on page markers ────────────────────────────────────────────

static RE_PAGE_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(PAGE_MARKER_PATTERN).unwrap());

fn split_pages(input: &str) -> Vec<String> {
    RE_PAGE_MARKER
        .split(input)
        .map(|p| p.trim_matches('\n').to_string())
        .collect()
}

// ── Rule 2: Ligatures and typographic punctuation ────────────────────────────

fn normalise_typography(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\u{FB00}' => out.push_str("ff"),
            '\u{FB01}' => out.push_str("fi"),
            '\u{FB02}' => out.push_str("fl"),
            '\u{FB03}' => out.push_str("ffi"),
            '\u{FB04}' => out.push_str("ffl"),
            '\u{FB05}' | '\u{FB06}' => out.push_str("st"),
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' => out.push('\''),
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{00AB}' | '\u{00BB}' => {
                out.push('"')
            }
            '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2015}'
            | '\u{2212}' => out.push('-'),
            '\u{2026}' => out.push_str("..."),
            other => out.push(other),
        }
    }
    out
}

// ── Rule 3: Join hyphenated line wraps ───────────────────────────────────────

static RE_HYPHEN_WRAP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\p{L})-[ \t]*\r?\n[ \t]*(\p{Ll})").unwrap());

fn join_hyphenated_words(input: &str) -> (String, usize) {
    let joins = RE_HYPHEN_WRAP.find_iter(input).count();
    if joins == 0 {
        return (input.to_string(), 0);
    }
    (RE_HYPHEN_WRAP.replace_all(input, "$1$2").to_string(), joins)
}

// ── Rule 4: Bullet glyphs ────────────────────────────────────────────────────

static RE_BULLET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*[•◦▪▫●○■►▶➢➤‣⁃∙·][ \t]*").unwrap());

fn normalise_bullets(input: &str) -> String {
    RE_BULLET.replace_all(input, "- ").to_string()
}

// ── Rule 5: Repeated header/footer lines ─────────────────────────────────────

/// Remove lines (6–99 chars once trimmed) found on at least half the pages.
///
/// A line must also recur on at least two pages: on a two-page document
/// half the pages is one page, which would strip every candidate line.
///
/// Returns the cleaned pages and the number of characters removed.
fn remove_repeated_lines(pages: &[String]) -> (Vec<String>, usize) {
    if pages.len() < 2 {
        return (pages.to_vec(), 0);
    }
    let threshold = pages.len().div_ceil(2).max(2);

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for page in pages {
        let unique: HashSet<&str> = page
            .lines()
            .map(str::trim)
            .filter(|l| is_repeat_candidate(l))
            .collect();
        for line in unique {
            *counts.entry(line).or_default() += 1;
        }
    }
    let repeated: HashSet<&str> = counts
        .into_iter()
        .filter(|(_, n)| *n >= threshold)
        .map(|(line, _)| line)
        .collect();
    if repeated.is_empty() {
        return (pages.to_vec(), 0);
    }
    debug!(lines = repeated.len(), "removing repeated header/footer lines");

    let mut removed = 0;
    let cleaned = pages
        .iter()
        .map(|page| {
            page.lines()
                .filter(|line| {
                    let drop = repeated.contains(line.trim());
                    if drop {
                        removed += line.chars().count();
                    }
                    !drop
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .collect();
    (cleaned, removed)
}

fn is_repeat_candidate(line: &str) -> bool {
    let len = line.chars().count();
    (6..=99).contains(&len)
}

// ── Rule 6: Page numbers and producer signatures ─────────────────────────────

static RE_PAGE_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:-\s*)?(?:(?:page|p\.)\s*)?\d{1,4}(?:\s*(?:/|of|sur)\s*\d{1,4})?(?:\s*-)?\s*$")
        .unwrap()
});

static RE_PRODUCER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(?:(?:created|generated|produced|converted|printed)\s+(?:with|by|using)\s+.*(?:pdf|word|writer|acrobat|docusign|latex|libreoffice)|(?:microsoft|adobe)\S*\s+(?:word|acrobat)\b.*|powered by \S+.*|docusign envelope id:.*)\s*$",
    )
    .unwrap()
});

fn remove_noise_lines(input: &str, metadata: &DocumentMetadata) -> String {
    let signatures: Vec<&str> = [metadata.producer.as_deref(), metadata.creator.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| s.len() >= 4)
        .collect();
    input
        .lines()
        .filter(|line| {
            let t = line.trim();
            !(RE_PAGE_NUMBER.is_match(t)
                || RE_PRODUCER.is_match(t)
                || signatures.iter().any(|s| t.eq_ignore_ascii_case(s)))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 7: Collapse whitespace and merge wrapped lines ──────────────────────

static RE_SPACE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]{2,}|\t").unwrap());
static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_whitespace(input: &str) -> (String, usize) {
    let s = input.replace("\r\n", "\n").replace('\r', "\n");
    let s = s
        .lines()
        .map(|l| RE_SPACE_RUNS.replace_all(l.trim_end(), " ").into_owned())
        .collect::<Vec<_>>()
        .join("\n");
    let s = RE_BLANK_LINES.replace_all(&s, "\n\n");
    merge_wrapped_lines(&s)
}

/// Merge single newlines between two non-empty lines into a space.
fn merge_wrapped_lines(input: &str) -> (String, usize) {
    let mut out: Vec<String> = Vec::new();
    let mut merges = 0;
    for line in input.split('\n') {
        if let Some(prev) = out.last_mut() {
            if !prev.is_empty() && !line.is_empty() && !breaks_before(prev, line) {
                prev.push(' ');
                prev.push_str(line.trim_start());
                merges += 1;
                continue;
            }
        }
        out.push(line.to_string());
    }
    (out.join("\n"), merges)
}

static RE_LIST_ITEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:[-*]|\d{1,3}[.)]|[a-z][.)]|\([a-z0-9]{1,4}\))\s+\S").unwrap());
static RE_NUMBERED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d{1,3}(?:\.\d{1,3})*)\.?\s+\S").unwrap());
static RE_MAJOR_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:ARTICLE|SECTION|CHAPITRE|PARTIE)\s+(?:\d+|[IVXLC]+)\b").unwrap());
static RE_MINOR_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:Clause|Article|Annexe|Annex|ANNEXE)\b").unwrap());

/// Whether a line break must be kept between `prev` and `next`.
fn breaks_before(prev: &str, next: &str) -> bool {
    if RE_LIST_ITEM.is_match(next)
        || RE_NUMBERED.is_match(next)
        || RE_MAJOR_HEADING.is_match(next)
        || RE_MINOR_HEADING.is_match(next)
        || is_all_caps(next)
    {
        return true;
    }
    let prev = prev.trim();
    if is_all_caps(prev) || RE_MAJOR_HEADING.is_match(prev) || prev.ends_with(':') {
        return true;
    }
    let short = prev.chars().count() <= 80;
    short
        && (is_title_case(prev)
            || (RE_NUMBERED.is_match(prev) && !prev.ends_with(['.', ';', ','])))
}

// ── Rule 8: Control characters and non-breaking spaces ───────────────────────

fn strip_control_chars(input: &str) -> String {
    let s: String = input
        .chars()
        .filter_map(|c| match c {
            '\u{00A0}' | '\u{2007}' | '\u{202F}' | '\u{2009}' | '\u{3000}' => Some(' '),
            '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}' => None,
            '\n' => Some('\n'),
            c if c.is_control() => None,
            c => Some(c),
        })
        .collect();
    RE_SPACE_RUNS.replace_all(&s, " ").into_owned()
}

// ── Rule 10: Truncate ────────────────────────────────────────────────────────

fn truncate_chars(input: &str, max: usize) -> (String, bool) {
    match input.char_indices().nth(max) {
        Some((byte_idx, _)) => (input[..byte_idx].to_string(), true),
        None => (input.to_string(), false),
    }
}

// ── Rule 11: Title and headings ──────────────────────────────────────────────

/// Lowercase words allowed inside a Title-Case line.
const TITLE_STOP_WORDS: &[&str] = &[
    "a", "an", "and", "as", "at", "by", "for", "from", "in", "into", "of", "on", "or", "the",
    "to", "with", "between", "under", "de", "des", "du", "la", "le", "les", "et", "en", "au",
    "aux", "pour", "sur", "avec", "dans", "par", "à",
];

fn is_all_caps(line: &str) -> bool {
    let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
    letters.len() >= 3 && letters.iter().all(|c| !c.is_lowercase())
}

fn is_title_case(line: &str) -> bool {
    let line = line.trim();
    if line.ends_with(['.', ';', ',']) {
        return false;
    }
    let words: Vec<&str> = line
        .split_whitespace()
        .filter(|w| w.chars().any(char::is_alphabetic))
        .collect();
    if words.len() < 2 {
        return false;
    }
    let starts_upper = |w: &str| {
        w.chars()
            .find(|c| c.is_alphabetic())
            .is_some_and(char::is_uppercase)
    };
    starts_upper(words[0])
        && words.iter().all(|w| {
            let bare = w.trim_matches(|c: char| !c.is_alphabetic()).to_lowercase();
            starts_upper(w) || TITLE_STOP_WORDS.contains(&bare.as_str())
        })
}

fn heading_level(line: &str) -> Option<u8> {
    let len = line.chars().count();
    if len == 0 || len > 120 {
        return None;
    }
    if RE_MAJOR_HEADING.is_match(line) {
        return Some(1);
    }
    if let Some(caps) = RE_NUMBERED.captures(line) {
        let segments = caps[1].split('.').count();
        return Some(if segments == 1 { 2 } else { 3 });
    }
    if RE_MINOR_HEADING.is_match(line) {
        return Some(3);
    }
    if len >= 5 && is_all_caps(line) {
        return Some(1);
    }
    if (10..=80).contains(&len) && is_title_case(line) {
        return Some(2);
    }
    None
}

fn detect_sections(text: &str) -> Sections {
    let mut title = None;
    let mut headings = Vec::new();
    for (line_index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if title.is_none() {
            let len = line.chars().count();
            if (5..=100).contains(&len) && (is_all_caps(line) || is_title_case(line)) {
                title = Some(line.to_string());
            }
        }
        if let Some(level) = heading_level(line) {
            headings.push(Heading {
                level,
                text: line.to_string(),
                line_index,
            });
        }
    }
    Sections { title, headings }
}

// ── Tests ────────────────────────────────────────────────────────────────────
