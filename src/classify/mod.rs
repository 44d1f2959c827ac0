//! Contract-type classification.
//!
//! ## Decision order
//!
//! 1. **Form override**: a layout form-likelihood at or above
//!    `form_override_threshold` labels the document `administrative-form`
//!    without looking at the text.
//! 2. **Heuristic** ([`heuristic::detect`]): accepted as-is when confident.
//! 3. **Rate limit**: the LLM fallback spends one [`TokenBucket`] token; an
//!    empty bucket keeps the heuristic answer.
//! 4. **LLM**: a short excerpt plus the heuristic hint. Any failure keeps
//!    the heuristic answer, so [`TypeClassifier::classify`] never fails.

pub mod heuristic;
pub mod rate_limit;

pub use rate_limit::TokenBucket;

use crate::config::ClassifierConfig;
use crate::pipeline::llm::{extract_json_object, CompletionRequest, LlmClient};
use crate::prompts::{classifier_system_prompt, classifier_user_prompt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lines taken from the top of the document for the LLM excerpt.
const EXCERPT_HEAD_LINES: usize = 80;
/// Keyword-bearing lines appended to the excerpt.
const EXCERPT_KEYWORD_LINES: usize = 10;
/// Keyword lines may use up to `1 / EXCERPT_KEYWORD_SHARE` of the excerpt.
const EXCERPT_KEYWORD_SHARE: usize = 3;

/// Closed set of contract categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContractType {
    TermsOfService,
    Freelance,
    Employment,
    Nda,
    Quote,
    Partnership,
    AdministrativeForm,
    TabularCommercial,
    Other,
}

impl ContractType {
    pub const ALL: [ContractType; 9] = [
        ContractType::TermsOfService,
        ContractType::Freelance,
        ContractType::Employment,
        ContractType::Nda,
        ContractType::Quote,
        ContractType::Partnership,
        ContractType::AdministrativeForm,
        ContractType::TabularCommercial,
        ContractType::Other,
    ];

    /// Stable identifier, identical to the serde form.
    pub fn as_str(self) -> &'static str {
        match self {
            ContractType::TermsOfService => "terms-of-service",
            ContractType::Freelance => "freelance",
            ContractType::Employment => "employment",
            ContractType::Nda => "nda",
            ContractType::Quote => "quote",
            ContractType::Partnership => "partnership",
            ContractType::AdministrativeForm => "administrative-form",
            ContractType::TabularCommercial => "tabular-commercial",
            ContractType::Other => "other",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ContractType::TermsOfService => "terms of service, terms of use, general conditions of sale",
            ContractType::Freelance => "service or consulting agreement with an independent contractor",
            ContractType::Employment => "employment contract or offer between employer and employee",
            ContractType::Nda => "non-disclosure or confidentiality agreement",
            ContractType::Quote => "quote, estimate or commercial proposal awaiting acceptance",
            ContractType::Partnership => "partnership, joint venture or shareholders agreement",
            ContractType::AdministrativeForm => "administrative fill-in form (CERFA, application, declaration)",
            ContractType::TabularCommercial => "price list, order form or other commercial table",
            ContractType::Other => "none of the above",
        }
    }

    /// Parse a label leniently: case, `_` and spaces are ignored and a few
    /// common aliases are accepted.
    pub fn from_label(label: &str) -> Option<Self> {
        let norm = label
            .trim()
            .to_lowercase()
            .replace(['_', ' '], "-");
        let found = match norm.as_str() {
            "terms-of-service" | "terms" | "tos" | "cgu" | "cgv" | "terms-and-conditions" => {
                ContractType::TermsOfService
            }
            "freelance" | "contractor" | "consulting" | "services" => ContractType::Freelance,
            "employment" | "employment-contract" => ContractType::Employment,
            "nda" | "non-disclosure" | "non-disclosure-agreement" | "confidentiality" => {
                ContractType::Nda
            }
            "quote" | "quotation" | "estimate" | "devis" => ContractType::Quote,
            "partnership" => ContractType::Partnership,
            "administrative-form" | "form" | "cerfa" => ContractType::AdministrativeForm,
            "tabular-commercial" | "price-list" | "purchase-order" => ContractType::TabularCommercial,
            "other" => ContractType::Other,
            _ => return None,
        };
        Some(found)
    }
}

impl fmt::Display for ContractType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContractType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_label(s).ok_or_else(|| format!("unknown contract type '{s}'"))
    }
}

/// Which stage produced a [`DetectionResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionSource {
    Heuristic,
    Llm,
    Hybrid,
}

/// A contract-type decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    #[serde(rename = "type")]
    pub contract_type: ContractType,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub source: DetectionSource,
    /// At most five short excerpts supporting the decision.
    pub evidence: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LlmVerdict {
    #[serde(rename = "type")]
    contract_type: String,
    confidence: f64,
    #[serde(default)]
    reason: Option<String>,
}

/// Hybrid heuristic + LLM classifier.
pub struct TypeClassifier {
    config: ClassifierConfig,
    limiter: Arc<TokenBucket>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl TypeClassifier {
    /// Heuristic-only classifier sharing `limiter` with other instances.
    pub fn new(config: ClassifierConfig, limiter: Arc<TokenBucket>) -> Self {
        Self {
            config,
            limiter,
            llm: None,
        }
    }

    /// Classifier with its own bucket sized from `config`.
    pub fn from_config(config: ClassifierConfig) -> Self {
        let limiter = Arc::new(TokenBucket::new(
            config.rate_limit_capacity,
            config.rate_limit_refill_per_sec,
        ));
        Self::new(config, limiter)
    }

    /// Enable the LLM fallback.
    pub fn with_llm(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(client);
        self
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Label `text`. `form_likelihood` comes from the layout scorer when
    /// it ran.
    pub async fn classify(&self, text: &str, form_likelihood: Option<f64>) -> DetectionResult {
        if let Some(score) = form_likelihood {
            if score >= self.config.form_override_threshold {
                info!(form_likelihood = score, "form layout detected, skipping text classification");
                return DetectionResult {
                    contract_type: ContractType::AdministrativeForm,
                    confidence: self.config.form_override_confidence,
                    source: DetectionSource::Heuristic,
                    evidence: vec![format!("form layout score {score:.2}")],
                    reason: Some("layout looks like a fill-in form".into()),
                };
            }
        }

        let offline = heuristic::detect(text);
        if offline.confidence >= self.config.heuristic_accept_threshold {
            debug!(
                contract_type = offline.contract_type.as_str(),
                confidence = offline.confidence,
                "heuristic accepted"
            );
            return offline;
        }

        let client = match (&self.llm, self.config.llm_enabled) {
            (Some(client), true) => Arc::clone(client),
            _ => return offline,
        };

        if !self.limiter.try_acquire() {
            warn!(
                contract_type = offline.contract_type.as_str(),
                "classification LLM rate limited, keeping heuristic"
            );
            return DetectionResult {
                reason: Some("rate limited: LLM fallback skipped".into()),
                ..offline
            };
        }

        let excerpt = build_excerpt(text, self.config.excerpt_max_chars);
        let request = CompletionRequest {
            system_prompt: classifier_system_prompt(),
            user_prompt: classifier_user_prompt(&excerpt, offline.contract_type, offline.confidence),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            json_mode: true,
        };

        let verdict = match client.complete(&request).await {
            Ok(reply) => match parse_verdict(&reply) {
                Some(v) => v,
                None => {
                    debug!("unusable classification reply, keeping heuristic");
                    return offline;
                }
            },
            Err(e) => {
                debug!(error = %e, "classification LLM failed, keeping heuristic");
                return offline;
            }
        };

        let result = self.combine(offline, verdict);
        info!(
            contract_type = result.contract_type.as_str(),
            confidence = result.confidence,
            source = ?result.source,
            "contract classified"
        );
        result
    }

    fn combine(&self, offline: DetectionResult, verdict: Verdict) -> DetectionResult {
        let (llm_type, llm_conf, llm_reason) = verdict;
        if llm_conf >= self.config.llm_trust_threshold {
            let evidence = if llm_type == offline.contract_type {
                offline.evidence
            } else {
                Vec::new()
            };
            return DetectionResult {
                contract_type: llm_type,
                confidence: llm_conf,
                source: DetectionSource::Llm,
                evidence,
                reason: llm_reason,
            };
        }

        if llm_type == offline.contract_type {
            return DetectionResult {
                contract_type: llm_type,
                confidence: (0.4 * offline.confidence + 0.6 * llm_conf).clamp(0.0, 1.0),
                source: DetectionSource::Hybrid,
                evidence: offline.evidence,
                reason: llm_reason,
            };
        }

        let note = format!(
            "heuristic and LLM disagree: heuristic {} ({:.2}), LLM {} ({:.2})",
            offline.contract_type, offline.confidence, llm_type, llm_conf
        );
        if llm_conf > offline.confidence {
            DetectionResult {
                contract_type: llm_type,
                confidence: llm_conf,
                source: DetectionSource::Hybrid,
                evidence: Vec::new(),
                reason: Some(note),
            }
        } else {
            DetectionResult {
                source: DetectionSource::Hybrid,
                reason: Some(note),
                ..offline
            }
        }
    }
}

/// Parsed LLM answer: label, clamped confidence, optional reason.
type Verdict = (ContractType, f64, Option<String>);

fn parse_verdict(reply: &str) -> Option<Verdict> {
    let verdict: LlmVerdict = serde_json::from_str(extract_json_object(reply)).ok()?;
    let contract_type = ContractType::from_label(&verdict.contract_type)?;
    if !verdict.confidence.is_finite() {
        return None;
    }
    Some((
        contract_type,
        verdict.confidence.clamp(0.0, 1.0),
        verdict.reason.filter(|r| !r.trim().is_empty()),
    ))
}

/// First lines of the document followed by keyword-bearing lines further
/// down, capped at `max_chars`.
///
/// Up to a third of the budget is kept for the keyword lines, so a long
/// opening cannot crowd them out.
pub fn build_excerpt(text: &str, max_chars: usize) -> String {
    let head: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(EXCERPT_HEAD_LINES)
        .collect();
    let mut keywords: Vec<&str> = Vec::new();
    for line in heuristic::keyword_lines(text, EXCERPT_KEYWORD_LINES * 4) {
        if keywords.len() >= EXCERPT_KEYWORD_LINES {
            break;
        }
        if !head.contains(&line) && !keywords.contains(&line) {
            keywords.push(line);
        }
    }

    let keyword_chars: usize = keywords.iter().map(|l| l.chars().count() + 1).sum();
    let reserved = keyword_chars.min(max_chars / EXCERPT_KEYWORD_SHARE);
    let mut excerpt = String::new();
    append_lines(&mut excerpt, &head, max_chars - reserved);
    append_lines(&mut excerpt, &keywords, max_chars);
    excerpt
}

/// Append whole lines while `out` stays within `limit` chars. A first line
/// longer than `limit` is cut.
fn append_lines(out: &mut String, lines: &[&str], limit: usize) {
    let mut len = out.chars().count();
    for line in lines {
        let needed = line.chars().count() + usize::from(!out.is_empty());
        if len + needed > limit {
            if out.is_empty() {
                out.extend(line.chars().take(limit));
            }
            break;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(line);
        len += needed;
    }
}
