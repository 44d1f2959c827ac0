//! Paid contract analysis: response schema, validation and the repair loop.
//!
//! ## Why validate by hand?
//!
//! A plain `serde_json::from_str::<AnalysisPayload>` stops at the first
//! problem. The repair prompt is far more effective when it lists *every*
//! problem at once, so [`validate_payload`] walks the JSON value and
//! accumulates human-readable errors before building the typed payload.
//!
//! ## Repair loop
//!
//! ```text
//! attempt 0 ──invalid──▶ repair 1 ──invalid──▶ repair 2 ──invalid──▶ AnalysisInvalid
//!     │                     │                     │
//!     └──valid──────────────┴──valid──────────────┴──▶ AnalysisPayload
//! ```
//!
//! Transport failures (429, 5xx) are retried inside each attempt by
//! [`complete_with_retry`] and do not consume repair attempts.

use crate::classify::ContractType;
use crate::config::AnalysisConfig;
use crate::error::PipelineError;
use crate::pipeline::llm::{complete_with_retry, extract_json_object, CompletionRequest, LlmClient};
use crate::prompts::{analysis_user_prompt, repair_prompt, ANALYSIS_SYSTEM_PROMPT};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Clauses accepted in one analysis.
pub const MAX_CLAUSES: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// One reviewed clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    pub title: String,
    pub risk_level: RiskLevel,
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

/// Structured analysis returned to the client and stored in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisPayload {
    pub summary: String,
    pub contract_type: ContractType,
    pub parties: Vec<String>,
    /// 0 (no risk) to 100 (do not sign).
    pub risk_score: u8,
    pub clauses: Vec<Clause>,
    pub red_flags: Vec<String>,
    pub missing_clauses: Vec<String>,
}

// ── Validation ───────────────────────────────────────────────────────────

fn string_list(obj: &Map<String, Value>, field: &str, errors: &mut Vec<String>) -> Vec<String> {
    match obj.get(field) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| match item {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Value::String(_) => None,
                _ => {
                    errors.push(format!("{field}[{i}] must be a string"));
                    None
                }
            })
            .collect(),
        Some(_) => {
            errors.push(format!("{field} must be an array of strings"));
            Vec::new()
        }
    }
}

fn clause(i: usize, value: &Value, errors: &mut Vec<String>) -> Option<Clause> {
    let Some(obj) = value.as_object() else {
        errors.push(format!("clauses[{i}] must be an object"));
        return None;
    };
    let before = errors.len();

    let title = obj.get("title").and_then(Value::as_str).map(str::trim).unwrap_or("");
    if title.is_empty() {
        errors.push(format!("clauses[{i}].title is missing or empty"));
    }
    let risk_level = match obj.get("risk_level").and_then(Value::as_str) {
        Some(s) => RiskLevel::parse(s).or_else(|| {
            errors.push(format!(
                "clauses[{i}].risk_level must be \"low\", \"medium\" or \"high\", got \"{s}\""
            ));
            None
        }),
        None => {
            errors.push(format!("clauses[{i}].risk_level is missing"));
            None
        }
    };
    let explanation = match obj.get("explanation").and_then(Value::as_str) {
        Some(s) => s.trim().to_string(),
        None => {
            errors.push(format!("clauses[{i}].explanation is missing"));
            String::new()
        }
    };
    let recommendation = obj
        .get("recommendation")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    if errors.len() > before {
        return None;
    }
    Some(Clause {
        title: title.to_string(),
        risk_level: risk_level?,
        explanation,
        recommendation,
    })
}

/// Parse and validate a model reply.
///
/// `fallback_type` fills `contract_type` when the model omits it or uses
/// an unknown label. Returns every problem found, not just the first.
pub fn validate_payload(reply: &str, fallback_type: ContractType) -> Result<AnalysisPayload, Vec<String>> {
    let json = extract_json_object(reply);
    let value: Value = match serde_json::from_str(json) {
        Ok(v) => v,
        Err(e) => return Err(vec![format!("response is not valid JSON: {e}")]),
    };
    let Some(obj) = value.as_object() else {
        return Err(vec!["response must be a JSON object".to_string()]);
    };
    let mut errors = Vec::new();

    let summary = match obj.get("summary").and_then(Value::as_str).map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        Some(_) => {
            errors.push("summary is empty".to_string());
            String::new()
        }
        None => {
            errors.push("summary is missing".to_string());
            String::new()
        }
    };

    let contract_type = obj
        .get("contract_type")
        .and_then(Value::as_str)
        .and_then(ContractType::from_label)
        .unwrap_or(fallback_type);

    let risk_score = match obj.get("risk_score") {
        Some(Value::Number(n)) => match n.as_f64() {
            Some(f) if (0.0..=100.0).contains(&f) => f.round() as u8,
            _ => {
                errors.push(format!("risk_score must be between 0 and 100, got {n}"));
                0
            }
        },
        Some(other) => {
            errors.push(format!("risk_score must be a number, got {other}"));
            0
        }
        None => {
            errors.push("risk_score is missing".to_string());
            0
        }
    };

    let clauses = match obj.get("clauses") {
        Some(Value::Array(items)) if items.is_empty() => {
            errors.push("clauses must contain at least one clause".to_string());
            Vec::new()
        }
        Some(Value::Array(items)) => {
            if items.len() > MAX_CLAUSES {
                errors.push(format!(
                    "too many clauses: {} (at most {MAX_CLAUSES})",
                    items.len()
                ));
            }
            items
                .iter()
                .enumerate()
                .filter_map(|(i, v)| clause(i, v, &mut errors))
                .collect()
        }
        Some(_) => {
            errors.push("clauses must be an array".to_string());
            Vec::new()
        }
        None => {
            errors.push("clauses is missing".to_string());
            Vec::new()
        }
    };

    let parties = string_list(obj, "parties", &mut errors);
    let red_flags = string_list(obj, "red_flags", &mut errors);
    let missing_clauses = string_list(obj, "missing_clauses", &mut errors);

    if !errors.is_empty() {
        return Err(errors);
    }
    Ok(AnalysisPayload {
        summary,
        contract_type,
        parties,
        risk_score,
        clauses,
        red_flags,
        missing_clauses,
    })
}

// ── Analyzer ─────────────────────────────────────────────────────────────

/// Runs the analysis call with bounded schema repair.
#[derive(Clone)]
pub struct Analyzer {
    client: Arc<dyn LlmClient>,
    config: AnalysisConfig,
}

impl Analyzer {
    pub fn new(client: Arc<dyn LlmClient>, config: AnalysisConfig) -> Self {
        Self { client, config }
    }

    /// Analyse `clean_text` as a contract of type `contract_type`.
    ///
    /// # Errors
    /// - [`PipelineError::Llm`] when the provider keeps failing after retries.
    /// - [`PipelineError::AnalysisInvalid`] when every attempt, repairs
    ///   included, fails validation. Carries the errors of each attempt.
    pub async fn analyze(
        &self,
        contract_type: ContractType,
        clean_text: &str,
    ) -> Result<AnalysisPayload, PipelineError> {
        let text = match clean_text.char_indices().nth(self.config.max_input_chars) {
            Some((idx, _)) => &clean_text[..idx],
            None => clean_text,
        };
        let base_prompt = analysis_user_prompt(contract_type, text);
        let mut request = CompletionRequest {
            system_prompt: ANALYSIS_SYSTEM_PROMPT.to_string(),
            user_prompt: base_prompt.clone(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            json_mode: true,
        };

        let mut accumulated = Vec::new();
        for attempt in 0..=self.config.max_repair_attempts {
            let reply = complete_with_retry(
                self.client.as_ref(),
                &request,
                self.config.max_retries,
                self.config.retry_backoff_ms,
            )
            .await?;

            match validate_payload(&reply, contract_type) {
                Ok(payload) => {
                    info!(
                        attempt,
                        risk_score = payload.risk_score,
                        clauses = payload.clauses.len(),
                        "analysis validated"
                    );
                    return Ok(payload);
                }
                Err(errors) => {
                    warn!(attempt, errors = errors.len(), "analysis failed validation");
                    accumulated.extend(errors.iter().map(|e| format!("attempt {attempt}: {e}")));
                    request.user_prompt = format!("{base_prompt}\n\n{}", repair_prompt(&reply, &errors));
                }
            }
        }

        Err(PipelineError::AnalysisInvalid {
            errors: accumulated,
        })
    }
}
