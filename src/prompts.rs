//! Prompts for contract-type classification and contract analysis.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth**: the response schema described to the model
//!    and the schema enforced by [`crate::analysis::validate_payload`] are
//!    edited side by side.
//!
//! 2. **Testability**: unit tests inspect prompts directly without a provider,
//!    so prompt regressions are caught early.

use crate::classify::ContractType;

/// Appended to the system prompt when a request asks for a JSON object.
///
/// Not every provider exposes a native JSON response mode, so the contract
/// is stated in the prompt and the reply is validated afterwards.
pub const JSON_RESPONSE_INSTRUCTION: &str = r#"

RESPONSE FORMAT
Respond with a single JSON object and nothing else.
Do NOT wrap it in ``` fences. Do NOT add commentary before or after it."#;

/// System prompt for the classification fallback call.
pub const CLASSIFIER_SYSTEM_PROMPT: &str = r#"You are a legal document triage assistant. You read an excerpt of a contract or administrative document (French or English) and decide which single category it belongs to.

Categories:
{categories}

Rules:
- Choose exactly one category from the list above, using its identifier verbatim.
- "administrative-form" is for fill-in forms (CERFA, applications, declarations), not for contracts.
- "tabular-commercial" is for price lists, order forms and commercial tables without clauses.
- Use "other" only when no category fits.
- confidence is a number between 0 and 1.

Output schema:
{"type": "<category>", "confidence": 0.0, "reason": "<one short sentence>"}"#;

/// System prompt for the paid contract analysis.
pub const ANALYSIS_SYSTEM_PROMPT: &str = r#"You are a senior contract lawyer. You review the contract text provided by the user and produce a structured risk analysis for a non-lawyer.

Rules:
1. Base every statement on the text. Do not invent clauses that are not present.
2. Write in the language of the contract.
3. risk_score is an integer from 0 (no risk) to 100 (do not sign).
4. Each clause has a risk_level of "low", "medium" or "high".
5. List at most 30 clauses, most important first.
6. missing_clauses lists protections a party would normally expect but that are absent.

Output schema:
{
  "summary": "<3-6 sentences>",
  "contract_type": "<category identifier>",
  "parties": ["<party name>", "..."],
  "risk_score": 0,
  "clauses": [
    {"title": "<clause title>", "risk_level": "low|medium|high", "explanation": "<why>", "recommendation": "<optional fix>"}
  ],
  "red_flags": ["<short sentence>"],
  "missing_clauses": ["<clause name>"]
}"#;

/// Render the classifier system prompt with the category list.
pub fn classifier_system_prompt() -> String {
    let categories = ContractType::ALL
        .iter()
        .map(|t| format!("- {}: {}", t.as_str(), t.description()))
        .collect::<Vec<_>>()
        .join("\n");
    CLASSIFIER_SYSTEM_PROMPT.replace("{categories}", &categories)
}

/// User turn for the classifier: the excerpt plus the offline guess as a hint.
pub fn classifier_user_prompt(excerpt: &str, hint: ContractType, hint_confidence: f64) -> String {
    format!(
        "Offline heuristic guess (may be wrong): {} (confidence {:.2})\n\nDocument excerpt:\n<<<\n{}\n>>>",
        hint.as_str(),
        hint_confidence,
        excerpt
    )
}

/// User turn for the analysis call.
pub fn analysis_user_prompt(contract_type: ContractType, clean_text: &str) -> String {
    format!(
        "Contract category: {}\n\nContract text:\n<<<\n{}\n>>>",
        contract_type.as_str(),
        clean_text
    )
}

/// Follow-up user turn asking the model to fix an invalid answer.
pub fn repair_prompt(previous: &str, errors: &[String]) -> String {
    let listed = errors
        .iter()
        .map(|e| format!("- {e}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Your previous answer did not match the required schema.\n\nProblems:\n{listed}\n\nPrevious answer:\n{previous}\n\nReturn the corrected JSON object only."
    )
}
