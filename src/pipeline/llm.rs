//! LLM interaction: a small client trait and the edgequake-llm adapter.
//!
//! The classifier and the analyzer only need "system + user prompt in, text
//! out". [`LlmClient`] is that seam; [`EdgequakeLlm`] implements it over any
//! `edgequake_llm` provider, and tests implement it with scripted replies.
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 503 errors are transient and frequent under concurrent load.
//! [`complete_with_retry`] backs off exponentially
//! (`retry_backoff_ms * 2^(attempt-1)`): with 500 ms base and 3 retries the
//! wait sequence is 500 ms → 1 s → 2 s. A single wait never exceeds 60 s.
//! `Unavailable` errors (bad key, unknown model) are returned immediately.

use crate::config::LlmSettings;
use crate::error::LlmError;
use crate::prompts::JSON_RESPONSE_INSTRUCTION;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Model used when a provider is named without one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-mini";

/// `CompletionOptions::response_format` value selecting JSON-object output.
const JSON_RESPONSE_FORMAT: &str = "json_object";

/// Longest computed backoff between retries.
const MAX_BACKOFF_MS: u64 = 60_000;

/// Longest server-requested wait honoured between retries.
const MAX_RETRY_AFTER_SECS: u64 = 30;

/// One completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f32,
    pub max_tokens: usize,
    /// Ask for a single JSON object.
    pub json_mode: bool,
}

/// A text-completion backend.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;
}

/// [`LlmClient`] over an `edgequake_llm` provider.
#[derive(Clone)]
pub struct EdgequakeLlm {
    provider: Arc<dyn LLMProvider>,
}

impl EdgequakeLlm {
    /// Wrap an already configured provider.
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self { provider }
    }

    /// Resolve a provider, from most-specific to least-specific:
    ///
    /// 1. **Named provider + model** (`settings.provider_name`): the
    ///    provider's API key is read from its usual variable.
    /// 2. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`),
    ///    when both are set.
    /// 3. **OpenAI** when `OPENAI_API_KEY` is present.
    /// 4. **Full auto-detection** via `ProviderFactory::from_env`.
    ///
    /// Call once at process start.
    pub fn from_settings(settings: &LlmSettings) -> Result<Self, LlmError> {
        let model = settings.model.as_deref().unwrap_or(DEFAULT_MODEL);

        if let Some(ref name) = settings.provider_name {
            return create_provider(name, model).map(Self::new);
        }

        if let (Ok(prov), Ok(env_model)) = (
            std::env::var("EDGEQUAKE_LLM_PROVIDER"),
            std::env::var("EDGEQUAKE_MODEL"),
        ) {
            if !prov.is_empty() && !env_model.is_empty() {
                return create_provider(&prov, &env_model).map(Self::new);
            }
        }

        if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
            return create_provider("openai", model).map(Self::new);
        }

        let (llm_provider, _embedding) = ProviderFactory::from_env().map_err(|e| {
            LlmError::Unavailable(format!(
                "no LLM provider could be auto-detected from the environment \
                 (set OPENAI_API_KEY, ANTHROPIC_API_KEY or CONTRACT_INTAKE_LLM_PROVIDER): {e}"
            ))
        })?;
        Ok(Self::new(llm_provider))
    }
}

/// Sampling options for `request`. JSON mode asks the provider for a
/// `json_object` response; providers without one rely on the prompt
/// instruction.
fn build_options(request: &CompletionRequest) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(request.temperature),
        max_tokens: Some(request.max_tokens),
        response_format: request.json_mode.then(|| JSON_RESPONSE_FORMAT.to_string()),
        ..Default::default()
    }
}

fn create_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, LlmError> {
    ProviderFactory::create_llm_provider(name, model)
        .map_err(|e| LlmError::Unavailable(format!("provider '{name}' not configured: {e}")))
}

#[async_trait]
impl LlmClient for EdgequakeLlm {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let start = Instant::now();
        let system = if request.json_mode {
            format!("{}{}", request.system_prompt, JSON_RESPONSE_INSTRUCTION)
        } else {
            request.system_prompt.clone()
        };
        let messages = vec![
            ChatMessage::system(system),
            ChatMessage::user(request.user_prompt.as_str()),
        ];
        let options = build_options(request);

        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| classify_provider_error(&e.to_string()))?;
        debug!(
            input_tokens = response.prompt_tokens,
            output_tokens = response.completion_tokens,
            duration_ms = start.elapsed().as_millis() as u64,
            "LLM call complete"
        );
        Ok(response.content)
    }
}

static RE_RETRY_AFTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)retry[- _]?after\D{0,3}(\d{1,5})").unwrap());

/// Map a provider error message onto [`LlmError`].
pub fn classify_provider_error(message: &str) -> LlmError {
    let lower = message.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests")
    {
        let retry_after_secs = RE_RETRY_AFTER
            .captures(message)
            .and_then(|c| c[1].parse().ok());
        return LlmError::RateLimited { retry_after_secs };
    }
    let transient = [
        "timeout",
        "timed out",
        "500",
        "502",
        "503",
        "504",
        "overloaded",
        "connection",
        "temporarily",
        "unavailable",
    ];
    if transient.iter().any(|t| lower.contains(t)) {
        LlmError::Transient(message.to_string())
    } else {
        LlmError::Unavailable(message.to_string())
    }
}

static RE_JSON_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:json|JSON)?\s*\n(.*?)\n?```\s*$").unwrap());

/// Isolate the JSON object in a model reply.
///
/// Strips outer code fences (models sometimes ignore the prompt) and any
/// prose before the first `{` or after the last `}`.
pub fn extract_json_object(reply: &str) -> &str {
    let trimmed = reply.trim();
    let inner = RE_JSON_FENCES
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .unwrap_or(trimmed);
    match (inner.find('{'), inner.rfind('}')) {
        (Some(start), Some(end)) if end > start => &inner[start..=end],
        _ => inner,
    }
}

/// `base_ms * 2^(attempt-1)`, capped at [`MAX_BACKOFF_MS`].
fn backoff_ms(base_ms: u64, attempt: u32) -> u64 {
    2u64.checked_pow(attempt.saturating_sub(1))
        .map_or(u64::MAX, |factor| base_ms.saturating_mul(factor))
        .min(MAX_BACKOFF_MS)
}

/// Call `client`, retrying rate-limit and transient failures with backoff.
pub async fn complete_with_retry(
    client: &dyn LlmClient,
    request: &CompletionRequest,
    max_retries: u32,
    retry_backoff_ms: u64,
) -> Result<String, LlmError> {
    let mut attempt = 0u32;
    loop {
        match client.complete(request).await {
            Ok(text) => return Ok(text),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                attempt += 1;
                let mut backoff = backoff_ms(retry_backoff_ms, attempt);
                if let LlmError::RateLimited {
                    retry_after_secs: Some(secs),
                } = &e
                {
                    backoff = backoff.max((*secs).min(MAX_RETRY_AFTER_SECS) * 1000);
                }
                warn!(
                    attempt,
                    max_retries,
                    backoff_ms = backoff,
                    error = %e,
                    "LLM call failed, retrying"
                );
                sleep(Duration::from_millis(backoff)).await;
            }
            Err(e) => return Err(e),
        }
    }
}
