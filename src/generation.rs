// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Text-generation collaborator.
//!
//! The pipeline only needs `generate(prompt_context, user_prompt) -> text`.
//! [`HttpGenerator`] speaks a `generateContent`-style JSON API;
//! [`generate_with_retry`] adds exponential backoff around any
//! [`ContentGenerator`]; [`parse_stage_output`] turns model text into the JSON
//! value stored in a slot.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use crate::session::{ProjectRecord, SlotName};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("generator not configured")]
    NotConfigured,

    #[error("generator unavailable: {0}")]
    Unavailable(String),

    #[error("generator rate limited")]
    RateLimited,

    #[error("generator rejected the request: {0}")]
    Rejected(String),

    #[error("generator output is not a JSON document: {0}")]
    InvalidOutput(String),
}

impl GenerationError {
    /// Worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GenerationError::Unavailable(_) | GenerationError::RateLimited
        )
    }
}

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, prompt_context: &str, user_prompt: &str)
        -> Result<String, GenerationError>;
}

// =============================================================================
// HTTP client
// =============================================================================

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

/// JSON client for a `generateContent`-style endpoint.
#[derive(Debug, Clone)]
pub struct HttpGenerator {
    endpoint: Url,
    api_key: Option<String>,
    http: Client,
}

impl HttpGenerator {
    pub fn new(endpoint: Url, api_key: Option<String>) -> Result<Self, GenerationError> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| GenerationError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            endpoint,
            api_key,
            http,
        })
    }

    fn request_body(prompt_context: &str, user_prompt: &str) -> Value {
        json!({
            "systemInstruction": { "parts": [{ "text": prompt_context }] },
            "contents": [{ "role": "user", "parts": [{ "text": user_prompt }] }],
            "generationConfig": { "responseMimeType": "application/json" }
        })
    }
}

#[async_trait]
impl ContentGenerator for HttpGenerator {
    async fn generate(
        &self,
        prompt_context: &str,
        user_prompt: &str,
    ) -> Result<String, GenerationError> {
        let mut request = self
            .http
            .post(self.endpoint.clone())
            .json(&Self::request_body(prompt_context, user_prompt));
        if let Some(key) = &self.api_key {
            request = request.header("x-goog-api-key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GenerationError::Unavailable(format!("request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(GenerationError::RateLimited);
        }
        if status.is_server_error() {
            return Err(GenerationError::Unavailable(format!("returned {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Rejected(format!("returned {status}: {body}")));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::InvalidOutput(format!("invalid response: {e}")))?;

        let text: String = body
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(GenerationError::InvalidOutput("empty response".to_string()));
        }
        Ok(text)
    }
}

// =============================================================================
// Retry
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1` (1-based `attempt`).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Call the generator, retrying transient failures with exponential backoff.
pub async fn generate_with_retry(
    generator: &dyn ContentGenerator,
    policy: &RetryPolicy,
    prompt_context: &str,
    user_prompt: &str,
) -> Result<String, GenerationError> {
    let mut attempt = 1;
    loop {
        match generator.generate(prompt_context, user_prompt).await {
            Ok(text) => return Ok(text),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.backoff_for(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Generation failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// Prompting and parsing
// =============================================================================

/// System context for one stage, carrying the predecessor's output.
pub fn stage_prompt_context(slot: SlotName, record: &ProjectRecord) -> String {
    let mut context = format!(
        "You are producing the {slot} stage of a business plan for the project \"{}\". \
         Respond with a single JSON object and nothing else.",
        record.name
    );
    if let Some(previous) = slot.predecessor().and_then(|p| record.slots.get(p).map(|v| (p, v))) {
        context.push_str(&format!("\n\nOutput of the {} stage:\n{}", previous.0, previous.1));
    }
    context
}

/// Extract the JSON document from model output.
///
/// Accepts bare JSON, JSON inside a fenced code block, or JSON surrounded by
/// prose. The document must be an object or an array.
pub fn parse_stage_output(text: &str) -> Result<Value, GenerationError> {
    let trimmed = text.trim();
    let candidate = fenced_block(trimmed)
        .or_else(|| outermost_document(trimmed))
        .unwrap_or(trimmed);

    let value: Value = serde_json::from_str(candidate)
        .map_err(|e| GenerationError::InvalidOutput(e.to_string()))?;
    if !(value.is_object() || value.is_array()) {
        return Err(GenerationError::InvalidOutput(
            "expected a JSON object or array".to_string(),
        ));
    }
    debug!(bytes = candidate.len(), "Parsed stage output");
    Ok(value)
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

fn outermost_document(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let closing = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(closing)?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ProjectSlots, StorageMode};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyGenerator {
        failures: usize,
        calls: AtomicUsize,
        error: fn() -> GenerationError,
    }

    #[async_trait]
    impl ContentGenerator for FlakyGenerator {
        async fn generate(&self, _context: &str, _prompt: &str) -> Result<String, GenerationError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err((self.error)())
            } else {
                Ok("{\"ok\":true}".to_string())
            }
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    #[test]
    fn parses_bare_json() {
        assert_eq!(parse_stage_output(" {\"a\": 1} ").unwrap(), json!({"a": 1}));
    }

    #[test]
    fn parses_fenced_json() {
        let text = "Here you go:\n```json\n{\"title\": \"X\"}\n```\nThanks";
        assert_eq!(parse_stage_output(text).unwrap(), json!({"title": "X"}));
    }

    #[test]
    fn parses_json_surrounded_by_prose() {
        let text = "Sure! {\"items\": [1, 2]} Let me know.";
        assert_eq!(parse_stage_output(text).unwrap(), json!({"items": [1, 2]}));
        assert_eq!(parse_stage_output("list: [1, 2]").unwrap(), json!([1, 2]));
    }

    #[test]
    fn rejects_non_documents() {
        assert!(matches!(
            parse_stage_output("no json here"),
            Err(GenerationError::InvalidOutput(_))
        ));
        assert!(parse_stage_output("42").is_err());
        assert!(parse_stage_output("{\"unterminated\": ").is_err());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(4));
        assert_eq!(policy.backoff_for(10), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let generator = FlakyGenerator {
            failures: 2,
            calls: AtomicUsize::new(0),
            error: || GenerationError::Unavailable("503".into()),
        };
        let text = generate_with_retry(&generator, &fast_policy(), "ctx", "prompt")
            .await
            .unwrap();
        assert_eq!(text, "{\"ok\":true}");
        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let generator = FlakyGenerator {
            failures: 10,
            calls: AtomicUsize::new(0),
            error: || GenerationError::RateLimited,
        };
        let result = generate_with_retry(&generator, &fast_policy(), "ctx", "prompt").await;
        assert!(matches!(result, Err(GenerationError::RateLimited)));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_rejections() {
        let generator = FlakyGenerator {
            failures: 1,
            calls: AtomicUsize::new(0),
            error: || GenerationError::Rejected("400".into()),
        };
        assert!(generate_with_retry(&generator, &fast_policy(), "c", "p").await.is_err());
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_unavailable() {
        let generator =
            HttpGenerator::new(Url::parse("http://127.0.0.1:9/v1/generate").unwrap(), None).unwrap();
        let result = generator.generate("ctx", "prompt").await;
        assert!(matches!(result, Err(GenerationError::Unavailable(_))));
    }

    #[test]
    fn prompt_context_includes_predecessor_output() {
        let now = Utc::now();
        let mut slots = ProjectSlots::default();
        slots.set(SlotName::Idea, json!({"title": "X"}));
        let record = ProjectRecord {
            id: "session-1".into(),
            owner_id: "u1".into(),
            name: "Test Co".into(),
            created_at: now,
            last_accessed_at: now,
            expires_at: now,
            slots,
            storage_mode: StorageMode::MemoryOnly,
            durable_fields: Default::default(),
        };

        let context = stage_prompt_context(SlotName::Research, &record);
        assert!(context.contains("research stage"));
        assert!(context.contains("Test Co"));
        assert!(context.contains("{\"title\":\"X\"}"));
        assert!(!stage_prompt_context(SlotName::Idea, &record).contains("Output of"));
    }
}
