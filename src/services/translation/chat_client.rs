// OpenAI-compatible chat-completions translator
// Used for both the primary model and the higher-quality fallback model.
// Structured outputs cover the batch and two-part split modes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::core::config::TranslatorConfig;
use crate::core::errors::{TranslationError, TranslationResult};
use crate::services::translation::translator::{Translation, Translator};
use crate::utils::Metrics;

const INITIAL_RETRY_DELAY_MS: u64 = 1000;
const MAX_RETRY_DELAY_MS: u64 = 10000;

/// Chat-completions translation client
pub struct ChatTranslator {
    config: TranslatorConfig,
    api_key: String,
    http_client: reqwest::Client,
    metrics: Option<Metrics>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct JsonSchema {
    name: String,
    strict: bool,
    schema: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
    json_schema: JsonSchema,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Structured output schema for batch translations
#[derive(Debug, Deserialize)]
struct TranslationsResponse {
    translations: Vec<TranslationItem>,
}

#[derive(Debug, Deserialize)]
struct TranslationItem {
    id: usize,
    text: String,
}

impl ChatTranslator {
    /// Create a client; fails if the key is empty or the HTTP client can't be built
    pub fn new(config: TranslatorConfig, api_key: String, metrics: Option<Metrics>) -> Result<Self> {
        if api_key.trim().is_empty() {
            anyhow::bail!("Translator API key is required");
        }

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(5)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            config,
            api_key,
            http_client,
            metrics,
        })
    }

    /// `None` when no API key is configured (the model is unavailable)
    pub fn from_config(config: &TranslatorConfig, metrics: Option<Metrics>) -> Option<Self> {
        let key = config.api_key.clone()?;
        match Self::new(config.clone(), key, metrics) {
            Ok(client) => Some(client),
            Err(e) => {
                warn!("Translator '{}' unavailable: {:#}", config.model, e);
                None
            }
        }
    }

    fn system_prompt(&self) -> String {
        format!(
            "You are a manga translator. Translate speech-bubble text into natural, \
             concise {} dialogue while fixing obvious OCR errors. \
             Do not add notes, explanations or romanization.",
            self.config.target_language
        )
    }

    fn build_batch_schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "translations": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": {"type": "integer", "description": "The input id"},
                            "text": {"type": "string", "description": "The translated text"}
                        },
                        "required": ["id", "text"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["translations"],
            "additionalProperties": false
        })
    }

    fn build_split_schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "top": {"type": "string", "description": "Translation of the part on the earlier page"},
                "bottom": {"type": "string", "description": "Translation of the part on the later page"}
            },
            "required": ["top", "bottom"],
            "additionalProperties": false
        })
    }

    fn request(&self, user_prompt: String, schema: Option<(&str, serde_json::Value)>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: self.system_prompt(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_prompt,
                },
            ],
            stream: false,
            temperature: 0.3,
            response_format: schema.map(|(name, schema)| ResponseFormat {
                format_type: "json_schema".to_string(),
                json_schema: JsonSchema {
                    name: name.to_string(),
                    strict: true,
                    schema,
                },
            }),
        }
    }

    /// Send a request with exponential backoff and jitter on retryable failures
    async fn send_with_retries(&self, request: &ChatCompletionRequest) -> TranslationResult<String> {
        let max_retries = self.config.max_retries;
        let mut retry_delay_ms = INITIAL_RETRY_DELAY_MS;
        let mut last_error: Option<TranslationError> = None;
        let start = Instant::now();

        for attempt in 0..=max_retries {
            if attempt > 0 {
                let jitter = rand::random::<u64>() % 1000;
                debug!(
                    "{}: retry attempt {} after {}ms",
                    self.config.model,
                    attempt,
                    retry_delay_ms + jitter
                );
                tokio::time::sleep(Duration::from_millis(retry_delay_ms + jitter)).await;
                retry_delay_ms = (retry_delay_ms * 2).min(MAX_RETRY_DELAY_MS);
            }

            let response = match self
                .http_client
                .post(&self.config.api_url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(request)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    let is_retryable = e.is_timeout() || e.is_connect();
                    warn!(
                        "{}: request failed (attempt {}): {} (retryable: {})",
                        self.config.model,
                        attempt + 1,
                        e,
                        is_retryable
                    );
                    if is_retryable && attempt < max_retries {
                        last_error = Some(TranslationError::ApiRequestFailed(e));
                        continue;
                    }
                    self.record_call(false, start.elapsed(), None);
                    return Err(TranslationError::ApiRequestFailed(e));
                }
            };

            let status = response.status();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                let retry_after = retry_after_secs(response.headers());
                warn!(
                    "{}: rate limited (attempt {}), retry after {:?}s",
                    self.config.model,
                    attempt + 1,
                    retry_after
                );
                if let Some(secs) = retry_after {
                    retry_delay_ms = retry_delay_ms.max(secs.saturating_mul(1000)).min(MAX_RETRY_DELAY_MS);
                }
                last_error = Some(TranslationError::RateLimited(
                    retry_after.unwrap_or(retry_delay_ms / 1000),
                ));
                continue;
            }

            if status.is_server_error() {
                let error_text = response.text().await.unwrap_or_default();
                warn!(
                    "{}: server error {} (attempt {}): {}",
                    self.config.model,
                    status,
                    attempt + 1,
                    error_text
                );
                last_error = Some(TranslationError::InvalidResponse(format!(
                    "API error: {} - {}",
                    status, error_text
                )));
                continue;
            }

            if !status.is_success() {
                let error_text = response.text().await.unwrap_or_default();
                self.record_call(false, start.elapsed(), None);
                return Err(TranslationError::InvalidResponse(format!(
                    "API error: {} - {}",
                    status, error_text
                )));
            }

            let data: ChatCompletionResponse = response
                .json()
                .await
                .context("Failed to parse chat completion response")?;
            self.record_call(true, start.elapsed(), data.usage.as_ref());

            return data
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content.trim().to_string())
                .ok_or_else(|| TranslationError::InvalidResponse("Chat completion response has no choices".to_string()));
        }

        self.record_call(false, start.elapsed(), None);
        Err(last_error.unwrap_or_else(|| {
            TranslationError::InvalidResponse(format!("Translation failed after {} retries", max_retries))
        }))
    }

    fn record_call(&self, success: bool, duration: Duration, usage: Option<&Usage>) {
        if let Some(usage) = usage {
            debug!(
                "{}: {} prompt + {} completion tokens in {:.2}s",
                self.config.model,
                usage.prompt_tokens,
                usage.completion_tokens,
                duration.as_secs_f64()
            );
        }
        if let Some(ref m) = self.metrics {
            m.record_translation_call(success, duration);
        }
    }
}

/// Whole seconds from a `Retry-After` header; HTTP-date values are ignored
fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[async_trait]
impl Translator for ChatTranslator {
    fn name(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip(self, text), fields(model = %self.config.model, chars = text.chars().count()))]
    async fn translate(&self, text: &str) -> TranslationResult<Translation> {
        let prompt = format!(
            "Translate the following text to {}. Only output the translation.\n\n{}",
            self.config.target_language, text
        );
        let content = self.send_with_retries(&self.request(prompt, None)).await?;
        Ok(Translation::new(content))
    }

    async fn translate_with_prompt(&self, prompt: &str, _source_text: &str) -> TranslationResult<Translation> {
        let content = self
            .send_with_retries(&self.request(prompt.to_string(), None))
            .await?;
        Ok(Translation::new(content))
    }

    #[instrument(skip(self, texts), fields(model = %self.config.model, batch_size = texts.len()))]
    async fn translate_batch(&self, texts: &[String]) -> TranslationResult<Vec<Translation>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let input_items: Vec<serde_json::Value> = texts
            .iter()
            .enumerate()
            .map(|(id, text)| json!({"id": id, "text": text}))
            .collect();
        let input_json = serde_json::to_string(&input_items).map_err(anyhow::Error::from)?;

        info!(
            "{}: translating {} regions to {}",
            self.config.model,
            texts.len(),
            self.config.target_language
        );

        let prompt = format!(
            "Translate each text to {}. Keep the ids. Input:\n{}",
            self.config.target_language, input_json
        );
        let content = self
            .send_with_retries(&self.request(prompt, Some(("translation_response", Self::build_batch_schema()))))
            .await?;

        let parsed: TranslationsResponse = serde_json::from_str(&content)
            .map_err(|e| TranslationError::InvalidResponse(format!("batch response: {}", e)))?;

        let mut out: Vec<Option<Translation>> = vec![None; texts.len()];
        for item in parsed.translations {
            if let Some(slot) = out.get_mut(item.id) {
                *slot = Some(Translation::new(item.text));
            }
        }

        let missing = out.iter().filter(|t| t.is_none()).count();
        if missing > 0 {
            return Err(TranslationError::BatchMismatch {
                sent: texts.len(),
                received: texts.len() - missing,
            });
        }
        Ok(out.into_iter().flatten().collect())
    }

    async fn translate_split(&self, top_source: &str, bottom_source: &str) -> TranslationResult<String> {
        let prompt = format!(
            "One speech bubble is split across two manga pages. \
             Translate it to {} as one sentence, then divide the translation into the part \
             shown on the earlier page (\"top\") and the part on the later page (\"bottom\"). \
             Respond with JSON only.\n\nEarlier page: {}\nLater page: {}",
            self.config.target_language, top_source, bottom_source
        );
        let content = self
            .send_with_retries(&self.request(prompt, Some(("crosspage_split", Self::build_split_schema()))))
            .await?;
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(key: Option<&str>) -> TranslatorConfig {
        TranslatorConfig {
            api_url: "http://localhost:9/v1/chat/completions".to_string(),
            api_key: key.map(str::to_string),
            model: "test-model".to_string(),
            target_language: "English".to_string(),
            max_retries: 0,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_unavailable_without_key() {
        assert!(ChatTranslator::from_config(&config(None), None).is_none());
        assert!(ChatTranslator::from_config(&config(Some("sk-test")), None).is_some());
    }

    #[test]
    fn test_parse_structured_response() {
        let content = r#"{"translations":[{"id":1,"text":"How are you?"},{"id":0,"text":"Hello"}]}"#;
        let response: TranslationsResponse = serde_json::from_str(content).unwrap();
        assert_eq!(response.translations.len(), 2);
        assert_eq!(response.translations[0].id, 1);
        assert_eq!(response.translations[1].text, "Hello");
    }

    #[test]
    fn test_split_request_uses_strict_schema() {
        let client = ChatTranslator::from_config(&config(Some("sk-test")), None).unwrap();
        let request = client.request("x".to_string(), Some(("crosspage_split", ChatTranslator::build_split_schema())));
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);
        assert_eq!(
            body["response_format"]["json_schema"]["schema"]["required"],
            json!(["top", "bottom"])
        );
    }

    #[test]
    fn test_plain_request_omits_response_format() {
        let client = ChatTranslator::from_config(&config(Some("sk-test")), None).unwrap();
        let body = serde_json::to_value(client.request("x".to_string(), None)).unwrap();
        assert!(body.get("response_format").is_none());
        assert_eq!(body["messages"][1]["content"], "x");
    }

    #[test]
    fn test_retry_after_header_seconds() {
        use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

        let mut headers = HeaderMap::new();
        assert_eq!(retry_after_secs(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after_secs(&headers), Some(7));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"));
        assert_eq!(retry_after_secs(&headers), None);
    }

    #[tokio::test]
    async fn test_transport_failure_is_request_error() {
        let mut cfg = config(Some("sk-test"));
        cfg.api_url = "not a url".to_string();
        let client = ChatTranslator::from_config(&cfg, None).unwrap();

        let err = client.translate("안녕").await.unwrap_err();
        assert!(matches!(err, TranslationError::ApiRequestFailed(_)));
    }
}
