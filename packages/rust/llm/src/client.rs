//! Chat-completions client for OpenAI-compatible endpoints.
//!
//! [`ChatGenerator`] sends one prompt per call, maps HTTP failures onto
//! [`GenerationError`] and retries transient ones when configured to.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use webrag_shared::{
    Credential, GenerationError, GenerationResult, LlmConfig, RagError, ReplyMeta, Result, Usage,
};

use crate::retry::{AttemptError, retry_after, with_retry};

/// Error bodies are cut to this many characters before being reported.
const MAX_ERROR_BODY_CHARS: usize = 512;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-generator request settings.
#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    pub model: String,
    /// Base URL without the `/chat/completions` suffix.
    pub base_url: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub timeout: Duration,
    pub max_retries: u32,
    /// Sent as a `system` message ahead of the prompt.
    pub system_prompt: Option<String>,
}

impl From<&LlmConfig> for GeneratorOptions {
    fn from(config: &LlmConfig) -> Self {
        Self {
            model: config.model.clone(),
            base_url: config.base_url.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
            system_prompt: None,
        }
    }
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self::from(&LlmConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    #[serde(default)]
    index: usize,
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

// ---------------------------------------------------------------------------
// ChatGenerator
// ---------------------------------------------------------------------------

/// Generator backed by an OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatGenerator {
    client: Client,
    credential: Credential,
    options: GeneratorOptions,
}

impl std::fmt::Debug for ChatGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatGenerator")
            .field("credential", &self.credential)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ChatGenerator {
    pub fn new(options: GeneratorOptions, credential: Credential) -> Result<Self> {
        let client = Client::builder()
            .timeout(options.timeout)
            .connect_timeout(options.timeout.min(Duration::from_secs(30)))
            .user_agent(concat!("webrag/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RagError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            credential,
            options,
        })
    }

    pub fn options(&self) -> &GeneratorOptions {
        &self.options
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.options.base_url.trim_end_matches('/'))
    }

    /// Send `prompt` as a user message and return every reply.
    ///
    /// Retries transient failures only when `max_retries > 0`.
    #[instrument(skip_all, fields(model = %self.options.model, prompt_len = prompt.len()))]
    pub async fn generate(&self, prompt: &str) -> std::result::Result<GenerationResult, GenerationError> {
        let result = with_retry(self.options.max_retries, || self.send_once(prompt)).await?;

        let usage = result.meta.first().map(|m| m.usage).unwrap_or_default();
        info!(
            replies = result.replies.len(),
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "generation completed"
        );

        Ok(result)
    }

    async fn send_once(&self, prompt: &str) -> std::result::Result<GenerationResult, AttemptError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = self.options.system_prompt.as_deref() {
            messages.push(ApiMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ApiMessage {
            role: "user",
            content: prompt,
        });

        let body = ChatRequest {
            model: &self.options.model,
            messages,
            max_tokens: self.options.max_tokens,
            temperature: self.options.temperature,
            stream: false,
        };

        debug!(endpoint = %self.endpoint(), "sending chat completion request");

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.credential.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let hint = retry_after(response.headers());

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AttemptError {
                error: GenerationError::RateLimited,
                retry_after: hint,
            });
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(GenerationError::Unauthorized {
                status: status.as_u16(),
            }
            .into());
        }

        let text = response.text().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            return Err(AttemptError {
                error: GenerationError::Status {
                    status: status.as_u16(),
                    body: text.chars().take(MAX_ERROR_BODY_CHARS).collect(),
                },
                retry_after: hint,
            });
        }

        parse_response(&text, &self.options.model).map_err(AttemptError::from)
    }

    fn transport_error(&self, e: reqwest::Error) -> AttemptError {
        if e.is_timeout() {
            GenerationError::Timeout {
                after: self.options.timeout,
            }
        } else {
            GenerationError::Transport(e.without_url().to_string())
        }
        .into()
    }
}

fn parse_response(
    text: &str,
    requested_model: &str,
) -> std::result::Result<GenerationResult, GenerationError> {
    let response: ChatResponse = serde_json::from_str(text)
        .map_err(|e| GenerationError::MalformedResponse(e.to_string()))?;

    if response.choices.is_empty() {
        return Err(GenerationError::EmptyResponse);
    }

    let model = response
        .model
        .unwrap_or_else(|| requested_model.to_string());
    let usage = response.usage.unwrap_or_default();

    let (replies, meta): (Vec<String>, Vec<ReplyMeta>) = response
        .choices
        .into_iter()
        .map(|choice| {
            let meta = ReplyMeta {
                model: model.clone(),
                index: choice.index,
                finish_reason: choice.finish_reason,
                usage,
            };
            (choice.message.content.unwrap_or_default(), meta)
        })
        .unzip();

    Ok(GenerationResult { replies, meta })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn options(server: &MockServer) -> GeneratorOptions {
        GeneratorOptions {
            base_url: format!("{}/v1", server.uri()),
            timeout: Duration::from_secs(5),
            ..GeneratorOptions::default()
        }
    }

    fn generator(options: GeneratorOptions) -> ChatGenerator {
        ChatGenerator::new(options, Credential::new("test-key").unwrap()).unwrap()
    }

    fn completion(content: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "chatcmpl-1",
            "model": "Meta-Llama-3.1-8B-Instruct",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17 }
        })
    }

    #[tokio::test]
    async fn sends_bearer_request_and_parses_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({
                "model": "Meta-Llama-3.1-8B-Instruct",
                "max_tokens": 512,
                "messages": [
                    { "role": "system", "content": "Be brief." },
                    { "role": "user", "content": "Hello?" }
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("Hi there.")))
            .expect(1)
            .mount(&server)
            .await;

        let generator = generator(GeneratorOptions {
            system_prompt: Some("Be brief.".into()),
            ..options(&server)
        });
        let result = generator.generate("Hello?").await.unwrap();

        assert_eq!(result.answer(), Some("Hi there."));
        assert_eq!(result.meta[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(result.meta[0].usage.total_tokens, 17);
    }

    #[tokio::test]
    async fn unauthorized_is_distinct() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
            .mount(&server)
            .await;

        let err = generator(options(&server)).generate("q").await.unwrap_err();
        assert_eq!(err, GenerationError::Unauthorized { status: 401 });
    }

    #[tokio::test]
    async fn server_error_reports_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .expect(1)
            .mount(&server)
            .await;

        let err = generator(options(&server)).generate("q").await.unwrap_err();
        assert_eq!(
            err,
            GenerationError::Status {
                status: 503,
                body: "overloaded".into()
            }
        );
    }

    #[tokio::test]
    async fn malformed_and_empty_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({ "messages": [{ "content": "bad" }] })))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({ "messages": [{ "content": "empty" }] })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "choices": [] })),
            )
            .mount(&server)
            .await;

        let generator = generator(options(&server));
        assert!(matches!(
            generator.generate("bad").await,
            Err(GenerationError::MalformedResponse(_))
        ));
        assert_eq!(
            generator.generate("empty").await.unwrap_err(),
            GenerationError::EmptyResponse
        );
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(completion("late"))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let generator = generator(GeneratorOptions {
            timeout: Duration::from_millis(200),
            ..options(&server)
        });
        assert_eq!(
            generator.generate("q").await.unwrap_err(),
            GenerationError::Timeout {
                after: Duration::from_millis(200)
            }
        );
    }

    #[tokio::test]
    async fn rate_limit_retried_when_enabled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("after retry")))
            .expect(1)
            .mount(&server)
            .await;

        let generator = generator(GeneratorOptions {
            max_retries: 2,
            ..options(&server)
        });
        let result = generator.generate("q").await.unwrap();
        assert_eq!(result.answer(), Some("after retry"));
    }

    #[tokio::test]
    async fn rate_limit_not_retried_by_default() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .expect(1)
            .mount(&server)
            .await;

        let err = generator(options(&server)).generate("q").await.unwrap_err();
        assert_eq!(err, GenerationError::RateLimited);
    }

    #[test]
    fn debug_output_hides_credential() {
        let generator = ChatGenerator::new(
            GeneratorOptions::default(),
            Credential::new("sk-very-secret").unwrap(),
        )
        .unwrap();
        assert!(!format!("{generator:?}").contains("sk-very-secret"));
    }
}
