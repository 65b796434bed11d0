//! OpenAI-compatible `/chat/completions` client used for extraction and answers.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::retry::{send_with_retry, RetryPolicy};
use crate::{Error, Result};

pub const OPENAI_API_URL: &str = "https://api.openai.com/v1";

const ERROR_BODY_LIMIT: usize = 500;

/// One turn of a conversation sent to a completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
        }
    }
}

/// Sampling knobs shared by every completion call.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CompletionReply {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

pub(crate) fn truncate_body(body: &str) -> String {
    if body.chars().count() <= ERROR_BODY_LIMIT {
        return body.to_string();
    }
    let cut: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    format!("{cut}...")
}

/// Any server exposing `/chat/completions`: OpenAI, vLLM, LM Studio, Azure proxies.
#[derive(Debug, Clone)]
pub struct OpenAIClient {
    http: Client,
    api_key: String,
    pub(crate) base_url: String,
    retry: RetryPolicy,
}

impl OpenAIClient {
    pub fn new<S: Into<String>>(
        api_key: S,
        base_url: Option<&str>,
        timeout: Duration,
    ) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(Error::InvalidArgument("LLM API key is empty".to_string()));
        }
        let http = Client::builder()
            .user_agent(concat!("lightrag_server/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidArgument(format!("HTTP client error: {e}")))?;
        let base_url = base_url
            .unwrap_or(OPENAI_API_URL)
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            http,
            api_key,
            base_url,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Text of the first choice.
    pub async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = CompletionBody {
            model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };
        let response = send_with_retry(&self.retry, "chat_completion", || {
            self.http.post(&url).bearer_auth(&self.api_key).json(&body)
        })
        .await
        .map_err(|e| Error::Llm(format!("LLM request to {url} failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Llm(format!("Failed to read LLM response: {e}")))?;
        if !status.is_success() {
            return Err(Error::Llm(format!(
                "LLM endpoint returned {status}: {}",
                truncate_body(&text)
            )));
        }

        let reply: CompletionReply = serde_json::from_str(&text)
            .map_err(|e| Error::Llm(format!("Invalid LLM response: {e}")))?;
        if let Some(usage) = &reply.usage {
            debug!(
                model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "LLM completion"
            );
        }
        reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| Error::Llm("LLM returned an empty completion".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(server: &MockServer) -> OpenAIClient {
        OpenAIClient::new("test_key", Some(&server.base_url()), Duration::from_secs(5))
            .unwrap()
            .with_retry(RetryPolicy::none())
    }

    fn options() -> CompletionOptions {
        CompletionOptions {
            temperature: 0.0,
            max_tokens: None,
        }
    }

    #[test]
    fn empty_key_is_rejected() {
        let err = OpenAIClient::new("   ", None, Duration::from_secs(5)).unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn base_url_loses_trailing_slash() {
        let client =
            OpenAIClient::new("k", Some("http://host:8000/v1/"), Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url, "http://host:8000/v1");
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(ERROR_BODY_LIMIT + 10);
        let cut = truncate_body(&body);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), ERROR_BODY_LIMIT + 3);
    }

    #[tokio::test]
    async fn first_choice_is_returned() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/chat/completions")
                .header("Authorization", "Bearer test_key");
            then.status(200).json_body(json!({
                "choices": [ { "message": { "role": "assistant", "content": "entity<|>Alice" } } ],
                "usage": { "prompt_tokens": 12, "completion_tokens": 3 }
            }));
        });

        let reply = client(&server)
            .complete("gpt-4o-mini", &[ChatMessage::new("user", "extract")], &options())
            .await
            .unwrap();
        assert_eq!(reply, "entity<|>Alice");
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn error_status_carries_body() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(401).body("invalid api key");
        });

        let err = client(&server)
            .complete("gpt-4o-mini", &[], &options())
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("401"));
        assert!(msg.contains("invalid api key"));
    }

    #[tokio::test]
    async fn rate_limit_is_retried() {
        let server = MockServer::start_async().await;
        let limited = server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(429).body("slow down");
        });

        let client = client(&server).with_retry(RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::ZERO,
        });
        let err = client.complete("m", &[], &options()).await.unwrap_err();
        assert!(err.to_string().contains("429"));
        limited.assert_calls(2);
    }

    #[tokio::test]
    async fn malformed_json_is_an_error() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).body("not json");
        });

        let err = client(&server).complete("m", &[], &options()).await.unwrap_err();
        assert!(err.to_string().contains("Invalid LLM response"));
    }

    #[tokio::test]
    async fn blank_completion_is_an_error() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).json_body(json!({
                "choices": [ { "message": { "role": "assistant", "content": "  " } } ]
            }));
        });

        let err = client(&server).complete("m", &[], &options()).await.unwrap_err();
        assert!(err.to_string().contains("empty completion"));
    }

    #[tokio::test]
    async fn max_tokens_is_sent_only_when_set() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/chat/completions").is_true(|req| {
                let body: serde_json::Value =
                    serde_json::from_slice(req.body().as_ref()).unwrap();
                body["max_tokens"] == 64
            });
            then.status(200).json_body(json!({
                "choices": [ { "message": { "role": "assistant", "content": "Ok" } } ]
            }));
        });

        let opts = CompletionOptions {
            temperature: 0.0,
            max_tokens: Some(64),
        };
        let reply = client(&server)
            .complete("m", &[ChatMessage::new("user", "x")], &opts)
            .await
            .unwrap();
        assert_eq!(reply, "Ok");
        mock.assert_calls(1);
    }
}
