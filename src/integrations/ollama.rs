//! Ollama REST client: chat for completions, `/api/embed` for vectors.

use std::time::Duration;

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::openai::{truncate_body, ChatMessage, CompletionOptions};
use super::retry::{send_with_retry, RetryPolicy};
use crate::{Error, Result};

pub const OLLAMA_URL: &str = "http://localhost:11434";

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    options: SamplingOptions,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct SamplingOptions {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    message: ReplyMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct EmbedBody<'a> {
    model: &'a str,
    input: &'a [String],
    truncate: bool,
}

#[derive(Debug, Deserialize)]
struct EmbedReply {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct Tags {
    #[serde(default)]
    models: Vec<TaggedModel>,
}

#[derive(Debug, Deserialize)]
struct TaggedModel {
    name: String,
}

/// Decode a successful reply, or turn the status and body into an error.
async fn decode<T: DeserializeOwned>(
    response: Response,
    wrap: fn(String) -> Error,
) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(wrap(format!(
            "Ollama returned {status}: {}",
            truncate_body(&text)
        )));
    }
    response
        .json()
        .await
        .map_err(|e| wrap(format!("Invalid Ollama response: {e}")))
}

#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl OllamaClient {
    pub fn with_url(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidArgument(format!("HTTP client error: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// `/api/tags` answers within two seconds.
    pub async fn is_running(&self) -> bool {
        self.http
            .get(self.url("/api/tags"))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// Names of the locally pulled models, tags included (`qwen2.5:latest`).
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .http
            .get(self.url("/api/tags"))
            .send()
            .await
            .map_err(|e| Error::Llm(format!("Ollama request failed: {e}")))?;
        let tags: Tags = decode(response, Error::Llm).await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Non-streaming `/api/chat`.
    pub async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String> {
        let body = ChatBody {
            model,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: &m.role,
                    content: m.content.as_deref().unwrap_or_default(),
                })
                .collect(),
            stream: false,
            options: SamplingOptions {
                temperature: options.temperature,
                num_predict: options.max_tokens,
            },
        };
        let url = self.url("/api/chat");
        let response = send_with_retry(&self.retry, "ollama_chat", || {
            self.http.post(&url).json(&body)
        })
        .await
        .map_err(|e| Error::Llm(format!("Ollama request failed: {e}")))?;
        let reply: ChatReply = decode(response, Error::Llm).await?;
        Ok(reply.message.content)
    }

    /// One vector per input, in input order.
    pub async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>> {
        let body = EmbedBody {
            model,
            input: texts,
            truncate: true,
        };
        let url = self.url("/api/embed");
        let response = send_with_retry(&self.retry, "ollama_embed", || {
            self.http.post(&url).json(&body)
        })
        .await
        .map_err(|e| Error::Embedding(format!("Ollama request failed: {e}")))?;
        let reply: EmbedReply = decode(response, Error::Embedding).await?;
        if reply.embeddings.len() != texts.len() {
            return Err(Error::Embedding(format!(
                "Ollama returned {} embeddings for {} inputs",
                reply.embeddings.len(),
                texts.len()
            )));
        }
        Ok(reply.embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(server: &MockServer) -> OllamaClient {
        OllamaClient::with_url(&server.base_url(), Duration::from_secs(5))
            .unwrap()
            .with_retry(RetryPolicy::none())
    }

    #[tokio::test]
    async fn pulled_models_are_listed() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(GET).path("/api/tags");
            then.status(200).json_body(json!({
                "models": [ { "name": "qwen2.5:latest" }, { "name": "bge-m3:latest" } ]
            }));
        });

        let models = client(&server).list_models().await.unwrap();
        assert_eq!(models, vec!["qwen2.5:latest", "bge-m3:latest"]);
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn chat_sends_options_and_returns_content() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/api/chat").is_true(|req| {
                let body: serde_json::Value =
                    serde_json::from_slice(req.body().as_ref()).unwrap();
                body["stream"] == false
                    && body["options"]["num_predict"] == 128
                    && body["messages"][0]["role"] == "system"
            });
            then.status(200).json_body(json!({
                "message": { "role": "assistant", "content": "Berlin" }
            }));
        });

        let messages = [
            ChatMessage::new("system", "Answer briefly."),
            ChatMessage::new("user", "Where does Alice work?"),
        ];
        let options = CompletionOptions {
            temperature: 0.0,
            max_tokens: Some(128),
        };
        let reply = client(&server).chat("qwen2.5", &messages, &options).await.unwrap();
        assert_eq!(reply, "Berlin");
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn chat_failure_reports_status() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/api/chat");
            then.status(404).body("model 'qwen9' not found");
        });

        let err = client(&server)
            .chat("qwen9", &[ChatMessage::new("user", "Hi")], &CompletionOptions::default())
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, Error::Llm(_)));
        assert!(msg.contains("404"));
        assert!(msg.contains("not found"));
    }

    #[tokio::test]
    async fn embed_returns_vectors_in_order() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/api/embed").is_true(|req| {
                let body: serde_json::Value =
                    serde_json::from_slice(req.body().as_ref()).unwrap();
                body["model"] == "bge-m3" && body["truncate"] == true
            });
            then.status(200)
                .json_body(json!({ "embeddings": [[0.1, 0.2], [0.3, 0.4]] }));
        });

        let vectors = client(&server)
            .embed(&["a".to_string(), "b".to_string()], "bge-m3")
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn embed_count_mismatch_is_an_error() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/api/embed");
            then.status(200).json_body(json!({ "embeddings": [[0.1]] }));
        });

        let err = client(&server)
            .embed(&["a".to_string(), "b".to_string()], "m")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Embedding(_)));
    }

    #[tokio::test]
    async fn liveness_follows_http_status() {
        let healthy = MockServer::start_async().await;
        healthy.mock(|when, then| {
            when.method(GET).path("/api/tags");
            then.status(200).json_body(json!({ "models": [] }));
        });
        let failing = MockServer::start_async().await;
        failing.mock(|when, then| {
            when.method(GET).path("/api/tags");
            then.status(503);
        });

        assert!(client(&healthy).is_running().await);
        assert!(!client(&failing).is_running().await);
    }
}
