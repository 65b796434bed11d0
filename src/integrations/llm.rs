//! Completion backend selected from the LLM configuration.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use super::ollama::{OllamaClient, OLLAMA_URL};
use super::openai::{ChatMessage, CompletionOptions, OpenAIClient};
use crate::config::{resolve_env_string, LlmConfig};
use crate::{Error, Result};

const OPTIONS: CompletionOptions = CompletionOptions {
    temperature: 0.0,
    max_tokens: None,
};

static THINK_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid think regex"));

/// Drop the reasoning block some local models prepend to their answer.
fn strip_reasoning(text: &str) -> String {
    THINK_BLOCK.replace_all(text, "").trim().to_string()
}

#[derive(Debug, Clone)]
pub enum LlmBackend {
    OpenAI { client: OpenAIClient, model: String },
    Ollama { client: OllamaClient, model: String },
}

impl LlmBackend {
    /// Build from configuration; `None` when no model is configured.
    pub fn from_config(config: &LlmConfig) -> Result<Option<Self>> {
        let Some(model) = resolve_env_string(config.llm_model.as_deref()) else {
            return Ok(None);
        };
        let binding = resolve_env_string(config.llm_binding.as_deref())
            .unwrap_or_else(|| "openai".to_string())
            .to_ascii_lowercase();
        let host = resolve_env_string(config.llm_binding_host.as_deref());
        let timeout = Duration::from_secs(config.llm_timeout.max(1));

        if binding == "ollama" {
            let client = OllamaClient::with_url(host.as_deref().unwrap_or(OLLAMA_URL), timeout)?;
            info!(%model, "Using Ollama LLM");
            return Ok(Some(Self::Ollama { client, model }));
        }

        let key = resolve_env_string(config.llm_binding_api_key.as_deref())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty()));
        let key = match (key, &host) {
            (Some(key), _) => key,
            // Self-hosted OpenAI-compatible servers usually ignore the key.
            (None, Some(_)) => "EMPTY".to_string(),
            (None, None) => {
                warn!(%model, "LLM API key not configured, LLM features are disabled");
                return Ok(None);
            }
        };
        let client = OpenAIClient::new(key, host.as_deref(), timeout)?;
        info!(%model, %binding, "Using OpenAI-compatible LLM");
        Ok(Some(Self::OpenAI { client, model }))
    }

    pub fn model(&self) -> &str {
        match self {
            Self::OpenAI { model, .. } | Self::Ollama { model, .. } => model,
        }
    }

    pub fn provider(&self) -> &'static str {
        match self {
            Self::OpenAI { .. } => "openai",
            Self::Ollama { .. } => "ollama",
        }
    }

    /// Fail fast when a local Ollama server is down; OpenAI-compatible hosts are not probed.
    pub async fn check_available(&self) -> Result<()> {
        let Self::Ollama { client, model } = self else {
            return Ok(());
        };
        if !client.is_running().await {
            return Err(Error::Llm("Ollama server is not reachable".to_string()));
        }
        let tagged = format!("{model}:");
        match client.list_models().await {
            Ok(models) => {
                if !models.iter().any(|m| m == model || m.starts_with(&tagged)) {
                    warn!(%model, "Model is not pulled on the Ollama server");
                }
            }
            Err(err) => warn!("Could not list Ollama models: {err}"),
        }
        Ok(())
    }

    /// Single completion with an optional system prompt and prior turns.
    pub async fn complete(
        &self,
        system: Option<&str>,
        history: &[ChatMessage],
        prompt: &str,
    ) -> Result<String> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        if let Some(system) = system {
            messages.push(ChatMessage::new("system", system));
        }
        messages.extend(history.iter().cloned());
        messages.push(ChatMessage::new("user", prompt));

        let raw = match self {
            Self::OpenAI { client, model } => client.complete(model, &messages, &OPTIONS).await?,
            Self::Ollama { client, model } => client.chat(model, &messages, &OPTIONS).await?,
        };
        Ok(strip_reasoning(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[test]
    fn reasoning_block_is_removed() {
        assert_eq!(strip_reasoning("<think>\nhmm\n</think>\n\nParis"), "Paris");
        assert_eq!(strip_reasoning("plain"), "plain");
    }

    #[test]
    fn no_model_means_no_backend() {
        assert!(LlmBackend::from_config(&LlmConfig::default()).unwrap().is_none());
    }

    #[test]
    fn ollama_binding_selected() {
        let cfg = LlmConfig {
            llm_binding: Some("Ollama".into()),
            llm_model: Some("qwen2.5".into()),
            ..Default::default()
        };
        let backend = LlmBackend::from_config(&cfg).unwrap().unwrap();
        assert_eq!(backend.provider(), "ollama");
        assert_eq!(backend.model(), "qwen2.5");
    }

    #[tokio::test]
    async fn ollama_availability_is_checked() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/api/tags");
            then.status(200)
                .json_body(json!({"models": [{"name": "qwen2.5:latest"}]}));
        });
        let cfg = LlmConfig {
            llm_binding: Some("ollama".into()),
            llm_model: Some("qwen2.5".into()),
            llm_binding_host: Some(server.base_url()),
            ..Default::default()
        };
        let backend = LlmBackend::from_config(&cfg).unwrap().unwrap();
        assert!(backend.check_available().await.is_ok());

        let down = LlmConfig {
            llm_binding_host: Some("http://127.0.0.1:1".into()),
            ..cfg
        };
        let backend = LlmBackend::from_config(&down).unwrap().unwrap();
        assert!(matches!(backend.check_available().await, Err(Error::Llm(_))));
    }

    #[tokio::test]
    async fn complete_sends_system_history_and_prompt() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/chat/completions").is_true(|req| {
                let body: serde_json::Value =
                    serde_json::from_slice(req.body().as_ref()).unwrap();
                let messages = body["messages"].as_array().cloned().unwrap_or_default();
                messages.len() == 3
                    && messages[0]["role"] == "system"
                    && messages[1]["content"] == "earlier"
                    && messages[2]["content"] == "now"
            });
            then.status(200).json_body(json!({
                "choices": [ { "message": { "role": "assistant", "content": "answer" } } ]
            }));
        });

        let cfg = LlmConfig {
            llm_binding: Some("openai".into()),
            llm_model: Some("gpt-4o-mini".into()),
            llm_binding_host: Some(server.base_url()),
            llm_binding_api_key: Some("k".into()),
            ..Default::default()
        };
        let backend = LlmBackend::from_config(&cfg).unwrap().unwrap();
        let reply = backend
            .complete(Some("sys"), &[ChatMessage::new("user", "earlier")], "now")
            .await
            .unwrap();
        assert_eq!(reply, "answer");
        mock.assert_calls(1);
    }
}
