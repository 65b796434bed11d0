//! Rerank client for Jina/Cohere-compatible `/rerank` endpoints.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::openai::truncate_body;
use super::retry::{send_with_retry, RetryPolicy};
use crate::config::{resolve_env_string, RerankConfig};
use crate::{Error, Result};

pub const DEFAULT_RERANK_URL: &str = "https://api.jina.ai/v1/rerank";
const DEFAULT_RERANK_MODEL: &str = "jina-reranker-v2-base-multilingual";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RerankResult {
    pub index: usize,
    pub relevance_score: f32,
}

#[derive(Debug, Clone)]
pub struct RerankClient {
    http: Client,
    api_key: Option<String>,
    endpoint: String,
    model: String,
    binding: String,
    retry: RetryPolicy,
}

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    top_n: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

fn endpoint_for(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.ends_with("/rerank") {
        host.to_string()
    } else {
        format!("{host}/rerank")
    }
}

impl RerankClient {
    pub fn new(
        binding: impl Into<String>,
        host: Option<&str>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidArgument(format!("HTTP client error: {}", e)))?;
        Ok(Self {
            http,
            api_key,
            endpoint: host.map(endpoint_for).unwrap_or_else(|| DEFAULT_RERANK_URL.to_string()),
            model: model.into(),
            binding: binding.into(),
            retry: RetryPolicy::default(),
        })
    }

    /// Build from configuration; `None` when no rerank binding is configured.
    pub fn from_config(config: &RerankConfig) -> Result<Option<Self>> {
        let Some(binding) = resolve_env_string(config.rerank_binding.as_deref()) else {
            return Ok(None);
        };
        let model = resolve_env_string(config.rerank_model.as_deref())
            .unwrap_or_else(|| DEFAULT_RERANK_MODEL.to_string());
        let host = resolve_env_string(config.rerank_binding_host.as_deref());
        let key = resolve_env_string(config.rerank_binding_api_key.as_deref());
        Self::new(binding, host.as_deref(), key, model, Duration::from_secs(60)).map(Some)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn binding(&self) -> &str {
        &self.binding
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Score documents against the query, highest relevance first.
    pub async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: Option<usize>,
    ) -> Result<Vec<RerankResult>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let body = RerankRequest {
            model: &self.model,
            query,
            documents,
            top_n,
        };
        let response = send_with_retry(&self.retry, "rerank", || {
            let request = self.http.post(&self.endpoint).json(&body);
            match &self.api_key {
                Some(key) => request.bearer_auth(key),
                None => request,
            }
        })
        .await
        .map_err(|e| Error::Rerank(format!("Rerank request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Rerank(format!("Failed to read response: {}", e)))?;
        if !status.is_success() {
            return Err(Error::Rerank(format!(
                "Rerank endpoint returned {status}: {}",
                truncate_body(&text)
            )));
        }
        let parsed: RerankResponse = serde_json::from_str(&text)
            .map_err(|e| Error::Rerank(format!("Invalid response: {}", e)))?;

        let mut results: Vec<RerankResult> = parsed
            .results
            .into_iter()
            .filter(|r| r.index < documents.len())
            .collect();
        results.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(results)
    }
}
