//! Embedding providers and the backend used by vector storage.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_openai::{
    config::OpenAIConfig,
    types::{CreateEmbeddingRequestArgs, EmbeddingInput},
    Client as OpenAIClient,
};
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::ollama::{OllamaClient, OLLAMA_URL};
use crate::config::{resolve_env_string, EmbeddingConfig};
use crate::{Error, Result};

const MAX_INPUT_CHARS: usize = 8000;
const JINA_API_URL: &str = "https://api.jina.ai/v1";

/// Service for generating text embeddings through an OpenAI-compatible API.
pub struct EmbeddingService {
    client: OpenAIClient<OpenAIConfig>,
    model: String,
}

impl EmbeddingService {
    pub fn new(api_key: &str, api_base: Option<&str>, model: impl Into<String>) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base) = api_base {
            config = config.with_api_base(base.trim_end_matches('/'));
        }
        Self {
            client: OpenAIClient::with_config(config),
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Generate embeddings for multiple texts in batch.
    ///
    /// Blank inputs map to empty vectors at the same position.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!("Generating embeddings for {} texts", texts.len());

        let processed: Vec<String> = texts
            .iter()
            .map(|t| t.trim().chars().take(MAX_INPUT_CHARS).collect::<String>())
            .filter(|t| !t.is_empty())
            .collect();

        if processed.is_empty() {
            return Ok(vec![Vec::new(); texts.len()]);
        }

        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::StringArray(processed))
            .build()
            .map_err(|e| Error::Embedding(e.to_string()))?;

        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| Error::Embedding(e.to_string()))?;

        debug!(
            "Generated {} embeddings, tokens used: {}",
            response.data.len(),
            response.usage.total_tokens
        );

        let mut data = response.data;
        data.sort_by_key(|e| e.index);
        let mut embed_iter = data.into_iter();
        let mut result = Vec::with_capacity(texts.len());
        for text in texts {
            if text.trim().is_empty() {
                result.push(Vec::new());
            } else if let Some(embed) = embed_iter.next() {
                result.push(embed.embedding);
            } else {
                return Err(Error::Embedding(
                    "Provider returned fewer embeddings than inputs".to_string(),
                ));
            }
        }

        Ok(result)
    }
}

/// Jina AI embeddings client.
#[derive(Debug, Clone)]
pub struct JinaClient {
    http: Client,
    api_key: String,
    pub(crate) base_url: String,
    model: String,
    dimensions: usize,
}

#[derive(Debug, Serialize)]
struct JinaRequest<'a> {
    model: &'a str,
    input: &'a [String],
    dimensions: usize,
    embedding_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct JinaResponse {
    data: Vec<JinaEmbedding>,
}

#[derive(Debug, Deserialize)]
struct JinaEmbedding {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl JinaClient {
    pub fn new(
        api_key: impl Into<String>,
        base_url: Option<&str>,
        model: impl Into<String>,
        dimensions: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidArgument(format!("HTTP client error: {}", e)))?;
        let base = base_url
            .unwrap_or(JINA_API_URL)
            .trim_end_matches('/')
            .trim_end_matches("/embeddings")
            .to_string();
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: base,
            model: model.into(),
            dimensions,
        })
    }

    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&JinaRequest {
                model: &self.model,
                input: texts,
                dimensions: self.dimensions,
                embedding_type: "float",
            })
            .send()
            .await
            .map_err(|e| Error::Embedding(format!("Jina request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Embedding(format!("Failed to read response: {}", e)))?;
        if !status.is_success() {
            return Err(Error::Embedding(format!("Jina error {}: {}", status, text)));
        }
        let mut parsed: JinaResponse = serde_json::from_str(&text)
            .map_err(|e| Error::Embedding(format!("Invalid response: {}", e)))?;
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Deterministic, fast embedding for offline/local use.
#[derive(Debug, Clone)]
pub struct LocalEmbedder {
    dim: usize,
}

impl LocalEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dim];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            token.to_lowercase().hash(&mut hasher);
            let idx = (hasher.finish() as usize) % self.dim;
            vec[idx] += 1.0;
        }

        normalize(&mut vec);
        vec
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }
}

pub fn normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

/// Cosine similarity; zero for empty, mismatched or zero-norm input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[allow(clippy::large_enum_variant)]
pub enum EmbedBackend {
    OpenAI(EmbeddingService),
    Ollama { client: OllamaClient, model: String },
    Jina(JinaClient),
    Local(LocalEmbedder),
}

/// Embedding backend plus its batching limits.
pub struct Embedder {
    backend: EmbedBackend,
    dim: usize,
    batch_size: usize,
    max_async: usize,
}

impl Embedder {
    pub fn new(backend: EmbedBackend, dim: usize, batch_size: usize, max_async: usize) -> Self {
        Self {
            backend,
            dim,
            batch_size: batch_size.max(1),
            max_async: max_async.max(1),
        }
    }

    pub fn local(dim: usize) -> Self {
        let local = LocalEmbedder::new(dim);
        let dim = local.dimension();
        Self::new(EmbedBackend::Local(local), dim, 32, 1)
    }

    /// Build from configuration, falling back to local embeddings when the
    /// selected binding lacks a model or credentials.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let binding = config.embedding_binding.trim().to_ascii_lowercase();
        let model = resolve_env_string(config.embedding_model.as_deref());
        let host = resolve_env_string(config.embedding_binding_host.as_deref());
        let key = resolve_env_string(config.embedding_binding_api_key.as_deref());
        let timeout = Duration::from_secs(config.embedding_timeout.max(1));
        let dim = config.embedding_dim;

        let backend = match (binding.as_str(), model) {
            ("ollama", Some(model)) => {
                let client = OllamaClient::with_url(host.as_deref().unwrap_or(OLLAMA_URL), timeout)?;
                info!(%model, "Using Ollama embeddings");
                EmbedBackend::Ollama { client, model }
            }
            ("jina", Some(model)) => match key.or_else(|| std::env::var("JINA_API_KEY").ok()) {
                Some(key) => {
                    info!(%model, "Using Jina embeddings");
                    EmbedBackend::Jina(JinaClient::new(key, host.as_deref(), model, dim, timeout)?)
                }
                None => {
                    warn!("Jina embeddings selected without an API key, falling back to local embeddings");
                    EmbedBackend::Local(LocalEmbedder::new(dim))
                }
            },
            (_, Some(model)) => match key.or_else(|| std::env::var("OPENAI_API_KEY").ok()) {
                Some(key) => {
                    info!(%model, "Using OpenAI-compatible embeddings");
                    EmbedBackend::OpenAI(EmbeddingService::new(&key, host.as_deref(), model))
                }
                None => {
                    warn!("Embedding API key not configured, falling back to local embeddings");
                    EmbedBackend::Local(LocalEmbedder::new(dim))
                }
            },
            (_, None) => {
                warn!("Embedding model not configured, falling back to local embeddings");
                EmbedBackend::Local(LocalEmbedder::new(dim))
            }
        };

        let dim = match &backend {
            EmbedBackend::Local(local) => local.dimension(),
            _ => dim,
        };
        Ok(Self::new(
            backend,
            dim,
            config.embedding_batch_num,
            config.embedding_func_max_async,
        ))
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn provider(&self) -> &'static str {
        match self.backend {
            EmbedBackend::OpenAI(_) => "openai",
            EmbedBackend::Ollama { .. } => "ollama",
            EmbedBackend::Jina(_) => "jina",
            EmbedBackend::Local(_) => "local",
        }
    }

    async fn embed_one_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match &self.backend {
            EmbedBackend::OpenAI(service) => service.embed_batch(texts).await,
            EmbedBackend::Ollama { client, model } => client.embed(texts, model).await,
            EmbedBackend::Jina(client) => client.embed(texts).await,
            EmbedBackend::Local(local) => Ok(texts.iter().map(|t| local.embed(t)).collect()),
        }
    }

    /// Embed texts in order, batching and running batches concurrently.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let batch_futures: Vec<_> = texts
            .chunks(self.batch_size)
            .map(|batch| self.embed_one_batch(batch))
            .collect();
        let batches: Vec<Vec<Vec<f32>>> = stream::iter(batch_futures)
            .buffered(self.max_async)
            .try_collect()
            .await?;
        Ok(batches.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    #[test]
    fn local_embedder_is_deterministic_and_normalized() {
        let local = LocalEmbedder::new(64);
        let a = local.embed("Graph based retrieval");
        let b = local.embed("graph BASED retrieval");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn local_embedder_enforces_minimum_dimension() {
        assert_eq!(LocalEmbedder::new(2).dimension(), 8);
    }

    #[test]
    fn cosine_similarity_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn from_config_without_model_uses_local() {
        let cfg = EmbeddingConfig {
            embedding_dim: 32,
            ..Default::default()
        };
        let embedder = Embedder::from_config(&cfg).unwrap();
        assert_eq!(embedder.provider(), "local");
        assert_eq!(embedder.dimension(), 32);
    }

    #[test]
    fn from_config_ollama_selected() {
        let cfg = EmbeddingConfig {
            embedding_binding: "ollama".into(),
            embedding_model: Some("bge-m3".into()),
            ..Default::default()
        };
        let embedder = Embedder::from_config(&cfg).unwrap();
        assert_eq!(embedder.provider(), "ollama");
    }

    #[tokio::test]
    async fn embed_batches_preserve_order() {
        let embedder = Embedder::new(EmbedBackend::Local(LocalEmbedder::new(16)), 16, 2, 3);
        let texts: Vec<String> = (0..5).map(|i| format!("text number {i}")).collect();
        let vectors = embedder.embed(&texts).await.unwrap();
        assert_eq!(vectors.len(), 5);
        let local = LocalEmbedder::new(16);
        assert_eq!(vectors[4], local.embed("text number 4"));
    }

    #[tokio::test]
    async fn openai_embed_batch_short_circuits_on_empty_texts() {
        let service = EmbeddingService::new("test_key", None, "text-embedding-3-small");
        let embeddings = service
            .embed_batch(&["   ".to_string(), "\n".to_string()])
            .await
            .unwrap();
        assert_eq!(embeddings.len(), 2);
        assert!(embeddings.iter().all(|e| e.is_empty()));
    }

    #[tokio::test]
    async fn jina_embed_sorts_by_index() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/embeddings")
                .header("Authorization", "Bearer jina_key");
            then.status(200).json_body(json!({
                "data": [
                    { "index": 1, "embedding": [0.0, 1.0] },
                    { "index": 0, "embedding": [1.0, 0.0] }
                ]
            }));
        });

        let client = JinaClient::new(
            "jina_key",
            Some(&server.base_url()),
            "jina-embeddings-v3",
            2,
            Duration::from_secs(5),
        )
        .unwrap();
        let vectors = client
            .embed(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors[0], vec![1.0, 0.0]);
        assert_eq!(vectors[1], vec![0.0, 1.0]);
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn jina_error_status_is_reported() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/embeddings");
            then.status(401).body("unauthorized");
        });
        let client =
            JinaClient::new("k", Some(&server.base_url()), "m", 2, Duration::from_secs(5)).unwrap();
        let err = client.embed(&["a".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("Jina error 401"));
    }
}
