//! Model clients built from one configuration snapshot.

use std::sync::{Arc, RwLock};

use tokio::sync::Semaphore;
use tracing::debug;

use super::embeddings::Embedder;
use super::llm::LlmBackend;
use super::openai::ChatMessage;
use super::rerank::RerankClient;
use crate::config::AppConfig;
use crate::constants::DEFAULT_SUMMARY_LANGUAGE;
use crate::metrics;
use crate::{Error, Result};

/// Engine tuning values taken from the `LIGHTRAG_CONFIG` section.
#[derive(Debug, Clone)]
pub struct RagSettings {
    pub chunk_token_size: usize,
    pub chunk_overlap_token_size: usize,
    pub cosine_better_than_threshold: f32,
    pub max_batch_size: usize,
    pub entity_extract_max_gleaning: usize,
    pub force_llm_summary_on_merge: usize,
    pub summary_max_tokens: usize,
    pub summary_language: String,
    pub entity_types: Vec<String>,
    pub top_k: usize,
    pub chunk_top_k: usize,
    pub max_entity_tokens: usize,
    pub max_relation_tokens: usize,
    pub max_total_tokens: usize,
    pub history_turns: usize,
    pub enable_llm_cache: bool,
    pub enable_llm_cache_for_entity_extract: bool,
    pub max_parallel_insert: usize,
    pub max_graph_nodes: usize,
    pub max_async: usize,
    pub enable_rerank: bool,
    pub min_rerank_score: f32,
}

impl From<&AppConfig> for RagSettings {
    fn from(config: &AppConfig) -> Self {
        let rag = &config.lightrag_config;
        Self {
            chunk_token_size: rag.chunk_token_size,
            chunk_overlap_token_size: rag.chunk_overlap_token_size,
            cosine_better_than_threshold: rag.cosine_better_than_threshold,
            max_batch_size: rag.max_batch_size.max(1),
            entity_extract_max_gleaning: rag.entity_extract_max_gleaning,
            force_llm_summary_on_merge: rag.force_llm_summary_on_merge,
            summary_max_tokens: rag.summary_max_tokens,
            summary_language: match rag.summary_language.trim() {
                "" => DEFAULT_SUMMARY_LANGUAGE.to_string(),
                language => language.to_string(),
            },
            entity_types: rag.entity_types.clone(),
            top_k: rag.top_k,
            chunk_top_k: rag.chunk_top_k,
            max_entity_tokens: rag.max_entity_tokens,
            max_relation_tokens: rag.max_relation_tokens,
            max_total_tokens: rag.max_total_tokens,
            history_turns: rag.history_turns,
            enable_llm_cache: rag.enable_llm_cache,
            enable_llm_cache_for_entity_extract: rag.enable_llm_cache_for_entity_extract,
            max_parallel_insert: rag.max_parallel_insert.max(1),
            max_graph_nodes: rag.max_graph_nodes.max(1),
            max_async: rag.max_async.max(1),
            enable_rerank: config.rerank_config.enable_rerank,
            min_rerank_score: config.rerank_config.min_rerank_score,
        }
    }
}

impl Default for RagSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// LLM, embedder and reranker shared by every collection.
///
/// Replaced wholesale when the configuration changes; holders of an older
/// `Arc<ModelClients>` finish their work with the clients they started with.
pub struct ModelClients {
    pub llm: Option<LlmBackend>,
    pub embedder: Embedder,
    pub reranker: Option<RerankClient>,
    pub settings: RagSettings,
    llm_slots: Semaphore,
}

impl ModelClients {
    pub fn new(
        llm: Option<LlmBackend>,
        embedder: Embedder,
        reranker: Option<RerankClient>,
        settings: RagSettings,
    ) -> Self {
        let llm_slots = Semaphore::new(settings.max_async);
        Self {
            llm,
            embedder,
            reranker,
            settings,
            llm_slots,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self::new(
            LlmBackend::from_config(&config.llm_config)?,
            Embedder::from_config(&config.embedding_config)?,
            RerankClient::from_config(&config.rerank_config)?,
            RagSettings::from(config),
        ))
    }

    /// No LLM or reranker, local embeddings.
    pub fn local(settings: RagSettings, embedding_dim: usize) -> Self {
        Self::new(None, Embedder::local(embedding_dim), None, settings)
    }

    pub fn has_llm(&self) -> bool {
        self.llm.is_some()
    }

    /// Run one completion, waiting for a free LLM slot first.
    pub async fn complete(
        &self,
        kind: &str,
        system: Option<&str>,
        history: &[ChatMessage],
        prompt: &str,
    ) -> Result<String> {
        let llm = self
            .llm
            .as_ref()
            .ok_or_else(|| Error::Llm("LLM is not configured".to_string()))?;
        let _slot = self
            .llm_slots
            .acquire()
            .await
            .map_err(|e| Error::Llm(format!("LLM limiter closed: {e}")))?;
        debug!(kind, model = llm.model(), "LLM call");
        metrics::record_llm_call(kind, false);
        llm.complete(system, history, prompt).await
    }
}

/// Swappable reference to the current [`ModelClients`].
#[derive(Clone)]
pub struct ClientsHandle(Arc<RwLock<Arc<ModelClients>>>);

impl ClientsHandle {
    pub fn new(clients: ModelClients) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(clients))))
    }

    pub fn current(&self) -> Arc<ModelClients> {
        match self.0.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, clients: ModelClients) {
        let clients = Arc::new(clients);
        match self.0.write() {
            Ok(mut guard) => *guard = clients,
            Err(poisoned) => *poisoned.into_inner() = clients,
        }
    }
}
