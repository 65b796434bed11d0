//! Application configuration: model, storage and query settings.
//!
//! The on-disk file keeps the upper-case keys used by LightRAG deployments so
//! existing `app_config.json` files load unchanged. Any string value written as
//! `${VAR}` is resolved from the environment when clients are built.

mod manager;
mod store;

pub use manager::ConfigManager;
pub use store::{BackupInfo, ConfigInfo, ConfigStore};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub lightrag_config: LightRagConfig,
    pub llm_config: LlmConfig,
    pub embedding_config: EmbeddingConfig,
    pub rerank_config: RerankConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct LightRagConfig {
    pub working_dir: Option<PathBuf>,
    pub kv_storage: String,
    pub vector_storage: String,
    pub graph_storage: String,
    pub doc_status_storage: String,
    pub chunk_token_size: usize,
    pub chunk_overlap_token_size: usize,
    pub llm_model_max_async: usize,
    pub cosine_better_than_threshold: f32,
    pub max_batch_size: usize,
    pub entity_extract_max_gleaning: usize,
    pub summary_to_max_tokens: usize,
    pub force_llm_summary_on_merge: usize,
    pub default_language: String,
    pub cosine_threshold: f32,
    pub enable_llm_cache_for_entity_extract: bool,
    pub enable_llm_cache: bool,
    pub max_parallel_insert: usize,
    pub max_graph_nodes: usize,
    pub chunk_overlap_size: usize,
    pub summary_context_size: usize,
    pub summary_max_tokens: usize,
    pub max_async: usize,
    pub summary_language: String,
    pub entity_types: Vec<String>,
    pub top_k: usize,
    pub chunk_top_k: usize,
    pub max_entity_tokens: usize,
    pub max_relation_tokens: usize,
    pub max_total_tokens: usize,
    pub history_turns: usize,
    pub ollama_emulating_model_name: String,
    pub tag: String,
    pub verbose: String,
}

impl Default for LightRagConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            kv_storage: "JsonKVStorage".to_string(),
            vector_storage: "NanoVectorDBStorage".to_string(),
            graph_storage: "NetworkXStorage".to_string(),
            doc_status_storage: "JsonDocStatusStorage".to_string(),
            chunk_token_size: 1200,
            chunk_overlap_token_size: 100,
            llm_model_max_async: 20,
            cosine_better_than_threshold: 0.2,
            max_batch_size: 32,
            entity_extract_max_gleaning: 0,
            summary_to_max_tokens: 2000,
            force_llm_summary_on_merge: 10,
            default_language: "Simplified Chinese".to_string(),
            cosine_threshold: 0.2,
            enable_llm_cache_for_entity_extract: true,
            enable_llm_cache: true,
            max_parallel_insert: 2,
            max_graph_nodes: 1000,
            chunk_overlap_size: 100,
            summary_context_size: 12000,
            summary_max_tokens: 3000,
            max_async: 4,
            summary_language: "Simplified Chinese".to_string(),
            entity_types: [
                "Organization",
                "Person",
                "Location",
                "Event",
                "Technology",
                "Equipment",
                "Product",
                "Document",
                "Category",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            top_k: 30,
            chunk_top_k: 10,
            max_entity_tokens: 10000,
            max_relation_tokens: 10000,
            max_total_tokens: 30000,
            history_turns: 0,
            ollama_emulating_model_name: "lightrag".to_string(),
            tag: "latest".to_string(),
            verbose: "false".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct LlmConfig {
    pub llm_binding: Option<String>,
    pub llm_model: Option<String>,
    pub llm_binding_host: Option<String>,
    pub llm_binding_api_key: Option<String>,
    pub llm_timeout: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            llm_binding: None,
            llm_model: None,
            llm_binding_host: None,
            llm_binding_api_key: None,
            llm_timeout: 240,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct EmbeddingConfig {
    pub embedding_binding: String,
    pub embedding_model: Option<String>,
    pub embedding_binding_host: Option<String>,
    pub embedding_binding_api_key: Option<String>,
    pub embedding_dim: usize,
    pub embedding_batch_num: usize,
    pub embedding_func_max_async: usize,
    pub embedding_max_token_size: usize,
    pub embedding_timeout: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            embedding_binding: "openai".to_string(),
            embedding_model: None,
            embedding_binding_host: None,
            embedding_binding_api_key: None,
            embedding_dim: 1024,
            embedding_batch_num: 10,
            embedding_func_max_async: 8,
            embedding_max_token_size: 8192,
            embedding_timeout: 240,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RerankConfig {
    pub enable_rerank: bool,
    pub rerank_binding: Option<String>,
    pub rerank_model: Option<String>,
    pub rerank_binding_host: Option<String>,
    pub rerank_binding_api_key: Option<String>,
    pub min_rerank_score: f32,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enable_rerank: true,
            rerank_binding: None,
            rerank_model: None,
            rerank_binding_host: None,
            rerank_binding_api_key: None,
            min_rerank_score: 0.6,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct LlmConfigPayload {
    pub llm_binding: Option<String>,
    pub llm_model: Option<String>,
    pub llm_binding_host: Option<String>,
    pub llm_binding_api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct EmbeddingConfigPayload {
    pub embedding_binding: Option<String>,
    pub embedding_model: Option<String>,
    pub embedding_binding_host: Option<String>,
    pub embedding_binding_api_key: Option<String>,
    pub embedding_dim: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RerankConfigPayload {
    pub enable_rerank: Option<bool>,
    pub rerank_binding: Option<String>,
    pub rerank_model: Option<String>,
    pub rerank_binding_host: Option<String>,
    pub rerank_binding_api_key: Option<String>,
    pub min_rerank_score: Option<f32>,
    pub cosine_better_than_threshold: Option<f32>,
    pub cosine_threshold: Option<f32>,
    pub max_batch_size: Option<usize>,
}

/// Configuration section addressed by reset operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSection {
    Llm,
    Embedding,
    Rerank,
    LightRag,
    All,
}

impl std::str::FromStr for ConfigSection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "llm" => Ok(Self::Llm),
            "embedding" => Ok(Self::Embedding),
            "rerank" => Ok(Self::Rerank),
            "lightrag" => Ok(Self::LightRag),
            "all" => Ok(Self::All),
            other => Err(Error::InvalidArgument(format!(
                "Unknown config type '{other}'. Use 'llm', 'embedding', 'rerank', 'lightrag' or 'all'"
            ))),
        }
    }
}

fn set_if<T>(target: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *target = v;
    }
}

fn set_opt_if<T>(target: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *target = value;
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        let rag = &self.lightrag_config;
        if self.embedding_config.embedding_dim == 0 {
            return Err(Error::config("EMBEDDING_DIM", "must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.rerank_config.min_rerank_score) {
            return Err(Error::config("MIN_RERANK_SCORE", "must be between 0 and 1"));
        }
        if !(0.0..=1.0).contains(&rag.cosine_better_than_threshold) {
            return Err(Error::config(
                "COSINE_BETTER_THAN_THRESHOLD",
                "must be between 0 and 1",
            ));
        }
        if !(0.0..=1.0).contains(&rag.cosine_threshold) {
            return Err(Error::config("COSINE_THRESHOLD", "must be between 0 and 1"));
        }
        if rag.chunk_token_size == 0 {
            return Err(Error::config("CHUNK_TOKEN_SIZE", "must be greater than 0"));
        }
        if rag.chunk_overlap_token_size >= rag.chunk_token_size {
            return Err(Error::config(
                "CHUNK_OVERLAP_TOKEN_SIZE",
                "must be smaller than CHUNK_TOKEN_SIZE",
            ));
        }
        if rag.max_batch_size == 0 {
            return Err(Error::config("MAX_BATCH_SIZE", "must be at least 1"));
        }
        if rag.top_k == 0 {
            return Err(Error::config("TOP_K", "must be at least 1"));
        }
        Ok(())
    }

    pub fn apply_llm(&mut self, payload: LlmConfigPayload) {
        let llm = &mut self.llm_config;
        set_opt_if(&mut llm.llm_binding, payload.llm_binding);
        set_opt_if(&mut llm.llm_model, payload.llm_model);
        set_opt_if(&mut llm.llm_binding_host, payload.llm_binding_host);
        set_opt_if(&mut llm.llm_binding_api_key, payload.llm_binding_api_key);
    }

    pub fn apply_embedding(&mut self, payload: EmbeddingConfigPayload) {
        let emb = &mut self.embedding_config;
        set_if(&mut emb.embedding_binding, payload.embedding_binding);
        set_opt_if(&mut emb.embedding_model, payload.embedding_model);
        set_opt_if(&mut emb.embedding_binding_host, payload.embedding_binding_host);
        set_opt_if(
            &mut emb.embedding_binding_api_key,
            payload.embedding_binding_api_key,
        );
        set_if(&mut emb.embedding_dim, payload.embedding_dim);
    }

    pub fn apply_rerank(&mut self, payload: RerankConfigPayload) {
        let rr = &mut self.rerank_config;
        set_if(&mut rr.enable_rerank, payload.enable_rerank);
        set_opt_if(&mut rr.rerank_binding, payload.rerank_binding);
        set_opt_if(&mut rr.rerank_model, payload.rerank_model);
        set_opt_if(&mut rr.rerank_binding_host, payload.rerank_binding_host);
        set_opt_if(&mut rr.rerank_binding_api_key, payload.rerank_binding_api_key);
        set_if(&mut rr.min_rerank_score, payload.min_rerank_score);

        let rag = &mut self.lightrag_config;
        set_if(
            &mut rag.cosine_better_than_threshold,
            payload.cosine_better_than_threshold,
        );
        set_if(&mut rag.cosine_threshold, payload.cosine_threshold);
        set_if(&mut rag.max_batch_size, payload.max_batch_size);
    }

    pub fn reset_section(&mut self, section: ConfigSection) {
        match section {
            ConfigSection::Llm => self.llm_config = LlmConfig::default(),
            ConfigSection::Embedding => self.embedding_config = EmbeddingConfig::default(),
            ConfigSection::Rerank => self.rerank_config = RerankConfig::default(),
            ConfigSection::LightRag => self.lightrag_config = LightRagConfig::default(),
            ConfigSection::All => *self = AppConfig::default(),
        }
    }
}

/// Resolve `${VAR}` references against the environment.
///
/// A plain value is returned unchanged. An unset variable or blank value yields `None`.
pub fn resolve_env_string(value: Option<&str>) -> Option<String> {
    let v = value?.trim();
    if v.starts_with("${") && v.ends_with('}') && v.len() > 3 {
        let var_name = &v[2..v.len() - 1];
        return std::env::var(var_name).ok().filter(|s| !s.trim().is_empty());
    }
    if v.is_empty() {
        None
    } else {
        Some(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.lightrag_config.chunk_token_size, 1200);
        assert_eq!(cfg.embedding_config.embedding_dim, 1024);
        assert_eq!(cfg.lightrag_config.entity_types.len(), 9);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: AppConfig = serde_json::from_str(
            r#"{"llm_config": {"LLM_MODEL": "gpt-4o-mini"}, "lightrag_config": {"TOP_K": 5}}"#,
        )
        .unwrap();
        assert_eq!(cfg.llm_config.llm_model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(cfg.llm_config.llm_timeout, 240);
        assert_eq!(cfg.lightrag_config.top_k, 5);
        assert_eq!(cfg.lightrag_config.chunk_top_k, 10);
    }

    #[test]
    fn serializes_upper_case_keys() {
        let value = serde_json::to_value(AppConfig::default()).unwrap();
        assert!(value["embedding_config"]["EMBEDDING_DIM"].is_number());
        assert!(value["rerank_config"]["MIN_RERANK_SCORE"].is_number());
        assert!(value["lightrag_config"]["COSINE_BETTER_THAN_THRESHOLD"].is_number());
    }

    #[test]
    fn validate_rejects_zero_dim() {
        let mut cfg = AppConfig::default();
        cfg.embedding_config.embedding_dim = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("EMBEDDING_DIM"));
    }

    #[test]
    fn validate_rejects_overlap_not_smaller_than_chunk() {
        let mut cfg = AppConfig::default();
        cfg.lightrag_config.chunk_overlap_token_size = 1200;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_rerank_score_out_of_range() {
        let mut cfg = AppConfig::default();
        cfg.rerank_config.min_rerank_score = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn apply_llm_only_touches_present_fields() {
        let mut cfg = AppConfig::default();
        cfg.llm_config.llm_binding = Some("openai".into());
        cfg.apply_llm(LlmConfigPayload {
            llm_model: Some("qwen".into()),
            ..Default::default()
        });
        assert_eq!(cfg.llm_config.llm_binding.as_deref(), Some("openai"));
        assert_eq!(cfg.llm_config.llm_model.as_deref(), Some("qwen"));
    }

    #[test]
    fn apply_rerank_updates_lightrag_thresholds() {
        let mut cfg = AppConfig::default();
        cfg.apply_rerank(RerankConfigPayload {
            cosine_better_than_threshold: Some(0.5),
            max_batch_size: Some(8),
            ..Default::default()
        });
        assert_eq!(cfg.lightrag_config.cosine_better_than_threshold, 0.5);
        assert_eq!(cfg.lightrag_config.max_batch_size, 8);
        assert!(cfg.rerank_config.enable_rerank);
    }

    #[test]
    fn reset_section_restores_defaults() {
        let mut cfg = AppConfig::default();
        cfg.embedding_config.embedding_dim = 3;
        cfg.llm_config.llm_model = Some("m".into());
        cfg.reset_section(ConfigSection::Embedding);
        assert_eq!(cfg.embedding_config.embedding_dim, 1024);
        assert_eq!(cfg.llm_config.llm_model.as_deref(), Some("m"));
    }

    #[test]
    fn config_section_parse() {
        assert_eq!("ALL".parse::<ConfigSection>().unwrap(), ConfigSection::All);
        assert!("bogus".parse::<ConfigSection>().is_err());
    }

    #[test]
    fn resolve_env_string_handles_plain_and_env() {
        assert_eq!(resolve_env_string(Some("abc")).as_deref(), Some("abc"));
        assert_eq!(resolve_env_string(Some("  ")), None);
        assert_eq!(resolve_env_string(None), None);
        std::env::set_var("LIGHTRAG_TEST_RESOLVE_KEY", "secret");
        assert_eq!(
            resolve_env_string(Some("${LIGHTRAG_TEST_RESOLVE_KEY}")).as_deref(),
            Some("secret")
        );
        std::env::remove_var("LIGHTRAG_TEST_RESOLVE_KEY");
        assert_eq!(resolve_env_string(Some("${LIGHTRAG_TEST_RESOLVE_KEY}")), None);
    }
}
