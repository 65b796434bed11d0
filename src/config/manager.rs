use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    AppConfig, ConfigSection, ConfigStore, EmbeddingConfig, EmbeddingConfigPayload, LlmConfig,
    LlmConfigPayload, RerankConfig, RerankConfigPayload,
};
use crate::error::Result;

const CACHE_TTL: Duration = Duration::from_secs(60);

struct Cached {
    config: AppConfig,
    loaded_at: Instant,
}

/// Cached access to the configuration store.
pub struct ConfigManager {
    store: ConfigStore,
    cache: RwLock<Option<Cached>>,
    revision: AtomicU64,
}

impl ConfigManager {
    pub fn new(store: ConfigStore) -> Self {
        Self {
            store,
            cache: RwLock::new(None),
            revision: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Incremented on every change written through this manager.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub async fn get(&self) -> Result<AppConfig> {
        {
            let guard = self.cache.read().await;
            if let Some(cached) = guard.as_ref() {
                if cached.loaded_at.elapsed() < CACHE_TTL {
                    return Ok(cached.config.clone());
                }
            }
        }
        self.reload().await
    }

    pub async fn reload(&self) -> Result<AppConfig> {
        let mut guard = self.cache.write().await;
        let config = self.store.load()?;
        debug!("Configuration cache refreshed");
        *guard = Some(Cached {
            config: config.clone(),
            loaded_at: Instant::now(),
        });
        Ok(config)
    }

    async fn update<F>(&self, apply: F) -> Result<AppConfig>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut guard = self.cache.write().await;
        let mut config = self.store.load()?;
        apply(&mut config);
        self.store.save(&config)?;
        *guard = Some(Cached {
            config: config.clone(),
            loaded_at: Instant::now(),
        });
        self.revision.fetch_add(1, Ordering::SeqCst);
        Ok(config)
    }

    pub async fn update_llm(&self, payload: LlmConfigPayload) -> Result<LlmConfig> {
        let config = self.update(|c| c.apply_llm(payload)).await?;
        info!("LLM configuration updated");
        Ok(config.llm_config)
    }

    pub async fn update_embedding(
        &self,
        payload: EmbeddingConfigPayload,
    ) -> Result<EmbeddingConfig> {
        let config = self.update(|c| c.apply_embedding(payload)).await?;
        info!("Embedding configuration updated");
        Ok(config.embedding_config)
    }

    pub async fn update_rerank(&self, payload: RerankConfigPayload) -> Result<RerankConfig> {
        let config = self.update(|c| c.apply_rerank(payload)).await?;
        info!("Rerank configuration updated");
        Ok(config.rerank_config)
    }

    pub async fn reset(&self, section: ConfigSection) -> Result<AppConfig> {
        self.update(|c| c.reset_section(section)).await
    }

    pub async fn restore(&self, backup: Option<&str>) -> Result<AppConfig> {
        let mut guard = self.cache.write().await;
        let config = self.store.restore_from_backup(backup)?;
        *guard = Some(Cached {
            config: config.clone(),
            loaded_at: Instant::now(),
        });
        self.revision.fetch_add(1, Ordering::SeqCst);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(tmp: &TempDir) -> ConfigManager {
        ConfigManager::new(ConfigStore::new(
            tmp.path().join("app_config.json"),
            tmp.path().join("backups"),
        ))
    }

    #[tokio::test]
    async fn get_returns_defaults_on_first_run() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        assert_eq!(mgr.get().await.unwrap(), AppConfig::default());
        assert_eq!(mgr.revision(), 0);
    }

    #[tokio::test]
    async fn update_llm_persists_and_bumps_revision() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let llm = mgr
            .update_llm(LlmConfigPayload {
                llm_binding: Some("ollama".into()),
                llm_model: Some("llama3".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(llm.llm_model.as_deref(), Some("llama3"));
        assert_eq!(mgr.revision(), 1);

        let reloaded = mgr.reload().await.unwrap();
        assert_eq!(reloaded.llm_config.llm_binding.as_deref(), Some("ollama"));
    }

    #[tokio::test]
    async fn invalid_update_is_rejected_and_not_cached() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let result = mgr
            .update_embedding(EmbeddingConfigPayload {
                embedding_dim: Some(0),
                ..Default::default()
            })
            .await;
        assert!(result.is_err());
        assert_eq!(mgr.get().await.unwrap().embedding_config.embedding_dim, 1024);
        assert_eq!(mgr.revision(), 0);
    }

    #[tokio::test]
    async fn reset_all_restores_defaults() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        mgr.update_rerank(RerankConfigPayload {
            min_rerank_score: Some(0.1),
            ..Default::default()
        })
        .await
        .unwrap();
        let cfg = mgr.reset(ConfigSection::All).await.unwrap();
        assert_eq!(cfg, AppConfig::default());
    }
}
