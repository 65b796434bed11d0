//! Collection registry: one lazily opened [`LightRag`] per working-dir subdirectory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{ConfigManager, ConfigStore};
use crate::documents::DocumentManager;
use crate::integrations::{ClientsHandle, ModelClients};
use crate::lightrag::LightRag;
use crate::paths::{ensure_directory, StorageLayout};
use crate::{Error, Result};

const MAX_COLLECTION_ID_LEN: usize = 128;

/// One collection as listed by [`LightRagManager::list_collections`].
#[derive(Debug, Clone)]
pub struct CollectionEntry {
    pub collection_id: String,
    pub doc_status: Map<String, Value>,
}

/// 1 to 128 characters from `[A-Za-z0-9_-]`, so an id is always a single plain path segment.
pub fn validate_collection_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_COLLECTION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidArgument("Invalid collection_id".to_string()))
    }
}

pub struct LightRagManager {
    layout: StorageLayout,
    config: ConfigManager,
    clients: ClientsHandle,
    instances: RwLock<HashMap<String, Arc<LightRag>>>,
}

impl LightRagManager {
    /// Load the configuration and build the model clients from it.
    pub async fn new(layout: StorageLayout) -> Result<Self> {
        layout.create_all()?;
        let config = ConfigManager::new(ConfigStore::new(
            layout.config_file(),
            layout.config_backups_dir(),
        ));
        let app_config = config.get().await?;
        let clients = ModelClients::from_config(&app_config)?;
        info!(
            llm = clients.llm.as_ref().map(|l| l.model()).unwrap_or("none"),
            embedding = clients.embedder.provider(),
            rerank = clients.reranker.is_some(),
            "Model clients ready"
        );
        Ok(Self::with_clients(layout, config, ClientsHandle::new(clients)))
    }

    pub fn with_clients(layout: StorageLayout, config: ConfigManager, clients: ClientsHandle) -> Self {
        Self {
            layout,
            config,
            clients,
            instances: RwLock::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn config(&self) -> &ConfigManager {
        &self.config
    }

    pub fn clients(&self) -> &ClientsHandle {
        &self.clients
    }

    /// Configured `WORKING_DIR`, or the layout default.
    pub async fn working_dir(&self) -> PathBuf {
        match self.config.get().await {
            Ok(cfg) => cfg
                .lightrag_config
                .working_dir
                .unwrap_or_else(|| self.layout.default_working_dir()),
            Err(err) => {
                warn!("Falling back to default working dir: {err}");
                self.layout.default_working_dir()
            }
        }
    }

    pub async fn collection_dir(&self, id: &str) -> Result<PathBuf> {
        validate_collection_id(id)?;
        Ok(self.working_dir().await.join(id))
    }

    pub async fn collection_exists(&self, id: &str) -> Result<bool> {
        Ok(self.collection_dir(id).await?.is_dir())
    }

    /// Every collection with its raw doc-status map; unreadable maps are empty.
    pub async fn list_collections(&self) -> Result<Vec<CollectionEntry>> {
        let base = self.working_dir().await;
        if !base.is_dir() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&base)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let collection_id = entry.file_name().to_string_lossy().into_owned();
            let status_file = entry.path().join("kv_store_doc_status.json");
            let doc_status = std::fs::read_to_string(&status_file)
                .ok()
                .and_then(|raw| serde_json::from_str::<Map<String, Value>>(&raw).ok())
                .unwrap_or_default();
            entries.push(CollectionEntry {
                collection_id,
                doc_status,
            });
        }
        entries.sort_by(|a, b| a.collection_id.cmp(&b.collection_id));
        Ok(entries)
    }

    /// Cached instance, opened on first use; `None` when the collection does not exist.
    pub async fn get_rag_instance(&self, id: &str) -> Result<Option<Arc<LightRag>>> {
        let dir = self.collection_dir(id).await?;
        if let Some(rag) = self.instances.read().await.get(id) {
            if dir.is_dir() {
                return Ok(Some(Arc::clone(rag)));
            }
        }
        if !dir.is_dir() {
            self.instances.write().await.remove(id);
            return Ok(None);
        }
        self.open_instance(id, dir).await.map(Some)
    }

    pub async fn create_rag_instance(&self, id: &str) -> Result<Arc<LightRag>> {
        let dir = self.collection_dir(id).await?;
        if let Some(rag) = self.instances.read().await.get(id) {
            if dir.is_dir() {
                return Ok(Arc::clone(rag));
            }
        }
        ensure_directory(&dir)?;
        self.open_instance(id, dir).await
    }

    async fn open_instance(&self, id: &str, dir: PathBuf) -> Result<Arc<LightRag>> {
        let mut instances = self.instances.write().await;
        if let Some(rag) = instances.get(id) {
            return Ok(Arc::clone(rag));
        }
        let rag = Arc::new(LightRag::open(id, &dir, self.clients.clone())?);
        instances.insert(id.to_string(), Arc::clone(&rag));
        info!(collection_id = id, dir = %dir.display(), "Collection instance created");
        Ok(rag)
    }

    pub async fn clear_rag_instance(&self, id: &str) -> Option<Arc<LightRag>> {
        self.instances.write().await.remove(id)
    }

    /// Rebuild model clients from the current configuration.
    pub async fn refresh_clients(&self) -> Result<()> {
        let config = self.config.reload().await?;
        self.clients.replace(ModelClients::from_config(&config)?);
        info!("Model clients refreshed from configuration");
        Ok(())
    }

    pub fn input_manager(&self, id: &str) -> Result<DocumentManager> {
        validate_collection_id(id)?;
        DocumentManager::new(self.layout.inputs_dir().join(id))
    }
}
