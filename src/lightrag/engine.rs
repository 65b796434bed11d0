//! One RAG instance per collection directory.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::cache::LlmCache;
use super::chunker::{Chunk, Chunker};
use super::entity_extractor::{parse_extraction, ChunkExtraction, EntityExtractor};
use super::graph::{prop_str, KnowledgeGraph, Properties, Subgraph};
use super::merge::{
    endpoint_node, entity_vdb_item, group_entities, group_relations, merge_edge, merge_node,
    pair, relation_vdb_id, relation_vdb_item, Merged,
};
use super::pipeline::PipelineStatus;
use super::prompts::{render, SUMMARIZE_DESCRIPTIONS};
use super::query::{QueryParam, QueryResult, QuerySources};
use super::storage::{
    DocProcessingStatus, DocStatus, DocStatusStorage, JsonKvStorage, VectorItem, VectorStorage,
};
use super::tokenizer::truncate_to_tokens;
use super::utils::{clean_text, compute_id, now_rfc3339, split_field, summary_of};
use crate::constants::{CONTENT_SUMMARY_CHARS, GRAPH_FIELD_SEP};
use crate::integrations::{ClientsHandle, ModelClients};
use crate::metrics;
use crate::{Error, Result};

const GRAPH_FILE: &str = "graph_chunk_entity_relation.json";

/// Storage namespaces of one collection.
pub const STORAGE_NAMESPACES: &[&str] = &[
    "full_docs",
    "text_chunks",
    "llm_response_cache",
    "full_entities",
    "full_relations",
    "entities",
    "relationships",
    "chunks",
    "chunk_entity_relation",
    "doc_status",
];

/// File that could not be turned into a document.
#[derive(Debug, Clone)]
pub struct ErrorFile {
    pub file_path: String,
    pub error_description: String,
    pub original_error: String,
    pub file_size: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeletionResult {
    pub status: String,
    pub doc_id: String,
    pub message: String,
    pub status_code: u16,
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EntityInfo {
    pub exists: bool,
    pub node_count: usize,
    pub edge_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityEdit {
    pub entity_name: String,
    pub properties: Properties,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelationEdit {
    pub src_id: String,
    pub tgt_id: String,
    pub relation_type: String,
    pub properties: Properties,
}

pub struct LightRag {
    workspace: String,
    dir: PathBuf,
    clients: ClientsHandle,
    full_docs: JsonKvStorage,
    text_chunks: JsonKvStorage,
    llm_cache: JsonKvStorage,
    full_entities: JsonKvStorage,
    full_relations: JsonKvStorage,
    doc_status: DocStatusStorage,
    entities_vdb: VectorStorage,
    relationships_vdb: VectorStorage,
    chunks_vdb: VectorStorage,
    graph: RwLock<KnowledgeGraph>,
    merge_lock: Mutex<()>,
    pipeline: Mutex<PipelineStatus>,
}

fn graph_poisoned<T>(_: T) -> Error {
    Error::LockError("graph lock poisoned".to_string())
}

impl LightRag {
    /// Load every storage of the collection in `dir`.
    pub fn open(workspace: &str, dir: &Path, clients: ClientsHandle) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let dim = clients.current().embedder.dimension();
        let graph = KnowledgeGraph::load(&dir.join(GRAPH_FILE))?;
        info!(
            workspace,
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "Opened collection"
        );
        Ok(Self {
            workspace: workspace.to_string(),
            dir: dir.to_path_buf(),
            full_docs: JsonKvStorage::open(dir, "full_docs")?,
            text_chunks: JsonKvStorage::open(dir, "text_chunks")?,
            llm_cache: JsonKvStorage::open(dir, "llm_response_cache")?,
            full_entities: JsonKvStorage::open(dir, "full_entities")?,
            full_relations: JsonKvStorage::open(dir, "full_relations")?,
            doc_status: DocStatusStorage::open(dir)?,
            entities_vdb: VectorStorage::open(dir, "entities", dim)?,
            relationships_vdb: VectorStorage::open(dir, "relationships", dim)?,
            chunks_vdb: VectorStorage::open(dir, "chunks", dim)?,
            graph: RwLock::new(graph),
            merge_lock: Mutex::new(()),
            pipeline: Mutex::new(PipelineStatus::new()),
            clients,
        })
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn doc_status(&self) -> &DocStatusStorage {
        &self.doc_status
    }

    pub fn pipeline(&self) -> &Mutex<PipelineStatus> {
        &self.pipeline
    }

    pub fn storage_namespaces(&self) -> &'static [&'static str] {
        STORAGE_NAMESPACES
    }

    pub fn enable_llm_cache_for_entity_extract(&self) -> bool {
        self.clients
            .current()
            .settings
            .enable_llm_cache_for_entity_extract
    }

    fn flush_all(&self) -> Result<()> {
        self.full_docs.flush()?;
        self.text_chunks.flush()?;
        self.llm_cache.flush()?;
        self.full_entities.flush()?;
        self.full_relations.flush()?;
        self.doc_status.flush()?;
        self.entities_vdb.flush()?;
        self.relationships_vdb.flush()?;
        self.chunks_vdb.flush()?;
        let graph = self.graph.read().map_err(graph_poisoned)?;
        graph.save(&self.dir.join(GRAPH_FILE))
    }

    /// Store new documents as `pending`; content already known is skipped.
    pub async fn enqueue_documents(
        &self,
        inputs: Vec<(String, String)>,
        track_id: &str,
    ) -> Result<Vec<String>> {
        let mut cleaned = Vec::new();
        for (content, file_path) in inputs {
            let content = clean_text(&content);
            if content.is_empty() {
                warn!(%file_path, "Ignoring empty document");
                continue;
            }
            cleaned.push((compute_id("doc-", &content), content, file_path));
        }
        let ids: Vec<String> = cleaned.iter().map(|(id, _, _)| id.clone()).collect();
        let unseen = self.doc_status.filter_keys(&ids)?;

        let mut new_ids: Vec<String> = Vec::new();
        let now = now_rfc3339();
        for (doc_id, content, file_path) in cleaned {
            if !unseen.contains(&doc_id) || new_ids.contains(&doc_id) {
                warn!(%doc_id, %file_path, "Ignoring duplicate document");
                continue;
            }
            self.full_docs.upsert([(
                doc_id.clone(),
                json!({"content": content, "file_path": file_path}),
            )])?;
            self.doc_status.upsert(
                &doc_id,
                &DocProcessingStatus {
                    content_summary: summary_of(&content, CONTENT_SUMMARY_CHARS),
                    content_length: content.chars().count(),
                    file_path,
                    status: DocStatus::Pending,
                    created_at: now.clone(),
                    updated_at: now.clone(),
                    track_id: Some(track_id.to_string()),
                    chunks_count: None,
                    chunks_list: Vec::new(),
                    error_msg: None,
                    metadata: Map::new(),
                },
            )?;
            new_ids.push(doc_id);
        }
        self.full_docs.flush()?;
        self.doc_status.flush()?;
        if !new_ids.is_empty() {
            info!(workspace = %self.workspace, count = new_ids.len(), "Enqueued documents");
        }
        Ok(new_ids)
    }

    /// Record files that failed extraction as `failed` documents.
    pub async fn enqueue_error_documents(
        &self,
        errors: Vec<ErrorFile>,
        track_id: &str,
    ) -> Result<Vec<String>> {
        let now = now_rfc3339();
        let mut ids = Vec::with_capacity(errors.len());
        for file in errors {
            let doc_id = compute_id(
                "error-",
                &format!("{}-{}", file.file_path, file.error_description),
            );
            let mut metadata = Map::new();
            metadata.insert("error_type".into(), json!("file_extraction_error"));
            self.doc_status.upsert(
                &doc_id,
                &DocProcessingStatus {
                    content_summary: file.error_description,
                    content_length: file.file_size,
                    file_path: file.file_path,
                    status: DocStatus::Failed,
                    created_at: now.clone(),
                    updated_at: now.clone(),
                    track_id: Some(track_id.to_string()),
                    chunks_count: Some(0),
                    chunks_list: Vec::new(),
                    error_msg: Some(file.original_error),
                    metadata,
                },
            )?;
            ids.push(doc_id);
        }
        self.doc_status.flush()?;
        Ok(ids)
    }

    /// Process every pending document; a call during a running job only
    /// flags another round.
    pub async fn process_enqueued(&self) -> Result<()> {
        {
            let mut pipeline = self.pipeline.lock().await;
            if pipeline.busy {
                pipeline.request_pending = true;
                info!(workspace = %self.workspace, "Pipeline busy, request queued");
                return Ok(());
            }
            pipeline.begin_job("Default Job", 0, 0);
        }

        let result = self.process_rounds().await;
        let mut pipeline = self.pipeline.lock().await;
        if let Err(err) = &result {
            pipeline.log(format!("Pipeline failed: {err}"));
        }
        pipeline.finish("Document processing pipeline completed");
        result
    }

    async fn process_rounds(&self) -> Result<()> {
        loop {
            let docs = self
                .doc_status
                .by_status(&[DocStatus::Pending, DocStatus::Processing])?;
            if docs.is_empty() {
                self.pipeline.lock().await.log("No documents to process");
            } else {
                self.process_batch(docs).await;
            }

            let mut pipeline = self.pipeline.lock().await;
            if !pipeline.request_pending {
                break;
            }
            pipeline.request_pending = false;
            pipeline.log("Processing additional documents due to pending request");
        }
        Ok(())
    }

    async fn process_batch(&self, docs: Vec<(String, DocProcessingStatus)>) {
        let clients = self.clients.current();
        let total = docs.len();
        {
            let mut pipeline = self.pipeline.lock().await;
            pipeline.docs = total;
            pipeline.batchs = total;
            pipeline.cur_batch = 0;
            pipeline.log(format!("Processing {total} document(s)"));
        }
        let completed = AtomicUsize::new(0);

        stream::iter(docs)
            .map(|(doc_id, status)| {
                let clients = Arc::clone(&clients);
                let completed = &completed;
                async move {
                    let file_path = status.file_path.clone();
                    match self.process_document(&clients, &doc_id, status.clone()).await {
                        Ok(()) => {
                            let k = completed.fetch_add(1, Ordering::SeqCst) + 1;
                            metrics::record_document_result(true);
                            let mut pipeline = self.pipeline.lock().await;
                            pipeline.cur_batch = k;
                            pipeline.log(format!(
                                "Completed processing file {k}/{total}: {file_path}"
                            ));
                        }
                        Err(err) => {
                            metrics::record_document_result(false);
                            error!(%doc_id, "Document processing failed: {err}");
                            self.pipeline
                                .lock()
                                .await
                                .log(format!("Failed to process document {doc_id}: {err}"));
                            let mut failed = status;
                            failed.status = DocStatus::Failed;
                            failed.error_msg = Some(err.to_string());
                            failed.updated_at = now_rfc3339();
                            if let Err(e) = self.doc_status.upsert(&doc_id, &failed) {
                                error!(%doc_id, "Failed to record failure: {e}");
                            }
                        }
                    }
                    if let Err(err) = self.flush_all() {
                        error!(workspace = %self.workspace, "Failed to flush storages: {err}");
                    }
                }
            })
            .buffer_unordered(clients.settings.max_parallel_insert)
            .collect::<Vec<()>>()
            .await;
    }

    async fn process_document(
        &self,
        clients: &ModelClients,
        doc_id: &str,
        mut status: DocProcessingStatus,
    ) -> Result<()> {
        self.pipeline
            .lock()
            .await
            .log(format!("Processing d-id: {doc_id}"));
        status.status = DocStatus::Processing;
        status.updated_at = now_rfc3339();
        status.error_msg = None;
        status.metadata.insert(
            "processing_start_time".into(),
            json!(chrono::Utc::now().timestamp()),
        );
        self.doc_status.upsert(doc_id, &status)?;

        let content = self
            .full_docs
            .get_by_id(doc_id)?
            .and_then(|v| v.get("content").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| Error::NotFound(format!("Content of document {doc_id}")))?;

        let settings = &clients.settings;
        let chunks = Chunker::new(settings.chunk_token_size, settings.chunk_overlap_token_size)
            .chunk(&content, doc_id, &status.file_path);
        self.text_chunks.upsert(
            chunks
                .iter()
                .map(|c| Ok((c.id.clone(), serde_json::to_value(c)?)))
                .collect::<Result<Vec<_>>>()?,
        )?;
        let chunk_items: Vec<VectorItem> = chunks.iter().map(chunk_vdb_item).collect();
        self.chunks_vdb
            .upsert(&clients.embedder, chunk_items, settings.max_batch_size)
            .await?;

        let extractor = EntityExtractor::new(clients, &self.llm_cache);
        let n = chunks.len();
        let extraction_futures: Vec<_> = chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let extractor = &extractor;
                async move {
                    let found = extractor.extract_chunk(chunk).await?;
                    self.pipeline.lock().await.log(format!(
                        "Chunk {} of {n} extracted {} Ent + {} Rel",
                        i + 1,
                        found.entities.len(),
                        found.relations.len()
                    ));
                    Ok::<_, Error>(found)
                }
            })
            .collect();
        let extractions: Vec<ChunkExtraction> = stream::iter(extraction_futures)
            .buffered(settings.max_async)
            .try_collect()
            .await?;

        let (entity_names, relation_pairs) = self.merge_extractions(clients, extractions).await?;
        self.full_entities.upsert([(
            doc_id.to_string(),
            json!({"entity_names": entity_names, "count": entity_names.len()}),
        )])?;
        self.full_relations.upsert([(
            doc_id.to_string(),
            json!({"relation_pairs": relation_pairs, "count": relation_pairs.len()}),
        )])?;

        status.status = DocStatus::Processed;
        status.chunks_count = Some(chunks.len());
        status.chunks_list = chunks.iter().map(|c| c.id.clone()).collect();
        status.updated_at = now_rfc3339();
        status.metadata.insert(
            "processing_end_time".into(),
            json!(chrono::Utc::now().timestamp()),
        );
        self.doc_status.upsert(doc_id, &status)
    }

    async fn summarize(
        &self,
        clients: &ModelClients,
        name: &str,
        fragments: &[String],
    ) -> Result<String> {
        let settings = &clients.settings;
        let prompt = render(
            SUMMARIZE_DESCRIPTIONS,
            &[
                ("language", settings.summary_language.as_str()),
                ("entity_name", name),
                ("description_list", fragments.join("\n").as_str()),
            ],
        );
        let cache = LlmCache::new(&self.llm_cache, settings.enable_llm_cache_for_entity_extract);
        let key = LlmCache::key("default", "summary", &[&prompt]);
        if let Some(hit) = cache.get(&key)? {
            metrics::record_llm_call("summary", true);
            return Ok(hit);
        }
        let summary = clients.complete("summary", None, &[], &prompt).await?;
        let summary = truncate_to_tokens(summary.trim(), settings.summary_max_tokens);
        cache.put(&key, &summary, "summary", None, &prompt)?;
        Ok(summary)
    }

    /// Summarize when the fragment count reaches the merge threshold.
    async fn finalize_description(
        &self,
        clients: &ModelClients,
        name: &str,
        merged: &mut Merged,
    ) -> Result<()> {
        let threshold = clients.settings.force_llm_summary_on_merge;
        if clients.has_llm() && threshold > 0 && merged.fragments.len() >= threshold {
            let summary = self.summarize(clients, name, &merged.fragments).await?;
            merged.set_description(summary);
        }
        Ok(())
    }

    async fn merge_extractions(
        &self,
        clients: &ModelClients,
        extractions: Vec<ChunkExtraction>,
    ) -> Result<(Vec<String>, Vec<(String, String)>)> {
        let (entities, relations): (Vec<_>, Vec<_>) = extractions
            .into_iter()
            .map(|e| (e.entities, e.relations))
            .unzip();
        let entity_groups = group_entities(entities.into_iter().flatten().collect());
        let relation_groups = group_relations(relations.into_iter().flatten().collect());

        let _merge = self.merge_lock.lock().await;
        let mut entity_rows = Vec::new();
        let mut relation_rows = Vec::new();
        let mut entity_names = Vec::new();
        let mut relation_pairs = Vec::new();

        for (name, records) in &entity_groups {
            let existing = self.graph.read().map_err(graph_poisoned)?.get_node(name).cloned();
            let mut merged = merge_node(name, existing.as_ref(), records);
            self.finalize_description(clients, name, &mut merged).await?;
            entity_rows.push(entity_vdb_item(name, &merged.properties));
            self.graph
                .write()
                .map_err(graph_poisoned)?
                .upsert_node(name, merged.properties);
            entity_names.push(name.clone());
        }

        for ((a, b), records) in &relation_groups {
            let (existing, missing) = {
                let graph = self.graph.read().map_err(graph_poisoned)?;
                let missing: Vec<&String> =
                    [a, b].into_iter().filter(|n| !graph.has_node(n)).collect();
                (graph.get_edge(a, b).cloned(), missing)
            };
            for endpoint in missing {
                let props = endpoint_node(endpoint, &records[0]);
                entity_rows.push(entity_vdb_item(endpoint, &props));
                self.graph
                    .write()
                    .map_err(graph_poisoned)?
                    .upsert_node(endpoint, props);
                entity_names.push(endpoint.clone());
            }
            let mut merged = merge_edge(existing.as_ref(), records);
            self.finalize_description(clients, &format!("{a}, {b}"), &mut merged)
                .await?;
            relation_rows.push(relation_vdb_item(a, b, &merged.properties));
            self.graph
                .write()
                .map_err(graph_poisoned)?
                .upsert_edge(a, b, merged.properties);
            relation_pairs.push((a.clone(), b.clone()));
        }

        let batch = clients.settings.max_batch_size;
        self.entities_vdb
            .upsert(&clients.embedder, entity_rows, batch)
            .await?;
        self.relationships_vdb
            .upsert(&clients.embedder, relation_rows, batch)
            .await?;
        Ok((entity_names, relation_pairs))
    }

    /// Remove a document and everything derived only from it.
    pub async fn delete_by_doc_id(&self, doc_id: &str) -> DeletionResult {
        let status = match self.doc_status.get(doc_id) {
            Ok(Some(status)) => status,
            Ok(None) => {
                return DeletionResult {
                    status: "not_found".into(),
                    doc_id: doc_id.into(),
                    message: format!("Document {doc_id} not found."),
                    status_code: 404,
                    file_path: None,
                }
            }
            Err(err) => return deletion_failure(doc_id, None, &err),
        };
        let file_path = Some(status.file_path.clone());
        match self.delete_document(doc_id, status).await {
            Ok(()) => DeletionResult {
                status: "success".into(),
                doc_id: doc_id.into(),
                message: format!("Document {doc_id} deleted successfully"),
                status_code: 200,
                file_path,
            },
            Err(err) => {
                error!(%doc_id, "Deletion failed: {err}");
                deletion_failure(doc_id, file_path, &err)
            }
        }
    }

    async fn delete_document(&self, doc_id: &str, status: DocProcessingStatus) -> Result<()> {
        let clients = self.clients.current();
        let _merge = self.merge_lock.lock().await;

        let chunk_ids: Vec<String> = if status.chunks_list.is_empty() {
            self.text_chunks
                .get_by_doc_id(doc_id)?
                .into_iter()
                .map(|(id, _)| id)
                .collect()
        } else {
            status.chunks_list.clone()
        };
        let doomed: HashSet<&str> = chunk_ids.iter().map(String::as_str).collect();

        let chunk_paths: HashMap<String, String> = self
            .text_chunks
            .all()?
            .into_iter()
            .map(|(id, v)| {
                let path = v
                    .get("file_path")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                (id, path)
            })
            .collect();

        let remaining = |source_id: &str| -> Option<Vec<String>> {
            let parts = split_field(source_id);
            if parts.iter().any(|p| doomed.contains(p)) {
                Some(
                    parts
                        .into_iter()
                        .filter(|p| !doomed.contains(p))
                        .map(str::to_string)
                        .collect(),
                )
            } else {
                None
            }
        };

        let (affected_edges, affected_nodes) = {
            let graph = self.graph.read().map_err(graph_poisoned)?;
            let edges: Vec<((String, String), Vec<String>)> = graph
                .edges()
                .filter_map(|(key, props)| {
                    remaining(prop_str(props, "source_id")).map(|r| (key.clone(), r))
                })
                .collect();
            let nodes: Vec<(String, Vec<String>)> = graph
                .nodes()
                .filter_map(|(name, props)| {
                    remaining(prop_str(props, "source_id")).map(|r| (name.clone(), r))
                })
                .collect();
            (edges, nodes)
        };

        let cache = LlmCache::new(&self.llm_cache, true);
        let cached_records = |chunks: &[String]| -> Result<ChunkExtraction> {
            let mut all = ChunkExtraction::default();
            for chunk_id in chunks {
                let path = chunk_paths.get(chunk_id).map(String::as_str).unwrap_or("");
                for record in cache.extraction_records(chunk_id)? {
                    let parsed = parse_extraction(&record, chunk_id, path);
                    all.entities.extend(parsed.entities);
                    all.relations.extend(parsed.relations);
                }
            }
            Ok(all)
        };

        let mut relation_rows = Vec::new();
        for ((a, b), left) in affected_edges {
            if left.is_empty() {
                self.graph.write().map_err(graph_poisoned)?.remove_edge(&a, &b);
                self.relationships_vdb.delete(&[relation_vdb_id(&a, &b)])?;
                continue;
            }
            let records: Vec<_> = cached_records(&left)?
                .relations
                .into_iter()
                .filter(|r| pair(&r.src_id, &r.tgt_id) == (a.clone(), b.clone()))
                .collect();
            let props = if records.is_empty() {
                let mut props = self
                    .graph
                    .read()
                    .map_err(graph_poisoned)?
                    .get_edge(&a, &b)
                    .cloned()
                    .unwrap_or_default();
                props.insert("source_id".into(), json!(left.join(GRAPH_FIELD_SEP)));
                props
            } else {
                let mut merged = merge_edge(None, &records);
                self.finalize_description(&clients, &format!("{a}, {b}"), &mut merged)
                    .await?;
                merged.properties
            };
            relation_rows.push(relation_vdb_item(&a, &b, &props));
            self.graph
                .write()
                .map_err(graph_poisoned)?
                .upsert_edge(&a, &b, props);
        }

        let mut entity_rows = Vec::new();
        for (name, left) in affected_nodes {
            if left.is_empty() {
                self.graph.write().map_err(graph_poisoned)?.remove_node(&name);
                self.entities_vdb.delete_entity(&name)?;
                self.relationships_vdb.delete_entity_relations(&name)?;
                continue;
            }
            let records: Vec<_> = cached_records(&left)?
                .entities
                .into_iter()
                .filter(|e| e.entity_name == name)
                .collect();
            let props = if records.is_empty() {
                let mut props = self
                    .graph
                    .read()
                    .map_err(graph_poisoned)?
                    .get_node(&name)
                    .cloned()
                    .unwrap_or_default();
                props.insert("source_id".into(), json!(left.join(GRAPH_FIELD_SEP)));
                props
            } else {
                let mut merged = merge_node(&name, None, &records);
                self.finalize_description(&clients, &name, &mut merged).await?;
                merged.properties
            };
            entity_rows.push(entity_vdb_item(&name, &props));
            self.graph
                .write()
                .map_err(graph_poisoned)?
                .upsert_node(&name, props);
        }

        // Rows of relations touching a node removed above are already gone.
        let relation_rows: Vec<VectorItem> = {
            let graph = self.graph.read().map_err(graph_poisoned)?;
            relation_rows
                .into_iter()
                .filter(|(_, _, meta)| {
                    let src = meta.get("src_id").and_then(Value::as_str).unwrap_or("");
                    let tgt = meta.get("tgt_id").and_then(Value::as_str).unwrap_or("");
                    graph.has_edge(src, tgt)
                })
                .collect()
        };
        let batch = clients.settings.max_batch_size;
        self.entities_vdb
            .upsert(&clients.embedder, entity_rows, batch)
            .await?;
        self.relationships_vdb
            .upsert(&clients.embedder, relation_rows, batch)
            .await?;

        self.chunks_vdb.delete(&chunk_ids)?;
        self.text_chunks.delete(&chunk_ids)?;
        cache.drop_chunks(&chunk_ids)?;
        let ids = [doc_id.to_string()];
        self.full_docs.delete(&ids)?;
        self.full_entities.delete(&ids)?;
        self.full_relations.delete(&ids)?;
        self.doc_status.delete(&ids)?;
        self.flush_all()?;
        info!(workspace = %self.workspace, %doc_id, chunks = chunk_ids.len(), "Deleted document");
        Ok(())
    }

    pub fn get_docs_by_track_id(&self, track_id: &str) -> Result<Vec<(String, DocProcessingStatus)>> {
        self.doc_status.by_track_id(track_id)
    }

    pub fn chunks_by_doc_id(&self, doc_id: &str) -> Result<Vec<(String, Value)>> {
        self.text_chunks.get_by_doc_id(doc_id)
    }

    pub fn graph_labels(&self) -> Result<Vec<String>> {
        Ok(self.graph.read().map_err(graph_poisoned)?.labels())
    }

    pub fn knowledge_graph(&self, label: &str, max_depth: usize, max_nodes: usize) -> Result<Subgraph> {
        let cap = self.clients.current().settings.max_graph_nodes;
        let graph = self.graph.read().map_err(graph_poisoned)?;
        Ok(graph.subgraph(label, max_depth, max_nodes.min(cap)))
    }

    pub fn entity_exists(&self, name: &str) -> Result<EntityInfo> {
        let graph = self.graph.read().map_err(graph_poisoned)?;
        if !graph.has_node(name) {
            return Ok(EntityInfo {
                exists: false,
                node_count: 0,
                edge_count: 0,
            });
        }
        let edges = graph.node_edges(name);
        let neighbours: HashSet<&str> = edges.iter().map(|(_, other)| other.as_str()).collect();
        Ok(EntityInfo {
            exists: true,
            node_count: neighbours.len() + 1,
            edge_count: edges.len(),
        })
    }

    fn relation_rows_of(graph: &KnowledgeGraph, name: &str) -> Vec<VectorItem> {
        graph
            .node_edges(name)
            .into_iter()
            .filter_map(|(a, b)| graph.get_edge(&a, &b).map(|p| relation_vdb_item(&a, &b, p)))
            .collect()
    }

    /// Update node properties, optionally renaming the entity.
    pub async fn edit_entity(
        &self,
        name: &str,
        updated_data: Map<String, Value>,
        allow_rename: bool,
    ) -> Result<EntityEdit> {
        let clients = self.clients.current();
        let _merge = self.merge_lock.lock().await;

        let new_name = updated_data
            .get("entity_name")
            .or_else(|| updated_data.get("new_name"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|n| !n.is_empty() && *n != name)
            .map(str::to_string);

        let (final_name, props, relation_rows) = {
            let mut graph = self.graph.write().map_err(graph_poisoned)?;
            if !graph.has_node(name) {
                return Err(Error::Validation(format!("Entity '{name}' does not exist")));
            }
            if let Some(target) = &new_name {
                if !allow_rename {
                    return Err(Error::Validation(
                        "Entity renaming is not allowed. Set allow_rename=True to enable this feature"
                            .to_string(),
                    ));
                }
                if graph.has_node(target) {
                    return Err(Error::Validation(format!(
                        "Entity name '{target}' already exists, cannot rename"
                    )));
                }
                graph.rename_node(name, target);
            }
            let final_name = new_name.clone().unwrap_or_else(|| name.to_string());
            let mut props = graph.get_node(&final_name).cloned().unwrap_or_default();
            for (key, value) in updated_data {
                if key != "entity_name" && key != "new_name" {
                    props.insert(key, value);
                }
            }
            props.insert("entity_id".into(), json!(final_name));
            graph.upsert_node(&final_name, props.clone());
            let rows = Self::relation_rows_of(&graph, &final_name);
            (final_name, props, rows)
        };

        if new_name.is_some() {
            self.entities_vdb.delete_entity(name)?;
            self.relationships_vdb.delete_entity_relations(name)?;
            info!(workspace = %self.workspace, old = name, new = %final_name, "Renamed entity");
        }
        let batch = clients.settings.max_batch_size;
        self.entities_vdb
            .upsert(&clients.embedder, vec![entity_vdb_item(&final_name, &props)], batch)
            .await?;
        self.relationships_vdb
            .upsert(&clients.embedder, relation_rows, batch)
            .await?;
        self.flush_all()?;
        Ok(EntityEdit {
            entity_name: final_name,
            properties: props,
        })
    }

    /// Update edge properties and re-embed the relation.
    pub async fn edit_relation(
        &self,
        src: &str,
        tgt: &str,
        updated_data: Map<String, Value>,
    ) -> Result<RelationEdit> {
        let clients = self.clients.current();
        let _merge = self.merge_lock.lock().await;
        let props = {
            let mut graph = self.graph.write().map_err(graph_poisoned)?;
            let Some(mut props) = graph.get_edge(src, tgt).cloned() else {
                return Err(Error::Validation(format!(
                    "Relation from '{src}' to '{tgt}' does not exist"
                )));
            };
            props.extend(updated_data);
            graph.upsert_edge(src, tgt, props.clone());
            props
        };
        self.relationships_vdb
            .upsert(
                &clients.embedder,
                vec![relation_vdb_item(src, tgt, &props)],
                clients.settings.max_batch_size,
            )
            .await?;
        self.flush_all()?;
        let relation_type = prop_str(&props, "keywords")
            .split(',')
            .map(str::trim)
            .find(|k| !k.is_empty())
            .unwrap_or("unknown")
            .to_string();
        Ok(RelationEdit {
            src_id: src.to_string(),
            tgt_id: tgt.to_string(),
            relation_type,
            properties: props,
        })
    }

    pub async fn query(&self, text: &str, param: &QueryParam) -> Result<QueryResult> {
        let clients = self.clients.current();
        QuerySources {
            clients: &clients,
            graph: &self.graph,
            entities_vdb: &self.entities_vdb,
            relationships_vdb: &self.relationships_vdb,
            chunks_vdb: &self.chunks_vdb,
            text_chunks: &self.text_chunks,
            llm_cache: &self.llm_cache,
        }
        .run(text, param)
        .await
    }
}

fn chunk_vdb_item(chunk: &Chunk) -> VectorItem {
    let mut meta = Map::new();
    meta.insert("full_doc_id".into(), json!(chunk.full_doc_id));
    meta.insert("file_path".into(), json!(chunk.file_path));
    meta.insert("tokens".into(), json!(chunk.tokens));
    meta.insert("chunk_order_index".into(), json!(chunk.chunk_order_index));
    (chunk.id.clone(), chunk.content.clone(), meta)
}

fn deletion_failure(doc_id: &str, file_path: Option<String>, err: &Error) -> DeletionResult {
    DeletionResult {
        status: "fail".into(),
        doc_id: doc_id.into(),
        message: format!("Error while deleting document {doc_id}: {err}"),
        status_code: 500,
        file_path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::RagSettings;
    use crate::lightrag::query::QueryMode;
    use tempfile::TempDir;

    fn open(dir: &Path) -> LightRag {
        let clients = ModelClients::local(RagSettings::default(), 256);
        LightRag::open("test", dir, ClientsHandle::new(clients)).unwrap()
    }

    const DOC: &str = "Alice works at Acme Corporation in Berlin. Bob manages Acme Corporation.";

    #[tokio::test]
    async fn enqueue_skips_duplicates() {
        let tmp = TempDir::new().unwrap();
        let rag = open(tmp.path());
        let ids = rag
            .enqueue_documents(
                vec![(DOC.into(), "a.txt".into()), (DOC.into(), "b.txt".into())],
                "track_1",
            )
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert!(ids[0].starts_with("doc-"));
        let again = rag
            .enqueue_documents(vec![(DOC.into(), "c.txt".into())], "track_2")
            .await
            .unwrap();
        assert!(again.is_empty());
        let status = rag.doc_status().get(&ids[0]).unwrap().unwrap();
        assert_eq!(status.status, DocStatus::Pending);
        assert_eq!(status.track_id.as_deref(), Some("track_1"));
    }

    #[tokio::test]
    async fn error_documents_are_failed() {
        let tmp = TempDir::new().unwrap();
        let rag = open(tmp.path());
        let ids = rag
            .enqueue_error_documents(
                vec![ErrorFile {
                    file_path: "bad.pdf".into(),
                    error_description: "[File Extraction]PDF processing error".into(),
                    original_error: "unsupported".into(),
                    file_size: 42,
                }],
                "track_e",
            )
            .await
            .unwrap();
        let status = rag.doc_status().get(&ids[0]).unwrap().unwrap();
        assert!(ids[0].starts_with("error-"));
        assert_eq!(status.status, DocStatus::Failed);
        assert_eq!(status.content_length, 42);
        assert_eq!(status.chunks_count, Some(0));
        assert_eq!(status.metadata["error_type"], "file_extraction_error");
    }

    #[tokio::test]
    async fn process_builds_graph_and_persists() {
        let tmp = TempDir::new().unwrap();
        let rag = open(tmp.path());
        let ids = rag
            .enqueue_documents(vec![(DOC.into(), "a.txt".into())], "t")
            .await
            .unwrap();
        rag.process_enqueued().await.unwrap();

        let status = rag.doc_status().get(&ids[0]).unwrap().unwrap();
        assert_eq!(status.status, DocStatus::Processed);
        assert_eq!(status.chunks_count, Some(1));
        assert!(rag.graph_labels().unwrap().contains(&"Alice".to_string()));
        assert!(rag.entity_exists("Acme").unwrap().exists);
        assert!(tmp.path().join(GRAPH_FILE).exists());
        assert!(tmp.path().join("vdb_chunks.json").exists());

        let pipeline = rag.pipeline().lock().await;
        assert!(!pipeline.busy);
        assert_eq!(pipeline.latest_message, "Document processing pipeline completed");
        assert!(pipeline
            .history_messages
            .iter()
            .any(|m| m.starts_with("Completed processing file 1/1")));
    }

    #[tokio::test]
    async fn busy_pipeline_flags_pending_request() {
        let tmp = TempDir::new().unwrap();
        let rag = open(tmp.path());
        rag.pipeline().lock().await.begin_job("Default Job", 0, 0);
        rag.process_enqueued().await.unwrap();
        assert!(rag.pipeline().lock().await.request_pending);
    }

    #[tokio::test]
    async fn context_only_query_returns_sections() {
        let tmp = TempDir::new().unwrap();
        let rag = open(tmp.path());
        rag.enqueue_documents(vec![(DOC.into(), "a.txt".into())], "t")
            .await
            .unwrap();
        rag.process_enqueued().await.unwrap();

        let param = QueryParam {
            mode: QueryMode::Mix,
            only_need_context: true,
            ..Default::default()
        };
        let context = rag
            .query("Where does Alice work?", &param)
            .await
            .unwrap()
            .into_text();
        assert!(context.contains("-----Entities(KG)-----"));
        assert!(context.contains("-----Document Chunks(DC)-----"));
        assert!(context.contains("Alice"));

        let answer = rag
            .query("Where does Alice work?", &QueryParam::default())
            .await;
        assert!(matches!(answer, Err(Error::Llm(_))));
    }

    #[tokio::test]
    async fn delete_removes_derived_data() {
        let tmp = TempDir::new().unwrap();
        let rag = open(tmp.path());
        let ids = rag
            .enqueue_documents(vec![(DOC.into(), "a.txt".into())], "t")
            .await
            .unwrap();
        rag.process_enqueued().await.unwrap();

        let result = rag.delete_by_doc_id(&ids[0]).await;
        assert_eq!(result.status, "success");
        assert_eq!(result.file_path.as_deref(), Some("a.txt"));
        assert!(rag.graph_labels().unwrap().is_empty());
        assert!(rag.chunks_by_doc_id(&ids[0]).unwrap().is_empty());
        assert!(rag.doc_status().get(&ids[0]).unwrap().is_none());

        let missing = rag.delete_by_doc_id(&ids[0]).await;
        assert_eq!(missing.status, "not_found");
        assert_eq!(missing.status_code, 404);
    }

    #[tokio::test]
    async fn shared_entities_survive_other_document_deletion() {
        let tmp = TempDir::new().unwrap();
        let rag = open(tmp.path());
        let ids = rag
            .enqueue_documents(
                vec![
                    (DOC.into(), "a.txt".into()),
                    ("Alice likes Paris.".into(), "b.txt".into()),
                ],
                "t",
            )
            .await
            .unwrap();
        rag.process_enqueued().await.unwrap();

        rag.delete_by_doc_id(&ids[0]).await;
        let labels = rag.graph_labels().unwrap();
        assert!(labels.contains(&"Alice".to_string()));
        assert!(labels.contains(&"Paris".to_string()));
        assert!(!labels.contains(&"Bob".to_string()));
    }

    #[tokio::test]
    async fn edit_entity_rules() {
        let tmp = TempDir::new().unwrap();
        let rag = open(tmp.path());
        rag.enqueue_documents(vec![(DOC.into(), "a.txt".into())], "t")
            .await
            .unwrap();
        rag.process_enqueued().await.unwrap();

        let mut rename = Map::new();
        rename.insert("entity_name".into(), json!("Alicia"));
        let err = rag.edit_entity("Alice", rename.clone(), false).await.unwrap_err();
        assert!(err.to_string().starts_with("Entity renaming is not allowed"));

        let err = rag.edit_entity("Nobody", Map::new(), true).await.unwrap_err();
        assert_eq!(err.to_string(), "Entity 'Nobody' does not exist");

        let mut taken = Map::new();
        taken.insert("entity_name".into(), json!("Bob"));
        let err = rag.edit_entity("Alice", taken, true).await.unwrap_err();
        assert_eq!(err.to_string(), "Entity name 'Bob' already exists, cannot rename");

        rename.insert("description".into(), json!("Renamed"));
        let edit = rag.edit_entity("Alice", rename, true).await.unwrap();
        assert_eq!(edit.entity_name, "Alicia");
        assert_eq!(edit.properties["description"], "Renamed");
        assert!(!rag.entity_exists("Alice").unwrap().exists);
        assert!(rag.entity_exists("Alicia").unwrap().edge_count > 0);
    }

    #[tokio::test]
    async fn edit_relation_requires_existing_edge() {
        let tmp = TempDir::new().unwrap();
        let rag = open(tmp.path());
        let err = rag.edit_relation("A", "B", Map::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "Relation from 'A' to 'B' does not exist");
    }
}
