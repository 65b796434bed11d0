//! JSON-file storages for one collection directory.
//!
//! Each storage loads its file on open, works in memory and writes the whole
//! file back on [`flush`](JsonKvStorage::flush) via tmp file + rename.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, warn};

use super::utils::compute_id;
use crate::error::{Error, Result};
use crate::integrations::embeddings::{cosine_similarity, Embedder};

pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body)?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}

fn read_json_map(path: &Path) -> Result<Map<String, Value>> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let raw = fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    Ok(serde_json::from_str(&raw)?)
}

fn poisoned<T>(_: T) -> Error {
    Error::LockError("storage lock poisoned".to_string())
}

struct KvState {
    data: Map<String, Value>,
    dirty: bool,
}

/// Key-value namespace persisted as `kv_store_<namespace>.json`.
pub struct JsonKvStorage {
    namespace: String,
    path: PathBuf,
    state: RwLock<KvState>,
}

impl JsonKvStorage {
    pub fn open(dir: &Path, namespace: &str) -> Result<Self> {
        let path = dir.join(format!("kv_store_{namespace}.json"));
        let data = read_json_map(&path)?;
        Ok(Self {
            namespace: namespace.to_string(),
            path,
            state: RwLock::new(KvState { data, dirty: false }),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<Value>> {
        Ok(self.state.read().map_err(poisoned)?.data.get(id).cloned())
    }

    pub fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Option<Value>>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(ids.iter().map(|id| state.data.get(id).cloned()).collect())
    }

    /// Keys from `keys` that are not stored yet.
    pub fn filter_keys(&self, keys: &[String]) -> Result<HashSet<String>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(keys
            .iter()
            .filter(|k| !state.data.contains_key(k.as_str()))
            .cloned()
            .collect())
    }

    pub fn upsert(&self, items: impl IntoIterator<Item = (String, Value)>) -> Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        for (k, v) in items {
            state.data.insert(k, v);
        }
        state.dirty = true;
        Ok(())
    }

    pub fn delete(&self, ids: &[String]) -> Result<usize> {
        let mut state = self.state.write().map_err(poisoned)?;
        let removed = ids.iter().filter(|id| state.data.remove(id.as_str()).is_some()).count();
        if removed > 0 {
            state.dirty = true;
        }
        Ok(removed)
    }

    /// Remove every entry whose value matches `pred`.
    pub fn delete_where<F>(&self, pred: F) -> Result<usize>
    where
        F: Fn(&Value) -> bool,
    {
        let mut state = self.state.write().map_err(poisoned)?;
        let doomed: Vec<String> = state
            .data
            .iter()
            .filter(|(_, v)| pred(v))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &doomed {
            state.data.remove(k);
        }
        if !doomed.is_empty() {
            state.dirty = true;
        }
        Ok(doomed.len())
    }

    pub fn all(&self) -> Result<Map<String, Value>> {
        Ok(self.state.read().map_err(poisoned)?.data.clone())
    }

    /// Entries whose value has `field == value`.
    pub fn find_by_field(&self, field: &str, value: &str) -> Result<Vec<(String, Value)>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state
            .data
            .iter()
            .filter(|(_, v)| v.get(field).and_then(Value::as_str) == Some(value))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Chunks of one document ordered by `chunk_order_index`.
    pub fn get_by_doc_id(&self, doc_id: &str) -> Result<Vec<(String, Value)>> {
        let mut chunks = self.find_by_field("full_doc_id", doc_id)?;
        chunks.sort_by_key(|(_, v)| {
            v.get("chunk_order_index")
                .and_then(Value::as_u64)
                .unwrap_or(u64::MAX)
        });
        Ok(chunks)
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        if !state.dirty {
            return Ok(());
        }
        write_json_atomic(&self.path, &state.data)?;
        state.dirty = false;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum DocStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl DocStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocStatus::Pending => "pending",
            DocStatus::Processing => "processing",
            DocStatus::Processed => "processed",
            DocStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocProcessingStatus {
    pub content_summary: String,
    pub content_length: usize,
    pub file_path: String,
    pub status: DocStatus,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub track_id: Option<String>,
    #[serde(default)]
    pub chunks_count: Option<usize>,
    #[serde(default)]
    pub chunks_list: Vec<String>,
    #[serde(default)]
    pub error_msg: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Processing status per document, persisted as `kv_store_doc_status.json`.
pub struct DocStatusStorage {
    kv: JsonKvStorage,
}

impl DocStatusStorage {
    pub fn open(dir: &Path) -> Result<Self> {
        Ok(Self {
            kv: JsonKvStorage::open(dir, "doc_status")?,
        })
    }

    pub fn get(&self, doc_id: &str) -> Result<Option<DocProcessingStatus>> {
        match self.kv.get_by_id(doc_id)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Ids from `doc_ids` with no status record yet.
    pub fn filter_keys(&self, doc_ids: &[String]) -> Result<HashSet<String>> {
        self.kv.filter_keys(doc_ids)
    }

    pub fn upsert(&self, doc_id: &str, status: &DocProcessingStatus) -> Result<()> {
        self.kv
            .upsert([(doc_id.to_string(), serde_json::to_value(status)?)])
    }

    pub fn delete(&self, ids: &[String]) -> Result<usize> {
        self.kv.delete(ids)
    }

    /// Every well-formed record; malformed ones are logged and skipped.
    pub fn all(&self) -> Result<Vec<(String, DocProcessingStatus)>> {
        let mut docs: Vec<(String, DocProcessingStatus)> = self
            .kv
            .all()?
            .into_iter()
            .filter_map(|(id, value)| match serde_json::from_value(value) {
                Ok(status) => Some((id, status)),
                Err(err) => {
                    error!(doc_id = %id, "Skipping malformed doc status record: {err}");
                    None
                }
            })
            .collect();
        docs.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at).then(a.0.cmp(&b.0)));
        Ok(docs)
    }

    pub fn by_status(&self, statuses: &[DocStatus]) -> Result<Vec<(String, DocProcessingStatus)>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|(_, s)| statuses.contains(&s.status))
            .collect())
    }

    pub fn by_track_id(&self, track_id: &str) -> Result<Vec<(String, DocProcessingStatus)>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|(_, s)| s.track_id.as_deref() == Some(track_id))
            .collect())
    }

    pub fn status_counts(&self) -> Result<BTreeMap<DocStatus, usize>> {
        let mut counts = BTreeMap::new();
        for (_, s) in self.all()? {
            *counts.entry(s.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    pub fn len(&self) -> usize {
        self.kv.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kv.is_empty()
    }

    pub fn flush(&self) -> Result<()> {
        self.kv.flush()
    }
}

#[derive(Debug, Clone)]
struct VectorRecord {
    vector: Vec<f32>,
    meta: Map<String, Value>,
}

#[derive(Serialize, Deserialize)]
struct StoredVectors {
    embedding_dim: usize,
    data: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub id: String,
    pub score: f32,
    pub meta: Map<String, Value>,
}

/// Item to embed and store: id, text to embed, metadata kept alongside.
pub type VectorItem = (String, String, Map<String, Value>);

struct VectorState {
    embedding_dim: usize,
    records: BTreeMap<String, VectorRecord>,
    dirty: bool,
}

/// Flat cosine-similarity index persisted as `vdb_<namespace>.json`.
pub struct VectorStorage {
    namespace: String,
    path: PathBuf,
    state: RwLock<VectorState>,
}

impl VectorStorage {
    pub fn open(dir: &Path, namespace: &str, embedding_dim: usize) -> Result<Self> {
        let path = dir.join(format!("vdb_{namespace}.json"));
        let mut records = BTreeMap::new();
        let mut stored_dim = embedding_dim;
        if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let stored: StoredVectors = serde_json::from_str(&raw)?;
            stored_dim = stored.embedding_dim;
            for mut row in stored.data {
                let Some(Value::String(id)) = row.remove("__id__") else {
                    continue;
                };
                let vector: Vec<f32> = row
                    .remove("__vector__")
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                records.insert(id, VectorRecord { vector, meta: row });
            }
        }
        if stored_dim != embedding_dim && !records.is_empty() {
            warn!(
                namespace,
                stored_dim, embedding_dim, "Vector store dimension differs from the embedding model"
            );
        }
        Ok(Self {
            namespace: namespace.to_string(),
            path,
            state: RwLock::new(VectorState {
                embedding_dim: stored_dim,
                records,
                dirty: false,
            }),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Store precomputed vectors. Rows with an empty vector are skipped.
    pub fn upsert_vectors(&self, rows: Vec<(String, Vec<f32>, Map<String, Value>)>) -> Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        for (id, vector, meta) in rows {
            if vector.is_empty() {
                continue;
            }
            state.embedding_dim = vector.len();
            state.records.insert(id, VectorRecord { vector, meta });
        }
        state.dirty = true;
        Ok(())
    }

    /// Embed `content` of each item and store it with its metadata.
    pub async fn upsert(&self, embedder: &Embedder, items: Vec<VectorItem>, batch: usize) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut rows = Vec::with_capacity(items.len());
        for part in items.chunks(batch.max(1)) {
            let texts: Vec<String> = part.iter().map(|(_, content, _)| content.clone()).collect();
            let vectors = embedder.embed(&texts).await?;
            if vectors.len() != part.len() {
                return Err(Error::Embedding(format!(
                    "Expected {} embeddings, got {}",
                    part.len(),
                    vectors.len()
                )));
            }
            for ((id, content, mut meta), vector) in part.iter().cloned().zip(vectors) {
                meta.insert("content".into(), Value::String(content));
                rows.push((id, vector, meta));
            }
        }
        self.upsert_vectors(rows)
    }

    pub fn query_vector(&self, query: &[f32], top_k: usize, threshold: f32) -> Result<Vec<VectorHit>> {
        let state = self.state.read().map_err(poisoned)?;
        let mut hits: Vec<VectorHit> = state
            .records
            .iter()
            .map(|(id, rec)| (id, rec, cosine_similarity(query, &rec.vector)))
            .filter(|(_, _, score)| *score >= threshold)
            .map(|(id, rec, score)| VectorHit {
                id: id.clone(),
                score,
                meta: rec.meta.clone(),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    pub async fn query(
        &self,
        embedder: &Embedder,
        text: &str,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<VectorHit>> {
        let vectors = embedder.embed(&[text.to_string()]).await?;
        let Some(query) = vectors.into_iter().next() else {
            return Ok(Vec::new());
        };
        self.query_vector(&query, top_k, threshold)
    }

    pub fn get(&self, id: &str) -> Result<Option<Map<String, Value>>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.records.get(id).map(|r| r.meta.clone()))
    }

    pub fn delete(&self, ids: &[String]) -> Result<usize> {
        let mut state = self.state.write().map_err(poisoned)?;
        let removed = ids.iter().filter(|id| state.records.remove(id.as_str()).is_some()).count();
        if removed > 0 {
            state.dirty = true;
        }
        Ok(removed)
    }

    pub fn delete_entity(&self, name: &str) -> Result<usize> {
        self.delete(&[compute_id("ent-", name)])
    }

    /// Remove relation rows whose `src_id` or `tgt_id` is `name`.
    pub fn delete_entity_relations(&self, name: &str) -> Result<usize> {
        let mut state = self.state.write().map_err(poisoned)?;
        let doomed: Vec<String> = state
            .records
            .iter()
            .filter(|(_, r)| {
                r.meta.get("src_id").and_then(Value::as_str) == Some(name)
                    || r.meta.get("tgt_id").and_then(Value::as_str) == Some(name)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            state.records.remove(id);
        }
        if !doomed.is_empty() {
            state.dirty = true;
        }
        Ok(doomed.len())
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        if !state.dirty {
            return Ok(());
        }
        let data = state
            .records
            .iter()
            .map(|(id, rec)| {
                let mut row = rec.meta.clone();
                row.insert("__id__".into(), Value::String(id.clone()));
                row.insert("__vector__".into(), serde_json::to_value(&rec.vector)?);
                Ok(row)
            })
            .collect::<Result<Vec<_>>>()?;
        write_json_atomic(
            &self.path,
            &StoredVectors {
                embedding_dim: state.embedding_dim,
                data,
            },
        )?;
        state.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn status(s: DocStatus, track: &str, created: &str) -> DocProcessingStatus {
        DocProcessingStatus {
            content_summary: "summary".into(),
            content_length: 7,
            file_path: "a.txt".into(),
            status: s,
            created_at: created.into(),
            updated_at: created.into(),
            track_id: Some(track.into()),
            chunks_count: None,
            chunks_list: vec![],
            error_msg: None,
            metadata: Map::new(),
        }
    }

    #[test]
    fn kv_upsert_flush_reload() {
        let tmp = TempDir::new().unwrap();
        let kv = JsonKvStorage::open(tmp.path(), "full_docs").unwrap();
        kv.upsert([("doc-1".to_string(), json!({"content": "hello"}))]).unwrap();
        assert_eq!(
            kv.filter_keys(&["doc-1".into(), "doc-2".into()]).unwrap(),
            HashSet::from(["doc-2".to_string()])
        );
        kv.flush().unwrap();
        assert!(tmp.path().join("kv_store_full_docs.json").exists());

        let reopened = JsonKvStorage::open(tmp.path(), "full_docs").unwrap();
        assert_eq!(reopened.get_by_id("doc-1").unwrap().unwrap()["content"], "hello");
        assert_eq!(reopened.delete(&["doc-1".into(), "nope".into()]).unwrap(), 1);
        assert!(reopened.is_empty());
    }

    #[test]
    fn kv_find_and_delete_where() {
        let tmp = TempDir::new().unwrap();
        let kv = JsonKvStorage::open(tmp.path(), "text_chunks").unwrap();
        kv.upsert([
            ("c1".to_string(), json!({"full_doc_id": "d1"})),
            ("c2".to_string(), json!({"full_doc_id": "d2"})),
        ])
        .unwrap();
        assert_eq!(kv.find_by_field("full_doc_id", "d1").unwrap().len(), 1);
        kv.upsert([
            ("c3".to_string(), json!({"full_doc_id": "d1", "chunk_order_index": 1})),
            ("c0".to_string(), json!({"full_doc_id": "d1", "chunk_order_index": 0})),
        ])
        .unwrap();
        let ordered: Vec<String> = kv
            .get_by_doc_id("d1")
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ordered, vec!["c0", "c3", "c1"]);
        assert_eq!(kv.delete_where(|v| v["full_doc_id"] == "d2").unwrap(), 1);
        assert_eq!(kv.len(), 3);
    }

    #[test]
    fn doc_status_queries() {
        let tmp = TempDir::new().unwrap();
        let store = DocStatusStorage::open(tmp.path()).unwrap();
        store
            .upsert("doc-a", &status(DocStatus::Pending, "t1", "2024-01-01"))
            .unwrap();
        store
            .upsert("doc-b", &status(DocStatus::Processed, "t1", "2024-01-02"))
            .unwrap();
        store
            .upsert("doc-c", &status(DocStatus::Failed, "t2", "2024-01-03"))
            .unwrap();

        assert_eq!(store.by_track_id("t1").unwrap().len(), 2);
        assert_eq!(store.by_status(&[DocStatus::Pending]).unwrap()[0].0, "doc-a");
        let counts = store.status_counts().unwrap();
        assert_eq!(counts[&DocStatus::Failed], 1);
        assert_eq!(store.get("doc-b").unwrap().unwrap().status, DocStatus::Processed);
    }

    #[test]
    fn malformed_doc_status_is_skipped_but_kept() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("kv_store_doc_status.json"),
            r#"{"bad": {"status": 12}}"#,
        )
        .unwrap();
        let store = DocStatusStorage::open(tmp.path()).unwrap();
        assert!(store.all().unwrap().is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn doc_status_serializes_lowercase() {
        assert_eq!(serde_json::to_value(DocStatus::Processing).unwrap(), "processing");
    }

    #[test]
    fn vector_query_threshold_and_order() {
        let tmp = TempDir::new().unwrap();
        let vdb = VectorStorage::open(tmp.path(), "chunks", 2).unwrap();
        vdb.upsert_vectors(vec![
            ("a".into(), vec![1.0, 0.0], Map::new()),
            ("b".into(), vec![0.7, 0.7], Map::new()),
            ("c".into(), vec![0.0, 1.0], Map::new()),
            ("empty".into(), vec![], Map::new()),
        ])
        .unwrap();
        assert_eq!(vdb.len(), 3);

        let hits = vdb.query_vector(&[1.0, 0.0], 10, 0.2).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn vector_flush_and_reload() {
        let tmp = TempDir::new().unwrap();
        let vdb = VectorStorage::open(tmp.path(), "entities", 2).unwrap();
        let mut meta = Map::new();
        meta.insert("entity_name".into(), json!("Alice"));
        vdb.upsert_vectors(vec![(compute_id("ent-", "Alice"), vec![0.6, 0.8], meta)])
            .unwrap();
        vdb.flush().unwrap();

        let raw: Value =
            serde_json::from_str(&fs::read_to_string(tmp.path().join("vdb_entities.json")).unwrap())
                .unwrap();
        assert_eq!(raw["embedding_dim"], 2);
        assert!(raw["data"][0]["__vector__"].is_array());

        let reopened = VectorStorage::open(tmp.path(), "entities", 2).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.delete_entity("Alice").unwrap(), 1);
    }

    #[test]
    fn delete_entity_relations_by_endpoint() {
        let tmp = TempDir::new().unwrap();
        let vdb = VectorStorage::open(tmp.path(), "relationships", 2).unwrap();
        let meta = |s: &str, t: &str| {
            json!({"src_id": s, "tgt_id": t}).as_object().cloned().unwrap()
        };
        vdb.upsert_vectors(vec![
            ("r1".into(), vec![1.0, 0.0], meta("A", "B")),
            ("r2".into(), vec![1.0, 0.0], meta("C", "A")),
            ("r3".into(), vec![1.0, 0.0], meta("B", "C")),
        ])
        .unwrap();
        assert_eq!(vdb.delete_entity_relations("A").unwrap(), 2);
        assert_eq!(vdb.len(), 1);
    }

    #[tokio::test]
    async fn vector_upsert_embeds_content() {
        let tmp = TempDir::new().unwrap();
        let embedder = Embedder::local(32);
        let vdb = VectorStorage::open(tmp.path(), "chunks", 32).unwrap();
        vdb.upsert(
            &embedder,
            vec![
                ("c1".into(), "graph databases store relations".into(), Map::new()),
                ("c2".into(), "bananas are yellow fruit".into(), Map::new()),
            ],
            1,
        )
        .await
        .unwrap();
        let hits = vdb.query(&embedder, "graph relations", 1, 0.1).await.unwrap();
        assert_eq!(hits[0].id, "c1");
        assert_eq!(hits[0].meta["content"], "graph databases store relations");
    }
}
