//! Query modes, parameters and context assembly.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::cache::LlmCache;
use super::entity_extractor::{EntityExtractor, Keywords};
use super::graph::{prop_f64, prop_str, KnowledgeGraph};
use super::prompts::{render, NAIVE_RAG_RESPONSE, RAG_RESPONSE};
use super::storage::{JsonKvStorage, VectorHit, VectorStorage};
use super::tokenizer::count_tokens;
use super::utils::{split_field, truncate_list_by_tokens};
use crate::constants::{DEFAULT_RELATED_CHUNK_NUMBER, DEFAULT_RESPONSE_TYPE, FAIL_RESPONSE};
use crate::integrations::openai::ChatMessage;
use crate::integrations::{ModelClients, RagSettings};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    Local,
    Global,
    Hybrid,
    Naive,
    #[default]
    Mix,
    Bypass,
}

impl QueryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMode::Local => "local",
            QueryMode::Global => "global",
            QueryMode::Hybrid => "hybrid",
            QueryMode::Naive => "naive",
            QueryMode::Mix => "mix",
            QueryMode::Bypass => "bypass",
        }
    }
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(QueryMode::Local),
            "global" => Ok(QueryMode::Global),
            "hybrid" => Ok(QueryMode::Hybrid),
            "naive" => Ok(QueryMode::Naive),
            "mix" => Ok(QueryMode::Mix),
            "bypass" => Ok(QueryMode::Bypass),
            other => Err(Error::InvalidArgument(format!("Unknown query mode: {other}"))),
        }
    }
}

/// Query options; unset limits come from [`RagSettings`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryParam {
    #[serde(default)]
    pub mode: QueryMode,
    #[serde(default)]
    pub only_need_context: bool,
    #[serde(default)]
    pub only_need_prompt: bool,
    pub response_type: Option<String>,
    pub top_k: Option<usize>,
    pub chunk_top_k: Option<usize>,
    pub max_entity_tokens: Option<usize>,
    pub max_relation_tokens: Option<usize>,
    pub max_total_tokens: Option<usize>,
    #[serde(default)]
    pub conversation_history: Vec<ChatMessage>,
    pub history_turns: Option<usize>,
    pub user_prompt: Option<String>,
    pub enable_rerank: Option<bool>,
}

#[derive(Debug, Clone)]
struct Limits {
    top_k: usize,
    chunk_top_k: usize,
    max_entity_tokens: usize,
    max_relation_tokens: usize,
    max_total_tokens: usize,
    history_turns: usize,
    response_type: String,
    user_prompt: String,
    rerank: bool,
}

impl QueryParam {
    fn limits(&self, settings: &RagSettings) -> Limits {
        Limits {
            top_k: self.top_k.unwrap_or(settings.top_k).max(1),
            chunk_top_k: self.chunk_top_k.unwrap_or(settings.chunk_top_k).max(1),
            max_entity_tokens: self.max_entity_tokens.unwrap_or(settings.max_entity_tokens),
            max_relation_tokens: self
                .max_relation_tokens
                .unwrap_or(settings.max_relation_tokens),
            max_total_tokens: self.max_total_tokens.unwrap_or(settings.max_total_tokens),
            history_turns: self.history_turns.unwrap_or(settings.history_turns),
            response_type: self
                .response_type
                .clone()
                .unwrap_or_else(|| DEFAULT_RESPONSE_TYPE.to_string()),
            user_prompt: self.user_prompt.clone().unwrap_or_default(),
            rerank: self.enable_rerank.unwrap_or(true) && settings.enable_rerank,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Text(String),
    Json(Value),
}

impl QueryResult {
    /// Text form; JSON is pretty-printed.
    pub fn into_text(self) -> String {
        match self {
            QueryResult::Text(text) => text,
            QueryResult::Json(value) => {
                serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
            }
        }
    }
}

/// Keep the last `turns` user/assistant pairs; 0 keeps everything.
pub fn limit_history(history: &[ChatMessage], turns: usize) -> Vec<ChatMessage> {
    let history: Vec<ChatMessage> = history
        .iter()
        .filter(|m| m.role == "user" || m.role == "assistant")
        .cloned()
        .collect();
    if turns == 0 || history.len() <= turns * 2 {
        return history;
    }
    history[history.len() - turns * 2..].to_vec()
}

pub fn history_text(history: &[ChatMessage]) -> String {
    history
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content.as_deref().unwrap_or("")))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone)]
struct EntityRow {
    name: String,
    entity_type: String,
    description: String,
    rank: usize,
    created_at: Value,
    file_path: String,
    source_id: String,
}

#[derive(Debug, Clone)]
struct RelationRow {
    src: String,
    tgt: String,
    description: String,
    keywords: String,
    weight: f64,
    rank: usize,
    created_at: Value,
    file_path: String,
    source_id: String,
}

#[derive(Debug, Clone)]
struct ChunkRow {
    id: String,
    content: String,
    file_path: String,
}

impl EntityRow {
    fn to_json(&self, id: usize) -> Value {
        json!({
            "id": id,
            "entity": self.name,
            "type": self.entity_type,
            "description": self.description,
            "rank": self.rank,
            "created_at": self.created_at,
            "file_path": self.file_path,
        })
    }
}

impl RelationRow {
    fn to_json(&self, id: usize) -> Value {
        json!({
            "id": id,
            "entity1": self.src,
            "entity2": self.tgt,
            "description": self.description,
            "keywords": self.keywords,
            "weight": self.weight,
            "rank": self.rank,
            "created_at": self.created_at,
            "file_path": self.file_path,
        })
    }

    fn key(&self) -> (String, String) {
        if self.src <= self.tgt {
            (self.src.clone(), self.tgt.clone())
        } else {
            (self.tgt.clone(), self.src.clone())
        }
    }
}

impl ChunkRow {
    fn to_json(&self, id: usize) -> Value {
        json!({"id": id, "content": self.content, "file_path": self.file_path})
    }
}

fn json_section(title: &str, rows: Vec<Value>) -> String {
    let body = serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".to_string());
    format!("-----{title}-----\n\n```json\n{body}\n```\n")
}

fn render_kg(entities: &[EntityRow], relations: &[RelationRow]) -> String {
    let ents = entities.iter().enumerate().map(|(i, e)| e.to_json(i + 1)).collect();
    let rels = relations.iter().enumerate().map(|(i, r)| r.to_json(i + 1)).collect();
    format!(
        "{}\n{}",
        json_section("Entities(KG)", ents),
        json_section("Relationships(KG)", rels)
    )
}

fn render_chunks(chunks: &[ChunkRow]) -> String {
    json_section(
        "Document Chunks(DC)",
        chunks.iter().enumerate().map(|(i, c)| c.to_json(i + 1)).collect(),
    )
}

/// Round-robin merge of two lists, keeping the first occurrence of each key.
fn interleave<T, K, F>(a: Vec<T>, b: Vec<T>, key: F) -> Vec<T>
where
    K: Eq + std::hash::Hash,
    F: Fn(&T) -> K,
{
    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(a.len() + b.len());
    let mut a = a.into_iter();
    let mut b = b.into_iter();
    loop {
        let (x, y) = (a.next(), b.next());
        if x.is_none() && y.is_none() {
            break;
        }
        for item in [x, y].into_iter().flatten() {
            if seen.insert(key(&item)) {
                merged.push(item);
            }
        }
    }
    merged
}

/// Storage handles a query reads from.
pub struct QuerySources<'a> {
    pub clients: &'a ModelClients,
    pub graph: &'a RwLock<KnowledgeGraph>,
    pub entities_vdb: &'a VectorStorage,
    pub relationships_vdb: &'a VectorStorage,
    pub chunks_vdb: &'a VectorStorage,
    pub text_chunks: &'a JsonKvStorage,
    pub llm_cache: &'a JsonKvStorage,
}

fn graph_poisoned<T>(_: T) -> Error {
    Error::LockError("graph lock poisoned".to_string())
}

impl<'a> QuerySources<'a> {
    fn threshold(&self) -> f32 {
        self.clients.settings.cosine_better_than_threshold
    }

    fn entity_row(graph: &KnowledgeGraph, name: &str) -> Option<EntityRow> {
        let props = graph.get_node(name)?;
        Some(EntityRow {
            name: name.to_string(),
            entity_type: prop_str(props, "entity_type").to_string(),
            description: prop_str(props, "description").to_string(),
            rank: graph.node_degree(name),
            created_at: props.get("created_at").cloned().unwrap_or(Value::Null),
            file_path: prop_str(props, "file_path").to_string(),
            source_id: prop_str(props, "source_id").to_string(),
        })
    }

    fn relation_row(graph: &KnowledgeGraph, a: &str, b: &str) -> Option<RelationRow> {
        let props = graph.get_edge(a, b)?;
        Some(RelationRow {
            src: a.to_string(),
            tgt: b.to_string(),
            description: prop_str(props, "description").to_string(),
            keywords: prop_str(props, "keywords").to_string(),
            weight: prop_f64(props, "weight"),
            rank: graph.edge_degree(a, b),
            created_at: props.get("created_at").cloned().unwrap_or(Value::Null),
            file_path: prop_str(props, "file_path").to_string(),
            source_id: prop_str(props, "source_id").to_string(),
        })
    }

    async fn local(&self, keywords: &str, top_k: usize) -> Result<(Vec<EntityRow>, Vec<RelationRow>)> {
        let hits = self
            .entities_vdb
            .query(&self.clients.embedder, keywords, top_k, self.threshold())
            .await?;
        let graph = self.graph.read().map_err(graph_poisoned)?;
        let entities: Vec<EntityRow> = hits
            .iter()
            .filter_map(|h| h.meta.get("entity_name").and_then(Value::as_str))
            .filter_map(|name| Self::entity_row(&graph, name))
            .collect();

        let mut seen = HashSet::new();
        let mut relations: Vec<RelationRow> = entities
            .iter()
            .flat_map(|e| graph.node_edges(&e.name))
            .filter_map(|(a, b)| Self::relation_row(&graph, &a, &b))
            .filter(|r| seen.insert(r.key()))
            .collect();
        relations.sort_by(|x, y| {
            y.rank
                .cmp(&x.rank)
                .then(y.weight.partial_cmp(&x.weight).unwrap_or(std::cmp::Ordering::Equal))
        });
        Ok((entities, relations))
    }

    async fn global(&self, keywords: &str, top_k: usize) -> Result<(Vec<EntityRow>, Vec<RelationRow>)> {
        let hits = self
            .relationships_vdb
            .query(&self.clients.embedder, keywords, top_k, self.threshold())
            .await?;
        let graph = self.graph.read().map_err(graph_poisoned)?;
        let relations: Vec<RelationRow> = hits
            .iter()
            .filter_map(|h| {
                let src = h.meta.get("src_id").and_then(Value::as_str)?;
                let tgt = h.meta.get("tgt_id").and_then(Value::as_str)?;
                Self::relation_row(&graph, src, tgt)
            })
            .collect();

        let mut seen = HashSet::new();
        let entities = relations
            .iter()
            .flat_map(|r| [r.src.clone(), r.tgt.clone()])
            .filter(|name| seen.insert(name.clone()))
            .filter_map(|name| Self::entity_row(&graph, &name))
            .collect();
        Ok((entities, relations))
    }

    fn load_chunks(&self, ids: &[String]) -> Result<Vec<ChunkRow>> {
        Ok(ids
            .iter()
            .zip(self.text_chunks.get_by_ids(ids)?)
            .filter_map(|(id, value)| {
                let value = value?;
                Some(ChunkRow {
                    id: id.clone(),
                    content: value.get("content")?.as_str()?.to_string(),
                    file_path: value
                        .get("file_path")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown_source")
                        .to_string(),
                })
            })
            .collect())
    }

    fn hit_chunks(hits: Vec<VectorHit>) -> Vec<String> {
        hits.into_iter().map(|h| h.id).collect()
    }

    async fn rerank(&self, query: &str, chunks: Vec<ChunkRow>, limits: &Limits) -> Vec<ChunkRow> {
        let Some(reranker) = self.clients.reranker.as_ref().filter(|_| limits.rerank) else {
            return chunks;
        };
        let documents: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        match reranker.rerank(query, &documents, Some(limits.chunk_top_k)).await {
            Ok(results) => {
                let min = self.clients.settings.min_rerank_score;
                let kept: Vec<ChunkRow> = results
                    .into_iter()
                    .filter(|r| r.relevance_score >= min)
                    .filter_map(|r| chunks.get(r.index).cloned())
                    .collect();
                debug!(before = chunks.len(), after = kept.len(), "Reranked chunks");
                kept
            }
            Err(err) => {
                warn!("Rerank failed, keeping vector order: {err}");
                chunks
            }
        }
    }

    async fn vector_chunks(&self, query: &str, top_k: usize) -> Result<Vec<String>> {
        let hits = self
            .chunks_vdb
            .query(&self.clients.embedder, query, top_k, self.threshold())
            .await?;
        Ok(Self::hit_chunks(hits))
    }

    async fn kg_context(
        &self,
        query: &str,
        mode: QueryMode,
        keywords: &Keywords,
        limits: &Limits,
    ) -> Result<Option<String>> {
        let ll = keywords.low_level_keywords.join(", ");
        let hl = keywords.high_level_keywords.join(", ");
        let (ll, hl) = match mode {
            QueryMode::Local if ll.is_empty() => (hl.clone(), String::new()),
            QueryMode::Global if hl.is_empty() => (String::new(), ll.clone()),
            _ => (ll, hl),
        };

        let local = if !ll.is_empty() && mode != QueryMode::Global {
            self.local(&ll, limits.top_k).await?
        } else {
            Default::default()
        };
        let global = if !hl.is_empty() && mode != QueryMode::Local {
            self.global(&hl, limits.top_k).await?
        } else {
            Default::default()
        };
        let entities = interleave(local.0, global.0, |e| e.name.clone());
        let relations = interleave(local.1, global.1, RelationRow::key);

        let entities = truncate_list_by_tokens(
            entities,
            |e| e.to_json(0).to_string(),
            limits.max_entity_tokens,
        );
        let relations = truncate_list_by_tokens(
            relations,
            |r| r.to_json(0).to_string(),
            limits.max_relation_tokens,
        );

        let take_sources = |source_id: &str| -> Vec<String> {
            split_field(source_id)
                .into_iter()
                .take(DEFAULT_RELATED_CHUNK_NUMBER)
                .map(str::to_string)
                .collect()
        };
        let entity_chunks: Vec<String> = entities.iter().flat_map(|e| take_sources(&e.source_id)).collect();
        let relation_chunks: Vec<String> =
            relations.iter().flat_map(|r| take_sources(&r.source_id)).collect();
        let mut chunk_ids = interleave(entity_chunks, relation_chunks, String::clone);
        if mode == QueryMode::Mix {
            let vector = self.vector_chunks(query, limits.chunk_top_k).await?;
            chunk_ids = interleave(vector, chunk_ids, String::clone);
        }

        let chunks = self.load_chunks(&chunk_ids)?;
        let mut chunks = self.rerank(query, chunks, limits).await;
        chunks.truncate(limits.chunk_top_k);

        if entities.is_empty() && relations.is_empty() && chunks.is_empty() {
            return Ok(None);
        }

        let kg = render_kg(&entities, &relations);
        let overhead = count_tokens(&kg) + count_tokens(query) + count_tokens(RAG_RESPONSE);
        let budget = limits.max_total_tokens.saturating_sub(overhead);
        let chunks = truncate_list_by_tokens(chunks, |c| c.content.clone(), budget);
        info!(
            entities = entities.len(),
            relations = relations.len(),
            chunks = chunks.len(),
            "Built {mode} query context"
        );
        Ok(Some(format!("{kg}\n{}", render_chunks(&chunks))))
    }

    async fn naive_context(&self, query: &str, limits: &Limits) -> Result<Option<String>> {
        let ids = self.vector_chunks(query, limits.chunk_top_k).await?;
        let chunks = self.load_chunks(&ids)?;
        let mut chunks = self.rerank(query, chunks, limits).await;
        chunks.truncate(limits.chunk_top_k);
        if chunks.is_empty() {
            return Ok(None);
        }
        let overhead = count_tokens(query) + count_tokens(NAIVE_RAG_RESPONSE);
        let budget = limits.max_total_tokens.saturating_sub(overhead);
        let chunks = truncate_list_by_tokens(chunks, |c| c.content.clone(), budget);
        debug!(chunks = chunks.len(), ids = ?chunks.iter().map(|c| &c.id).collect::<Vec<_>>(), "Naive context");
        Ok(Some(render_chunks(&chunks)))
    }

    /// Answer `query` according to `param`.
    pub async fn run(&self, query: &str, param: &QueryParam) -> Result<QueryResult> {
        let limits = param.limits(&self.clients.settings);
        let history = limit_history(&param.conversation_history, limits.history_turns);
        let history_str = history_text(&history);

        if param.mode == QueryMode::Bypass {
            let answer = self.clients.complete("query", None, &history, query).await?;
            return Ok(QueryResult::Text(answer.trim().to_string()));
        }

        let context = match param.mode {
            QueryMode::Naive => self.naive_context(query, &limits).await?,
            mode => {
                let keywords = EntityExtractor::new(self.clients, self.llm_cache)
                    .extract_keywords(query, &history_str)
                    .await?;
                if keywords.is_empty() {
                    warn!("No keywords extracted from query");
                    return Ok(QueryResult::Text(FAIL_RESPONSE.to_string()));
                }
                self.kg_context(query, mode, &keywords, &limits).await?
            }
        };
        let Some(context) = context else {
            return Ok(QueryResult::Text(FAIL_RESPONSE.to_string()));
        };
        if param.only_need_context {
            return Ok(QueryResult::Text(context));
        }

        let (template, slot) = match param.mode {
            QueryMode::Naive => (NAIVE_RAG_RESPONSE, "content_data"),
            _ => (RAG_RESPONSE, "context_data"),
        };
        let system = render(
            template,
            &[
                ("history", history_str.as_str()),
                (slot, context.as_str()),
                ("response_type", limits.response_type.as_str()),
                ("user_prompt", limits.user_prompt.as_str()),
            ],
        );
        if param.only_need_prompt {
            return Ok(QueryResult::Text(format!(
                "{system}\n\n---User Query---\n{query}"
            )));
        }
        if !self.clients.has_llm() {
            return Err(Error::Llm("LLM is not configured".to_string()));
        }

        let cache = LlmCache::new(self.llm_cache, self.clients.settings.enable_llm_cache);
        let key = LlmCache::key(
            param.mode.as_str(),
            "query",
            &[
                query,
                &limits.response_type,
                &limits.top_k.to_string(),
                &limits.chunk_top_k.to_string(),
                &limits.max_total_tokens.to_string(),
                &limits.user_prompt,
                &history_str,
            ],
        );
        let answer = match cache.get(&key)? {
            Some(hit) => {
                crate::metrics::record_llm_call("query", true);
                hit
            }
            None => {
                let answer = self
                    .clients
                    .complete("query", Some(&system), &history, query)
                    .await?;
                let answer = answer.trim().to_string();
                cache.put(&key, &answer, "query", None, query)?;
                self.llm_cache.flush()?;
                answer
            }
        };

        if limits.response_type.to_ascii_lowercase().contains("json") {
            if let Ok(value) = serde_json::from_str::<Value>(&answer) {
                return Ok(QueryResult::Json(value));
            }
        }
        Ok(QueryResult::Text(answer))
    }
}
