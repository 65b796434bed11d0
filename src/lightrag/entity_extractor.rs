use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::cache::LlmCache;
use super::chunker::Chunk;
use super::prompts::{
    render, COMPLETION_DELIMITER, ENTITY_CONTINUE_EXTRACTION, ENTITY_EXTRACTION,
    KEYWORDS_EXTRACTION, RECORD_DELIMITER, TUPLE_DELIMITER,
};
use super::storage::JsonKvStorage;
use super::utils::{clean_text, split_by_markers};
use crate::integrations::openai::ChatMessage;
use crate::integrations::ModelClients;
use crate::Result;

static RECORD_BODY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\((.*)\)").expect("valid regex"));
static JSON_OBJECT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

/// Entity record extracted from one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEntity {
    pub entity_name: String,
    pub entity_type: String,
    pub description: String,
    pub source_id: String,
    pub file_path: String,
}

/// Relation record extracted from one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRelation {
    pub src_id: String,
    pub tgt_id: String,
    pub description: String,
    pub keywords: String,
    pub weight: f64,
    pub source_id: String,
    pub file_path: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkExtraction {
    pub entities: Vec<ExtractedEntity>,
    pub relations: Vec<ExtractedRelation>,
}

impl ChunkExtraction {
    /// Append records whose entity name or relation pair is not present yet.
    pub fn merge_new(&mut self, other: ChunkExtraction) {
        for entity in other.entities {
            if !self
                .entities
                .iter()
                .any(|e| e.entity_name == entity.entity_name)
            {
                self.entities.push(entity);
            }
        }
        for rel in other.relations {
            let exists = self.relations.iter().any(|r| {
                (r.src_id == rel.src_id && r.tgt_id == rel.tgt_id)
                    || (r.src_id == rel.tgt_id && r.tgt_id == rel.src_id)
            });
            if !exists {
                self.relations.push(rel);
            }
        }
    }

    /// Render back into the delimited record format.
    pub fn to_records(&self) -> String {
        let t = TUPLE_DELIMITER;
        let mut records: Vec<String> = self
            .entities
            .iter()
            .map(|e| {
                format!(
                    "(\"entity\"{t}\"{}\"{t}\"{}\"{t}\"{}\")",
                    e.entity_name, e.entity_type, e.description
                )
            })
            .collect();
        records.extend(self.relations.iter().map(|r| {
            format!(
                "(\"relationship\"{t}\"{}\"{t}\"{}\"{t}\"{}\"{t}\"{}\"{t}{})",
                r.src_id, r.tgt_id, r.description, r.keywords, r.weight
            )
        }));
        let mut out = records.join(&format!("{RECORD_DELIMITER}\n"));
        out.push_str(COMPLETION_DELIMITER);
        out
    }
}

fn clean_field(raw: &str) -> String {
    clean_text(raw.trim().trim_matches('"').trim_matches('\'').trim())
}

/// Parse delimited extraction output into entity and relation records.
pub fn parse_extraction(output: &str, chunk_id: &str, file_path: &str) -> ChunkExtraction {
    let mut result = ChunkExtraction::default();
    for record in split_by_markers(output, &[RECORD_DELIMITER, COMPLETION_DELIMITER, "\n"]) {
        let Some(body) = RECORD_BODY.captures(record).and_then(|c| c.get(1)) else {
            continue;
        };
        let fields: Vec<String> = body
            .as_str()
            .split(TUPLE_DELIMITER)
            .map(clean_field)
            .collect();
        match fields.first().map(|s| s.to_ascii_lowercase()).as_deref() {
            Some("entity") if fields.len() >= 4 => {
                let name = fields[1].clone();
                if name.is_empty() {
                    continue;
                }
                let entity_type = if fields[2].is_empty() {
                    "UNKNOWN".to_string()
                } else {
                    fields[2].clone()
                };
                result.entities.push(ExtractedEntity {
                    entity_name: name,
                    entity_type,
                    description: fields[3].clone(),
                    source_id: chunk_id.to_string(),
                    file_path: file_path.to_string(),
                });
            }
            Some("relationship") if fields.len() >= 5 => {
                let (src, tgt) = (fields[1].clone(), fields[2].clone());
                if src.is_empty() || tgt.is_empty() || src == tgt {
                    continue;
                }
                let weight = fields
                    .get(5)
                    .and_then(|w| w.parse::<f64>().ok())
                    .unwrap_or(1.0);
                result.relations.push(ExtractedRelation {
                    src_id: src,
                    tgt_id: tgt,
                    description: fields[3].clone(),
                    keywords: fields[4].clone(),
                    weight,
                    source_id: chunk_id.to_string(),
                    file_path: file_path.to_string(),
                });
            }
            _ => debug!(record, "Skipping unrecognised extraction record"),
        }
    }
    result
}

/// Light-weight entity extractor with heuristics (no network calls).
#[derive(Debug, Clone)]
pub struct HeuristicExtractor {
    stopwords: HashSet<String>,
}

impl Default for HeuristicExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl HeuristicExtractor {
    pub fn new() -> Self {
        let stopwords = [
            "and", "or", "but", "the", "a", "an", "of", "in", "on", "for", "to", "with", "this",
            "that", "what", "how", "who", "why", "when", "where", "是", "的", "和",
        ]
        .iter()
        .map(|w| w.to_string())
        .collect();
        Self { stopwords }
    }

    fn candidates(&self, text: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        for raw_token in text.split_whitespace() {
            let token =
                raw_token.trim_matches(|c: char| !c.is_alphanumeric() && c != '@' && c != '#');
            if token.chars().count() < 3 {
                continue;
            }
            let normalized = token.to_lowercase();
            if self.stopwords.contains(&normalized) {
                continue;
            }

            // Capitalized words, handles, hashtags, or tokens with digits.
            let is_candidate = token.chars().next().is_some_and(|c| c.is_uppercase())
                || token.contains('@')
                || token.contains('#')
                || token.chars().any(|c| c.is_numeric());

            if is_candidate && seen.insert(normalized) {
                names.push(token.to_string());
            }
        }
        names
    }

    /// Extract entities and co-occurrence relations from a chunk.
    pub fn extract(&self, chunk: &Chunk) -> ChunkExtraction {
        let sentences: Vec<&str> = chunk
            .content
            .split(['.', '!', '?', '\n'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        let entities: Vec<ExtractedEntity> = self
            .candidates(&chunk.content)
            .into_iter()
            .map(|name| {
                let sentence = sentences
                    .iter()
                    .find(|s| s.contains(name.as_str()))
                    .copied()
                    .unwrap_or(name.as_str());
                ExtractedEntity {
                    description: format!("Mentioned in: {sentence}"),
                    entity_name: name,
                    entity_type: "UNKNOWN".to_string(),
                    source_id: chunk.id.clone(),
                    file_path: chunk.file_path.clone(),
                }
            })
            .collect();

        // Neighboring entities co-occur.
        let relations = entities
            .windows(2)
            .filter_map(|pair| match pair {
                [a, b] => Some(ExtractedRelation {
                    src_id: a.entity_name.clone(),
                    tgt_id: b.entity_name.clone(),
                    description: format!(
                        "{} and {} appear together",
                        a.entity_name, b.entity_name
                    ),
                    keywords: "co_occurs".to_string(),
                    weight: 1.0,
                    source_id: chunk.id.clone(),
                    file_path: chunk.file_path.clone(),
                }),
                _ => None,
            })
            .collect();

        ChunkExtraction {
            entities,
            relations,
        }
    }

    /// Extract just entity names from free text (used for queries).
    pub fn extract_keywords(&self, text: &str) -> Vec<String> {
        self.candidates(text)
    }
}

/// High- and low-level query keywords.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Keywords {
    #[serde(default)]
    pub high_level_keywords: Vec<String>,
    #[serde(default)]
    pub low_level_keywords: Vec<String>,
}

impl Keywords {
    pub fn is_empty(&self) -> bool {
        self.high_level_keywords.is_empty() && self.low_level_keywords.is_empty()
    }
}

/// Chunk and query extraction through the LLM, or heuristics without one.
pub struct EntityExtractor<'a> {
    clients: &'a ModelClients,
    cache: &'a JsonKvStorage,
    heuristic: HeuristicExtractor,
}

impl<'a> EntityExtractor<'a> {
    pub fn new(clients: &'a ModelClients, cache: &'a JsonKvStorage) -> Self {
        Self {
            clients,
            cache,
            heuristic: HeuristicExtractor::new(),
        }
    }

    fn extract_cache(&self) -> LlmCache<'a> {
        LlmCache::new(
            self.cache,
            self.clients.settings.enable_llm_cache_for_entity_extract,
        )
    }

    async fn cached_call(
        &self,
        cache: &LlmCache<'_>,
        key: &str,
        kind: &str,
        chunk_id: Option<&str>,
        history: &[ChatMessage],
        prompt: &str,
    ) -> Result<String> {
        if let Some(hit) = cache.get(key)? {
            crate::metrics::record_llm_call(kind, true);
            return Ok(hit);
        }
        let answer = self.clients.complete(kind, None, history, prompt).await?;
        cache.put(key, &answer, kind, chunk_id, prompt)?;
        Ok(answer)
    }

    /// Extract records from one chunk, gleaning for missed ones when configured.
    pub async fn extract_chunk(&self, chunk: &Chunk) -> Result<ChunkExtraction> {
        let cache = self.extract_cache();
        if !self.clients.has_llm() {
            let extraction = self.heuristic.extract(chunk);
            let key = LlmCache::key("default", "extract", &["heuristic", &chunk.content]);
            cache.put(&key, &extraction.to_records(), "extract", Some(&chunk.id), &chunk.content)?;
            return Ok(extraction);
        }

        let settings = &self.clients.settings;
        let entity_types = settings.entity_types.join(", ");
        let values = [
            ("language", settings.summary_language.as_str()),
            ("entity_types", entity_types.as_str()),
            ("tuple_delimiter", TUPLE_DELIMITER),
            ("record_delimiter", RECORD_DELIMITER),
            ("completion_delimiter", COMPLETION_DELIMITER),
            ("input_text", chunk.content.as_str()),
        ];
        let prompt = render(ENTITY_EXTRACTION, &values);
        let key = LlmCache::key("default", "extract", &[&prompt]);
        let output = self
            .cached_call(&cache, &key, "extract", Some(&chunk.id), &[], &prompt)
            .await?;
        let mut extraction = parse_extraction(&output, &chunk.id, &chunk.file_path);

        let continue_prompt = render(ENTITY_CONTINUE_EXTRACTION, &values);
        let mut history = vec![
            ChatMessage::new("user", prompt.clone()),
            ChatMessage::new("assistant", output.clone()),
        ];
        let mut transcript = vec![prompt.clone(), output];
        for round in 0..settings.entity_extract_max_gleaning {
            transcript.push(continue_prompt.clone());
            let parts: Vec<&str> = transcript.iter().map(String::as_str).collect();
            let key = LlmCache::key("default", "extract", &parts);
            let glean = self
                .cached_call(&cache, &key, "extract", Some(&chunk.id), &history, &continue_prompt)
                .await?;
            let found = parse_extraction(&glean, &chunk.id, &chunk.file_path);
            debug!(
                chunk_id = %chunk.id,
                round,
                entities = found.entities.len(),
                relations = found.relations.len(),
                "Gleaning round"
            );
            extraction.merge_new(found);
            history.push(ChatMessage::new("user", continue_prompt.clone()));
            history.push(ChatMessage::new("assistant", glean.clone()));
            transcript.push(glean);
        }
        Ok(extraction)
    }

    fn fallback_keywords(&self, query: &str) -> Keywords {
        let low = self.heuristic.extract_keywords(query);
        let query = query.trim();
        Keywords {
            high_level_keywords: if query.is_empty() {
                Vec::new()
            } else {
                vec![query.to_string()]
            },
            low_level_keywords: low,
        }
    }

    /// High/low-level keywords of a query.
    pub async fn extract_keywords(&self, query: &str, history: &str) -> Result<Keywords> {
        if !self.clients.has_llm() {
            return Ok(self.fallback_keywords(query));
        }
        let prompt = render(KEYWORDS_EXTRACTION, &[("history", history), ("query", query)]);
        let cache = LlmCache::new(self.cache, self.clients.settings.enable_llm_cache);
        let key = LlmCache::key("default", "keywords", &[&prompt]);
        let output = self
            .cached_call(&cache, &key, "keywords", None, &[], &prompt)
            .await?;
        match parse_keywords(&output) {
            Some(keywords) => Ok(keywords),
            None => {
                warn!("Keyword extraction returned no JSON, using heuristic keywords");
                Ok(self.fallback_keywords(query))
            }
        }
    }
}

/// Parse the first JSON object found in the output.
pub fn parse_keywords(output: &str) -> Option<Keywords> {
    let object = JSON_OBJECT.find(output)?;
    serde_json::from_str(object.as_str()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::RagSettings;
    use tempfile::TempDir;

    fn chunk(text: &str) -> Chunk {
        Chunk {
            id: "chunk-1".into(),
            content: text.into(),
            tokens: 10,
            chunk_order_index: 0,
            full_doc_id: "doc-1".into(),
            file_path: "notes.txt".into(),
        }
    }

    #[test]
    fn parses_entities_and_relations() {
        let output = concat!(
            r#"("entity"<|>"Alice"<|>"Person"<|>"Alice is an engineer.")##"#,
            "\n",
            r#"("entity"<|>"Acme"<|>"Organization"<|>"Acme builds rockets.")##"#,
            "\n",
            r#"("relationship"<|>"Alice"<|>"Acme"<|>"Alice works at Acme."<|>"employment"<|>8)"#,
            "<|COMPLETE|>"
        );
        let parsed = parse_extraction(output, "chunk-1", "a.txt");
        assert_eq!(parsed.entities.len(), 2);
        assert_eq!(parsed.entities[0].entity_name, "Alice");
        assert_eq!(parsed.entities[1].entity_type, "Organization");
        assert_eq!(parsed.relations.len(), 1);
        assert_eq!(parsed.relations[0].weight, 8.0);
        assert_eq!(parsed.relations[0].source_id, "chunk-1");
    }

    #[test]
    fn drops_self_loops_and_defaults_weight() {
        let output = concat!(
            r#"("relationship"<|>"A"<|>"A"<|>"self"<|>"k"<|>3)##"#,
            r#"("relationship"<|>"A"<|>"B"<|>"d"<|>"k"<|>strong)##"#,
            r#"("entity"<|>""<|>"Person"<|>"nameless")"#
        );
        let parsed = parse_extraction(output, "c", "f");
        assert!(parsed.entities.is_empty());
        assert_eq!(parsed.relations.len(), 1);
        assert_eq!(parsed.relations[0].weight, 1.0);
    }

    #[test]
    fn heuristic_extracts_entities_and_relations() {
        let extractor = HeuristicExtractor::new();
        let extraction = extractor.extract(&chunk("Alice met Bob in Paris with @carol"));

        let names: Vec<&str> = extraction
            .entities
            .iter()
            .map(|e| e.entity_name.as_str())
            .collect();
        assert!(names.contains(&"Alice"));
        assert!(names.contains(&"Bob"));
        assert!(names.contains(&"@carol"));
        assert!(extraction.entities[0].description.starts_with("Mentioned in: "));
        assert_eq!(extraction.relations.len(), extraction.entities.len() - 1);
    }

    #[test]
    fn heuristic_records_parse_back() {
        let extraction = HeuristicExtractor::new().extract(&chunk("Alice joined Acme in 2021."));
        let parsed = parse_extraction(&extraction.to_records(), "chunk-1", "notes.txt");
        assert_eq!(parsed, extraction);
    }

    #[test]
    fn merge_new_skips_known_records() {
        let mut base = parse_extraction(
            r#"("entity"<|>"A"<|>"T"<|>"d")##("relationship"<|>"A"<|>"B"<|>"d"<|>"k"<|>1)"#,
            "c",
            "f",
        );
        base.merge_new(parse_extraction(
            r#"("entity"<|>"A"<|>"T"<|>"other")##("entity"<|>"B"<|>"T"<|>"d")##("relationship"<|>"B"<|>"A"<|>"d"<|>"k"<|>1)"#,
            "c",
            "f",
        ));
        assert_eq!(base.entities.len(), 2);
        assert_eq!(base.relations.len(), 1);
    }

    #[test]
    fn keywords_json_is_found_inside_prose() {
        let kw = parse_keywords(
            "Sure!\n{\"high_level_keywords\": [\"AI\"], \"low_level_keywords\": [\"GPU\"]}\nDone",
        )
        .unwrap();
        assert_eq!(kw.high_level_keywords, vec!["AI"]);
        assert_eq!(kw.low_level_keywords, vec!["GPU"]);
        assert!(parse_keywords("no json here").is_none());
    }

    #[tokio::test]
    async fn without_llm_uses_heuristics_and_caches_records() {
        let tmp = TempDir::new().unwrap();
        let kv = JsonKvStorage::open(tmp.path(), "llm_response_cache").unwrap();
        let clients = ModelClients::local(RagSettings::default(), 16);
        let extractor = EntityExtractor::new(&clients, &kv);

        let extraction = extractor
            .extract_chunk(&chunk("Alice works at Acme."))
            .await
            .unwrap();
        assert!(!extraction.entities.is_empty());
        let records = LlmCache::new(&kv, true).extraction_records("chunk-1").unwrap();
        assert_eq!(records.len(), 1);

        let kw = extractor
            .extract_keywords("Where does Alice work?", "")
            .await
            .unwrap();
        assert_eq!(kw.high_level_keywords, vec!["Where does Alice work?"]);
        assert!(kw.low_level_keywords.contains(&"Alice".to_string()));
    }
}
