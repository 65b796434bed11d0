//! Node/edge property merging and vector rows for graph elements.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use super::entity_extractor::{ExtractedEntity, ExtractedRelation};
use super::graph::{prop_f64, prop_str, Properties};
use super::storage::VectorItem;
use super::utils::{compute_id, join_unique, split_field};
use crate::constants::GRAPH_FIELD_SEP;

/// Merged properties plus the distinct description fragments behind them.
#[derive(Debug, Clone)]
pub struct Merged {
    pub properties: Properties,
    pub fragments: Vec<String>,
}

impl Merged {
    /// Replace the joined description, e.g. with an LLM summary.
    pub fn set_description(&mut self, description: String) {
        self.properties
            .insert("description".into(), Value::String(description));
    }

    pub fn description(&self) -> &str {
        prop_str(&self.properties, "description")
    }
}

fn distinct<'a>(items: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        let item = item.trim();
        if !item.is_empty() && !out.iter().any(|o| o == item) {
            out.push(item.to_string());
        }
    }
    out
}

fn most_frequent<'a>(items: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for item in items.into_iter().filter(|s| !s.is_empty()) {
        match counts.iter_mut().find(|(k, _)| *k == item) {
            Some((_, n)) => *n += 1,
            None => counts.push((item, 1)),
        }
    }
    // Stable on ties: first seen wins.
    let max = counts.iter().map(|(_, n)| *n).max()?;
    counts
        .into_iter()
        .find(|(_, n)| *n == max)
        .map(|(k, _)| k.to_string())
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Merge extracted records of one entity into its existing node properties.
pub fn merge_node(name: &str, existing: Option<&Properties>, records: &[ExtractedEntity]) -> Merged {
    let old_desc = existing.map(|p| prop_str(p, "description")).unwrap_or("");
    let old_type = existing.map(|p| prop_str(p, "entity_type")).unwrap_or("");
    let old_source = existing.map(|p| prop_str(p, "source_id")).unwrap_or("");
    let old_path = existing.map(|p| prop_str(p, "file_path")).unwrap_or("");

    let entity_type = most_frequent(
        std::iter::once(old_type)
            .filter(|t| !t.is_empty())
            .chain(records.iter().map(|r| r.entity_type.as_str())),
    )
    .unwrap_or_else(|| "UNKNOWN".to_string());
    let fragments = distinct(
        split_field(old_desc)
            .into_iter()
            .chain(records.iter().map(|r| r.description.as_str())),
    );

    let mut properties = existing.cloned().unwrap_or_default();
    properties.insert("entity_id".into(), Value::String(name.to_string()));
    properties.insert("entity_type".into(), Value::String(entity_type));
    properties.insert(
        "description".into(),
        Value::String(fragments.join(GRAPH_FIELD_SEP)),
    );
    properties.insert(
        "source_id".into(),
        Value::String(join_unique(old_source, records.iter().map(|r| r.source_id.as_str()))),
    );
    properties.insert(
        "file_path".into(),
        Value::String(join_unique(old_path, records.iter().map(|r| r.file_path.as_str()))),
    );
    properties.insert("created_at".into(), json!(unix_now()));
    Merged {
        properties,
        fragments,
    }
}

/// Merge extracted records of one relation into its existing edge properties.
pub fn merge_edge(existing: Option<&Properties>, records: &[ExtractedRelation]) -> Merged {
    let old_desc = existing.map(|p| prop_str(p, "description")).unwrap_or("");
    let old_keywords = existing.map(|p| prop_str(p, "keywords")).unwrap_or("");
    let old_source = existing.map(|p| prop_str(p, "source_id")).unwrap_or("");
    let old_path = existing.map(|p| prop_str(p, "file_path")).unwrap_or("");
    let old_weight = existing.map(|p| prop_f64(p, "weight")).unwrap_or(0.0);

    let weight = old_weight + records.iter().map(|r| r.weight).sum::<f64>();
    let fragments = distinct(
        split_field(old_desc)
            .into_iter()
            .chain(records.iter().map(|r| r.description.as_str())),
    );
    let keywords = distinct(
        old_keywords
            .split(',')
            .chain(records.iter().flat_map(|r| r.keywords.split(','))),
    );

    let mut properties = existing.cloned().unwrap_or_default();
    properties.insert("weight".into(), json!(weight));
    properties.insert(
        "description".into(),
        Value::String(fragments.join(GRAPH_FIELD_SEP)),
    );
    properties.insert("keywords".into(), Value::String(keywords.join(",")));
    properties.insert(
        "source_id".into(),
        Value::String(join_unique(old_source, records.iter().map(|r| r.source_id.as_str()))),
    );
    properties.insert(
        "file_path".into(),
        Value::String(join_unique(old_path, records.iter().map(|r| r.file_path.as_str()))),
    );
    properties.insert("created_at".into(), json!(unix_now()));
    Merged {
        properties,
        fragments,
    }
}

/// Placeholder node for a relation endpoint that was never extracted itself.
pub fn endpoint_node(name: &str, relation: &ExtractedRelation) -> Properties {
    let mut properties = Properties::new();
    properties.insert("entity_id".into(), Value::String(name.to_string()));
    properties.insert("entity_type".into(), Value::String("UNKNOWN".into()));
    properties.insert(
        "description".into(),
        Value::String(relation.description.clone()),
    );
    properties.insert("source_id".into(), Value::String(relation.source_id.clone()));
    properties.insert("file_path".into(), Value::String(relation.file_path.clone()));
    properties.insert("created_at".into(), json!(unix_now()));
    properties
}

/// Records grouped by entity name, in first-seen order.
pub fn group_entities(records: Vec<ExtractedEntity>) -> Vec<(String, Vec<ExtractedEntity>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<ExtractedEntity>> = HashMap::new();
    for record in records {
        if !groups.contains_key(&record.entity_name) {
            order.push(record.entity_name.clone());
        }
        groups
            .entry(record.entity_name.clone())
            .or_default()
            .push(record);
    }
    order
        .into_iter()
        .filter_map(|name| groups.remove(&name).map(|g| (name, g)))
        .collect()
}

/// Records grouped by unordered endpoint pair, in first-seen order.
pub fn group_relations(
    records: Vec<ExtractedRelation>,
) -> Vec<((String, String), Vec<ExtractedRelation>)> {
    let mut order: Vec<(String, String)> = Vec::new();
    let mut groups: HashMap<(String, String), Vec<ExtractedRelation>> = HashMap::new();
    for record in records {
        let key = pair(&record.src_id, &record.tgt_id);
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(record);
    }
    order
        .into_iter()
        .filter_map(|key| groups.remove(&key).map(|g| (key, g)))
        .collect()
}

pub fn pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

pub fn entity_vdb_id(name: &str) -> String {
    compute_id("ent-", name)
}

pub fn relation_vdb_id(a: &str, b: &str) -> String {
    let (a, b) = pair(a, b);
    compute_id("rel-", &format!("{a}{b}"))
}

pub fn entity_vdb_item(name: &str, props: &Properties) -> VectorItem {
    let mut meta = Map::new();
    meta.insert("entity_name".into(), Value::String(name.to_string()));
    for key in ["entity_type", "source_id", "file_path"] {
        meta.insert(key.into(), Value::String(prop_str(props, key).to_string()));
    }
    (
        entity_vdb_id(name),
        format!("{name}\n{}", prop_str(props, "description")),
        meta,
    )
}

pub fn relation_vdb_item(a: &str, b: &str, props: &Properties) -> VectorItem {
    let (src, tgt) = pair(a, b);
    let mut meta = Map::new();
    meta.insert("src_id".into(), Value::String(src.clone()));
    meta.insert("tgt_id".into(), Value::String(tgt.clone()));
    for key in ["keywords", "source_id", "file_path"] {
        meta.insert(key.into(), Value::String(prop_str(props, key).to_string()));
    }
    meta.insert("weight".into(), json!(prop_f64(props, "weight")));
    (
        relation_vdb_id(&src, &tgt),
        format!(
            "{}\t{src}\n{tgt}\n{}",
            prop_str(props, "keywords"),
            prop_str(props, "description")
        ),
        meta,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(name: &str, ty: &str, desc: &str, chunk: &str) -> ExtractedEntity {
        ExtractedEntity {
            entity_name: name.into(),
            entity_type: ty.into(),
            description: desc.into(),
            source_id: chunk.into(),
            file_path: "a.txt".into(),
        }
    }

    fn relation(src: &str, tgt: &str, kw: &str, weight: f64, chunk: &str) -> ExtractedRelation {
        ExtractedRelation {
            src_id: src.into(),
            tgt_id: tgt.into(),
            description: format!("{src} knows {tgt}"),
            keywords: kw.into(),
            weight,
            source_id: chunk.into(),
            file_path: "a.txt".into(),
        }
    }

    #[test]
    fn node_merge_picks_frequent_type_and_joins() {
        let first = merge_node(
            "Alice",
            None,
            &[
                entity("Alice", "Person", "Engineer", "chunk-1"),
                entity("Alice", "Organization", "Engineer", "chunk-2"),
                entity("Alice", "Person", "Pilot", "chunk-2"),
            ],
        );
        assert_eq!(prop_str(&first.properties, "entity_type"), "Person");
        assert_eq!(first.description(), "Engineer<SEP>Pilot");
        assert_eq!(prop_str(&first.properties, "source_id"), "chunk-1<SEP>chunk-2");

        let second = merge_node(
            "Alice",
            Some(&first.properties),
            &[entity("Alice", "Person", "Writer", "chunk-3")],
        );
        assert_eq!(second.fragments.len(), 3);
        assert_eq!(
            prop_str(&second.properties, "source_id"),
            "chunk-1<SEP>chunk-2<SEP>chunk-3"
        );
    }

    #[test]
    fn edge_merge_sums_weight_and_dedupes_keywords() {
        let first = merge_edge(None, &[relation("A", "B", "work, team", 2.0, "c1")]);
        let second = merge_edge(
            Some(&first.properties),
            &[relation("B", "A", "team,friends", 3.0, "c2")],
        );
        assert_eq!(prop_f64(&second.properties, "weight"), 5.0);
        assert_eq!(prop_str(&second.properties, "keywords"), "work,team,friends");
        assert_eq!(second.fragments.len(), 2);
    }

    #[test]
    fn grouping_is_order_preserving_and_pair_insensitive() {
        let groups = group_relations(vec![
            relation("B", "A", "k", 1.0, "c"),
            relation("C", "A", "k", 1.0, "c"),
            relation("A", "B", "k", 1.0, "c"),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, ("A".to_string(), "B".to_string()));
        assert_eq!(groups[0].1.len(), 2);

        let ents = group_entities(vec![
            entity("Z", "T", "d", "c"),
            entity("A", "T", "d", "c"),
            entity("Z", "T", "e", "c"),
        ]);
        assert_eq!(ents[0].0, "Z");
        assert_eq!(ents[0].1.len(), 2);
    }

    #[test]
    fn vector_rows_use_ordered_pair() {
        let merged = merge_edge(None, &[relation("B", "A", "kw", 1.0, "c")]);
        let (id, content, meta) = relation_vdb_item("B", "A", &merged.properties);
        assert_eq!(id, relation_vdb_id("A", "B"));
        assert_eq!(content, "kw\tA\nB\nB knows A");
        assert_eq!(meta["src_id"], "A");

        let node = merge_node("Alice", None, &[entity("Alice", "Person", "Engineer", "c")]);
        let (id, content, _) = entity_vdb_item("Alice", &node.properties);
        assert!(id.starts_with("ent-"));
        assert_eq!(content, "Alice\nEngineer");
    }
}
