use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

pub type Properties = serde_json::Map<String, Value>;

pub fn prop_str<'a>(props: &'a Properties, key: &str) -> &'a str {
    props.get(key).and_then(Value::as_str).unwrap_or("")
}

pub fn prop_f64(props: &Properties, key: &str) -> f64 {
    match props.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Undirected property graph keyed by entity name.
#[derive(Debug, Default, Clone)]
pub struct KnowledgeGraph {
    nodes: HashMap<String, Properties>,
    edges: HashMap<(String, String), Properties>,
    adjacency: HashMap<String, BTreeSet<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubgraphNode {
    pub id: String,
    pub label: String,
    pub properties: Properties,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubgraphEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub edge_type: String,
    pub properties: Properties,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Subgraph {
    pub nodes: Vec<SubgraphNode>,
    pub edges: Vec<SubgraphEdge>,
    pub is_truncated: bool,
    pub max_depth_reached: usize,
}

#[derive(Serialize, Deserialize)]
struct StoredEdge {
    source: String,
    target: String,
    properties: Properties,
}

#[derive(Serialize, Deserialize, Default)]
struct StoredGraph {
    #[serde(default)]
    nodes: HashMap<String, Properties>,
    #[serde(default)]
    edges: Vec<StoredEdge>,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from disk; a missing file is an empty graph.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let raw = fs::read_to_string(path)?;
        let stored: StoredGraph = serde_json::from_str(&raw)?;
        let mut graph = Self::new();
        for (id, props) in stored.nodes {
            graph.upsert_node(&id, props);
        }
        for edge in stored.edges {
            graph.upsert_edge(&edge.source, &edge.target, edge.properties);
        }
        Ok(graph)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let stored = StoredGraph {
            nodes: self.nodes.clone(),
            edges: self
                .edges
                .iter()
                .map(|((a, b), props)| StoredEdge {
                    source: a.clone(),
                    target: b.clone(),
                    properties: props.clone(),
                })
                .collect(),
        };
        super::storage::write_json_atomic(path, &stored)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn has_edge(&self, a: &str, b: &str) -> bool {
        self.edges.contains_key(&ordered(a, b))
    }

    pub fn get_node(&self, name: &str) -> Option<&Properties> {
        self.nodes.get(name)
    }

    pub fn get_edge(&self, a: &str, b: &str) -> Option<&Properties> {
        self.edges.get(&ordered(a, b))
    }

    pub fn upsert_node(&mut self, name: &str, properties: Properties) {
        self.adjacency.entry(name.to_string()).or_default();
        self.nodes.insert(name.to_string(), properties);
    }

    /// Insert or replace an edge. Self-loops are ignored.
    pub fn upsert_edge(&mut self, a: &str, b: &str, properties: Properties) {
        if a == b {
            return;
        }
        for endpoint in [a, b] {
            if !self.nodes.contains_key(endpoint) {
                let mut props = Properties::new();
                props.insert("entity_id".into(), Value::String(endpoint.to_string()));
                self.nodes.insert(endpoint.to_string(), props);
            }
        }
        self.adjacency
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string());
        self.adjacency
            .entry(b.to_string())
            .or_default()
            .insert(a.to_string());
        self.edges.insert(ordered(a, b), properties);
    }

    pub fn remove_edge(&mut self, a: &str, b: &str) -> Option<Properties> {
        let removed = self.edges.remove(&ordered(a, b));
        if removed.is_some() {
            if let Some(n) = self.adjacency.get_mut(a) {
                n.remove(b);
            }
            if let Some(n) = self.adjacency.get_mut(b) {
                n.remove(a);
            }
        }
        removed
    }

    /// Remove a node together with every edge touching it.
    pub fn remove_node(&mut self, name: &str) -> Option<Properties> {
        let neighbors: Vec<String> = self
            .adjacency
            .get(name)
            .map(|n| n.iter().cloned().collect())
            .unwrap_or_default();
        for other in neighbors {
            self.remove_edge(name, &other);
        }
        self.adjacency.remove(name);
        self.nodes.remove(name)
    }

    pub fn node_degree(&self, name: &str) -> usize {
        self.adjacency.get(name).map(|n| n.len()).unwrap_or(0)
    }

    pub fn edge_degree(&self, a: &str, b: &str) -> usize {
        self.node_degree(a) + self.node_degree(b)
    }

    pub fn neighbors(&self, name: &str) -> Vec<String> {
        self.adjacency
            .get(name)
            .map(|n| n.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Edges touching `name`, as `(name, other)` pairs.
    pub fn node_edges(&self, name: &str) -> Vec<(String, String)> {
        self.neighbors(name)
            .into_iter()
            .map(|other| (name.to_string(), other))
            .collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&String, &Properties)> {
        self.nodes.iter()
    }

    pub fn edges(&self) -> impl Iterator<Item = (&(String, String), &Properties)> {
        self.edges.iter()
    }

    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.nodes.keys().cloned().collect();
        labels.sort();
        labels
    }

    /// Move a node's properties and edges to a new name.
    ///
    /// Edges that would become self-loops are dropped.
    pub fn rename_node(&mut self, old: &str, new: &str) -> bool {
        let Some(mut props) = self.nodes.get(old).cloned() else {
            return false;
        };
        let moved: Vec<(String, Properties)> = self
            .neighbors(old)
            .into_iter()
            .filter_map(|other| {
                let edge = self.get_edge(old, &other)?.clone();
                Some((other, edge))
            })
            .collect();
        self.remove_node(old);
        props.insert("entity_id".into(), Value::String(new.to_string()));
        self.upsert_node(new, props);
        for (other, edge) in moved {
            if other != new {
                self.upsert_edge(new, &other, edge);
            }
        }
        true
    }

    fn view_node(&self, id: &str) -> Option<SubgraphNode> {
        self.nodes.get(id).map(|props| SubgraphNode {
            id: id.to_string(),
            label: id.to_string(),
            properties: props.clone(),
        })
    }

    fn edges_within(&self, included: &HashSet<&str>) -> Vec<SubgraphEdge> {
        let mut edges: Vec<SubgraphEdge> = self
            .edges
            .iter()
            .filter(|((a, b), _)| included.contains(a.as_str()) && included.contains(b.as_str()))
            .map(|((a, b), props)| SubgraphEdge {
                id: format!("{a}-{b}"),
                source: a.clone(),
                target: b.clone(),
                edge_type: "DIRECTED".to_string(),
                properties: props.clone(),
            })
            .collect();
        edges.sort_by(|x, y| x.id.cmp(&y.id));
        edges
    }

    /// Subgraph around `label` up to `max_depth` hops, capped at `max_nodes`.
    ///
    /// `"*"` selects the highest-degree nodes of the whole graph. When the cap
    /// applies, nodes closer to the start win, then higher degree.
    pub fn subgraph(&self, label: &str, max_depth: usize, max_nodes: usize) -> Subgraph {
        let max_nodes = max_nodes.max(1);

        if label == "*" {
            let mut all: Vec<&String> = self.nodes.keys().collect();
            all.sort_by(|a, b| {
                self.node_degree(b)
                    .cmp(&self.node_degree(a))
                    .then_with(|| a.cmp(b))
            });
            let is_truncated = all.len() > max_nodes;
            all.truncate(max_nodes);
            let included: HashSet<&str> = all.iter().map(|s| s.as_str()).collect();
            return Subgraph {
                nodes: all.iter().filter_map(|id| self.view_node(id)).collect(),
                edges: self.edges_within(&included),
                is_truncated,
                max_depth_reached: 0,
            };
        }

        if !self.nodes.contains_key(label) {
            return Subgraph::default();
        }

        let mut hops: HashMap<&str, usize> = HashMap::new();
        let mut queue = VecDeque::new();
        hops.insert(label, 0);
        queue.push_back(label);
        while let Some(current) = queue.pop_front() {
            let depth = hops[current];
            if depth >= max_depth {
                continue;
            }
            if let Some(neighbors) = self.adjacency.get(current) {
                for next in neighbors {
                    if !hops.contains_key(next.as_str()) {
                        hops.insert(next.as_str(), depth + 1);
                        queue.push_back(next.as_str());
                    }
                }
            }
        }

        let mut found: Vec<(&str, usize)> = hops.into_iter().collect();
        found.sort_by(|(a, ha), (b, hb)| {
            ha.cmp(hb)
                .then_with(|| self.node_degree(b).cmp(&self.node_degree(a)))
                .then_with(|| a.cmp(b))
        });
        let is_truncated = found.len() > max_nodes;
        found.truncate(max_nodes);

        let max_depth_reached = found.iter().map(|(_, h)| *h).max().unwrap_or(0);
        let included: HashSet<&str> = found.iter().map(|(id, _)| *id).collect();
        Subgraph {
            nodes: found.iter().filter_map(|(id, _)| self.view_node(id)).collect(),
            edges: self.edges_within(&included),
            is_truncated,
            max_depth_reached,
        }
    }
}

fn ordered(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}
