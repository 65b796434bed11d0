//! Graph-based retrieval-augmented generation in the style of
//! [LightRAG](https://github.com/HKUDS/LightRAG).
//!
//! Documents are chunked, entities and relations are extracted from each
//! chunk and merged into a knowledge graph, and queries combine vector
//! search over entities, relations and chunks with graph neighbourhoods.
//! Every collection keeps its state as JSON files in its own directory.

pub mod cache;
pub mod chunker;
pub mod engine;
pub mod entity_extractor;
pub mod graph;
pub mod merge;
pub mod pipeline;
pub mod prompts;
pub mod query;
pub mod storage;
pub mod tokenizer;
pub mod utils;

pub use chunker::{Chunk, Chunker};
pub use engine::{DeletionResult, EntityEdit, EntityInfo, ErrorFile, LightRag, RelationEdit};
pub use graph::{KnowledgeGraph, Subgraph};
pub use pipeline::{PipelineSnapshot, PipelineStatus};
pub use query::{QueryMode, QueryParam, QueryResult};
pub use storage::{DocProcessingStatus, DocStatus};
