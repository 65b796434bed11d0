//! LightRAG server library
//!
//! Multi-collection retrieval-augmented generation over a knowledge graph:
//! - Document upload, text extraction and background indexing
//! - Chunking, entity/relation extraction and graph merging
//! - Local, global, hybrid, naive, mix and bypass query modes
//! - Persisted, hot-reloadable provider configuration
//! - HTTP API with health, service info and Prometheus metrics

pub mod api;
pub mod background;
pub mod config;
pub mod constants;
pub mod documents;
pub mod error;
pub mod health;
pub mod integrations;
pub mod lightrag;
pub mod manager;
pub mod metrics;
pub mod paths;
pub mod service;

// Re-export common types
pub use config::{AppConfig, ConfigManager};
pub use error::{Error, Result};
pub use lightrag::LightRag;
pub use manager::LightRagManager;
pub use paths::{StorageLayout, StorageLock};
pub use service::ServiceManager;
