//! External integrations module.
//!
//! Provides clients for:
//! - OpenAI-compatible chat completion
//! - Ollama (local chat and embeddings)
//! - OpenAI, Jina and Ollama embeddings with a local hashing fallback
//! - Jina/Cohere-compatible reranking
//! - Retry with backoff for rate-limited or failing providers
//!
//! [`ModelClients`] bundles the configured set for the RAG engine.

pub mod clients;
pub mod embeddings;
pub mod llm;
pub mod ollama;
pub mod openai;
pub mod rerank;
pub mod retry;

pub use clients::{ClientsHandle, ModelClients, RagSettings};
pub use embeddings::{EmbedBackend, Embedder, EmbeddingService, JinaClient, LocalEmbedder};
pub use llm::LlmBackend;
pub use ollama::OllamaClient;
pub use openai::{ChatMessage, CompletionOptions, OpenAIClient};
pub use rerank::{RerankClient, RerankResult};
pub use retry::RetryPolicy;
