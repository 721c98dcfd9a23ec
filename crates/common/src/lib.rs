//! ScopeRAG Common Library
//!
//! Shared code for the ScopeRAG crates including:
//! - Scope and source selectors, collection naming
//! - Embedding client abstraction and the query-embedding cache
//! - Streaming LLM client
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability

pub mod cache;
pub mod config;
pub mod embeddings;
pub mod errors;
pub mod llm;
pub mod metrics;
pub mod scope;

// Re-export commonly used types
pub use cache::EmbeddingCache;
pub use config::AppConfig;
pub use embeddings::Embedder;
pub use errors::{AppError, Result};
pub use llm::LlmClient;
pub use scope::{CollectionNamingPolicy, ScopeSelector, SourceType};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
