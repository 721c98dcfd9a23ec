//! Configuration management for ScopeRAG services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default.toml, config/{APP_ENV}.toml, config/local.toml)
//! - Default values
//!
//! Every section carries serde defaults, so an empty environment yields a
//! working single-machine setup (both scopes on 127.0.0.1:6333, Ollama on
//! 127.0.0.1:11434).

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{AppError, Result};
use crate::scope::ScopeSelector;

/// Retries beyond this only delay the error chunk
pub const MAX_EMBEDDING_RETRIES: u32 = 10;

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Vector-store deployments and collection naming
    pub qdrant: QdrantConfig,

    /// Retrieval tuning
    pub retrieval: RetrievalConfig,

    /// Embedding service configuration
    pub embedding: EmbeddingConfig,

    /// In-process caches
    pub cache: CacheConfig,

    /// Answer-generating LLM
    pub llm: LlmConfig,

    /// Canned conversational replies
    pub chat: ChatConfig,

    /// Observability configuration
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Timeout for non-streaming requests in seconds
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    pub shutdown_timeout_secs: u64,
}

/// Connection settings for one vector-store deployment
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_host")]
    pub host: String,

    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// Per-request timeout in seconds
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: f64,

    /// Optional `api-key` header value
    #[serde(default)]
    pub api_key: Option<String>,

    /// Use https instead of http
    #[serde(default)]
    pub tls: bool,
}

fn default_backend_host() -> String { "127.0.0.1".to_string() }
fn default_backend_port() -> u16 { 6333 }
fn default_backend_timeout() -> f64 { 20.0 }

impl BackendConfig {
    pub fn url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QdrantConfig {
    /// Deployment environment embedded in collection names (dev, prod, ...)
    pub environment: String,

    /// Base collection name
    pub base_name: String,

    /// Scope used when a request names none
    pub default_scope: ScopeSelector,

    /// Whether an unreachable scope may be served by `fallback_scope`
    pub fallback_enabled: bool,

    /// Scope that serves requests for an unreachable scope
    pub fallback_scope: ScopeSelector,

    /// Legacy collection names tried after the canonical name (empty = derived list)
    pub legacy_collections: Vec<String>,

    /// How long health results stay fresh, in seconds
    pub health_ttl_secs: u64,

    /// HNSW `ef` search parameter
    pub hnsw_ef: u64,

    /// Exact (brute force) search instead of HNSW
    pub exact: bool,

    /// Personal deployment
    pub personal: BackendConfig,

    /// Department deployment
    pub dept: BackendConfig,
}

impl QdrantConfig {
    /// Connection settings for a scope
    pub fn backend(&self, scope: ScopeSelector) -> &BackendConfig {
        match scope {
            ScopeSelector::Personal => &self.personal,
            ScopeSelector::Dept => &self.dept,
        }
    }

    /// Fallback scope for `scope`, if one applies
    pub fn fallback_for(&self, scope: ScopeSelector) -> Option<ScopeSelector> {
        (self.fallback_enabled && self.fallback_scope != scope).then_some(self.fallback_scope)
    }

    pub fn health_ttl(&self) -> Duration {
        Duration::from_secs(self.health_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Hits kept after deduplication
    pub top_k: usize,

    /// Minimum similarity score (inclusive)
    pub score_threshold: f32,

    /// Characters kept from each hit's text
    pub snippet_chars: usize,

    /// Upper bound for the assembled context
    pub max_context_chars: usize,

    /// Budget for embedding plus vector search of one question, in seconds
    pub timeout_secs: u64,
}

impl RetrievalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Embedding provider: ollama, openai, mock
    pub provider: String,

    /// API key for embedding service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    pub model: String,

    /// Expected embedding dimension
    pub dimension: usize,

    /// Inference device hint (cpu, gpu)
    pub device: Option<String>,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Maximum retries
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached query embeddings
    pub embedding_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Ollama base URL
    pub base_url: String,

    /// Default chat model
    pub model: String,

    pub temperature: f32,

    /// Connection establishment timeout in seconds
    pub connect_timeout_secs: u64,

    /// Maximum silence between streamed tokens in seconds
    pub inactivity_timeout_secs: u64,

    /// System instruction sent with every prompt
    pub system_prompt: String,
}

impl LlmConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Questions containing one of these are answered with `greeting_reply`
    pub greetings: Vec<String>,

    pub greeting_reply: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error) or a full EnvFilter directive
    pub log_level: String,

    /// Enable JSON logging
    pub json_logging: bool,

    /// Prometheus exporter port (0 to disable)
    pub metrics_port: u16,

    /// Service name reported in logs and the root endpoint
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests per second (global)
    pub requests_per_second: u32,

    /// Burst capacity
    pub burst: u32,

    /// Enable rate limiting
    pub enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_secs: 30,
            shutdown_timeout_secs: 30,
        }
    }
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            environment: "dev".to_string(),
            base_name: "my_documents".to_string(),
            default_scope: ScopeSelector::Personal,
            fallback_enabled: true,
            fallback_scope: ScopeSelector::Personal,
            legacy_collections: Vec::new(),
            health_ttl_secs: 30,
            hnsw_ef: 128,
            exact: false,
            personal: BackendConfig {
                host: "127.0.0.1".to_string(),
                port: 6333,
                timeout_secs: 15.0,
                api_key: None,
                tls: false,
            },
            dept: BackendConfig {
                host: "127.0.0.1".to_string(),
                port: 6333,
                timeout_secs: 20.0,
                api_key: None,
                tls: false,
            },
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            score_threshold: 0.30,
            snippet_chars: 500,
            max_context_chars: 4000,
            timeout_secs: 25,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            api_key: None,
            api_base: None,
            model: "bge-m3".to_string(),
            dimension: 1024,
            device: None,
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { embedding_capacity: 100 }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            model: "gemma3:4b".to_string(),
            temperature: 0.3,
            connect_timeout_secs: 10,
            inactivity_timeout_secs: 60,
            system_prompt: "You are the company's internal knowledge assistant. \
                Answer politely and clearly, using only the reference material you are given."
                .to_string(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            greetings: vec!["hello".to_string(), "hi there".to_string(), "good morning".to_string()],
            greeting_reply: "Hello! How can I help you today?".to_string(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logging: true,
            metrics_port: 0,
            service_name: "scoperag".to_string(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 20,
            burst: 40,
            enabled: true,
        }
    }
}

fn env_source() -> Environment {
    // e.g., APP__QDRANT__DEPT__HOST=10.0.0.5
    Environment::with_prefix("APP")
        .separator("__")
        .list_separator(",")
        .with_list_parse_key("qdrant.legacy_collections")
        .with_list_parse_key("chat.greetings")
        .try_parsing(true)
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> std::result::Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Scope timeouts differ, so partial overrides must not reset them
            .set_default("qdrant.personal.timeout_secs", 15.0)?
            .set_default("qdrant.dept.timeout_secs", 20.0)?

            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            .add_source(env_source())

            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific config file
    pub fn from_file(path: &str) -> std::result::Result<Self, ConfigError> {
        let config = Config::builder()
            .set_default("qdrant.personal.timeout_secs", 15.0)?
            .set_default("qdrant.dept.timeout_secs", 20.0)?
            .add_source(File::with_name(path))
            .add_source(env_source())
            .build()?;

        config.try_deserialize()
    }

    /// Reject values the service cannot run with
    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| Err(AppError::Configuration { message });

        if self.retrieval.top_k == 0 {
            return fail("retrieval.top_k must be at least 1".into());
        }
        if !(-1.0..=1.0).contains(&self.retrieval.score_threshold) {
            return fail(format!(
                "retrieval.score_threshold must lie in [-1, 1], got {}",
                self.retrieval.score_threshold
            ));
        }
        if self.retrieval.snippet_chars == 0 || self.retrieval.max_context_chars == 0 {
            return fail("retrieval snippet/context limits must be positive".into());
        }
        if self.cache.embedding_capacity == 0 {
            return fail("cache.embedding_capacity must be at least 1".into());
        }
        if self.qdrant.base_name.trim().is_empty() || self.qdrant.environment.trim().is_empty() {
            return fail("qdrant.base_name and qdrant.environment must not be empty".into());
        }
        for scope in ScopeSelector::ALL {
            let backend = self.qdrant.backend(scope);
            if !(backend.timeout_secs.is_finite() && backend.timeout_secs > 0.0) {
                return fail(format!("qdrant.{}.timeout_secs must be a positive number", scope));
            }
        }
        if self.llm.inactivity_timeout_secs == 0 || self.llm.connect_timeout_secs == 0 {
            return fail("llm timeouts must be positive".into());
        }
        if self.embedding.dimension == 0 {
            return fail("embedding.dimension must be positive".into());
        }
        if self.embedding.max_retries > MAX_EMBEDDING_RETRIES {
            return fail(format!(
                "embedding.max_retries must not exceed {}, got {}",
                MAX_EMBEDDING_RETRIES, self.embedding.max_retries
            ));
        }
        if self.retrieval.timeout_secs == 0 {
            return fail("retrieval.timeout_secs must be positive".into());
        }
        // Retrieval must give up, and stream its error, before the request is cut off
        if self.server.request_timeout_secs <= self.retrieval.timeout_secs {
            return fail(format!(
                "server.request_timeout_secs ({}) must exceed retrieval.timeout_secs ({})",
                self.server.request_timeout_secs, self.retrieval.timeout_secs
            ));
        }
        if self.rate_limit.enabled && (self.rate_limit.requests_per_second == 0 || self.rate_limit.burst == 0) {
            return fail("rate_limit values must be positive when enabled".into());
        }
        Ok(())
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }
}
