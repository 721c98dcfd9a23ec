//! Embedding service abstraction
//!
//! Provides a unified interface for multiple embedding providers:
//! - Ollama (`/api/embed`, e.g. bge-m3 served locally)
//! - OpenAI-compatible `/embeddings` endpoints (OpenAI, text-embeddings-inference)
//! - Deterministic mock vectors for tests and dry runs

use crate::config::EmbeddingConfig;
use crate::errors::{AppError, Result};
use crate::metrics;
use async_trait::async_trait;
use backoff::future::retry_notify;
use backoff::ExponentialBackoffBuilder;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Text embedded once at startup to learn the model's output width
const DIMENSION_PROBE: &str = "dimension probe";

/// Trait for embedding generation
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts (batch)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the configured embedding dimension
    fn dimension(&self) -> usize;

    /// Embed a probe text and report the width the model actually produces
    async fn detect_dimension(&self) -> Result<usize> {
        let vector = self.embed(DIMENSION_PROBE).await?;
        if vector.is_empty() {
            return Err(AppError::EmbeddingError {
                message: format!("model '{}' returned an empty vector", self.model_name()),
            });
        }
        Ok(vector.len())
    }

    /// Whether the provider can serve requests right now
    async fn ready(&self) -> bool;
}

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::Configuration {
            message: format!("Failed to create HTTP client: {}", e),
        })
}

/// First backoff interval; later ones double up to [`RETRY_MAX_INTERVAL`]
const RETRY_INITIAL_INTERVAL: Duration = Duration::from_millis(200);
const RETRY_MAX_INTERVAL: Duration = Duration::from_secs(2);

/// Upper bound on a readiness check
const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Run `request` up to `max_retries + 1` times with exponential backoff
///
/// Only transient failures (timeouts, connection errors, 5xx) are retried;
/// anything else is returned after the first attempt.
async fn with_retry<T, F, Fut>(model: &str, max_retries: u32, mut request: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(RETRY_INITIAL_INTERVAL)
        .with_max_interval(RETRY_MAX_INTERVAL)
        .with_max_elapsed_time(None)
        .build();

    let mut attempt: u32 = 0;
    let operation = || {
        attempt += 1;
        let current = attempt;
        let call = request();
        async move {
            let start = Instant::now();
            match call.await {
                Ok(value) => {
                    metrics::record_embedding(start.elapsed().as_secs_f64(), model, true);
                    Ok(value)
                }
                Err(e) => {
                    metrics::record_embedding(start.elapsed().as_secs_f64(), model, false);
                    if e.is_transient() && current <= max_retries {
                        Err(backoff::Error::transient(e))
                    } else {
                        Err(backoff::Error::permanent(e))
                    }
                }
            }
        }
    };

    retry_notify(policy, operation, |e: AppError, delay: Duration| {
        tracing::warn!(
            max_retries = max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "Embedding request failed, retrying"
        );
    })
    .await
}

fn map_send_error(e: reqwest::Error, timeout: Duration) -> AppError {
    if e.is_timeout() {
        AppError::EmbeddingTimeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    } else {
        AppError::EmbeddingUnavailable {
            message: format!("Request failed: {}", e),
        }
    }
}

/// Non-success response; 5xx, 408 and 429 may clear up, other 4xx will not
fn map_status_error(status: StatusCode, body: String) -> AppError {
    let message = format!("API error {}: {}", status, body);
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        AppError::EmbeddingUnavailable { message }
    } else {
        AppError::EmbeddingError { message }
    }
}

/// Ollama embedding client
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
    device: Option<String>,
    timeout: Duration,
    max_retries: u32,
}

#[derive(Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let base_url = config
            .api_base
            .clone()
            .unwrap_or_else(|| "http://127.0.0.1:11434".to_string());

        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimension: config.dimension,
            device: config.device.clone(),
            timeout,
            max_retries: config.max_retries,
        })
    }

    fn options(&self) -> Option<serde_json::Value> {
        // num_gpu = 0 keeps every layer on the CPU
        match self.device.as_deref() {
            Some(device) if device.eq_ignore_ascii_case("cpu") => {
                Some(serde_json::json!({ "num_gpu": 0 }))
            }
            _ => None,
        }
    }

    async fn make_request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.base_url);
        let request = OllamaEmbedRequest {
            model: &self.model,
            input: texts,
            options: self.options(),
        };

        let response = self.client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(map_status_error(status, body));
        }

        let result: OllamaEmbedResponse = response.json().await.map_err(|e| {
            AppError::EmbeddingError {
                message: format!("Failed to parse response: {}", e),
            }
        })?;

        if result.embeddings.len() != texts.len() {
            return Err(AppError::EmbeddingError {
                message: format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    result.embeddings.len()
                ),
            });
        }

        Ok(result.embeddings)
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let texts = [text.to_string()];
        let embeddings = with_retry(&self.model, self.max_retries, || self.make_request(&texts)).await?;
        embeddings.into_iter().next().ok_or_else(|| AppError::EmbeddingError {
            message: "Empty response".to_string(),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        with_retry(&self.model, self.max_retries, || self.make_request(texts)).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn ready(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).timeout(READY_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

/// OpenAI-compatible embedding client
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    dimension: usize,
    base_url: String,
    timeout: Duration,
    max_retries: u32,
}

#[derive(Serialize)]
struct OpenAIRequest<'a> {
    input: &'a [String],
    model: &'a str,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    data: Vec<OpenAIEmbedding>,
}

#[derive(Deserialize)]
struct OpenAIEmbedding {
    embedding: Vec<f32>,
}

impl OpenAIEmbedder {
    /// Create a new OpenAI-compatible embedder
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let base_url = config
            .api_base
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        // Self-hosted servers run without a key; the public API does not
        if config.api_key.is_none() && base_url.contains("api.openai.com") {
            return Err(AppError::Configuration {
                message: "embedding.api_key is required for api.openai.com".to_string(),
            });
        }

        Ok(Self {
            client: http_client(timeout)?,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            dimension: config.dimension,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            max_retries: config.max_retries,
        })
    }

    async fn make_request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);

        let request = OpenAIRequest {
            input: texts,
            model: &self.model,
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_send_error(e, self.timeout))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(map_status_error(status, body));
        }

        let result: OpenAIResponse = response.json().await.map_err(|e| {
            AppError::EmbeddingError {
                message: format!("Failed to parse response: {}", e),
            }
        })?;

        Ok(result.data.into_iter().map(|e| e.embedding).collect())
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let texts = [text.to_string()];
        let embeddings = with_retry(&self.model, self.max_retries, || self.make_request(&texts)).await?;
        embeddings.into_iter().next().ok_or_else(|| AppError::EmbeddingError {
            message: "Empty response".to_string(),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        const BATCH_SIZE: usize = 100;

        let mut all_embeddings = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(BATCH_SIZE) {
            let embeddings = with_retry(&self.model, self.max_retries, || self.make_request(chunk)).await?;
            all_embeddings.extend(embeddings);
        }

        Ok(all_embeddings)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn ready(&self) -> bool {
        // One attempt, no retries
        let texts = [DIMENSION_PROBE.to_string()];
        matches!(
            tokio::time::timeout(READY_TIMEOUT, self.make_request(&texts)).await,
            Ok(Ok(_))
        )
    }
}

/// Mock embedder for testing
///
/// Vectors are unit-length and derived from a SHA-256 of the text, so equal
/// texts always embed identically.
pub struct MockEmbedder {
    dimension: usize,
    calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of texts embedded so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = Vec::with_capacity(self.dimension);
        let mut block = Sha256::digest(text.as_bytes());
        while vector.len() < self.dimension {
            for byte in block.iter() {
                if vector.len() == self.dimension {
                    break;
                }
                vector.push(*byte as f32 / 255.0 - 0.5);
            }
            block = Sha256::digest(block);
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.embed(text).await?);
        }
        Ok(embeddings)
    }

    fn model_name(&self) -> &str {
        "mock-embedding"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn ready(&self) -> bool {
        true
    }
}

/// Create an embedder based on configuration
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.to_ascii_lowercase().as_str() {
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "mock" => {
            tracing::warn!("Using mock embeddings; search results will not be meaningful");
            Ok(Arc::new(MockEmbedder::new(config.dimension)))
        }
        other => Err(AppError::Configuration {
            message: format!("unknown embedding provider '{}'", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_mock_embedder() {
        let embedder = MockEmbedder::new(768);
        let embedding = embedder.embed("test text").await.unwrap();
        assert_eq!(embedding.len(), 768);

        let again = embedder.embed("test text").await.unwrap();
        assert_eq!(embedding, again);
        assert_ne!(embedding, embedder.embed("other text").await.unwrap());
        assert_eq!(embedder.calls(), 3);
    }

    #[tokio::test]
    async fn test_mock_batch() {
        let embedder = MockEmbedder::new(768);
        let texts = vec!["text1".to_string(), "text2".to_string()];
        let embeddings = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(embeddings.len(), 2);
        assert_eq!(embeddings[0].len(), 768);
        assert_eq!(embedder.detect_dimension().await.unwrap(), 768);
    }

    #[tokio::test]
    async fn test_ollama_embed_and_detect_dimension() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .and(body_partial_json(serde_json::json!({
                "model": "bge-m3",
                "options": { "num_gpu": 0 }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "bge-m3",
                "embeddings": [[0.1, 0.2, 0.3]]
            })))
            .mount(&server)
            .await;

        let config = EmbeddingConfig {
            api_base: Some(server.uri()),
            device: Some("CPU".to_string()),
            max_retries: 0,
            ..EmbeddingConfig::default()
        };
        let embedder = OllamaEmbedder::new(&config).unwrap();

        let vector = embedder.embed("hello").await.unwrap();
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
        assert_eq!(embedder.detect_dimension().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_ollama_error_status_is_embedding_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(404).set_body_string("model not found"))
            .mount(&server)
            .await;

        let config = EmbeddingConfig {
            api_base: Some(server.uri()),
            max_retries: 0,
            ..EmbeddingConfig::default()
        };
        let embedder = OllamaEmbedder::new(&config).unwrap();

        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, AppError::EmbeddingError { .. }));
        assert!(!embedder.ready().await);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .expect(1)
            .mount(&server)
            .await;

        let config = EmbeddingConfig {
            api_base: Some(server.uri()),
            max_retries: 3,
            ..EmbeddingConfig::default()
        };
        let embedder = OllamaEmbedder::new(&config).unwrap();

        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, AppError::EmbeddingError { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_unavailable_backend_is_retried_until_it_recovers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(503).set_body_string("loading model"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "bge-m3",
                "embeddings": [[0.4, 0.5]]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = EmbeddingConfig {
            api_base: Some(server.uri()),
            max_retries: 2,
            ..EmbeddingConfig::default()
        };
        let embedder = OllamaEmbedder::new(&config).unwrap();

        assert_eq!(embedder.embed("hello").await.unwrap(), vec![0.4, 0.5]);
    }

    #[tokio::test]
    async fn test_retries_stop_at_the_configured_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .expect(2)
            .mount(&server)
            .await;

        let config = EmbeddingConfig {
            api_base: Some(server.uri()),
            max_retries: 1,
            ..EmbeddingConfig::default()
        };
        let embedder = OllamaEmbedder::new(&config).unwrap();

        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, AppError::EmbeddingUnavailable { .. }));
    }

    #[test]
    fn test_create_embedder_rejects_unknown_provider() {
        let config = EmbeddingConfig {
            provider: "word2vec".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(matches!(create_embedder(&config), Err(AppError::Configuration { .. })));

        let config = EmbeddingConfig {
            provider: "openai".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(create_embedder(&config).is_err());
    }
}
