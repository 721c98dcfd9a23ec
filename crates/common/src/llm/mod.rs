//! Streaming chat client for the answer generator
//!
//! Provides:
//! - [`LlmClient`]: provider-agnostic streaming chat interface
//! - [`OllamaChat`]: Ollama `/api/chat` with NDJSON streaming
//! - [`MockLlm`]: scripted deltas with delay and failure injection
//!
//! A stream is delivered as an `mpsc::Receiver`. Dropping the receiver stops
//! the background reader, which in turn drops the upstream HTTP response.

use crate::config::LlmConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[cfg(any(test, feature = "testing"))]
mod mock;

#[cfg(any(test, feature = "testing"))]
pub use mock::MockLlm;

/// Buffered deltas between the reader task and the consumer
const CHANNEL_CAPACITY: usize = 32;

/// A single chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

/// One generation request
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    /// Model to use; falls back to the client's configured model
    pub model: Option<String>,

    pub messages: Vec<ChatMessage>,

    pub temperature: f32,
}

/// A fragment of generated text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmDelta {
    pub content: String,

    /// Set on the last fragment the model produces
    pub done: bool,
}

/// Streaming chat provider
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Start a generation; fragments arrive on the returned channel
    async fn stream_chat(&self, request: ChatRequest) -> Result<mpsc::Receiver<Result<LlmDelta>>>;

    /// Whether the provider answers at all
    async fn health_check(&self) -> bool;

    /// Default model name
    fn name(&self) -> &str;
}

/// Ollama chat client
pub struct OllamaChat {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaChatLine {
    #[serde(default)]
    message: Option<OllamaChatContent>,

    #[serde(default)]
    done: bool,

    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct OllamaChatContent {
    #[serde(default)]
    content: String,
}

impl OllamaChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        // No overall timeout: generation length is unbounded, inactivity is
        // enforced by the consumer
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create LLM client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }
}

/// Decode one NDJSON line
///
/// Blank and undecodable lines yield `None`; only an `error` line from the
/// server becomes `Err`.
fn parse_line(line: &[u8]) -> Option<Result<LlmDelta>> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let parsed: OllamaChatLine = match serde_json::from_str(text) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!(error = %e, line = %text, "Skipping malformed chat stream line");
            return None;
        }
    };

    if let Some(error) = parsed.error {
        return Some(Err(AppError::LlmError { message: error }));
    }

    Some(Ok(LlmDelta {
        content: parsed.message.map(|m| m.content).unwrap_or_default(),
        done: parsed.done,
    }))
}

/// Forward deltas from an NDJSON body until `done`, an error, or hang-up
///
/// Returning drops `body`, which releases the upstream connection. The
/// consumer going away is observed even while the body is silent.
async fn forward_lines<S, B, E>(body: S, tx: mpsc::Sender<Result<LlmDelta>>)
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut body = std::pin::pin!(body);
    // Lines may be split across chunks
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let item = tokio::select! {
            _ = tx.closed() => {
                tracing::debug!("Chat stream consumer gone; closing upstream");
                return;
            }
            item = body.next() => item,
        };

        let bytes = match item {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                let _ = tx
                    .send(Err(AppError::LlmError {
                        message: format!("stream interrupted: {}", e),
                    }))
                    .await;
                return;
            }
            None => break,
        };

        pending.extend_from_slice(bytes.as_ref());
        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            if let Some(delta) = parse_line(&line) {
                let finished = matches!(&delta, Ok(d) if d.done) || delta.is_err();
                if tx.send(delta).await.is_err() || finished {
                    return;
                }
            }
        }
    }

    if let Some(delta) = parse_line(&pending) {
        let _ = tx.send(delta).await;
    }
}

#[async_trait]
impl LlmClient for OllamaChat {
    async fn stream_chat(&self, request: ChatRequest) -> Result<mpsc::Receiver<Result<LlmDelta>>> {
        let url = format!("{}/api/chat", self.base_url);
        let model = request.model.as_deref().unwrap_or(&self.model);

        let body = OllamaChatRequest {
            model,
            messages: &request.messages,
            stream: true,
            options: OllamaOptions { temperature: request.temperature },
        };

        tracing::debug!(model = %model, "Starting chat stream");

        let res = self.client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::LlmError {
                message: format!("request to {} failed: {}", url, e),
            })?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(AppError::LlmError {
                message: format!("{} {}", status, text),
            });
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(forward_lines(res.bytes_stream(), tx));

        Ok(rx)
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).timeout(Duration::from_secs(5)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Create the configured chat client
pub fn create_llm(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    Ok(Arc::new(OllamaChat::new(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> LlmConfig {
        LlmConfig {
            base_url: server.uri(),
            ..LlmConfig::default()
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: None,
            messages: vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
            temperature: 0.3,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<Result<LlmDelta>>) -> Vec<Result<LlmDelta>> {
        let mut out = Vec::new();
        while let Some(item) = rx.recv().await {
            out.push(item);
        }
        out
    }

    #[test]
    fn test_parse_line() {
        let delta = parse_line(br#"{"message":{"role":"assistant","content":"Hel"},"done":false}"#)
            .unwrap()
            .unwrap();
        assert_eq!(delta, LlmDelta { content: "Hel".into(), done: false });

        assert!(parse_line(b"   \n").is_none());
        assert!(parse_line(br#"{"error":"model not found"}"#).unwrap().is_err());
        assert!(parse_line(b"not json").is_none());
    }

    #[tokio::test]
    async fn test_ollama_stream() {
        let server = MockServer::start().await;
        let body = concat!(
            r#"{"message":{"role":"assistant","content":"Hello"},"done":false}"#, "\n",
            r#"{"message":{"role":"assistant","content":" world"},"done":false}"#, "\n",
            r#"{"message":{"role":"assistant","content":""},"done":true}"#, "\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(serde_json::json!({ "model": "llama3", "stream": true })))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let client = OllamaChat::new(&config_for(&server)).unwrap();
        let mut req = request();
        req.model = Some("llama3".into());

        let deltas = collect(client.stream_chat(req).await.unwrap()).await;
        let text: String = deltas.iter().map(|d| d.as_ref().unwrap().content.clone()).collect();
        assert_eq!(text, "Hello world");
        assert!(deltas.last().unwrap().as_ref().unwrap().done);
    }

    #[tokio::test]
    async fn test_malformed_line_is_skipped() {
        let server = MockServer::start().await;
        let body = concat!(
            r#"{"message":{"role":"assistant","content":"Hello"},"done":false}"#, "\n",
            "garbage\n",
            r#"{"message":{"role":"assistant","content":" world"},"done":false}"#, "\n",
            r#"{"message":{"role":"assistant","content":""},"done":true}"#, "\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let client = OllamaChat::new(&config_for(&server)).unwrap();
        let deltas = collect(client.stream_chat(request()).await.unwrap()).await;

        assert_eq!(deltas.len(), 3);
        assert!(deltas.iter().all(|d| d.is_ok()));
        let text: String = deltas.iter().map(|d| d.as_ref().unwrap().content.clone()).collect();
        assert_eq!(text, "Hello world");
        assert!(deltas[2].as_ref().unwrap().done);
    }

    #[tokio::test]
    async fn test_reader_exits_when_consumer_leaves_silent_stream() {
        let first: std::result::Result<Vec<u8>, std::io::Error> =
            Ok(br#"{"message":{"content":"Hel"},"done":false}"#.iter().copied().chain([b'\n']).collect());
        // One line, then the body stays open without data
        let body = futures::stream::iter([first]).chain(futures::stream::pending());

        let (tx, mut rx) = mpsc::channel(4);
        let reader = tokio::spawn(forward_lines(body, tx));

        assert_eq!(rx.recv().await.unwrap().unwrap().content, "Hel");
        drop(rx);

        tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("reader should stop once the receiver is dropped")
            .unwrap();
    }

    #[tokio::test]
    async fn test_ollama_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = OllamaChat::new(&config_for(&server)).unwrap();
        let err = client.stream_chat(request()).await.unwrap_err();
        assert!(matches!(err, AppError::LlmError { .. }));
        assert!(!client.health_check().await);
    }

    #[tokio::test]
    async fn test_mock_llm_script() {
        let llm = MockLlm::new(["a", "b", "c"]);
        let deltas = collect(llm.stream_chat(request()).await.unwrap()).await;
        assert_eq!(deltas.len(), 3);
        assert!(deltas[2].as_ref().unwrap().done);
        assert_eq!(llm.delivered(), 3);
        assert_eq!(llm.last_request().unwrap().messages[1].content, "hi");

        let failing = MockLlm::new(["a", "b"]).fail_after(1);
        let deltas = collect(failing.stream_chat(request()).await.unwrap()).await;
        assert!(deltas[0].is_ok());
        assert!(deltas[1].is_err());
    }
}
