//! Streaming answer generation
//!
//! Each answer runs as a small state machine on its own task:
//!
//! ```text
//! Idle -> PromptBuilt -> Streaming -> Completed | Failed | TimedOut | Cancelled
//! ```
//!
//! Fragments are forwarded as soon as the model produces them. Every stream
//! that reaches the client ends with exactly one chunk marked `done`; the
//! final chunk carries the references, and an `error` when generation did not
//! complete. Dropping the [`AnswerStream`] cancels generation and releases the
//! model connection. The model call is never retried once output has started.

pub mod prompt;

use crate::retrieval::{NoResultReason, Reference};
use scoperag_common::config::LlmConfig;
use scoperag_common::llm::{ChatMessage, ChatRequest, LlmClient, LlmDelta};
use scoperag_common::metrics;
use scoperag_common::scope::SourceType;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

/// Chunks buffered between the generator task and the transport
const CHUNK_BUFFER: usize = 16;

/// Lifecycle of one answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    PromptBuilt,
    Streaming,
    Completed,
    Failed,
    TimedOut,
    /// The client went away before the model finished
    Cancelled,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamState::Completed | StreamState::Failed | StreamState::TimedOut | StreamState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::PromptBuilt => "prompt_built",
            StreamState::Streaming => "streaming",
            StreamState::Completed => "completed",
            StreamState::Failed => "failed",
            StreamState::TimedOut => "timed_out",
            StreamState::Cancelled => "cancelled",
        }
    }
}

/// One line of the answer stream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamChunk {
    pub content: String,

    pub done: bool,

    /// Present on the final chunk only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub references: Option<Vec<Reference>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

impl StreamChunk {
    /// Intermediate fragment
    pub fn delta(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            done: false,
            references: None,
            error: None,
            notice: None,
        }
    }

    /// Terminal chunk of a successful stream
    pub fn finish(content: impl Into<String>, references: Vec<Reference>, notice: Option<String>) -> Self {
        Self {
            content: content.into(),
            done: true,
            references: Some(references),
            error: None,
            notice,
        }
    }

    /// Terminal chunk of a failed stream
    pub fn failure(message: impl Into<String>, references: Vec<Reference>, notice: Option<String>) -> Self {
        Self {
            content: String::new(),
            done: true,
            references: Some(references),
            error: Some(message.into()),
            notice,
        }
    }
}

/// Input for one answer
#[derive(Debug, Clone)]
pub struct AnswerRequest {
    pub question: String,

    pub source: SourceType,

    /// Rendered retrieval context; may be empty
    pub context: String,

    pub references: Vec<Reference>,

    /// Overrides the configured model
    pub model: Option<String>,

    /// Shown with the final chunk, e.g. after a scope fallback
    pub notice: Option<String>,
}

/// Receiving end of an answer
pub struct AnswerStream {
    chunks: mpsc::Receiver<StreamChunk>,
    state: watch::Receiver<StreamState>,
}

impl AnswerStream {
    /// Next chunk; `None` after the final one
    pub async fn recv(&mut self) -> Option<StreamChunk> {
        self.chunks.recv().await
    }

    /// Current state of the generator
    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Observer that outlives the stream, for tests and diagnostics
    pub fn state_watcher(&self) -> watch::Receiver<StreamState> {
        self.state.clone()
    }

    pub fn into_receiver(self) -> mpsc::Receiver<StreamChunk> {
        self.chunks
    }
}

/// Drives the model and shapes its output into [`StreamChunk`]s
pub struct AnswerStreamer {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    temperature: f32,
    inactivity_timeout: Duration,
}

impl AnswerStreamer {
    pub fn new(llm: Arc<dyn LlmClient>, config: &LlmConfig) -> Self {
        Self {
            llm,
            system_prompt: config.system_prompt.clone(),
            temperature: config.temperature,
            inactivity_timeout: config.inactivity_timeout(),
        }
    }

    pub fn with_inactivity_timeout(mut self, inactivity_timeout: Duration) -> Self {
        self.inactivity_timeout = inactivity_timeout;
        self
    }

    pub fn llm(&self) -> &Arc<dyn LlmClient> {
        &self.llm
    }

    /// A stream holding a single final chunk
    pub fn canned(content: impl Into<String>, references: Vec<Reference>, notice: Option<String>) -> AnswerStream {
        Self::single(StreamChunk::finish(content, references, notice))
    }

    /// Graceful reply when retrieval found nothing usable
    pub fn no_results(source: SourceType, reason: NoResultReason, notice: Option<String>) -> AnswerStream {
        let message = prompt::no_results_message(source, reason);
        let chunk = match reason {
            NoResultReason::BackendUnavailable => StreamChunk {
                content: message.to_string(),
                ..StreamChunk::failure("vector store unavailable", Vec::new(), notice)
            },
            _ => StreamChunk::finish(message, Vec::new(), notice),
        };
        Self::single(chunk)
    }

    /// A stream ending in an error chunk, for failures before generation
    pub fn error(message: impl Into<String>) -> AnswerStream {
        Self::single(StreamChunk::failure(message, Vec::new(), None))
    }

    fn single(chunk: StreamChunk) -> AnswerStream {
        let (tx, rx) = mpsc::channel(1);
        let terminal = if chunk.error.is_some() { StreamState::Failed } else { StreamState::Completed };
        let (_, state) = watch::channel(terminal);
        // Capacity is one, so this cannot fail
        let _ = tx.try_send(chunk);
        AnswerStream { chunks: rx, state }
    }

    /// Start generating an answer on a background task
    pub fn stream_answer(&self, request: AnswerRequest) -> AnswerStream {
        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
        let (state_tx, state_rx) = watch::channel(StreamState::Idle);

        let generation = Generation {
            llm: Arc::clone(&self.llm),
            system_prompt: self.system_prompt.clone(),
            temperature: self.temperature,
            inactivity_timeout: self.inactivity_timeout,
            tx,
            state: state_tx,
        };
        tokio::spawn(generation.run(request));

        AnswerStream { chunks: rx, state: state_rx }
    }
}

/// State owned by one generator task
struct Generation {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    temperature: f32,
    inactivity_timeout: Duration,
    tx: mpsc::Sender<StreamChunk>,
    state: watch::Sender<StreamState>,
}

impl Generation {
    fn transition(&self, next: StreamState) {
        let previous = self.state.send_replace(next);
        tracing::debug!(from = previous.as_str(), to = next.as_str(), "Answer stream state");
        if next.is_terminal() {
            metrics::record_stream_outcome(next.as_str());
        }
    }

    /// End with an error chunk, or as cancelled if nobody is left to read it
    async fn fail(&self, state: StreamState, message: String, request: AnswerRequest) {
        tracing::warn!(state = state.as_str(), error = %message, "Answer stream ended early");
        let chunk = StreamChunk::failure(message, request.references, request.notice);
        if self.tx.send(chunk).await.is_err() {
            tracing::info!("Client disconnected before the failure could be reported");
            self.transition(StreamState::Cancelled);
            return;
        }
        self.transition(state);
    }

    async fn run(self, request: AnswerRequest) {
        let user_prompt = prompt::build_prompt(request.source, &request.question, &request.context);
        let chat = ChatRequest {
            model: request.model.clone(),
            messages: vec![ChatMessage::system(&self.system_prompt), ChatMessage::user(user_prompt)],
            temperature: self.temperature,
        };
        self.transition(StreamState::PromptBuilt);

        let mut upstream = match timeout(self.inactivity_timeout, self.llm.stream_chat(chat)).await {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(err)) => {
                return self.fail(StreamState::Failed, err.to_string(), request).await;
            }
            Err(_) => {
                let message = format!("model did not respond within {:?}", self.inactivity_timeout);
                return self.fail(StreamState::TimedOut, message, request).await;
            }
        };
        self.transition(StreamState::Streaming);

        let mut forwarded = 0usize;
        loop {
            let next = tokio::select! {
                _ = self.tx.closed() => None,
                next = timeout(self.inactivity_timeout, upstream.recv()) => Some(next),
            };
            let Some(next) = next else {
                tracing::info!(forwarded, "Client disconnected; stopping generation");
                drop(upstream);
                self.transition(StreamState::Cancelled);
                return;
            };

            match next {
                Err(_) => {
                    let message = format!("no output from model for {:?}", self.inactivity_timeout);
                    return self.fail(StreamState::TimedOut, message, request).await;
                }
                Ok(Some(Err(err))) => {
                    return self.fail(StreamState::Failed, err.to_string(), request).await;
                }
                Ok(Some(Ok(LlmDelta { content, done }))) => {
                    if !content.is_empty() {
                        if self.tx.send(StreamChunk::delta(content)).await.is_err() {
                            drop(upstream);
                            self.transition(StreamState::Cancelled);
                            return;
                        }
                        forwarded += 1;
                    }
                    if done {
                        break;
                    }
                }
                // Upstream closed without a done marker; treat as end of output
                Ok(None) => break,
            }
        }

        let finished = StreamChunk::finish(String::new(), request.references, request.notice);
        if self.tx.send(finished).await.is_err() {
            self.transition(StreamState::Cancelled);
            return;
        }
        tracing::info!(forwarded, "Answer stream completed");
        self.transition(StreamState::Completed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::ReferenceKind;
    use scoperag_common::llm::MockLlm;

    fn reference() -> Reference {
        Reference {
            title: "Quote".into(),
            date: "2024-03-01".into(),
            sender: Some("sales@example.com".into()),
            link: Some("outlook:1".into()),
            entry_id: Some("1".into()),
            display_url: None,
            path: None,
            kind: ReferenceKind::Mail,
        }
    }

    fn request() -> AnswerRequest {
        AnswerRequest {
            question: "What is the discount percentage?".into(),
            source: SourceType::Mail,
            context: "[Reference: email body]\nDiscount is 12%.".into(),
            references: vec![reference()],
            model: None,
            notice: None,
        }
    }

    fn streamer(llm: Arc<MockLlm>) -> AnswerStreamer {
        AnswerStreamer::new(llm, &LlmConfig::default())
    }

    async fn drain(mut stream: AnswerStream) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    async fn settle(mut state: watch::Receiver<StreamState>) -> StreamState {
        let _ = timeout(Duration::from_secs(2), state.wait_for(|s| s.is_terminal())).await;
        let settled = *state.borrow();
        settled
    }

    #[tokio::test]
    async fn test_completed_stream_ends_with_references() {
        let llm = Arc::new(MockLlm::new(["The discount ", "is 12%."]));
        let stream = streamer(llm.clone()).stream_answer(request());
        let state = stream.state_watcher();

        let chunks = drain(stream).await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], StreamChunk::delta("The discount "));
        assert_eq!(chunks[1], StreamChunk::delta("is 12%."));

        let last = chunks.last().unwrap();
        assert!(last.done);
        assert!(last.error.is_none());
        assert_eq!(last.references.as_ref().unwrap(), &vec![reference()]);
        assert_eq!(settle(state).await, StreamState::Completed);

        let sent = llm.last_request().unwrap();
        assert_eq!(sent.messages[0].role, "system");
        assert!(sent.messages[1].content.contains("Discount is 12%."));
        assert!(sent.model.is_none());
    }

    #[tokio::test]
    async fn test_model_override_is_forwarded() {
        let llm = Arc::new(MockLlm::new(["ok"]));
        let mut req = request();
        req.model = Some("llama3.1:8b".into());
        drain(streamer(llm.clone()).stream_answer(req)).await;
        assert_eq!(llm.last_request().unwrap().model.as_deref(), Some("llama3.1:8b"));
    }

    #[tokio::test]
    async fn test_mid_stream_failure_emits_error_chunk() {
        let llm = Arc::new(MockLlm::new(["a", "b", "c", "d"]).fail_after(2));
        let stream = streamer(llm).stream_answer(request());
        let state = stream.state_watcher();

        let chunks = drain(stream).await;
        assert_eq!(chunks.len(), 3);
        let last = chunks.last().unwrap();
        assert!(last.done);
        assert!(last.error.as_deref().unwrap().contains("mock failure"));
        assert_eq!(settle(state).await, StreamState::Failed);
    }

    #[tokio::test]
    async fn test_start_failure_emits_error_chunk() {
        let llm = Arc::new(MockLlm::new(["never"]).failing());
        let chunks = drain(streamer(llm).stream_answer(request())).await;
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].done);
        assert!(chunks[0].error.is_some());
    }

    #[tokio::test]
    async fn test_failure_after_disconnect_is_cancelled() {
        let llm = Arc::new(MockLlm::new(["never"]).failing());
        let stream = streamer(llm).stream_answer(request());
        let state = stream.state_watcher();

        // Receiver gone before the generator first runs
        drop(stream);
        assert_eq!(settle(state).await, StreamState::Cancelled);
    }

    #[tokio::test]
    async fn test_inactivity_timeout() {
        let llm = Arc::new(MockLlm::new(["first", "second"]).stall_after(1));
        let stream = streamer(llm)
            .with_inactivity_timeout(Duration::from_millis(50))
            .stream_answer(request());
        let state = stream.state_watcher();

        let chunks = drain(stream).await;
        assert_eq!(chunks[0], StreamChunk::delta("first"));
        let last = chunks.last().unwrap();
        assert!(last.done);
        assert!(last.error.is_some());
        assert_eq!(settle(state).await, StreamState::TimedOut);
    }

    #[tokio::test]
    async fn test_client_disconnect_stops_generation() {
        let deltas: Vec<String> = (0..100).map(|i| format!("token{} ", i)).collect();
        let llm = Arc::new(MockLlm::new(deltas).with_delay(Duration::from_millis(10)));
        let mut stream = streamer(llm.clone()).stream_answer(request());
        let state = stream.state_watcher();

        let first = stream.recv().await.unwrap();
        assert_eq!(first.content, "token0 ");
        drop(stream);

        assert_eq!(settle(state).await, StreamState::Cancelled);
        let after_cancel = llm.delivered();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // At most one send can complete between cancellation and the drop
        assert!(llm.delivered() <= after_cancel + 1);
        assert!(after_cancel < 10, "delivered {} of 100", after_cancel);
    }

    #[tokio::test]
    async fn test_canned_streams() {
        let chunks = drain(AnswerStreamer::canned("Hello! How can I help?", Vec::new(), None)).await;
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].done);
        assert_eq!(chunks[0].references.as_deref(), Some(&[][..]));

        let stream = AnswerStreamer::no_results(SourceType::Doc, NoResultReason::BelowThreshold, None);
        assert_eq!(stream.state(), StreamState::Completed);
        let chunks = drain(stream).await;
        assert!(chunks[0].content.starts_with("No related document"));
        assert!(chunks[0].error.is_none());

        let stream = AnswerStreamer::no_results(SourceType::Mail, NoResultReason::BackendUnavailable, None);
        assert_eq!(stream.state(), StreamState::Failed);
        let chunks = drain(stream).await;
        assert!(chunks[0].error.is_some());
        assert!(!chunks[0].content.is_empty());
    }
}
