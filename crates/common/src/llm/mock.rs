//! Scripted chat client with delay, failure and stall injection

use super::{ChatRequest, LlmClient, LlmDelta};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Scripted LLM for tests
pub struct MockLlm {
    deltas: Vec<String>,
    delay: Option<Duration>,
    fail_to_start: bool,
    fail_after: Option<usize>,
    stall_after: Option<usize>,
    delivered: Arc<AtomicUsize>,
    last_request: Mutex<Option<ChatRequest>>,
}

impl MockLlm {
    pub fn new<S: Into<String>>(deltas: impl IntoIterator<Item = S>) -> Self {
        Self {
            deltas: deltas.into_iter().map(Into::into).collect(),
            delay: None,
            fail_to_start: false,
            fail_after: None,
            stall_after: None,
            delivered: Arc::new(AtomicUsize::new(0)),
            last_request: Mutex::new(None),
        }
    }

    /// Sleep before each delta
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Reject the request before any delta is produced
    pub fn failing(mut self) -> Self {
        self.fail_to_start = true;
        self
    }

    /// Emit an error after `n` deltas
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Go silent after `n` deltas without closing the stream
    pub fn stall_after(mut self, n: usize) -> Self {
        self.stall_after = Some(n);
        self
    }

    /// Deltas accepted by the consumer so far
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    /// The most recent request seen
    pub fn last_request(&self) -> Option<ChatRequest> {
        self.last_request
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn stream_chat(&self, request: ChatRequest) -> Result<mpsc::Receiver<Result<LlmDelta>>> {
        *self.last_request.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(request);

        if self.fail_to_start {
            return Err(AppError::LlmError {
                message: "mock model unavailable".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(1);
        let deltas = self.deltas.clone();
        let delay = self.delay;
        let fail_after = self.fail_after;
        let stall_after = self.stall_after;
        let delivered = Arc::clone(&self.delivered);

        tokio::spawn(async move {
            let total = deltas.len();
            for (i, content) in deltas.into_iter().enumerate() {
                if fail_after == Some(i) {
                    let _ = tx
                        .send(Err(AppError::LlmError { message: "mock failure".to_string() }))
                        .await;
                    return;
                }
                if stall_after == Some(i) {
                    tx.closed().await;
                    return;
                }
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let delta = LlmDelta { content, done: i + 1 == total };
                if tx.send(Ok(delta)).await.is_err() {
                    return;
                }
                delivered.fetch_add(1, Ordering::SeqCst);
            }
        });

        Ok(rx)
    }

    async fn health_check(&self) -> bool {
        !self.fail_to_start
    }

    fn name(&self) -> &str {
        "mock-llm"
    }
}
