use anyhow::Result;
use deskwork_core::{ChatMessage, ToolCall, ToolDefinition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

mod openai;

pub use openai::{OPENAI_CHAT_ENDPOINT, OpenAiClient, OpenAiConfig};

const DEFAULT_MAX_RETRIES: u8 = 2;
const DEFAULT_RETRY_BASE_MS: u64 = 300;

/// Full transcript plus tool schema for one model round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
}

/// Either final text or a batch of tool calls (possibly with preamble text).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelReply {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl ModelReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            text: None,
            tool_calls,
        }
    }

    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// Incremental text, delivered in order.
    Token(String),
    Done,
}

pub type StreamCallback = Arc<dyn Fn(StreamChunk) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model unavailable: {0}")]
    Unavailable(String),
    #[error("model rejected the request: {0}")]
    Rejected(String),
}

impl ModelError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub trait LlmClient: Send + Sync {
    fn send(&self, req: &ChatRequest) -> Result<ModelReply>;

    /// Streaming variant that invokes `cb` for each text token as it arrives,
    /// followed by [`StreamChunk::Done`]. Returns the assembled reply.
    fn send_streaming(&self, req: &ChatRequest, cb: StreamCallback) -> Result<ModelReply> {
        let reply = self.send(req)?;
        if let Some(text) = reply.text.as_deref().filter(|t| !t.is_empty()) {
            cb(StreamChunk::Token(text.to_string()));
        }
        cb(StreamChunk::Done);
        Ok(reply)
    }
}

impl<T: LlmClient + ?Sized> LlmClient for Arc<T> {
    fn send(&self, req: &ChatRequest) -> Result<ModelReply> {
        (**self).send(req)
    }

    fn send_streaming(&self, req: &ChatRequest, cb: StreamCallback) -> Result<ModelReply> {
        (**self).send_streaming(req, cb)
    }
}

/// Retries transient [`ModelError::Unavailable`] failures with exponential backoff.
///
/// A streaming call is only retried while no token has reached the callback.
pub struct RetryingClient<C> {
    inner: C,
    max_retries: u8,
    retry_base_ms: u64,
}

impl<C: LlmClient> RetryingClient<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
        }
    }

    pub fn with_retries(mut self, max_retries: u8, retry_base_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_base_ms = retry_base_ms;
        self
    }

    fn run<F>(&self, mut call: F) -> Result<ModelReply>
    where
        F: FnMut() -> (Result<ModelReply>, bool),
    {
        let mut attempt: u8 = 0;
        loop {
            let (result, retry_allowed) = call();
            match result {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    let retryable = err
                        .downcast_ref::<ModelError>()
                        .is_some_and(ModelError::is_retryable);
                    if !(retryable && retry_allowed && attempt < self.max_retries) {
                        return Err(err);
                    }
                    thread::sleep(retry_delay_ms(self.retry_base_ms, attempt));
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}

impl<C: LlmClient> LlmClient for RetryingClient<C> {
    fn send(&self, req: &ChatRequest) -> Result<ModelReply> {
        self.run(|| (self.inner.send(req), true))
    }

    fn send_streaming(&self, req: &ChatRequest, cb: StreamCallback) -> Result<ModelReply> {
        self.run(|| {
            let emitted = Arc::new(AtomicBool::new(false));
            let seen = emitted.clone();
            let downstream = cb.clone();
            let tracking: StreamCallback = Arc::new(move |chunk| {
                if matches!(chunk, StreamChunk::Token(_)) {
                    seen.store(true, Ordering::SeqCst);
                }
                downstream(chunk);
            });
            let result = self.inner.send_streaming(req, tracking);
            (result, !emitted.load(Ordering::SeqCst))
        })
    }
}

fn retry_delay_ms(base_ms: u64, attempt: u8) -> Duration {
    let exponent = u32::from(attempt);
    Duration::from_millis(base_ms.saturating_mul(2_u64.saturating_pow(exponent)))
}
