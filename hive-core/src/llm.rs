//! Streaming-completion boundary.
//!
//! The engine never talks to a concrete provider; it sees [`LlmClient`],
//! a trait producing a stream of [`LlmChunk`]s. [`GatedClient`] adds the
//! shared-resource policy (bounded concurrency with FIFO queueing, and a
//! per-turn request timeout), and [`ScriptedClient`] is the deterministic
//! test double used throughout the test suite.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use miette::Diagnostic;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::conversation::Turn;
use crate::tools::ToolDescriptor;

/// Default per-streaming-turn timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error, Diagnostic)]
pub enum LlmError {
    /// Retried by the node loop with exponential backoff.
    #[error("transient provider error: {message}")]
    #[diagnostic(code(hive::llm::transient))]
    Transient { message: String },

    #[error("provider request timed out after {0:?}")]
    #[diagnostic(code(hive::llm::timeout))]
    Timeout(Duration),

    /// Not worth retrying (bad credentials, malformed request).
    #[error("provider error: {message}")]
    #[diagnostic(code(hive::llm::fatal))]
    Fatal { message: String },
}

impl LlmError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout(_))
    }
}

/// A tool invocation requested by the model.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub input: Value,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// One element of a streaming completion.
#[derive(Clone, Debug, PartialEq)]
pub enum LlmChunk {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCall(ToolCallRequest),
    Done,
}

/// Everything a provider needs for one streaming turn.
#[derive(Clone, Debug, Default)]
pub struct LlmRequest {
    pub system: String,
    pub turns: Vec<Turn>,
    pub tools: Vec<ToolDescriptor>,
    pub node_id: Option<String>,
}

pub type LlmStream = BoxStream<'static, Result<LlmChunk, LlmError>>;

/// Abstract streaming-completion provider.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete_stream(&self, request: LlmRequest) -> Result<LlmStream, LlmError>;
}

/// Wraps a provider with the engine's shared-resource policy: at most
/// `max_concurrent` in-flight completions (excess callers queue in FIFO
/// order on a fair semaphore) and a per-turn timeout on opening the
/// stream. The permit is held until the stream is dropped.
pub struct GatedClient {
    inner: Arc<dyn LlmClient>,
    permits: Arc<Semaphore>,
    request_timeout: Duration,
}

impl GatedClient {
    pub fn new(inner: Arc<dyn LlmClient>, max_concurrent: usize) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

#[async_trait]
impl LlmClient for GatedClient {
    async fn complete_stream(&self, request: LlmRequest) -> Result<LlmStream, LlmError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| LlmError::fatal("llm gate closed"))?;
        let opened = tokio::time::timeout(self.request_timeout, self.inner.complete_stream(request))
            .await
            .map_err(|_| LlmError::Timeout(self.request_timeout))??;
        // Keep the permit alive for the lifetime of the stream.
        Ok(opened
            .map(move |chunk| {
                let _held = &permit;
                chunk
            })
            .boxed())
    }
}

/// One scripted model turn for [`ScriptedClient`].
#[derive(Clone, Debug, Default)]
pub struct ScriptedTurn {
    pub text_deltas: Vec<String>,
    pub reasoning_deltas: Vec<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    /// When set, the turn fails with this error instead of streaming.
    pub error: Option<String>,
    pub error_is_transient: bool,
}

impl ScriptedTurn {
    /// A plain text reply, split into short deltas so tests exercise
    /// accumulation.
    pub fn text(content: &str) -> Self {
        let mut deltas = Vec::new();
        let mut rest = content;
        while !rest.is_empty() {
            let split = rest
                .char_indices()
                .nth(8)
                .map(|(i, _)| i)
                .unwrap_or(rest.len());
            deltas.push(rest[..split].to_string());
            rest = &rest[split..];
        }
        Self {
            text_deltas: deltas,
            ..Self::default()
        }
    }

    pub fn tool_call(name: &str, input: Value) -> Self {
        Self {
            tool_calls: vec![ToolCallRequest::new(
                format!("call-{name}"),
                name,
                input,
            )],
            ..Self::default()
        }
    }

    #[must_use]
    pub fn and_tool_call(mut self, name: &str, input: Value) -> Self {
        self.tool_calls
            .push(ToolCallRequest::new(format!("call-{name}"), name, input));
        self
    }

    pub fn transient_error(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            error_is_transient: true,
            ..Self::default()
        }
    }

    pub fn fatal_error(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            error_is_transient: false,
            ..Self::default()
        }
    }
}

/// Deterministic provider: pops one scripted turn per completion call.
///
/// When the script runs dry it replies with a fixed fallback turn, which
/// keeps judge-driven loops from hanging a test.
pub struct ScriptedClient {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    fallback: String,
    calls: Mutex<Vec<LlmRequest>>,
}

impl ScriptedClient {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            fallback: "done".to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }

    /// Requests observed so far, for asserting on prompt assembly.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.calls.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.turns.lock().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn complete_stream(&self, request: LlmRequest) -> Result<LlmStream, LlmError> {
        self.calls.lock().push(request);
        let turn = self
            .turns
            .lock()
            .pop_front()
            .unwrap_or_else(|| ScriptedTurn::text(&self.fallback));

        if let Some(message) = turn.error {
            return if turn.error_is_transient {
                Err(LlmError::transient(message))
            } else {
                Err(LlmError::fatal(message))
            };
        }

        let mut chunks: Vec<Result<LlmChunk, LlmError>> = Vec::new();
        for delta in turn.reasoning_deltas {
            chunks.push(Ok(LlmChunk::ReasoningDelta(delta)));
        }
        for delta in turn.text_deltas {
            chunks.push(Ok(LlmChunk::TextDelta(delta)));
        }
        for call in turn.tool_calls {
            chunks.push(Ok(LlmChunk::ToolCall(call)));
        }
        chunks.push(Ok(LlmChunk::Done));
        Ok(stream::iter(chunks).boxed())
    }
}
