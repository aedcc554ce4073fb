//! Placeholder provider for running the server without credentials.
//!
//! Echoes the last user turn back as a single streamed reply. Real
//! deployments register a provider-backed [`LlmClient`] instead.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};

use hive_core::conversation::TurnRole;
use hive_core::llm::{LlmChunk, LlmClient, LlmError, LlmRequest, LlmStream};

#[derive(Default)]
pub struct EchoProvider;

#[async_trait]
impl LlmClient for EchoProvider {
    async fn complete_stream(&self, request: LlmRequest) -> Result<LlmStream, LlmError> {
        let last_user = request
            .turns
            .iter()
            .rev()
            .find(|turn| turn.role == TurnRole::User)
            .map(|turn| turn.content.clone())
            .unwrap_or_default();
        let reply = format!("(no model configured) you said: {last_user}");
        let chunks: Vec<Result<LlmChunk, LlmError>> =
            vec![Ok(LlmChunk::TextDelta(reply)), Ok(LlmChunk::Done)];
        Ok(stream::iter(chunks).boxed())
    }
}
