use async_trait::async_trait;

use crate::errors::PilotResult;
use crate::llm::types::{ChatMessage, ModelReply, ToolDef};

/// Seam to the vision-capable reasoning model. Implementations are injected
/// through the engine constructor; tests swap in scripted fakes.
///
/// Call failures are not retried inside the agent loop — retry policy, if
/// any, belongs to the implementation.
#[async_trait]
pub trait ReasoningModel: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolDef],
    ) -> PilotResult<ModelReply>;
}
