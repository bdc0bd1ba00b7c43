use super::{parse_buttons, send_text};
use crate::error::HandlerError;
use crate::runtime::executor::{NodeExecutionResult, NodeHandler, StepContext};
use async_trait::async_trait;
use serde_json::json;

/// Sends text with optional inline buttons, then follows the single outgoing edge
#[derive(Debug, Default)]
pub struct MessageHandler;

#[async_trait]
impl NodeHandler for MessageHandler {
    async fn execute(&self, step: &StepContext<'_>) -> Result<NodeExecutionResult, HandlerError> {
        let text = step
            .config_str("text")
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| HandlerError::config("message node requires non-empty 'text'"))?;

        let namespace = step.vars.namespace(step.context).await?;
        let controls = parse_buttons(&step.node.config, &namespace)?;
        let sent = send_text(step, &namespace, text, controls).await?;

        tracing::debug!("💬 Message node '{}' sent to chat {}", step.node.id, step.context.subject.chat_id);
        Ok(NodeExecutionResult::follow(step.node).with_output(json!({"text": sent})))
    }
}
