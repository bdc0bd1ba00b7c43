use super::send_text;
use crate::error::HandlerError;
use crate::runtime::executor::{NodeExecutionResult, NodeHandler, StepContext};
use async_trait::async_trait;
use serde_json::{json, Value};

/// Finishes the flow, optionally with a closing message
#[derive(Debug, Default)]
pub struct EndHandler;

#[async_trait]
impl NodeHandler for EndHandler {
    async fn execute(&self, step: &StepContext<'_>) -> Result<NodeExecutionResult, HandlerError> {
        let success = step.node.config.get("success").and_then(Value::as_bool).unwrap_or(true);

        let mut sent = None;
        if let Some(text) = step.config_str("message").filter(|t| !t.trim().is_empty()) {
            let namespace = step.vars.namespace(step.context).await?;
            sent = Some(send_text(step, &namespace, text, None).await?);
        }

        tracing::debug!("🏁 End node '{}' reached (success: {})", step.node.id, success);
        Ok(NodeExecutionResult::end(success).with_output(json!({"success": success, "message": sent})))
    }
}
