use crate::error::HandlerError;
use crate::runtime::events::{EventPayload, InboundEvent};
use crate::runtime::executor::{NodeExecutionResult, NodeHandler, StepContext};
use crate::workflow::compiler::CompiledTrigger;
use crate::workflow::types::TriggerKind;
use async_trait::async_trait;
use serde_json::json;

/// Entry point; execution starts here and follows the outgoing edge
#[derive(Debug, Default)]
pub struct TriggerHandler;

#[async_trait]
impl NodeHandler for TriggerHandler {
    async fn execute(&self, step: &StepContext<'_>) -> Result<NodeExecutionResult, HandlerError> {
        let kind = step.config_str("kind").unwrap_or("unknown");
        tracing::debug!("🎯 Trigger '{}' ({}) entered", step.node.id, kind);
        Ok(NodeExecutionResult::follow(step.node).with_output(json!({"trigger": kind})))
    }
}

/// Whether an inbound event fires `trigger`
pub fn matches_event(trigger: &CompiledTrigger, event: &InboundEvent) -> bool {
    match (&trigger.kind, &event.payload) {
        (TriggerKind::Command(command), EventPayload::Message { text }) => {
            let text = text.trim();
            text == command
                || text
                    .strip_prefix(command.as_str())
                    .is_some_and(|rest| rest.starts_with(char::is_whitespace))
        }
        (TriggerKind::Text(expected), EventPayload::Message { text }) => {
            text.trim().to_lowercase() == expected.trim().to_lowercase()
        }
        (TriggerKind::Pattern(_), EventPayload::Message { text }) => {
            trigger.pattern.as_ref().is_some_and(|re| re.is_match(text))
        }
        (TriggerKind::Callback(expected), EventPayload::Callback { data }) => data == expected,
        (TriggerKind::Contact, EventPayload::Contact { .. }) => true,
        (TriggerKind::AnyMessage, EventPayload::Message { .. }) => true,
        _ => false,
    }
}
