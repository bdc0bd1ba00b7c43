/// Node handler implementations, one per node type

mod action;
mod condition;
mod end;
mod message;
mod trigger;
mod wait;

pub use action::ActionHandler;
pub use condition::ConditionHandler;
pub use end::EndHandler;
pub use message::MessageHandler;
pub use trigger::{matches_event, TriggerHandler};
pub use wait::{DelayHandler, WaitHandler};

use crate::error::HandlerError;
use crate::runtime::executor::StepContext;
use crate::runtime::template::Namespace;
use crate::runtime::transport::{Button, Controls, OutboundMessage};
use crate::workflow::types::VariableScope;
use serde_json::Value;

/// `scope` field of a config object, session when absent
pub(crate) fn scope_field(config: &Value, key: &str) -> Result<VariableScope, HandlerError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(VariableScope::Session),
        Some(raw) => serde_json::from_value(raw.clone())
            .map_err(|_| HandlerError::config(format!("unknown variable scope {}", raw))),
    }
}

/// Inline buttons from `buttons`: either rows of buttons or one flat row
pub(crate) fn parse_buttons(config: &Value, namespace: &Namespace) -> Result<Option<Controls>, HandlerError> {
    let Some(raw) = config.get("buttons") else {
        return Ok(None);
    };
    let rows: Vec<Vec<Button>> = match raw {
        Value::Array(items) if items.iter().all(Value::is_array) => {
            serde_json::from_value(raw.clone()).map_err(|e| HandlerError::config(format!("invalid buttons: {}", e)))?
        }
        Value::Array(_) => vec![serde_json::from_value(raw.clone())
            .map_err(|e| HandlerError::config(format!("invalid buttons: {}", e)))?],
        _ => return Err(HandlerError::config("buttons must be an array")),
    };
    if rows.iter().all(Vec::is_empty) {
        return Ok(None);
    }

    let rows = rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|b| Button {
                    text: namespace.render_text(&b.text),
                    callback_data: b.callback_data,
                })
                .collect()
        })
        .collect();
    Ok(Some(Controls::Buttons { rows }))
}

/// Render and send `text` to the context's chat
pub(crate) async fn send_text(
    step: &StepContext<'_>,
    namespace: &Namespace,
    text: &str,
    controls: Option<Controls>,
) -> Result<String, HandlerError> {
    let rendered = namespace.render_text(text);
    step.services
        .transport
        .send(OutboundMessage {
            chat_id: step.context.subject.chat_id.clone(),
            text: rendered.clone(),
            controls,
        })
        .await?;
    Ok(rendered)
}
