/// Inbound events delivered by the chat transport
///
/// The transport layer has already decoded the platform wire format; the engine only
/// sees the subject identity and one of three payload kinds.

use crate::runtime::context::Subject;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Category of an inbound event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Callback,
    Contact,
}

/// Contact card shared by the subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub phone_number: String,
    /// Platform user id the contact belongs to, when the platform reports it
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

/// Event payload, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Message { text: String },
    Callback { data: String },
    Contact { contact: ContactInfo },
}

/// `{chat_id, user_id, kind, ...payload}` as delivered by the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub chat_id: String,
    pub user_id: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl InboundEvent {
    pub fn message(user_id: &str, chat_id: &str, text: &str) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            payload: EventPayload::Message { text: text.to_string() },
        }
    }

    pub fn callback(user_id: &str, chat_id: &str, data: &str) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            payload: EventPayload::Callback { data: data.to_string() },
        }
    }

    pub fn contact(user_id: &str, chat_id: &str, phone_number: &str) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            payload: EventPayload::Contact {
                contact: ContactInfo {
                    phone_number: phone_number.to_string(),
                    user_id: Some(user_id.to_string()),
                    first_name: None,
                    last_name: None,
                },
            },
        }
    }

    pub fn kind(&self) -> EventKind {
        match self.payload {
            EventPayload::Message { .. } => EventKind::Message,
            EventPayload::Callback { .. } => EventKind::Callback,
            EventPayload::Contact { .. } => EventKind::Contact,
        }
    }

    pub fn subject(&self) -> Subject {
        Subject {
            user_id: self.user_id.clone(),
            chat_id: self.chat_id.clone(),
        }
    }

    /// Value stored under the well-known input variable on start/resume
    pub fn payload_value(&self) -> Value {
        match &self.payload {
            EventPayload::Message { text } => Value::String(text.clone()),
            EventPayload::Callback { data } => Value::String(data.clone()),
            EventPayload::Contact { contact } => json!({
                "phone_number": contact.phone_number,
                "user_id": contact.user_id,
                "first_name": contact.first_name,
                "last_name": contact.last_name,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_json_decodes_into_events() {
        let event: InboundEvent = serde_json::from_value(json!({
            "chat_id": "42",
            "user_id": "7",
            "kind": "contact",
            "contact": {"phone_number": "+1 555 123 4567"}
        }))
        .unwrap();
        assert_eq!(event.kind(), EventKind::Contact);
        assert_eq!(event.payload_value()["phone_number"], "+1 555 123 4567");

        let event: InboundEvent =
            serde_json::from_value(json!({"chat_id": "42", "user_id": "7", "kind": "callback", "data": "yes"}))
                .unwrap();
        assert_eq!(event, InboundEvent::callback("7", "42", "yes"));
    }
}
