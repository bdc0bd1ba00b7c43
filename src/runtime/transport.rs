/// Outbound side of the chat transport
///
/// The engine hands `{chat_id, text, controls}` to a `Transport` and never speaks a
/// platform wire format itself.

use crate::error::HandlerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Inline button carrying a callback identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Button {
    pub text: String,
    pub callback_data: String,
}

/// Interactive controls attached to a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Controls {
    /// Rows of inline buttons
    Buttons { rows: Vec<Vec<Button>> },
    /// One-tap "share my phone number" keyboard
    RequestContact { label: String },
}

/// Send request handed to the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub chat_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controls: Option<Controls>,
}

impl OutboundMessage {
    pub fn text(chat_id: &str, text: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            text: text.into(),
            controls: None,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn send(&self, message: OutboundMessage) -> Result<(), HandlerError>;
}

/// POSTs every outbound message as JSON to a webhook
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, message: OutboundMessage) -> Result<(), HandlerError> {
        tracing::debug!("📤 Sending message to chat {} via {}", message.chat_id, self.url);
        let response = self
            .client
            .post(&self.url)
            .json(&message)
            .send()
            .await
            .map_err(HandlerError::from_http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HandlerError::from_status(
                status.as_u16(),
                format!("transport returned {}: {}", status, body),
            ));
        }
        Ok(())
    }
}

/// Logs outbound messages; used when no outbound endpoint is configured
#[derive(Debug, Default, Clone)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn send(&self, message: OutboundMessage) -> Result<(), HandlerError> {
        tracing::info!("💬 [chat {}] {}", message.chat_id, message.text);
        Ok(())
    }
}

/// Keeps every outbound message in memory
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|m| m.text).collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, message: OutboundMessage) -> Result<(), HandlerError> {
        self.sent
            .lock()
            .map_err(|_| HandlerError::Unclassified("memory transport lock poisoned".into()))?
            .push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_messages_serialize_with_tagged_controls() {
        let message = OutboundMessage {
            chat_id: "42".into(),
            text: "Share?".into(),
            controls: Some(Controls::RequestContact { label: "Share phone".into() }),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "chat_id": "42",
                "text": "Share?",
                "controls": {"type": "request_contact", "label": "Share phone"}
            })
        );
        assert_eq!(
            serde_json::to_value(OutboundMessage::text("1", "hi")).unwrap(),
            json!({"chat_id": "1", "text": "hi"})
        );
    }
}
