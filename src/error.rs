/// Error taxonomy for the execution engine
///
/// `EngineError` is what the public engine surface returns. `HandlerError` is what a
/// node handler returns; it never escapes the dispatch loop directly but is routed
/// through the recovery subsystem first.

use thiserror::Error;

/// Engine-level failures
#[derive(Debug, Error)]
pub enum EngineError {
    /// Broken graph: missing node, missing branch edge, unknown handler. Never retried.
    #[error("graph configuration error in flow '{flow_id}'{}: {message}", node_suffix(.node_id))]
    GraphConfiguration {
        flow_id: String,
        node_id: Option<String>,
        message: String,
    },

    /// Handler failure that survived recovery
    #[error("handler failed at node '{node_id}': {source}")]
    HandlerRuntime {
        node_id: String,
        #[source]
        source: HandlerError,
    },

    /// Step cap exceeded within one dispatcher invocation
    #[error("loop detected: step cap of {0} exceeded")]
    LoopDetected(u32),

    /// A running/waiting context already exists for (flow, subject)
    #[error("flow '{flow_id}' is already active for chat {chat_id}")]
    AlreadyRunning { flow_id: String, chat_id: String },

    /// Lost a claim race (duplicate resume, concurrent status change)
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Store or transport unavailable
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error("execution context not found: {0}")]
    ContextNotFound(String),

    /// Operation not permitted for the context's current status
    #[error("invalid state: {0}")]
    InvalidState(String),
}

fn node_suffix(node_id: &Option<String>) -> String {
    match node_id {
        Some(id) => format!(" at node '{}'", id),
        None => String::new(),
    }
}

impl EngineError {
    /// Duplicate start/resume. Silently rejected, never shown to the subject.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            EngineError::AlreadyRunning { .. } | EngineError::ConcurrencyConflict(_)
        )
    }

    pub fn graph(flow_id: &str, node_id: Option<&str>, message: impl Into<String>) -> Self {
        EngineError::GraphConfiguration {
            flow_id: flow_id.to_string(),
            node_id: node_id.map(str::to_string),
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::ResourceUnavailable(format!("store: {}", e))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::ResourceUnavailable(format!("corrupt stored document: {}", e))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Failure reported by a node handler, already classified by kind
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// Network hiccup or timeout; retried with backoff
    #[error("transient failure: {0}")]
    Transient(String),

    /// Bad user input; the subject is re-prompted
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        reprompt: Option<String>,
    },

    /// Credentials rejected; aborted without retry
    #[error("not authorized: {0}")]
    Authorization(String),

    /// The node itself is misconfigured
    #[error("node misconfigured: {0}")]
    Configuration(String),

    #[error("{0}")]
    Unclassified(String),
}

impl HandlerError {
    pub fn config(message: impl Into<String>) -> Self {
        HandlerError::Configuration(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        HandlerError::Validation {
            message: message.into(),
            reprompt: None,
        }
    }

    /// Classify an HTTP client failure
    pub fn from_http(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            return HandlerError::Transient(e.to_string());
        }
        match e.status() {
            Some(status) => Self::from_status(status.as_u16(), e.to_string()),
            None if e.is_request() => HandlerError::Transient(e.to_string()),
            None => HandlerError::Unclassified(e.to_string()),
        }
    }

    /// Classify a non-success HTTP status code
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => HandlerError::Authorization(message),
            408 | 429 => HandlerError::Transient(message),
            400..=499 => HandlerError::Validation {
                message,
                reprompt: None,
            },
            500..=599 => HandlerError::Transient(message),
            _ => HandlerError::Unclassified(message),
        }
    }
}

impl From<EngineError> for HandlerError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::ResourceUnavailable(msg) => HandlerError::Transient(msg),
            EngineError::GraphConfiguration { message, .. } => HandlerError::Configuration(message),
            other => HandlerError::Unclassified(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_handler_error_kinds() {
        assert!(matches!(HandlerError::from_status(401, "x".into()), HandlerError::Authorization(_)));
        assert!(matches!(HandlerError::from_status(403, "x".into()), HandlerError::Authorization(_)));
        assert!(matches!(HandlerError::from_status(429, "x".into()), HandlerError::Transient(_)));
        assert!(matches!(HandlerError::from_status(422, "x".into()), HandlerError::Validation { .. }));
        assert!(matches!(HandlerError::from_status(503, "x".into()), HandlerError::Transient(_)));
    }

    #[test]
    fn conflicts_are_recognised() {
        let dup = EngineError::AlreadyRunning {
            flow_id: "f".into(),
            chat_id: "c".into(),
        };
        assert!(dup.is_conflict());
        assert!(EngineError::ConcurrencyConflict("claimed".into()).is_conflict());
        assert!(!EngineError::LoopDetected(500).is_conflict());
    }

    #[test]
    fn graph_error_message_names_the_node() {
        let err = EngineError::graph("wf", Some("n3"), "no 'false' edge");
        assert_eq!(
            err.to_string(),
            "graph configuration error in flow 'wf' at node 'n3': no 'false' edge"
        );
    }
}
