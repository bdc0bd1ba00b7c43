/// Chatflow: resumable chat-bot conversation flows
///
/// Flows are versioned graphs of trigger, message, condition, wait, action and end
/// nodes. Each subject's run is a persisted execution context that advances until it
/// waits for the user, and resumes when the matching event arrives.

// Core configuration and setup
pub mod config;

// Engine and handler error taxonomy
pub mod error;

// Database bootstrap and project settings
pub mod project;

// Flow definitions, validation, storage and registry
pub mod workflow;

// Execution engine: contexts, handlers, dispatcher, resume and recovery
pub mod runtime;

// HTTP API layer
pub mod api;

// Server setup and initialization
pub mod server;

pub use error::{EngineError, EngineResult, HandlerError};
pub use project::{Database, Project};
pub use runtime::{FlowService, InboundEvent, RunOutcome, Subject};
pub use server::start_server;
pub use workflow::{FlowGraph, Node, NodeType};
