/// Flow Management Layer
///
/// This module handles flow definitions, validation, persistence, and the registry.
/// It provides:
/// - Type definitions (FlowGraph, Node, NodeType, Connection)
/// - Validation and compilation into an executable lookup structure
/// - Versioned SQLite persistence with sqlx
/// - Lock-free hot-reload registry using ArcSwap

// Core flow type definitions
pub mod types;

// Structural validation and compilation
pub mod compiler;

// Versioned SQLite persistence layer for flow storage
pub mod storage;

// Hot-reload registry using ArcSwap for zero-downtime updates
pub mod registry;

// Re-export commonly used types
pub use compiler::{compile, validate, CompiledFlow, CompiledNode, CompiledTrigger, ValidationIssue, ValidationReport};
pub use registry::{FlowRegistry, PublishOutcome};
pub use storage::FlowStorage;
pub use types::{Connection, FlowGraph, Node, NodeType, TriggerKind, VariableScope};
