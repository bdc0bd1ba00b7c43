/// Project type definitions
///
/// A project is one bot: it owns flows and may register a fallback flow that takes
/// over when one of its flows fails beyond recovery.

use serde::{Deserialize, Serialize};

/// Per-project engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Project identifier referenced by `FlowGraph::project_id`
    pub id: String,
    /// Flow promoted to handle unrecoverable errors in this project's flows
    pub fallback_flow_id: Option<String>,
}

impl Project {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), fallback_flow_id: None }
    }
}
