/// Core flow graph type definitions
///
/// Defines the structures for flows, nodes and connections. These are stored as JSON
/// and are read-only once a version has been saved; a running execution pins to
/// exactly one version.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Label of the edge a timed-out wait follows
pub const TIMEOUT_EDGE: &str = "timeout";

/// A complete, versioned chat automation graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowGraph {
    /// Unique flow identifier (e.g., "onboarding")
    pub id: String,
    /// Version assigned by storage on save; starts at 1
    #[serde(default)]
    pub version: i64,
    /// Human-readable flow name
    pub name: String,
    /// Owning project (bot); fallback flows are registered per project
    #[serde(default = "default_project")]
    pub project_id: String,
    pub nodes: Vec<Node>,
    pub connections: Vec<Connection>,
    /// Variables the flow expects, with optional initial values
    #[serde(default)]
    pub variables: Vec<VariableDeclaration>,
    #[serde(default)]
    pub settings: FlowSettings,
}

fn default_project() -> String {
    "default".to_string()
}

/// One typed, configured step in a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier within the flow (e.g., "n1", "ask-phone")
    pub id: String,
    /// Closed set of node categories; each maps to exactly one handler
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Type-specific configuration as flexible JSON
    #[serde(default)]
    pub config: Value,
}

/// Available node types
///
/// - Trigger: entry point matched against inbound events
///   Expected config: { "kind": "command", "command": "/start" }
/// - Message: send text with optional buttons
///   Expected config: { "text": "Hi {first_name}", "buttons": [[{"text": "Yes", "callback_data": "yes"}]] }
/// - Condition: branch on `true`/`false` edges
///   Expected config: { "variable": "age", "operator": "greater", "value": 18 } or { "expression": "age > 18" }
/// - Action: side effect (http_request, store_query, set_variable, get_variable, request_contact)
///   Expected config: { "action": "http_request", "url": "...", "result_variable": "resp" }
/// - WaitInput / WaitCallback / WaitContact: suspend until the subject answers
///   Expected config: { "prompt": "...", "variable": "answer", "timeout_secs": 600 }
/// - Delay: resume after a fixed time without blocking a worker
///   Expected config: { "seconds": 3600 }
/// - End: finish the flow
///   Expected config: { "success": true, "message": "Bye!" }
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Trigger,
    Message,
    Condition,
    Action,
    WaitInput,
    WaitCallback,
    WaitContact,
    Delay,
    End,
}

impl NodeType {
    pub const ALL: [NodeType; 9] = [
        NodeType::Trigger,
        NodeType::Message,
        NodeType::Condition,
        NodeType::Action,
        NodeType::WaitInput,
        NodeType::WaitCallback,
        NodeType::WaitContact,
        NodeType::Delay,
        NodeType::End,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Trigger => "trigger",
            NodeType::Message => "message",
            NodeType::Condition => "condition",
            NodeType::Action => "action",
            NodeType::WaitInput => "wait_input",
            NodeType::WaitCallback => "wait_callback",
            NodeType::WaitContact => "wait_contact",
            NodeType::Delay => "delay",
            NodeType::End => "end",
        }
    }
}

/// Directed edge between two nodes, optionally labeled
/// (`true`/`false`, a callback identifier, `timeout`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Declared flow variable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDeclaration {
    pub name: String,
    #[serde(default)]
    pub scope: VariableScope,
    #[serde(default)]
    pub initial: Option<Value>,
}

/// Lifetime class of a stored variable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableScope {
    /// Lives as long as one execution context
    #[default]
    Session,
    /// Keyed by subject, survives across contexts
    Persistent,
}

impl VariableScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariableScope::Session => "session",
            VariableScope::Persistent => "persistent",
        }
    }
}

/// Per-flow execution settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowSettings {
    /// Overrides the engine-wide step cap for this flow
    #[serde(default)]
    pub max_steps: Option<u32>,
    /// Default deadline for waits that set none
    #[serde(default)]
    pub wait_timeout_secs: Option<u64>,
}

/// Trigger kinds recognised on trigger nodes
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerKind {
    /// "/start", also matches "/start payload"
    Command(String),
    /// Exact text, case-insensitive
    Text(String),
    /// Regex over message text
    Pattern(String),
    /// Callback identifier of an inline button
    Callback(String),
    Contact,
    AnyMessage,
}

impl TriggerKind {
    /// Parse trigger config; `None` when the kind is missing or unknown
    pub fn from_config(config: &Value) -> Option<Self> {
        let kind = config.get("kind").and_then(|k| k.as_str())?;
        let field = |name: &str| config.get(name).and_then(|v| v.as_str()).map(str::to_string);
        match kind {
            "command" => field("command").map(TriggerKind::Command),
            "text" => field("text").map(TriggerKind::Text),
            "pattern" => field("pattern").map(TriggerKind::Pattern),
            "callback" => field("callback_data").map(TriggerKind::Callback),
            "contact" => Some(TriggerKind::Contact),
            "any_message" => Some(TriggerKind::AnyMessage),
            _ => None,
        }
    }
}
