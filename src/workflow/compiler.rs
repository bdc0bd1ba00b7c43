/// Flow validation and compilation
///
/// `validate` checks structural integrity and per-type required fields and never fails
/// on any input; it reports problems as data. `compile` turns a valid graph into a
/// node-id keyed lookup with outgoing edges grouped by label and records the entry
/// points reachable from triggers. Both are pure: no I/O, the source graph is untouched.

use crate::runtime::condition::Operator;
use crate::workflow::types::{Connection, FlowGraph, Node, NodeType, TriggerKind};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One problem found in a graph
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    fn graph(message: impl Into<String>) -> Self {
        Self { node_id: None, connection_id: None, message: message.into() }
    }

    fn node(node_id: &str, message: impl Into<String>) -> Self {
        Self { node_id: Some(node_id.to_string()), connection_id: None, message: message.into() }
    }

    fn connection(connection_id: &str, message: impl Into<String>) -> Self {
        Self { node_id: None, connection_id: Some(connection_id.to_string()), message: message.into() }
    }
}

/// Outcome of `validate`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

/// Edge leaving a compiled node
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingEdge {
    pub connection_id: String,
    pub label: Option<String>,
    pub target: String,
}

/// Executable form of one node
#[derive(Debug, Clone)]
pub struct CompiledNode {
    pub id: String,
    pub node_type: NodeType,
    pub config: Value,
    pub outgoing: Vec<OutgoingEdge>,
}

impl CompiledNode {
    /// Target of the edge carrying `label`
    pub fn target_for(&self, label: &str) -> Option<&str> {
        self.outgoing
            .iter()
            .find(|e| e.label.as_deref() == Some(label))
            .map(|e| e.target.as_str())
    }

    /// Target of the single unlabeled edge; a lone labeled edge also counts
    pub fn default_target(&self) -> Option<&str> {
        self.outgoing
            .iter()
            .find(|e| e.label.is_none())
            .or_else(|| match self.outgoing.as_slice() {
                [only] if only.label.as_deref() != Some(crate::workflow::types::TIMEOUT_EDGE) => Some(only),
                _ => None,
            })
            .map(|e| e.target.as_str())
    }

    /// Edge matching `label`, falling back to the default edge
    pub fn target_for_or_default(&self, label: &str) -> Option<&str> {
        self.target_for(label).or_else(|| self.default_target())
    }
}

/// Trigger node with its matcher prepared once at compile time
#[derive(Debug, Clone)]
pub struct CompiledTrigger {
    pub node_id: String,
    pub kind: TriggerKind,
    /// Compiled regex of a pattern trigger
    pub pattern: Option<Regex>,
}

impl CompiledTrigger {
    pub fn new(node_id: impl Into<String>, kind: TriggerKind) -> Result<Self, regex::Error> {
        let pattern = match &kind {
            TriggerKind::Pattern(source) => Some(Regex::new(source)?),
            _ => None,
        };
        Ok(Self { node_id: node_id.into(), kind, pattern })
    }
}

/// Execution-ready flow
#[derive(Debug, Clone)]
pub struct CompiledFlow {
    pub graph: Arc<FlowGraph>,
    nodes: HashMap<String, CompiledNode>,
    node_order: Vec<String>,
    /// Trigger nodes, in declaration order
    pub entry_points: Vec<String>,
    /// Nodes reachable from any trigger
    pub reachable: HashSet<String>,
    /// Parsed trigger of every entry point, in declaration order
    triggers: Vec<CompiledTrigger>,
    /// callback identifier -> callback trigger node
    callback_triggers: HashMap<String, String>,
    /// Non-fatal findings from validation
    pub warnings: Vec<ValidationIssue>,
}

impl CompiledFlow {
    pub fn id(&self) -> &str {
        &self.graph.id
    }

    pub fn version(&self) -> i64 {
        self.graph.version
    }

    pub fn node(&self, node_id: &str) -> Option<&CompiledNode> {
        self.nodes.get(node_id)
    }

    /// Trigger node whose configured callback identifier equals `data`
    pub fn callback_trigger(&self, data: &str) -> Option<&str> {
        self.callback_triggers.get(data).map(String::as_str)
    }

    pub fn triggers(&self) -> &[CompiledTrigger] {
        &self.triggers
    }

    /// Reconstruct the node/connection set this flow was compiled from
    pub fn export(&self) -> (Vec<Node>, Vec<Connection>) {
        let mut nodes = Vec::with_capacity(self.node_order.len());
        let mut connections = Vec::new();
        for id in &self.node_order {
            if let Some(compiled) = self.nodes.get(id) {
                nodes.push(Node {
                    id: compiled.id.clone(),
                    node_type: compiled.node_type,
                    config: compiled.config.clone(),
                });
                for edge in &compiled.outgoing {
                    connections.push(Connection {
                        id: edge.connection_id.clone(),
                        source: compiled.id.clone(),
                        target: edge.target.clone(),
                        label: edge.label.clone(),
                    });
                }
            }
        }
        (nodes, connections)
    }
}

/// Validate a node/connection set
pub fn validate(nodes: &[Node], connections: &[Connection]) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let mut seen = HashSet::new();
    for node in nodes {
        if node.id.trim().is_empty() {
            errors.push(ValidationIssue::graph("Node with empty id"));
        } else if !seen.insert(node.id.as_str()) {
            errors.push(ValidationIssue::node(&node.id, format!("Duplicate node id: {}", node.id)));
        }
    }

    if !nodes.iter().any(|n| n.node_type == NodeType::Trigger) {
        errors.push(ValidationIssue::graph("Flow must have at least one trigger node"));
    }
    if !nodes.iter().any(|n| n.node_type == NodeType::End) {
        warnings.push(ValidationIssue::graph("Flow has no end node"));
    }

    let mut seen_connections = HashSet::new();
    for connection in connections {
        if !seen_connections.insert(connection.id.as_str()) {
            errors.push(ValidationIssue::connection(
                &connection.id,
                format!("Duplicate connection id: {}", connection.id),
            ));
        }
        if !seen.contains(connection.source.as_str()) {
            errors.push(ValidationIssue::connection(
                &connection.id,
                format!("Connection {} references unknown source node: {}", connection.id, connection.source),
            ));
        }
        if !seen.contains(connection.target.as_str()) {
            errors.push(ValidationIssue::connection(
                &connection.id,
                format!("Connection {} references unknown target node: {}", connection.id, connection.target),
            ));
        }
    }

    for node in nodes {
        check_node_fields(node, &mut errors);
    }

    for node in nodes.iter().filter(|n| n.node_type == NodeType::Condition) {
        for branch in ["true", "false"] {
            let has_edge = connections
                .iter()
                .any(|c| c.source == node.id && c.label.as_deref() == Some(branch));
            if !has_edge {
                warnings.push(ValidationIssue::node(
                    &node.id,
                    format!("Condition node has no '{}' edge", branch),
                ));
            }
        }
    }

    if errors.is_empty() {
        let reachable = reachable_from_triggers(nodes, connections);
        for node in nodes {
            if !reachable.contains(node.id.as_str()) {
                warnings.push(ValidationIssue::node(&node.id, "Node is unreachable from any trigger"));
            }
        }
    }

    ValidationReport {
        is_valid: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Compile a flow into its executable lookup structure
pub fn compile(flow: &FlowGraph) -> Result<CompiledFlow, ValidationReport> {
    let report = validate(&flow.nodes, &flow.connections);
    if !report.is_valid {
        return Err(report);
    }

    let mut nodes: HashMap<String, CompiledNode> = flow
        .nodes
        .iter()
        .map(|n| {
            (
                n.id.clone(),
                CompiledNode {
                    id: n.id.clone(),
                    node_type: n.node_type,
                    config: n.config.clone(),
                    outgoing: Vec::new(),
                },
            )
        })
        .collect();

    for connection in &flow.connections {
        if let Some(source) = nodes.get_mut(&connection.source) {
            source.outgoing.push(OutgoingEdge {
                connection_id: connection.id.clone(),
                label: connection.label.clone(),
                target: connection.target.clone(),
            });
        }
    }

    let entry_points: Vec<String> = flow
        .nodes
        .iter()
        .filter(|n| n.node_type == NodeType::Trigger)
        .map(|n| n.id.clone())
        .collect();

    let mut triggers = Vec::with_capacity(entry_points.len());
    for id in &entry_points {
        let Some(kind) = nodes.get(id).and_then(|n| TriggerKind::from_config(&n.config)) else {
            continue;
        };
        match CompiledTrigger::new(id.as_str(), kind) {
            Ok(trigger) => triggers.push(trigger),
            Err(e) => {
                return Err(ValidationReport {
                    is_valid: false,
                    errors: vec![ValidationIssue::node(id, format!("Trigger pattern is not a valid regex: {}", e))],
                    warnings: report.warnings,
                });
            }
        }
    }

    let callback_triggers = triggers
        .iter()
        .filter_map(|trigger| match &trigger.kind {
            TriggerKind::Callback(data) => Some((data.clone(), trigger.node_id.clone())),
            _ => None,
        })
        .collect();

    let reachable = reachable_from_triggers(&flow.nodes, &flow.connections)
        .into_iter()
        .map(str::to_string)
        .collect();

    tracing::debug!(
        "🧩 Compiled flow '{}' v{}: {} nodes, {} entry points, {} warnings",
        flow.id,
        flow.version,
        nodes.len(),
        entry_points.len(),
        report.warnings.len()
    );

    Ok(CompiledFlow {
        graph: Arc::new(flow.clone()),
        nodes,
        node_order: flow.nodes.iter().map(|n| n.id.clone()).collect(),
        entry_points,
        reachable,
        triggers,
        callback_triggers,
        warnings: report.warnings,
    })
}

/// DFS over a petgraph view of the flow starting at every trigger
fn reachable_from_triggers<'a>(nodes: &'a [Node], connections: &[Connection]) -> HashSet<&'a str> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for node in nodes {
        index.entry(node.id.as_str()).or_insert_with(|| graph.add_node(node.id.as_str()));
    }
    for connection in connections {
        if let (Some(&from), Some(&to)) = (
            index.get(connection.source.as_str()),
            index.get(connection.target.as_str()),
        ) {
            graph.add_edge(from, to, ());
        }
    }

    let mut reachable = HashSet::new();
    for trigger in nodes.iter().filter(|n| n.node_type == NodeType::Trigger) {
        if let Some(&start) = index.get(trigger.id.as_str()) {
            let mut dfs = Dfs::new(&graph, start);
            while let Some(visited) = dfs.next(&graph) {
                reachable.insert(graph[visited]);
            }
        }
    }
    reachable
}

fn non_empty_str<'a>(config: &'a Value, field: &str) -> Option<&'a str> {
    config
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
}

fn check_node_fields(node: &Node, errors: &mut Vec<ValidationIssue>) {
    let config = &node.config;
    let mut missing = |message: String| errors.push(ValidationIssue::node(&node.id, message));

    match node.node_type {
        NodeType::Trigger => match TriggerKind::from_config(config) {
            None => missing("Trigger node needs a known 'kind' and its matching field".to_string()),
            Some(kind) => {
                if let Err(e) = CompiledTrigger::new(node.id.as_str(), kind) {
                    missing(format!("Trigger pattern is not a valid regex: {}", e));
                }
            }
        },
        NodeType::Message => {
            if non_empty_str(config, "text").is_none() {
                missing("Message node needs non-empty 'text'".to_string());
            }
        }
        NodeType::Condition => {
            if non_empty_str(config, "expression").is_some() {
                return;
            }
            let variable = non_empty_str(config, "variable");
            let operator = non_empty_str(config, "operator");
            match (variable, operator) {
                (Some(_), Some(op)) => match Operator::parse(op) {
                    None => missing(format!("Condition node has unknown operator '{}'", op)),
                    Some(op) if op.needs_value() && config.get("value").is_none() => {
                        missing(format!("Condition operator '{}' needs a 'value'", op.as_str()));
                    }
                    Some(_) => {}
                },
                _ => missing(
                    "Condition node needs a variable/operator/value triple or an 'expression'".to_string(),
                ),
            }
        }
        NodeType::Action => match non_empty_str(config, "action") {
            Some("http_request") => {
                if non_empty_str(config, "url").is_none() {
                    missing("http_request action needs 'url'".to_string());
                }
            }
            Some("store_query") => match non_empty_str(config, "query") {
                Some(q) if q.trim_start().to_ascii_lowercase().starts_with("select") => {}
                Some(_) => missing("store_query action only allows SELECT statements".to_string()),
                None => missing("store_query action needs 'query'".to_string()),
            },
            Some("set_variable") | Some("get_variable") => {
                if non_empty_str(config, "name").is_none() {
                    missing("Variable action needs 'name'".to_string());
                }
            }
            Some("request_contact") => {}
            Some(other) => missing(format!("Unknown action '{}'", other)),
            None => missing("Action node needs 'action'".to_string()),
        },
        NodeType::WaitInput | NodeType::WaitCallback | NodeType::WaitContact => {
            if let Some(timeout) = config.get("timeout_secs") {
                if !timeout.as_u64().is_some_and(|t| t > 0) {
                    missing("'timeout_secs' must be a positive integer".to_string());
                }
            }
        }
        NodeType::Delay => {
            if !config.get("seconds").and_then(|s| s.as_u64()).is_some_and(|s| s > 0) {
                missing("Delay node needs positive integer 'seconds'".to_string());
            }
        }
        NodeType::End => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, node_type: NodeType, config: Value) -> Node {
        Node { id: id.to_string(), node_type, config }
    }

    fn edge(id: &str, source: &str, target: &str, label: Option<&str>) -> Connection {
        Connection {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            label: label.map(str::to_string),
        }
    }

    fn start_flow() -> FlowGraph {
        FlowGraph {
            id: "greet".into(),
            version: 1,
            name: "Greeting".into(),
            project_id: "default".into(),
            nodes: vec![
                node("t", NodeType::Trigger, json!({"kind": "command", "command": "/start"})),
                node("m", NodeType::Message, json!({"text": "Hi"})),
                node("c", NodeType::Action, json!({"action": "request_contact"})),
                node("e", NodeType::End, json!({})),
            ],
            connections: vec![
                edge("c1", "t", "m", None),
                edge("c2", "m", "c", None),
                edge("c3", "c", "e", None),
            ],
            variables: vec![],
            settings: Default::default(),
        }
    }

    #[test]
    fn missing_trigger_is_an_error() {
        let report = validate(&[node("m", NodeType::Message, json!({"text": "Hi"}))], &[]);
        assert!(!report.is_valid);
        assert!(report.errors.iter().any(|e| e.message.contains("trigger")));
    }

    #[test]
    fn missing_end_is_only_a_warning() {
        let flow = FlowGraph {
            nodes: vec![
                node("t", NodeType::Trigger, json!({"kind": "command", "command": "/go"})),
                node("m", NodeType::Message, json!({"text": "Hi"})),
            ],
            connections: vec![edge("c1", "t", "m", None)],
            ..start_flow()
        };
        let compiled = compile(&flow).expect("flow without end still compiles");
        assert!(compiled.warnings.iter().any(|w| w.message.contains("no end node")));
    }

    #[test]
    fn dangling_connection_is_reported() {
        let mut flow = start_flow();
        flow.connections.push(edge("c9", "m", "ghost", None));
        let report = validate(&flow.nodes, &flow.connections);
        assert!(!report.is_valid);
        assert_eq!(report.errors[0].connection_id.as_deref(), Some("c9"));
    }

    #[test]
    fn required_fields_are_checked_per_type() {
        let report = validate(
            &[
                node("t", NodeType::Trigger, json!({"kind": "command", "command": "/go"})),
                node("m", NodeType::Message, json!({"text": "  "})),
                node("c", NodeType::Condition, json!({"variable": "x"})),
                node("d", NodeType::Delay, json!({"seconds": 0})),
            ],
            &[],
        );
        let flagged: Vec<_> = report.errors.iter().filter_map(|e| e.node_id.as_deref()).collect();
        assert_eq!(flagged, vec!["m", "c", "d"]);
    }

    #[test]
    fn pattern_triggers_are_compiled_once_or_rejected() {
        let mut flow = start_flow();
        flow.nodes.push(node("p", NodeType::Trigger, json!({"kind": "pattern", "pattern": r"^order #\d+$"})));
        flow.connections.push(edge("c4", "p", "e", None));
        let compiled = compile(&flow).expect("valid");
        let pattern = compiled.triggers().iter().find(|t| t.node_id == "p").and_then(|t| t.pattern.as_ref());
        assert!(pattern.is_some_and(|re| re.is_match("order #12")));
        assert!(compiled.triggers().iter().filter(|t| t.node_id != "p").all(|t| t.pattern.is_none()));

        flow.nodes.last_mut().unwrap().config = json!({"kind": "pattern", "pattern": "("});
        let report = compile(&flow).unwrap_err();
        assert_eq!(report.errors[0].node_id.as_deref(), Some("p"));
        assert!(report.errors[0].message.contains("regex"));
    }

    #[test]
    fn validate_survives_garbage_config() {
        let report = validate(
            &[
                node("", NodeType::Trigger, Value::Null),
                node("x", NodeType::Condition, json!([1, 2, 3])),
                node("x", NodeType::Action, json!("nope")),
            ],
            &[edge("e", "nowhere", "x", Some("true"))],
        );
        assert!(!report.is_valid);
    }

    #[test]
    fn compile_groups_edges_by_label_and_finds_entry_points() {
        let mut flow = start_flow();
        flow.nodes.push(node(
            "cb",
            NodeType::Trigger,
            json!({"kind": "callback", "callback_data": "menu:help"}),
        ));
        flow.connections.push(edge("c4", "cb", "e", None));
        let compiled = compile(&flow).expect("valid");
        assert_eq!(compiled.entry_points, vec!["t".to_string(), "cb".to_string()]);
        assert_eq!(compiled.callback_trigger("menu:help"), Some("cb"));
        let kinds: Vec<_> = compiled.triggers().iter().map(|t| (t.node_id.as_str(), &t.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("t", &TriggerKind::Command("/start".into())),
                ("cb", &TriggerKind::Callback("menu:help".into())),
            ]
        );
        assert_eq!(compiled.node("m").and_then(|n| n.default_target()), Some("c"));
        assert!(compiled.reachable.contains("e"));
    }

    #[test]
    fn re_validating_an_export_gives_the_same_report() {
        let flow = start_flow();
        let original = validate(&flow.nodes, &flow.connections);
        let compiled = compile(&flow).expect("valid");
        let (nodes, connections) = compiled.export();
        assert_eq!(validate(&nodes, &connections), original);
    }
}
