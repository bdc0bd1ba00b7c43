/// Node handler contract and the handler registry
///
/// Every node type maps to exactly one handler. The registry is closed over
/// `NodeType`, so adding a node type without a handler fails to compile.
///
/// - Trigger: entry point, follows its outgoing edge
/// - Message: renders placeholders and sends through the transport
/// - Condition: structured comparison or Lua expression, `true`/`false` edge
/// - Action: http_request, store_query, set_variable, get_variable, request_contact
/// - WaitInput / WaitCallback / WaitContact: suspend until the subject answers
/// - Delay: suspend until a deadline the sweep picks up
/// - End: finish the flow

use crate::error::HandlerError;
use crate::runtime::context::{ExecutionContext, Variables, WaitType};
use crate::runtime::nodes::{
    ActionHandler, ConditionHandler, DelayHandler, EndHandler, MessageHandler, TriggerHandler, WaitHandler,
};
use crate::runtime::store::ContextStore;
use crate::runtime::transport::Transport;
use crate::workflow::compiler::{CompiledFlow, CompiledNode};
use crate::workflow::types::NodeType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

/// Where execution goes after a node
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Continue at this node
    Next(String),
    /// Finish the flow; `success` only feeds telemetry
    EndFlow { success: bool },
    /// Suspend until an event of `wait_type` arrives (or the deadline passes).
    /// `node_id` is recorded so the coordinator can derive the outgoing edge on resume.
    Wait {
        wait_type: WaitType,
        node_id: String,
        deadline: Option<DateTime<Utc>>,
    },
}

impl Transition {
    pub fn describe(&self) -> Value {
        match self {
            Transition::Next(target) => json!({"next": target}),
            Transition::EndFlow { success } => json!({"end": true, "success": success}),
            Transition::Wait { wait_type, deadline, .. } => {
                json!({"wait": wait_type.as_str(), "deadline": deadline.map(|d| d.to_rfc3339())})
            }
        }
    }
}

/// Successful handler result; failures are the `Err` side of the handler call
#[derive(Debug, Clone, PartialEq)]
pub struct NodeExecutionResult {
    pub transition: Transition,
    /// Snapshot for the trace feed
    pub output: Value,
}

impl NodeExecutionResult {
    pub fn next(target: impl Into<String>) -> Self {
        Self { transition: Transition::Next(target.into()), output: Value::Null }
    }

    pub fn end(success: bool) -> Self {
        Self { transition: Transition::EndFlow { success }, output: Value::Null }
    }

    pub fn wait(wait_type: WaitType, node_id: &str, deadline: Option<DateTime<Utc>>) -> Self {
        Self {
            transition: Transition::Wait { wait_type, node_id: node_id.to_string(), deadline },
            output: Value::Null,
        }
    }

    /// Follow the default edge; a node without one ends the flow
    pub fn follow(node: &CompiledNode) -> Self {
        match node.default_target() {
            Some(target) => Self::next(target),
            None => Self::end(true),
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }
}

/// Shared collaborators handlers may use
#[derive(Debug, Clone)]
pub struct HandlerServices {
    pub transport: Arc<dyn Transport>,
    pub store: ContextStore,
    pub http: reqwest::Client,
}

/// Everything one handler invocation sees
pub struct StepContext<'a> {
    pub context: &'a ExecutionContext,
    pub flow: &'a CompiledFlow,
    pub node: &'a CompiledNode,
    pub vars: &'a Variables,
    /// Cumulative step number of this invocation
    pub step: u32,
    pub services: &'a HandlerServices,
}

impl StepContext<'_> {
    /// String field of the node config
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.node.config.get(key).and_then(Value::as_str)
    }

    /// Dedupe key for a non-idempotent effect of this step
    pub fn effect_key(&self) -> String {
        format!("{}:{}:{}", self.context.id, self.node.id, self.step)
    }

    /// Wait deadline from `timeout_secs`, else the flow default
    pub fn wait_deadline(&self) -> Option<DateTime<Utc>> {
        wait_deadline(&self.node.config, self.flow)
    }
}

/// Deadline of a wait node suspending now
pub(crate) fn wait_deadline(config: &Value, flow: &CompiledFlow) -> Option<DateTime<Utc>> {
    let secs = config
        .get("timeout_secs")
        .and_then(Value::as_u64)
        .or(flow.graph.settings.wait_timeout_secs)?;
    let secs = i64::try_from(secs).ok()?;
    Some(Utc::now() + chrono::Duration::seconds(secs))
}

#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(&self, step: &StepContext<'_>) -> Result<NodeExecutionResult, HandlerError>;
}

/// One handler per node type
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    trigger: TriggerHandler,
    message: MessageHandler,
    condition: ConditionHandler,
    action: ActionHandler,
    wait_input: WaitHandler,
    wait_callback: WaitHandler,
    wait_contact: WaitHandler,
    delay: DelayHandler,
    end: EndHandler,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            wait_input: WaitHandler::new(WaitType::Input),
            wait_callback: WaitHandler::new(WaitType::Callback),
            wait_contact: WaitHandler::new(WaitType::Contact),
            ..Self::default()
        }
    }

    pub fn resolve(&self, node_type: NodeType) -> &dyn NodeHandler {
        match node_type {
            NodeType::Trigger => &self.trigger,
            NodeType::Message => &self.message,
            NodeType::Condition => &self.condition,
            NodeType::Action => &self.action,
            NodeType::WaitInput => &self.wait_input,
            NodeType::WaitCallback => &self.wait_callback,
            NodeType::WaitContact => &self.wait_contact,
            NodeType::Delay => &self.delay,
            NodeType::End => &self.end,
        }
    }
}
