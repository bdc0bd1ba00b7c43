/// Execution Context Manager
///
/// Creates and loads per-subject execution state and mediates the two variable
/// scopes. Session variables are keyed by context id and vanish when the context
/// ends; persistent variables are keyed by the subject's user id and outlive
/// contexts. Every variable read goes to the store, so a write is visible to the
/// very next read.

use crate::error::{EngineError, EngineResult};
use crate::runtime::events::{EventKind, InboundEvent};
use crate::runtime::store::ContextStore;
use crate::runtime::template::Namespace;
use crate::workflow::compiler::CompiledFlow;
use crate::workflow::types::VariableScope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Inbound payload of the latest start/resume event
pub const INPUT_VARIABLE: &str = "last_input";
/// Callback identifier of the latest button tap
pub const CALLBACK_VARIABLE: &str = "callback_data";
/// Contact card of the latest contact share
pub const CONTACT_VARIABLE: &str = "contact";
/// Normalized phone of the latest contact share
pub const PHONE_VARIABLE: &str = "contact_phone";
/// Outcome of matching a shared contact against the subject directory
pub const CONTACT_MATCH_VARIABLE: &str = "contact_match";
/// Subject record a shared contact was matched to
pub const LINKED_SUBJECT_VARIABLE: &str = "linked_subject_id";
/// Error that sent execution to a fallback flow
pub const ERROR_VARIABLE: &str = "last_error";

/// Lifecycle status of an execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Waiting => "waiting",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "running" => ExecutionStatus::Running,
            "waiting" => ExecutionStatus::Waiting,
            "completed" => ExecutionStatus::Completed,
            "failed" => ExecutionStatus::Failed,
            "cancelled" => ExecutionStatus::Cancelled,
            _ => return None,
        })
    }

    /// Terminal statuses are sinks: nothing executes after them
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// Category of external event a paused context awaits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitType {
    None,
    Input,
    Callback,
    Contact,
    /// Timer set by a delay node; only the sweep resumes it
    Delay,
}

impl WaitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitType::None => "none",
            WaitType::Input => "input",
            WaitType::Callback => "callback",
            WaitType::Contact => "contact",
            WaitType::Delay => "delay",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "none" => WaitType::None,
            "input" => WaitType::Input,
            "callback" => WaitType::Callback,
            "contact" => WaitType::Contact,
            "delay" => WaitType::Delay,
            _ => return None,
        })
    }

    /// Wait types an event of `kind` may resume. An input wait also takes a
    /// contact share.
    pub fn compatible_with(kind: EventKind) -> &'static [WaitType] {
        match kind {
            EventKind::Message => &[WaitType::Input],
            EventKind::Callback => &[WaitType::Callback],
            EventKind::Contact => &[WaitType::Contact, WaitType::Input],
        }
    }
}

/// End-user plus originating chat a context is bound to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub user_id: String,
    pub chat_id: String,
}

impl Subject {
    pub fn new(user_id: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), chat_id: chat_id.into() }
    }
}

/// Live or paused execution state of one flow run for one subject
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionContext {
    pub id: String,
    pub flow_id: String,
    pub flow_version: i64,
    pub project_id: String,
    pub subject: Subject,
    pub status: ExecutionStatus,
    pub current_node_id: Option<String>,
    pub wait_type: WaitType,
    pub wait_deadline: Option<DateTime<Utc>>,
    /// Most recent wait node, used to re-prompt after a validation failure
    pub last_wait_node_id: Option<String>,
    pub last_wait_type: Option<WaitType>,
    /// Cumulative node steps across all resumes
    pub step_count: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionContext {
    fn new(flow: &CompiledFlow, subject: &Subject) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            flow_id: flow.id().to_string(),
            flow_version: flow.version(),
            project_id: flow.graph.project_id.clone(),
            subject: subject.clone(),
            status: ExecutionStatus::Running,
            current_node_id: None,
            wait_type: WaitType::None,
            wait_deadline: None,
            last_wait_node_id: None,
            last_wait_type: None,
            step_count: 0,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Owner key of this context's session scope
    pub fn session_key(&self) -> String {
        session_key(&self.id)
    }

    /// Well-known fields visible to placeholders after both variable scopes
    pub fn well_known_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("context_id".into(), json!(self.id));
        fields.insert("flow_id".into(), json!(self.flow_id));
        fields.insert("flow_version".into(), json!(self.flow_version));
        fields.insert("user_id".into(), json!(self.subject.user_id));
        fields.insert("chat_id".into(), json!(self.subject.chat_id));
        fields.insert("step".into(), json!(self.step_count));
        fields
    }
}

pub(crate) fn session_key(context_id: &str) -> String {
    format!("ctx:{}", context_id)
}

pub(crate) fn subject_key(user_id: &str) -> String {
    format!("subject:{}", user_id)
}

/// Scoped variable accessor bound to one context
#[derive(Debug, Clone)]
pub struct Variables {
    store: ContextStore,
    session_key: String,
    subject_key: String,
}

impl Variables {
    fn owner(&self, scope: VariableScope) -> &str {
        match scope {
            VariableScope::Session => &self.session_key,
            VariableScope::Persistent => &self.subject_key,
        }
    }

    pub async fn get(&self, name: &str, scope: VariableScope) -> EngineResult<Option<Value>> {
        self.store.get_variable(self.owner(scope), scope, name).await
    }

    pub async fn set(&self, name: &str, value: Value, scope: VariableScope) -> EngineResult<()> {
        self.store.set_variable(self.owner(scope), scope, name, &value).await
    }

    pub async fn remove(&self, name: &str, scope: VariableScope) -> EngineResult<()> {
        self.store.delete_variable(self.owner(scope), scope, name).await
    }

    /// Session first, then persistent
    pub async fn lookup(&self, name: &str) -> EngineResult<Option<Value>> {
        match self.get(name, VariableScope::Session).await? {
            Some(v) => Ok(Some(v)),
            None => self.get(name, VariableScope::Persistent).await,
        }
    }

    /// Fresh layered view for placeholder rendering and expressions
    pub async fn namespace(&self, context: &ExecutionContext) -> EngineResult<Namespace> {
        Ok(Namespace {
            session: self.store.load_scope(&self.session_key, VariableScope::Session).await?,
            persistent: self.store.load_scope(&self.subject_key, VariableScope::Persistent).await?,
            context: context.well_known_fields(),
        })
    }
}

/// Creates, loads and resumes execution contexts
#[derive(Debug, Clone)]
pub struct ContextManager {
    store: ContextStore,
}

impl ContextManager {
    pub fn new(store: ContextStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ContextStore {
        &self.store
    }

    /// Create a running context for (flow, subject)
    ///
    /// Fails with `AlreadyRunning` when a running/waiting context already exists for
    /// the pair. Declared variables get their initial values; persistent ones only
    /// when the subject has no value yet.
    pub async fn create_context(
        &self,
        flow: &CompiledFlow,
        subject: &Subject,
        event: Option<&InboundEvent>,
    ) -> EngineResult<ExecutionContext> {
        let context = ExecutionContext::new(flow, subject);
        self.store.insert_context(&context).await?;

        if let Err(e) = self.seed_variables(flow, &context, event).await {
            self.store.finish(&context.id, ExecutionStatus::Failed, Some(&e.to_string())).await?;
            return Err(e);
        }

        tracing::info!(
            "🆕 Created context {} for flow '{}' v{} (chat {})",
            context.id,
            context.flow_id,
            context.flow_version,
            subject.chat_id
        );
        Ok(context)
    }

    /// Declared initial values, then the trigger payload
    async fn seed_variables(
        &self,
        flow: &CompiledFlow,
        context: &ExecutionContext,
        event: Option<&InboundEvent>,
    ) -> EngineResult<()> {
        let vars = self.variables(context);
        for declaration in &flow.graph.variables {
            let Some(initial) = &declaration.initial else { continue };
            if declaration.scope == VariableScope::Persistent
                && vars.get(&declaration.name, VariableScope::Persistent).await?.is_some()
            {
                continue;
            }
            vars.set(&declaration.name, initial.clone(), declaration.scope).await?;
        }
        if let Some(event) = event {
            vars.set(INPUT_VARIABLE, event.payload_value(), VariableScope::Session).await?;
        }
        Ok(())
    }

    /// Load a claimed context and expose the inbound payload to the next node
    ///
    /// The context must already be `running`: the coordinator claims it before
    /// calling this, so a context that is still `waiting` here was never claimed.
    pub async fn resume_context(
        &self,
        context_id: &str,
        event: Option<&InboundEvent>,
    ) -> EngineResult<(ExecutionContext, Variables)> {
        let context = self.load(context_id).await?;
        if context.status != ExecutionStatus::Running {
            return Err(EngineError::InvalidState(format!(
                "context {} is {} and was not claimed for resume",
                context_id,
                context.status.as_str()
            )));
        }

        let vars = self.variables(&context);
        if let Some(event) = event {
            vars.set(INPUT_VARIABLE, event.payload_value(), VariableScope::Session).await?;
        }
        Ok((context, vars))
    }

    pub async fn load(&self, context_id: &str) -> EngineResult<ExecutionContext> {
        self.store
            .get_context(context_id)
            .await?
            .ok_or_else(|| EngineError::ContextNotFound(context_id.to_string()))
    }

    /// Bind a variable accessor to a context
    pub fn variables(&self, context: &ExecutionContext) -> Variables {
        Variables {
            store: self.store.clone(),
            session_key: context.session_key(),
            subject_key: subject_key(&context.subject.user_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Database;
    use crate::workflow::compile;
    use crate::workflow::types::{FlowGraph, Node, NodeType, VariableDeclaration};

    async fn manager() -> ContextManager {
        let db = Database::in_memory().await.unwrap();
        ContextManager::new(ContextStore::new(db.pool().clone()))
    }

    fn flow() -> CompiledFlow {
        compile(&FlowGraph {
            id: "f".into(),
            version: 1,
            name: "F".into(),
            project_id: "default".into(),
            nodes: vec![Node {
                id: "t".into(),
                node_type: NodeType::Trigger,
                config: json!({"kind": "command", "command": "/f"}),
            }],
            connections: vec![],
            variables: vec![
                VariableDeclaration { name: "count".into(), scope: VariableScope::Session, initial: Some(json!(0)) },
                VariableDeclaration { name: "tier".into(), scope: VariableScope::Persistent, initial: Some(json!("free")) },
            ],
            settings: Default::default(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn second_active_context_for_same_subject_is_rejected() {
        let manager = manager().await;
        let subject = Subject::new("u1", "c1");
        manager.create_context(&flow(), &subject, None).await.unwrap();

        let err = manager.create_context(&flow(), &subject, None).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning { .. }));

        manager
            .create_context(&flow(), &Subject::new("u2", "c2"), None)
            .await
            .expect("other subjects are independent");
    }

    #[tokio::test]
    async fn scopes_are_separate_and_reads_see_latest_write() {
        let manager = manager().await;
        let subject = Subject::new("u1", "c1");
        let ctx = manager.create_context(&flow(), &subject, None).await.unwrap();
        let vars = manager.variables(&ctx);

        assert_eq!(vars.get("count", VariableScope::Session).await.unwrap(), Some(json!(0)));
        vars.set("count", json!(1), VariableScope::Session).await.unwrap();
        assert_eq!(vars.get("count", VariableScope::Session).await.unwrap(), Some(json!(1)));
        assert_eq!(vars.get("count", VariableScope::Persistent).await.unwrap(), None);

        vars.set("tier", json!("pro"), VariableScope::Persistent).await.unwrap();
        manager.store().finish(&ctx.id, ExecutionStatus::Completed, None).await.unwrap();

        // A later context for the same subject keeps persistent values only
        let next = manager.create_context(&flow(), &subject, None).await.unwrap();
        let vars = manager.variables(&next);
        assert_eq!(vars.lookup("tier").await.unwrap(), Some(json!("pro")));
        assert_eq!(vars.get("count", VariableScope::Session).await.unwrap(), Some(json!(0)));
    }

    #[tokio::test]
    async fn resume_requires_a_claimed_context() {
        let manager = manager().await;
        let ctx = manager.create_context(&flow(), &Subject::new("u", "c"), None).await.unwrap();
        manager
            .store()
            .suspend(&ctx.id, "t", WaitType::Input, None, 0)
            .await
            .unwrap();

        let event = InboundEvent::message("u", "c", "hello");
        assert!(matches!(
            manager.resume_context(&ctx.id, Some(&event)).await,
            Err(EngineError::InvalidState(_))
        ));
    }
}
