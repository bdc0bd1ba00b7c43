/// Public engine facade
///
/// `FlowService` wires the dispatcher, the resume coordinator and the recovery
/// policy over one database pool and exposes the operations the transport, the
/// HTTP surface and inspection tooling call: start, resume, status, restart,
/// cancel, trace and the expired-wait sweep.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::project::{Database, ProjectStore};
use crate::runtime::contacts::SubjectDirectory;
use crate::runtime::context::{ContextManager, ExecutionStatus, Subject, WaitType};
use crate::runtime::coordinator::{ResumeCoordinator, ResumeOutcome};
use crate::runtime::engine::{Dispatcher, RunOutcome};
use crate::runtime::events::InboundEvent;
use crate::runtime::executor::HandlerServices;
use crate::runtime::nodes::matches_event;
use crate::runtime::recovery::RecoveryPolicy;
use crate::runtime::store::ContextStore;
use crate::runtime::telemetry::{FlowStats, StepTrace, Telemetry};
use crate::runtime::transport::Transport;
use crate::workflow::compiler::CompiledFlow;
use crate::workflow::registry::FlowRegistry;
use crate::workflow::types::{TriggerKind, VariableScope};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// `getExecutionStatus` view of a context
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionStatusView {
    pub context_id: String,
    pub flow_id: String,
    pub flow_version: i64,
    pub status: ExecutionStatus,
    pub current_node_id: Option<String>,
    pub wait_type: WaitType,
    pub wait_deadline: Option<DateTime<Utc>>,
    pub step_count: u32,
    pub error: Option<String>,
}

/// A context created by a start or restart, with where its first run left it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartedRun {
    pub context_id: String,
    pub flow_id: String,
    pub outcome: RunOutcome,
}

/// What `handle_inbound` did with an event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum InboundOutcome {
    Resumed { context_id: String, outcome: RunOutcome },
    Started { runs: Vec<StartedRun> },
    /// Neither waiting context nor trigger wanted the event
    Ignored,
}

#[derive(Debug)]
pub struct FlowService {
    registry: Arc<FlowRegistry>,
    projects: ProjectStore,
    directory: SubjectDirectory,
    dispatcher: Arc<Dispatcher>,
    coordinator: ResumeCoordinator,
    telemetry: Arc<Telemetry>,
}

impl FlowService {
    pub fn new(
        database: &Database,
        registry: Arc<FlowRegistry>,
        transport: Arc<dyn Transport>,
        config: &EngineConfig,
    ) -> Self {
        let pool = database.pool().clone();
        let store = ContextStore::new(pool.clone());
        let projects = ProjectStore::new(pool.clone());
        let directory = SubjectDirectory::new(pool);
        let telemetry = Arc::new(Telemetry::new(store.clone()));

        let services = HandlerServices {
            transport,
            store: store.clone(),
            http: reqwest::Client::new(),
        };
        let recovery = RecoveryPolicy::new(store.clone(), projects.clone(), Arc::clone(&registry), config.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            ContextManager::new(store),
            services,
            recovery,
            Arc::clone(&telemetry),
            config,
        ));
        let coordinator = ResumeCoordinator::new(Arc::clone(&registry), Arc::clone(&dispatcher), directory.clone());

        Self { registry, projects, directory, dispatcher, coordinator, telemetry }
    }

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    pub fn projects(&self) -> &ProjectStore {
        &self.projects
    }

    /// Subject records used for contact matching
    pub fn subjects(&self) -> &SubjectDirectory {
        &self.directory
    }

    fn contexts(&self) -> &ContextManager {
        self.dispatcher.contexts()
    }

    fn store(&self) -> &ContextStore {
        self.contexts().store()
    }

    /// Start `flow_id` for `subject` and run it until it first waits, ends or fails
    ///
    /// With a trigger event, execution enters at the first trigger the event matches;
    /// otherwise at the first trigger node. `AlreadyRunning` when the subject already
    /// has an active context in this flow.
    pub async fn start_flow(
        &self,
        flow_id: &str,
        subject: &Subject,
        trigger_event: Option<&InboundEvent>,
    ) -> EngineResult<StartedRun> {
        let flow = self
            .registry
            .get_active(flow_id)
            .ok_or_else(|| EngineError::FlowNotFound(flow_id.to_string()))?;

        let entry = match trigger_event {
            Some(event) => flow
                .triggers()
                .iter()
                .find(|trigger| matches_event(trigger, event))
                .map(|trigger| trigger.node_id.clone())
                .or_else(|| flow.entry_points.first().cloned()),
            None => flow.entry_points.first().cloned(),
        }
        .ok_or_else(|| EngineError::graph(flow_id, None, "flow has no trigger node"))?;

        self.start_at(&flow, subject, trigger_event, &entry).await
    }

    async fn start_at(
        &self,
        flow: &CompiledFlow,
        subject: &Subject,
        trigger_event: Option<&InboundEvent>,
        entry: &str,
    ) -> EngineResult<StartedRun> {
        let context = self.contexts().create_context(flow, subject, trigger_event).await?;
        let context_id = context.id.clone();
        let outcome = self.dispatcher.run(context, entry).await?;
        Ok(StartedRun { context_id, flow_id: flow.id().to_string(), outcome })
    }

    /// Offer `event` to the subject's waiting context; false when none accepted it
    pub async fn resume_on_event(&self, event: &InboundEvent) -> EngineResult<bool> {
        Ok(matches!(self.coordinator.on_inbound_event(event).await?, ResumeOutcome::Resumed { .. }))
    }

    /// Route one transport event: resume a waiting context, else fire matching triggers
    ///
    /// A command (`/start`) is never consumed as wait input; it restarts every flow whose
    /// command trigger it matches, cancelling a stale active context first. Other
    /// triggers skip flows that are already active for the subject.
    pub async fn handle_inbound(&self, event: &InboundEvent) -> EngineResult<InboundOutcome> {
        let subject = event.subject();
        let mut flows = self.registry.active_flows();
        flows.sort_by(|a, b| a.id().cmp(b.id()));

        let matched: Vec<(Arc<CompiledFlow>, String, bool)> = flows
            .into_iter()
            .filter_map(|flow| {
                let (entry, is_command) = flow
                    .triggers()
                    .iter()
                    .find(|trigger| matches_event(trigger, event))
                    .map(|trigger| (trigger.node_id.clone(), matches!(trigger.kind, TriggerKind::Command(_))))?;
                Some((flow, entry, is_command))
            })
            .collect();
        let is_command = matched.iter().any(|(_, _, command)| *command);

        if !is_command {
            if let ResumeOutcome::Resumed { context_id, outcome } = self.coordinator.on_inbound_event(event).await? {
                return Ok(InboundOutcome::Resumed { context_id, outcome });
            }
        }

        let mut runs = Vec::new();
        for (flow, entry, command) in matched {
            if command {
                if let Some(stale) = self.store().find_active(flow.id(), &subject).await? {
                    tracing::info!("🔄 Command restarts flow '{}'; cancelling context {}", flow.id(), stale.id);
                    self.store().cancel(&stale.id).await?;
                }
            }
            match self.start_at(&flow, &subject, Some(event), &entry).await {
                Ok(run) => runs.push(run),
                Err(e) if e.is_conflict() => {
                    tracing::debug!("🤝 Flow '{}' already active for chat {}: {}", flow.id(), subject.chat_id, e);
                }
                Err(e) => return Err(e),
            }
        }

        if runs.is_empty() {
            tracing::debug!("💤 No waiting context or trigger for {:?} event in chat {}", event.kind(), subject.chat_id);
            return Ok(InboundOutcome::Ignored);
        }
        Ok(InboundOutcome::Started { runs })
    }

    pub async fn get_execution_status(&self, context_id: &str) -> EngineResult<ExecutionStatusView> {
        let context = self.contexts().load(context_id).await?;
        Ok(ExecutionStatusView {
            context_id: context.id,
            flow_id: context.flow_id,
            flow_version: context.flow_version,
            status: context.status,
            current_node_id: context.current_node_id,
            wait_type: context.wait_type,
            wait_deadline: context.wait_deadline,
            step_count: context.step_count,
            error: context.error,
        })
    }

    /// Start a new context of the same flow version at `node_id`
    ///
    /// A source that is still active is cancelled first. Session variables are copied
    /// over unless `reset_variables`; persistent ones are shared by the subject anyway.
    pub async fn restart_from_node(
        &self,
        context_id: &str,
        node_id: &str,
        reset_variables: bool,
    ) -> EngineResult<StartedRun> {
        let source = self.contexts().load(context_id).await?;
        let flow = self.registry.get_version(&source.flow_id, source.flow_version).await?;
        if flow.node(node_id).is_none() {
            return Err(EngineError::graph(flow.id(), Some(node_id), "restart target does not exist"));
        }

        if !source.status.is_terminal() {
            self.store().cancel(&source.id).await?;
        }
        let carried = if reset_variables {
            serde_json::Map::new()
        } else {
            self.store().session_snapshot(&source.id).await?
        };

        let context = self.contexts().create_context(&flow, &source.subject, None).await?;
        let vars = self.contexts().variables(&context);
        for (name, value) in carried {
            if let Err(e) = vars.set(&name, value, VariableScope::Session).await {
                self.dispatcher.abandon(&context.id, &context.subject.chat_id, &e).await;
                return Err(e);
            }
        }

        tracing::info!("🔁 Restarting context {} as {} from node '{}'", source.id, context.id, node_id);
        let new_id = context.id.clone();
        let outcome = self.dispatcher.run(context, node_id).await?;
        Ok(StartedRun { context_id: new_id, flow_id: flow.id().to_string(), outcome })
    }

    /// Flip a running or waiting context to cancelled; false when it already ended
    pub async fn cancel_execution(&self, context_id: &str) -> EngineResult<bool> {
        self.contexts().load(context_id).await?;
        let cancelled = self.store().cancel(context_id).await?;
        if cancelled {
            tracing::info!("🛑 Cancelled context {}", context_id);
        }
        Ok(cancelled)
    }

    /// Ordered step trace of a context
    pub async fn trace(&self, context_id: &str) -> EngineResult<Vec<StepTrace>> {
        self.contexts().load(context_id).await?;
        self.store().list_traces(context_id).await
    }

    /// Session variables of a context; archived values once it has finished
    pub async fn session_variables(&self, context_id: &str) -> EngineResult<serde_json::Map<String, serde_json::Value>> {
        self.contexts().load(context_id).await?;
        self.store().session_snapshot(context_id).await
    }

    /// Live feed of every step the engine records
    pub fn subscribe_trace(&self) -> broadcast::Receiver<StepTrace> {
        self.telemetry.feed.subscribe()
    }

    pub fn performance(&self) -> HashMap<String, FlowStats> {
        self.telemetry.performance.snapshot()
    }

    /// Resume or fail every wait whose deadline has passed
    pub async fn sweep_expired_waits(&self) -> EngineResult<usize> {
        Ok(self.sweep_at(Utc::now()).await?.len())
    }

    /// Sweep as of `now`: reap contexts stuck in `running`, then handle expired waits
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> EngineResult<Vec<(String, RunOutcome)>> {
        let reaped = self.dispatcher.reap_stale(now).await?;
        if !reaped.is_empty() {
            tracing::warn!("🧹 Sweep failed {} contexts left running", reaped.len());
        }
        self.coordinator.sweep_expired(now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::transport::MemoryTransport;
    use crate::workflow::registry::PublishOutcome;
    use crate::workflow::storage::FlowStorage;
    use crate::workflow::types::FlowGraph;
    use serde_json::json;

    async fn service(config: EngineConfig) -> (FlowService, Database, Arc<MemoryTransport>) {
        let db = Database::in_memory().await.unwrap();
        let registry = Arc::new(FlowRegistry::new(FlowStorage::new(db.pool().clone())));
        let transport = Arc::new(MemoryTransport::new());
        let service = FlowService::new(&db, registry, transport.clone(), &config);
        (service, db, transport)
    }

    async fn publish(service: &FlowService, flow: serde_json::Value) {
        let flow: FlowGraph = serde_json::from_value(flow).unwrap();
        assert!(matches!(service.registry().publish(&flow).await.unwrap(), PublishOutcome::Published { .. }));
    }

    fn flow(id: &str, middle: serde_json::Value) -> serde_json::Value {
        json!({
            "id": id,
            "name": id,
            "nodes": [
                {"id": "start", "type": "trigger", "config": {"kind": "command", "command": format!("/{}", id)}},
                {"id": "step", "type": middle["type"], "config": middle["config"]},
                {"id": "done", "type": "end", "config": {}}
            ],
            "connections": [
                {"id": "c0", "source": "start", "target": "step"},
                {"id": "c1", "source": "step", "target": "done"}
            ]
        })
    }

    #[tokio::test]
    async fn engine_error_mid_run_fails_the_context_and_frees_the_subject() {
        let config = EngineConfig { retry_base_delay_ms: 1, ..EngineConfig::default() };
        let (service, db, transport) = service(config.clone()).await;
        publish(
            &service,
            flow("orders", json!({"type": "action", "config": {"action": "http_request", "url": "http://127.0.0.1:9/"}})),
        )
        .await;
        // Recovery bookkeeping becomes unavailable, so the run itself errors
        sqlx::query("DROP TABLE recovery_attempts").execute(db.pool()).await.unwrap();
        let subject = Subject::new("u1", "c1");

        let err = service.start_flow("orders", &subject, None).await.unwrap_err();
        assert!(!err.is_conflict());
        assert!(service.store().find_active("orders", &subject).await.unwrap().is_none());
        assert_eq!(transport.texts().last(), Some(&config.failure_message));

        // The next attempt is not locked out by the first
        let again = service.start_flow("orders", &subject, None).await.unwrap_err();
        assert!(!again.is_conflict(), "subject still locked: {}", again);
    }

    #[tokio::test]
    async fn sweep_reaps_contexts_left_running() {
        let config = EngineConfig::default();
        let (service, _db, transport) = service(config.clone()).await;
        publish(&service, flow("survey", json!({"type": "wait_input", "config": {"variable": "answer"}}))).await;
        let subject = Subject::new("u1", "c1");

        // Created but never driven, as if the process died mid-run
        let compiled = service.registry().get_active("survey").unwrap();
        let orphan = service.contexts().create_context(&compiled, &subject, None).await.unwrap();
        assert!(service.start_flow("survey", &subject, None).await.unwrap_err().is_conflict());

        service.sweep_at(Utc::now()).await.unwrap();
        let status = service.get_execution_status(&orphan.id).await.unwrap();
        assert_eq!(status.status, ExecutionStatus::Running);

        let later = Utc::now() + chrono::Duration::seconds(config.stale_running_secs + 1);
        service.sweep_at(later).await.unwrap();
        let status = service.get_execution_status(&orphan.id).await.unwrap();
        assert_eq!(status.status, ExecutionStatus::Failed);
        assert!(status.error.is_some());
        assert_eq!(transport.texts().last(), Some(&config.failure_message));

        let restarted = service.start_flow("survey", &subject, None).await.unwrap();
        assert!(matches!(restarted.outcome, RunOutcome::Waiting { .. }));
    }
}
