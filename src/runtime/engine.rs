/// Node dispatcher: the re-entrant control loop of one execution context
///
/// `run` resolves node -> handler -> transition until the context waits, ends or fails.
/// It is entered fresh on start and again on every resume; no call stack survives a
/// suspension, only the persisted context row.
///
/// Before each node the persisted status is re-checked, so a cancellation lands before
/// the next node executes. Steps are capped per invocation; a runaway cycle becomes
/// `LoopDetected` instead of spinning forever.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, HandlerError};
use crate::runtime::context::{
    ContextManager, ExecutionContext, ExecutionStatus, WaitType, ERROR_VARIABLE,
};
use crate::runtime::executor::{
    wait_deadline, HandlerRegistry, HandlerServices, NodeExecutionResult, StepContext, Transition,
};
use crate::runtime::recovery::{ErrorClass, RecoveryPolicy, Resolution};
use crate::runtime::store::ContextStore;
use crate::runtime::telemetry::{StepTrace, Telemetry};
use crate::runtime::transport::OutboundMessage;
use crate::workflow::compiler::{CompiledFlow, CompiledNode};
use crate::workflow::registry::FlowRegistry;
use crate::workflow::types::VariableScope;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

/// Where one dispatcher invocation left the context
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Waiting { node_id: String, wait_type: WaitType },
    Completed,
    Failed { error: String },
    Cancelled,
    /// Failed here and continued in the project's fallback flow
    Escalated { fallback_context_id: String },
}

type BoxedRun<'a> = Pin<Box<dyn Future<Output = EngineResult<RunOutcome>> + Send + 'a>>;

/// Flow executor shared by every invocation; holds no per-context state
#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<FlowRegistry>,
    contexts: ContextManager,
    handlers: HandlerRegistry,
    services: HandlerServices,
    recovery: RecoveryPolicy,
    telemetry: Arc<Telemetry>,
    max_steps: u32,
    /// A `running` row idle for longer than this lost its invocation
    stale_after: chrono::Duration,
}

/// Contexts reaped per sweep
const REAP_BATCH: i64 = 100;

impl Dispatcher {
    pub fn new(
        registry: Arc<FlowRegistry>,
        contexts: ContextManager,
        services: HandlerServices,
        recovery: RecoveryPolicy,
        telemetry: Arc<Telemetry>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            contexts,
            handlers: HandlerRegistry::new(),
            services,
            recovery,
            telemetry,
            max_steps: config.max_steps,
            stale_after: chrono::Duration::seconds(config.stale_running_secs),
        }
    }

    pub fn contexts(&self) -> &ContextManager {
        &self.contexts
    }

    fn store(&self) -> &ContextStore {
        self.contexts.store()
    }

    /// Execute `context` from `start_node` until it waits, ends or fails
    ///
    /// An error out of the loop fails the context, so it never stays `running`.
    pub async fn run(&self, context: ExecutionContext, start_node: &str) -> EngineResult<RunOutcome> {
        let context_id = context.id.clone();
        let chat_id = context.subject.chat_id.clone();
        let result = self.run_steps(context, start_node).await;
        if let Err(e) = &result {
            self.abandon(&context_id, &chat_id, e).await;
        }
        result
    }

    async fn run_steps(&self, mut context: ExecutionContext, start_node: &str) -> EngineResult<RunOutcome> {
        let flow = match self.registry.get_version(&context.flow_id, context.flow_version).await {
            Ok(flow) => flow,
            Err(e @ (EngineError::GraphConfiguration { .. } | EngineError::FlowNotFound(_))) => {
                return self.fail_context(&context, &e.to_string(), true).await;
            }
            Err(e) => return Err(e),
        };
        let cap = flow.graph.settings.max_steps.unwrap_or(self.max_steps);
        let vars = self.contexts.variables(&context);
        let started = Instant::now();

        tracing::info!(
            "🚀 Running context {} (flow '{}' v{}) from node '{}'",
            context.id,
            context.flow_id,
            context.flow_version,
            start_node
        );

        let mut current = start_node.to_string();
        let mut steps_this_run: u32 = 0;
        loop {
            match self.store().status(&context.id).await? {
                Some(ExecutionStatus::Running) => {}
                Some(ExecutionStatus::Cancelled) => {
                    tracing::info!("🛑 Context {} was cancelled; stopping before '{}'", context.id, current);
                    return Ok(RunOutcome::Cancelled);
                }
                other => {
                    return Err(EngineError::InvalidState(format!(
                        "context {} is {:?}, not running",
                        context.id, other
                    )))
                }
            }

            if steps_this_run >= cap {
                let error = EngineError::LoopDetected(cap);
                tracing::error!("🔁 Context {} exceeded {} steps at node '{}'", context.id, cap, current);
                return self.fail_context(&context, &error.to_string(), true).await;
            }

            let Some(node) = flow.node(&current) else {
                let error = EngineError::graph(&context.flow_id, Some(&current), "node does not exist");
                return self.fail_context(&context, &error.to_string(), true).await;
            };

            steps_this_run += 1;
            context.step_count = context.step_count.saturating_add(1);
            context.current_node_id = Some(current.clone());
            if !self.store().record_step(&context.id, &current, context.step_count).await? {
                return self.settled(&context.id).await;
            }

            let step = StepContext {
                context: &context,
                flow: &flow,
                node,
                vars: &vars,
                step: context.step_count,
                services: &self.services,
            };
            let step_started = Instant::now();
            let result = self.execute_with_retry(&step).await;
            self.trace(&context, node, &result, step_started).await;

            let result = match result {
                Ok(result) => result,
                Err(error) => return self.recover(&context, &flow, node, error).await,
            };

            match result.transition {
                Transition::Next(target) => {
                    tracing::debug!("➡️ '{}' -> '{}'", current, target);
                    current = target;
                }
                Transition::EndFlow { success } => {
                    if !self.store().finish(&context.id, ExecutionStatus::Completed, None).await? {
                        return self.settled(&context.id).await;
                    }
                    self.telemetry.performance.record_outcome(&context.flow_id, success);
                    tracing::info!(
                        "🎉 Context {} completed at '{}' in {:?} ({} steps)",
                        context.id,
                        current,
                        started.elapsed(),
                        context.step_count
                    );
                    return Ok(RunOutcome::Completed);
                }
                Transition::Wait { wait_type, node_id, deadline } => {
                    match self
                        .store()
                        .suspend(&context.id, &node_id, wait_type, deadline, context.step_count)
                        .await
                    {
                        Ok(()) => {}
                        Err(e) if e.is_conflict() => return self.settled(&context.id).await,
                        Err(e) => return Err(e),
                    }
                    tracing::info!("⏸️ Context {} waiting for {} at '{}'", context.id, wait_type.as_str(), node_id);
                    return Ok(RunOutcome::Waiting { node_id, wait_type });
                }
            }
        }
    }

    fn run_boxed<'a>(&'a self, context: ExecutionContext, start_node: String) -> BoxedRun<'a> {
        Box::pin(async move { self.run(context, &start_node).await })
    }

    /// Invoke the handler, retrying transient failures with exponential backoff
    async fn execute_with_retry(&self, step: &StepContext<'_>) -> Result<NodeExecutionResult, HandlerError> {
        let handler = self.handlers.resolve(step.node.node_type);
        let max_attempts = self.recovery.max_attempts();
        let mut attempt = 1;
        loop {
            match handler.execute(step).await {
                Err(HandlerError::Transient(message)) if attempt < max_attempts => {
                    let delay = self.recovery.backoff(attempt);
                    tracing::warn!(
                        "🔄 Transient failure at '{}' (attempt {}/{}), retrying in {:?}: {}",
                        step.node.id,
                        attempt,
                        max_attempts,
                        delay,
                        message
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn trace(
        &self,
        context: &ExecutionContext,
        node: &CompiledNode,
        result: &Result<NodeExecutionResult, HandlerError>,
        started: Instant,
    ) {
        let duration = started.elapsed();
        let (status, output, error) = match result {
            Ok(r) => {
                let status = match r.transition {
                    Transition::Next(_) => "ok",
                    Transition::EndFlow { .. } => "ended",
                    Transition::Wait { .. } => "waiting",
                };
                let mut output = r.output.clone();
                if let Value::Object(map) = &mut output {
                    map.insert("transition".into(), r.transition.describe());
                } else {
                    output = json!({"result": output, "transition": r.transition.describe()});
                }
                (status, output, None)
            }
            Err(e) => ("error", Value::Null, Some(e.to_string())),
        };

        self.telemetry.performance.record_step(&context.flow_id, duration, error.is_some());
        self.telemetry
            .feed
            .record(StepTrace {
                context_id: context.id.clone(),
                flow_id: context.flow_id.clone(),
                node_id: node.id.clone(),
                node_type: node.node_type.as_str().to_string(),
                step: context.step_count,
                status: status.to_string(),
                duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                input: node.config.clone(),
                output,
                error,
                recorded_at: Utc::now(),
            })
            .await;
    }

    /// Route a handler failure through the recovery policy and apply the resolution
    pub(crate) async fn recover(
        &self,
        context: &ExecutionContext,
        flow: &CompiledFlow,
        node: &CompiledNode,
        error: HandlerError,
    ) -> EngineResult<RunOutcome> {
        let recorded = match &error {
            HandlerError::Configuration(message) => {
                EngineError::graph(flow.id(), Some(&node.id), message.clone()).to_string()
            }
            other => EngineError::HandlerRuntime { node_id: node.id.clone(), source: other.clone() }.to_string(),
        };
        tracing::warn!("⚠️ Context {} failed at '{}': {}", context.id, node.id, recorded);

        match self.recovery.resolve(context, &error).await? {
            Resolution::Reprompt { node_id, wait_type, message } => {
                self.notify(context, &message).await;
                let deadline = flow.node(&node_id).and_then(|wait| wait_deadline(&wait.config, flow));
                match self
                    .store()
                    .suspend(&context.id, &node_id, wait_type, deadline, context.step_count)
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_conflict() => return self.settled(&context.id).await,
                    Err(e) => return Err(e),
                }
                tracing::info!("🔁 Context {} re-prompted at '{}'", context.id, node_id);
                Ok(RunOutcome::Waiting { node_id, wait_type })
            }
            Resolution::Abort { message } => {
                self.notify(context, &message).await;
                self.finish_failed(context, &recorded).await
            }
            Resolution::Fail { message } => {
                self.notify(context, &message).await;
                self.finish_failed(context, &recorded).await
            }
            Resolution::Fallback { flow: fallback } => {
                self.escalate(context, node, &error, &recorded, fallback).await
            }
        }
    }

    async fn escalate(
        &self,
        context: &ExecutionContext,
        node: &CompiledNode,
        error: &HandlerError,
        recorded: &str,
        fallback: Arc<CompiledFlow>,
    ) -> EngineResult<RunOutcome> {
        let note = format!("{} (escalated to fallback flow '{}')", recorded, fallback.id());
        if let RunOutcome::Cancelled = self.finish_failed(context, &note).await? {
            return Ok(RunOutcome::Cancelled);
        }

        let Some(entry) = fallback.entry_points.first().cloned() else {
            return Ok(RunOutcome::Failed { error: note });
        };
        let next = match self.contexts.create_context(&fallback, &context.subject, None).await {
            Ok(next) => next,
            Err(e) if e.is_conflict() => {
                tracing::warn!("🛟 Fallback flow '{}' already active for chat {}", fallback.id(), context.subject.chat_id);
                self.notify(context, self.recovery.failure_message()).await;
                return Ok(RunOutcome::Failed { error: note });
            }
            Err(e) => return Err(e),
        };

        let recorded_error = json!({
            "flow_id": context.flow_id,
            "context_id": context.id,
            "node_id": node.id,
            "kind": ErrorClass::of(error).as_str(),
            "message": error.to_string(),
        });
        if let Err(e) = self
            .contexts
            .variables(&next)
            .set(ERROR_VARIABLE, recorded_error, VariableScope::Session)
            .await
        {
            self.abandon(&next.id, &next.subject.chat_id, &e).await;
            return Err(e);
        }

        let fallback_context_id = next.id.clone();
        self.run_boxed(next, entry).await?;
        Ok(RunOutcome::Escalated { fallback_context_id })
    }

    /// Fail the context with the final restart/help message
    pub(crate) async fn fail_context(
        &self,
        context: &ExecutionContext,
        error: &str,
        notify: bool,
    ) -> EngineResult<RunOutcome> {
        if notify {
            self.notify(context, self.recovery.failure_message()).await;
        }
        self.finish_failed(context, error).await
    }

    async fn finish_failed(&self, context: &ExecutionContext, error: &str) -> EngineResult<RunOutcome> {
        if !self.store().finish(&context.id, ExecutionStatus::Failed, Some(error)).await? {
            return self.settled(&context.id).await;
        }
        self.telemetry.performance.record_outcome(&context.flow_id, false);
        tracing::error!("❌ Context {} failed: {}", context.id, error);
        Ok(RunOutcome::Failed { error: error.to_string() })
    }

    /// Fail a context whose invocation errored; conflicts belong to another writer
    pub(crate) async fn abandon(&self, context_id: &str, chat_id: &str, error: &EngineError) {
        if error.is_conflict() || matches!(error, EngineError::InvalidState(_)) {
            return;
        }
        match self.store().finish(context_id, ExecutionStatus::Failed, Some(&error.to_string())).await {
            Ok(true) => {
                tracing::error!("❌ Context {} failed on engine error: {}", context_id, error);
                let message = OutboundMessage::text(chat_id, self.recovery.failure_message());
                if let Err(e) = self.services.transport.send(message).await {
                    tracing::warn!("⚠️ Could not notify chat {}: {}", chat_id, e);
                }
            }
            Ok(false) => {}
            Err(e) => tracing::error!("❌ Could not fail context {} after '{}': {}", context_id, error, e),
        }
    }

    /// Fail `running` contexts whose invocation disappeared without finishing them
    pub(crate) async fn reap_stale(&self, now: DateTime<Utc>) -> EngineResult<Vec<String>> {
        let before = now - self.stale_after;
        let mut reaped = Vec::new();
        for context in self.store().list_stale_running(before, REAP_BATCH).await? {
            let error = format!("no progress since {}; its invocation was lost", context.updated_at.to_rfc3339());
            if !self.store().fail_stale(&context.id, before, &error).await? {
                continue;
            }
            self.notify(&context, self.recovery.failure_message()).await;
            self.telemetry.performance.record_outcome(&context.flow_id, false);
            tracing::warn!("🧹 Reaped context {} stuck in running: {}", context.id, error);
            reaped.push(context.id);
        }
        Ok(reaped)
    }

    /// Best-effort message to the subject; a transport failure here is only logged
    async fn notify(&self, context: &ExecutionContext, text: &str) {
        let message = OutboundMessage::text(&context.subject.chat_id, text);
        if let Err(e) = self.services.transport.send(message).await {
            tracing::warn!("⚠️ Could not notify chat {}: {}", context.subject.chat_id, e);
        }
    }

    /// Outcome for a context another writer already moved on
    async fn settled(&self, context_id: &str) -> EngineResult<RunOutcome> {
        let context = self.contexts.load(context_id).await?;
        Ok(match context.status {
            ExecutionStatus::Cancelled => RunOutcome::Cancelled,
            ExecutionStatus::Completed => RunOutcome::Completed,
            ExecutionStatus::Failed => RunOutcome::Failed {
                error: context.error.unwrap_or_default(),
            },
            ExecutionStatus::Waiting => RunOutcome::Waiting {
                node_id: context.current_node_id.unwrap_or_default(),
                wait_type: context.wait_type,
            },
            ExecutionStatus::Running => {
                return Err(EngineError::ConcurrencyConflict(format!(
                    "context {} changed underneath the dispatcher",
                    context_id
                )))
            }
        })
    }
}
