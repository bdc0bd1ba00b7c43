/// Wait/resume coordinator
///
/// Claims an inbound event against the subject's waiting context, records the event
/// payload and re-enters the dispatcher at the node the graph says comes next. The
/// claim is a conditional status flip in the store, so a duplicate event can never
/// resume the same suspension twice. The expired-wait sweep uses the same claim.

use crate::error::{EngineError, EngineResult, HandlerError};
use crate::runtime::contacts::{normalize_phone, SubjectDirectory};
use crate::runtime::context::{
    ExecutionContext, ExecutionStatus, Variables, WaitType, CALLBACK_VARIABLE, CONTACT_MATCH_VARIABLE,
    CONTACT_VARIABLE, LINKED_SUBJECT_VARIABLE, PHONE_VARIABLE,
};
use crate::runtime::engine::{Dispatcher, RunOutcome};
use crate::runtime::events::{ContactInfo, EventPayload, InboundEvent};
use crate::runtime::nodes::scope_field;
use crate::runtime::store::Claim;
use crate::workflow::compiler::CompiledFlow;
use crate::workflow::registry::FlowRegistry;
use crate::workflow::types::{VariableScope, TIMEOUT_EDGE};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;

/// Expired waits handled per sweep
const SWEEP_BATCH: usize = 100;

/// Result of offering an event to waiting contexts
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    Resumed { context_id: String, outcome: RunOutcome },
    /// No waiting context accepted the event
    NotWaiting,
}

#[derive(Debug)]
pub struct ResumeCoordinator {
    registry: Arc<FlowRegistry>,
    dispatcher: Arc<Dispatcher>,
    directory: SubjectDirectory,
}

impl ResumeCoordinator {
    pub fn new(registry: Arc<FlowRegistry>, dispatcher: Arc<Dispatcher>, directory: SubjectDirectory) -> Self {
        Self { registry, dispatcher, directory }
    }

    /// Resume the subject's waiting context with `event`, if one accepts it
    pub async fn on_inbound_event(&self, event: &InboundEvent) -> EngineResult<ResumeOutcome> {
        let subject = event.subject();
        let accepted = WaitType::compatible_with(event.kind());
        let store = self.dispatcher.contexts().store();

        let (context_id, wait_type) = match store.claim_waiting(&subject, accepted).await? {
            Claim::Claimed { context, wait_type } => (context.id, wait_type),
            Claim::NoMatch => return Ok(ResumeOutcome::NotWaiting),
            Claim::Lost => {
                tracing::debug!("🤝 Duplicate event for chat {} lost the resume claim", subject.chat_id);
                return Ok(ResumeOutcome::NotWaiting);
            }
        };

        tracing::info!("▶️ Resuming context {} ({} wait) for chat {}", context_id, wait_type.as_str(), subject.chat_id);
        let outcome = match self.resume_claimed(&context_id, event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // The claim flipped the row to running; never leave it stranded there
                tracing::error!("❌ Resume of context {} failed: {}", context_id, e);
                self.dispatcher.abandon(&context_id, &subject.chat_id, &e).await;
                return Err(e);
            }
        };
        Ok(ResumeOutcome::Resumed { context_id, outcome })
    }

    async fn resume_claimed(&self, context_id: &str, event: &InboundEvent) -> EngineResult<RunOutcome> {
        let (context, vars) = self.dispatcher.contexts().resume_context(context_id, Some(event)).await?;
        let flow = self.registry.get_version(&context.flow_id, context.flow_version).await?;
        let Some(wait_node) = context.current_node_id.as_deref().and_then(|id| flow.node(id)) else {
            return self.dispatcher.fail_context(&context, "waiting node no longer exists", true).await;
        };

        // Rejected input never reaches the wait node's variable
        if let EventPayload::Message { text } = &event.payload {
            if let Some(error) = validate_input(&wait_node.config, text) {
                return self.dispatcher.recover(&context, &flow, wait_node, error).await;
            }
        }

        // Payload under the wait node's own variable, when it names one
        if let Some(name) = wait_node.config.get("variable").and_then(Value::as_str) {
            let scope = scope_field(&wait_node.config, "scope")
                .map_err(|e| EngineError::graph(flow.id(), Some(&wait_node.id), e.to_string()))?;
            let value = match &event.payload {
                EventPayload::Contact { contact } => Value::String(format!("+{}", normalize_phone(&contact.phone_number))),
                _ => event.payload_value(),
            };
            vars.set(name, value, scope).await?;
        }

        let target = match &event.payload {
            EventPayload::Message { .. } => wait_node.default_target().map(str::to_string),
            EventPayload::Callback { data } => {
                vars.set(CALLBACK_VARIABLE, json!(data), VariableScope::Session).await?;
                match flow.callback_trigger(data) {
                    Some(trigger) => Some(trigger.to_string()),
                    None => wait_node.target_for_or_default(data).map(str::to_string),
                }
            }
            EventPayload::Contact { contact } => {
                self.record_contact(&vars, contact, &event.user_id).await?;
                wait_node.default_target().map(str::to_string)
            }
        };

        self.continue_at(context, &flow, target).await
    }

    /// Normalize the shared phone, match it against the directory and record the outcome
    async fn record_contact(
        &self,
        vars: &Variables,
        contact: &ContactInfo,
        sender_user_id: &str,
    ) -> EngineResult<()> {
        let phone = format!("+{}", normalize_phone(&contact.phone_number));
        vars.set(CONTACT_VARIABLE, serde_json::to_value(contact)?, VariableScope::Session).await?;
        vars.set(PHONE_VARIABLE, json!(phone), VariableScope::Session).await?;

        let outcome = self.directory.match_contact(contact, sender_user_id).await?;
        vars.set(CONTACT_MATCH_VARIABLE, serde_json::to_value(&outcome)?, VariableScope::Session).await?;
        if let Some(subject_id) = outcome.subject_id() {
            vars.set(LINKED_SUBJECT_VARIABLE, json!(subject_id), VariableScope::Session).await?;
            vars.set(LINKED_SUBJECT_VARIABLE, json!(subject_id), VariableScope::Persistent).await?;
        }
        Ok(())
    }

    /// Run from `target`, or complete the context when the wait node has no way on
    async fn continue_at(
        &self,
        context: ExecutionContext,
        flow: &CompiledFlow,
        target: Option<String>,
    ) -> EngineResult<RunOutcome> {
        match target {
            Some(target) => self.dispatcher.run(context, &target).await,
            None => {
                let store = self.dispatcher.contexts().store();
                store.finish(&context.id, ExecutionStatus::Completed, None).await?;
                tracing::info!("🎉 Context {} completed: no edge after '{}' in flow '{}'",
                    context.id, context.current_node_id.as_deref().unwrap_or("?"), flow.id());
                Ok(RunOutcome::Completed)
            }
        }
    }

    /// Resume or fail every waiting context whose deadline passed
    ///
    /// Delay waits continue along their default edge. Input, callback and contact waits
    /// follow their `timeout` edge; without one the context fails with the final message.
    /// Contexts are claimed one at a time, each only when it is about to be processed.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> EngineResult<Vec<(String, RunOutcome)>> {
        let store = self.dispatcher.contexts().store();
        let mut outcomes = Vec::new();

        while outcomes.len() < SWEEP_BATCH {
            let Some((context, wait_type)) = store.claim_next_expired(now).await? else {
                break;
            };
            let context_id = context.id.clone();
            let chat_id = context.subject.chat_id.clone();
            let outcome = match self.resume_expired(context, wait_type).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("❌ Sweep could not resume context {}: {}", context_id, e);
                    self.dispatcher.abandon(&context_id, &chat_id, &e).await;
                    RunOutcome::Failed { error: e.to_string() }
                }
            };
            outcomes.push((context_id, outcome));
        }

        if !outcomes.is_empty() {
            tracing::info!("⏰ Sweep resumed {} expired waits", outcomes.len());
        }
        Ok(outcomes)
    }

    async fn resume_expired(&self, context: ExecutionContext, wait_type: WaitType) -> EngineResult<RunOutcome> {
        let flow = self.registry.get_version(&context.flow_id, context.flow_version).await?;
        let Some(node) = context.current_node_id.as_deref().and_then(|id| flow.node(id)) else {
            return self.dispatcher.fail_context(&context, "waiting node no longer exists", true).await;
        };

        let target = match wait_type {
            WaitType::Delay => node.default_target().map(str::to_string),
            _ => match node.target_for(TIMEOUT_EDGE) {
                Some(target) => Some(target.to_string()),
                None => {
                    let error = format!("wait for {} at '{}' timed out", wait_type.as_str(), node.id);
                    return self.dispatcher.fail_context(&context, &error, true).await;
                }
            },
        };
        tracing::debug!("⏰ Context {} {} wait at '{}' expired", context.id, wait_type.as_str(), node.id);
        self.continue_at(context, &flow, target).await
    }
}

/// Validation configured on an input wait: `pattern` regex, optional `invalid_message`
fn validate_input(config: &Value, text: &str) -> Option<HandlerError> {
    let pattern = config.get("pattern").and_then(Value::as_str)?;
    let matched = match Regex::new(pattern) {
        Ok(re) => re.is_match(text.trim()),
        Err(e) => return Some(HandlerError::config(format!("invalid input pattern '{}': {}", pattern, e))),
    };
    (!matched).then(|| HandlerError::Validation {
        message: format!("input '{}' does not match {}", text, pattern),
        reprompt: config.get("invalid_message").and_then(Value::as_str).map(str::to_string),
    })
}
