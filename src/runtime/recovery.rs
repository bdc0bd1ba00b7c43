/// Error & recovery policy
///
/// Transient failures are retried inside the dispatcher before they get here. What
/// reaches `resolve` is classified and turned into one `Resolution`:
///
/// | class          | resolution                                           |
/// |----------------|------------------------------------------------------|
/// | validation     | re-prompt and suspend again at the last wait node    |
/// | authorization  | abort with the auth message                          |
/// | configuration  | fail with the final message, never a fallback flow   |
/// | transient (exhausted), unclassified | fallback flow if registered, else fail |
///
/// Every resolution counts against a per (flow, subject) cap in a rolling window;
/// over the cap the context is failed outright.

use crate::config::EngineConfig;
use crate::error::{EngineResult, HandlerError};
use crate::project::ProjectStore;
use crate::runtime::context::{ExecutionContext, WaitType};
use crate::runtime::store::ContextStore;
use crate::workflow::compiler::CompiledFlow;
use crate::workflow::registry::FlowRegistry;
use chrono::Utc;
use std::sync::Arc;

/// Classification of a handler failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Validation,
    Authorization,
    Configuration,
    Unclassified,
}

impl ErrorClass {
    pub fn of(error: &HandlerError) -> Self {
        match error {
            HandlerError::Transient(_) => ErrorClass::Transient,
            HandlerError::Validation { .. } => ErrorClass::Validation,
            HandlerError::Authorization(_) => ErrorClass::Authorization,
            HandlerError::Configuration(_) => ErrorClass::Configuration,
            HandlerError::Unclassified(_) => ErrorClass::Unclassified,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Validation => "validation",
            ErrorClass::Authorization => "authorization",
            ErrorClass::Configuration => "configuration",
            ErrorClass::Unclassified => "unclassified",
        }
    }
}

/// What the dispatcher does with a failed step
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Send `message` and suspend again at `node_id`
    Reprompt {
        node_id: String,
        wait_type: WaitType,
        message: String,
    },
    /// Send `message` and mark the context failed
    Abort { message: String },
    /// Fail this context and continue the subject in the fallback flow
    Fallback { flow: Arc<CompiledFlow> },
    /// Send the final restart/help message and mark the context failed
    Fail { message: String },
}

#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    store: ContextStore,
    projects: ProjectStore,
    registry: Arc<FlowRegistry>,
    config: EngineConfig,
}

impl RecoveryPolicy {
    pub fn new(store: ContextStore, projects: ProjectStore, registry: Arc<FlowRegistry>, config: EngineConfig) -> Self {
        Self { store, projects, registry, config }
    }

    /// Exponential backoff before transient retry `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        std::time::Duration::from_millis(self.config.retry_base_delay_ms.saturating_mul(factor))
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.retry_max_attempts.max(1)
    }

    pub fn failure_message(&self) -> &str {
        &self.config.failure_message
    }

    /// Decide how to recover from `error` raised in `context`
    pub async fn resolve(&self, context: &ExecutionContext, error: &HandlerError) -> EngineResult<Resolution> {
        let class = ErrorClass::of(error);
        let since = Utc::now() - chrono::Duration::seconds(self.config.recovery_window_secs);
        let attempts = self
            .store
            .count_recovery_attempts(&context.flow_id, &context.subject, since)
            .await?;
        self.store
            .record_recovery_attempt(&context.flow_id, &context.subject, class.as_str())
            .await?;

        if attempts >= self.config.recovery_max_attempts {
            tracing::warn!(
                "🧯 Recovery cap reached for flow '{}' chat {} ({} attempts)",
                context.flow_id,
                context.subject.chat_id,
                attempts
            );
            return Ok(self.fail());
        }

        tracing::info!("🩹 Recovering {} failure in context {}: {}", class.as_str(), context.id, error);
        match class {
            ErrorClass::Validation => match (&context.last_wait_node_id, context.last_wait_type) {
                (Some(node_id), Some(wait_type)) => {
                    let message = match error {
                        HandlerError::Validation { reprompt: Some(text), .. } => text.clone(),
                        _ => self.config.reprompt_message.clone(),
                    };
                    Ok(Resolution::Reprompt { node_id: node_id.clone(), wait_type, message })
                }
                _ => self.escalate(context).await,
            },
            ErrorClass::Authorization => Ok(Resolution::Abort {
                message: self.config.auth_failure_message.clone(),
            }),
            ErrorClass::Configuration => Ok(self.fail()),
            ErrorClass::Transient | ErrorClass::Unclassified => self.escalate(context).await,
        }
    }

    fn fail(&self) -> Resolution {
        Resolution::Fail { message: self.config.failure_message.clone() }
    }

    async fn escalate(&self, context: &ExecutionContext) -> EngineResult<Resolution> {
        let project = self
            .projects
            .get_project(&context.project_id)
            .await
            .map_err(|e| crate::error::EngineError::ResourceUnavailable(e.to_string()))?;

        let fallback = project
            .fallback_flow_id
            .filter(|id| id != &context.flow_id)
            .and_then(|id| self.registry.get_active(&id));
        match fallback {
            Some(flow) => {
                tracing::warn!("🛟 Escalating context {} to fallback flow '{}'", context.id, flow.id());
                Ok(Resolution::Fallback { flow })
            }
            None => Ok(self.fail()),
        }
    }
}
