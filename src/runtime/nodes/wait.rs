use super::{parse_buttons, send_text};
use crate::error::HandlerError;
use crate::runtime::context::WaitType;
use crate::runtime::executor::{NodeExecutionResult, NodeHandler, StepContext};
use crate::runtime::transport::Controls;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

/// Suspends until the subject answers. The answer itself arrives later through the
/// resume coordinator; this handler never consumes an event.
#[derive(Debug)]
pub struct WaitHandler {
    wait_type: WaitType,
}

impl WaitHandler {
    pub fn new(wait_type: WaitType) -> Self {
        Self { wait_type }
    }
}

impl Default for WaitHandler {
    fn default() -> Self {
        Self::new(WaitType::Input)
    }
}

#[async_trait]
impl NodeHandler for WaitHandler {
    async fn execute(&self, step: &StepContext<'_>) -> Result<NodeExecutionResult, HandlerError> {
        let mut prompt = None;
        if let Some(text) = step.config_str("prompt").filter(|t| !t.trim().is_empty()) {
            let namespace = step.vars.namespace(step.context).await?;
            let controls = match self.wait_type {
                WaitType::Contact => Some(Controls::RequestContact {
                    label: step.config_str("button_text").unwrap_or("Share phone number").to_string(),
                }),
                _ => parse_buttons(&step.node.config, &namespace)?,
            };
            prompt = Some(send_text(step, &namespace, text, controls).await?);
        }

        let deadline = step.wait_deadline();
        tracing::debug!(
            "⏸️ Node '{}' waits for {} (deadline {:?})",
            step.node.id,
            self.wait_type.as_str(),
            deadline
        );
        Ok(NodeExecutionResult::wait(self.wait_type, &step.node.id, deadline).with_output(json!({"prompt": prompt})))
    }
}

/// Schedules a resumption instead of blocking a worker
#[derive(Debug, Default)]
pub struct DelayHandler;

#[async_trait]
impl NodeHandler for DelayHandler {
    async fn execute(&self, step: &StepContext<'_>) -> Result<NodeExecutionResult, HandlerError> {
        let seconds = step
            .node
            .config
            .get("seconds")
            .and_then(Value::as_u64)
            .and_then(|s| i64::try_from(s).ok())
            .filter(|s| *s > 0)
            .ok_or_else(|| HandlerError::config("delay node needs positive integer 'seconds'"))?;
        let resume_at = Utc::now() + chrono::Duration::seconds(seconds);

        tracing::debug!("⏳ Delay '{}' until {}", step.node.id, resume_at);
        Ok(NodeExecutionResult::wait(WaitType::Delay, &step.node.id, Some(resume_at))
            .with_output(json!({"resume_at": resume_at.to_rfc3339()})))
    }
}

#[cfg(test)]
mod tests {
    use crate::runtime::context::WaitType;
    use crate::runtime::executor::Transition;
    use crate::runtime::nodes::testing::Harness;
    use crate::runtime::transport::Controls;
    use serde_json::json;

    #[tokio::test]
    async fn waits_prompt_and_suspend_on_their_own_node() {
        let harness = Harness::new(json!({
            "id": "f", "name": "F",
            "nodes": [
                {"id": "t", "type": "trigger", "config": {"kind": "command", "command": "/go"}},
                {"id": "phone", "type": "wait_contact", "config": {"prompt": "Your phone?", "timeout_secs": 60}},
                {"id": "pause", "type": "delay", "config": {"seconds": 30}}
            ],
            "connections": [
                {"id": "c1", "source": "t", "target": "phone"},
                {"id": "c2", "source": "phone", "target": "pause"}
            ]
        }))
        .await;

        match harness.run("phone", 1).await.unwrap().transition {
            Transition::Wait { wait_type, node_id, deadline } => {
                assert_eq!(wait_type, WaitType::Contact);
                assert_eq!(node_id, "phone");
                assert!(deadline.is_some());
            }
            other => panic!("expected wait, got {:?}", other),
        }
        assert!(matches!(harness.transport.sent()[0].controls, Some(Controls::RequestContact { .. })));

        match harness.run("pause", 2).await.unwrap().transition {
            Transition::Wait { wait_type, deadline, .. } => {
                assert_eq!(wait_type, WaitType::Delay);
                assert!(deadline.unwrap() > chrono::Utc::now());
            }
            other => panic!("expected delay, got {:?}", other),
        }
    }
}
