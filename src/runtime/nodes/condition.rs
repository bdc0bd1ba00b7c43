use crate::error::HandlerError;
use crate::runtime::condition::{compare, evaluate_expression, Operator};
use crate::runtime::executor::{NodeExecutionResult, NodeHandler, StepContext};
use async_trait::async_trait;
use serde_json::{json, Value};

/// Routes along the `true` or `false` edge
#[derive(Debug, Default)]
pub struct ConditionHandler;

#[async_trait]
impl NodeHandler for ConditionHandler {
    async fn execute(&self, step: &StepContext<'_>) -> Result<NodeExecutionResult, HandlerError> {
        let namespace = step.vars.namespace(step.context).await?;
        let config = &step.node.config;

        let (outcome, detail) = if let Some(expression) = step.config_str("expression").filter(|e| !e.trim().is_empty()) {
            let source = expression.to_string();
            let variables = namespace.flatten();
            let outcome = tokio::task::spawn_blocking(move || evaluate_expression(&source, &variables))
                .await
                .map_err(|e| HandlerError::Unclassified(format!("expression evaluation aborted: {}", e)))?
                .map_err(HandlerError::config)?;
            (outcome, json!({"expression": expression}))
        } else {
            let variable = step
                .config_str("variable")
                .ok_or_else(|| HandlerError::config("condition node needs 'variable' or 'expression'"))?;
            let raw_operator = step.config_str("operator").unwrap_or("equals");
            let operator = Operator::parse(raw_operator)
                .ok_or_else(|| HandlerError::config(format!("unknown operator '{}'", raw_operator)))?;
            let actual = namespace.lookup(variable).cloned().unwrap_or(Value::Null);
            let expected = namespace.render_value(config.get("value").unwrap_or(&Value::Null));
            let outcome = compare(operator, &actual, &expected).map_err(HandlerError::config)?;
            (
                outcome,
                json!({"variable": variable, "operator": operator.as_str(), "actual": actual, "expected": expected}),
            )
        };

        let label = if outcome { "true" } else { "false" };
        let target = step
            .node
            .target_for(label)
            .ok_or_else(|| HandlerError::config(format!("condition node has no '{}' edge", label)))?;

        tracing::debug!("🔀 Condition '{}' -> {} ({})", step.node.id, label, target);
        Ok(NodeExecutionResult::next(target).with_output(json!({"result": outcome, "branch": label, "input": detail})))
    }
}
