/// Action node sub-variants
///
/// - http_request: external HTTP call, optional JSONPath extraction into a variable
/// - store_query: read-only SELECT against the engine database
/// - set_variable / get_variable: scope-aware variable writes and copies
/// - request_contact: ask for the subject's phone and suspend for the contact share

use super::{scope_field, send_text};
use crate::error::HandlerError;
use crate::runtime::context::WaitType;
use crate::runtime::executor::{NodeExecutionResult, NodeHandler, StepContext};
use crate::runtime::template::Namespace;
use crate::runtime::transport::Controls;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sqlx::{sqlite::SqliteRow, Column, Row, ValueRef};
use std::time::Duration;

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Default)]
pub struct ActionHandler;

#[async_trait]
impl NodeHandler for ActionHandler {
    async fn execute(&self, step: &StepContext<'_>) -> Result<NodeExecutionResult, HandlerError> {
        let action = step
            .config_str("action")
            .ok_or_else(|| HandlerError::config("action node needs 'action'"))?;
        tracing::debug!("⚙️ Executing {} action: {}", action, step.node.id);

        match action {
            "http_request" => http_request(step).await,
            "store_query" => store_query(step).await,
            "set_variable" => set_variable(step).await,
            "get_variable" => get_variable(step).await,
            "request_contact" => request_contact(step).await,
            other => Err(HandlerError::config(format!("unknown action '{}'", other))),
        }
    }
}

/// Store `value` under `result_variable` when configured
async fn store_result(step: &StepContext<'_>, value: &Value) -> Result<(), HandlerError> {
    if let Some(name) = step.config_str("result_variable") {
        let scope = scope_field(&step.node.config, "result_scope")?;
        step.vars.set(name, value.clone(), scope).await?;
    }
    Ok(())
}

async fn http_request(step: &StepContext<'_>) -> Result<NodeExecutionResult, HandlerError> {
    let namespace = step.vars.namespace(step.context).await?;
    let url = namespace.render_text(
        step.config_str("url")
            .ok_or_else(|| HandlerError::config("http_request action needs 'url'"))?,
    );
    let method = step.config_str("method").unwrap_or("GET").to_uppercase();
    let idempotent = matches!(method.as_str(), "GET" | "HEAD");

    let effect_key = step.effect_key();
    let response = match step.services.store.get_effect(&effect_key).await? {
        Some(recorded) if !idempotent => {
            tracing::info!("♻️ Reusing recorded result of {} {} for step {}", method, url, effect_key);
            recorded
        }
        _ => {
            let response = send_request(step, &namespace, &method, &url).await?;
            if !idempotent {
                step.services.store.put_effect(&effect_key, &response).await?;
            }
            response
        }
    };

    let data = response.get("data").cloned().unwrap_or(Value::Null);
    let extracted = match step.config_str("result_path") {
        Some(path) => extract_path(&data, path)?,
        None => data,
    };
    store_result(step, &extracted).await?;

    Ok(NodeExecutionResult::follow(step.node).with_output(json!({
        "method": method,
        "url": url,
        "status": response.get("status"),
        "result": extracted,
    })))
}

async fn send_request(
    step: &StepContext<'_>,
    namespace: &Namespace,
    method: &str,
    url: &str,
) -> Result<Value, HandlerError> {
    let http_method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| HandlerError::config(format!("unsupported HTTP method: {}", method)))?;
    let timeout = step
        .node
        .config
        .get("timeout_secs")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);

    let mut request = step
        .services
        .http
        .request(http_method, url)
        .timeout(Duration::from_secs(timeout));

    if let Some(headers) = step.node.config.get("headers").and_then(Value::as_object) {
        for (key, value) in headers {
            if let Some(header_value) = value.as_str() {
                request = request.header(key.as_str(), namespace.render_text(header_value));
            }
        }
    }

    if let Some(body) = step.node.config.get("body") {
        request = match namespace.render_value(body) {
            Value::String(text) => request.header("Content-Type", "text/plain").body(text),
            Value::Null => request,
            other => request.json(&other),
        };
    }

    tracing::debug!("🌍 HTTP Request: {} {}", method, url);
    let response = request.send().await.map_err(HandlerError::from_http)?;
    let status = response.status();
    let text = response.text().await.map_err(HandlerError::from_http)?;

    if !status.is_success() {
        let snippet: String = text.chars().take(200).collect();
        return Err(HandlerError::from_status(
            status.as_u16(),
            format!("{} {} returned {}: {}", method, url, status, snippet),
        ));
    }

    let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
    tracing::info!("✅ HTTP request completed: {} {} (status: {})", method, url, status);
    Ok(json!({"status": status.as_u16(), "data": data}))
}

/// JSONPath over the response data: one match is unwrapped, several become an array
fn extract_path(data: &Value, path: &str) -> Result<Value, HandlerError> {
    let matches = jsonpath_lib::select(data, path)
        .map_err(|e| HandlerError::config(format!("invalid result_path '{}': {:?}", path, e)))?;
    Ok(match matches.as_slice() {
        [] => Value::Null,
        [single] => (*single).clone(),
        many => Value::Array(many.iter().map(|v| (*v).clone()).collect()),
    })
}

async fn store_query(step: &StepContext<'_>) -> Result<NodeExecutionResult, HandlerError> {
    let query = step
        .config_str("query")
        .ok_or_else(|| HandlerError::config("store_query action needs 'query'"))?;
    let statement = query.trim().trim_end_matches(';');
    if !statement.to_ascii_lowercase().starts_with("select") || statement.contains(';') {
        return Err(HandlerError::config("store_query only allows a single SELECT statement"));
    }

    let namespace = step.vars.namespace(step.context).await?;
    let params: Vec<Value> = match step.node.config.get("params") {
        Some(Value::Array(items)) => items.iter().map(|p| namespace.render_value(p)).collect(),
        Some(_) => return Err(HandlerError::config("'params' must be an array")),
        None => Vec::new(),
    };

    let mut query_builder = sqlx::query(statement);
    for value in &params {
        query_builder = match value {
            Value::String(s) => query_builder.bind(s.clone()),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    query_builder.bind(i)
                } else if let Some(f) = n.as_f64() {
                    query_builder.bind(f)
                } else {
                    query_builder.bind(n.to_string())
                }
            }
            Value::Bool(b) => query_builder.bind(*b),
            Value::Null => query_builder.bind(None::<String>),
            other => query_builder.bind(other.to_string()),
        };
    }

    let rows = query_builder
        .fetch_all(step.services.store.pool())
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) => HandlerError::config(format!("query failed: {}", db)),
            other => HandlerError::Transient(format!("query failed: {}", other)),
        })?;
    let records: Vec<Value> = rows.iter().map(row_to_json).collect();

    let single = step.node.config.get("single").and_then(Value::as_bool).unwrap_or(false);
    let result = if single {
        records.first().cloned().unwrap_or(Value::Null)
    } else {
        Value::Array(records.clone())
    };
    store_result(step, &result).await?;

    tracing::info!("✅ Query successful: {} rows returned", records.len());
    Ok(NodeExecutionResult::follow(step.node).with_output(json!({"rows": records.len(), "result": result})))
}

fn row_to_json(row: &SqliteRow) -> Value {
    let mut record = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        record.insert(column.name().to_string(), column_value(row, i));
    }
    Value::Object(record)
}

fn column_value(row: &SqliteRow, index: usize) -> Value {
    match row.try_get_raw(index) {
        Ok(raw) if !raw.is_null() => {}
        _ => return Value::Null,
    }
    if let Ok(v) = row.try_get::<i64, _>(index) {
        return json!(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(index) {
        return json!(v);
    }
    row.try_get::<String, _>(index).map(Value::String).unwrap_or(Value::Null)
}

async fn set_variable(step: &StepContext<'_>) -> Result<NodeExecutionResult, HandlerError> {
    let name = step
        .config_str("name")
        .ok_or_else(|| HandlerError::config("set_variable action needs 'name'"))?;
    let scope = scope_field(&step.node.config, "scope")?;
    let namespace = step.vars.namespace(step.context).await?;
    let value = namespace.render_value(step.node.config.get("value").unwrap_or(&Value::Null));

    step.vars.set(name, value.clone(), scope).await?;
    tracing::debug!("📝 Set {} variable '{}'", scope.as_str(), name);
    Ok(NodeExecutionResult::follow(step.node).with_output(json!({"name": name, "scope": scope.as_str(), "value": value})))
}

async fn get_variable(step: &StepContext<'_>) -> Result<NodeExecutionResult, HandlerError> {
    let name = step
        .config_str("name")
        .ok_or_else(|| HandlerError::config("get_variable action needs 'name'"))?;
    let found = match step.node.config.get("scope") {
        None | Some(Value::Null) => step.vars.lookup(name).await?,
        Some(_) => step.vars.get(name, scope_field(&step.node.config, "scope")?).await?,
    };
    let value = found
        .or_else(|| step.node.config.get("default").cloned())
        .unwrap_or(Value::Null);

    let target = step.config_str("target").unwrap_or(name);
    let target_scope = scope_field(&step.node.config, "target_scope")?;
    step.vars.set(target, value.clone(), target_scope).await?;
    Ok(NodeExecutionResult::follow(step.node).with_output(json!({"name": name, "target": target, "value": value})))
}

async fn request_contact(step: &StepContext<'_>) -> Result<NodeExecutionResult, HandlerError> {
    let namespace = step.vars.namespace(step.context).await?;
    let text = step.config_str("prompt").unwrap_or("Please share your phone number");
    let label = step.config_str("button_text").unwrap_or("Share phone number").to_string();
    let sent = send_text(step, &namespace, text, Some(Controls::RequestContact { label })).await?;

    Ok(NodeExecutionResult::wait(WaitType::Contact, &step.node.id, step.wait_deadline())
        .with_output(json!({"prompt": sent})))
}
