/// SQLite persistence for execution contexts, variables, traces and recovery bookkeeping
///
/// The `execution_contexts` row is the only mutable state shared between invocations.
/// Every status transition is a conditional UPDATE on the current status, so two
/// writers can never both move the same context out of `waiting`.

use crate::error::{EngineError, EngineResult};
use crate::runtime::context::{session_key, ExecutionContext, ExecutionStatus, Subject, WaitType};
use crate::runtime::telemetry::StepTrace;
use crate::workflow::types::VariableScope;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sqlx::{
    sqlite::{SqlitePool, SqliteRow},
    Row,
};

/// Outcome of trying to claim a waiting context
#[derive(Debug)]
pub enum Claim {
    /// This caller now owns the context; it is `running` in the store.
    /// `wait_type` is what the context was waiting for.
    Claimed {
        context: ExecutionContext,
        wait_type: WaitType,
    },
    /// No waiting context matches
    NoMatch,
    /// A matching context was claimed by someone else first
    Lost,
}

/// Store for execution state
#[derive(Debug, Clone)]
pub struct ContextStore {
    pool: SqlitePool,
}

const CONTEXT_COLUMNS: &str = "id, flow_id, flow_version, project_id, user_id, chat_id, status, \
    current_node_id, wait_type, wait_deadline, last_wait_node_id, last_wait_type, step_count, \
    error, created_at, updated_at, finished_at";

/// Fixed-width UTC timestamps, so `updated_at` compares correctly as text
fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_rfc3339() -> String {
    stamp(Utc::now())
}

fn parse_time(raw: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| EngineError::ResourceUnavailable(format!("corrupt timestamp '{}': {}", raw, e)))
}

fn row_to_context(row: &SqliteRow) -> EngineResult<ExecutionContext> {
    let status: String = row.try_get("status")?;
    let wait_type: String = row.try_get("wait_type")?;
    let last_wait_type: Option<String> = row.try_get("last_wait_type")?;
    let deadline: Option<i64> = row.try_get("wait_deadline")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let finished_at: Option<String> = row.try_get("finished_at")?;
    let step_count: i64 = row.try_get("step_count")?;

    Ok(ExecutionContext {
        id: row.try_get("id")?,
        flow_id: row.try_get("flow_id")?,
        flow_version: row.try_get("flow_version")?,
        project_id: row.try_get("project_id")?,
        subject: Subject {
            user_id: row.try_get("user_id")?,
            chat_id: row.try_get("chat_id")?,
        },
        status: ExecutionStatus::parse(&status)
            .ok_or_else(|| EngineError::ResourceUnavailable(format!("unknown status '{}'", status)))?,
        current_node_id: row.try_get("current_node_id")?,
        wait_type: WaitType::parse(&wait_type)
            .ok_or_else(|| EngineError::ResourceUnavailable(format!("unknown wait type '{}'", wait_type)))?,
        wait_deadline: deadline.and_then(DateTime::from_timestamp_millis),
        last_wait_node_id: row.try_get("last_wait_node_id")?,
        last_wait_type: last_wait_type.as_deref().and_then(WaitType::parse),
        step_count: u32::try_from(step_count).unwrap_or(u32::MAX),
        error: row.try_get("error")?,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
        finished_at: finished_at.as_deref().map(parse_time).transpose()?,
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

impl ContextStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new context; the partial unique index turns a second active
    /// context for the same (flow, subject) into `AlreadyRunning`.
    pub async fn insert_context(&self, context: &ExecutionContext) -> EngineResult<()> {
        let sql = format!(
            "INSERT INTO execution_contexts ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            CONTEXT_COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(&context.id)
            .bind(&context.flow_id)
            .bind(context.flow_version)
            .bind(&context.project_id)
            .bind(&context.subject.user_id)
            .bind(&context.subject.chat_id)
            .bind(context.status.as_str())
            .bind(&context.current_node_id)
            .bind(context.wait_type.as_str())
            .bind(context.wait_deadline.map(|d| d.timestamp_millis()))
            .bind(&context.last_wait_node_id)
            .bind(context.last_wait_type.map(|w| w.as_str()))
            .bind(i64::from(context.step_count))
            .bind(&context.error)
            .bind(stamp(context.created_at))
            .bind(stamp(context.updated_at))
            .bind(context.finished_at.map(stamp))
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(EngineError::AlreadyRunning {
                flow_id: context.flow_id.clone(),
                chat_id: context.subject.chat_id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_context(&self, id: &str) -> EngineResult<Option<ExecutionContext>> {
        let sql = format!("SELECT {} FROM execution_contexts WHERE id = ?", CONTEXT_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_context).transpose()
    }

    /// Current status only; the dispatcher re-checks this before every node
    pub async fn status(&self, id: &str) -> EngineResult<Option<ExecutionStatus>> {
        let row = sqlx::query("SELECT status FROM execution_contexts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let status: String = row.try_get("status")?;
                Ok(ExecutionStatus::parse(&status))
            }
            None => Ok(None),
        }
    }

    /// The running/waiting context of (flow, subject), if any
    pub async fn find_active(&self, flow_id: &str, subject: &Subject) -> EngineResult<Option<ExecutionContext>> {
        let sql = format!(
            "SELECT {} FROM execution_contexts \
             WHERE flow_id = ? AND user_id = ? AND chat_id = ? AND status IN ('running', 'waiting')",
            CONTEXT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(flow_id)
            .bind(&subject.user_id)
            .bind(&subject.chat_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_context).transpose()
    }

    /// Persist progress after a step. Returns false when the context is no longer running.
    pub async fn record_step(&self, id: &str, node_id: &str, step_count: u32) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE execution_contexts
            SET current_node_id = ?, step_count = ?, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(node_id)
        .bind(i64::from(step_count))
        .bind(now_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// running -> waiting
    pub async fn suspend(
        &self,
        id: &str,
        node_id: &str,
        wait_type: WaitType,
        deadline: Option<DateTime<Utc>>,
        step_count: u32,
    ) -> EngineResult<()> {
        let remembered = (wait_type != WaitType::Delay).then_some(wait_type.as_str());
        let result = sqlx::query(
            r#"
            UPDATE execution_contexts
            SET status = 'waiting', current_node_id = ?, wait_type = ?, wait_deadline = ?,
                last_wait_node_id = COALESCE(?, last_wait_node_id),
                last_wait_type = COALESCE(?, last_wait_type),
                step_count = ?, updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(node_id)
        .bind(wait_type.as_str())
        .bind(deadline.map(|d| d.timestamp_millis()))
        .bind(remembered.map(|_| node_id))
        .bind(remembered)
        .bind(i64::from(step_count))
        .bind(now_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(EngineError::ConcurrencyConflict(format!("context {} is no longer running", id)))
        }
    }

    /// Move an active context to a terminal status and archive its session scope.
    /// Returns false when the context was already terminal.
    pub async fn finish(&self, id: &str, status: ExecutionStatus, error: Option<&str>) -> EngineResult<bool> {
        debug_assert!(status.is_terminal());
        let now = now_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE execution_contexts
            SET status = ?, wait_type = 'none', wait_deadline = NULL,
                error = COALESCE(?, error), updated_at = ?, finished_at = ?
            WHERE id = ? AND status IN ('running', 'waiting')
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Ok(false);
        }
        self.archive_session(id).await?;
        Ok(true)
    }

    /// Snapshot session variables into the context row and drop the live scope
    async fn archive_session(&self, id: &str) -> EngineResult<()> {
        let owner = session_key(id);
        let snapshot = self.load_scope(&owner, VariableScope::Session).await?;
        sqlx::query("UPDATE execution_contexts SET final_variables = ? WHERE id = ?")
            .bind(serde_json::to_string(&snapshot)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM variables WHERE owner_key = ? AND scope = 'session'")
            .bind(&owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// running/waiting -> cancelled. Returns false when already terminal.
    pub async fn cancel(&self, id: &str) -> EngineResult<bool> {
        self.finish(id, ExecutionStatus::Cancelled, None).await
    }

    /// Atomically claim the newest waiting context of `subject` whose wait type is
    /// one of `accepted`.
    pub async fn claim_waiting(&self, subject: &Subject, accepted: &[WaitType]) -> EngineResult<Claim> {
        if accepted.is_empty() {
            return Ok(Claim::NoMatch);
        }
        let placeholders = vec!["?"; accepted.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM execution_contexts \
             WHERE chat_id = ? AND user_id = ? AND status = 'waiting' AND wait_type IN ({}) \
             ORDER BY updated_at DESC LIMIT 1",
            CONTEXT_COLUMNS, placeholders
        );
        let mut query = sqlx::query(&sql).bind(&subject.chat_id).bind(&subject.user_id);
        for wait_type in accepted {
            query = query.bind(wait_type.as_str());
        }
        let Some(row) = query.fetch_optional(&self.pool).await? else {
            return Ok(Claim::NoMatch);
        };
        let candidate = row_to_context(&row)?;

        if self.try_claim(&candidate.id, None).await? {
            let wait_type = candidate.wait_type;
            Ok(Claim::Claimed {
                context: self.claimed_copy(candidate),
                wait_type,
            })
        } else {
            Ok(Claim::Lost)
        }
    }

    /// Claim the oldest waiting context whose deadline has passed
    ///
    /// One context per call, so a crash mid-sweep strands at most the one being
    /// processed. A lost race moves on to the next candidate.
    pub async fn claim_next_expired(&self, now: DateTime<Utc>) -> EngineResult<Option<(ExecutionContext, WaitType)>> {
        let sql = format!(
            "SELECT {} FROM execution_contexts \
             WHERE status = 'waiting' AND wait_deadline IS NOT NULL AND wait_deadline <= ? \
             ORDER BY wait_deadline ASC LIMIT 1",
            CONTEXT_COLUMNS
        );
        loop {
            let row = sqlx::query(&sql)
                .bind(now.timestamp_millis())
                .fetch_optional(&self.pool)
                .await?;
            let Some(row) = row else {
                return Ok(None);
            };
            let candidate = row_to_context(&row)?;
            if self.try_claim(&candidate.id, Some(now)).await? {
                let wait_type = candidate.wait_type;
                return Ok(Some((self.claimed_copy(candidate), wait_type)));
            }
        }
    }

    /// Running contexts that have not made progress since `before`
    pub async fn list_stale_running(&self, before: DateTime<Utc>, limit: i64) -> EngineResult<Vec<ExecutionContext>> {
        let sql = format!(
            "SELECT {} FROM execution_contexts WHERE status = 'running' AND updated_at < ? \
             ORDER BY updated_at ASC LIMIT ?",
            CONTEXT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(stamp(before))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_context).collect()
    }

    /// running -> failed, only if the context is still idle since `before`
    pub async fn fail_stale(&self, id: &str, before: DateTime<Utc>, error: &str) -> EngineResult<bool> {
        let now = now_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE execution_contexts
            SET status = 'failed', wait_type = 'none', wait_deadline = NULL,
                error = ?, updated_at = ?, finished_at = ?
            WHERE id = ? AND status = 'running' AND updated_at < ?
            "#,
        )
        .bind(error)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .bind(stamp(before))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Ok(false);
        }
        self.archive_session(id).await?;
        Ok(true)
    }

    /// waiting -> running, exactly once per suspension
    async fn try_claim(&self, id: &str, expired_by: Option<DateTime<Utc>>) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE execution_contexts
            SET status = 'running', wait_type = 'none', wait_deadline = NULL, updated_at = ?
            WHERE id = ? AND status = 'waiting'
              AND (? IS NULL OR (wait_deadline IS NOT NULL AND wait_deadline <= ?))
            "#,
        )
        .bind(now_rfc3339())
        .bind(id)
        .bind(expired_by.map(|d| d.timestamp_millis()))
        .bind(expired_by.map(|d| d.timestamp_millis()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    fn claimed_copy(&self, mut context: ExecutionContext) -> ExecutionContext {
        context.status = ExecutionStatus::Running;
        context.wait_type = WaitType::None;
        context.wait_deadline = None;
        context.updated_at = Utc::now();
        context
    }

    // ---- variables ----

    pub async fn get_variable(&self, owner: &str, scope: VariableScope, name: &str) -> EngineResult<Option<Value>> {
        let row = sqlx::query("SELECT value FROM variables WHERE owner_key = ? AND scope = ? AND name = ?")
            .bind(owner)
            .bind(scope.as_str())
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let raw: String = row.try_get("value")?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    pub async fn set_variable(&self, owner: &str, scope: VariableScope, name: &str, value: &Value) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO variables (owner_key, scope, name, value, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(owner_key, scope, name) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(owner)
        .bind(scope.as_str())
        .bind(name)
        .bind(serde_json::to_string(value)?)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_variable(&self, owner: &str, scope: VariableScope, name: &str) -> EngineResult<()> {
        sqlx::query("DELETE FROM variables WHERE owner_key = ? AND scope = ? AND name = ?")
            .bind(owner)
            .bind(scope.as_str())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_scope(&self, owner: &str, scope: VariableScope) -> EngineResult<Map<String, Value>> {
        let rows = sqlx::query("SELECT name, value FROM variables WHERE owner_key = ? AND scope = ?")
            .bind(owner)
            .bind(scope.as_str())
            .fetch_all(&self.pool)
            .await?;
        let mut map = Map::new();
        for row in rows {
            let raw: String = row.try_get("value")?;
            let name: String = row.try_get("name")?;
            map.insert(name, serde_json::from_str(&raw)?);
        }
        Ok(map)
    }

    /// Session variables of a context, live or archived
    pub async fn session_snapshot(&self, context_id: &str) -> EngineResult<Map<String, Value>> {
        let live = self.load_scope(&session_key(context_id), VariableScope::Session).await?;
        if !live.is_empty() {
            return Ok(live);
        }
        let row = sqlx::query("SELECT final_variables FROM execution_contexts WHERE id = ?")
            .bind(context_id)
            .fetch_optional(&self.pool)
            .await?;
        let archived: Option<String> = match row {
            Some(row) => row.try_get("final_variables")?,
            None => None,
        };
        match archived {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Map::new()),
        }
    }

    // ---- trace feed ----

    pub async fn insert_trace(&self, trace: &StepTrace) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_traces
                (context_id, flow_id, node_id, node_type, step, status, duration_ms, input, output, error, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trace.context_id)
        .bind(&trace.flow_id)
        .bind(&trace.node_id)
        .bind(&trace.node_type)
        .bind(i64::from(trace.step))
        .bind(&trace.status)
        .bind(i64::try_from(trace.duration_ms).unwrap_or(i64::MAX))
        .bind(serde_json::to_string(&trace.input)?)
        .bind(serde_json::to_string(&trace.output)?)
        .bind(&trace.error)
        .bind(trace.recorded_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_traces(&self, context_id: &str) -> EngineResult<Vec<StepTrace>> {
        let rows = sqlx::query(
            r#"
            SELECT context_id, flow_id, node_id, node_type, step, status, duration_ms, input, output, error, recorded_at
            FROM execution_traces WHERE context_id = ? ORDER BY id ASC
            "#,
        )
        .bind(context_id)
        .fetch_all(&self.pool)
        .await?;

        let mut traces = Vec::with_capacity(rows.len());
        for row in rows {
            let input: Option<String> = row.try_get("input")?;
            let output: Option<String> = row.try_get("output")?;
            let recorded_at: String = row.try_get("recorded_at")?;
            let step: i64 = row.try_get("step")?;
            let duration_ms: i64 = row.try_get("duration_ms")?;
            traces.push(StepTrace {
                context_id: row.try_get("context_id")?,
                flow_id: row.try_get("flow_id")?,
                node_id: row.try_get("node_id")?,
                node_type: row.try_get("node_type")?,
                step: u32::try_from(step).unwrap_or(u32::MAX),
                status: row.try_get("status")?,
                duration_ms: u64::try_from(duration_ms).unwrap_or(0),
                input: input.map(|s| serde_json::from_str(&s)).transpose()?.unwrap_or(Value::Null),
                output: output.map(|s| serde_json::from_str(&s)).transpose()?.unwrap_or(Value::Null),
                error: row.try_get("error")?,
                recorded_at: parse_time(&recorded_at)?,
            });
        }
        Ok(traces)
    }

    // ---- recovery bookkeeping ----

    pub async fn record_recovery_attempt(&self, flow_id: &str, subject: &Subject, kind: &str) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO recovery_attempts (flow_id, user_id, chat_id, kind, attempted_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(flow_id)
        .bind(&subject.user_id)
        .bind(&subject.chat_id)
        .bind(kind)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_recovery_attempts(
        &self,
        flow_id: &str,
        subject: &Subject,
        since: DateTime<Utc>,
    ) -> EngineResult<u32> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM recovery_attempts
            WHERE flow_id = ? AND user_id = ? AND chat_id = ? AND attempted_at >= ?
            "#,
        )
        .bind(flow_id)
        .bind(&subject.user_id)
        .bind(&subject.chat_id)
        .bind(since.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(u32::try_from(n).unwrap_or(u32::MAX))
    }

    // ---- effect ledger ----

    /// Result recorded for an effect key, if the effect already ran
    pub async fn get_effect(&self, key: &str) -> EngineResult<Option<Value>> {
        let row = sqlx::query("SELECT result FROM effect_ledger WHERE effect_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let raw: String = row.try_get("result")?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    pub async fn put_effect(&self, key: &str, result: &Value) -> EngineResult<()> {
        sqlx::query("INSERT OR IGNORE INTO effect_ledger (effect_key, result, created_at) VALUES (?, ?, ?)")
            .bind(key)
            .bind(serde_json::to_string(result)?)
            .bind(now_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Database;
    use serde_json::json;

    fn context(id: &str, flow_id: &str, subject: &Subject) -> ExecutionContext {
        let now = Utc::now();
        ExecutionContext {
            id: id.into(),
            flow_id: flow_id.into(),
            flow_version: 1,
            project_id: "default".into(),
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

    async fn store() -> ContextStore {
        ContextStore::new(Database::in_memory().await.unwrap().pool().clone())
    }

    #[tokio::test]
    async fn a_suspension_can_be_claimed_only_once() {
        let store = store().await;
        let subject = Subject::new("u", "c");
        store.insert_context(&context("a", "f", &subject)).await.unwrap();
        store.suspend("a", "ask", WaitType::Input, None, 3).await.unwrap();

        let first = store.claim_waiting(&subject, &[WaitType::Input]).await.unwrap();
        let second = store.claim_waiting(&subject, &[WaitType::Input]).await.unwrap();
        assert!(matches!(first, Claim::Claimed { wait_type: WaitType::Input, .. }));
        assert!(matches!(second, Claim::NoMatch));
    }

    #[tokio::test]
    async fn wait_type_must_be_compatible() {
        let store = store().await;
        let subject = Subject::new("u", "c");
        store.insert_context(&context("a", "f", &subject)).await.unwrap();
        store.suspend("a", "ask", WaitType::Contact, None, 1).await.unwrap();

        assert!(matches!(
            store.claim_waiting(&subject, &[WaitType::Callback]).await.unwrap(),
            Claim::NoMatch
        ));
        assert!(matches!(
            store.claim_waiting(&Subject::new("other", "c"), &[WaitType::Contact]).await.unwrap(),
            Claim::NoMatch
        ));
    }

    #[tokio::test]
    async fn terminal_contexts_stay_terminal_and_free_the_subject() {
        let store = store().await;
        let subject = Subject::new("u", "c");
        store.insert_context(&context("a", "f", &subject)).await.unwrap();
        store.set_variable("ctx:a", VariableScope::Session, "x", &json!(1)).await.unwrap();

        assert!(store.finish("a", ExecutionStatus::Completed, None).await.unwrap());
        assert!(!store.cancel("a").await.unwrap());
        assert_eq!(store.status("a").await.unwrap(), Some(ExecutionStatus::Completed));
        assert!(store.load_scope("ctx:a", VariableScope::Session).await.unwrap().is_empty());
        assert_eq!(store.session_snapshot("a").await.unwrap().get("x"), Some(&json!(1)));

        store.insert_context(&context("b", "f", &subject)).await.expect("slot is free again");
    }

    #[tokio::test]
    async fn expired_waits_are_claimed_by_deadline() {
        let store = store().await;
        let subject = Subject::new("u", "c");
        store.insert_context(&context("a", "f", &subject)).await.unwrap();
        let past = Utc::now() - chrono::Duration::seconds(5);
        store.suspend("a", "pause", WaitType::Delay, Some(past), 1).await.unwrap();

        let (claimed, wait_type) = store.claim_next_expired(Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, "a");
        assert_eq!(wait_type, WaitType::Delay);
        assert!(store.claim_next_expired(Utc::now()).await.unwrap().is_none());
        // Delay waits are not remembered as re-prompt targets
        let ctx = store.get_context("a").await.unwrap().unwrap();
        assert!(ctx.last_wait_node_id.is_none());
    }

    #[tokio::test]
    async fn numeric_variables_read_back_as_numbers() {
        let store = store().await;
        store.set_variable("ctx:a", VariableScope::Session, "amount", &json!(150)).await.unwrap();
        store.set_variable("ctx:a", VariableScope::Session, "ratio", &json!(0.5)).await.unwrap();
        store.set_variable("ctx:a", VariableScope::Session, "code", &json!("0042")).await.unwrap();

        assert_eq!(
            store.get_variable("ctx:a", VariableScope::Session, "amount").await.unwrap(),
            Some(json!(150))
        );
        let scope = store.load_scope("ctx:a", VariableScope::Session).await.unwrap();
        assert_eq!(scope.get("ratio"), Some(&json!(0.5)));
        assert_eq!(scope.get("code"), Some(&json!("0042")));
    }

    #[tokio::test]
    async fn only_idle_running_contexts_are_reaped() {
        let store = store().await;
        let subject = Subject::new("u", "c");
        store.insert_context(&context("a", "f", &subject)).await.unwrap();
        store.insert_context(&context("b", "g", &subject)).await.unwrap();
        store.suspend("b", "ask", WaitType::Input, None, 1).await.unwrap();

        let before = Utc::now() + chrono::Duration::seconds(1);
        let stale = store.list_stale_running(before, 10).await.unwrap();
        assert_eq!(stale.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), vec!["a"]);

        // Progress after the cutoff keeps a context alive
        assert!(!store.fail_stale("a", Utc::now() - chrono::Duration::seconds(60), "stale").await.unwrap());
        assert!(store.fail_stale("a", before, "stale").await.unwrap());
        assert_eq!(store.status("a").await.unwrap(), Some(ExecutionStatus::Failed));
        store.insert_context(&context("c", "f", &subject)).await.expect("subject is free again");
    }

    #[tokio::test]
    async fn effects_are_recorded_once() {
        let store = store().await;
        store.put_effect("k", &json!({"charged": 1})).await.unwrap();
        store.put_effect("k", &json!({"charged": 2})).await.unwrap();
        assert_eq!(store.get_effect("k").await.unwrap(), Some(json!({"charged": 1})));
    }
}
