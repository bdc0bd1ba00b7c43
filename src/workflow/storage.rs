/// SQLite persistence layer for flow storage
///
/// Every save creates a new immutable version; executions pin to the version they
/// started on, so stored versions are never updated in place.

use crate::workflow::types::FlowGraph;
use anyhow::Result;
use sqlx::{sqlite::SqlitePool, Row};

/// SQLite-based flow storage manager
#[derive(Debug, Clone)]
pub struct FlowStorage {
    /// SQLite connection pool for the engine database
    pool: SqlitePool,
}

/// Basic flow metadata for listing operations
#[derive(Debug, serde::Serialize)]
pub struct FlowMetadata {
    pub id: String,
    pub name: String,
    pub project_id: String,
    pub latest_version: i64,
    pub updated_at: String,
}

impl FlowStorage {
    /// Create new storage instance with database connection
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a flow as a new version and return the assigned version number
    ///
    /// The `version` field of the passed graph is ignored; the stored copy carries
    /// the assigned one.
    pub async fn save_flow(&self, flow: &FlowGraph) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let current: Option<i64> = sqlx::query("SELECT MAX(version) AS v FROM flows WHERE id = ?")
            .bind(&flow.id)
            .fetch_one(&mut *tx)
            .await?
            .get("v");
        let version = current.unwrap_or(0) + 1;

        let mut stored = flow.clone();
        stored.version = version;
        let definition_json = serde_json::to_string(&stored)?;

        sqlx::query(
            r#"
            INSERT INTO flows (id, version, name, project_id, definition, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&stored.id)
        .bind(version)
        .bind(&stored.name)
        .bind(&stored.project_id)
        .bind(&definition_json)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!("💾 Stored flow '{}' as version {}", flow.id, version);
        Ok(version)
    }

    /// Retrieve one exact version
    pub async fn get_flow_version(&self, id: &str, version: i64) -> Result<Option<FlowGraph>> {
        let row = sqlx::query("SELECT definition FROM flows WHERE id = ? AND version = ?")
            .bind(id)
            .bind(version)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition_json)?))
            }
            None => Ok(None),
        }
    }

    /// Retrieve the latest version of a flow
    pub async fn get_latest_flow(&self, id: &str) -> Result<Option<FlowGraph>> {
        let row = sqlx::query(
            "SELECT definition FROM flows WHERE id = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition_json)?))
            }
            None => Ok(None),
        }
    }

    /// List flows with their latest version
    pub async fn list_flows(&self) -> Result<Vec<FlowMetadata>> {
        let rows = sqlx::query(
            r#"
            SELECT f.id, f.name, f.project_id, f.version, f.created_at
            FROM flows f
            JOIN (SELECT id, MAX(version) AS version FROM flows GROUP BY id) latest
              ON latest.id = f.id AND latest.version = f.version
            ORDER BY f.created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| FlowMetadata {
                id: row.get("id"),
                name: row.get("name"),
                project_id: row.get("project_id"),
                latest_version: row.get("version"),
                updated_at: row.get("created_at"),
            })
            .collect())
    }

    /// Load the latest version of every flow for registry initialization
    pub async fn load_latest_flows(&self) -> Result<Vec<FlowGraph>> {
        let rows = sqlx::query(
            r#"
            SELECT f.definition
            FROM flows f
            JOIN (SELECT id, MAX(version) AS version FROM flows GROUP BY id) latest
              ON latest.id = f.id AND latest.version = f.version
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut flows = Vec::with_capacity(rows.len());
        for row in rows {
            let definition_json: String = row.get("definition");
            flows.push(serde_json::from_str(&definition_json)?);
        }
        Ok(flows)
    }

    /// Delete every version of a flow
    pub async fn delete_flow(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM flows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
