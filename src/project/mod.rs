/// Project management module
///
/// Handles the engine database bootstrap and project-level settings such as the
/// fallback flow used by error recovery.

pub mod database;
pub mod types;

pub use database::Database;
pub use types::Project;

use anyhow::Result;
use sqlx::{sqlite::SqlitePool, Row};

/// Project settings persistence
#[derive(Debug, Clone)]
pub struct ProjectStore {
    pool: SqlitePool,
}

impl ProjectStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load a project; unknown projects come back with default settings
    pub async fn get_project(&self, id: &str) -> Result<Project> {
        let row = sqlx::query("SELECT fallback_flow_id FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(Project {
            id: id.to_string(),
            fallback_flow_id: row.and_then(|r| r.get::<Option<String>, _>("fallback_flow_id")),
        })
    }

    /// Register (or clear with `None`) the fallback flow of a project
    pub async fn set_fallback_flow(&self, project_id: &str, flow_id: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, fallback_flow_id, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                fallback_flow_id = excluded.fallback_flow_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(project_id)
        .bind(flow_id)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::info!("🛟 Fallback flow for project '{}' set to {:?}", project_id, flow_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fallback_flow_round_trips_and_clears() {
        let db = Database::in_memory().await.unwrap();
        let store = ProjectStore::new(db.pool().clone());

        assert_eq!(store.get_project("bot").await.unwrap(), Project::new("bot"));

        store.set_fallback_flow("bot", Some("help-desk")).await.unwrap();
        let project = store.get_project("bot").await.unwrap();
        assert_eq!(project.fallback_flow_id.as_deref(), Some("help-desk"));

        store.set_fallback_flow("bot", None).await.unwrap();
        assert!(store.get_project("bot").await.unwrap().fallback_flow_id.is_none());
    }
}
