/// Engine database bootstrap
///
/// Opens the SQLite pool and creates every table the engine needs:
/// - flows: immutable flow versions (JSON definitions)
/// - projects: per-project settings such as the fallback flow
/// - execution_contexts: live and archived executions, one row each
/// - variables: session (keyed by context) and persistent (keyed by subject) values
/// - execution_traces: step-level trace feed
/// - recovery_attempts: rolling-window recovery cap bookkeeping
/// - effect_ledger: dedupe keys for non-idempotent handler effects
/// - subjects: subject directory used to match shared contacts

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// Owner of the engine connection pool
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to `url`, creating the database file if missing, and initialize the schema
    pub async fn connect(url: &str) -> Result<Self> {
        if let Some(path) = url.strip_prefix("sqlite://") {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        anyhow::anyhow!("Failed to create database directory '{}': {}", parent.display(), e)
                    })?;
                }
            }
        }

        tracing::info!("🗄️ Opening engine database: {}", url);
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init_schema().await?;
        tracing::info!("✅ Engine database ready");
        Ok(db)
    }

    /// Private in-memory database on a single connection (tests, ephemeral runs)
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create all tables and indexes. Safe to call multiple times.
    async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS flows (
                id TEXT NOT NULL,
                version INTEGER NOT NULL,
                name TEXT NOT NULL,
                project_id TEXT NOT NULL,
                definition TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (id, version)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                fallback_flow_id TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS execution_contexts (
                id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL,
                flow_version INTEGER NOT NULL,
                project_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                status TEXT NOT NULL,
                current_node_id TEXT,
                wait_type TEXT NOT NULL DEFAULT 'none',
                wait_deadline INTEGER,
                last_wait_node_id TEXT,
                last_wait_type TEXT,
                step_count INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                final_variables TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                finished_at TEXT
            )
            "#,
            // At most one running/waiting context per (flow, subject)
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_contexts_one_active
            ON execution_contexts(flow_id, user_id, chat_id)
            WHERE status IN ('running', 'waiting')
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_contexts_waiting
            ON execution_contexts(chat_id, status, wait_type)
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_contexts_deadline
            ON execution_contexts(status, wait_deadline)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS variables (
                owner_key TEXT NOT NULL,
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (owner_key, scope, name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS execution_traces (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                context_id TEXT NOT NULL,
                flow_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                node_type TEXT NOT NULL,
                step INTEGER NOT NULL,
                status TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                input TEXT,
                output TEXT,
                error TEXT,
                recorded_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_traces_context ON execution_traces(context_id, id)",
            r#"
            CREATE TABLE IF NOT EXISTS recovery_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                flow_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                chat_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                attempted_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_recovery_subject
            ON recovery_attempts(flow_id, user_id, chat_id, attempted_at)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS effect_ledger (
                effect_key TEXT PRIMARY KEY,
                result TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS subjects (
                id TEXT PRIMARY KEY,
                platform_user_id TEXT UNIQUE,
                phone TEXT,
                display_name TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_subjects_phone ON subjects(phone)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }
}
