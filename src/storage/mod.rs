//! Relational store over SQLite.
//!
//! Invariants live in the schema, not application checks: a partial unique
//! index keeps at most one active session per conversation, another keeps at
//! most one running workflow run per conversation, and the platform key pair
//! is unique across conversations. Session creation is a
//! deactivate-then-insert transaction so the index can never be raced.

mod models;

pub use models::{
    Codebase, CommandSpec, Conversation, EnvironmentStatus, IsolationEnvironment, Session,
    WorkflowRun, WorkflowRunStatus,
};

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ArchonError, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS codebases (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    remote_url TEXT NOT NULL UNIQUE,
    default_cwd TEXT NOT NULL,
    assistant_type TEXT NOT NULL,
    commands TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    platform_type TEXT NOT NULL,
    platform_conversation_id TEXT NOT NULL,
    codebase_id TEXT REFERENCES codebases(id),
    cwd TEXT,
    assistant_type TEXT NOT NULL,
    parent_conversation_id TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (platform_type, platform_conversation_id)
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    codebase_id TEXT NOT NULL,
    assistant_type TEXT NOT NULL,
    assistant_session_id TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_active
    ON sessions(conversation_id) WHERE active = 1;

CREATE TABLE IF NOT EXISTS workflow_runs (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    codebase_id TEXT NOT NULL,
    workflow_name TEXT NOT NULL,
    trigger_message TEXT NOT NULL,
    status TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_workflow_runs_one_running
    ON workflow_runs(conversation_id) WHERE status = 'running';

CREATE TABLE IF NOT EXISTS isolation_environments (
    id TEXT PRIMARY KEY,
    codebase_id TEXT NOT NULL,
    provider_type TEXT NOT NULL,
    workflow_type TEXT NOT NULL,
    workflow_identifier TEXT NOT NULL,
    working_path TEXT NOT NULL,
    branch_name TEXT NOT NULL,
    status TEXT NOT NULL,
    platform_type TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_isolation_codebase
    ON isolation_environments(codebase_id);
"#;

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Handle to the relational store. Cheap to clone; all clones share the pool.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database file and bootstrap the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        info!("opened store at {}", path.display());
        Ok(store)
    }

    /// In-memory store for tests. Pinned to a single connection so the
    /// database survives for the pool's lifetime.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<()> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ----- codebases -----

    pub async fn create_codebase(
        &self,
        name: &str,
        remote_url: &str,
        default_cwd: &str,
        assistant_type: &str,
    ) -> Result<Codebase> {
        let id = new_id();
        sqlx::query(
            "INSERT INTO codebases (id, name, remote_url, default_cwd, assistant_type, commands, created_at)
             VALUES (?, ?, ?, ?, ?, '{}', ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(remote_url)
        .bind(default_cwd)
        .bind(assistant_type)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        self.get_codebase(&id)
            .await?
            .ok_or_else(|| ArchonError::not_found("codebase", id))
    }

    pub async fn get_codebase(&self, id: &str) -> Result<Option<Codebase>> {
        Ok(sqlx::query_as::<_, Codebase>("SELECT * FROM codebases WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn find_codebase_by_url(&self, remote_url: &str) -> Result<Option<Codebase>> {
        Ok(
            sqlx::query_as::<_, Codebase>("SELECT * FROM codebases WHERE remote_url = ?")
                .bind(remote_url)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn find_codebase_by_name(&self, name: &str) -> Result<Option<Codebase>> {
        Ok(
            sqlx::query_as::<_, Codebase>("SELECT * FROM codebases WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn list_codebases(&self) -> Result<Vec<Codebase>> {
        Ok(
            sqlx::query_as::<_, Codebase>("SELECT * FROM codebases ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Correct a stale canonical path in place.
    pub async fn update_codebase_default_cwd(&self, id: &str, default_cwd: &str) -> Result<()> {
        sqlx::query("UPDATE codebases SET default_cwd = ? WHERE id = ?")
            .bind(default_cwd)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_codebase_commands(
        &self,
        id: &str,
        commands: &HashMap<String, CommandSpec>,
    ) -> Result<()> {
        sqlx::query("UPDATE codebases SET commands = ? WHERE id = ?")
            .bind(serde_json::to_string(commands)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ----- conversations -----

    /// Idempotent get-or-create by platform key.
    pub async fn get_or_create_conversation(
        &self,
        platform_type: &str,
        platform_conversation_id: &str,
        assistant_type: &str,
    ) -> Result<Conversation> {
        sqlx::query(
            "INSERT INTO conversations (id, platform_type, platform_conversation_id, assistant_type, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (platform_type, platform_conversation_id) DO NOTHING",
        )
        .bind(new_id())
        .bind(platform_type)
        .bind(platform_conversation_id)
        .bind(assistant_type)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let conversation = sqlx::query_as::<_, Conversation>(
            "SELECT * FROM conversations WHERE platform_type = ? AND platform_conversation_id = ?",
        )
        .bind(platform_type)
        .bind(platform_conversation_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(conversation)
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        Ok(
            sqlx::query_as::<_, Conversation>("SELECT * FROM conversations WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// Bind the conversation to a codebase and reset its cwd to the default.
    pub async fn set_conversation_codebase(&self, id: &str, codebase_id: &str) -> Result<()> {
        sqlx::query("UPDATE conversations SET codebase_id = ?, cwd = NULL WHERE id = ?")
            .bind(codebase_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Point the conversation at a working directory. `None` restores the
    /// codebase default.
    pub async fn set_conversation_cwd(&self, id: &str, cwd: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE conversations SET cwd = ? WHERE id = ?")
            .bind(cwd)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// How many conversations currently point at this working directory.
    pub async fn count_conversations_with_cwd(&self, cwd: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM conversations WHERE cwd = ?")
                .bind(cwd)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Clear the cwd of every conversation pointing at `cwd`.
    pub async fn clear_cwd_references(&self, cwd: &str) -> Result<u64> {
        let result = sqlx::query("UPDATE conversations SET cwd = NULL WHERE cwd = ?")
            .bind(cwd)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ----- sessions -----

    pub async fn active_session(&self, conversation_id: &str) -> Result<Option<Session>> {
        Ok(sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE conversation_id = ? AND active = 1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        Ok(sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Create a new active session, deactivating any existing active session
    /// for the conversation in the same transaction.
    pub async fn create_session(
        &self,
        conversation_id: &str,
        codebase_id: &str,
        assistant_type: &str,
    ) -> Result<Session> {
        let id = new_id();
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE sessions SET active = 0 WHERE conversation_id = ? AND active = 1")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO sessions (id, conversation_id, codebase_id, assistant_type, active, metadata, created_at)
             VALUES (?, ?, ?, ?, 1, '{}', ?)",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(codebase_id)
        .bind(assistant_type)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!("created session {} for conversation {}", id, conversation_id);
        self.get_session(&id)
            .await?
            .ok_or_else(|| ArchonError::not_found("session", id))
    }

    pub async fn set_assistant_session_id(
        &self,
        session_id: &str,
        assistant_session_id: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE sessions SET assistant_session_id = ? WHERE id = ?")
            .bind(assistant_session_id)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Merge keys into the session metadata bag.
    pub async fn merge_session_metadata(
        &self,
        session_id: &str,
        patch: &HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let current: Option<(String,)> =
            sqlx::query_as("SELECT metadata FROM sessions WHERE id = ?")
                .bind(session_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((current,)) = current else {
            return Err(ArchonError::not_found("session", session_id));
        };
        let mut map: HashMap<String, serde_json::Value> =
            serde_json::from_str(&current).unwrap_or_default();
        map.extend(patch.iter().map(|(k, v)| (k.clone(), v.clone())));
        sqlx::query("UPDATE sessions SET metadata = ? WHERE id = ?")
            .bind(serde_json::to_string(&map)?)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Idempotent: deactivating an already-inactive session is a no-op.
    pub async fn deactivate_session(&self, session_id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET active = 0 WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ----- workflow runs -----

    /// Create a running workflow run. Fails with a busy error when another
    /// run is already running for the conversation (partial unique index).
    pub async fn create_workflow_run(
        &self,
        conversation_id: &str,
        codebase_id: &str,
        workflow_name: &str,
        trigger_message: &str,
        metadata: &HashMap<String, serde_json::Value>,
    ) -> Result<WorkflowRun> {
        let id = new_id();
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO workflow_runs (id, conversation_id, codebase_id, workflow_name, trigger_message, status, metadata, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, 'running', ?, ?, ?)",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(codebase_id)
        .bind(workflow_name)
        .bind(trigger_message)
        .bind(serde_json::to_string(metadata)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => self
                .get_workflow_run(&id)
                .await?
                .ok_or_else(|| ArchonError::not_found("workflow run", id)),
            Err(e) if is_unique_violation(&e) => Err(ArchonError::busy(
                "a workflow is already running for this conversation",
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_workflow_run(&self, id: &str) -> Result<Option<WorkflowRun>> {
        Ok(
            sqlx::query_as::<_, WorkflowRun>("SELECT * FROM workflow_runs WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn running_workflow_run(
        &self,
        conversation_id: &str,
    ) -> Result<Option<WorkflowRun>> {
        Ok(sqlx::query_as::<_, WorkflowRun>(
            "SELECT * FROM workflow_runs WHERE conversation_id = ? AND status = 'running'",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn set_workflow_run_status(
        &self,
        id: &str,
        status: WorkflowRunStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE workflow_runs SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn merge_workflow_run_metadata(
        &self,
        id: &str,
        patch: &HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let current: Option<(String,)> =
            sqlx::query_as("SELECT metadata FROM workflow_runs WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((current,)) = current else {
            return Err(ArchonError::not_found("workflow run", id));
        };
        let mut map: HashMap<String, serde_json::Value> =
            serde_json::from_str(&current).unwrap_or_default();
        map.extend(patch.iter().map(|(k, v)| (k.clone(), v.clone())));
        sqlx::query("UPDATE workflow_runs SET metadata = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(&map)?)
            .bind(Utc::now())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Reconcile runs left `running` by a dead process to `failed`. Called
    /// while hydrating a conversation, before any new dispatch.
    pub async fn fail_abandoned_runs(&self, conversation_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE workflow_runs
             SET status = 'failed',
                 metadata = json_set(metadata, '$.exitReason', 'abandoned'),
                 updated_at = ?
             WHERE conversation_id = ? AND status = 'running'",
        )
        .bind(Utc::now())
        .bind(conversation_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ----- isolation environments -----

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_environment(
        &self,
        codebase_id: &str,
        provider_type: &str,
        workflow_type: &str,
        workflow_identifier: &str,
        working_path: &str,
        branch_name: &str,
        platform_type: &str,
        metadata: &HashMap<String, serde_json::Value>,
    ) -> Result<IsolationEnvironment> {
        let id = new_id();
        sqlx::query(
            "INSERT INTO isolation_environments
             (id, codebase_id, provider_type, workflow_type, workflow_identifier, working_path, branch_name, status, platform_type, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'active', ?, ?, ?)",
        )
        .bind(&id)
        .bind(codebase_id)
        .bind(provider_type)
        .bind(workflow_type)
        .bind(workflow_identifier)
        .bind(working_path)
        .bind(branch_name)
        .bind(platform_type)
        .bind(serde_json::to_string(metadata)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        self.get_environment(&id)
            .await?
            .ok_or_else(|| ArchonError::not_found("isolation environment", id))
    }

    pub async fn get_environment(&self, id: &str) -> Result<Option<IsolationEnvironment>> {
        Ok(sqlx::query_as::<_, IsolationEnvironment>(
            "SELECT * FROM isolation_environments WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn find_active_environment_by_path(
        &self,
        working_path: &str,
    ) -> Result<Option<IsolationEnvironment>> {
        Ok(sqlx::query_as::<_, IsolationEnvironment>(
            "SELECT * FROM isolation_environments WHERE working_path = ? AND status = 'active'",
        )
        .bind(working_path)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn list_active_environments(
        &self,
        codebase_id: Option<&str>,
    ) -> Result<Vec<IsolationEnvironment>> {
        let rows = match codebase_id {
            Some(codebase_id) => {
                sqlx::query_as::<_, IsolationEnvironment>(
                    "SELECT * FROM isolation_environments
                     WHERE codebase_id = ? AND status = 'active' ORDER BY created_at",
                )
                .bind(codebase_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, IsolationEnvironment>(
                    "SELECT * FROM isolation_environments WHERE status = 'active' ORDER BY created_at",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    pub async fn count_active_environments(&self, codebase_id: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM isolation_environments WHERE codebase_id = ? AND status = 'active'",
        )
        .bind(codebase_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Merge keys into an environment's metadata bag.
    pub async fn merge_environment_metadata(
        &self,
        id: &str,
        patch: &HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let current: Option<(String,)> =
            sqlx::query_as("SELECT metadata FROM isolation_environments WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((current,)) = current else {
            return Err(ArchonError::not_found("isolation environment", id));
        };
        let mut map: HashMap<String, serde_json::Value> =
            serde_json::from_str(&current).unwrap_or_default();
        map.extend(patch.iter().map(|(k, v)| (k.clone(), v.clone())));
        sqlx::query("UPDATE isolation_environments SET metadata = ? WHERE id = ?")
            .bind(serde_json::to_string(&map)?)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Soft-delete. Idempotent.
    pub async fn mark_environment_destroyed(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE isolation_environments SET status = 'destroyed' WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn conversation_get_or_create_is_idempotent() {
        let store = Store::in_memory().await.unwrap();
        let a = store
            .get_or_create_conversation("github", "issue-1", "claude")
            .await
            .unwrap();
        let b = store
            .get_or_create_conversation("github", "issue-1", "codex")
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        // The assistant type is locked at creation.
        assert_eq!(b.assistant_type, "claude");
    }

    #[tokio::test]
    async fn one_active_session_per_conversation() {
        let store = Store::in_memory().await.unwrap();
        let conv = store
            .get_or_create_conversation("telegram", "chat-9", "claude")
            .await
            .unwrap();
        let cb = store
            .create_codebase("o/r", "https://github.com/o/r", "/tmp/o/r", "claude")
            .await
            .unwrap();

        let s1 = store.create_session(&conv.id, &cb.id, "claude").await.unwrap();
        assert!(s1.active);

        let s2 = store.create_session(&conv.id, &cb.id, "claude").await.unwrap();
        assert!(s2.active);

        let s1 = store.get_session(&s1.id).await.unwrap().unwrap();
        assert!(!s1.active);

        let active = store.active_session(&conv.id).await.unwrap().unwrap();
        assert_eq!(active.id, s2.id);
    }

    #[tokio::test]
    async fn second_running_workflow_is_rejected() {
        let store = Store::in_memory().await.unwrap();
        let conv = store
            .get_or_create_conversation("github", "pr-3", "claude")
            .await
            .unwrap();
        let meta = HashMap::new();

        let run = store
            .create_workflow_run(&conv.id, "cb", "implement", "do it", &meta)
            .await
            .unwrap();
        assert_eq!(run.run_status(), Some(WorkflowRunStatus::Running));

        let err = store
            .create_workflow_run(&conv.id, "cb", "review", "again", &meta)
            .await
            .unwrap_err();
        assert!(matches!(err, ArchonError::Busy { .. }));

        store
            .set_workflow_run_status(&run.id, WorkflowRunStatus::Completed)
            .await
            .unwrap();
        store
            .create_workflow_run(&conv.id, "cb", "review", "again", &meta)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn abandoned_runs_fail_on_reconcile() {
        let store = Store::in_memory().await.unwrap();
        let conv = store
            .get_or_create_conversation("github", "issue-8", "claude")
            .await
            .unwrap();
        let run = store
            .create_workflow_run(&conv.id, "cb", "implement", "x", &HashMap::new())
            .await
            .unwrap();

        assert_eq!(store.fail_abandoned_runs(&conv.id).await.unwrap(), 1);
        let run = store.get_workflow_run(&run.id).await.unwrap().unwrap();
        assert_eq!(run.run_status(), Some(WorkflowRunStatus::Failed));
        assert_eq!(
            run.metadata_map().get("exitReason").and_then(|v| v.as_str()),
            Some("abandoned")
        );
    }

    #[tokio::test]
    async fn session_metadata_merge_preserves_existing_keys() {
        let store = Store::in_memory().await.unwrap();
        let conv = store
            .get_or_create_conversation("console", "local", "claude")
            .await
            .unwrap();
        let session = store.create_session(&conv.id, "cb", "claude").await.unwrap();

        let mut patch = HashMap::new();
        patch.insert("lastCommand".to_string(), serde_json::json!("plan-feature"));
        store.merge_session_metadata(&session.id, &patch).await.unwrap();

        let mut patch = HashMap::new();
        patch.insert("other".to_string(), serde_json::json!(1));
        store.merge_session_metadata(&session.id, &patch).await.unwrap();

        let session = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(session.last_command().as_deref(), Some("plan-feature"));
        assert_eq!(session.metadata_map().get("other"), Some(&serde_json::json!(1)));
    }

    #[tokio::test]
    async fn destroyed_environment_clears_cwd_references() {
        let store = Store::in_memory().await.unwrap();
        let conv = store
            .get_or_create_conversation("github", "issue-2", "claude")
            .await
            .unwrap();
        let env = store
            .insert_environment(
                "cb",
                "worktree",
                "issue",
                "2",
                "/worktrees/o/r/issue-2",
                "issue-2",
                "github",
                &HashMap::new(),
            )
            .await
            .unwrap();
        store
            .set_conversation_cwd(&conv.id, Some(&env.working_path))
            .await
            .unwrap();

        store.mark_environment_destroyed(&env.id).await.unwrap();
        store.clear_cwd_references(&env.working_path).await.unwrap();

        let conv = store.get_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(conv.cwd, None);
        let env = store.get_environment(&env.id).await.unwrap().unwrap();
        assert!(!env.is_active());
    }
}
