//! Row types for the relational store.
//!
//! Paths and metadata bags are TEXT columns; accessors expose them as
//! `PathBuf` and JSON maps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;
use std::path::PathBuf;

/// A registered command: a prompt template file in the repo.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandSpec {
    pub path: String,
    #[serde(default)]
    pub description: String,
}

/// A known repository.
#[derive(Debug, Clone, FromRow)]
pub struct Codebase {
    pub id: String,
    pub name: String,
    /// Canonicalized remote URL, without a trailing `.git`.
    pub remote_url: String,
    /// Canonical working-copy path. Never a worktree path.
    pub default_cwd: String,
    pub assistant_type: String,
    /// JSON map of command name to [`CommandSpec`].
    pub commands: String,
    pub created_at: DateTime<Utc>,
}

impl Codebase {
    pub fn default_cwd_path(&self) -> PathBuf {
        PathBuf::from(&self.default_cwd)
    }

    pub fn command_registry(&self) -> HashMap<String, CommandSpec> {
        serde_json::from_str(&self.commands).unwrap_or_default()
    }
}

/// A bound platform conversation.
#[derive(Debug, Clone, FromRow)]
pub struct Conversation {
    pub id: String,
    pub platform_type: String,
    pub platform_conversation_id: String,
    pub codebase_id: Option<String>,
    pub cwd: Option<String>,
    /// Locked at creation; never changes for the life of the conversation.
    pub assistant_type: String,
    pub parent_conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn cwd_path(&self) -> Option<PathBuf> {
        self.cwd.as_ref().map(PathBuf::from)
    }
}

/// One assistant subprocess context.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Session {
    pub id: String,
    pub conversation_id: String,
    pub codebase_id: String,
    pub assistant_type: String,
    /// Opaque resume token from the assistant SDK. Never parsed.
    pub assistant_session_id: Option<String>,
    pub active: bool,
    /// JSON bag; `lastCommand` drives the plan/execute transition rule.
    pub metadata: String,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn metadata_map(&self) -> HashMap<String, serde_json::Value> {
        serde_json::from_str(&self.metadata).unwrap_or_default()
    }

    pub fn last_command(&self) -> Option<String> {
        self.metadata_map()
            .get("lastCommand")
            .and_then(|v| v.as_str().map(String::from))
    }
}

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowRunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// One in-flight or completed workflow invocation.
#[derive(Debug, Clone, FromRow)]
pub struct WorkflowRun {
    pub id: String,
    pub conversation_id: String,
    pub codebase_id: String,
    pub workflow_name: String,
    pub trigger_message: String,
    pub status: String,
    pub metadata: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn run_status(&self) -> Option<WorkflowRunStatus> {
        WorkflowRunStatus::parse(&self.status)
    }

    pub fn metadata_map(&self) -> HashMap<String, serde_json::Value> {
        serde_json::from_str(&self.metadata).unwrap_or_default()
    }
}

/// Status of an isolation environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    Active,
    Destroyed,
}

impl EnvironmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Destroyed => "destroyed",
        }
    }
}

/// One isolated working directory.
#[derive(Debug, Clone, FromRow)]
pub struct IsolationEnvironment {
    pub id: String,
    pub codebase_id: String,
    /// Backend tag (`worktree` today).
    pub provider_type: String,
    pub workflow_type: String,
    pub workflow_identifier: String,
    pub working_path: String,
    pub branch_name: String,
    pub status: String,
    pub platform_type: String,
    pub metadata: String,
    pub created_at: DateTime<Utc>,
}

impl IsolationEnvironment {
    pub fn working_path_buf(&self) -> PathBuf {
        PathBuf::from(&self.working_path)
    }

    pub fn is_active(&self) -> bool {
        self.status == EnvironmentStatus::Active.as_str()
    }

    pub fn metadata_map(&self) -> HashMap<String, serde_json::Value> {
        serde_json::from_str(&self.metadata).unwrap_or_default()
    }

    pub fn was_adopted(&self) -> bool {
        self.metadata_map()
            .get("adopted")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}
