//! Per-conversation isolated working directories.
//!
//! Only a git-worktree backend exists today, but the provider interface is
//! stable across create/destroy/get/list/health-check and carries a provider
//! tag so container or VM backends can slot in later.

pub mod cleanup;
pub mod worktree;

pub use cleanup::{CleanupScheduler, SweepReport};
pub use worktree::WorktreeProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::storage::IsolationEnvironment;

/// What kind of platform workflow an environment serves. Drives branch
/// naming and the creation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    Issue,
    Pr,
    Review,
    Thread,
    Task,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Pr => "pr",
            Self::Review => "review",
            Self::Thread => "thread",
            Self::Task => "task",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "issue" => Some(Self::Issue),
            "pr" => Some(Self::Pr),
            "review" => Some(Self::Review),
            "thread" => Some(Self::Thread),
            "task" => Some(Self::Task),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to provision an isolated working directory.
#[derive(Debug, Clone)]
pub struct IsolationRequest {
    pub codebase_id: String,
    pub canonical_repo_path: PathBuf,
    pub workflow_type: WorkflowType,
    /// Issue/PR number, thread id, or task title.
    pub identifier: String,
    pub pr_branch: Option<String>,
    pub pr_sha: Option<String>,
    pub is_fork_pr: bool,
    pub platform_type: String,
}

/// Options for tearing an environment down.
#[derive(Debug, Clone, Default)]
pub struct DestroyOptions {
    pub force: bool,
    /// Branch to delete after removal; defaults to the environment's branch.
    pub branch_name: Option<String>,
    /// Canonical repo to run git against; defaults to the codebase's path.
    pub canonical_repo_path: Option<PathBuf>,
}

/// Result of probing one environment.
#[derive(Debug, Clone)]
pub struct EnvironmentHealth {
    pub path_exists: bool,
    pub registered_worktree: bool,
}

impl EnvironmentHealth {
    pub fn is_healthy(&self) -> bool {
        self.path_exists && self.registered_worktree
    }
}

/// Backend-agnostic isolation provider.
#[async_trait]
pub trait IsolationProvider: Send + Sync {
    /// Backend tag stored on every environment (`worktree` today).
    fn provider_type(&self) -> &str;

    /// Provision or adopt an environment for the request. Calling twice
    /// with the same request returns the same environment, adopted.
    async fn create(&self, request: &IsolationRequest) -> Result<IsolationEnvironment>;

    /// Adopt a pre-existing working directory for the request without
    /// creating anything. Returns `None` when there is nothing to adopt.
    async fn adopt(&self, request: &IsolationRequest) -> Result<Option<IsolationEnvironment>>;

    /// Tear an environment down. Idempotent: destroying an already-missing
    /// worktree succeeds.
    async fn destroy(&self, env_id: &str, options: DestroyOptions) -> Result<()>;

    async fn get(&self, env_id: &str) -> Result<Option<IsolationEnvironment>>;

    async fn list(&self, codebase_id: Option<&str>) -> Result<Vec<IsolationEnvironment>>;

    async fn health_check(&self, env_id: &str) -> Result<EnvironmentHealth>;
}

/// Lowercase, collapse runs of non-alphanumerics to `-`, trim, cap at 50.
pub fn slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_dash = true;
    for c in input.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out.truncate(50);
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// First 8 hex digits of sha256 of the identifier. Deterministic, so the
/// same thread always maps to the same branch.
pub fn thread_hash(identifier: &str) -> String {
    let digest = Sha256::digest(identifier.as_bytes());
    let hex = format!("{:x}", digest);
    hex[..8].to_string()
}

/// Semantic branch name for a request.
pub fn branch_name(request: &IsolationRequest) -> String {
    match request.workflow_type {
        WorkflowType::Issue => format!("issue-{}", request.identifier),
        WorkflowType::Pr => match (&request.pr_branch, request.is_fork_pr) {
            // Same-repo PR with a known branch: work on it directly so
            // pushes land on the PR.
            (Some(branch), false) => branch.clone(),
            _ => format!("pr-{}-review", request.identifier),
        },
        WorkflowType::Review => format!("review-{}", request.identifier),
        WorkflowType::Thread => format!("thread-{}", thread_hash(&request.identifier)),
        WorkflowType::Task => format!("task-{}", slug(&request.identifier)),
    }
}

/// Worktree path: `{base}/{owner}/{repo}/{branch}`, with `owner/repo` taken
/// from the last two segments of the canonical repo path.
pub fn worktree_path(base: &Path, canonical_repo_path: &Path, branch: &str) -> PathBuf {
    let mut segments = canonical_repo_path
        .components()
        .rev()
        .filter_map(|c| match c {
            std::path::Component::Normal(s) => s.to_str(),
            _ => None,
        });
    let repo = segments.next().unwrap_or("repo");
    let owner = segments.next().unwrap_or("local");
    base.join(owner).join(repo).join(branch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request(workflow_type: WorkflowType, identifier: &str) -> IsolationRequest {
        IsolationRequest {
            codebase_id: "cb".to_string(),
            canonical_repo_path: PathBuf::from("/home/a/.archon/workspaces/octo/widgets"),
            workflow_type,
            identifier: identifier.to_string(),
            pr_branch: None,
            pr_sha: None,
            is_fork_pr: false,
            platform_type: "github".to_string(),
        }
    }

    #[test]
    fn slug_rules() {
        assert_eq!(slug("Add Dark Mode!"), "add-dark-mode");
        assert_eq!(slug("--already--dashed--"), "already-dashed");
        let long = "x".repeat(80);
        assert_eq!(slug(&long).len(), 50);
    }

    #[test]
    fn branch_names_per_workflow_type() {
        assert_eq!(branch_name(&request(WorkflowType::Issue, "42")), "issue-42");
        assert_eq!(branch_name(&request(WorkflowType::Review, "7")), "review-7");
        assert_eq!(
            branch_name(&request(WorkflowType::Task, "Add Dark Mode")),
            "task-add-dark-mode"
        );

        let mut pr = request(WorkflowType::Pr, "42");
        pr.pr_branch = Some("feat/x".to_string());
        assert_eq!(branch_name(&pr), "feat/x");

        pr.is_fork_pr = true;
        assert_eq!(branch_name(&pr), "pr-42-review");

        let mut no_branch = request(WorkflowType::Pr, "42");
        no_branch.pr_branch = None;
        assert_eq!(branch_name(&no_branch), "pr-42-review");
    }

    #[test]
    fn thread_branch_is_deterministic() {
        let a = branch_name(&request(WorkflowType::Thread, "C042-1699999999.12345"));
        let b = branch_name(&request(WorkflowType::Thread, "C042-1699999999.12345"));
        assert_eq!(a, b);
        assert_eq!(a.len(), "thread-".len() + 8);
        let c = branch_name(&request(WorkflowType::Thread, "C042-1699999999.99999"));
        assert_ne!(a, c);
    }

    #[test]
    fn worktree_path_uses_owner_repo_tail() {
        let path = worktree_path(
            Path::new("/home/a/.archon/worktrees"),
            Path::new("/home/a/.archon/workspaces/octo/widgets"),
            "issue-42",
        );
        assert_eq!(
            path,
            PathBuf::from("/home/a/.archon/worktrees/octo/widgets/issue-42")
        );
    }
}
