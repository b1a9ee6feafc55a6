//! Worktree-level git operations: list, add in its several shapes, remove.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use super::{try_git, GitOutput};

/// One entry from `git worktree list --porcelain`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
    pub head_commit: String,
    pub is_locked: bool,
    pub is_bare: bool,
}

/// List all worktrees of the repository at `repo_path`.
pub async fn list(repo_path: &Path) -> Result<Vec<WorktreeInfo>> {
    let out = try_git(repo_path, &["worktree", "list", "--porcelain"]).await?;
    if !out.success {
        anyhow::bail!("failed to list worktrees: {}", out.stderr.trim());
    }
    Ok(parse_worktree_list(&out.stdout))
}

/// Find the worktree entry whose path equals `path`, if any.
pub async fn find_by_path(repo_path: &Path, path: &Path) -> Result<Option<WorktreeInfo>> {
    let worktrees = list(repo_path).await?;
    Ok(worktrees.into_iter().find(|w| w.path == path))
}

/// Find the worktree entry checked out on `branch`, if any.
pub async fn find_by_branch(repo_path: &Path, branch: &str) -> Result<Option<WorktreeInfo>> {
    let worktrees = list(repo_path).await?;
    Ok(worktrees.into_iter().find(|w| w.branch == branch))
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow::anyhow!("invalid UTF-8 in worktree path: {:?}", path))
}

/// `git worktree add <path> -b <branch>`
pub async fn add_new_branch(repo_path: &Path, path: &Path, branch: &str) -> Result<GitOutput> {
    let out = try_git(repo_path, &["worktree", "add", path_arg(path)?, "-b", branch]).await?;
    if out.success {
        info!("created worktree {} on new branch {}", path.display(), branch);
    }
    Ok(out)
}

/// `git worktree add <path> <branch>` (branch must exist)
pub async fn add_existing_branch(repo_path: &Path, path: &Path, branch: &str) -> Result<GitOutput> {
    let out = try_git(repo_path, &["worktree", "add", path_arg(path)?, branch]).await?;
    if out.success {
        info!("created worktree {} on branch {}", path.display(), branch);
    }
    Ok(out)
}

/// `git worktree add <path> -b <branch> <start_point>`
pub async fn add_tracking(
    repo_path: &Path,
    path: &Path,
    branch: &str,
    start_point: &str,
) -> Result<GitOutput> {
    try_git(
        repo_path,
        &["worktree", "add", path_arg(path)?, "-b", branch, start_point],
    )
    .await
}

/// `git worktree add <path> <sha>` (detached HEAD)
pub async fn add_detached(repo_path: &Path, path: &Path, sha: &str) -> Result<GitOutput> {
    try_git(
        repo_path,
        &["worktree", "add", "--detach", path_arg(path)?, sha],
    )
    .await
}

/// `git worktree remove [--force] <path>`
pub async fn remove(repo_path: &Path, path: &Path, force: bool) -> Result<GitOutput> {
    let path_str = path_arg(path)?;
    let args: Vec<&str> = if force {
        vec!["worktree", "remove", "--force", path_str]
    } else {
        vec!["worktree", "remove", path_str]
    };
    try_git(repo_path, &args).await
}

/// `git worktree prune`
pub async fn prune(repo_path: &Path) -> Result<GitOutput> {
    try_git(repo_path, &["worktree", "prune"]).await
}

/// Parse `git worktree list --porcelain` output.
fn parse_worktree_list(output: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in output.lines() {
        if let Some(path_str) = line.strip_prefix("worktree ") {
            if let Some(wt) = current.take() {
                worktrees.push(wt);
            }
            current = Some(WorktreeInfo {
                path: PathBuf::from(path_str),
                branch: String::new(),
                head_commit: String::new(),
                is_locked: false,
                is_bare: false,
            });
        } else if let Some(ref mut wt) = current {
            if let Some(head) = line.strip_prefix("HEAD ") {
                wt.head_commit = head.to_string();
            } else if line.starts_with("branch ") {
                wt.branch = line
                    .strip_prefix("branch refs/heads/")
                    .or_else(|| line.strip_prefix("branch "))
                    .unwrap_or("")
                    .to_string();
            } else if line == "bare" {
                wt.is_bare = true;
            } else if line.starts_with("locked") {
                wt.is_locked = true;
            }
        }
    }

    if let Some(wt) = current {
        worktrees.push(wt);
    }

    worktrees
}
