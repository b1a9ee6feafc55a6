//! Shell-command git plumbing.
//!
//! Everything goes through the `git` binary via `tokio::process::Command`;
//! no libgit2 dependency. The worktree-specific operations live in
//! [`worktree`].

pub mod worktree;

pub use worktree::WorktreeInfo;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Raw output of a git invocation, for callers that inspect stderr to
/// decide whether a failure is one of the known idempotent cases.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    /// True when either stream mentions any of the given fragments.
    pub fn mentions(&self, fragments: &[&str]) -> bool {
        fragments
            .iter()
            .any(|f| self.stdout.contains(f) || self.stderr.contains(f))
    }
}

/// Run git in `dir`, capturing output regardless of exit status.
pub async fn try_git(dir: &Path, args: &[&str]) -> Result<GitOutput> {
    debug!("git -C {} {}", dir.display(), args.join(" "));
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .with_context(|| format!("failed to execute git {}", args.join(" ")))?;

    Ok(GitOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Run git in `dir`, treating a non-zero exit as an error carrying stderr.
pub async fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = try_git(dir, args).await?;
    if !output.success {
        anyhow::bail!(
            "git {} failed: {}",
            args.join(" "),
            output.stderr.trim()
        );
    }
    Ok(output.stdout)
}

/// Check if git is available on the system.
pub fn is_git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// A local repository (canonical checkout or worktree).
#[derive(Debug, Clone)]
pub struct GitRepo {
    path: PathBuf,
}

impl GitRepo {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory is a git working tree.
    pub async fn is_git_repo(path: &Path) -> bool {
        path.join(".git").exists()
    }

    /// Clone `url` into `dest` and open the result.
    pub async fn clone_repo(url: &str, dest: &Path) -> Result<Self> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let dest_str = dest
            .to_str()
            .context("clone destination is not valid UTF-8")?;
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        run_git(parent, &["clone", url, dest_str]).await?;
        info!("cloned {} into {}", url, dest.display());
        Ok(Self::open(dest))
    }

    /// Get current branch name.
    pub async fn current_branch(&self) -> Result<String> {
        let out = run_git(&self.path, &["branch", "--show-current"]).await?;
        Ok(out.trim().to_string())
    }

    /// Get HEAD commit hash.
    pub async fn head_commit(&self) -> Result<String> {
        let out = run_git(&self.path, &["rev-parse", "HEAD"]).await?;
        Ok(out.trim().to_string())
    }

    /// Resolve the repository's main branch: `origin/HEAD` when set, else
    /// whichever of `main`/`master` exists.
    pub async fn default_branch(&self) -> Result<String> {
        let out = try_git(&self.path, &["symbolic-ref", "refs/remotes/origin/HEAD"]).await?;
        if out.success {
            if let Some(name) = out.stdout.trim().rsplit('/').next() {
                if !name.is_empty() {
                    return Ok(name.to_string());
                }
            }
        }
        for candidate in ["main", "master"] {
            if self.branch_exists(candidate).await? {
                return Ok(candidate.to_string());
            }
        }
        self.current_branch().await
    }

    /// Check if branch exists locally.
    pub async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let out = try_git(&self.path, &["branch", "--list", branch]).await?;
        Ok(out.success && !out.stdout.trim().is_empty())
    }

    /// True when `git status --porcelain` reports anything.
    pub async fn has_uncommitted_changes(&self) -> Result<bool> {
        let out = run_git(&self.path, &["status", "--porcelain"]).await?;
        Ok(!out.trim().is_empty())
    }

    /// Unix timestamp of the last commit reachable from HEAD.
    pub async fn last_commit_unix_time(&self) -> Result<i64> {
        let out = run_git(&self.path, &["log", "-1", "--format=%ct"]).await?;
        out.trim()
            .parse()
            .context("unparseable commit timestamp")
    }

    /// Check whether `branch` is fully merged into `into`.
    pub async fn is_branch_merged(&self, branch: &str, into: &str) -> Result<bool> {
        let out = try_git(&self.path, &["merge-base", "--is-ancestor", branch, into]).await?;
        Ok(out.success)
    }

    /// Fetch a refspec from origin.
    pub async fn fetch(&self, refspecs: &[&str]) -> Result<GitOutput> {
        let mut args = vec!["fetch", "origin"];
        args.extend_from_slice(refspecs);
        try_git(&self.path, &args).await
    }

    /// Delete a local branch, returning the raw output so callers can
    /// swallow the known not-found cases.
    pub async fn delete_branch(&self, branch: &str) -> Result<GitOutput> {
        try_git(&self.path, &["branch", "-D", branch]).await
    }

    /// Set upstream tracking for a branch.
    pub async fn set_upstream(&self, branch: &str, upstream: &str) -> Result<GitOutput> {
        try_git(
            &self.path,
            &["branch", "--set-upstream-to", upstream, branch],
        )
        .await
    }

    /// Create and check out a new branch at `start_point` (run inside a
    /// worktree for the fork-PR detached-HEAD flow).
    pub async fn checkout_new_branch(&self, branch: &str, start_point: &str) -> Result<GitOutput> {
        try_git(&self.path, &["checkout", "-b", branch, start_point]).await
    }

    /// Stage everything and commit. Returns `false` when there was nothing
    /// to commit.
    pub async fn commit_all(&self, message: &str) -> Result<bool> {
        if !self.has_uncommitted_changes().await? {
            debug!("no changes to commit in {}", self.path.display());
            return Ok(false);
        }

        run_git(&self.path, &["add", "."]).await?;
        run_git(&self.path, &["commit", "-m", message]).await?;
        info!("committed changes in {}", self.path.display());
        Ok(true)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Initialize a repository with one commit, for tests.
    pub async fn init_test_repo(path: &Path) -> Result<GitRepo> {
        tokio::fs::create_dir_all(path).await?;
        run_git(path, &["init", "-b", "main"]).await?;
        run_git(path, &["config", "user.email", "test@example.com"]).await?;
        run_git(path, &["config", "user.name", "Test"]).await?;
        tokio::fs::write(path.join("README.md"), "# test\n").await?;
        run_git(path, &["add", "."]).await?;
        run_git(path, &["commit", "-m", "initial commit"]).await?;
        Ok(GitRepo::open(path))
    }
}
