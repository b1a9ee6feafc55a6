//! Git-worktree isolation backend.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ArchonConfig;
use crate::error::{ArchonError, Result};
use crate::git::{worktree, GitOutput, GitRepo};
use crate::storage::{IsolationEnvironment, Store};

use super::{
    branch_name, worktree_path, DestroyOptions, EnvironmentHealth, IsolationProvider,
    IsolationRequest, WorkflowType,
};

/// Failure fragments from `git worktree remove` that mean the worktree is
/// already gone, which destroy treats as success.
const REMOVE_IDEMPOTENT: [&str; 3] = [
    "No such file or directory",
    "does not exist",
    "is not a working tree",
];

/// Failure fragments from `git branch -D` that destroy swallows.
const BRANCH_DELETE_IDEMPOTENT: [&str; 3] = ["not found", "did not match", "checked out at"];

/// Worktree-backed isolation provider.
pub struct WorktreeProvider {
    store: Store,
    config: Arc<ArchonConfig>,
}

impl WorktreeProvider {
    pub const PROVIDER_TYPE: &'static str = "worktree";

    pub fn new(store: Store, config: Arc<ArchonConfig>) -> Self {
        Self { store, config }
    }

    /// Record (or refresh) the row for a worktree that already exists on
    /// disk, marking it adopted.
    async fn adopt_existing(
        &self,
        request: &IsolationRequest,
        path: &Path,
        branch: &str,
    ) -> Result<IsolationEnvironment> {
        let path_str = path.to_string_lossy().to_string();
        info!("adopting existing worktree at {}", path_str);

        if let Some(env) = self.store.find_active_environment_by_path(&path_str).await? {
            let mut patch = HashMap::new();
            patch.insert("adopted".to_string(), serde_json::json!(true));
            self.store.merge_environment_metadata(&env.id, &patch).await?;
            return self
                .store
                .get_environment(&env.id)
                .await?
                .ok_or_else(|| ArchonError::not_found("isolation environment", env.id.clone()));
        }

        let mut metadata = HashMap::new();
        metadata.insert("adopted".to_string(), serde_json::json!(true));
        self.store
            .insert_environment(
                &request.codebase_id,
                Self::PROVIDER_TYPE,
                request.workflow_type.as_str(),
                &request.identifier,
                &path_str,
                branch,
                &request.platform_type,
                &metadata,
            )
            .await
    }

    /// Non-PR strategy: new branch, falling back to checkout of an existing
    /// branch left behind by an earlier worktree.
    async fn create_on_branch(
        &self,
        repo_path: &Path,
        path: &Path,
        branch: &str,
    ) -> Result<()> {
        let out = worktree::add_new_branch(repo_path, path, branch)
            .await
            .map_err(isolation_err)?;
        if out.success {
            return Ok(());
        }
        if out.mentions(&["already exists"]) {
            let retry = worktree::add_existing_branch(repo_path, path, branch)
                .await
                .map_err(isolation_err)?;
            if retry.success {
                return Ok(());
            }
            return Err(worktree_failure(&retry));
        }
        Err(worktree_failure(&out))
    }

    /// Same-repo PR: track the PR branch so pushes land on the PR.
    async fn create_same_repo_pr(
        &self,
        repo_path: &Path,
        path: &Path,
        pr_branch: &str,
    ) -> Result<()> {
        let repo = GitRepo::open(repo_path);
        if let Ok(out) = repo.fetch(&[pr_branch]).await {
            if !out.success {
                debug!("fetch origin {} failed: {}", pr_branch, out.stderr.trim());
            }
        }

        let start_point = format!("origin/{}", pr_branch);
        let out = worktree::add_tracking(repo_path, path, pr_branch, &start_point)
            .await
            .map_err(isolation_err)?;
        if !out.success {
            if !out.mentions(&["already exists"]) {
                return Err(worktree_failure(&out));
            }
            let retry = worktree::add_existing_branch(repo_path, path, pr_branch)
                .await
                .map_err(isolation_err)?;
            if !retry.success {
                return Err(worktree_failure(&retry));
            }
        }

        // Upstream tracking is nice-to-have; never fatal.
        let worktree_repo = GitRepo::open(path);
        match worktree_repo.set_upstream(pr_branch, &start_point).await {
            Ok(out) if !out.success => {
                warn!("set-upstream failed for {}: {}", pr_branch, out.stderr.trim())
            }
            Err(e) => warn!("set-upstream failed for {}: {}", pr_branch, e),
            _ => {}
        }
        Ok(())
    }

    /// Fork PR with a known head sha: detached worktree at the sha, then a
    /// local review branch inside it.
    async fn create_fork_pr_at_sha(
        &self,
        repo_path: &Path,
        path: &Path,
        identifier: &str,
        review_branch: &str,
        sha: &str,
    ) -> Result<()> {
        let repo = GitRepo::open(repo_path);
        let pull_ref = format!("pull/{}/head", identifier);
        if let Ok(out) = repo.fetch(&[&pull_ref]).await {
            if !out.success {
                debug!("fetch {} failed: {}", pull_ref, out.stderr.trim());
            }
        }

        let out = worktree::add_detached(repo_path, path, sha)
            .await
            .map_err(isolation_err)?;
        if !out.success {
            return Err(worktree_failure(&out));
        }

        let worktree_repo = GitRepo::open(path);
        let checkout = worktree_repo
            .checkout_new_branch(review_branch, sha)
            .await
            .map_err(isolation_err)?;
        if checkout.success {
            return Ok(());
        }
        if checkout.mentions(&["already exists"]) {
            // Stale review branch from an earlier run: drop and retry.
            let _ = repo.delete_branch(review_branch).await;
            let retry = worktree_repo
                .checkout_new_branch(review_branch, sha)
                .await
                .map_err(isolation_err)?;
            if retry.success {
                return Ok(());
            }
            return Err(worktree_failure(&retry));
        }
        Err(worktree_failure(&checkout))
    }

    /// Fork PR without a sha: fetch the pull head straight into the review
    /// branch, then check it out as a worktree.
    async fn create_fork_pr_from_head(
        &self,
        repo_path: &Path,
        path: &Path,
        identifier: &str,
        review_branch: &str,
    ) -> Result<()> {
        let repo = GitRepo::open(repo_path);
        let refspec = format!("pull/{}/head:{}", identifier, review_branch);

        let fetch = repo.fetch(&[&refspec]).await.map_err(isolation_err)?;
        if !fetch.success {
            // Stale review branch blocks the fetch; drop and retry once.
            let _ = repo.delete_branch(review_branch).await;
            let retry = repo.fetch(&[&refspec]).await.map_err(isolation_err)?;
            if !retry.success {
                return Err(ArchonError::isolation(format!(
                    "fetching {} failed: {}",
                    refspec,
                    retry.stderr.trim()
                )));
            }
        }

        let out = worktree::add_existing_branch(repo_path, path, review_branch)
            .await
            .map_err(isolation_err)?;
        if !out.success {
            return Err(worktree_failure(&out));
        }
        Ok(())
    }

    /// Copy configured seed files from the canonical repo into the worktree.
    /// Best-effort: a failed seed is logged, never fatal.
    async fn seed_files(&self, repo_path: &Path, worktree_path: &Path) {
        for seed in &self.config.seed_files {
            let source = repo_path.join(&seed.source);
            let dest = worktree_path.join(seed.dest.as_deref().unwrap_or(&seed.source));

            if tokio::fs::metadata(&source).await.is_err() {
                debug!("seed source {} absent, skipping", source.display());
                continue;
            }

            let source = source.clone();
            let dest = dest.clone();
            let copied =
                tokio::task::spawn_blocking(move || copy_path_recursive(&source, &dest)).await;
            match copied {
                Ok(Ok(())) => debug!("seeded {} into worktree", seed.source),
                Ok(Err(e)) => warn!("seeding {} failed: {}", seed.source, e),
                Err(e) => warn!("seeding task for {} panicked: {}", seed.source, e),
            }
        }
    }
}

fn isolation_err(e: anyhow::Error) -> ArchonError {
    ArchonError::isolation(format!("{:#}", e))
}

fn worktree_failure(out: &GitOutput) -> ArchonError {
    let stderr = out.stderr.trim();
    if stderr.contains("already checked out") || stderr.contains("checked out at") {
        ArchonError::isolation_with_hint(
            stderr.to_string(),
            "The branch is checked out elsewhere.",
        )
    } else if stderr.contains("Permission denied") {
        ArchonError::isolation_with_hint(stderr.to_string(), "Check filesystem permissions.")
    } else {
        ArchonError::isolation(stderr.to_string())
    }
}

/// Recursive copy of a file or directory tree.
fn copy_path_recursive(source: &Path, dest: &Path) -> std::io::Result<()> {
    let metadata = std::fs::metadata(source)?;
    if metadata.is_dir() {
        std::fs::create_dir_all(dest)?;
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            copy_path_recursive(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source, dest)?;
    }
    Ok(())
}

#[async_trait]
impl IsolationProvider for WorktreeProvider {
    fn provider_type(&self) -> &str {
        Self::PROVIDER_TYPE
    }

    async fn create(&self, request: &IsolationRequest) -> Result<IsolationEnvironment> {
        let branch = branch_name(request);
        let path = worktree_path(
            &self.config.worktree_base(),
            &request.canonical_repo_path,
            &branch,
        );
        let repo_path = request.canonical_repo_path.as_path();

        if let Some(adopted) = self.adopt(request).await? {
            return Ok(adopted);
        }

        // Orphan cleanup: a plain directory at the target path that git does
        // not recognize as a worktree.
        match tokio::fs::metadata(&path).await {
            Ok(_) => {
                warn!("removing orphan directory at {}", path.display());
                tokio::fs::remove_dir_all(&path).await?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match request.workflow_type {
            WorkflowType::Pr => match (
                request.is_fork_pr,
                request.pr_branch.as_deref(),
                request.pr_sha.as_deref(),
            ) {
                (false, Some(pr_branch), _) => {
                    self.create_same_repo_pr(repo_path, &path, pr_branch).await?
                }
                (true, _, Some(sha)) => {
                    self.create_fork_pr_at_sha(repo_path, &path, &request.identifier, &branch, sha)
                        .await?
                }
                (true, _, None) => {
                    self.create_fork_pr_from_head(repo_path, &path, &request.identifier, &branch)
                        .await?
                }
                // Same-repo PR with no branch info degrades to a plain
                // review branch off the default HEAD.
                (false, None, _) => self.create_on_branch(repo_path, &path, &branch).await?,
            },
            _ => self.create_on_branch(repo_path, &path, &branch).await?,
        }

        self.seed_files(repo_path, &path).await;

        self.store
            .insert_environment(
                &request.codebase_id,
                Self::PROVIDER_TYPE,
                request.workflow_type.as_str(),
                &request.identifier,
                &path.to_string_lossy(),
                &branch,
                &request.platform_type,
                &HashMap::new(),
            )
            .await
    }

    async fn adopt(&self, request: &IsolationRequest) -> Result<Option<IsolationEnvironment>> {
        let branch = branch_name(request);
        let path = worktree_path(
            &self.config.worktree_base(),
            &request.canonical_repo_path,
            &branch,
        );
        let repo_path = request.canonical_repo_path.as_path();

        // Adoption by path.
        if let Some(existing) = worktree::find_by_path(repo_path, &path)
            .await
            .map_err(isolation_err)?
        {
            let adopted_branch = if existing.branch.is_empty() {
                branch.clone()
            } else {
                existing.branch.clone()
            };
            let env = self
                .adopt_existing(request, &existing.path, &adopted_branch)
                .await?;
            return Ok(Some(env));
        }

        // Same-repo PRs may already have a worktree elsewhere on the PR
        // branch; adopt it wherever it lives.
        if request.workflow_type == WorkflowType::Pr && !request.is_fork_pr {
            if let Some(pr_branch) = &request.pr_branch {
                if let Some(existing) = worktree::find_by_branch(repo_path, pr_branch)
                    .await
                    .map_err(isolation_err)?
                {
                    let env = self.adopt_existing(request, &existing.path, pr_branch).await?;
                    return Ok(Some(env));
                }
            }
        }

        Ok(None)
    }

    async fn destroy(&self, env_id: &str, options: DestroyOptions) -> Result<()> {
        let Some(env) = self.store.get_environment(env_id).await? else {
            return Err(ArchonError::not_found("isolation environment", env_id));
        };
        if !env.is_active() {
            return Ok(());
        }

        let branch = options
            .branch_name
            .clone()
            .unwrap_or_else(|| env.branch_name.clone());
        let repo_path: Option<PathBuf> = match options.canonical_repo_path {
            Some(path) => Some(path),
            None => self
                .store
                .get_codebase(&env.codebase_id)
                .await?
                .map(|cb| cb.default_cwd_path()),
        };
        let path = env.working_path_buf();

        match tokio::fs::metadata(&path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Path already gone: skip worktree remove, still reap branch.
                if let Some(repo_path) = &repo_path {
                    delete_branch_best_effort(repo_path, &branch).await;
                    let _ = worktree::prune(repo_path).await;
                }
            }
            Err(e) => return Err(e.into()),
            Ok(_) => {
                if let Some(repo_path) = &repo_path {
                    let out = worktree::remove(repo_path, &path, options.force)
                        .await
                        .map_err(isolation_err)?;
                    if !out.success && !out.mentions(&REMOVE_IDEMPOTENT) {
                        return Err(worktree_failure(&out));
                    }
                }
                // Whatever git left behind goes too.
                if tokio::fs::metadata(&path).await.is_ok() {
                    if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                        warn!("residual directory removal failed: {}", e);
                    }
                }
                if let Some(repo_path) = &repo_path {
                    delete_branch_best_effort(repo_path, &branch).await;
                }
            }
        }

        self.store.mark_environment_destroyed(env_id).await?;
        self.store.clear_cwd_references(&env.working_path).await?;
        info!("destroyed isolation environment {} ({})", env_id, env.working_path);
        Ok(())
    }

    async fn get(&self, env_id: &str) -> Result<Option<IsolationEnvironment>> {
        self.store.get_environment(env_id).await
    }

    async fn list(&self, codebase_id: Option<&str>) -> Result<Vec<IsolationEnvironment>> {
        self.store.list_active_environments(codebase_id).await
    }

    async fn health_check(&self, env_id: &str) -> Result<EnvironmentHealth> {
        let Some(env) = self.store.get_environment(env_id).await? else {
            return Err(ArchonError::not_found("isolation environment", env_id));
        };
        let path = env.working_path_buf();
        let path_exists = tokio::fs::metadata(&path).await.is_ok();

        let registered_worktree = match self.store.get_codebase(&env.codebase_id).await? {
            Some(codebase) => worktree::find_by_path(&codebase.default_cwd_path(), &path)
                .await
                .map(|found| found.is_some())
                .unwrap_or(false),
            None => false,
        };

        Ok(EnvironmentHealth {
            path_exists,
            registered_worktree,
        })
    }
}

async fn delete_branch_best_effort(repo_path: &Path, branch: &str) {
    let repo = GitRepo::open(repo_path);
    match repo.delete_branch(branch).await {
        Ok(out) if !out.success && !out.mentions(&BRANCH_DELETE_IDEMPOTENT) => {
            warn!("branch -D {} failed: {}", branch, out.stderr.trim());
        }
        Err(e) => warn!("branch -D {} failed: {}", branch, e),
        _ => {}
    }
}
