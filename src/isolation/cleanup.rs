//! Periodic sweep over isolation environments.
//!
//! Each pass is best-effort: a failure on one environment is reported and
//! the sweep moves on. Policies, in order: missing paths are marked
//! destroyed, merged-and-clean worktrees are removed, idle worktrees on
//! short-lived platforms are removed, and codebases over their environment
//! cap shed their oldest idle entries.

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ArchonConfig;
use crate::error::Result;
use crate::git::GitRepo;
use crate::storage::{Codebase, IsolationEnvironment, Store};

use super::{DestroyOptions, IsolationProvider, WorktreeProvider};

/// Outcome summary of one sweep.
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    pub removed: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// Background scheduler around [`sweep`].
pub struct CleanupScheduler {
    store: Store,
    provider: Arc<WorktreeProvider>,
    config: Arc<ArchonConfig>,
}

impl CleanupScheduler {
    pub fn new(store: Store, provider: Arc<WorktreeProvider>, config: Arc<ArchonConfig>) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    /// Run sweeps until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval());
        // The immediate first tick would sweep at startup; skip it.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("cleanup scheduler stopping");
                    return;
                }
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(report) => info!(
                            removed = report.removed,
                            skipped = report.skipped,
                            errors = report.errors.len(),
                            "cleanup sweep finished"
                        ),
                        Err(e) => warn!("cleanup sweep failed: {}", e),
                    }
                }
            }
        }
    }

    /// One pass over all active environments.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let environments = self.store.list_active_environments(None).await?;

        for env in &environments {
            match self.sweep_one(env).await {
                Ok(true) => report.removed += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report
                        .errors
                        .push(format!("{} ({}): {}", env.id, env.working_path, e));
                }
            }
        }

        // Cap enforcement: oldest idle environments beyond the per-codebase
        // maximum go first. Environment lists are ordered oldest-first.
        for codebase in self.store.list_codebases().await? {
            let active = self.store.list_active_environments(Some(&codebase.id)).await?;
            let max = self.config.max_environments_per_codebase;
            if active.len() <= max {
                continue;
            }
            let excess = active.len() - max;
            let mut shed = 0;
            for env in active {
                if shed >= excess {
                    break;
                }
                if self.is_referenced(&env).await.unwrap_or(true) {
                    continue;
                }
                match self
                    .provider
                    .destroy(&env.id, DestroyOptions { force: true, ..Default::default() })
                    .await
                {
                    Ok(()) => {
                        shed += 1;
                        report.removed += 1;
                    }
                    Err(e) => report.errors.push(format!("{}: {}", env.id, e)),
                }
            }
        }

        Ok(report)
    }

    async fn is_referenced(&self, env: &IsolationEnvironment) -> Result<bool> {
        Ok(self
            .store
            .count_conversations_with_cwd(&env.working_path)
            .await?
            > 0)
    }

    /// Apply the removal policies to one environment. Returns whether it was
    /// removed.
    async fn sweep_one(&self, env: &IsolationEnvironment) -> Result<bool> {
        let path = env.working_path_buf();

        // 1. Path gone: nothing to keep alive.
        if tokio::fs::metadata(&path).await.is_err() {
            debug!("environment {} path missing, marking destroyed", env.id);
            self.provider.destroy(&env.id, DestroyOptions::default()).await?;
            return Ok(true);
        }

        let Some(codebase) = self.store.get_codebase(&env.codebase_id).await? else {
            return Err(crate::error::ArchonError::not_found(
                "codebase",
                env.codebase_id.clone(),
            ));
        };

        // 2. Merged into main, no local changes, no conversation using it.
        if self.is_merged_and_clean(env, &codebase).await? && !self.is_referenced(env).await? {
            debug!("environment {} merged and clean, removing", env.id);
            self.provider.destroy(&env.id, DestroyOptions::default()).await?;
            return Ok(true);
        }

        // 3. Idle past the stale threshold, unless the platform keeps
        // long-lived threads.
        if !self.config.is_long_lived_platform(&env.platform_type) && self.is_stale(env).await? {
            debug!("environment {} idle past threshold, removing", env.id);
            self.provider
                .destroy(&env.id, DestroyOptions { force: true, ..Default::default() })
                .await?;
            return Ok(true);
        }

        Ok(false)
    }

    async fn is_merged_and_clean(
        &self,
        env: &IsolationEnvironment,
        codebase: &Codebase,
    ) -> Result<bool> {
        let canonical = GitRepo::open(codebase.default_cwd_path());
        let main_branch = canonical
            .default_branch()
            .await
            .map_err(crate::error::ArchonError::from)?;
        let merged = canonical
            .is_branch_merged(&env.branch_name, &main_branch)
            .await
            .map_err(crate::error::ArchonError::from)?;
        if !merged {
            return Ok(false);
        }
        let worktree = GitRepo::open(env.working_path_buf());
        let dirty = worktree
            .has_uncommitted_changes()
            .await
            .map_err(crate::error::ArchonError::from)?;
        Ok(!dirty)
    }

    async fn is_stale(&self, env: &IsolationEnvironment) -> Result<bool> {
        let worktree = GitRepo::open(env.working_path_buf());
        let last_commit = worktree
            .last_commit_unix_time()
            .await
            .map_err(crate::error::ArchonError::from)?;
        let idle_secs = (Utc::now().timestamp() - last_commit).max(0) as u64;
        Ok(idle_secs > self.config.stale_after_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::init_test_repo;
    use crate::isolation::{IsolationRequest, WorkflowType};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<ArchonConfig>, Store, Arc<WorktreeProvider>, String, std::path::PathBuf) {
        let temp = TempDir::new().unwrap();
        let mut config = ArchonConfig::default();
        config.home = temp.path().join("archon-home");
        let config = Arc::new(config);

        let repo_path = temp.path().join("workspaces").join("octo").join("widgets");
        init_test_repo(&repo_path).await.unwrap();

        let store = Store::in_memory().await.unwrap();
        let codebase = store
            .create_codebase(
                "octo/widgets",
                "https://github.com/octo/widgets",
                &repo_path.to_string_lossy(),
                "claude",
            )
            .await
            .unwrap();
        let provider = Arc::new(WorktreeProvider::new(store.clone(), config.clone()));
        (temp, config, store, provider, codebase.id, repo_path)
    }

    fn request(codebase_id: &str, repo_path: &std::path::Path, id: &str) -> IsolationRequest {
        IsolationRequest {
            codebase_id: codebase_id.to_string(),
            canonical_repo_path: repo_path.to_path_buf(),
            workflow_type: WorkflowType::Issue,
            identifier: id.to_string(),
            pr_branch: None,
            pr_sha: None,
            is_fork_pr: false,
            platform_type: "github".to_string(),
        }
    }

    #[tokio::test]
    async fn missing_path_marked_destroyed_within_one_sweep() {
        let (_temp, config, store, provider, codebase_id, repo_path) = setup().await;
        let env = provider
            .create(&request(&codebase_id, &repo_path, "1"))
            .await
            .unwrap();
        tokio::fs::remove_dir_all(env.working_path_buf()).await.unwrap();

        let scheduler = CleanupScheduler::new(store.clone(), provider, config);
        let report = scheduler.sweep().await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(report.errors.is_empty());

        let row = store.get_environment(&env.id).await.unwrap().unwrap();
        assert!(!row.is_active());
    }

    #[tokio::test]
    async fn merged_clean_unreferenced_worktree_is_removed() {
        let (_temp, config, store, provider, codebase_id, repo_path) = setup().await;
        let env = provider
            .create(&request(&codebase_id, &repo_path, "2"))
            .await
            .unwrap();

        // Freshly created from HEAD: merged by construction, clean, and no
        // conversation points at it.
        let scheduler = CleanupScheduler::new(store.clone(), provider, config);
        let report = scheduler.sweep().await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(!env.working_path_buf().exists());
    }

    #[tokio::test]
    async fn referenced_worktree_survives_sweep() {
        let (_temp, config, store, provider, codebase_id, repo_path) = setup().await;
        let env = provider
            .create(&request(&codebase_id, &repo_path, "3"))
            .await
            .unwrap();
        let conv = store
            .get_or_create_conversation("github", "issue-3", "claude")
            .await
            .unwrap();
        store
            .set_conversation_cwd(&conv.id, Some(&env.working_path))
            .await
            .unwrap();

        let scheduler = CleanupScheduler::new(store.clone(), provider, config);
        let report = scheduler.sweep().await.unwrap();
        assert_eq!(report.removed, 0);
        assert_eq!(report.skipped, 1);
        assert!(env.working_path_buf().exists());
    }

    #[tokio::test]
    async fn dirty_worktree_survives_merged_policy() {
        let (_temp, config, store, provider, codebase_id, repo_path) = setup().await;
        let env = provider
            .create(&request(&codebase_id, &repo_path, "4"))
            .await
            .unwrap();
        tokio::fs::write(env.working_path_buf().join("wip.txt"), "uncommitted")
            .await
            .unwrap();

        let scheduler = CleanupScheduler::new(store.clone(), provider, config);
        let report = scheduler.sweep().await.unwrap();
        assert_eq!(report.removed, 0);
        assert!(env.working_path_buf().exists());
    }
}
