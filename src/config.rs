//! Runtime configuration.
//!
//! Everything is defaultable; deployments override through environment
//! variables. Config *files* are owned by the deployment layer, not here.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// A file seeded from the canonical repo into each new worktree.
///
/// Parsed from `src` or `src:dest` notation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeedFile {
    pub source: String,
    pub dest: Option<String>,
}

impl SeedFile {
    pub fn parse(entry: &str) -> Self {
        match entry.split_once(':') {
            Some((src, dst)) => Self {
                source: src.to_string(),
                dest: Some(dst.to_string()),
            },
            None => Self {
                source: entry.to_string(),
                dest: None,
            },
        }
    }
}

/// Archon runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchonConfig {
    /// Root of all archon state (`~/.archon` unless `ARCHON_HOME` is set).
    pub home: PathBuf,
    /// Default assistant type for conversations without a codebase preference.
    pub default_assistant: String,
    /// Seconds between cleanup scheduler sweeps.
    pub cleanup_interval_secs: u64,
    /// Idle seconds after which a worktree is considered stale.
    pub stale_after_secs: u64,
    /// Active isolation environments allowed per codebase.
    pub max_environments_per_codebase: usize,
    /// Upper bound on concurrently running message handlers.
    pub handler_pool_size: usize,
    /// Files copied from the canonical repo into every new worktree.
    pub seed_files: Vec<SeedFile>,
    /// Platforms whose threads stay alive long enough that idle worktrees
    /// must not be reaped (e.g. telegram chats).
    pub long_lived_platforms: Vec<String>,
}

impl Default for ArchonConfig {
    fn default() -> Self {
        let home = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".archon");
        Self {
            home,
            default_assistant: "claude".to_string(),
            cleanup_interval_secs: 6 * 60 * 60,
            stale_after_secs: 7 * 24 * 60 * 60,
            max_environments_per_codebase: 25,
            handler_pool_size: 10,
            seed_files: vec![SeedFile::parse(".archon")],
            long_lived_platforms: vec!["telegram".to_string()],
        }
    }
}

impl ArchonConfig {
    /// Build the config from defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(home) = std::env::var("ARCHON_HOME") {
            config.home = PathBuf::from(home);
        }
        if let Ok(assistant) = std::env::var("ARCHON_DEFAULT_ASSISTANT") {
            config.default_assistant = assistant;
        }
        if let Ok(secs) = std::env::var("ARCHON_CLEANUP_INTERVAL_SECS") {
            if let Ok(secs) = secs.parse() {
                config.cleanup_interval_secs = secs;
            }
        }
        if let Ok(secs) = std::env::var("ARCHON_STALE_AFTER_SECS") {
            if let Ok(secs) = secs.parse() {
                config.stale_after_secs = secs;
            }
        }
        if let Ok(max) = std::env::var("ARCHON_MAX_ENVIRONMENTS") {
            if let Ok(max) = max.parse() {
                config.max_environments_per_codebase = max;
            }
        }
        if let Ok(seeds) = std::env::var("ARCHON_SEED_FILES") {
            config.seed_files = seeds
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| SeedFile::parse(s.trim()))
                .collect();
        }
        config
    }

    /// Canonical checkouts live here, one per `owner/repo`.
    pub fn workspaces_dir(&self) -> PathBuf {
        self.home.join("workspaces")
    }

    /// Worktrees live in a sibling tree under the archon home.
    pub fn worktree_base(&self) -> PathBuf {
        self.home.join("worktrees")
    }

    /// Global (cross-codebase) command templates.
    pub fn templates_dir(&self) -> PathBuf {
        self.home.join("templates")
    }

    /// SQLite database path.
    pub fn database_path(&self) -> PathBuf {
        self.home.join("archon.db")
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    /// Whether worktrees for this platform survive idle-based cleanup.
    pub fn is_long_lived_platform(&self, platform: &str) -> bool {
        self.long_lived_platforms.iter().any(|p| p == platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_file_parses_dest_notation() {
        assert_eq!(
            SeedFile::parse(".env.example:.env"),
            SeedFile {
                source: ".env.example".to_string(),
                dest: Some(".env".to_string()),
            }
        );
        assert_eq!(SeedFile::parse(".archon").dest, None);
    }

    #[test]
    fn default_seeds_include_archon_dir() {
        let config = ArchonConfig::default();
        assert!(config.seed_files.iter().any(|s| s.source == ".archon"));
        assert!(config.is_long_lived_platform("telegram"));
        assert!(!config.is_long_lived_platform("github"));
    }
}
