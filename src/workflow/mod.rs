//! Workflow definitions, discovery, execution, and routing.

pub mod definition;
pub mod execution;
pub mod router;

pub use definition::{LoopSpec, SingleStep, WorkflowDefinition, WorkflowStep};
pub use execution::{WorkflowDispatch, WorkflowExecutor};
pub use router::Router;

use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::Result;
use crate::storage::Codebase;

/// The catch-all workflow name. Always resolvable.
pub const ASSIST_WORKFLOW: &str = "assist";

/// Repo-relative directory scanned for workflow definition files.
pub const WORKFLOW_DIR: &str = ".archon/workflows";

/// The guaranteed fallback workflow.
pub fn builtin_assist() -> WorkflowDefinition {
    WorkflowDefinition {
        name: ASSIST_WORKFLOW.to_string(),
        description: "General-purpose assistance: answer questions, make small edits, \
                      investigate the codebase. The fallback when nothing else fits."
            .to_string(),
        provider: "claude".to_string(),
        steps: vec![WorkflowStep::Single(SingleStep {
            command: ASSIST_WORKFLOW.to_string(),
            clear_context: false,
        })],
        loop_spec: None,
    }
}

/// Per-codebase workflow registry with lazy discovery from
/// `{repo}/.archon/workflows/*.json`.
pub struct WorkflowRegistry {
    cache: RwLock<HashMap<String, Vec<WorkflowDefinition>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// All workflows for a codebase: discovered definitions plus the
    /// built-in assist fallback.
    pub async fn workflows_for(&self, codebase: &Codebase) -> Result<Vec<WorkflowDefinition>> {
        {
            let cache = self.cache.read().await;
            if let Some(workflows) = cache.get(&codebase.id) {
                return Ok(workflows.clone());
            }
        }
        self.reload(codebase).await
    }

    /// Re-scan the codebase's workflow directory, replacing the cache entry.
    pub async fn reload(&self, codebase: &Codebase) -> Result<Vec<WorkflowDefinition>> {
        let dir = codebase.default_cwd_path().join(WORKFLOW_DIR);
        let mut workflows = discover(&dir).await?;
        if !workflows.iter().any(|w| w.name == ASSIST_WORKFLOW) {
            workflows.push(builtin_assist());
        }
        let mut cache = self.cache.write().await;
        cache.insert(codebase.id.clone(), workflows.clone());
        Ok(workflows)
    }

    /// Look a workflow up by name (case-insensitive).
    pub async fn find(&self, codebase: &Codebase, name: &str) -> Result<Option<WorkflowDefinition>> {
        let workflows = self.workflows_for(codebase).await?;
        Ok(workflows
            .into_iter()
            .find(|w| w.name.eq_ignore_ascii_case(name)))
    }
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse every `*.json` in the directory into a validated definition.
/// Invalid files are logged and skipped; discovery never fails the dispatch.
async fn discover(dir: &Path) -> Result<Vec<WorkflowDefinition>> {
    let mut workflows = Vec::new();
    if tokio::fs::metadata(dir).await.is_err() {
        return Ok(workflows);
    }

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) => {
                warn!("unreadable workflow file {}: {}", path.display(), e);
                continue;
            }
        };
        let definition: WorkflowDefinition = match serde_json::from_str(&text) {
            Ok(def) => def,
            Err(e) => {
                warn!("invalid workflow file {}: {}", path.display(), e);
                continue;
            }
        };
        if let Err(e) = definition.validate(None) {
            warn!("rejected workflow {}: {}", definition.name, e);
            continue;
        }
        debug!("discovered workflow {}", definition.name);
        workflows.push(definition);
    }

    workflows.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(workflows)
}
