//! Integration tests: orchestrator pipeline, workflow engine, PR isolation.

mod workflow_tests;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use ai_client::{AssistantClient, MockAssistantClient};

use crate::commands::load_commands_from_dir;
use crate::config::ArchonConfig;
use crate::error::Result;
use crate::git::test_support::init_test_repo;
use crate::git::{run_git, GitRepo};
use crate::orchestrator::Orchestrator;
use crate::platform::{PlatformAdapter, StreamingMode};
use crate::storage::{Codebase, Store};

/// Adapter that records everything sent to it.
pub(crate) struct RecordingAdapter {
    mode: StreamingMode,
    sent: Mutex<Vec<String>>,
}

impl RecordingAdapter {
    pub(crate) fn new(mode: StreamingMode) -> Self {
        Self {
            mode,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlatformAdapter for RecordingAdapter {
    async fn send_message(&self, _conversation_id: &str, text: &str) -> Result<()> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn streaming_mode(&self) -> StreamingMode {
        self.mode
    }

    fn platform_type(&self) -> &str {
        "github"
    }
}

/// A full orchestrator over a real git repo, an in-memory store, and a
/// scripted assistant.
pub(crate) struct TestHarness {
    pub(crate) _temp: TempDir,
    pub(crate) config: Arc<ArchonConfig>,
    pub(crate) store: Store,
    pub(crate) orchestrator: Arc<Orchestrator>,
    pub(crate) client: Arc<MockAssistantClient>,
    pub(crate) adapter: Arc<RecordingAdapter>,
    pub(crate) codebase: Codebase,
    pub(crate) repo_path: PathBuf,
}

impl TestHarness {
    pub(crate) async fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let mut config = ArchonConfig::default();
        config.home = temp.path().join("archon-home");
        let config = Arc::new(config);

        let repo_path = config.workspaces_dir().join("octo").join("widgets");
        seed_command_repo(&repo_path).await;

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
        let commands = load_commands_from_dir(&repo_path.join(".archon/commands"))
            .await
            .unwrap();
        store
            .update_codebase_commands(&codebase.id, &commands)
            .await
            .unwrap();
        let codebase = store.get_codebase(&codebase.id).await.unwrap().unwrap();

        let client = Arc::new(MockAssistantClient::new("claude"));
        let mut clients: HashMap<String, Arc<dyn AssistantClient>> = HashMap::new();
        clients.insert("claude".to_string(), client.clone());

        let orchestrator = Arc::new(Orchestrator::new(store.clone(), config.clone(), clients));
        let adapter = Arc::new(RecordingAdapter::new(StreamingMode::Stream));

        Self {
            _temp: temp,
            config,
            store,
            orchestrator,
            client,
            adapter,
            codebase,
            repo_path,
        }
    }

    /// Bind a conversation to the harness codebase and return it.
    pub(crate) async fn bound_conversation(&self, key: &str) -> crate::storage::Conversation {
        let conversation = self
            .store
            .get_or_create_conversation("github", key, "claude")
            .await
            .unwrap();
        self.store
            .set_conversation_codebase(&conversation.id, &self.codebase.id)
            .await
            .unwrap();
        self.store
            .get_conversation(&conversation.id)
            .await
            .unwrap()
            .unwrap()
    }
}

/// Initialize a repo carrying an `.archon/commands` folder.
pub(crate) async fn seed_command_repo(path: &Path) -> GitRepo {
    let repo = init_test_repo(path).await.unwrap();
    let commands_dir = path.join(".archon").join("commands");
    tokio::fs::create_dir_all(&commands_dir).await.unwrap();
    tokio::fs::write(
        commands_dir.join("plan-feature.md"),
        "# Plan a feature\n\nWrite an implementation plan for: $ARGUMENTS\n",
    )
    .await
    .unwrap();
    tokio::fs::write(
        commands_dir.join("execute.md"),
        "# Execute the plan\n\nImplement the planned work. Context: $USER_MESSAGE\n",
    )
    .await
    .unwrap();
    tokio::fs::write(
        commands_dir.join("review.md"),
        "# Review changes\n\nReview the work so far.\n",
    )
    .await
    .unwrap();
    tokio::fs::write(
        commands_dir.join("write-tests.md"),
        "# Write tests\n\nAdd tests for: $USER_MESSAGE\n",
    )
    .await
    .unwrap();
    tokio::fs::write(
        commands_dir.join("write-docs.md"),
        "# Write docs\n\nDocument: $USER_MESSAGE\n",
    )
    .await
    .unwrap();
    run_git(path, &["add", "."]).await.unwrap();
    run_git(path, &["commit", "-m", "add command files"]).await.unwrap();
    repo
}
