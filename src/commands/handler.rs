//! Deterministic slash-command handling. No AI call, no workflow run.
//!
//! Every handler returns a `{success, message}` pair the orchestrator
//! forwards verbatim. Handlers whose outcome is a state assertion are
//! idempotent; destructive ones are safe on a clean state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::ArchonConfig;
use crate::error::Result;
use crate::git::GitRepo;
use crate::isolation::{CleanupScheduler, IsolationProvider, WorktreeProvider};
use crate::session::SessionManager;
use crate::storage::{CommandSpec, Conversation, Store, WorkflowRunStatus};
use crate::workflow::WorkflowRegistry;

use super::{
    canonicalize_remote_url, load_commands_from_dir, owner_repo_from_url, DEFAULT_COMMAND_DIR,
};

/// Guidance sent when a command needs a codebase and none is configured.
pub const NO_CODEBASE_MESSAGE: &str =
    "No codebase configured. Use `/clone <url>` first.";

const HELP_TEXT: &str = "Available commands:\n\
/clone URL - clone a repository and bind this conversation to it\n\
/codebase-switch NAME - switch to a different known codebase\n\
/getcwd - show the working directory\n\
/setcwd PATH - set the working directory\n\
/command-set NAME PATH [TEXT] - register (or create) a command file\n\
/load-commands FOLDER - register all markdown files in a folder\n\
/commands - list registered commands\n\
/command-invoke NAME [ARGS] - run a command as one assistant turn\n\
/template-add NAME PATH - add a global template\n\
/workflow list|reload|cancel - inspect or cancel workflows\n\
/worktree list|clean - inspect or clean isolation environments\n\
/status - show conversation state\n\
/reset - deactivate the current assistant session\n\
/help - this text";

/// Result of one deterministic command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub success: bool,
    pub message: String,
}

impl CommandOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Handles the slash-command surface.
pub struct CommandHandler {
    store: Store,
    config: Arc<ArchonConfig>,
    provider: Arc<WorktreeProvider>,
    registry: Arc<WorkflowRegistry>,
    sessions: SessionManager,
}

impl CommandHandler {
    pub fn new(
        store: Store,
        config: Arc<ArchonConfig>,
        provider: Arc<WorktreeProvider>,
        registry: Arc<WorkflowRegistry>,
    ) -> Self {
        let sessions = SessionManager::new(store.clone());
        Self {
            store,
            config,
            provider,
            registry,
            sessions,
        }
    }

    /// Dispatch one parsed command. Internal errors become `{success:
    /// false}` outcomes; session state is never altered on failure.
    pub async fn handle(
        &self,
        conversation: &Conversation,
        name: &str,
        args: &[String],
    ) -> CommandOutcome {
        let result = match name {
            "clone" => self.cmd_clone(conversation, args).await,
            "codebase-switch" => self.cmd_codebase_switch(conversation, args).await,
            "getcwd" => self.cmd_getcwd(conversation).await,
            "setcwd" => self.cmd_setcwd(conversation, args).await,
            "command-set" => self.cmd_command_set(conversation, args).await,
            "load-commands" => self.cmd_load_commands(conversation, args).await,
            "commands" => self.cmd_commands(conversation).await,
            "template-add" => self.cmd_template_add(conversation, args).await,
            "workflow" => self.cmd_workflow(conversation, args).await,
            "worktree" => self.cmd_worktree(conversation, args).await,
            "status" => self.cmd_status(conversation).await,
            "reset" => self.cmd_reset(conversation).await,
            "help" => Ok(CommandOutcome::ok(HELP_TEXT)),
            other => Ok(CommandOutcome::fail(format!(
                "Unknown command `/{}`. Try `/help`.",
                other
            ))),
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("command /{} failed: {}", name, e);
                CommandOutcome::fail(e.user_message())
            }
        }
    }

    async fn require_codebase(
        &self,
        conversation: &Conversation,
    ) -> Result<std::result::Result<crate::storage::Codebase, CommandOutcome>> {
        let Some(codebase_id) = &conversation.codebase_id else {
            return Ok(Err(CommandOutcome::fail(NO_CODEBASE_MESSAGE)));
        };
        match self.store.get_codebase(codebase_id).await? {
            Some(codebase) => Ok(Ok(codebase)),
            None => Ok(Err(CommandOutcome::fail(NO_CODEBASE_MESSAGE))),
        }
    }

    async fn cmd_clone(
        &self,
        conversation: &Conversation,
        args: &[String],
    ) -> Result<CommandOutcome> {
        let Some(url) = args.first() else {
            return Ok(CommandOutcome::fail("Usage: /clone <url>"));
        };
        let url = canonicalize_remote_url(url);
        let Some((owner, repo)) = owner_repo_from_url(&url) else {
            return Ok(CommandOutcome::fail(format!(
                "`{}` does not look like a repository URL.",
                url
            )));
        };
        let name = format!("{}/{}", owner, repo);
        let checkout = self.config.workspaces_dir().join(&owner).join(&repo);

        let codebase = match self.store.find_codebase_by_url(&url).await? {
            Some(existing) => {
                // Stale canonical paths are corrected in place.
                if tokio::fs::metadata(existing.default_cwd_path()).await.is_err() {
                    self.ensure_checkout(&url, &checkout).await?;
                    self.store
                        .update_codebase_default_cwd(&existing.id, &checkout.to_string_lossy())
                        .await?;
                }
                self.store
                    .get_codebase(&existing.id)
                    .await?
                    .unwrap_or(existing)
            }
            None => {
                self.ensure_checkout(&url, &checkout).await?;
                self.store
                    .create_codebase(
                        &name,
                        &url,
                        &checkout.to_string_lossy(),
                        &self.config.default_assistant,
                    )
                    .await?
            }
        };

        // Auto-detect the repo's command folder.
        let command_dir = codebase.default_cwd_path().join(DEFAULT_COMMAND_DIR);
        let commands = load_commands_from_dir(&command_dir).await?;
        let loaded = commands.len();
        if loaded > 0 {
            self.store
                .update_codebase_commands(&codebase.id, &commands)
                .await?;
        }

        self.store
            .set_conversation_codebase(&conversation.id, &codebase.id)
            .await?;

        info!("conversation {} bound to codebase {}", conversation.id, name);
        Ok(CommandOutcome::ok(format!(
            "Cloned `{}` ({} commands registered). This conversation now works on `{}`.",
            name, loaded, name
        )))
    }

    async fn ensure_checkout(&self, url: &str, checkout: &Path) -> Result<()> {
        if tokio::fs::metadata(checkout).await.is_ok() {
            return Ok(());
        }
        GitRepo::clone_repo(url, checkout)
            .await
            .map_err(crate::error::ArchonError::from)?;
        Ok(())
    }

    async fn cmd_codebase_switch(
        &self,
        conversation: &Conversation,
        args: &[String],
    ) -> Result<CommandOutcome> {
        let Some(name) = args.first() else {
            return Ok(CommandOutcome::fail("Usage: /codebase-switch <name>"));
        };
        let Some(codebase) = self.store.find_codebase_by_name(name).await? else {
            let known: Vec<String> = self
                .store
                .list_codebases()
                .await?
                .into_iter()
                .map(|c| c.name)
                .collect();
            return Ok(CommandOutcome::fail(format!(
                "Unknown codebase `{}`. Known: {}",
                name,
                if known.is_empty() {
                    "none".to_string()
                } else {
                    known.join(", ")
                }
            )));
        };
        self.store
            .set_conversation_codebase(&conversation.id, &codebase.id)
            .await?;
        Ok(CommandOutcome::ok(format!(
            "Switched to `{}` ({}).",
            codebase.name, codebase.default_cwd
        )))
    }

    async fn cmd_getcwd(&self, conversation: &Conversation) -> Result<CommandOutcome> {
        let codebase = match self.require_codebase(conversation).await? {
            Ok(codebase) => codebase,
            Err(outcome) => return Ok(outcome),
        };
        let cwd = conversation
            .cwd
            .clone()
            .unwrap_or(codebase.default_cwd.clone());
        Ok(CommandOutcome::ok(format!("Working directory: {}", cwd)))
    }

    async fn cmd_setcwd(
        &self,
        conversation: &Conversation,
        args: &[String],
    ) -> Result<CommandOutcome> {
        let Some(path) = args.first() else {
            return Ok(CommandOutcome::fail("Usage: /setcwd <path>"));
        };
        let path_buf = PathBuf::from(path);
        if tokio::fs::metadata(&path_buf).await.is_err() {
            return Ok(CommandOutcome::fail(format!(
                "`{}` does not exist or is unreadable.",
                path
            )));
        }
        self.store
            .set_conversation_cwd(&conversation.id, Some(path))
            .await?;
        Ok(CommandOutcome::ok(format!("Working directory set to {}", path)))
    }

    async fn cmd_command_set(
        &self,
        conversation: &Conversation,
        args: &[String],
    ) -> Result<CommandOutcome> {
        let codebase = match self.require_codebase(conversation).await? {
            Ok(codebase) => codebase,
            Err(outcome) => return Ok(outcome),
        };
        let (Some(name), Some(path)) = (args.first(), args.get(1)) else {
            return Ok(CommandOutcome::fail("Usage: /command-set <name> <path> [text]"));
        };

        let file_path = {
            let p = PathBuf::from(path);
            if p.is_absolute() {
                p
            } else {
                codebase.default_cwd_path().join(p)
            }
        };

        if args.len() > 2 {
            let text = args[2..].join(" ");
            if let Some(parent) = file_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&file_path, &text).await?;
        } else if tokio::fs::metadata(&file_path).await.is_err() {
            return Ok(CommandOutcome::fail(format!(
                "`{}` does not exist. Pass text to create it.",
                file_path.display()
            )));
        }

        let mut commands = codebase.command_registry();
        commands.insert(
            name.clone(),
            CommandSpec {
                path: path.clone(),
                description: String::new(),
            },
        );
        self.store
            .update_codebase_commands(&codebase.id, &commands)
            .await?;
        Ok(CommandOutcome::ok(format!("Command `{}` registered.", name)))
    }

    async fn cmd_load_commands(
        &self,
        conversation: &Conversation,
        args: &[String],
    ) -> Result<CommandOutcome> {
        let codebase = match self.require_codebase(conversation).await? {
            Ok(codebase) => codebase,
            Err(outcome) => return Ok(outcome),
        };
        let Some(folder) = args.first() else {
            return Ok(CommandOutcome::fail("Usage: /load-commands <folder>"));
        };
        let dir = {
            let p = PathBuf::from(folder);
            if p.is_absolute() {
                p
            } else {
                codebase.default_cwd_path().join(p)
            }
        };

        let loaded = load_commands_from_dir(&dir).await?;
        if loaded.is_empty() {
            return Ok(CommandOutcome::fail(format!(
                "No markdown command files found in {}.",
                dir.display()
            )));
        }

        let mut commands = codebase.command_registry();
        let count = loaded.len();
        commands.extend(loaded);
        self.store
            .update_codebase_commands(&codebase.id, &commands)
            .await?;
        Ok(CommandOutcome::ok(format!(
            "Registered {} commands from {}.",
            count,
            dir.display()
        )))
    }

    async fn cmd_commands(&self, conversation: &Conversation) -> Result<CommandOutcome> {
        let codebase = match self.require_codebase(conversation).await? {
            Ok(codebase) => codebase,
            Err(outcome) => return Ok(outcome),
        };
        let commands = codebase.command_registry();
        if commands.is_empty() {
            return Ok(CommandOutcome::ok(
                "No commands registered. Use `/command-set` or `/load-commands`.",
            ));
        }
        let mut names: Vec<_> = commands.iter().collect();
        names.sort_by(|a, b| a.0.cmp(b.0));
        let listing = names
            .iter()
            .map(|(name, spec)| {
                if spec.description.is_empty() {
                    format!("- {}", name)
                } else {
                    format!("- {} - {}", name, spec.description)
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        Ok(CommandOutcome::ok(format!("Registered commands:\n{}", listing)))
    }

    async fn cmd_template_add(
        &self,
        conversation: &Conversation,
        args: &[String],
    ) -> Result<CommandOutcome> {
        let codebase = match self.require_codebase(conversation).await? {
            Ok(codebase) => codebase,
            Err(outcome) => return Ok(outcome),
        };
        let (Some(name), Some(path)) = (args.first(), args.get(1)) else {
            return Ok(CommandOutcome::fail("Usage: /template-add <name> <path>"));
        };

        let source = PathBuf::from(path);
        let text = match tokio::fs::read_to_string(&source).await {
            Ok(text) => text,
            Err(_) => {
                return Ok(CommandOutcome::fail(format!(
                    "`{}` does not exist or is unreadable.",
                    path
                )))
            }
        };

        let templates_dir = self.config.templates_dir();
        tokio::fs::create_dir_all(&templates_dir).await?;
        let dest = templates_dir.join(format!("{}.md", name));
        tokio::fs::write(&dest, text).await?;

        // Promote the template into the current codebase's registry so it is
        // slash-invocable right away.
        let mut commands = codebase.command_registry();
        commands.insert(
            name.clone(),
            CommandSpec {
                path: dest.to_string_lossy().to_string(),
                description: "global template".to_string(),
            },
        );
        self.store
            .update_codebase_commands(&codebase.id, &commands)
            .await?;

        Ok(CommandOutcome::ok(format!(
            "Template `{}` stored and registered.",
            name
        )))
    }

    async fn cmd_workflow(
        &self,
        conversation: &Conversation,
        args: &[String],
    ) -> Result<CommandOutcome> {
        let codebase = match self.require_codebase(conversation).await? {
            Ok(codebase) => codebase,
            Err(outcome) => return Ok(outcome),
        };
        match args.first().map(String::as_str) {
            Some("list") | None => {
                let workflows = self.registry.workflows_for(&codebase).await?;
                let listing = workflows
                    .iter()
                    .map(|w| format!("- {} - {}", w.name, w.description))
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(CommandOutcome::ok(format!("Workflows:\n{}", listing)))
            }
            Some("reload") => {
                let workflows = self.registry.reload(&codebase).await?;
                Ok(CommandOutcome::ok(format!(
                    "Reloaded {} workflows.",
                    workflows.len()
                )))
            }
            Some("cancel") => {
                match self.store.running_workflow_run(&conversation.id).await? {
                    Some(run) => {
                        self.store
                            .set_workflow_run_status(&run.id, WorkflowRunStatus::Cancelled)
                            .await?;
                        Ok(CommandOutcome::ok(format!(
                            "Cancelled workflow `{}`. It stops before its next step.",
                            run.workflow_name
                        )))
                    }
                    None => Ok(CommandOutcome::ok("No workflow is running.")),
                }
            }
            Some(other) => Ok(CommandOutcome::fail(format!(
                "Unknown subcommand `{}`. Use list, reload, or cancel.",
                other
            ))),
        }
    }

    async fn cmd_worktree(
        &self,
        conversation: &Conversation,
        args: &[String],
    ) -> Result<CommandOutcome> {
        let codebase = match self.require_codebase(conversation).await? {
            Ok(codebase) => codebase,
            Err(outcome) => return Ok(outcome),
        };
        match args.first().map(String::as_str) {
            Some("list") | None => {
                let environments = self.provider.list(Some(&codebase.id)).await?;
                if environments.is_empty() {
                    return Ok(CommandOutcome::ok("No active isolation environments."));
                }
                let listing = environments
                    .iter()
                    .map(|e| format!("- {} [{}] {}", e.branch_name, e.workflow_type, e.working_path))
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(CommandOutcome::ok(format!("Isolation environments:\n{}", listing)))
            }
            Some("clean") => {
                let scheduler = CleanupScheduler::new(
                    self.store.clone(),
                    self.provider.clone(),
                    self.config.clone(),
                );
                let report = scheduler.sweep().await?;
                Ok(CommandOutcome::ok(format!(
                    "Cleanup finished: {} removed, {} kept, {} errors.",
                    report.removed,
                    report.skipped,
                    report.errors.len()
                )))
            }
            Some(other) => Ok(CommandOutcome::fail(format!(
                "Unknown subcommand `{}`. Use list or clean.",
                other
            ))),
        }
    }

    async fn cmd_status(&self, conversation: &Conversation) -> Result<CommandOutcome> {
        let mut lines = Vec::new();
        match &conversation.codebase_id {
            Some(codebase_id) => match self.store.get_codebase(codebase_id).await? {
                Some(codebase) => {
                    let cwd = conversation
                        .cwd
                        .clone()
                        .unwrap_or(codebase.default_cwd.clone());
                    lines.push(format!("Codebase: {}", codebase.name));
                    lines.push(format!("Working directory: {}", cwd));
                    lines.push(format!("Assistant: {}", conversation.assistant_type));
                    lines.push(format!(
                        "Commands: {}",
                        codebase.command_registry().len()
                    ));
                }
                None => lines.push(NO_CODEBASE_MESSAGE.to_string()),
            },
            None => lines.push(NO_CODEBASE_MESSAGE.to_string()),
        }

        match self.sessions.active_session(&conversation.id).await? {
            Some(session) => lines.push(format!(
                "Active session: {} (assistant id {})",
                session.id,
                session.assistant_session_id.as_deref().unwrap_or("none")
            )),
            None => lines.push("Active session: none".to_string()),
        }

        Ok(CommandOutcome::ok(lines.join("\n")))
    }

    async fn cmd_reset(&self, conversation: &Conversation) -> Result<CommandOutcome> {
        let deactivated = self.sessions.reset(&conversation.id).await?;

        // A reset also cancels any in-flight workflow run.
        if let Some(run) = self.store.running_workflow_run(&conversation.id).await? {
            self.store
                .set_workflow_run_status(&run.id, WorkflowRunStatus::Cancelled)
                .await?;
        }

        Ok(CommandOutcome::ok(if deactivated {
            "Session reset. The next message starts a fresh assistant context."
        } else {
            "No active session; nothing to reset."
        }))
    }
}
