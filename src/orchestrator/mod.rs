//! Per-message orchestration pipeline.
//!
//! One inbound message runs the full pipeline under the conversation lock:
//! hydrate state, branch to deterministic command handling or AI dispatch,
//! resolve isolation, drive the assistant, persist, and fan streamed events
//! out to the platform. Errors below the pre-flight gates are classified and
//! delivered to the user; the lock always releases.

pub mod lock;
pub mod stream;

pub use lock::ConversationLock;
pub use stream::{StreamProjector, TurnOutput};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use ai_client::AssistantClient;

use crate::commands::handler::NO_CODEBASE_MESSAGE;
use crate::commands::{parse_command_line, resolve_command_text, CommandHandler};
use crate::config::ArchonConfig;
use crate::error::{ArchonError, Result};
use crate::isolation::{
    DestroyOptions, IsolationProvider, IsolationRequest, WorktreeProvider,
};
use crate::platform::{InboundMessage, IsolationHints, PlatformAdapter};
use crate::session::SessionManager;
use crate::storage::{Codebase, Conversation, Store};
use crate::template::{assemble_prompt, PromptContext};
use crate::workflow::execution::run_turn;
use crate::workflow::router::RouteContext;
use crate::workflow::{Router, WorkflowDispatch, WorkflowExecutor, WorkflowRegistry};

/// The message-handling core. One instance serves all platforms.
pub struct Orchestrator {
    store: Store,
    config: Arc<ArchonConfig>,
    lock: ConversationLock,
    /// Bounds concurrently running handlers across all conversations.
    handler_permits: Arc<tokio::sync::Semaphore>,
    provider: Arc<WorktreeProvider>,
    registry: Arc<WorkflowRegistry>,
    router: Router,
    commands: CommandHandler,
    sessions: SessionManager,
    executor: WorkflowExecutor,
    clients: HashMap<String, Arc<dyn AssistantClient>>,
}

impl Orchestrator {
    pub fn new(
        store: Store,
        config: Arc<ArchonConfig>,
        clients: HashMap<String, Arc<dyn AssistantClient>>,
    ) -> Self {
        let provider = Arc::new(WorktreeProvider::new(store.clone(), config.clone()));
        let registry = Arc::new(WorkflowRegistry::new());
        let router = Router::new(registry.clone());
        let commands = CommandHandler::new(
            store.clone(),
            config.clone(),
            provider.clone(),
            registry.clone(),
        );
        let sessions = SessionManager::new(store.clone());
        let executor = WorkflowExecutor::new(store.clone());
        let handler_permits = Arc::new(tokio::sync::Semaphore::new(
            config.handler_pool_size.max(1),
        ));
        Self {
            store,
            config,
            lock: ConversationLock::new(),
            handler_permits,
            provider,
            registry,
            router,
            commands,
            sessions,
            executor,
            clients,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn provider(&self) -> Arc<WorktreeProvider> {
        self.provider.clone()
    }

    pub fn registry(&self) -> Arc<WorkflowRegistry> {
        self.registry.clone()
    }

    /// Entry point for platform adapters. Serializes per conversation,
    /// classifies errors into user messages, and propagates only fatal ones.
    pub async fn handle_message(
        &self,
        adapter: Arc<dyn PlatformAdapter>,
        message: InboundMessage,
    ) -> Result<()> {
        let conversation_key = adapter
            .ensure_thread(&message.platform_conversation_id)
            .await?;

        // Pool bound first, then the per-conversation lock; both queue FIFO.
        let _permit = self
            .handler_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ArchonError::busy("handler pool is shut down"))?;
        let lock_key = format!("{}:{}", adapter.platform_type(), conversation_key);
        let _guard = self.lock.acquire(&lock_key).await;

        match self
            .handle_locked(adapter.clone(), &conversation_key, &message)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                error!("message handling failed: {:#?}", e);
                let _ = adapter
                    .send_message(&conversation_key, &e.user_message())
                    .await;
                Ok(())
            }
        }
    }

    async fn handle_locked(
        &self,
        adapter: Arc<dyn PlatformAdapter>,
        conversation_key: &str,
        message: &InboundMessage,
    ) -> Result<()> {
        // Hydrate, reconciling runs a dead process left behind.
        let mut conversation = self
            .store
            .get_or_create_conversation(
                adapter.platform_type(),
                conversation_key,
                &self.config.default_assistant,
            )
            .await?;
        let abandoned = self.store.fail_abandoned_runs(&conversation.id).await?;
        if abandoned > 0 {
            info!("reconciled {} abandoned workflow runs", abandoned);
        }

        // Pre-flight: deterministic slash commands short-circuit everything.
        let parsed_command = parse_command_line(&message.text);
        if let Some((name, args)) = &parsed_command {
            if name != "command-invoke" {
                let outcome = self.commands.handle(&conversation, name, args).await;
                adapter
                    .send_message(conversation_key, &outcome.message)
                    .await?;
                return Ok(());
            }
        }

        // Everything past this point needs a codebase.
        let Some(codebase_id) = conversation.codebase_id.clone() else {
            adapter
                .send_message(conversation_key, NO_CODEBASE_MESSAGE)
                .await?;
            return Ok(());
        };
        let Some(codebase) = self.store.get_codebase(&codebase_id).await? else {
            return Err(ArchonError::not_found("codebase", codebase_id));
        };

        // Isolation resolution.
        if let Some(hints) = &message.isolation_hints {
            if hints.close_event {
                let summary = self.handle_close_event(&codebase, hints).await?;
                adapter.send_message(conversation_key, &summary).await?;
                return Ok(());
            }
            let request = isolation_request(&codebase, hints, adapter.platform_type());
            let environment = self.provider.create(&request).await?;
            self.store
                .set_conversation_cwd(&conversation.id, Some(&environment.working_path))
                .await?;
            conversation.cwd = Some(environment.working_path.clone());
        }

        let cwd = conversation
            .cwd_path()
            .unwrap_or_else(|| codebase.default_cwd_path());
        let client = self.client_for(&conversation.assistant_type)?;

        // Branch: registered command as a single assistant turn.
        if let Some((_, args)) = parsed_command {
            return self
                .invoke_command(adapter, conversation_key, &conversation, &codebase, &cwd, client, &args, message)
                .await;
        }

        // Branch: routed workflow.
        let route_context = RouteContext {
            platform_type: adapter.platform_type().to_string(),
            isolation_hints: message.isolation_hints.clone(),
            thread_history: message.thread_history.clone(),
        };
        let definition = self
            .router
            .select(client.as_ref(), &codebase, &message.text, &route_context)
            .await?;

        let mut run_metadata = HashMap::new();
        if let Some(external_context) = &message.external_context {
            run_metadata.insert(
                "externalContext".to_string(),
                serde_json::json!(external_context),
            );
        }
        let run = self
            .store
            .create_workflow_run(
                &conversation.id,
                &codebase.id,
                &definition.name,
                &message.text,
                &run_metadata,
            )
            .await?;

        self.executor
            .execute(WorkflowDispatch {
                run,
                definition,
                conversation,
                codebase,
                cwd,
                platform_conversation_id: conversation_key.to_string(),
                external_context: message.external_context.clone(),
                client,
                adapter,
            })
            .await
    }

    /// `/command-invoke NAME ARGS...`: one assistant turn honoring the
    /// session transition rule.
    #[allow(clippy::too_many_arguments)]
    async fn invoke_command(
        &self,
        adapter: Arc<dyn PlatformAdapter>,
        conversation_key: &str,
        conversation: &Conversation,
        codebase: &Codebase,
        cwd: &PathBuf,
        client: Arc<dyn AssistantClient>,
        args: &[String],
        message: &InboundMessage,
    ) -> Result<()> {
        let Some(command_name) = args.first() else {
            adapter
                .send_message(conversation_key, "Usage: /command-invoke <name> [args]")
                .await?;
            return Ok(());
        };

        let template = resolve_command_text(codebase, command_name).await?;
        let command_args: Vec<String> = args[1..].to_vec();
        let context = PromptContext::new(command_args.clone())
            .with_named("USER_MESSAGE", command_args.join(" "))
            .with_external_context(message.external_context.clone());
        let prompt = assemble_prompt(&template, &context);

        let turn = self
            .sessions
            .begin_turn(conversation, &codebase.id, Some(command_name))
            .await?;
        let output = run_turn(
            client.as_ref(),
            adapter,
            conversation_key,
            prompt,
            cwd,
            turn.resume_id.clone(),
        )
        .await?;
        self.sessions
            .complete_turn(
                &turn.session.id,
                output.assistant_session_id.as_deref(),
                Some(command_name),
            )
            .await?;
        Ok(())
    }

    /// Close events destroy the hinted environment instead of dispatching.
    async fn handle_close_event(
        &self,
        codebase: &Codebase,
        hints: &IsolationHints,
    ) -> Result<String> {
        let request = isolation_request(codebase, hints, "");
        let branch = crate::isolation::branch_name(&request);
        let path = crate::isolation::worktree_path(
            &self.config.worktree_base(),
            &codebase.default_cwd_path(),
            &branch,
        );

        match self
            .store
            .find_active_environment_by_path(&path.to_string_lossy())
            .await?
        {
            Some(environment) => {
                self.provider
                    .destroy(
                        &environment.id,
                        DestroyOptions {
                            force: true,
                            branch_name: Some(branch.clone()),
                            canonical_repo_path: Some(codebase.default_cwd_path()),
                        },
                    )
                    .await?;
                Ok(format!(
                    "Cleaned up the working directory for `{}` (branch {}).",
                    hints.identifier, branch
                ))
            }
            None => Ok(format!(
                "Nothing to clean up for `{}`.",
                hints.identifier
            )),
        }
    }

    fn client_for(&self, assistant_type: &str) -> Result<Arc<dyn AssistantClient>> {
        self.clients
            .get(assistant_type)
            .cloned()
            .ok_or_else(|| ArchonError::not_found("assistant client", assistant_type))
    }
}

fn isolation_request(
    codebase: &Codebase,
    hints: &IsolationHints,
    platform_type: &str,
) -> IsolationRequest {
    IsolationRequest {
        codebase_id: codebase.id.clone(),
        canonical_repo_path: codebase.default_cwd_path(),
        workflow_type: hints.workflow_type,
        identifier: hints.identifier.clone(),
        pr_branch: hints.pr_branch.clone(),
        pr_sha: hints.pr_sha.clone(),
        is_fork_pr: hints.is_fork_pr,
        platform_type: platform_type.to_string(),
    }
}
