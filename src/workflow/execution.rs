//! Workflow execution engine.
//!
//! Drives step-based and loop-based workflows through the assistant client,
//! one turn per step/iteration, persisting session and run state as it goes.
//! Cancellation is cooperative: the store's run status is checked between
//! steps and iterations, never mid-turn.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use ai_client::{AssistantClient, QueryRequest};

use crate::commands::resolve_command_text;
use crate::error::{ArchonError, Result};
use crate::git::GitRepo;
use crate::orchestrator::stream::{StreamProjector, TurnOutput};
use crate::platform::PlatformAdapter;
use crate::session::SessionManager;
use crate::storage::{Codebase, Conversation, Store, WorkflowRun, WorkflowRunStatus};
use crate::template::{assemble_prompt, PromptContext};

use super::{LoopSpec, SingleStep, WorkflowDefinition, WorkflowStep};

/// Everything one workflow run needs.
pub struct WorkflowDispatch {
    pub run: WorkflowRun,
    pub definition: WorkflowDefinition,
    pub conversation: Conversation,
    pub codebase: Codebase,
    /// Working directory the assistant operates in (worktree or canonical).
    pub cwd: PathBuf,
    /// Platform-side conversation key for outbound messages.
    pub platform_conversation_id: String,
    pub external_context: Option<String>,
    pub client: Arc<dyn AssistantClient>,
    pub adapter: Arc<dyn PlatformAdapter>,
}

enum ExitKind {
    Completed,
    Cancelled,
}

/// Run one assistant turn end to end.
pub(crate) async fn run_turn(
    client: &dyn AssistantClient,
    adapter: Arc<dyn PlatformAdapter>,
    conversation_key: &str,
    prompt: String,
    cwd: &Path,
    resume_id: Option<String>,
) -> Result<TurnOutput> {
    let mut request = QueryRequest::new(prompt, cwd);
    if let Some(resume_id) = resume_id {
        request = request.resuming(resume_id);
    }
    let stream = client.send_query(request).await?;
    StreamProjector::new(adapter, conversation_key).drive(stream).await
}

fn meta(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Executes workflow runs.
pub struct WorkflowExecutor {
    store: Store,
    sessions: SessionManager,
}

impl WorkflowExecutor {
    pub fn new(store: Store) -> Self {
        let sessions = SessionManager::new(store.clone());
        Self { store, sessions }
    }

    /// Execute the run to completion, failure, or cancellation. The run
    /// status and the auto-commit safety net are handled here; the caller
    /// only reports errors to the user.
    pub async fn execute(&self, dispatch: WorkflowDispatch) -> Result<()> {
        info!(
            workflow = %dispatch.definition.name,
            run = %dispatch.run.id,
            "starting workflow run"
        );

        let result = if let Some(loop_spec) = dispatch.definition.loop_spec.clone() {
            self.run_loop(&dispatch, &loop_spec).await
        } else {
            self.run_steps(&dispatch).await
        };

        match result {
            Ok(ExitKind::Completed) => {
                self.store
                    .set_workflow_run_status(&dispatch.run.id, WorkflowRunStatus::Completed)
                    .await?;
                self.auto_commit(&dispatch, "completed").await;
                Ok(())
            }
            Ok(ExitKind::Cancelled) => {
                info!(run = %dispatch.run.id, "workflow run cancelled");
                Ok(())
            }
            Err(e) => {
                self.store
                    .merge_workflow_run_metadata(
                        &dispatch.run.id,
                        &meta(&[
                            ("exitReason", serde_json::json!("error")),
                            ("error", serde_json::json!(e.to_string())),
                        ]),
                    )
                    .await?;
                self.store
                    .set_workflow_run_status(&dispatch.run.id, WorkflowRunStatus::Failed)
                    .await?;
                self.auto_commit(&dispatch, "failed").await;
                Err(e)
            }
        }
    }

    /// Stage and commit whatever the run left in the working directory so
    /// partial work survives later runs on the same worktree.
    async fn auto_commit(&self, dispatch: &WorkflowDispatch, outcome: &str) {
        let repo = GitRepo::open(&dispatch.cwd);
        let message = format!(
            "archon: auto-commit after {} workflow `{}`",
            outcome, dispatch.definition.name
        );
        if let Err(e) = repo.commit_all(&message).await {
            warn!("auto-commit in {} failed: {}", dispatch.cwd.display(), e);
        }
    }

    async fn is_cancelled(&self, run_id: &str) -> Result<bool> {
        Ok(self
            .store
            .get_workflow_run(run_id)
            .await?
            .and_then(|run| run.run_status())
            == Some(WorkflowRunStatus::Cancelled))
    }

    /// Prompt context shared by every step of a run: the trigger message as
    /// `$1`/`$ARGUMENTS`/`$USER_MESSAGE`, string-valued run metadata as
    /// named bindings, and the external context on both channels.
    fn step_context(&self, dispatch: &WorkflowDispatch) -> PromptContext {
        let mut ctx = PromptContext::new(vec![dispatch.run.trigger_message.clone()])
            .with_named("USER_MESSAGE", dispatch.run.trigger_message.clone())
            .with_named("WORKFLOW_NAME", dispatch.definition.name.clone())
            .with_external_context(dispatch.external_context.clone());
        for (key, value) in dispatch.run.metadata_map() {
            if let Some(value) = value.as_str() {
                ctx.named.entry(key).or_insert_with(|| value.to_string());
            }
        }
        ctx
    }

    async fn run_steps(&self, dispatch: &WorkflowDispatch) -> Result<ExitKind> {
        // The first step always starts fresh; so does the step after a
        // parallel block.
        let mut force_fresh = true;

        for (index, step) in dispatch.definition.steps.iter().enumerate() {
            if self.is_cancelled(&dispatch.run.id).await? {
                return Ok(ExitKind::Cancelled);
            }

            match step {
                WorkflowStep::Single(single) => {
                    let fresh = force_fresh || single.clear_context;
                    self.run_single_step(dispatch, single, fresh).await?;
                    force_fresh = false;
                }
                WorkflowStep::Parallel { parallel } => {
                    self.run_parallel_block(dispatch, parallel, index).await?;
                    force_fresh = true;
                }
            }

            self.store
                .merge_workflow_run_metadata(
                    &dispatch.run.id,
                    &meta(&[("lastStepIndex", serde_json::json!(index))]),
                )
                .await?;
        }

        self.store
            .merge_workflow_run_metadata(
                &dispatch.run.id,
                &meta(&[("exitReason", serde_json::json!("completed"))]),
            )
            .await?;
        Ok(ExitKind::Completed)
    }

    async fn run_single_step(
        &self,
        dispatch: &WorkflowDispatch,
        step: &SingleStep,
        fresh: bool,
    ) -> Result<()> {
        let template = resolve_command_text(&dispatch.codebase, &step.command).await?;
        let prompt = assemble_prompt(&template, &self.step_context(dispatch));

        let turn = if fresh {
            self.sessions
                .begin_fresh(&dispatch.conversation, &dispatch.codebase.id)
                .await?
        } else {
            self.sessions
                .begin_turn(&dispatch.conversation, &dispatch.codebase.id, Some(&step.command))
                .await?
        };

        let output = run_turn(
            dispatch.client.as_ref(),
            dispatch.adapter.clone(),
            &dispatch.platform_conversation_id,
            prompt,
            &dispatch.cwd,
            turn.resume_id.clone(),
        )
        .await?;

        self.sessions
            .complete_turn(
                &turn.session.id,
                output.assistant_session_id.as_deref(),
                Some(&step.command),
            )
            .await?;
        Ok(())
    }

    /// Run every step of the block concurrently against the shared working
    /// directory, each on its own fresh session. Any failure aborts the
    /// siblings and fails the block.
    async fn run_parallel_block(
        &self,
        dispatch: &WorkflowDispatch,
        steps: &[SingleStep],
        block_index: usize,
    ) -> Result<()> {
        // Sessions are created sequentially (the store keeps only the last
        // one active); the turns themselves run concurrently.
        let mut prepared = Vec::with_capacity(steps.len());
        for step in steps {
            let template = resolve_command_text(&dispatch.codebase, &step.command).await?;
            let prompt = assemble_prompt(&template, &self.step_context(dispatch));
            let turn = self
                .sessions
                .begin_fresh(&dispatch.conversation, &dispatch.codebase.id)
                .await?;
            prepared.push((step.command.clone(), prompt, turn.session.id));
        }

        let mut tasks: JoinSet<Result<(String, String, TurnOutput)>> = JoinSet::new();
        for (command, prompt, session_id) in prepared {
            let client = dispatch.client.clone();
            let adapter = dispatch.adapter.clone();
            let key = dispatch.platform_conversation_id.clone();
            let cwd = dispatch.cwd.clone();
            tasks.spawn(async move {
                let output = run_turn(client.as_ref(), adapter, &key, prompt, &cwd, None).await?;
                Ok((command, session_id, output))
            });
        }

        let mut failure: Option<ArchonError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((command, session_id, output))) => {
                    self.sessions
                        .complete_turn(
                            &session_id,
                            output.assistant_session_id.as_deref(),
                            Some(&command),
                        )
                        .await?;
                }
                Ok(Err(e)) => {
                    tasks.abort_all();
                    failure = Some(e);
                    break;
                }
                Err(join_error) => {
                    tasks.abort_all();
                    failure = Some(ArchonError::Other {
                        message: format!("parallel step task failed: {}", join_error),
                        source: None,
                    });
                    break;
                }
            }
        }

        if let Some(e) = failure {
            // Drain aborted siblings before reporting.
            while tasks.join_next().await.is_some() {}
            self.store
                .merge_workflow_run_metadata(
                    &dispatch.run.id,
                    &meta(&[("failedBlock", serde_json::json!(block_index))]),
                )
                .await?;
            return Err(e);
        }
        Ok(())
    }

    async fn run_loop(&self, dispatch: &WorkflowDispatch, spec: &LoopSpec) -> Result<ExitKind> {
        let canonical_signal = format!("<promise>{}</promise>", spec.until);
        let mut started = false;

        for iteration in 1..=spec.max_iterations {
            if self.is_cancelled(&dispatch.run.id).await? {
                return Ok(ExitKind::Cancelled);
            }

            let turn = if spec.fresh_context || !started {
                self.sessions
                    .begin_fresh(&dispatch.conversation, &dispatch.codebase.id)
                    .await?
            } else {
                self.sessions
                    .begin_turn(&dispatch.conversation, &dispatch.codebase.id, None)
                    .await?
            };
            started = true;

            let mut ctx = self.step_context(dispatch);
            ctx.named
                .insert("ITERATION".to_string(), iteration.to_string());
            let prompt = assemble_prompt(&spec.prompt, &ctx);

            let output = run_turn(
                dispatch.client.as_ref(),
                dispatch.adapter.clone(),
                &dispatch.platform_conversation_id,
                prompt,
                &dispatch.cwd,
                turn.resume_id.clone(),
            )
            .await?;

            self.sessions
                .complete_turn(&turn.session.id, output.assistant_session_id.as_deref(), None)
                .await?;

            // Signal wins over the iteration cap when both land at once.
            if output.text.contains(&canonical_signal) || output.text.contains(&spec.until) {
                self.store
                    .merge_workflow_run_metadata(
                        &dispatch.run.id,
                        &meta(&[
                            ("exitReason", serde_json::json!("completion-signal")),
                            ("iterations", serde_json::json!(iteration)),
                        ]),
                    )
                    .await?;
                return Ok(ExitKind::Completed);
            }
        }

        self.store
            .merge_workflow_run_metadata(
                &dispatch.run.id,
                &meta(&[
                    ("exitReason", serde_json::json!("max-iterations")),
                    ("iterations", serde_json::json!(spec.max_iterations)),
                ]),
            )
            .await?;
        Ok(ExitKind::Completed)
    }
}
