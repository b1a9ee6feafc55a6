//! Free-form message routing.
//!
//! A short assistant classification call picks a workflow by name from the
//! codebase's discoverable definitions. Every failure mode (transport
//! error, unknown name, empty reply) falls back to the `assist` workflow,
//! so routing always produces a dispatch target.

use std::sync::Arc;
use tracing::{debug, warn};

use ai_client::{AssistantClient, MessageChunk, QueryRequest};

use crate::error::Result;
use crate::platform::IsolationHints;
use crate::storage::Codebase;

use super::{WorkflowDefinition, WorkflowRegistry, ASSIST_WORKFLOW};

/// Platform facts folded into the classifier prompt.
#[derive(Debug, Default, Clone)]
pub struct RouteContext {
    pub platform_type: String,
    pub isolation_hints: Option<IsolationHints>,
    pub thread_history: Vec<String>,
}

/// Workflow selector over the registry.
pub struct Router {
    registry: Arc<WorkflowRegistry>,
}

impl Router {
    pub fn new(registry: Arc<WorkflowRegistry>) -> Self {
        Self { registry }
    }

    /// Pick a workflow for the message. Never fails to produce one.
    pub async fn select(
        &self,
        client: &dyn AssistantClient,
        codebase: &Codebase,
        message: &str,
        context: &RouteContext,
    ) -> Result<WorkflowDefinition> {
        let workflows = self.registry.workflows_for(codebase).await?;
        let fallback = || {
            workflows
                .iter()
                .find(|w| w.name == ASSIST_WORKFLOW)
                .cloned()
                .unwrap_or_else(super::builtin_assist)
        };

        // One candidate means no classification is needed.
        if workflows.len() == 1 {
            return Ok(fallback());
        }

        let prompt = build_classifier_prompt(&workflows, message, context);
        let reply = match classification_reply(client, codebase, prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("workflow classification failed, using assist: {}", e);
                return Ok(fallback());
            }
        };

        match parse_selection(&reply, &workflows) {
            Some(selected) => {
                debug!("routed message to workflow {}", selected.name);
                Ok(selected)
            }
            None => {
                warn!("classifier answered with unknown workflow: {:?}", reply.trim());
                Ok(fallback())
            }
        }
    }
}

fn build_classifier_prompt(
    workflows: &[WorkflowDefinition],
    message: &str,
    context: &RouteContext,
) -> String {
    let mut prompt = String::from(
        "Select the single best workflow for the user message below. \
         Reply with the workflow name only, nothing else.\n\n",
    );

    prompt.push_str(&format!("Platform: {}\n", context.platform_type));
    if let Some(hints) = &context.isolation_hints {
        prompt.push_str(&format!("Trigger kind: {}\n", hints.workflow_type));
        if !hints.pr_labels.is_empty() {
            prompt.push_str(&format!("PR labels: {}\n", hints.pr_labels.join(", ")));
        }
    }
    if !context.thread_history.is_empty() {
        prompt.push_str("Recent thread messages:\n");
        for entry in context.thread_history.iter().rev().take(5).rev() {
            prompt.push_str(&format!("- {}\n", entry));
        }
    }

    prompt.push_str("\nAvailable workflows:\n");
    for workflow in workflows {
        prompt.push_str(&format!("- {}: {}\n", workflow.name, workflow.description));
    }

    prompt.push_str(&format!("\nUser message:\n{}\n", message));
    prompt
}

/// Run the classification turn and buffer the assistant text. The call runs
/// against the canonical checkout, never a worktree, and never resumes.
async fn classification_reply(
    client: &dyn AssistantClient,
    codebase: &Codebase,
    prompt: String,
) -> Result<String> {
    let request = QueryRequest::new(prompt, codebase.default_cwd_path());
    let mut stream = client.send_query(request).await?;
    let mut reply = String::new();
    while let Some(item) = stream.recv().await {
        if let MessageChunk::Assistant { content } = item? {
            reply.push_str(&content);
            reply.push('\n');
        }
    }
    Ok(reply)
}

/// Extract a known workflow name from the reply: first an exact line match,
/// then a substring scan preferring longer names.
fn parse_selection(
    reply: &str,
    workflows: &[WorkflowDefinition],
) -> Option<WorkflowDefinition> {
    for line in reply.lines() {
        let candidate = line.trim().trim_matches('`').trim_matches('"');
        if let Some(found) = workflows
            .iter()
            .find(|w| w.name.eq_ignore_ascii_case(candidate))
        {
            return Some(found.clone());
        }
    }

    let lowered = reply.to_ascii_lowercase();
    let mut by_length: Vec<&WorkflowDefinition> = workflows.iter().collect();
    by_length.sort_by_key(|w| std::cmp::Reverse(w.name.len()));
    by_length
        .into_iter()
        .find(|w| lowered.contains(&w.name.to_ascii_lowercase()))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{SingleStep, WorkflowStep};
    use ai_client::MockAssistantClient;
    use chrono::Utc;

    fn workflow(name: &str, description: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            name: name.to_string(),
            description: description.to_string(),
            provider: "claude".to_string(),
            steps: vec![WorkflowStep::Single(SingleStep {
                command: ASSIST_WORKFLOW.to_string(),
                clear_context: false,
            })],
            loop_spec: None,
        }
    }

    fn codebase(default_cwd: &std::path::Path) -> Codebase {
        Codebase {
            id: "cb".to_string(),
            name: "o/r".to_string(),
            remote_url: "https://github.com/o/r".to_string(),
            default_cwd: default_cwd.to_string_lossy().to_string(),
            assistant_type: "claude".to_string(),
            commands: "{}".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn parses_exact_and_fuzzy_selections() {
        let workflows = vec![workflow("implement", ""), workflow("review", ""), workflow("assist", "")];
        assert_eq!(
            parse_selection("implement", &workflows).unwrap().name,
            "implement"
        );
        assert_eq!(
            parse_selection("`review`\n", &workflows).unwrap().name,
            "review"
        );
        assert_eq!(
            parse_selection("I would pick the implement workflow here.", &workflows)
                .unwrap()
                .name,
            "implement"
        );
        assert!(parse_selection("no idea", &workflows).is_none());
    }

    #[tokio::test]
    async fn unknown_reply_falls_back_to_assist() {
        let temp = tempfile::TempDir::new().unwrap();
        let registry = Arc::new(WorkflowRegistry::new());
        let router = Router::new(registry);
        let client = MockAssistantClient::new("claude");
        client.push_text_turn("something unrelated", "s1");

        // Registry only discovers assist for an empty repo, so selection
        // short-circuits; either way the result is assist.
        let selected = router
            .select(&client, &codebase(temp.path()), "do a thing", &RouteContext::default())
            .await
            .unwrap();
        assert_eq!(selected.name, ASSIST_WORKFLOW);
    }

    #[test]
    fn classifier_prompt_lists_workflows_and_hints() {
        let workflows = vec![workflow("implement", "build features"), workflow("assist", "fallback")];
        let context = RouteContext {
            platform_type: "github".to_string(),
            isolation_hints: Some(IsolationHints {
                workflow_type: crate::isolation::WorkflowType::Pr,
                identifier: "42".to_string(),
                pr_branch: None,
                pr_sha: None,
                is_fork_pr: false,
                pr_labels: vec!["bug".to_string()],
                close_event: false,
            }),
            thread_history: vec!["earlier message".to_string()],
        };
        let prompt = build_classifier_prompt(&workflows, "fix the crash", &context);
        assert!(prompt.contains("implement: build features"));
        assert!(prompt.contains("Platform: github"));
        assert!(prompt.contains("PR labels: bug"));
        assert!(prompt.contains("earlier message"));
        assert!(prompt.contains("fix the crash"));
    }
}
