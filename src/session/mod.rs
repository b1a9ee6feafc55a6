//! Assistant session lifecycle.
//!
//! A session is one assistant subprocess context, resumable across turns via
//! the opaque id the assistant SDK hands back. The manager decides, per
//! dispatch, whether the conversation's active session can be resumed or a
//! fresh one must be created.

use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::Result;
use crate::storage::{Conversation, Session, Store};

/// Session-metadata key recording the most recently executed command.
pub const LAST_COMMAND_KEY: &str = "lastCommand";

/// Command whose execution forces the next `execute` onto a fresh context.
const PLAN_COMMAND: &str = "plan-feature";

/// Command that consumes a prior plan and must not inherit its context.
const EXECUTE_COMMAND: &str = "execute";

/// Whether the next turn resumes the active session or starts fresh.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionDecision {
    Fresh,
    Resume(Box<Session>),
}

/// Decide per the transition rule: fresh iff there is no active session, the
/// assistant type changed, or a plan is about to be executed.
pub fn decide_session(
    active: Option<&Session>,
    assistant_type: &str,
    next_command: Option<&str>,
) -> SessionDecision {
    let Some(active) = active else {
        return SessionDecision::Fresh;
    };
    if active.assistant_type != assistant_type {
        debug!(
            "assistant type changed ({} -> {}), forcing fresh session",
            active.assistant_type, assistant_type
        );
        return SessionDecision::Fresh;
    }
    if next_command == Some(EXECUTE_COMMAND)
        && active.last_command().as_deref() == Some(PLAN_COMMAND)
    {
        debug!("plan -> execute transition, forcing fresh session");
        return SessionDecision::Fresh;
    }
    SessionDecision::Resume(Box::new(active.clone()))
}

/// A session resolved for one assistant turn.
#[derive(Debug, Clone)]
pub struct TurnSession {
    pub session: Session,
    /// Assistant-side id to resume with; `None` means start fresh.
    pub resume_id: Option<String>,
}

/// Manager over the session rows of the store.
#[derive(Debug, Clone)]
pub struct SessionManager {
    store: Store,
}

impl SessionManager {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn active_session(&self, conversation_id: &str) -> Result<Option<Session>> {
        self.store.active_session(conversation_id).await
    }

    /// Resolve the session for a turn, applying the transition rule. The
    /// conversation's locked assistant type always wins.
    pub async fn begin_turn(
        &self,
        conversation: &Conversation,
        codebase_id: &str,
        next_command: Option<&str>,
    ) -> Result<TurnSession> {
        let active = self.store.active_session(&conversation.id).await?;
        match decide_session(active.as_ref(), &conversation.assistant_type, next_command) {
            SessionDecision::Resume(session) => {
                let resume_id = session.assistant_session_id.clone();
                Ok(TurnSession {
                    session: *session,
                    resume_id,
                })
            }
            SessionDecision::Fresh => {
                let session = self
                    .store
                    .create_session(&conversation.id, codebase_id, &conversation.assistant_type)
                    .await?;
                Ok(TurnSession {
                    session,
                    resume_id: None,
                })
            }
        }
    }

    /// Always start a fresh session (parallel-block steps, fresh-context
    /// loops, post-parallel steps).
    pub async fn begin_fresh(
        &self,
        conversation: &Conversation,
        codebase_id: &str,
    ) -> Result<TurnSession> {
        let session = self
            .store
            .create_session(&conversation.id, codebase_id, &conversation.assistant_type)
            .await?;
        Ok(TurnSession {
            session,
            resume_id: None,
        })
    }

    /// Persist the outcome of a completed turn.
    pub async fn complete_turn(
        &self,
        session_id: &str,
        assistant_session_id: Option<&str>,
        last_command: Option<&str>,
    ) -> Result<()> {
        if let Some(assistant_session_id) = assistant_session_id {
            self.store
                .set_assistant_session_id(session_id, assistant_session_id)
                .await?;
        }
        if let Some(command) = last_command {
            let mut patch = HashMap::new();
            patch.insert(LAST_COMMAND_KEY.to_string(), serde_json::json!(command));
            self.store.merge_session_metadata(session_id, &patch).await?;
        }
        Ok(())
    }

    /// Deactivate the conversation's active session if there is one.
    /// Idempotent on a clean state.
    pub async fn reset(&self, conversation_id: &str) -> Result<bool> {
        match self.store.active_session(conversation_id).await? {
            Some(session) => {
                self.store.deactivate_session(&session.id).await?;
                info!("deactivated session {} for {}", session.id, conversation_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn session(assistant_type: &str, last_command: Option<&str>) -> Session {
        let metadata = match last_command {
            Some(cmd) => format!(r#"{{"lastCommand":"{}"}}"#, cmd),
            None => "{}".to_string(),
        };
        Session {
            id: "s1".to_string(),
            conversation_id: "c1".to_string(),
            codebase_id: "cb1".to_string(),
            assistant_type: assistant_type.to_string(),
            assistant_session_id: Some("claude-abc".to_string()),
            active: true,
            metadata,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn no_active_session_means_fresh() {
        assert_eq!(decide_session(None, "claude", None), SessionDecision::Fresh);
    }

    #[test]
    fn matching_type_resumes() {
        let s = session("claude", Some("review"));
        assert!(matches!(
            decide_session(Some(&s), "claude", Some("review")),
            SessionDecision::Resume(_)
        ));
    }

    #[test]
    fn assistant_type_change_forces_fresh() {
        let s = session("codex", None);
        assert_eq!(decide_session(Some(&s), "claude", None), SessionDecision::Fresh);
    }

    #[test]
    fn plan_to_execute_forces_fresh() {
        let s = session("claude", Some("plan-feature"));
        assert_eq!(
            decide_session(Some(&s), "claude", Some("execute")),
            SessionDecision::Fresh
        );
        // execute after anything else resumes
        let s = session("claude", Some("review"));
        assert!(matches!(
            decide_session(Some(&s), "claude", Some("execute")),
            SessionDecision::Resume(_)
        ));
        // plan-feature followed by non-execute resumes
        let s = session("claude", Some("plan-feature"));
        assert!(matches!(
            decide_session(Some(&s), "claude", Some("review")),
            SessionDecision::Resume(_)
        ));
    }
}
