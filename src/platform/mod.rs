//! Platform adapter contract.
//!
//! Adapters own SDK wiring, auth whitelists, chunking, and signature
//! verification; the core only needs a way to deliver text and a few facts
//! about the platform. Inbound traffic arrives as [`InboundMessage`] through
//! `Orchestrator::handle_message` after the adapter's own authorization
//! filter.

pub mod console;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::isolation::WorkflowType;

/// How the adapter wants assistant output delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingMode {
    /// Forward each assistant/tool chunk as it arrives.
    Stream,
    /// Buffer the turn and deliver one cleaned final message.
    Batch,
}

/// Outbound half of a chat/issue-tracker platform.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Deliver text to the platform conversation.
    async fn send_message(&self, conversation_id: &str, text: &str) -> Result<()>;

    fn streaming_mode(&self) -> StreamingMode;

    fn platform_type(&self) -> &str;

    /// Resolve the conversation to a thread, creating one when the platform
    /// supports threads. Adapters without threads return the input.
    async fn ensure_thread(&self, conversation_id: &str) -> Result<String> {
        Ok(conversation_id.to_string())
    }
}

/// Isolation hints extracted by the adapter from webhook payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationHints {
    pub workflow_type: WorkflowType,
    /// Issue/PR number, thread id, or task title depending on the type.
    pub identifier: String,
    pub pr_branch: Option<String>,
    pub pr_sha: Option<String>,
    #[serde(default)]
    pub is_fork_pr: bool,
    #[serde(default)]
    pub pr_labels: Vec<String>,
    /// Issue/PR closed or thread expired: tear the environment down instead
    /// of dispatching work.
    #[serde(default)]
    pub close_event: bool,
}

/// One inbound message from a platform adapter.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub platform_conversation_id: String,
    pub text: String,
    /// Platform metadata (issue body, PR description, labels) for prompt
    /// injection.
    pub external_context: Option<String>,
    /// Recent thread messages, oldest first, for router context.
    pub thread_history: Vec<String>,
    pub isolation_hints: Option<IsolationHints>,
}

impl InboundMessage {
    pub fn text_only(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            platform_conversation_id: conversation_id.into(),
            text: text.into(),
            external_context: None,
            thread_history: Vec::new(),
            isolation_hints: None,
        }
    }
}
