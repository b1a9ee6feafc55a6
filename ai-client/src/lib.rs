//! Streaming subprocess clients for AI coding assistants.
//!
//! The orchestration core treats every assistant as an opaque streaming
//! query interface: send a prompt plus working directory, optionally resume
//! an earlier session by its opaque id, and consume an ordered stream of
//! [`MessageChunk`]s. This crate provides that interface plus concrete
//! clients for the `claude` and `codex` CLIs and a scripted mock for tests.

mod chunk;
pub mod claude;
pub mod codex;
pub mod mock;

pub use chunk::MessageChunk;
pub use claude::{ClaudeCodeClient, ClaudeCodeConfig};
pub use codex::{CodexClient, CodexConfig};
pub use mock::MockAssistantClient;

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors surfaced by assistant clients.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The assistant binary could not be spawned.
    #[error("failed to spawn assistant process: {0}")]
    Spawn(#[source] std::io::Error),

    /// The subprocess exited abnormally or closed its stream mid-turn.
    #[error("assistant stream failed: {message}")]
    Stream { message: String },

    /// A stream line could not be decoded.
    #[error("failed to decode assistant output: {0}")]
    Decode(#[from] serde_json::Error),

    /// The assistant binary is not usable on this host.
    #[error("assistant unavailable: {message}")]
    Unavailable { message: String },
}

impl ClientError {
    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream {
            message: message.into(),
        }
    }
}

/// A single assistant query.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// Fully assembled prompt text.
    pub prompt: String,
    /// Working directory the assistant operates in.
    pub cwd: PathBuf,
    /// Opaque assistant-side session id to resume, if any. `None` starts a
    /// fresh context.
    pub resume_session_id: Option<String>,
}

impl QueryRequest {
    pub fn new(prompt: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            cwd: cwd.into(),
            resume_session_id: None,
        }
    }

    pub fn resuming(mut self, session_id: impl Into<String>) -> Self {
        self.resume_session_id = Some(session_id.into());
        self
    }
}

/// Stream of chunks for one turn. Dropping the receiver cancels the turn
/// cooperatively: the reader task stops and the subprocess is killed.
pub type ChunkStream = mpsc::Receiver<Result<MessageChunk, ClientError>>;

/// Health probe result, from e.g. `claude --version`.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub version: Option<String>,
    pub error: Option<String>,
}

/// An AI coding assistant behind a streaming query interface.
#[async_trait]
pub trait AssistantClient: Send + Sync {
    /// Start one assistant turn and return its chunk stream.
    async fn send_query(&self, request: QueryRequest) -> Result<ChunkStream, ClientError>;

    /// Stable identifier matching the conversation's locked assistant type
    /// (e.g. `claude`, `codex`).
    fn client_type(&self) -> &str;

    /// Probe whether the underlying binary is usable.
    async fn health_check(&self) -> HealthStatus;
}

/// Channel capacity for chunk streams. Backpressure beyond this suspends the
/// subprocess reader, not the subprocess itself.
pub(crate) const CHUNK_CHANNEL_CAPACITY: usize = 64;
