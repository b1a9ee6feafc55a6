//! Codex CLI client.
//!
//! Wraps `codex exec --json` and converts its JSONL event stream into
//! [`MessageChunk`]s. The codex event model differs from claude's: events
//! carry a `msg.type` discriminator and the resume token is the thread id.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::claude::probe_version;
use crate::{
    AssistantClient, ChunkStream, ClientError, HealthStatus, MessageChunk, QueryRequest,
    CHUNK_CHANNEL_CAPACITY,
};

/// Configuration for the Codex CLI.
#[derive(Debug, Clone)]
pub struct CodexConfig {
    pub binary: String,
    /// Sandbox policy passed via `--sandbox`.
    pub sandbox: Option<String>,
    /// Wall-clock limit for one turn; the subprocess is killed past it.
    pub turn_timeout: std::time::Duration,
    pub extra_args: Vec<String>,
}

impl Default for CodexConfig {
    fn default() -> Self {
        Self {
            binary: "codex".to_string(),
            sandbox: Some("workspace-write".to_string()),
            turn_timeout: std::time::Duration::from_secs(300),
            extra_args: Vec::new(),
        }
    }
}

/// Streaming client for the Codex CLI.
pub struct CodexClient {
    config: CodexConfig,
}

impl CodexClient {
    pub fn new(config: CodexConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, request: &QueryRequest) -> Vec<String> {
        let mut args = vec!["exec".to_string(), "--json".to_string()];

        if let Some(sandbox) = &self.config.sandbox {
            args.push("--sandbox".to_string());
            args.push(sandbox.clone());
        }

        if let Some(thread_id) = &request.resume_session_id {
            args.push("resume".to_string());
            args.push(thread_id.clone());
        }

        args.extend(self.config.extra_args.iter().cloned());
        args.push(request.prompt.clone());
        args
    }
}

fn parse_codex_line(line: &str) -> Result<Vec<MessageChunk>, ClientError> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    let mut chunks = Vec::new();

    let msg_type = value
        .pointer("/msg/type")
        .or_else(|| value.get("type"))
        .and_then(|t| t.as_str());

    match msg_type {
        Some("agent_message") => {
            if let Some(text) = value
                .pointer("/msg/message")
                .and_then(|m| m.as_str())
            {
                chunks.push(MessageChunk::assistant(text));
            }
        }
        Some("agent_reasoning") => {
            if let Some(text) = value.pointer("/msg/text").and_then(|t| t.as_str()) {
                chunks.push(MessageChunk::Thinking {
                    content: text.to_string(),
                });
            }
        }
        Some("exec_command_begin") => {
            let command = value
                .pointer("/msg/command")
                .map(|c| c.clone());
            chunks.push(MessageChunk::tool("exec", command));
        }
        Some("session_configured") => {
            chunks.push(MessageChunk::System {
                content: "session_configured".to_string(),
            });
        }
        Some("task_complete") => {
            let thread_id = value
                .pointer("/msg/session_id")
                .or_else(|| value.get("session_id"))
                .and_then(|s| s.as_str())
                .map(String::from);
            chunks.push(MessageChunk::result(thread_id));
        }
        _ => {}
    }

    Ok(chunks)
}

#[async_trait]
impl AssistantClient for CodexClient {
    async fn send_query(&self, request: QueryRequest) -> Result<ChunkStream, ClientError> {
        let args = self.build_args(&request);
        debug!(cwd = %request.cwd.display(), "spawning codex");

        let mut child = Command::new(&self.config.binary)
            .args(&args)
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ClientError::Spawn)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::stream("child stdout not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ClientError::stream("child stderr not captured"))?;

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let turn_timeout = self.config.turn_timeout;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut saw_result = false;
            let deadline = tokio::time::Instant::now() + turn_timeout;

            loop {
                let line = match tokio::time::timeout_at(deadline, lines.next_line()).await {
                    Ok(Ok(Some(line))) => line,
                    Ok(_) => break,
                    Err(_) => {
                        let _ = child.start_kill();
                        let _ = tx
                            .send(Err(ClientError::stream(format!(
                                "turn timed out after {}s",
                                turn_timeout.as_secs()
                            ))))
                            .await;
                        return;
                    }
                };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                match parse_codex_line(&line) {
                    Ok(chunks) => {
                        for chunk in chunks {
                            saw_result |= matches!(chunk, MessageChunk::Result { .. });
                            if tx.send(Ok(chunk)).await.is_err() {
                                let _ = child.start_kill();
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("unparseable codex line: {}", e),
                }
            }

            let status = child.wait().await;
            let ok = status.as_ref().map(|s| s.success()).unwrap_or(false);
            if ok && !saw_result {
                // Some codex builds omit task_complete; synthesize end-of-turn.
                let _ = tx.send(Ok(MessageChunk::result(None))).await;
            } else if !ok {
                let mut err_text = String::new();
                let _ = stderr.read_to_string(&mut err_text).await;
                let _ = tx
                    .send(Err(ClientError::stream(format!(
                        "codex exited with code {:?}: {}",
                        status.ok().and_then(|s| s.code()),
                        err_text.trim()
                    ))))
                    .await;
            }
        });

        Ok(rx)
    }

    fn client_type(&self) -> &str {
        "codex"
    }

    async fn health_check(&self) -> HealthStatus {
        probe_version(&self.config.binary).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_agent_message() {
        let line = r#"{"id":"1","msg":{"type":"agent_message","message":"working on it"}}"#;
        let chunks = parse_codex_line(line).unwrap();
        assert_eq!(chunks, vec![MessageChunk::assistant("working on it")]);
    }

    #[test]
    fn parses_task_complete_thread_id() {
        let line = r#"{"id":"9","msg":{"type":"task_complete","session_id":"t-42"}}"#;
        let chunks = parse_codex_line(line).unwrap();
        assert_eq!(chunks, vec![MessageChunk::result(Some("t-42".into()))]);
    }
}
