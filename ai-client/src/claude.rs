//! Claude Code CLI client.
//!
//! Wraps `claude -p <prompt> --output-format stream-json` and converts its
//! NDJSON stdout into [`MessageChunk`]s.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    AssistantClient, ChunkStream, ClientError, HealthStatus, MessageChunk, QueryRequest,
    CHUNK_CHANNEL_CAPACITY,
};

/// Configuration for the Claude Code CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCodeConfig {
    /// Binary name or path.
    pub binary: String,
    /// Model alias passed via `--model` (e.g. `sonnet`, `opus`).
    pub model: Option<String>,
    /// Skip the interactive permission prompts. Required for unattended
    /// operation inside isolated worktrees.
    pub dangerous_skip_permissions: bool,
    /// Wall-clock limit for one turn; the subprocess is killed past it.
    pub turn_timeout: std::time::Duration,
    /// Extra arguments appended verbatim.
    pub extra_args: Vec<String>,
}

impl Default for ClaudeCodeConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            model: None,
            dangerous_skip_permissions: true,
            turn_timeout: std::time::Duration::from_secs(300),
            extra_args: Vec::new(),
        }
    }
}

/// Streaming client for the Claude Code CLI.
pub struct ClaudeCodeClient {
    config: ClaudeCodeConfig,
}

impl ClaudeCodeClient {
    pub fn new(config: ClaudeCodeConfig) -> Self {
        Self { config }
    }

    /// Build the CLI argument list for one turn.
    fn build_args(&self, request: &QueryRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            request.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];

        if self.config.dangerous_skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }

        if let Some(model) = &self.config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        if let Some(session_id) = &request.resume_session_id {
            args.push("--resume".to_string());
            args.push(session_id.clone());
        }

        args.extend(self.config.extra_args.iter().cloned());
        args
    }
}

/// Convert one stream-json line into zero or more chunks.
///
/// Assistant messages carry a content-block array; each text, tool_use, and
/// thinking block becomes its own chunk so ordering within the message is
/// preserved.
fn parse_stream_line(line: &str) -> Result<Vec<MessageChunk>, ClientError> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    let mut chunks = Vec::new();

    match value.get("type").and_then(|t| t.as_str()) {
        Some("assistant") => {
            let blocks = value
                .pointer("/message/content")
                .and_then(|c| c.as_array())
                .cloned()
                .unwrap_or_default();
            for block in blocks {
                match block.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            chunks.push(MessageChunk::assistant(text));
                        }
                    }
                    Some("tool_use") => {
                        let name = block
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or("unknown")
                            .to_string();
                        chunks.push(MessageChunk::tool(name, block.get("input").cloned()));
                    }
                    Some("thinking") => {
                        if let Some(text) = block.get("thinking").and_then(|t| t.as_str()) {
                            chunks.push(MessageChunk::Thinking {
                                content: text.to_string(),
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
        Some("system") => {
            let subtype = value
                .get("subtype")
                .and_then(|s| s.as_str())
                .unwrap_or("event");
            chunks.push(MessageChunk::System {
                content: subtype.to_string(),
            });
        }
        Some("result") => {
            let session_id = value
                .get("session_id")
                .and_then(|s| s.as_str())
                .map(String::from);
            chunks.push(MessageChunk::result(session_id));
        }
        // user echoes, deltas and unknown event kinds are not surfaced
        _ => {}
    }

    Ok(chunks)
}

#[async_trait]
impl AssistantClient for ClaudeCodeClient {
    async fn send_query(&self, request: QueryRequest) -> Result<ChunkStream, ClientError> {
        let args = self.build_args(&request);
        debug!(cwd = %request.cwd.display(), resume = ?request.resume_session_id, "spawning claude");

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
                let next = match tokio::time::timeout_at(deadline, lines.next_line()).await {
                    Ok(next) => next,
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
                match next {
                    Ok(Some(line)) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        match parse_stream_line(&line) {
                            Ok(chunks) => {
                                for chunk in chunks {
                                    saw_result |= matches!(chunk, MessageChunk::Result { .. });
                                    if tx.send(Ok(chunk)).await.is_err() {
                                        // Receiver dropped: cancel the turn.
                                        let _ = child.start_kill();
                                        return;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!("unparseable stream line: {}", e);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ClientError::stream(format!("stdout read failed: {}", e))))
                            .await;
                        let _ = child.start_kill();
                        return;
                    }
                }
            }

            let status = child.wait().await;
            let ok = status.as_ref().map(|s| s.success()).unwrap_or(false);
            if !ok && !saw_result {
                let mut err_text = String::new();
                let _ = stderr.read_to_string(&mut err_text).await;
                let code = status.ok().and_then(|s| s.code());
                let _ = tx
                    .send(Err(ClientError::stream(format!(
                        "claude exited with code {:?}: {}",
                        code,
                        err_text.trim()
                    ))))
                    .await;
            }
        });

        Ok(rx)
    }

    fn client_type(&self) -> &str {
        "claude"
    }

    async fn health_check(&self) -> HealthStatus {
        probe_version(&self.config.binary).await
    }
}

/// Run `<binary> --version` and report usability.
pub(crate) async fn probe_version(binary: &str) -> HealthStatus {
    match Command::new(binary).arg("--version").output().await {
        Ok(output) if output.status.success() => HealthStatus {
            healthy: true,
            version: Some(String::from_utf8_lossy(&output.stdout).trim().to_string()),
            error: None,
        },
        Ok(output) => HealthStatus {
            healthy: false,
            version: None,
            error: Some(String::from_utf8_lossy(&output.stderr).trim().to_string()),
        },
        Err(e) => HealthStatus {
            healthy: false,
            version: None,
            error: Some(format!("failed to execute {}: {}", binary, e)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assistant_text_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hello"},{"type":"tool_use","name":"Bash","input":{"command":"ls"}}]}}"#;
        let chunks = parse_stream_line(line).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], MessageChunk::assistant("hello"));
        match &chunks[1] {
            MessageChunk::Tool { tool_name, .. } => assert_eq!(tool_name, "Bash"),
            other => panic!("expected tool chunk, got {:?}", other),
        }
    }

    #[test]
    fn parses_result_session_id() {
        let line = r#"{"type":"result","subtype":"success","session_id":"abc-123","result":"done"}"#;
        let chunks = parse_stream_line(line).unwrap();
        assert_eq!(chunks, vec![MessageChunk::result(Some("abc-123".into()))]);
    }

    #[test]
    fn ignores_unknown_event_kinds() {
        let line = r#"{"type":"user","message":{"content":[]}}"#;
        assert!(parse_stream_line(line).unwrap().is_empty());
    }

    #[test]
    fn resume_flag_present_when_resuming() {
        let client = ClaudeCodeClient::new(ClaudeCodeConfig::default());
        let request = QueryRequest::new("hi", "/tmp").resuming("sess-1");
        let args = client.build_args(&request);
        let pos = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[pos + 1], "sess-1");
    }
}
