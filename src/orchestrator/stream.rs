//! Projection of assistant chunk streams onto platform messages.
//!
//! Stream-mode adapters get each assistant/tool chunk as it arrives;
//! batch-mode adapters get one cleaned message at end of turn. Either way
//! the full assistant text and the end-of-turn session id are collected for
//! the caller.

use std::sync::Arc;
use tracing::debug;

use ai_client::{ChunkStream, MessageChunk};

use crate::error::Result;
use crate::platform::{PlatformAdapter, StreamingMode};

/// Prefix used when surfacing tool invocations to users in stream mode.
const TOOL_INDICATOR_PREFIX: &str = "🔧 ";

/// Collected outcome of one assistant turn.
#[derive(Debug, Clone, Default)]
pub struct TurnOutput {
    /// Concatenated assistant text, in emission order.
    pub text: String,
    /// Assistant-side session id from the result chunk.
    pub assistant_session_id: Option<String>,
}

/// Drives one turn's chunk stream to completion, fanning chunks out to the
/// platform according to its streaming mode.
pub struct StreamProjector {
    adapter: Arc<dyn PlatformAdapter>,
    conversation_key: String,
    mode: StreamingMode,
}

impl StreamProjector {
    pub fn new(adapter: Arc<dyn PlatformAdapter>, conversation_key: impl Into<String>) -> Self {
        let mode = adapter.streaming_mode();
        Self {
            adapter,
            conversation_key: conversation_key.into(),
            mode,
        }
    }

    /// Consume the stream. Transport errors abort the turn; everything sent
    /// so far stays sent.
    pub async fn drive(&self, mut stream: ChunkStream) -> Result<TurnOutput> {
        let mut output = TurnOutput::default();

        while let Some(item) = stream.recv().await {
            let chunk = item?;
            match chunk {
                MessageChunk::Assistant { content } => {
                    if !output.text.is_empty() {
                        output.text.push('\n');
                    }
                    output.text.push_str(&content);
                    if self.mode == StreamingMode::Stream {
                        self.adapter
                            .send_message(&self.conversation_key, &content)
                            .await?;
                    }
                }
                MessageChunk::Tool { tool_name, .. } => match self.mode {
                    StreamingMode::Stream => {
                        let notice = format!("{}{}", TOOL_INDICATOR_PREFIX, tool_name);
                        self.adapter
                            .send_message(&self.conversation_key, &notice)
                            .await?;
                    }
                    StreamingMode::Batch => {
                        debug!("tool use: {}", tool_name);
                    }
                },
                MessageChunk::Thinking { content } => {
                    debug!("assistant thinking ({} chars)", content.len());
                }
                MessageChunk::System { content } => {
                    debug!("assistant system event: {}", content);
                }
                MessageChunk::Result { session_id } => {
                    output.assistant_session_id = session_id;
                }
            }
        }

        if self.mode == StreamingMode::Batch {
            let cleaned = strip_leading_tool_indicators(&output.text);
            if !cleaned.is_empty() {
                self.adapter
                    .send_message(&self.conversation_key, cleaned)
                    .await?;
            }
        }

        Ok(output)
    }
}

/// Drop leading tool-indicator lines (and the blank lines after them) from a
/// buffered turn, so batch messages start with real content.
fn strip_leading_tool_indicators(text: &str) -> &str {
    let mut rest = text;
    loop {
        let trimmed = rest.trim_start_matches('\n');
        if let Some(line_end) = trimmed.find('\n') {
            if trimmed[..line_end].starts_with(TOOL_INDICATOR_PREFIX) {
                rest = &trimmed[line_end + 1..];
                continue;
            }
        } else if trimmed.starts_with(TOOL_INDICATOR_PREFIX) {
            return "";
        }
        return trimmed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as ArchonResult;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingAdapter {
        mode: Option<StreamingMode>,
        sent: Mutex<Vec<String>>,
    }

    impl RecordingAdapter {
        fn new(mode: StreamingMode) -> Self {
            Self {
                mode: Some(mode),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PlatformAdapter for RecordingAdapter {
        async fn send_message(&self, _conversation_id: &str, text: &str) -> ArchonResult<()> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        fn streaming_mode(&self) -> StreamingMode {
            self.mode.unwrap_or(StreamingMode::Batch)
        }

        fn platform_type(&self) -> &str {
            "test"
        }
    }

    fn stream_of(chunks: Vec<MessageChunk>) -> ChunkStream {
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    #[tokio::test]
    async fn stream_mode_forwards_chunks_in_order() {
        let adapter = Arc::new(RecordingAdapter::new(StreamingMode::Stream));
        let projector = StreamProjector::new(adapter.clone(), "conv");

        let output = projector
            .drive(stream_of(vec![
                MessageChunk::assistant("working"),
                MessageChunk::tool("Bash", None),
                MessageChunk::assistant("done"),
                MessageChunk::result(Some("sess-1".into())),
            ]))
            .await
            .unwrap();

        assert_eq!(adapter.sent(), vec!["working", "🔧 Bash", "done"]);
        assert_eq!(output.text, "working\ndone");
        assert_eq!(output.assistant_session_id.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn batch_mode_sends_one_cleaned_message() {
        let adapter = Arc::new(RecordingAdapter::new(StreamingMode::Batch));
        let projector = StreamProjector::new(adapter.clone(), "conv");

        let output = projector
            .drive(stream_of(vec![
                MessageChunk::assistant("🔧 Bash"),
                MessageChunk::assistant("actual answer"),
                MessageChunk::tool("Edit", None),
                MessageChunk::result(None),
            ]))
            .await
            .unwrap();

        assert_eq!(adapter.sent(), vec!["actual answer"]);
        assert_eq!(output.assistant_session_id, None);
        assert!(output.text.contains("actual answer"));
    }

    #[test]
    fn strips_only_leading_indicator_lines() {
        assert_eq!(
            strip_leading_tool_indicators("🔧 Bash\n🔧 Edit\nanswer\n🔧 later"),
            "answer\n🔧 later"
        );
        assert_eq!(strip_leading_tool_indicators("🔧 Bash"), "");
        assert_eq!(strip_leading_tool_indicators("plain"), "plain");
    }
}
