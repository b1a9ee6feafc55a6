use serde::{Deserialize, Serialize};

/// One streamed event from an assistant turn.
///
/// Chunks preserve the subprocess's emission order. A turn always ends with
/// a [`MessageChunk::Result`] unless the transport fails first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageChunk {
    /// Assistant-visible text.
    Assistant { content: String },
    /// Tool invocation notice.
    Tool {
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_input: Option<serde_json::Value>,
    },
    /// Extended thinking text.
    Thinking { content: String },
    /// System/diagnostic event from the subprocess.
    System { content: String },
    /// End of turn. `session_id` is the assistant-side resume token; it is
    /// opaque and must not be parsed.
    Result {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

impl MessageChunk {
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
        }
    }

    pub fn tool(tool_name: impl Into<String>, tool_input: Option<serde_json::Value>) -> Self {
        Self::Tool {
            tool_name: tool_name.into(),
            tool_input,
        }
    }

    pub fn result(session_id: Option<String>) -> Self {
        Self::Result { session_id }
    }

    /// True for chunk kinds forwarded to end users in stream mode.
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::Assistant { .. } | Self::Tool { .. })
    }
}
