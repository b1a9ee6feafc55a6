//! Stdout-backed adapter for local use via `archon serve`.

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::{PlatformAdapter, StreamingMode};
use crate::error::{ArchonError, Result};

/// Adapter that writes assistant output to stdout. One conversation per
/// process, keyed by a fixed conversation id.
pub struct ConsoleAdapter;

impl ConsoleAdapter {
    pub const CONVERSATION_ID: &'static str = "local";

    pub fn new() -> Self {
        Self
    }
}

impl Default for ConsoleAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformAdapter for ConsoleAdapter {
    async fn send_message(&self, _conversation_id: &str, text: &str) -> Result<()> {
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(format!("{}\n", text).as_bytes())
            .await
            .map_err(|e| ArchonError::Platform {
                message: "stdout write failed".to_string(),
                source: Some(Box::new(e)),
            })?;
        stdout.flush().await.map_err(|e| ArchonError::Platform {
            message: "stdout flush failed".to_string(),
            source: Some(Box::new(e)),
        })?;
        Ok(())
    }

    fn streaming_mode(&self) -> StreamingMode {
        StreamingMode::Stream
    }

    fn platform_type(&self) -> &str {
        "console"
    }
}
