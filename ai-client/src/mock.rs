//! Scripted assistant client for tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::{
    AssistantClient, ChunkStream, ClientError, HealthStatus, MessageChunk, QueryRequest,
    CHUNK_CHANNEL_CAPACITY,
};

/// One recorded query, for assertions.
#[derive(Debug, Clone)]
pub struct RecordedQuery {
    pub prompt: String,
    pub cwd: PathBuf,
    pub resume_session_id: Option<String>,
}

/// One scripted stream item.
#[derive(Debug, Clone)]
enum ScriptItem {
    Chunk(MessageChunk),
    Error(String),
}

/// A scripted assistant: each call to `send_query` pops the next scripted
/// turn and streams its items. When the script is exhausted, turns default
/// to a single "ok" reply with a fresh session id per turn.
pub struct MockAssistantClient {
    client_type: String,
    scripted: Mutex<VecDeque<Vec<ScriptItem>>>,
    queries: Arc<Mutex<Vec<RecordedQuery>>>,
    turn_counter: Mutex<u64>,
}

impl MockAssistantClient {
    pub fn new(client_type: impl Into<String>) -> Self {
        Self {
            client_type: client_type.into(),
            scripted: Mutex::new(VecDeque::new()),
            queries: Arc::new(Mutex::new(Vec::new())),
            turn_counter: Mutex::new(0),
        }
    }

    /// Queue a full scripted turn (should normally end with a Result chunk).
    pub fn push_turn(&self, chunks: Vec<MessageChunk>) {
        self.scripted
            .lock()
            .unwrap()
            .push_back(chunks.into_iter().map(ScriptItem::Chunk).collect());
    }

    /// Queue a plain text turn ending with the given session id.
    pub fn push_text_turn(&self, text: &str, session_id: &str) {
        self.push_turn(vec![
            MessageChunk::assistant(text),
            MessageChunk::result(Some(session_id.to_string())),
        ]);
    }

    /// Queue a turn that fails mid-stream with a transport error.
    pub fn push_failing_turn(&self, message: &str) {
        self.scripted
            .lock()
            .unwrap()
            .push_back(vec![ScriptItem::Error(message.to_string())]);
    }

    /// All queries seen so far, in order.
    pub fn recorded_queries(&self) -> Vec<RecordedQuery> {
        self.queries.lock().unwrap().clone()
    }

    fn next_turn(&self) -> Vec<ScriptItem> {
        if let Some(turn) = self.scripted.lock().unwrap().pop_front() {
            return turn;
        }
        let mut counter = self.turn_counter.lock().unwrap();
        *counter += 1;
        vec![
            ScriptItem::Chunk(MessageChunk::assistant("ok")),
            ScriptItem::Chunk(MessageChunk::result(Some(format!(
                "mock-session-{}",
                *counter
            )))),
        ]
    }
}

#[async_trait]
impl AssistantClient for MockAssistantClient {
    async fn send_query(&self, request: QueryRequest) -> Result<ChunkStream, ClientError> {
        self.queries.lock().unwrap().push(RecordedQuery {
            prompt: request.prompt.clone(),
            cwd: request.cwd.clone(),
            resume_session_id: request.resume_session_id.clone(),
        });

        let turn = self.next_turn();
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY.max(turn.len() + 1));
        tokio::spawn(async move {
            for item in turn {
                let message = match item {
                    ScriptItem::Chunk(chunk) => Ok(chunk),
                    ScriptItem::Error(text) => Err(ClientError::stream(text)),
                };
                if tx.send(message).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    fn client_type(&self) -> &str {
        &self.client_type
    }

    async fn health_check(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            version: Some("mock".to_string()),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_turns_stream_in_order() {
        let client = MockAssistantClient::new("claude");
        client.push_text_turn("first", "s1");

        let mut rx = client
            .send_query(QueryRequest::new("hello", "/tmp"))
            .await
            .unwrap();

        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk.unwrap());
        }
        assert_eq!(
            chunks,
            vec![
                MessageChunk::assistant("first"),
                MessageChunk::result(Some("s1".into())),
            ]
        );
        assert_eq!(client.recorded_queries().len(), 1);
    }

    #[tokio::test]
    async fn failing_turn_surfaces_stream_error() {
        let client = MockAssistantClient::new("claude");
        client.push_failing_turn("subprocess died");
        let mut rx = client
            .send_query(QueryRequest::new("hello", "/tmp"))
            .await
            .unwrap();
        let item = rx.recv().await.unwrap();
        assert!(item.is_err());
    }

    #[tokio::test]
    async fn exhausted_script_yields_default_turns() {
        let client = MockAssistantClient::new("claude");
        let mut rx = client
            .send_query(QueryRequest::new("anything", "/tmp"))
            .await
            .unwrap();
        let mut last = None;
        while let Some(chunk) = rx.recv().await {
            last = Some(chunk.unwrap());
        }
        assert!(matches!(
            last,
            Some(MessageChunk::Result { session_id: Some(_) })
        ));
    }
}
