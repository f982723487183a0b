//! Post-turn background ingestion.
//!
//! After the response terminator is sent, the pipeline spawns detached
//! tasks that embed and persist the turn's messages and touch the
//! session's last-message timestamp. Each task runs under its own short
//! timeout; expiry or failure is logged and dropped. Nothing here may
//! extend the latency observed by the caller, and caller disconnect does
//! not cancel these tasks.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use crate::core::errors::CoreError;
use crate::embedding::Embedder;
use crate::store::{MessageEmbedding, MessageRole, VectorStore};

const TASK_TIMEOUT: Duration = Duration::from_millis(3_000);

/// Message snippets are capped for display and debugging.
const SNIPPET_MAX_CHARS: usize = 500;

/// Identifies the turn whose artifacts are being persisted.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub user_id: String,
    pub project_id: Option<String>,
    pub session_id: String,
    pub message_id: String,
    pub role: MessageRole,
    pub content: String,
}

#[derive(Clone)]
pub struct BackgroundIngester {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
}

impl BackgroundIngester {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>) -> Self {
        Self { embedder, store }
    }

    /// Fire-and-forget: embed and persist one message.
    pub fn spawn_message(&self, record: TurnRecord) {
        let ingester = self.clone();
        tokio::spawn(async move {
            let message_id = record.message_id.clone();
            match timeout(TASK_TIMEOUT, ingester.persist_message(record)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!("background embedding of message {} failed: {}", message_id, err);
                }
                Err(_) => {
                    tracing::warn!(
                        "background embedding of message {} timed out after {:?}",
                        message_id,
                        TASK_TIMEOUT
                    );
                }
            }
        });
    }

    /// Fire-and-forget: update the session's last-message timestamp.
    pub fn spawn_touch_session(&self, session_id: String) {
        let store = self.store.clone();
        tokio::spawn(async move {
            match timeout(TASK_TIMEOUT, store.touch_session(&session_id)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!("session touch for {} failed: {}", session_id, err);
                }
                Err(_) => {
                    tracing::warn!("session touch for {} timed out", session_id);
                }
            }
        });
    }

    async fn persist_message(&self, record: TurnRecord) -> Result<(), CoreError> {
        let embedding = self.embedder.embed(&record.content).await?;
        let snippet: String = record.content.chars().take(SNIPPET_MAX_CHARS).collect();

        self.store
            .insert_message_embedding(MessageEmbedding {
                embedding_id: uuid::Uuid::new_v4().to_string(),
                message_id: record.message_id,
                user_id: record.user_id,
                project_id: record.project_id,
                session_id: record.session_id,
                role: record.role,
                content_snippet: snippet,
                embedding,
                metadata: json!({}),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::core::config::EMBEDDING_DIM;
    use crate::store::{
        DocumentChunk, DocumentHit, GlobalHit, GlobalKnowledge, MessageHit,
    };

    struct SlowEmbedder {
        delay: Duration,
    }

    #[async_trait]
    impl Embedder for SlowEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, CoreError> {
            tokio::time::sleep(self.delay).await;
            Ok(vec![0.5; EMBEDDING_DIM])
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
            let mut out = Vec::new();
            for text in texts {
                out.push(self.embed(text).await?);
            }
            Ok(out)
        }
    }

    #[derive(Default)]
    struct CountingStore {
        messages: Mutex<Vec<MessageEmbedding>>,
        touches: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VectorStore for CountingStore {
        async fn similar_messages(
            &self,
            _q: &[f32],
            _user_id: &str,
            _project_id: Option<&str>,
            _session_id: Option<&str>,
            _k: usize,
            _threshold: f32,
        ) -> Result<Vec<MessageHit>, CoreError> {
            Ok(Vec::new())
        }

        async fn similar_documents(
            &self,
            _q: &[f32],
            _user_id: &str,
            _project_id: Option<&str>,
            _k: usize,
            _threshold: f32,
        ) -> Result<Vec<DocumentHit>, CoreError> {
            Ok(Vec::new())
        }

        async fn similar_global(
            &self,
            _q: &[f32],
            _k: usize,
            _threshold: f32,
            _min_quality: f32,
        ) -> Result<Vec<GlobalHit>, CoreError> {
            Ok(Vec::new())
        }

        async fn insert_document_chunk(&self, _chunk: DocumentChunk) -> Result<(), CoreError> {
            Ok(())
        }

        async fn insert_message_embedding(
            &self,
            record: MessageEmbedding,
        ) -> Result<(), CoreError> {
            self.messages.lock().unwrap().push(record);
            Ok(())
        }

        async fn insert_global_knowledge(
            &self,
            _record: GlobalKnowledge,
        ) -> Result<(), CoreError> {
            Ok(())
        }

        async fn delete_asset(&self, _asset_id: &str) -> Result<usize, CoreError> {
            Ok(0)
        }

        async fn delete_session(&self, _session_id: &str) -> Result<usize, CoreError> {
            Ok(0)
        }

        async fn touch_session(&self, session_id: &str) -> Result<(), CoreError> {
            self.touches.lock().unwrap().push(session_id.to_string());
            Ok(())
        }
    }

    fn record(content: &str) -> TurnRecord {
        TurnRecord {
            user_id: "u1".to_string(),
            project_id: None,
            session_id: "s1".to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            role: MessageRole::User,
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn persists_message_with_snippet_cap() {
        let store = Arc::new(CountingStore::default());
        let ingester = BackgroundIngester::new(
            Arc::new(SlowEmbedder {
                delay: Duration::from_millis(0),
            }),
            store.clone(),
        );

        ingester.spawn_message(record(&"x".repeat(2_000)));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let messages = store.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content_snippet.chars().count(), 500);
        assert_eq!(messages[0].session_id, "s1");
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_task_is_dropped() {
        let store = Arc::new(CountingStore::default());
        let ingester = BackgroundIngester::new(
            Arc::new(SlowEmbedder {
                delay: Duration::from_secs(10),
            }),
            store.clone(),
        );

        ingester.spawn_message(record("slow"));
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(store.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn touch_session_is_recorded() {
        let store = Arc::new(CountingStore::default());
        let ingester = BackgroundIngester::new(
            Arc::new(SlowEmbedder {
                delay: Duration::from_millis(0),
            }),
            store.clone(),
        );

        ingester.spawn_touch_session("s1".to_string());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let touches = store.touches.lock().unwrap();
        assert_eq!(touches.len(), 1);
        assert_eq!(touches[0], "s1");
    }
}
