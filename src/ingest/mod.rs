//! Document ingestion: extract, normalize, chunk, embed, persist.
//!
//! Triggered asynchronously after an upload completes. Chunks persisted
//! before a failure stay in the store (each is individually valid), so a
//! failed run reports partial success rather than rolling back.

mod chunker;
mod extract;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::core::config::ChunkingConfig;
use crate::core::errors::CoreError;
use crate::embedding::Embedder;
use crate::store::{DocumentChunk, VectorStore};

pub use chunker::{chunk_text, ChunkPlan};
pub use extract::{detect_document_type, normalize_text, ExtractorFn, Extractors};

const INSERT_RETRY_ATTEMPTS: u32 = 3;
const INSERT_RETRY_BASE_MS: u64 = 250;

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub asset_id: String,
    pub user_id: String,
    pub project_id: Option<String>,
    pub file_bytes: Vec<u8>,
    pub filename: String,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub chunks_written: usize,
    pub truncated: bool,
}

pub struct DocumentIngestor {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    extractors: Extractors,
    config: ChunkingConfig,
}

impl DocumentIngestor {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        config: ChunkingConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            extractors: Extractors::default(),
            config,
        }
    }

    pub fn with_extractors(mut self, extractors: Extractors) -> Self {
        self.extractors = extractors;
        self
    }

    /// Ingest one uploaded asset. Returns how many chunks were written;
    /// persistence failures after chunk N yield `chunks_written: N`.
    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestReport, CoreError> {
        let document_type = detect_document_type(&request.filename, &request.content_type)?;
        let raw = self.extractors.extract(document_type, &request.file_bytes)?;
        let normalized = normalize_text(&raw);
        let plan = chunk_text(&normalized, &self.config);

        if plan.chunks.is_empty() {
            return Ok(IngestReport {
                chunks_written: 0,
                truncated: false,
            });
        }

        let embeddings = self.embedder.embed_batch(&plan.chunks).await?;
        if embeddings.len() != plan.chunks.len() {
            return Err(CoreError::Invariant(format!(
                "embedder returned {} vectors for {} chunks",
                embeddings.len(),
                plan.chunks.len()
            )));
        }

        let last_index = plan.chunks.len() - 1;
        let mut written = 0;
        for (index, (text, embedding)) in plan.chunks.iter().zip(embeddings).enumerate() {
            let mut metadata = json!({ "filename": request.filename });
            if plan.truncated && index == last_index {
                metadata["truncated"] = json!(true);
            }

            let chunk = DocumentChunk {
                chunk_id: uuid::Uuid::new_v4().to_string(),
                asset_id: request.asset_id.clone(),
                user_id: request.user_id.clone(),
                project_id: request.project_id.clone(),
                document_type,
                chunk_index: index as u32,
                chunk_text: text.clone(),
                embedding,
                metadata,
            };

            if let Err(err) = self.insert_with_retry(chunk).await {
                tracing::warn!(
                    "ingest of asset {} stopped at chunk {}: {}",
                    request.asset_id,
                    index,
                    err
                );
                return Ok(IngestReport {
                    chunks_written: written,
                    truncated: plan.truncated,
                });
            }
            written += 1;
        }

        tracing::info!(
            "ingested asset {} ({} chunks, truncated={})",
            request.asset_id,
            written,
            plan.truncated
        );
        Ok(IngestReport {
            chunks_written: written,
            truncated: plan.truncated,
        })
    }

    /// Background entry point: never propagates an error.
    pub async fn ingest_background(&self, request: IngestRequest) {
        let asset_id = request.asset_id.clone();
        if let Err(err) = self.ingest(request).await {
            tracing::error!("background ingest of asset {} failed: {}", asset_id, err);
        }
    }

    async fn insert_with_retry(&self, chunk: DocumentChunk) -> Result<(), CoreError> {
        let mut attempt = 0;
        loop {
            match self.store.insert_document_chunk(chunk.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt + 1 < INSERT_RETRY_ATTEMPTS => {
                    let delay =
                        Duration::from_millis(INSERT_RETRY_BASE_MS * 2u64.saturating_pow(attempt));
                    tracing::warn!(
                        "chunk insert attempt {} failed ({}), retrying in {:?}",
                        attempt + 1,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::core::config::EMBEDDING_DIM;
    use crate::store::{
        DocumentHit, GlobalHit, GlobalKnowledge, MessageEmbedding, MessageHit,
    };

    struct FakeEmbedder;

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, CoreError> {
            Ok(vec![0.5; EMBEDDING_DIM])
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
            Ok(texts.iter().map(|_| vec![0.5; EMBEDDING_DIM]).collect())
        }
    }

    /// Records inserted chunks; optionally fails permanently after N inserts.
    struct RecordingStore {
        chunks: Mutex<Vec<DocumentChunk>>,
        fail_after: Option<usize>,
    }

    impl RecordingStore {
        fn new(fail_after: Option<usize>) -> Self {
            Self {
                chunks: Mutex::new(Vec::new()),
                fail_after,
            }
        }
    }

    #[async_trait]
    impl VectorStore for RecordingStore {
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

        async fn insert_document_chunk(&self, chunk: DocumentChunk) -> Result<(), CoreError> {
            let mut chunks = self.chunks.lock().unwrap();
            if let Some(limit) = self.fail_after {
                if chunks.len() >= limit {
                    return Err(CoreError::Permanent("disk full".to_string()));
                }
            }
            chunks.push(chunk);
            Ok(())
        }

        async fn insert_message_embedding(
            &self,
            _record: MessageEmbedding,
        ) -> Result<(), CoreError> {
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

        async fn touch_session(&self, _session_id: &str) -> Result<(), CoreError> {
            Ok(())
        }
    }

    fn request(text: &str, filename: &str, content_type: &str) -> IngestRequest {
        IngestRequest {
            asset_id: "asset-1".to_string(),
            user_id: "u1".to_string(),
            project_id: None,
            file_bytes: text.as_bytes().to_vec(),
            filename: filename.to_string(),
            content_type: content_type.to_string(),
        }
    }

    fn ingestor(store: Arc<RecordingStore>) -> DocumentIngestor {
        DocumentIngestor::new(Arc::new(FakeEmbedder), store, ChunkingConfig::default())
    }

    #[tokio::test]
    async fn ingests_plain_text_in_chunk_order() {
        let store = Arc::new(RecordingStore::new(None));
        let text = "A sentence about brand voice. ".repeat(200);
        let report = ingestor(store.clone())
            .ingest(request(&text, "voice.txt", "text/plain"))
            .await
            .unwrap();

        let chunks = store.chunks.lock().unwrap();
        assert_eq!(report.chunks_written, chunks.len());
        assert!(report.chunks_written > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as u32);
            assert_eq!(chunk.metadata["filename"], "voice.txt");
        }
    }

    #[tokio::test]
    async fn unsupported_format_writes_nothing() {
        let store = Arc::new(RecordingStore::new(None));
        let err = ingestor(store.clone())
            .ingest(request("binary", "scan.pdf", "application/pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedFormat(_)));
        assert!(store.chunks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn permanent_insert_failure_reports_partial_success() {
        let store = Arc::new(RecordingStore::new(Some(2)));
        let text = "Sentence for the chunker to split on. ".repeat(200);
        let report = ingestor(store.clone())
            .ingest(request(&text, "notes.txt", "text/plain"))
            .await
            .unwrap();

        assert_eq!(report.chunks_written, 2);
        assert_eq!(store.chunks.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn truncated_document_marks_last_kept_chunk() {
        let store = Arc::new(RecordingStore::new(None));
        let text = "y".repeat(51 * 1000);
        let report = ingestor(store.clone())
            .ingest(request(&text, "big.txt", "text/plain"))
            .await
            .unwrap();

        assert_eq!(report.chunks_written, 50);
        assert!(report.truncated);
        let chunks = store.chunks.lock().unwrap();
        assert_eq!(chunks.last().unwrap().metadata["truncated"], true);
        assert!(chunks[0].metadata.get("truncated").is_none());
    }
}
