//! Vector store contract: record types and the `VectorStore` trait.
//!
//! Three persisted relations hold embeddings: document chunks, message
//! embeddings, and global knowledge. The primary implementation is
//! `SqliteVectorStore` in the `sqlite` module.

mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::errors::CoreError;

pub use sqlite::SqliteVectorStore;

/// Source document format accepted by the ingestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Pdf,
    Docx,
    Txt,
    Md,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Pdf => "pdf",
            DocumentType::Docx => "docx",
            DocumentType::Txt => "txt",
            DocumentType::Md => "md",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pdf" => Some(DocumentType::Pdf),
            "docx" => Some(DocumentType::Docx),
            "txt" => Some(DocumentType::Txt),
            "md" => Some(DocumentType::Md),
            _ => None,
        }
    }
}

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }
}

/// One embedded window of an uploaded document.
///
/// `(asset_id, chunk_index)` is the business key; inserting the same key
/// twice leaves the store unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub chunk_id: String,
    pub asset_id: String,
    pub user_id: String,
    pub project_id: Option<String>,
    pub document_type: DocumentType,
    pub chunk_index: u32,
    pub chunk_text: String,
    pub embedding: Vec<f32>,
    pub metadata: Value,
}

/// One embedded chat message. `session_id` is always populated so every
/// retrieval may be session-scoped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEmbedding {
    pub embedding_id: String,
    pub message_id: String,
    pub user_id: String,
    pub project_id: Option<String>,
    pub session_id: String,
    pub role: MessageRole,
    pub content_snippet: String,
    pub embedding: Vec<f32>,
    pub metadata: Value,
}

/// A curated, tenant-agnostic knowledge pattern. Read-only in the hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalKnowledge {
    pub knowledge_id: String,
    pub category: String,
    pub pattern_type: String,
    pub example_text: String,
    pub description: String,
    pub quality_score: f32,
    pub tags: Vec<String>,
    pub embedding: Vec<f32>,
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct DocumentHit {
    pub chunk_id: String,
    pub asset_id: String,
    pub chunk_index: u32,
    pub document_type: DocumentType,
    pub chunk_text: String,
    pub metadata: Value,
    pub similarity: f32,
}

#[derive(Debug, Clone)]
pub struct MessageHit {
    pub message_id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content_snippet: String,
    pub metadata: Value,
    pub similarity: f32,
}

#[derive(Debug, Clone)]
pub struct GlobalHit {
    pub knowledge_id: String,
    pub category: String,
    pub pattern_type: String,
    pub example_text: String,
    pub description: String,
    pub quality_score: f32,
    pub tags: Vec<String>,
    pub metadata: Value,
    pub similarity: f32,
}

/// Abstract interface over the vector-capable relational store.
///
/// All three searches return hits in descending cosine similarity, capped
/// at the requested match count, and return empty on no hit; they never
/// error on an empty corpus. `StoreUnreachable` signals a connectivity
/// problem the retrieval layer degrades around; `Invariant` signals a
/// shape mismatch and is fatal.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn similar_messages(
        &self,
        query_embedding: &[f32],
        user_id: &str,
        project_id: Option<&str>,
        session_id: Option<&str>,
        match_count: usize,
        threshold: f32,
    ) -> Result<Vec<MessageHit>, CoreError>;

    async fn similar_documents(
        &self,
        query_embedding: &[f32],
        user_id: &str,
        project_id: Option<&str>,
        match_count: usize,
        threshold: f32,
    ) -> Result<Vec<DocumentHit>, CoreError>;

    async fn similar_global(
        &self,
        query_embedding: &[f32],
        match_count: usize,
        threshold: f32,
        min_quality: f32,
    ) -> Result<Vec<GlobalHit>, CoreError>;

    /// Idempotent on `(asset_id, chunk_index)`.
    async fn insert_document_chunk(&self, chunk: DocumentChunk) -> Result<(), CoreError>;

    /// Idempotent on `message_id`.
    async fn insert_message_embedding(&self, record: MessageEmbedding) -> Result<(), CoreError>;

    /// Idempotent on `knowledge_id`.
    async fn insert_global_knowledge(&self, record: GlobalKnowledge) -> Result<(), CoreError>;

    /// Delete all chunks belonging to an asset. Returns the count removed.
    async fn delete_asset(&self, asset_id: &str) -> Result<usize, CoreError>;

    /// Delete all message embeddings for a session. Returns the count removed.
    async fn delete_session(&self, session_id: &str) -> Result<usize, CoreError>;

    /// Best-effort update of the session's last-message timestamp.
    async fn touch_session(&self, session_id: &str) -> Result<(), CoreError>;
}
