//! SQLite-backed vector store.
//!
//! In-process store using SQLite for rows and brute-force cosine scoring
//! for similarity search. Embeddings are stored as little-endian f32
//! BLOBs. All writes are single-row idempotent inserts keyed on the
//! record's business key.

use std::cmp::Ordering;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use super::{
    DocumentChunk, DocumentHit, DocumentType, GlobalHit, GlobalKnowledge, MessageEmbedding,
    MessageHit, MessageRole, VectorStore,
};
use crate::core::config::EMBEDDING_DIM;
use crate::core::errors::CoreError;

pub struct SqliteVectorStore {
    pool: SqlitePool,
    #[allow(dead_code)]
    db_path: PathBuf,
}

impl SqliteVectorStore {
    pub async fn open(db_path: PathBuf) -> Result<Self, CoreError> {
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(CoreError::unreachable)?;

        let store = Self { pool, db_path };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), CoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS document_chunks (
                chunk_id TEXT PRIMARY KEY,
                asset_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                project_id TEXT,
                document_type TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                chunk_text TEXT NOT NULL,
                embedding BLOB NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')),
                UNIQUE(asset_id, chunk_index)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chunks_user ON document_chunks(user_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS message_embeddings (
                embedding_id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                project_id TEXT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content_snippet TEXT NOT NULL,
                embedding BLOB NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_session ON message_embeddings(session_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS global_knowledge (
                knowledge_id TEXT PRIMARY KEY,
                category TEXT NOT NULL,
                pattern_type TEXT NOT NULL,
                example_text TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                quality_score REAL NOT NULL DEFAULT 0.7,
                tags TEXT NOT NULL DEFAULT '[]',
                embedding BLOB NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')),
                updated_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                last_message_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() || a.is_empty() {
            return 0.0;
        }

        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        let denom = norm_a * norm_b;

        if denom <= f32::EPSILON {
            0.0
        } else {
            dot / denom
        }
    }

    /// Similarity as a fixed-precision decimal in [0, 1].
    fn score(query: &[f32], candidate: &[f32]) -> f32 {
        let raw = Self::cosine_similarity(query, candidate).clamp(0.0, 1.0);
        (raw * 10_000.0).round() / 10_000.0
    }

    fn check_dim(embedding: &[f32], what: &str) -> Result<(), CoreError> {
        if embedding.len() != EMBEDDING_DIM {
            return Err(CoreError::Invariant(format!(
                "{} embedding has dimension {}, expected {}",
                what,
                embedding.len(),
                EMBEDDING_DIM
            )));
        }
        Ok(())
    }

    fn parse_metadata(raw: String) -> Value {
        serde_json::from_str(&raw).unwrap_or(Value::Null)
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn similar_messages(
        &self,
        query_embedding: &[f32],
        user_id: &str,
        project_id: Option<&str>,
        session_id: Option<&str>,
        match_count: usize,
        threshold: f32,
    ) -> Result<Vec<MessageHit>, CoreError> {
        Self::check_dim(query_embedding, "query")?;

        let rows = sqlx::query(
            "SELECT message_id, session_id, role, content_snippet, embedding, metadata, created_at
             FROM message_embeddings
             WHERE user_id = ?1
               AND (?2 IS NULL OR project_id = ?2)
               AND (?3 IS NULL OR session_id = ?3)",
        )
        .bind(user_id)
        .bind(project_id)
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut scored: Vec<(MessageHit, String)> = rows
            .into_iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let stored = Self::deserialize_embedding(&blob);
                let similarity = Self::score(query_embedding, &stored);
                if similarity < threshold {
                    return None;
                }
                let role: String = row.get("role");
                let hit = MessageHit {
                    message_id: row.get("message_id"),
                    session_id: row.get("session_id"),
                    role: MessageRole::parse(&role)?,
                    content_snippet: row.get("content_snippet"),
                    metadata: Self::parse_metadata(row.get("metadata")),
                    similarity,
                };
                Some((hit, row.get("created_at")))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.similarity
                .partial_cmp(&a.0.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });
        scored.truncate(match_count);

        Ok(scored.into_iter().map(|(hit, _)| hit).collect())
    }

    async fn similar_documents(
        &self,
        query_embedding: &[f32],
        user_id: &str,
        project_id: Option<&str>,
        match_count: usize,
        threshold: f32,
    ) -> Result<Vec<DocumentHit>, CoreError> {
        Self::check_dim(query_embedding, "query")?;

        let rows = sqlx::query(
            "SELECT chunk_id, asset_id, document_type, chunk_index, chunk_text, embedding, metadata, created_at
             FROM document_chunks
             WHERE user_id = ?1
               AND (?2 IS NULL OR project_id = ?2)",
        )
        .bind(user_id)
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut scored: Vec<(DocumentHit, String)> = rows
            .into_iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let stored = Self::deserialize_embedding(&blob);
                let similarity = Self::score(query_embedding, &stored);
                if similarity < threshold {
                    return None;
                }
                let document_type: String = row.get("document_type");
                let chunk_index: i64 = row.get("chunk_index");
                let hit = DocumentHit {
                    chunk_id: row.get("chunk_id"),
                    asset_id: row.get("asset_id"),
                    chunk_index: chunk_index as u32,
                    document_type: DocumentType::parse(&document_type)?,
                    chunk_text: row.get("chunk_text"),
                    metadata: Self::parse_metadata(row.get("metadata")),
                    similarity,
                };
                Some((hit, row.get("created_at")))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.similarity
                .partial_cmp(&a.0.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.chunk_index.cmp(&b.0.chunk_index))
                .then_with(|| a.1.cmp(&b.1))
        });
        scored.truncate(match_count);

        Ok(scored.into_iter().map(|(hit, _)| hit).collect())
    }

    async fn similar_global(
        &self,
        query_embedding: &[f32],
        match_count: usize,
        threshold: f32,
        min_quality: f32,
    ) -> Result<Vec<GlobalHit>, CoreError> {
        Self::check_dim(query_embedding, "query")?;

        let rows = sqlx::query(
            "SELECT knowledge_id, category, pattern_type, example_text, description,
                    quality_score, tags, embedding, metadata, created_at
             FROM global_knowledge
             WHERE quality_score >= ?1",
        )
        .bind(min_quality)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut scored: Vec<(GlobalHit, String)> = rows
            .into_iter()
            .filter_map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let stored = Self::deserialize_embedding(&blob);
                let similarity = Self::score(query_embedding, &stored);
                if similarity < threshold {
                    return None;
                }
                let tags_raw: String = row.get("tags");
                let quality: f64 = row.get("quality_score");
                let hit = GlobalHit {
                    knowledge_id: row.get("knowledge_id"),
                    category: row.get("category"),
                    pattern_type: row.get("pattern_type"),
                    example_text: row.get("example_text"),
                    description: row.get("description"),
                    quality_score: quality as f32,
                    tags: serde_json::from_str(&tags_raw).unwrap_or_default(),
                    metadata: Self::parse_metadata(row.get("metadata")),
                    similarity,
                };
                Some((hit, row.get("created_at")))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.similarity
                .partial_cmp(&a.0.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });
        scored.truncate(match_count);

        Ok(scored.into_iter().map(|(hit, _)| hit).collect())
    }

    async fn insert_document_chunk(&self, chunk: DocumentChunk) -> Result<(), CoreError> {
        Self::check_dim(&chunk.embedding, "document chunk")?;

        let blob = Self::serialize_embedding(&chunk.embedding);
        let metadata = serde_json::to_string(&chunk.metadata).unwrap_or_else(|_| "{}".to_string());

        sqlx::query(
            "INSERT OR IGNORE INTO document_chunks
                 (chunk_id, asset_id, user_id, project_id, document_type, chunk_index, chunk_text, embedding, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&chunk.chunk_id)
        .bind(&chunk.asset_id)
        .bind(&chunk.user_id)
        .bind(&chunk.project_id)
        .bind(chunk.document_type.as_str())
        .bind(chunk.chunk_index as i64)
        .bind(&chunk.chunk_text)
        .bind(&blob)
        .bind(&metadata)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    async fn insert_message_embedding(&self, record: MessageEmbedding) -> Result<(), CoreError> {
        Self::check_dim(&record.embedding, "message")?;
        if record.session_id.trim().is_empty() {
            return Err(CoreError::Invariant(
                "message embedding requires a session_id".to_string(),
            ));
        }

        let blob = Self::serialize_embedding(&record.embedding);
        let metadata = serde_json::to_string(&record.metadata).unwrap_or_else(|_| "{}".to_string());

        sqlx::query(
            "INSERT OR IGNORE INTO message_embeddings
                 (embedding_id, message_id, user_id, project_id, session_id, role, content_snippet, embedding, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&record.embedding_id)
        .bind(&record.message_id)
        .bind(&record.user_id)
        .bind(&record.project_id)
        .bind(&record.session_id)
        .bind(record.role.as_str())
        .bind(&record.content_snippet)
        .bind(&blob)
        .bind(&metadata)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    async fn insert_global_knowledge(&self, record: GlobalKnowledge) -> Result<(), CoreError> {
        Self::check_dim(&record.embedding, "global knowledge")?;

        let blob = Self::serialize_embedding(&record.embedding);
        let tags = serde_json::to_string(&record.tags).unwrap_or_else(|_| "[]".to_string());
        let metadata = serde_json::to_string(&record.metadata).unwrap_or_else(|_| "{}".to_string());

        sqlx::query(
            "INSERT OR IGNORE INTO global_knowledge
                 (knowledge_id, category, pattern_type, example_text, description, quality_score, tags, embedding, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&record.knowledge_id)
        .bind(&record.category)
        .bind(&record.pattern_type)
        .bind(&record.example_text)
        .bind(&record.description)
        .bind(record.quality_score as f64)
        .bind(&tags)
        .bind(&blob)
        .bind(&metadata)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    async fn delete_asset(&self, asset_id: &str) -> Result<usize, CoreError> {
        let result = sqlx::query("DELETE FROM document_chunks WHERE asset_id = ?1")
            .bind(asset_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        Ok(result.rows_affected() as usize)
    }

    async fn delete_session(&self, session_id: &str) -> Result<usize, CoreError> {
        let result = sqlx::query("DELETE FROM message_embeddings WHERE session_id = ?1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        sqlx::query("DELETE FROM sessions WHERE session_id = ?1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        Ok(result.rows_affected() as usize)
    }

    async fn touch_session(&self, session_id: &str) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO sessions (session_id, last_message_at)
             VALUES (?1, STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
             ON CONFLICT(session_id)
             DO UPDATE SET last_message_at = excluded.last_message_at",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }
}

fn store_err(err: sqlx::Error) -> CoreError {
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::TypeNotFound { .. } => {
            CoreError::Invariant(err.to_string())
        }
        other => CoreError::StoreUnreachable(other.to_string()),
    }
}
