//! Retrieval orchestration.
//!
//! Synthesizes the retrieval query, embeds it, fans out the three
//! similarity searches in parallel under one wall-clock deadline, then
//! merges, audits, deduplicates, and caps the results into a
//! `ContextBlock`. Retrieval is best-effort: every per-source failure
//! degrades to an empty list, and at worst the whole operation yields an
//! empty block. Only a violated invariant fails the turn.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::chat::ChatMessage;
use crate::context::{ContextBlock, HitOrigin, RetrievalHit};
use crate::core::config::{RetrievalConfig, SessionConfig};
use crate::core::errors::CoreError;
use crate::embedding::Embedder;
use crate::expand::expand;
use crate::store::{DocumentHit, GlobalHit, MessageHit, VectorStore};

/// Post-filter caps on the assembled block.
const MAX_DOC_HITS: usize = 10;
const MAX_MSG_HITS: usize = 6;
const MAX_GLOBAL_HITS: usize = 3;

/// How much of the last user turn is appended to the query.
const HISTORY_TAIL_CHARS: usize = 500;

/// Prefix length hashed by the diversity filter.
const DIVERSITY_PREFIX_CHARS: usize = 100;

#[derive(Debug, Clone)]
pub struct RetrievalRequest<'a> {
    pub user_text: &'a str,
    pub user_id: &'a str,
    pub session_id: &'a str,
    pub project_id: Option<&'a str>,
    pub history: &'a [ChatMessage],
}

pub struct RetrievalOrchestrator {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    config: RetrievalConfig,
    session: SessionConfig,
}

impl RetrievalOrchestrator {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        config: RetrievalConfig,
        session: SessionConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            config,
            session,
        }
    }

    pub async fn retrieve(
        &self,
        request: &RetrievalRequest<'_>,
    ) -> Result<ContextBlock, CoreError> {
        if request.session_id.trim().is_empty() {
            return Err(CoreError::Invariant(
                "retrieval requires a session_id".to_string(),
            ));
        }

        let query = self.build_query(request);
        let query_embedding = match self.embedder.embed(&query).await {
            Ok(vector) => vector,
            Err(err) => {
                tracing::warn!("query embedding failed ({}), skipping retrieval", err);
                return Ok(ContextBlock::default());
            }
        };

        let deadline = Duration::from_millis(self.config.deadline_ms);
        let (docs, msgs, globs) = tokio::join!(
            timeout(
                deadline,
                self.store.similar_documents(
                    &query_embedding,
                    request.user_id,
                    request.project_id,
                    self.config.doc_k,
                    self.config.threshold,
                ),
            ),
            timeout(
                deadline,
                self.store.similar_messages(
                    &query_embedding,
                    request.user_id,
                    request.project_id,
                    Some(request.session_id),
                    self.config.msg_k,
                    self.config.threshold,
                ),
            ),
            timeout(
                deadline,
                self.store.similar_global(
                    &query_embedding,
                    self.config.global_k,
                    self.config.threshold,
                    self.config.global_min_quality,
                ),
            ),
        );

        let docs = settle("documents", docs)?;
        let mut msgs = settle("messages", msgs)?;
        let globs = settle("global", globs)?;

        if self.session.enforce_isolation {
            msgs.retain(|hit| {
                if hit.session_id == request.session_id {
                    true
                } else {
                    tracing::warn!(
                        "dropping message hit from foreign session {} (expected {})",
                        hit.session_id,
                        request.session_id
                    );
                    false
                }
            });
        }

        let mut documents: Vec<RetrievalHit> = docs.into_iter().map(document_hit).collect();
        let mut messages: Vec<RetrievalHit> = msgs.into_iter().map(message_hit).collect();
        let mut global: Vec<RetrievalHit> = globs.into_iter().map(global_hit).collect();

        dedupe_by_prefix(&mut documents);
        dedupe_by_prefix(&mut messages);
        dedupe_by_prefix(&mut global);

        documents.truncate(MAX_DOC_HITS);
        messages.truncate(MAX_MSG_HITS);
        global.truncate(MAX_GLOBAL_HITS);

        let block = ContextBlock {
            documents,
            messages,
            global,
        };
        tracing::debug!(
            "retrieved {} document, {} message, {} global hits",
            block.documents.len(),
            block.messages.len(),
            block.global.len()
        );
        Ok(block)
    }

    /// Expanded user text, plus the tail of the last user turn in history
    /// to bias the embedding toward the ongoing topic.
    fn build_query(&self, request: &RetrievalRequest<'_>) -> String {
        let mut query = expand(request.user_text);
        if let Some(last_user) = request
            .history
            .iter()
            .rev()
            .find(|m| m.role == "user" && !m.content.trim().is_empty())
        {
            let tail: String = last_user.content.chars().take(HISTORY_TAIL_CHARS).collect();
            query.push(' ');
            query.push_str(&tail);
        }
        query
    }
}

/// Collapse a timed-out or failed search into an empty list. Invariant
/// violations stay fatal; everything else is logged and degraded.
fn settle<T>(
    source: &str,
    outcome: Result<Result<Vec<T>, CoreError>, tokio::time::error::Elapsed>,
) -> Result<Vec<T>, CoreError> {
    match outcome {
        Ok(Ok(hits)) => Ok(hits),
        Ok(Err(CoreError::Invariant(message))) => Err(CoreError::Invariant(message)),
        Ok(Err(err)) => {
            tracing::warn!("{} search failed ({}), continuing without it", source, err);
            Ok(Vec::new())
        }
        Err(_) => {
            tracing::warn!("{} search exceeded the retrieval deadline", source);
            Ok(Vec::new())
        }
    }
}

/// Drop later hits whose first-100-chars hash matches an earlier kept hit.
fn dedupe_by_prefix(hits: &mut Vec<RetrievalHit>) {
    let mut seen = HashSet::new();
    hits.retain(|hit| {
        let prefix: String = hit.text.chars().take(DIVERSITY_PREFIX_CHARS).collect();
        let mut hasher = DefaultHasher::new();
        prefix.hash(&mut hasher);
        seen.insert(hasher.finish())
    });
}

fn document_hit(hit: DocumentHit) -> RetrievalHit {
    let source = hit.metadata["filename"]
        .as_str()
        .unwrap_or(hit.document_type.as_str())
        .to_string();
    RetrievalHit {
        origin: HitOrigin::Document,
        source,
        similarity: hit.similarity,
        text: hit.chunk_text,
        metadata: hit.metadata,
    }
}

fn message_hit(hit: MessageHit) -> RetrievalHit {
    RetrievalHit {
        origin: HitOrigin::Message,
        source: hit.role.as_str().to_string(),
        similarity: hit.similarity,
        text: hit.content_snippet,
        metadata: hit.metadata,
    }
}

fn global_hit(hit: GlobalHit) -> RetrievalHit {
    RetrievalHit {
        origin: HitOrigin::Global,
        source: hit.category.clone(),
        similarity: hit.similarity,
        text: hit.example_text,
        metadata: hit.metadata,
    }
}
