//! Typed configuration for the pipeline.
//!
//! Every section carries defaults so an empty JSON object deserializes to
//! a fully working configuration. `validation::validate` runs at startup
//! and rejects values the pipeline cannot operate with.

pub mod validation;

use serde::{Deserialize, Serialize};

pub use validation::validate;

/// Fixed embedding dimension; every stored and query vector must match.
pub const EMBEDDING_DIM: usize = 1536;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub context: ContextConfig,
    pub chunking: ChunkingConfig,
    pub generation: GenerationConfig,
    pub web_search: WebSearchConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Vector dimension; must equal [`EMBEDDING_DIM`].
    pub dim: usize,
    /// Provider model identifier.
    pub model: String,
    /// Input longer than this is truncated to its tail before embedding.
    pub max_input_chars: usize,
    /// Per-call deadline.
    pub timeout_ms: u64,
    /// Token-bucket quota against the embedding provider.
    pub requests_per_minute: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dim: EMBEDDING_DIM,
            model: "text-embedding-3-small".to_string(),
            max_input_chars: 8_000,
            timeout_ms: 10_000,
            requests_per_minute: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Per-source match counts requested from the store.
    pub doc_k: usize,
    pub msg_k: usize,
    pub global_k: usize,
    /// Similarity floor applied to all three sources.
    pub threshold: f32,
    /// Quality floor for global knowledge hits.
    pub global_min_quality: f32,
    /// Wall-clock budget for the three-way fan-out.
    pub deadline_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            doc_k: 15,
            msg_k: 6,
            global_k: 3,
            threshold: 0.10,
            global_min_quality: 0.60,
            deadline_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Ceiling on the formatted context block.
    pub max_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self { max_chars: 16_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub target_chars: usize,
    pub overlap_chars: usize,
    pub max_chunks_per_doc: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_chars: 1_000,
            overlap_chars: 200,
            max_chunks_per_doc: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Chat model identifier.
    pub model: String,
    /// Total budget for a streamed turn.
    pub stream_deadline_ms: u64,
    /// Deadline for the non-streaming tool round trip.
    pub completion_timeout_ms: u64,
    pub max_tokens: u32,
    /// Estimated input-token ceiling; oldest history pairs are dropped
    /// once the estimate exceeds it.
    pub max_input_tokens: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            stream_deadline_ms: 120_000,
            completion_timeout_ms: 60_000,
            max_tokens: 6_000,
            max_input_tokens: 12_288,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSearchConfig {
    /// Substrings of the lowercased user turn that force a search call.
    pub force_triggers: Vec<String>,
    pub max_results: usize,
    pub timeout_ms: u64,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            force_triggers: [
                "search for",
                "look up",
                "find information about",
                "what's the latest",
                "current news",
                "recent research",
                "latest statistics",
                "search:",
                "internet search",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_results: 5,
            timeout_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Drop message hits whose session differs from the request's
    /// (defense-in-depth on top of the store-side filter).
    pub enforce_isolation: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enforce_isolation: true,
        }
    }
}
