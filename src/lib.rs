//! Retrieval-augmented generation core for the coaching assistant.
//!
//! Given a user turn, the pipeline rewrites it into a retrieval query,
//! fans out semantic searches across document chunks, prior messages,
//! and global knowledge patterns under a wall-clock deadline, assembles
//! the hits into a context block, drives the chat model with an optional
//! web-search tool, streams the response, and embeds the turn's messages
//! in the background.
//!
//! The HTTP transport, authentication, session CRUD, and upload plumbing
//! live outside this crate; it is driven through [`RagPipeline`].

pub mod background;
pub mod chat;
pub mod context;
pub mod core;
pub mod embedding;
pub mod expand;
pub mod ingest;
pub mod logging;
pub mod pipeline;
pub mod retrieval;
pub mod store;
pub mod tools;

pub use crate::core::config::CoreConfig;
pub use crate::core::errors::CoreError;
pub use chat::{ChatMessage, ChatProvider, OpenAiChatProvider, TurnEvent};
pub use embedding::{Embedder, HttpEmbeddingClient};
pub use pipeline::{RagPipeline, TurnRequest};
pub use store::{SqliteVectorStore, VectorStore};
pub use tools::WebSearchClient;
