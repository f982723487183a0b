//! Turn pipeline.
//!
//! Glues the components into a single entry point: retrieve context,
//! stream the generated response, then schedule background embedding of
//! the turn's messages once the response terminator is out. Caller
//! disconnect cancels the stream but not the background work already
//! owed for the user turn.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::Instrument;

use crate::background::{BackgroundIngester, TurnRecord};
use crate::chat::{
    ChatGenerator, ChatMessage, ChatProvider, GenerationRequest, TurnEvent,
};
use crate::context::format_context;
use crate::core::config::{validate, CoreConfig};
use crate::core::errors::CoreError;
use crate::embedding::Embedder;
use crate::ingest::{DocumentIngestor, Extractors};
use crate::retrieval::{RetrievalOrchestrator, RetrievalRequest};
use crate::store::{MessageRole, VectorStore};
use crate::tools::WebSearchClient;

/// One user turn as submitted by the transport layer.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub user_id: String,
    pub session_id: String,
    pub project_id: Option<String>,
    pub system_prompt: String,
    pub user_text: String,
    /// Prior turns, oldest first.
    pub history: Vec<ChatMessage>,
    pub enable_web_search: Option<bool>,
    /// Message ids from the session store; generated when absent.
    pub user_message_id: Option<String>,
    pub assistant_message_id: Option<String>,
}

pub struct RagPipeline {
    config: CoreConfig,
    retrieval: RetrievalOrchestrator,
    generator: ChatGenerator,
    background: BackgroundIngester,
    ingestor: DocumentIngestor,
}

impl RagPipeline {
    pub fn new(
        config: CoreConfig,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        provider: Arc<dyn ChatProvider>,
        web_search: Option<Arc<WebSearchClient>>,
    ) -> Result<Self, CoreError> {
        Self::with_extractors(
            config,
            embedder,
            store,
            provider,
            web_search,
            Extractors::default(),
        )
    }

    pub fn with_extractors(
        config: CoreConfig,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        provider: Arc<dyn ChatProvider>,
        web_search: Option<Arc<WebSearchClient>>,
        extractors: Extractors,
    ) -> Result<Self, CoreError> {
        validate(&config)?;

        let retrieval = RetrievalOrchestrator::new(
            embedder.clone(),
            store.clone(),
            config.retrieval.clone(),
            config.session.clone(),
        );
        let generator = ChatGenerator::new(
            provider,
            web_search,
            config.generation.clone(),
            config.web_search.clone(),
        );
        let background = BackgroundIngester::new(embedder.clone(), store.clone());
        let ingestor = DocumentIngestor::new(embedder, store, config.chunking.clone())
            .with_extractors(extractors);

        Ok(Self {
            config,
            retrieval,
            generator,
            background,
            ingestor,
        })
    }

    /// The document ingestor, for the upload completion path.
    pub fn ingestor(&self) -> &DocumentIngestor {
        &self.ingestor
    }

    /// Run one turn. Deltas stream on the returned channel; after the
    /// terminal event the turn's messages are embedded in the background.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
    ) -> Result<mpsc::Receiver<TurnEvent>, CoreError> {
        let block = self
            .retrieval
            .retrieve(&RetrievalRequest {
                user_text: &request.user_text,
                user_id: &request.user_id,
                session_id: &request.session_id,
                project_id: request.project_id.as_deref(),
                history: &request.history,
            })
            .instrument(tracing::info_span!("retrieval", session = %request.session_id))
            .await?;
        let context_text = format_context(&block, self.config.context.max_chars);

        let mut generation = self.generator.generate(GenerationRequest {
            system_prompt: request.system_prompt.clone(),
            context_text,
            history: request.history.clone(),
            user_text: request.user_text.clone(),
            enable_web_search: request.enable_web_search,
        });

        let (tx, rx) = mpsc::channel(32);
        let background = self.background.clone();
        tokio::spawn(async move {
            let mut assistant_text: Option<String> = None;

            while let Some(event) = generation.recv().await {
                let done_text = match &event {
                    TurnEvent::Done { full_text, .. } => Some(full_text.clone()),
                    _ => None,
                };
                if tx.send(event).await.is_err() {
                    // Caller disconnected; the generator stream drops with
                    // `generation`, background work below still runs.
                    break;
                }
                // The assistant turn only counts once its terminator
                // actually reached the caller.
                if let Some(text) = done_text {
                    assistant_text = Some(text);
                }
            }

            background.spawn_message(TurnRecord {
                user_id: request.user_id.clone(),
                project_id: request.project_id.clone(),
                session_id: request.session_id.clone(),
                message_id: request
                    .user_message_id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                role: MessageRole::User,
                content: request.user_text,
            });

            match assistant_text {
                Some(text) if !text.trim().is_empty() => {
                    background.spawn_message(TurnRecord {
                        user_id: request.user_id,
                        project_id: request.project_id,
                        session_id: request.session_id.clone(),
                        message_id: request
                            .assistant_message_id
                            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                        role: MessageRole::Assistant,
                        content: text,
                    });
                }
                _ => {
                    // Incomplete or empty assistant turn: nothing to embed.
                }
            }

            background.spawn_touch_session(request.session_id);
        });

        Ok(rx)
    }
}
