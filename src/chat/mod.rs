//! Chat generation.
//!
//! Drives the LLM with the retrieved context, performs at most one
//! web-search tool round trip, and streams text deltas to the caller.
//! The turn is a small explicit state machine:
//!
//! ```text
//! AwaitingLlm -- delta --> Streaming -- more deltas --> Streaming
//! AwaitingLlm -- tool_call --> ToolRun -- tool_result --> AwaitingLlm
//! Streaming -- end --> Done
//! ```

pub mod provider;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

use crate::core::config::{GenerationConfig, WebSearchConfig};
use crate::core::errors::CoreError;
use crate::tools::search::{format_results_for_context, WebSearchClient};

pub use provider::{ChatProvider, OpenAiChatProvider};
pub use types::{
    ChatMessage, CompletionRequest, StreamEvent, TokenUsage, ToolCall, ToolChoice, ToolSpec,
    TurnEvent,
};

/// Rough chars-per-token estimate used for the history budget.
const CHARS_PER_TOKEN: usize = 4;

/// Initial round, one pre-delta retry, one tool round trip, and one
/// follow-up after a refused second tool call.
const MAX_PROVIDER_ROUNDS: usize = 4;

const TOOL_NAME: &str = "internet_search";

const SECOND_CALL_REFUSAL: &str =
    "internet_search was already used this turn. Answer from the existing context and the search \
     results you already have.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GenState {
    AwaitingLlm,
    Streaming,
    ToolRun,
    Done,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system_prompt: String,
    /// Formatted context block; empty when retrieval found nothing.
    pub context_text: String,
    /// Prior turns, oldest first.
    pub history: Vec<ChatMessage>,
    pub user_text: String,
    /// `Some(false)` disables the tool even when configured.
    pub enable_web_search: Option<bool>,
}

pub struct ChatGenerator {
    provider: Arc<dyn ChatProvider>,
    web_search: Option<Arc<WebSearchClient>>,
    generation: GenerationConfig,
    web_config: WebSearchConfig,
}

impl ChatGenerator {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        web_search: Option<Arc<WebSearchClient>>,
        generation: GenerationConfig,
        web_config: WebSearchConfig,
    ) -> Self {
        Self {
            provider,
            web_search,
            generation,
            web_config,
        }
    }

    /// Start a turn. Events arrive on the returned channel; dropping the
    /// receiver cancels the in-flight provider request.
    pub fn generate(&self, request: GenerationRequest) -> mpsc::Receiver<TurnEvent> {
        let (tx, rx) = mpsc::channel(32);
        let driver = TurnDriver {
            provider: self.provider.clone(),
            web_search: self.web_search.clone(),
            generation: self.generation.clone(),
            web_config: self.web_config.clone(),
        };
        tokio::spawn(async move {
            driver.run(request, tx).await;
        });
        rx
    }
}

struct TurnDriver {
    provider: Arc<dyn ChatProvider>,
    web_search: Option<Arc<WebSearchClient>>,
    generation: GenerationConfig,
    web_config: WebSearchConfig,
}

impl TurnDriver {
    async fn run(self, request: GenerationRequest, tx: mpsc::Sender<TurnEvent>) {
        let deadline =
            Instant::now() + Duration::from_millis(self.generation.stream_deadline_ms);

        let mut messages =
            build_messages(&request, self.generation.max_input_tokens * CHARS_PER_TOKEN);

        let tools_enabled = request.enable_web_search != Some(false) && self.web_search.is_some();
        let tools = if tools_enabled {
            vec![internet_search_spec(self.web_config.max_results)]
        } else {
            Vec::new()
        };
        let mut tool_choice = if tools_enabled && self.is_forced_search(&request.user_text) {
            tracing::debug!("web search forced by trigger phrase");
            ToolChoice::Required(TOOL_NAME.to_string())
        } else {
            ToolChoice::Auto
        };

        let mut state = GenState::AwaitingLlm;
        let mut tool_rounds = 0usize;
        let mut retried = false;
        let mut emitted = false;
        let mut full_text = String::new();

        let mut round = 0usize;
        'rounds: loop {
            round += 1;
            if round > MAX_PROVIDER_ROUNDS {
                let _ = tx
                    .send(TurnEvent::Error(CoreError::Permanent(
                        "completion did not converge within the round budget".to_string(),
                    )))
                    .await;
                return;
            }

            let completion = CompletionRequest {
                messages: messages.clone(),
                tools: tools.clone(),
                tool_choice: tool_choice.clone(),
                max_tokens: self.generation.max_tokens,
            };

            let mut stream = match self.provider.stream_completion(completion).await {
                Ok(stream) => stream,
                Err(err) if err.is_transient() && !emitted && !retried => {
                    tracing::warn!("completion failed before first delta ({}), retrying", err);
                    retried = true;
                    round -= 1;
                    continue 'rounds;
                }
                Err(err) => {
                    let _ = tx.send(TurnEvent::Error(err)).await;
                    return;
                }
            };
            advance(&mut state, GenState::AwaitingLlm);

            loop {
                let event = match timeout_at(deadline, stream.recv()).await {
                    Ok(Some(event)) => event,
                    Ok(None) => {
                        // Provider channel closed without a terminal frame.
                        let _ = tx
                            .send(TurnEvent::Done {
                                full_text,
                                usage: None,
                            })
                            .await;
                        return;
                    }
                    Err(_) => {
                        let _ = tx
                            .send(TurnEvent::Error(CoreError::DeadlineExceeded(
                                "stream deadline elapsed".to_string(),
                            )))
                            .await;
                        return;
                    }
                };

                match event {
                    Ok(StreamEvent::Delta(text)) => {
                        if state != GenState::Streaming {
                            advance(&mut state, GenState::Streaming);
                        }
                        emitted = true;
                        full_text.push_str(&text);
                        if tx.send(TurnEvent::Delta(text)).await.is_err() {
                            // Caller cancelled; dropping `stream` aborts the request.
                            return;
                        }
                    }
                    Ok(StreamEvent::ToolCall(call)) => {
                        if call.name != TOOL_NAME {
                            messages.push(ChatMessage::assistant_tool_call(&call));
                            messages.push(ChatMessage::tool_result(
                                &call.id,
                                format!("Unknown tool: {}", call.name),
                            ));
                            tool_choice = ToolChoice::None;
                            continue 'rounds;
                        }
                        if tool_rounds >= 1 {
                            tracing::warn!("second internet_search invocation refused");
                            messages.push(ChatMessage::assistant_tool_call(&call));
                            messages.push(ChatMessage::tool_result(&call.id, SECOND_CALL_REFUSAL));
                            tool_choice = ToolChoice::None;
                            continue 'rounds;
                        }

                        advance(&mut state, GenState::ToolRun);
                        tool_rounds += 1;
                        let result = self.run_search(&call, &request.user_text).await;
                        messages.push(ChatMessage::assistant_tool_call(&call));
                        messages.push(ChatMessage::tool_result(&call.id, result));
                        tool_choice = ToolChoice::Auto;
                        continue 'rounds;
                    }
                    Ok(StreamEvent::Done { usage }) => {
                        advance(&mut state, GenState::Done);
                        if let Some(usage) = usage {
                            tracing::debug!(
                                "turn used {} prompt + {} completion tokens",
                                usage.prompt_tokens,
                                usage.completion_tokens
                            );
                        }
                        let _ = tx.send(TurnEvent::Done { full_text, usage }).await;
                        return;
                    }
                    Err(err) if err.is_transient() && !emitted && !retried => {
                        tracing::warn!("stream failed before first delta ({}), retrying", err);
                        retried = true;
                        round -= 1;
                        continue 'rounds;
                    }
                    Err(err) => {
                        // After the first delta an error becomes the
                        // stream-end event.
                        let _ = tx.send(TurnEvent::Error(err)).await;
                        return;
                    }
                }
            }
        }
    }

    fn is_forced_search(&self, user_text: &str) -> bool {
        let lower = user_text.to_lowercase();
        self.web_config
            .force_triggers
            .iter()
            .any(|trigger| lower.contains(trigger.as_str()))
    }

    /// Execute the search and render its result for the model. Tool
    /// failures are stringified, never fatal.
    async fn run_search(&self, call: &ToolCall, user_text: &str) -> String {
        let Some(search) = &self.web_search else {
            return "Web search is not configured.".to_string();
        };

        let args: Value = serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
        let query = match args["query"].as_str() {
            Some(q) if !q.trim().is_empty() => q.to_string(),
            _ => user_text.to_string(),
        };
        let max_results = args["max_results"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(self.web_config.max_results);

        let outcome = search.search(&query, max_results).await;
        tracing::debug!(
            "internet_search returned {} results for {:?}",
            outcome.results.len(),
            query
        );
        format_results_for_context(&query, &outcome)
    }
}

fn advance(state: &mut GenState, next: GenState) {
    tracing::trace!("generation state {:?} -> {:?}", state, next);
    *state = next;
}

fn internet_search_spec(default_max_results: usize) -> ToolSpec {
    ToolSpec {
        name: TOOL_NAME.to_string(),
        description: "Search the internet for current information, facts, news, or data. Use the \
                      user's query, or construct one from what they are asking about."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "The search query." },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of results.",
                    "default": default_max_results,
                }
            },
            "required": ["query"]
        }),
    }
}

/// Assemble the provider messages: system prompt, context block, trimmed
/// history (oldest pairs dropped first when over budget), user turn.
fn build_messages(request: &GenerationRequest, budget_chars: usize) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if !request.system_prompt.trim().is_empty() {
        messages.push(ChatMessage::system(request.system_prompt.clone()));
    }
    if !request.context_text.trim().is_empty() {
        messages.push(ChatMessage::system(format!(
            "Context retrieved for this turn (most relevant first):\n\n{}",
            request.context_text
        )));
    }

    let fixed_chars: usize = messages
        .iter()
        .map(|m| m.content.chars().count())
        .sum::<usize>()
        + request.user_text.chars().count();

    let mut history: Vec<ChatMessage> = request
        .history
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .cloned()
        .collect();
    let history_chars = |h: &[ChatMessage]| -> usize {
        h.iter().map(|m| m.content.chars().count()).sum()
    };
    while !history.is_empty() && fixed_chars + history_chars(&history) > budget_chars {
        history.remove(0);
        if history
            .first()
            .map(|m| m.role == "assistant")
            .unwrap_or(false)
        {
            history.remove(0);
        }
    }

    messages.extend(history);
    messages.push(ChatMessage::user(request.user_text.clone()));
    messages
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    /// Feeds pre-scripted event sequences, one per completion round, and
    /// records every request it receives.
    struct ScriptedProvider {
        scripts: Mutex<VecDeque<Vec<Result<StreamEvent, CoreError>>>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedProvider {
        fn new(scripts: Vec<Vec<Result<StreamEvent, CoreError>>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn request(&self, index: usize) -> CompletionRequest {
            self.requests.lock().unwrap()[index].clone()
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        async fn stream_completion(
            &self,
            request: CompletionRequest,
        ) -> Result<mpsc::Receiver<Result<StreamEvent, CoreError>>, CoreError> {
            self.requests.lock().unwrap().push(request);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();

            let (tx, rx) = mpsc::channel(32);
            tokio::spawn(async move {
                for event in script {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }

    fn tool_call(id: &str, query: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: TOOL_NAME.to_string(),
            arguments: format!(r#"{{"query":"{query}"}}"#),
        }
    }

    fn generator(provider: Arc<ScriptedProvider>, with_search: bool) -> ChatGenerator {
        let web_search = if with_search {
            // Unroutable loopback port: tool execution fails fast and the
            // error is stringified for the model.
            WebSearchClient::new(
                "http://127.0.0.1:9".to_string(),
                Some("test-key".to_string()),
                &WebSearchConfig::default(),
            )
            .map(Arc::new)
        } else {
            None
        };
        ChatGenerator::new(
            provider,
            web_search,
            GenerationConfig::default(),
            WebSearchConfig::default(),
        )
    }

    fn request(user_text: &str, enable_web_search: Option<bool>) -> GenerationRequest {
        GenerationRequest {
            system_prompt: "You are a coaching assistant.".to_string(),
            context_text: String::new(),
            history: Vec::new(),
            user_text: user_text.to_string(),
            enable_web_search,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn streams_deltas_and_accumulates_full_text() {
        let provider = ScriptedProvider::new(vec![vec![
            Ok(StreamEvent::Delta("Your tone ".to_string())),
            Ok(StreamEvent::Delta("is calm.".to_string())),
            Ok(StreamEvent::Done { usage: None }),
        ]]);
        let events =
            collect(generator(provider, false).generate(request("what's my tone?", Some(false))))
                .await;

        assert!(matches!(&events[0], TurnEvent::Delta(d) if d == "Your tone "));
        assert!(matches!(&events[1], TurnEvent::Delta(d) if d == "is calm."));
        match &events[2] {
            TurnEvent::Done { full_text, .. } => assert_eq!(full_text, "Your tone is calm."),
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disabled_web_search_advertises_no_tools() {
        let provider = ScriptedProvider::new(vec![vec![Ok(StreamEvent::Done { usage: None })]]);
        let _ = collect(
            generator(provider.clone(), true).generate(request("search for news", Some(false))),
        )
        .await;
        assert!(provider.request(0).tools.is_empty());
    }

    #[tokio::test]
    async fn trigger_phrase_forces_the_tool() {
        let provider = ScriptedProvider::new(vec![vec![
            Ok(StreamEvent::Delta("done".to_string())),
            Ok(StreamEvent::Done { usage: None }),
        ]]);
        let _ = collect(
            generator(provider.clone(), true)
                .generate(request("search for latest fitness trends 2025", None)),
        )
        .await;

        let first = provider.request(0);
        assert_eq!(first.tools.len(), 1);
        assert_eq!(
            first.tool_choice,
            ToolChoice::Required(TOOL_NAME.to_string())
        );
    }

    #[tokio::test]
    async fn tool_call_round_trip_feeds_result_back() {
        let provider = ScriptedProvider::new(vec![
            vec![Ok(StreamEvent::ToolCall(tool_call("call_1", "fitness trends")))],
            vec![
                Ok(StreamEvent::Delta("Here is what I found.".to_string())),
                Ok(StreamEvent::Done { usage: None }),
            ],
        ]);
        let events = collect(
            generator(provider.clone(), true).generate(request("search for fitness trends", None)),
        )
        .await;

        assert_eq!(provider.request_count(), 2);
        let second = provider.request(1);
        let tool_msg = second
            .messages
            .iter()
            .find(|m| m.role == "tool")
            .expect("tool result message");
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
        // The unroutable search endpoint fails; the failure is stringified.
        assert!(tool_msg.content.contains("Web search failed"));
        assert!(matches!(events.last(), Some(TurnEvent::Done { .. })));
    }

    #[tokio::test]
    async fn second_tool_call_is_refused() {
        let provider = ScriptedProvider::new(vec![
            vec![Ok(StreamEvent::ToolCall(tool_call("call_1", "first")))],
            vec![Ok(StreamEvent::ToolCall(tool_call("call_2", "second")))],
            vec![
                Ok(StreamEvent::Delta("Answering from context.".to_string())),
                Ok(StreamEvent::Done { usage: None }),
            ],
        ]);
        let events = collect(
            generator(provider.clone(), true).generate(request("look up something", None)),
        )
        .await;

        assert_eq!(provider.request_count(), 3);
        let third = provider.request(2);
        let refusal = third
            .messages
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("call_2"))
            .expect("refusal tool message");
        assert!(refusal.content.contains("already used"));
        assert_eq!(third.tool_choice, ToolChoice::None);
        assert!(matches!(events.last(), Some(TurnEvent::Done { .. })));
    }

    #[tokio::test]
    async fn transient_error_before_first_delta_is_retried_once() {
        let provider = ScriptedProvider::new(vec![
            vec![Err(CoreError::Transient("blip".to_string()))],
            vec![
                Ok(StreamEvent::Delta("recovered".to_string())),
                Ok(StreamEvent::Done { usage: None }),
            ],
        ]);
        let events =
            collect(generator(provider.clone(), false).generate(request("hello", Some(false))))
                .await;

        assert_eq!(provider.request_count(), 2);
        match &events[1] {
            TurnEvent::Done { full_text, .. } => assert_eq!(full_text, "recovered"),
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_after_first_delta_surfaces_as_stream_end() {
        let provider = ScriptedProvider::new(vec![vec![
            Ok(StreamEvent::Delta("partial".to_string())),
            Err(CoreError::Transient("mid-stream drop".to_string())),
        ]]);
        let events =
            collect(generator(provider.clone(), false).generate(request("hello", Some(false))))
                .await;

        assert_eq!(provider.request_count(), 1);
        assert!(matches!(&events[0], TurnEvent::Delta(d) if d == "partial"));
        assert!(matches!(&events[1], TurnEvent::Error(CoreError::Transient(_))));
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let provider = ScriptedProvider::new(vec![vec![Err(CoreError::Permanent(
            "bad request".to_string(),
        ))]]);
        let events =
            collect(generator(provider.clone(), false).generate(request("hello", Some(false))))
                .await;

        assert_eq!(provider.request_count(), 1);
        assert!(matches!(&events[0], TurnEvent::Error(CoreError::Permanent(_))));
    }

    #[test]
    fn message_order_is_system_context_history_user() {
        let request = GenerationRequest {
            system_prompt: "prompt".to_string(),
            context_text: "## Documents\n[1] hit".to_string(),
            history: vec![ChatMessage::user("old"), ChatMessage::assistant("reply")],
            user_text: "now".to_string(),
            enable_web_search: None,
        };
        let messages = build_messages(&request, 100_000);
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, ["system", "system", "user", "assistant", "user"]);
        assert!(messages[1].content.contains("## Documents"));
        assert_eq!(messages[4].content, "now");
    }

    #[test]
    fn over_budget_history_drops_oldest_pairs_first() {
        let request = GenerationRequest {
            system_prompt: String::new(),
            context_text: String::new(),
            history: vec![
                ChatMessage::user("a".repeat(400)),
                ChatMessage::assistant("b".repeat(400)),
                ChatMessage::user("recent question"),
                ChatMessage::assistant("recent answer"),
            ],
            user_text: "now".to_string(),
            enable_web_search: None,
        };
        let messages = build_messages(&request, 200);
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert!(contents.contains(&"recent question"));
        assert!(contents.contains(&"recent answer"));
        assert!(!contents.iter().any(|c| c.starts_with("aaaa")));
        assert!(!contents.iter().any(|c| c.starts_with("bbbb")));
    }
}
