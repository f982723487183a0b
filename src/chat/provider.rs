//! Chat completion provider.
//!
//! `OpenAiChatProvider` speaks the OpenAI-compatible streamed chat
//! completion protocol: SSE `data:` lines carrying content deltas,
//! incremental tool-call fragments, an optional usage frame, and a
//! terminal `[DONE]` marker.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::types::{CompletionRequest, StreamEvent, TokenUsage, ToolCall, ToolChoice};
use crate::core::config::GenerationConfig;
use crate::core::errors::CoreError;

#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Start one completion round. Events arrive on the returned channel
    /// in emission order; dropping the receiver cancels the request.
    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<mpsc::Receiver<Result<StreamEvent, CoreError>>, CoreError>;
}

pub struct OpenAiChatProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiChatProvider {
    pub fn new(base_url: String, api_key: Option<String>, config: &GenerationConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
        }
    }

    fn build_body(&self, request: &CompletionRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": request.messages,
            "stream": true,
            "stream_options": { "include_usage": true },
            "max_tokens": request.max_tokens,
        });

        if !request.tools.is_empty() {
            let tools: Vec<Value> = request.tools.iter().map(|t| t.to_wire()).collect();
            if let Some(obj) = body.as_object_mut() {
                obj.insert("tools".to_string(), json!(tools));
                let choice = match &request.tool_choice {
                    ToolChoice::Auto => json!("auto"),
                    ToolChoice::None => json!("none"),
                    ToolChoice::Required(name) => {
                        json!({ "type": "function", "function": { "name": name } })
                    }
                };
                obj.insert("tool_choice".to_string(), choice);
            }
        }

        body
    }
}

#[async_trait]
impl ChatProvider for OpenAiChatProvider {
    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<mpsc::Receiver<Result<StreamEvent, CoreError>>, CoreError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(&request);

        let mut http_request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {key}"));
        }

        let response = http_request.send().await.map_err(CoreError::transient)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("chat provider returned {status}: {text}");
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                CoreError::Transient(message)
            } else {
                CoreError::Permanent(message)
            });
        }

        let (tx, rx) = mpsc::channel(32);
        let mut stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut parser = SseParser::default();
            let mut buffer = String::new();

            while let Some(item) = stream.next().await {
                match item {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = buffer.find('\n') {
                            let line: String = buffer.drain(..=pos).collect();
                            for event in parser.push_line(line.trim()) {
                                if tx.send(Ok(event)).await.is_err() {
                                    return;
                                }
                            }
                            if parser.finished {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(CoreError::transient(e))).await;
                        return;
                    }
                }
            }

            // Stream ended without a [DONE] marker.
            if !parser.finished {
                let _ = tx
                    .send(Ok(StreamEvent::Done {
                        usage: parser.usage,
                    }))
                    .await;
            }
        });

        Ok(rx)
    }
}

/// Incremental SSE frame parser for one completion round.
#[derive(Default)]
struct SseParser {
    pending_call: Option<ToolCall>,
    usage: Option<TokenUsage>,
    finished: bool,
}

impl SseParser {
    fn push_line(&mut self, line: &str) -> Vec<StreamEvent> {
        if line.is_empty() {
            return Vec::new();
        }
        let Some(data) = line.strip_prefix("data: ") else {
            return Vec::new();
        };

        if data == "[DONE]" {
            self.finished = true;
            let mut events = Vec::new();
            if let Some(call) = self.pending_call.take() {
                events.push(StreamEvent::ToolCall(call));
            }
            events.push(StreamEvent::Done { usage: self.usage });
            return events;
        }

        let Ok(frame) = serde_json::from_str::<Value>(data) else {
            return Vec::new();
        };

        if let Some(usage) = frame.get("usage").filter(|u| !u.is_null()) {
            self.usage = Some(TokenUsage {
                prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
                total_tokens: usage["total_tokens"].as_u64().unwrap_or(0) as u32,
            });
        }

        let mut events = Vec::new();
        let choice = &frame["choices"][0];

        if let Some(content) = choice["delta"]["content"].as_str() {
            if !content.is_empty() {
                events.push(StreamEvent::Delta(content.to_string()));
            }
        }

        if let Some(fragments) = choice["delta"]["tool_calls"].as_array() {
            for fragment in fragments {
                let call = self.pending_call.get_or_insert_with(|| ToolCall {
                    id: String::new(),
                    name: String::new(),
                    arguments: String::new(),
                });
                if let Some(id) = fragment["id"].as_str() {
                    call.id = id.to_string();
                }
                if let Some(name) = fragment["function"]["name"].as_str() {
                    call.name = name.to_string();
                }
                if let Some(args) = fragment["function"]["arguments"].as_str() {
                    call.arguments.push_str(args);
                }
            }
        }

        if choice["finish_reason"].as_str() == Some("tool_calls") {
            if let Some(call) = self.pending_call.take() {
                events.push(StreamEvent::ToolCall(call));
            }
        }

        events
    }
}
