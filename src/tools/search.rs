//! Web search tool.
//!
//! One-shot internet query against a Tavily-style endpoint. A single
//! attempt under a fixed deadline; failures come back as an empty result
//! with an error field, never as an `Err`. The caller feeds whatever it
//! gets to the model.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::config::WebSearchConfig;

/// Keywords that already bias a query toward fresh results.
const RECENCY_KEYWORDS: &[&str] = &[
    "latest", "recent", "current", "new", "today", "this week", "this month", "now", "2024",
    "2025",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    pub error: Option<String>,
}

pub struct WebSearchClient {
    client: Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl WebSearchClient {
    /// Returns `None` when no API key is configured; web search stays
    /// disabled and the tool is never advertised to the model.
    pub fn new(base_url: String, api_key: Option<String>, config: &WebSearchConfig) -> Option<Self> {
        let api_key = api_key.filter(|k| !k.trim().is_empty())?;
        Some(Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout: Duration::from_millis(config.timeout_ms),
        })
    }

    pub async fn search(&self, query: &str, max_results: usize) -> SearchOutcome {
        let enhanced = enhance_query_for_recency(query);
        if enhanced != query {
            tracing::debug!("search query enhanced for recency: {:?}", enhanced);
        }

        let body = json!({
            "api_key": self.api_key,
            "query": enhanced,
            "max_results": max_results,
            "search_depth": "advanced",
        });

        let response = self
            .client
            .post(&self.base_url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("web search failed: {}", e);
                return SearchOutcome {
                    results: Vec::new(),
                    error: Some(e.to_string()),
                };
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            tracing::warn!("web search returned {}", status);
            return SearchOutcome {
                results: Vec::new(),
                error: Some(format!("search provider returned {status}")),
            };
        }

        match response.json::<Value>().await {
            Ok(payload) => SearchOutcome {
                results: parse_results(&payload),
                error: None,
            },
            Err(e) => SearchOutcome {
                results: Vec::new(),
                error: Some(e.to_string()),
            },
        }
    }
}

fn parse_results(payload: &Value) -> Vec<SearchResult> {
    let items = payload
        .get("results")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut results = Vec::new();
    for item in items {
        let title = item
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let url = item
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let snippet = item
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        if !title.is_empty() && !url.is_empty() {
            results.push(SearchResult {
                title,
                url,
                snippet,
            });
        }
    }

    results
}

/// Short queries without a recency keyword get one appended so the
/// provider ranks fresh results first.
fn enhance_query_for_recency(query: &str) -> String {
    let lower = query.to_lowercase();
    let has_recency = RECENCY_KEYWORDS.iter().any(|k| lower.contains(k));
    if !has_recency && query.split_whitespace().count() < 5 {
        return format!("{query} latest");
    }
    query.to_string()
}

/// Render results for the model's tool-result message.
pub fn format_results_for_context(query: &str, outcome: &SearchOutcome) -> String {
    if let Some(error) = &outcome.error {
        return format!("Web search failed: {error}");
    }
    if outcome.results.is_empty() {
        return "Web search returned no results.".to_string();
    }

    let mut out = format!("## Web Search Results\n\nQuery: {query}\n\n");
    for (i, result) in outcome.results.iter().enumerate() {
        out.push_str(&format!(
            "### Result {}: {}\nURL: {}\nContent: {}\n\n",
            i + 1,
            result.title,
            result.url,
            result.snippet
        ));
    }
    out
}
