/*
 * Parley - Resilient chat relay
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Web search augmentation.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::credentials::mask;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchResult {
    pub answer: Option<String>,
    pub hits: Vec<SearchHit>,
}

impl SearchResult {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty() && self.answer.as_deref().is_none_or(|a| a.trim().is_empty())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("search provider returned {0}")]
    Status(u16),
}

#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, api_key: &str) -> Result<SearchResult, SearchError>;
}

// ---------------------------------------------------------------------------
// Tavily
// ---------------------------------------------------------------------------

pub struct TavilySearch {
    client: reqwest::Client,
    base_url: String,
    max_results: u32,
}

impl TavilySearch {
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: &str, max_results: u32) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_results,
        }
    }

    /// # Errors
    ///
    /// Returns `SearchError::Request` if the HTTP client cannot be built.
    pub fn with_timeout(
        base_url: &str,
        max_results: u32,
        timeout: Duration,
    ) -> Result<Self, SearchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::new(client, base_url, max_results))
    }
}

#[derive(Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

#[async_trait::async_trait]
impl SearchProvider for TavilySearch {
    async fn search(&self, query: &str, api_key: &str) -> Result<SearchResult, SearchError> {
        let body = serde_json::json!({
            "api_key": api_key,
            "query": query,
            "max_results": self.max_results,
            "include_answer": true,
            "search_depth": "basic",
        });
        let resp = self
            .client
            .post(format!("{}/search", self.base_url))
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SearchError::Status(status.as_u16()));
        }

        let parsed: TavilyResponse = resp.json().await?;
        Ok(SearchResult {
            answer: parsed.answer.filter(|a| !a.trim().is_empty()),
            hits: parsed
                .results
                .into_iter()
                .map(|r| SearchHit {
                    title: r.title,
                    url: r.url,
                    snippet: r.content,
                })
                .collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Cut `s` to at most `max` chars, marking the cut with an ellipsis.
#[must_use]
pub fn truncate_chars(s: &str, max: usize) -> String {
    let s = s.trim();
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max.saturating_sub(1)).collect();
    format!("{}…", cut.trim_end())
}

/// Render results as one bounded block suitable for a system prompt.
#[must_use]
pub fn render(result: &SearchResult, snippet_chars: usize) -> String {
    let mut out = String::new();
    if let Some(answer) = result.answer.as_deref().filter(|a| !a.trim().is_empty()) {
        out.push_str(&format!("Answer: {}\n", answer.trim()));
    }
    if !result.hits.is_empty() {
        out.push_str("Sources:\n");
    }
    for (i, hit) in result.hits.iter().enumerate() {
        let title = if hit.title.trim().is_empty() {
            "Untitled"
        } else {
            hit.title.trim()
        };
        out.push_str(&format!("{}. {title}\n", i + 1));
        if !hit.url.is_empty() {
            out.push_str(&format!("   {}\n", hit.url));
        }
        let snippet = truncate_chars(&hit.snippet, snippet_chars);
        if !snippet.is_empty() {
            out.push_str(&format!("   {snippet}\n"));
        }
    }
    out.trim_end().to_string()
}

// ---------------------------------------------------------------------------
// Augmenter
// ---------------------------------------------------------------------------

pub struct SearchAugmenter {
    provider: Arc<dyn SearchProvider>,
    keys: Vec<String>,
    snippet_chars: usize,
}

impl SearchAugmenter {
    #[must_use]
    pub fn new(provider: Arc<dyn SearchProvider>, keys: Vec<String>, snippet_chars: usize) -> Self {
        let keys = keys
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        Self {
            provider,
            keys,
            snippet_chars,
        }
    }

    /// Whether any search key is configured.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.keys.is_empty()
    }

    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Search with each key in turn and render the first successful result.
    /// `None` when no key works or the search came back empty.
    pub async fn research(&self, query: &str) -> Option<String> {
        if self.keys.is_empty() {
            debug!("no search keys configured");
            return None;
        }
        for (idx, key) in self.keys.iter().enumerate() {
            match self.provider.search(query, key).await {
                Ok(result) if result.is_empty() => {
                    info!(query, "search returned no results");
                    return None;
                }
                Ok(result) => {
                    debug!(query, hits = result.hits.len(), key = %mask(key), "search succeeded");
                    return Some(render(&result, self.snippet_chars));
                }
                Err(e) => {
                    warn!(query, attempt = idx + 1, key = %mask(key), error = %e, "search attempt failed");
                }
            }
        }
        warn!(query, keys = self.keys.len(), "all search keys failed");
        None
    }
}
