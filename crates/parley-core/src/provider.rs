/*
 * Parley - Resilient chat relay
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Completion provider seam and the OpenAI-compatible HTTP implementation.

use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::credentials::Credential;
use crate::message::ChatMessage;

/// Provider call errors, classified for logging.
#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unreadable response: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_decode() {
            ProviderError::Parse(e.to_string())
        } else {
            ProviderError::Connection(e.to_string())
        }
    }
}

#[async_trait::async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Issue one completion call. The returned value is the raw payload and is
    /// normalized by the dispatcher; `None` means the provider sent no body.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
        credential: &Credential,
    ) -> Result<Option<Value>, ProviderError>;

    /// Remaining credit for `credential`. `None` means unlimited or unknown.
    async fn remaining_quota(&self, credential: &Credential) -> Result<Option<f64>, ProviderError>;

    /// Model ids available to `credential`.
    async fn list_models(&self, credential: &Credential) -> Result<Vec<String>, ProviderError>;
}

/// Chat-completions client for OpenAI-compatible gateways (OpenRouter and
/// friends).
pub struct OpenAiCompatible {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiCompatible {
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Build with a dedicated client whose every request is bounded by
    /// `timeout`, so one stalled credential cannot stall the rotation.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Connection` if the TLS backend fails to load.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Connection(e.to_string()))?;
        Ok(Self::new(client, base_url))
    }

    async fn get_json(&self, path: &str, credential: &Credential) -> Result<Value, ProviderError> {
        let resp = self
            .client
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&credential.value)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }
        Ok(resp.json().await?)
    }
}

#[async_trait::async_trait]
impl CompletionProvider for OpenAiCompatible {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
        credential: &Credential,
    ) -> Result<Option<Value>, ProviderError> {
        let payload = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": false,
        });
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&credential.value)
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        let body: Value =
            serde_json::from_str(&text).map_err(|e| ProviderError::Parse(e.to_string()))?;
        debug!(model, credential = %credential.masked(), "completion response received");

        // Hand the first choice to the dispatcher; errors and odd shapes pass
        // through untouched so the dispatcher can classify them.
        if body.get("error").is_some_and(|e| !e.is_null()) {
            return Ok(Some(body));
        }
        match body.get("choices").and_then(|c| c.get(0)) {
            Some(choice) => Ok(Some(choice.clone())),
            None => Ok(Some(body)),
        }
    }

    async fn remaining_quota(&self, credential: &Credential) -> Result<Option<f64>, ProviderError> {
        let body = self.get_json("/key", credential).await?;
        let data = body.get("data").unwrap_or(&body);
        if let Some(remaining) = data.get("limit_remaining").and_then(Value::as_f64) {
            return Ok(Some(remaining));
        }
        // No explicit remainder: derive it from limit and usage when both exist.
        let limit = data.get("limit").and_then(Value::as_f64);
        let usage = data.get("usage").and_then(Value::as_f64);
        Ok(match (limit, usage) {
            (Some(limit), Some(usage)) => Some(limit - usage),
            _ => None,
        })
    }

    async fn list_models(&self, credential: &Credential) -> Result<Vec<String>, ProviderError> {
        let body = self.get_json("/models", credential).await?;
        let models = body
            .get("data")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 300;
    if body.chars().count() <= MAX {
        body.to_string()
    } else {
        let cut: String = body.chars().take(MAX).collect();
        format!("{cut}…")
    }
}
