/*
 * Parley - Resilient chat relay
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Credential-rotating completion dispatch.
//!
//! Callers see one logical call that either succeeds or fails as a whole; how
//! many credentials exist and which of them are unhealthy stays in the logs.

use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::credentials::{Credential, CredentialPool};
use crate::kv::StoreError;
use crate::message::ChatMessage;
use crate::payload::{Payload, is_soft_failure, strip_think_tags};
use crate::provider::{CompletionProvider, ProviderError};

/// Why a single attempt, or the whole rotation, failed.
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("no completion credentials configured")]
    NoCredentials,
    #[error("credential store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("provider returned an empty payload")]
    EmptyPayload,
    #[error("provider error: {0}")]
    ProviderMessage(String),
    #[error("unrecognized payload shape")]
    UnknownShape,
    #[error("provider returned no text")]
    EmptyText,
    #[error("provider answered with a quota notice: {0}")]
    SoftFailure(String),
}

/// Result of trying the credential pool for one logical call.
#[derive(Debug)]
pub enum DispatchOutcome {
    Success(String),
    Failure(DispatchError),
}

impl DispatchOutcome {
    /// # Errors
    ///
    /// Returns the last attempt's error for `Failure`.
    pub fn into_result(self) -> Result<String, DispatchError> {
        match self {
            DispatchOutcome::Success(text) => Ok(text),
            DispatchOutcome::Failure(e) => Err(e),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, DispatchOutcome::Success(_))
    }
}

/// Validate a raw payload and pull the answer out of it.
///
/// # Errors
///
/// Returns the `DispatchError` describing why the payload is not an answer:
/// empty body, error object, unknown shape, no text, or a disguised quota
/// notice shorter than `soft_failure_max_chars`.
pub fn accept_payload(
    raw: Option<&serde_json::Value>,
    soft_failure_max_chars: usize,
) -> Result<String, DispatchError> {
    let payload = Payload::classify(raw);
    match &payload {
        Payload::Empty => return Err(DispatchError::EmptyPayload),
        Payload::Error(msg) => return Err(DispatchError::ProviderMessage(msg.clone())),
        Payload::Unknown => return Err(DispatchError::UnknownShape),
        Payload::Text(_) | Payload::Message(_) | Payload::Blocks(_) => {}
    }
    let text = strip_think_tags(&payload.text().unwrap_or_default());
    if text.is_empty() {
        return Err(DispatchError::EmptyText);
    }
    if is_soft_failure(&text, soft_failure_max_chars) {
        return Err(DispatchError::SoftFailure(text));
    }
    Ok(text)
}

pub struct ProviderDispatcher {
    pool: Arc<CredentialPool>,
    provider: Arc<dyn CompletionProvider>,
    soft_failure_max_chars: usize,
    shuffle: bool,
}

impl ProviderDispatcher {
    #[must_use]
    pub fn new(
        pool: Arc<CredentialPool>,
        provider: Arc<dyn CompletionProvider>,
        soft_failure_max_chars: usize,
    ) -> Self {
        Self {
            pool,
            provider,
            soft_failure_max_chars,
            shuffle: true,
        }
    }

    /// Try credentials in pool order instead of a random permutation.
    #[must_use]
    pub fn sequential(mut self) -> Self {
        self.shuffle = false;
        self
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<dyn CompletionProvider> {
        &self.provider
    }

    async fn attempt(
        &self,
        messages: &[ChatMessage],
        model: &str,
        credential: &Credential,
    ) -> Result<String, DispatchError> {
        let raw = self.provider.complete(messages, model, credential).await?;
        accept_payload(raw.as_ref(), self.soft_failure_max_chars)
    }

    /// Try each credential once, in random order, until one yields an answer.
    pub async fn dispatch(&self, messages: &[ChatMessage], model: &str) -> DispatchOutcome {
        let mut order = match self.pool.all().await {
            Ok(creds) => creds,
            Err(e) => return DispatchOutcome::Failure(DispatchError::Store(e)),
        };
        if order.is_empty() {
            return DispatchOutcome::Failure(DispatchError::NoCredentials);
        }
        if self.shuffle {
            order.shuffle(&mut rand::rng());
        }

        let total = order.len();
        let mut last = DispatchError::NoCredentials;
        for (idx, credential) in order.iter().enumerate() {
            let attempt = idx + 1;
            match self.attempt(messages, model, credential).await {
                Ok(text) => {
                    if attempt > 1 {
                        info!(model, attempt, total, credential = %credential.masked(), "completion succeeded after failover");
                    } else {
                        debug!(model, credential = %credential.masked(), "completion succeeded");
                    }
                    return DispatchOutcome::Success(text);
                }
                Err(e) => {
                    warn!(
                        model,
                        attempt,
                        total,
                        credential = %credential.masked(),
                        source = credential.source.as_str(),
                        error = %e,
                        "completion attempt failed"
                    );
                    last = e;
                }
            }
        }
        warn!(model, total, error = %last, "all completion credentials exhausted");
        DispatchOutcome::Failure(last)
    }
}
