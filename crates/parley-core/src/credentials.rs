/*
 * Parley - Resilient chat relay
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Completion-provider credential pool.
//!
//! The effective pool is the deduplicated union of the static keys from
//! configuration and the dynamic keys registered at runtime. Only dynamic keys
//! are persisted, and only dynamic keys can be removed.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::kv::{KeyValueStore, StoreError, value_kind};

const DYNAMIC_KEY: &str = "credentials:dynamic";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialSource {
    Static,
    Dynamic,
}

impl CredentialSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialSource::Static => "static",
            CredentialSource::Dynamic => "dynamic",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub value: String,
    pub source: CredentialSource,
}

impl Credential {
    #[must_use]
    pub fn new(value: impl Into<String>, source: CredentialSource) -> Self {
        Self {
            value: value.into(),
            source,
        }
    }

    #[must_use]
    pub fn masked(&self) -> String {
        mask(&self.value)
    }
}

// Never print the raw value.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("value", &self.masked())
            .field("source", &self.source)
            .finish()
    }
}

/// Render a secret as `…` plus its last four characters.
#[must_use]
pub fn mask(value: &str) -> String {
    let count = value.chars().count();
    if count <= 4 {
        return "…".to_string();
    }
    let tail: String = value.chars().skip(count - 4).collect();
    format!("…{tail}")
}

#[derive(thiserror::Error, Debug)]
pub enum CredentialError {
    #[error("credential {0} comes from configuration and cannot be removed")]
    StaticCredential(String),
    #[error("no credential at index {0}")]
    IndexOutOfRange(usize),
    #[error("credential value is empty")]
    Empty,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct CredentialPool {
    static_keys: Vec<String>,
    store: Arc<dyn KeyValueStore>,
}

impl CredentialPool {
    #[must_use]
    pub fn new(static_keys: Vec<String>, store: Arc<dyn KeyValueStore>) -> Self {
        let static_keys = dedup(
            static_keys
                .into_iter()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty()),
        );
        Self { static_keys, store }
    }

    async fn load_dynamic(&self) -> Result<Vec<String>, StoreError> {
        let Some(raw) = self.store.get(DYNAMIC_KEY).await? else {
            return Ok(Vec::new());
        };
        match raw {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()),
            other => {
                warn!(kind = %value_kind(&other), "dynamic credential set is not an array, ignoring");
                Ok(Vec::new())
            }
        }
    }

    async fn save_dynamic(&self, keys: &[String]) -> Result<(), StoreError> {
        let value = Value::Array(keys.iter().cloned().map(Value::String).collect());
        self.store.set(DYNAMIC_KEY, value).await
    }

    fn is_static(&self, value: &str) -> bool {
        self.static_keys.iter().any(|k| k == value)
    }

    /// Static credentials in configuration order, then dynamic ones in
    /// registration order. Each value appears once.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the dynamic set cannot be read.
    pub async fn all(&self) -> Result<Vec<Credential>, StoreError> {
        let dynamic = self.load_dynamic().await?;
        let mut out: Vec<Credential> = self
            .static_keys
            .iter()
            .map(|k| Credential::new(k.clone(), CredentialSource::Static))
            .collect();
        for key in dedup(dynamic.into_iter()) {
            if !self.is_static(&key) {
                out.push(Credential::new(key, CredentialSource::Dynamic));
            }
        }
        Ok(out)
    }

    /// Number of static credentials.
    #[must_use]
    pub fn static_count(&self) -> usize {
        self.static_keys.len()
    }

    /// Register a dynamic credential. Returns `false` if it is already in the
    /// pool from either source.
    ///
    /// # Errors
    ///
    /// Returns `CredentialError::Empty` for a blank value, or a store error.
    pub async fn add(&self, value: &str) -> Result<bool, CredentialError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(CredentialError::Empty);
        }
        if self.is_static(value) {
            return Ok(false);
        }
        let mut dynamic = self.load_dynamic().await?;
        if dynamic.iter().any(|k| k == value) {
            return Ok(false);
        }
        dynamic.push(value.to_string());
        self.save_dynamic(&dynamic).await?;
        info!(credential = %mask(value), "dynamic credential added");
        Ok(true)
    }

    /// Remove dynamic credentials by value. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `CredentialError::StaticCredential` (and removes nothing) if any
    /// value belongs to the static set.
    pub async fn remove(&self, values: &[String]) -> Result<usize, CredentialError> {
        if let Some(stat) = values.iter().find(|v| self.is_static(v.trim())) {
            return Err(CredentialError::StaticCredential(mask(stat.trim())));
        }
        let dynamic = self.load_dynamic().await?;
        let before = dynamic.len();
        let kept: Vec<String> = dynamic
            .into_iter()
            .filter(|k| !values.iter().any(|v| v.trim() == k))
            .collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.save_dynamic(&kept).await?;
            info!(removed, "dynamic credentials removed");
        }
        Ok(removed)
    }

    /// Remove the credential at `index` in [`CredentialPool::all`] order.
    ///
    /// # Errors
    ///
    /// Returns `IndexOutOfRange`, or `StaticCredential` when the index points
    /// at a configured key.
    pub async fn remove_at(&self, index: usize) -> Result<Credential, CredentialError> {
        let all = self.all().await?;
        let target = all
            .get(index)
            .cloned()
            .ok_or(CredentialError::IndexOutOfRange(index))?;
        if target.source == CredentialSource::Static {
            return Err(CredentialError::StaticCredential(target.masked()));
        }
        self.remove(std::slice::from_ref(&target.value)).await?;
        Ok(target)
    }

    /// Drop dynamic credentials the probe reports as exhausted.
    ///
    /// `probe` resolves to `Ok(true)` when the credential has no quota left.
    /// A probe error keeps the credential: it may be a transient network
    /// problem rather than an empty balance.
    ///
    /// # Errors
    ///
    /// Returns a store error if the dynamic set cannot be read or written.
    pub async fn prune<F, Fut, E>(&self, mut probe: F) -> Result<usize, CredentialError>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = Result<bool, E>>,
        E: std::fmt::Display,
    {
        let candidates: Vec<Credential> = self
            .all()
            .await?
            .into_iter()
            .filter(|c| c.source == CredentialSource::Dynamic)
            .collect();

        let mut exhausted = Vec::new();
        for cred in candidates {
            let masked = cred.masked();
            let value = cred.value.clone();
            match probe(cred).await {
                Ok(true) => {
                    info!(credential = %masked, "credential exhausted, pruning");
                    exhausted.push(value);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(credential = %masked, error = %e, "quota probe failed, keeping credential");
                }
            }
        }

        if exhausted.is_empty() {
            return Ok(0);
        }
        self.remove(&exhausted).await
    }
}

fn dedup(keys: impl Iterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for k in keys {
        if !out.contains(&k) {
            out.push(k);
        }
    }
    out
}
