/*
 * Parley - Resilient chat relay
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Per-conversation history and preferences.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::kv::{KeyValueStore, StoreError, value_kind};
use crate::message::Message;

fn history_key(conversation_id: &str) -> String {
    format!("history:{conversation_id}")
}

fn prefs_key(conversation_id: &str) -> String {
    format!("prefs:{conversation_id}")
}

/// Keep the newest `limit` messages, preserving order.
#[must_use]
pub fn trim(mut history: Vec<Message>, limit: usize) -> Vec<Message> {
    if history.len() > limit {
        history.drain(..history.len() - limit);
    }
    history
}

/// Bounded, FIFO-trimmed conversation log.
pub struct ConversationStore {
    store: Arc<dyn KeyValueStore>,
    limit: usize,
}

impl ConversationStore {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, limit: usize) -> Self {
        Self { store, limit }
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Messages for `conversation_id`, oldest first. Absent or unreadable
    /// history is empty.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend cannot be reached.
    pub async fn load(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let Some(raw) = self.store.get(&history_key(conversation_id)).await? else {
            return Ok(Vec::new());
        };
        if !raw.is_array() {
            warn!(conversation_id, kind = value_kind(&raw), "history is not an array, starting fresh");
            return Ok(Vec::new());
        }
        match serde_json::from_value::<Vec<Message>>(raw) {
            Ok(history) => Ok(history),
            Err(e) => {
                warn!(conversation_id, error = %e, "history undecodable, starting fresh");
                Ok(Vec::new())
            }
        }
    }

    /// Trim to the cap and write.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on write failure.
    pub async fn save(&self, conversation_id: &str, history: Vec<Message>) -> Result<(), StoreError> {
        let history = trim(history, self.limit);
        let value = serde_json::to_value(&history).unwrap_or(Value::Array(Vec::new()));
        self.store.set(&history_key(conversation_id), value).await
    }

    /// # Errors
    ///
    /// Returns `StoreError` on read or write failure.
    pub async fn append(&self, conversation_id: &str, message: Message) -> Result<(), StoreError> {
        let mut history = self.load(conversation_id).await?;
        history.push(message);
        self.save(conversation_id, history).await
    }

    /// Reset to an empty list.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on write failure.
    pub async fn clear(&self, conversation_id: &str) -> Result<(), StoreError> {
        self.store
            .set(&history_key(conversation_id), Value::Array(Vec::new()))
            .await
    }
}

/// Per-conversation overrides set through commands.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Preferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Preferences {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.model.is_none() && self.system_prompt.is_none()
    }
}

pub struct PreferenceStore {
    store: Arc<dyn KeyValueStore>,
}

impl PreferenceStore {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// # Errors
    ///
    /// Returns `StoreError` if the backend cannot be reached.
    pub async fn load(&self, conversation_id: &str) -> Result<Preferences, StoreError> {
        let Some(raw) = self.store.get(&prefs_key(conversation_id)).await? else {
            return Ok(Preferences::default());
        };
        Ok(serde_json::from_value(raw).unwrap_or_else(|e| {
            warn!(conversation_id, error = %e, "preferences undecodable, using defaults");
            Preferences::default()
        }))
    }

    /// Write `prefs`, deleting the entry when nothing is overridden.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on write failure.
    pub async fn save(&self, conversation_id: &str, prefs: &Preferences) -> Result<(), StoreError> {
        let key = prefs_key(conversation_id);
        if prefs.is_empty() {
            return self.store.del(&key).await;
        }
        let value = serde_json::to_value(prefs).unwrap_or(Value::Null);
        self.store.set(&key, value).await
    }
}
