/*
 * Parley - Resilient chat relay
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// One entry of a conversation history.
///
/// `content` is what the user saw. `provenance` holds context that was used
/// to produce the message (rendered search results) and is persisted and
/// replayed to the model but never displayed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
}

impl Message {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            provenance: None,
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    #[must_use]
    pub fn with_provenance(mut self, provenance: impl Into<String>) -> Self {
        let provenance = provenance.into();
        self.provenance = (!provenance.trim().is_empty()).then_some(provenance);
        self
    }

    /// Text shown to the end user.
    #[must_use]
    pub fn display_text(&self) -> &str {
        &self.content
    }

    /// Text written to the store and replayed to the model.
    #[must_use]
    pub fn stored_text(&self) -> String {
        match &self.provenance {
            Some(p) => format!("{}\n\n{p}", self.content),
            None => self.content.clone(),
        }
    }
}

/// Routing decision for one inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Intent {
    Direct,
    Search(String),
}

/// Wire form of a prompt message sent to a completion provider.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

impl From<&Message> for ChatMessage {
    fn from(m: &Message) -> Self {
        Self {
            role: m.role,
            content: m.stored_text(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_provenance_hidden_from_display() {
        let msg = Message::assistant("It is 31°C in Manila.")
            .with_provenance("[search: weather Manila]\n1. PAGASA forecast");
        assert_eq!(msg.display_text(), "It is 31°C in Manila.");
        assert!(msg.stored_text().starts_with("It is 31°C in Manila."));
        assert!(msg.stored_text().contains("PAGASA"));
        assert!(msg.display_text().len() < msg.stored_text().len());
    }

    #[test]
    fn test_blank_provenance_is_dropped() {
        let msg = Message::assistant("hi").with_provenance("   ");
        assert!(msg.provenance.is_none());
        assert_eq!(msg.stored_text(), "hi");
    }

    #[test]
    fn test_serde_shape() {
        let msg = Message::user("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, serde_json::json!({"role": "user", "content": "hello"}));

        let back: Message =
            serde_json::from_value(serde_json::json!({"role": "assistant", "content": "x", "provenance": "p"}))
                .unwrap();
        assert_eq!(back.role, Role::Assistant);
        assert_eq!(back.provenance.as_deref(), Some("p"));
    }

    #[test]
    fn test_chat_message_replays_stored_text() {
        let msg = Message::assistant("answer").with_provenance("sources");
        let wire = ChatMessage::from(&msg);
        assert_eq!(wire.content, "answer\n\nsources");
        assert_eq!(wire.role.as_str(), "assistant");
    }
}
