/*
 * Parley - Resilient chat relay
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Chat transport seam: inbound messages in, typing indicators and text out.

/// How the receiving client should interpret outgoing text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Markup {
    Html,
    Plain,
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("transport request failed: {0}")]
    Request(#[source] reqwest::Error),
    /// The transport answered but refused the message (bad markup, too long,
    /// blocked by the user, ...).
    #[error("transport rejected message ({status}): {description}")]
    Rejected { status: u16, description: String },
}

// Request URLs embed the bot token; never keep them in the error.
impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        TransportError::Request(e.without_url())
    }
}

/// One user message as delivered by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inbound {
    pub conversation_id: String,
    pub user_id: Option<String>,
    pub text: Option<String>,
    pub has_attachment: bool,
}

impl Inbound {
    #[must_use]
    pub fn text(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_id: None,
            text: Some(text.into()),
            has_attachment: false,
        }
    }

    #[must_use]
    pub fn from_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Trimmed text, `None` when absent or blank.
    #[must_use]
    pub fn trimmed_text(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Show a typing indicator in `conversation_id`.
    async fn send_typing(&self, conversation_id: &str) -> Result<(), TransportError>;

    async fn send_text(
        &self,
        conversation_id: &str,
        text: &str,
        markup: Markup,
    ) -> Result<(), TransportError>;
}
