/*
 * Parley - Resilient chat relay
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Telegram Bot API transport.

use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::transport::{Inbound, Markup, Transport, TransportError};

/// Message fields that carry non-text content.
const ATTACHMENT_FIELDS: &[&str] = &[
    "photo",
    "document",
    "voice",
    "audio",
    "video",
    "video_note",
    "sticker",
    "animation",
];

pub struct TelegramTransport {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl TelegramTransport {
    #[must_use]
    pub fn new(client: reqwest::Client, api_base: &str, token: &str) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    /// # Errors
    ///
    /// Returns `TransportError::Request` if the HTTP client cannot be built.
    pub fn with_timeout(api_base: &str, token: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::new(client, api_base, token))
    }

    async fn call(&self, method: &str, payload: &Value) -> Result<(), TransportError> {
        let url = format!("{}/bot{}/{method}", self.api_base, self.token);
        let resp = self.client.post(&url).json(payload).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        let description = body
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("no description")
            .to_string();
        Err(TransportError::Rejected {
            status: status.as_u16(),
            description,
        })
    }
}

#[async_trait::async_trait]
impl Transport for TelegramTransport {
    async fn send_typing(&self, conversation_id: &str) -> Result<(), TransportError> {
        self.call(
            "sendChatAction",
            &serde_json::json!({"chat_id": conversation_id, "action": "typing"}),
        )
        .await
    }

    async fn send_text(
        &self,
        conversation_id: &str,
        text: &str,
        markup: Markup,
    ) -> Result<(), TransportError> {
        let mut payload = serde_json::json!({
            "chat_id": conversation_id,
            "text": text,
            "link_preview_options": {"is_disabled": true},
        });
        if markup == Markup::Html {
            payload["parse_mode"] = Value::String("HTML".to_string());
        }
        debug!(conversation_id, chars = text.chars().count(), ?markup, "sending message");
        self.call("sendMessage", &payload).await
    }
}

/// Extract the user message from a webhook update. `None` for updates that
/// carry no message (callback queries, membership changes, ...).
#[must_use]
pub fn parse_update(update: &Value) -> Option<Inbound> {
    let message = update
        .get("message")
        .or_else(|| update.get("edited_message"))?;
    let conversation_id = id_string(message.get("chat")?.get("id")?)?;
    let user_id = message
        .get("from")
        .and_then(|f| f.get("id"))
        .and_then(id_string);
    let text = message
        .get("text")
        .or_else(|| message.get("caption"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let has_attachment = ATTACHMENT_FIELDS.iter().any(|f| message.get(*f).is_some());

    Some(Inbound {
        conversation_id,
        user_id,
        text,
        has_attachment,
    })
}

fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_text_update() {
        let update = json!({
            "update_id": 1,
            "message": {
                "message_id": 10,
                "from": {"id": 777, "is_bot": false},
                "chat": {"id": -100123, "type": "group"},
                "text": "What's the weather in Manila today?"
            }
        });
        let inbound = parse_update(&update).unwrap();
        assert_eq!(inbound.conversation_id, "-100123");
        assert_eq!(inbound.user_id.as_deref(), Some("777"));
        assert_eq!(inbound.trimmed_text(), Some("What's the weather in Manila today?"));
        assert!(!inbound.has_attachment);
    }

    #[test]
    fn test_parse_photo_with_caption() {
        let update = json!({
            "message": {
                "chat": {"id": 5},
                "photo": [{"file_id": "a"}, {"file_id": "b"}],
                "caption": "what is this?"
            }
        });
        let inbound = parse_update(&update).unwrap();
        assert!(inbound.has_attachment);
        assert_eq!(inbound.text.as_deref(), Some("what is this?"));
    }

    #[test]
    fn test_parse_voice_without_text() {
        let update = json!({"edited_message": {"chat": {"id": 5}, "voice": {"file_id": "v"}}});
        let inbound = parse_update(&update).unwrap();
        assert!(inbound.has_attachment);
        assert!(inbound.trimmed_text().is_none());
    }

    #[test]
    fn test_parse_ignores_non_messages() {
        assert!(parse_update(&json!({"callback_query": {"id": "1"}})).is_none());
        assert!(parse_update(&json!({"message": {"text": "no chat"}})).is_none());
    }

    #[tokio::test]
    async fn test_send_text_html() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .and(body_partial_json(json!({"chat_id": "42", "parse_mode": "HTML", "text": "<b>hi</b>"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let tg = TelegramTransport::new(reqwest::Client::new(), &server.uri(), "TOKEN");
        tg.send_text("42", "<b>hi</b>", Markup::Html).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_text_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "ok": false,
                "error_code": 400,
                "description": "Bad Request: can't parse entities"
            })))
            .mount(&server)
            .await;

        let tg = TelegramTransport::new(reqwest::Client::new(), &server.uri(), "TOKEN");
        let err = tg.send_text("42", "<b>broken", Markup::Html).await.unwrap_err();
        match err {
            TransportError::Rejected { status, description } => {
                assert_eq!(status, 400);
                assert!(description.contains("can't parse entities"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_send_typing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendChatAction"))
            .and(body_partial_json(json!({"chat_id": "42", "action": "typing"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let tg = TelegramTransport::new(reqwest::Client::new(), &server.uri(), "TOKEN");
        tg.send_typing("42").await.unwrap();
    }

    #[tokio::test]
    async fn test_request_error_hides_bot_token() {
        let tg = TelegramTransport::new(reqwest::Client::new(), "http://127.0.0.1:9", "123456:SECRET-BOT-TOKEN");
        let err = tg.send_text("42", "hi", Markup::Plain).await.unwrap_err();
        assert!(matches!(err, TransportError::Request(_)));
        assert!(!err.to_string().contains("SECRET-BOT-TOKEN"), "{err}");
        assert!(!format!("{err:?}").contains("SECRET-BOT-TOKEN"));
        let source = std::error::Error::source(&err).unwrap();
        assert!(!source.to_string().contains("SECRET-BOT-TOKEN"));
    }
}
