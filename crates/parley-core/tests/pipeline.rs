/*
 * Parley - Resilient chat relay
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! End-to-end request handling against in-process fakes.

#![allow(clippy::unwrap_used)]

use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use parley_core::search::{SearchError, SearchHit, SearchResult};
use parley_core::{
    ChatMessage, CompletionProvider, ConversationStore, Credential, CredentialPool, Inbound,
    KeyValueStore, Markup, MemoryStore, Message, PipelineConfig, ProviderDispatcher, ProviderError,
    RequestPipeline, Role, SearchAugmenter, SearchProvider, Transport, TransportError,
};
use serde_json::{Value, json};

const ROUTER_MODEL: &str = "router-model";
const CHAT_MODEL: &str = "chat-model";

struct FakeProvider {
    router_reply: String,
    answer: Result<String, u16>,
    calls: Mutex<Vec<(String, Vec<ChatMessage>)>>,
}

impl FakeProvider {
    fn new(router_reply: &str, answer: Result<&str, u16>) -> Arc<Self> {
        Arc::new(Self {
            router_reply: router_reply.to_string(),
            answer: answer.map(str::to_string),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls_for(&self, model: &str) -> Vec<Vec<ChatMessage>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == model)
            .map(|(_, msgs)| msgs.clone())
            .collect()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl CompletionProvider for FakeProvider {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        model: &str,
        _credential: &Credential,
    ) -> Result<Option<Value>, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push((model.to_string(), messages.to_vec()));
        if model == ROUTER_MODEL {
            return Ok(Some(json!({"message": {"content": self.router_reply}})));
        }
        match &self.answer {
            Ok(text) => Ok(Some(json!({"message": {"role": "assistant", "content": text}}))),
            Err(status) => Err(ProviderError::Status {
                status: *status,
                body: "upstream exploded".to_string(),
            }),
        }
    }

    async fn remaining_quota(&self, _c: &Credential) -> Result<Option<f64>, ProviderError> {
        Ok(Some(1.0))
    }

    async fn list_models(&self, _c: &Credential) -> Result<Vec<String>, ProviderError> {
        Ok(vec![CHAT_MODEL.to_string()])
    }
}

#[derive(Default)]
struct FakeSearch {
    queries: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl SearchProvider for FakeSearch {
    async fn search(&self, query: &str, _api_key: &str) -> Result<SearchResult, SearchError> {
        self.queries.lock().unwrap().push(query.to_string());
        Ok(SearchResult {
            answer: Some("Thunderstorms likely in Manila, high of 31°C.".to_string()),
            hits: vec![SearchHit {
                title: "Manila weather forecast".to_string(),
                url: "https://weather.example/manila".to_string(),
                snippet: "Scattered thunderstorms in the afternoon.".to_string(),
            }],
        })
    }
}

#[derive(Default)]
struct FakeTransport {
    reject_html: bool,
    network_down: bool,
    sent: Mutex<Vec<(String, String, Markup)>>,
    typing: Mutex<usize>,
}

impl FakeTransport {
    fn rejecting_html() -> Self {
        Self {
            reject_html: true,
            ..Self::default()
        }
    }

    fn network_down() -> Self {
        Self {
            network_down: true,
            ..Self::default()
        }
    }

    fn sent(&self) -> Vec<(String, String, Markup)> {
        self.sent.lock().unwrap().clone()
    }

    fn texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, t, _)| t).collect()
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn send_typing(&self, _conversation_id: &str) -> Result<(), TransportError> {
        *self.typing.lock().unwrap() += 1;
        Ok(())
    }

    async fn send_text(
        &self,
        conversation_id: &str,
        text: &str,
        markup: Markup,
    ) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((conversation_id.to_string(), text.to_string(), markup));
        if self.network_down {
            let e = reqwest::Client::new()
                .post("http://127.0.0.1:9/sendMessage")
                .send()
                .await
                .unwrap_err();
            return Err(TransportError::from(e));
        }
        if self.reject_html && markup == Markup::Html {
            return Err(TransportError::Rejected {
                status: 400,
                description: "Bad Request: can't parse entities".to_string(),
            });
        }
        Ok(())
    }
}

struct Harness {
    pipeline: RequestPipeline,
    store: Arc<MemoryStore>,
    provider: Arc<FakeProvider>,
    search: Arc<FakeSearch>,
    transport: Arc<FakeTransport>,
}

fn config(admin_ids: Vec<String>) -> PipelineConfig {
    PipelineConfig {
        default_model: CHAT_MODEL.to_string(),
        router_model: ROUTER_MODEL.to_string(),
        router_context_messages: 6,
        system_prompt: "You are a helpful assistant.".to_string(),
        history_limit: 20,
        max_message_chars: 4000,
        admin_ids,
    }
}

fn harness(
    provider: Arc<FakeProvider>,
    search_keys: Vec<String>,
    transport: FakeTransport,
    admin_ids: Vec<String>,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let pool = Arc::new(CredentialPool::new(
        vec!["sk-one".to_string(), "sk-two".to_string()],
        store.clone(),
    ));
    let dispatcher = Arc::new(ProviderDispatcher::new(pool, provider.clone(), 150).sequential());
    let search = Arc::new(FakeSearch::default());
    let augmenter = SearchAugmenter::new(search.clone(), search_keys, 300);
    let transport = Arc::new(transport);
    let pipeline = RequestPipeline::new(
        config(admin_ids),
        dispatcher,
        augmenter,
        store.clone(),
        transport.clone(),
    )
    .with_clock(|| NaiveDate::from_ymd_opt(2026, 10, 19).unwrap());
    Harness {
        pipeline,
        store,
        provider,
        search,
        transport,
    }
}

async fn stored_history(store: &Arc<MemoryStore>, id: &str) -> Vec<Message> {
    ConversationStore::new(store.clone(), 20).load(id).await.unwrap()
}

#[tokio::test]
async fn weather_question_is_searched_and_provenance_stays_hidden() {
    let provider = FakeProvider::new(
        "SEARCH: weather forecast Manila 2026-10-19",
        Ok("**Thunderstorms** are likely in Manila today, with a high near 31°C."),
    );
    let h = harness(provider, vec!["tvly-key".into()], FakeTransport::default(), vec![]);

    h.pipeline
        .handle(&Inbound::text("42", "What's the weather in Manila today?"))
        .await;

    assert_eq!(
        *h.search.queries.lock().unwrap(),
        vec!["weather forecast Manila 2026-10-19".to_string()]
    );

    // The answering call saw the search block.
    let answer_calls = h.provider.calls_for(CHAT_MODEL);
    assert_eq!(answer_calls.len(), 1);
    assert!(
        answer_calls[0]
            .iter()
            .any(|m| m.role == Role::System && m.content.contains("Thunderstorms likely in Manila"))
    );

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    let (id, text, markup) = &sent[0];
    assert_eq!(id, "42");
    assert_eq!(*markup, Markup::Html);
    assert_eq!(
        text,
        "<b>Thunderstorms</b> are likely in Manila today, with a high near 31°C."
    );
    assert!(!text.contains("[search:"));
    assert!(!text.contains("weather.example"));

    let history = stored_history(&h.store, "42").await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0], Message::user("What's the weather in Manila today?"));
    let reply = &history[1];
    assert_eq!(reply.role, Role::Assistant);
    let provenance = reply.provenance.as_deref().unwrap();
    assert!(provenance.starts_with("[search: weather forecast Manila 2026-10-19]"));
    assert!(provenance.contains("https://weather.example/manila"));
    assert!(reply.display_text().len() < reply.stored_text().len());
    assert_eq!(*h.transport.typing.lock().unwrap(), 1);
}

#[tokio::test]
async fn clear_command_empties_history_without_provider_calls() {
    let provider = FakeProvider::new("DIRECT", Ok("unused"));
    let h = harness(provider, vec![], FakeTransport::default(), vec![]);
    h.store
        .set("history:7", json!([{"role": "user", "content": "old"}]))
        .await
        .unwrap();

    h.pipeline.handle(&Inbound::text("7", "/clear")).await;

    assert_eq!(h.store.get("history:7").await.unwrap(), Some(json!([])));
    assert_eq!(h.provider.call_count(), 0);
    assert_eq!(h.transport.texts(), vec!["Conversation cleared.".to_string()]);
}

#[tokio::test]
async fn rejected_html_chunk_is_resent_as_plain_text() {
    let provider = FakeProvider::new("DIRECT", Ok("Use **Rust** & <be happy>"));
    let h = harness(provider, vec![], FakeTransport::rejecting_html(), vec![]);

    h.pipeline.handle(&Inbound::text("9", "advice?")).await;

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].2, Markup::Html);
    assert_eq!(sent[0].1, "Use <b>Rust</b> &amp; &lt;be happy&gt;");
    assert_eq!(sent[1].2, Markup::Plain);
    assert_eq!(sent[1].1, "Use Rust & <be happy>");
}

#[tokio::test]
async fn network_error_is_not_resent_as_plain_text() {
    let provider = FakeProvider::new("DIRECT", Ok("Use **Rust**"));
    let h = harness(provider, vec![], FakeTransport::network_down(), vec![]);

    h.pipeline.handle(&Inbound::text("9", "advice?")).await;

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].2, Markup::Html);
}

#[tokio::test]
async fn total_failure_sends_visible_error_and_persists_nothing() {
    let provider = FakeProvider::new("DIRECT", Err(503));
    let h = harness(provider, vec![], FakeTransport::default(), vec![]);

    h.pipeline.handle(&Inbound::text("5", "hello there friend, how are you?")).await;

    // Both credentials tried once each.
    assert_eq!(h.provider.calls_for(CHAT_MODEL).len(), 2);
    let texts = h.transport.texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].starts_with("Sorry"));
    assert!(texts[0].contains("503"));
    assert!(h.store.get("history:5").await.unwrap().is_none());
}

#[tokio::test]
async fn attachment_without_text_gets_text_only_reply() {
    let provider = FakeProvider::new("DIRECT", Ok("unused"));
    let h = harness(provider, vec!["tvly".into()], FakeTransport::default(), vec![]);
    let inbound = Inbound {
        conversation_id: "3".into(),
        user_id: Some("11".into()),
        text: None,
        has_attachment: true,
    };

    h.pipeline.handle(&inbound).await;

    assert_eq!(h.provider.call_count(), 0);
    let texts = h.transport.texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("text"));
}

#[tokio::test]
async fn router_is_skipped_without_search_keys() {
    let provider = FakeProvider::new("SEARCH: should not be used", Ok("Hello!"));
    let h = harness(provider, vec![], FakeTransport::default(), vec![]);

    h.pipeline.handle(&Inbound::text("8", "Tell me about the weather")).await;

    assert!(h.provider.calls_for(ROUTER_MODEL).is_empty());
    assert!(h.search.queries.lock().unwrap().is_empty());
    assert_eq!(h.transport.texts(), vec!["Hello!".to_string()]);
}

#[tokio::test]
async fn search_command_forces_lookup() {
    let provider = FakeProvider::new("DIRECT", Ok("Here is what I found."));
    let h = harness(provider, vec!["tvly".into()], FakeTransport::default(), vec![]);

    h.pipeline.handle(&Inbound::text("4", "/search PAGASA typhoon bulletin")).await;

    assert!(h.provider.calls_for(ROUTER_MODEL).is_empty());
    assert_eq!(
        *h.search.queries.lock().unwrap(),
        vec!["PAGASA typhoon bulletin".to_string()]
    );
    let history = stored_history(&h.store, "4").await;
    assert_eq!(history[0].content, "PAGASA typhoon bulletin");
    assert!(history[1].provenance.is_some());
}

#[tokio::test]
async fn model_preference_applies_to_next_answer() {
    let provider = FakeProvider::new("DIRECT", Ok("ok"));
    let h = harness(provider, vec![], FakeTransport::default(), vec![]);

    h.pipeline.handle(&Inbound::text("6", "/model custom/model-x")).await;
    h.pipeline.handle(&Inbound::text("6", "hi")).await;

    let calls = h.provider.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "custom/model-x");
    assert_eq!(h.transport.texts()[0], "Model set to custom/model-x.");
}

#[tokio::test]
async fn key_commands_respect_admin_list() {
    let provider = FakeProvider::new("DIRECT", Ok("ok"));
    let h = harness(provider, vec![], FakeTransport::default(), vec!["1".into()]);

    h.pipeline
        .handle(&Inbound::text("2", "/addkey sk-intruder-9999").from_user("2"))
        .await;
    assert!(h.transport.texts()[0].contains("restricted"));
    assert!(h.store.get("credentials:dynamic").await.unwrap().is_none());

    h.pipeline
        .handle(&Inbound::text("1", "/addkey sk-admin-added-4242").from_user("1"))
        .await;
    h.pipeline.handle(&Inbound::text("1", "/keys").from_user("1")).await;

    let texts = h.transport.texts();
    assert!(texts[1].contains("…4242"));
    assert!(!texts[1].contains("sk-admin"));
    let listing = &texts[2];
    assert!(listing.contains("1. …-one (static)"));
    assert!(listing.contains("3. …4242 (dynamic)"));
}
