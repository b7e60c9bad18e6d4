/*
 * Parley - Resilient chat relay
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! End-to-end handling of one inbound message.
//!
//! `handle` never fails outward: every error below a total failure is
//! absorbed by the stage that hit it, and a total failure becomes a visible
//! error reply.

use std::sync::Arc;

use chrono::NaiveDate;
use parley_config::Config;
use tracing::{debug, error, info, warn};

use crate::commands::{CommandReply, parse_command};
use crate::dispatch::{DispatchError, ProviderDispatcher};
use crate::format::{chunk, escape_html, format, strip_markup};
use crate::history::{ConversationStore, PreferenceStore};
use crate::kv::{KeyValueStore, StoreError};
use crate::message::{ChatMessage, Intent, Message, Role};
use crate::router::IntentRouter;
use crate::search::SearchAugmenter;
use crate::transport::{Inbound, Markup, Transport, TransportError};

pub(crate) const ATTACHMENT_REPLY: &str =
    "I can only read text messages. Please type your question instead.";

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("storage unavailable: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Settings the pipeline needs, lifted out of [`Config`].
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub default_model: String,
    pub router_model: String,
    pub router_context_messages: usize,
    pub system_prompt: String,
    pub history_limit: usize,
    pub max_message_chars: usize,
    pub admin_ids: Vec<String>,
}

impl PipelineConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_model: config.provider.default_model.clone(),
            router_model: config.provider.router_model.clone(),
            router_context_messages: config.chat.router_context_messages,
            system_prompt: config.chat.system_prompt.clone(),
            history_limit: config.chat.history_limit,
            max_message_chars: config.telegram.max_message_chars,
            admin_ids: config.chat.admin_ids.clone(),
        }
    }
}

type Clock = Box<dyn Fn() -> NaiveDate + Send + Sync>;

pub struct RequestPipeline {
    pub(crate) config: PipelineConfig,
    pub(crate) dispatcher: Arc<ProviderDispatcher>,
    pub(crate) router: IntentRouter,
    pub(crate) search: SearchAugmenter,
    pub(crate) history: ConversationStore,
    pub(crate) prefs: PreferenceStore,
    pub(crate) transport: Arc<dyn Transport>,
    today: Clock,
}

impl RequestPipeline {
    #[must_use]
    pub fn new(
        config: PipelineConfig,
        dispatcher: Arc<ProviderDispatcher>,
        search: SearchAugmenter,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let router = IntentRouter::new(
            dispatcher.clone(),
            &config.router_model,
            config.router_context_messages,
        );
        Self {
            history: ConversationStore::new(store.clone(), config.history_limit),
            prefs: PreferenceStore::new(store),
            router,
            search,
            dispatcher,
            transport,
            config,
            today: Box::new(|| chrono::Local::now().date_naive()),
        }
    }

    /// Pin the date used in prompts.
    #[must_use]
    pub fn with_clock(mut self, today: impl Fn() -> NaiveDate + Send + Sync + 'static) -> Self {
        self.today = Box::new(today);
        self
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<ProviderDispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub fn search(&self) -> &SearchAugmenter {
        &self.search
    }

    pub async fn handle(&self, inbound: &Inbound) {
        let id = inbound.conversation_id.as_str();
        let Some(text) = inbound.trimmed_text() else {
            if inbound.has_attachment {
                debug!(conversation_id = id, "attachment without text");
                self.emit_text(id, ATTACHMENT_REPLY).await;
            }
            return;
        };

        let mut forced = None;
        if let Some(command) = parse_command(text) {
            match self.run_command(inbound, command).await {
                CommandReply::Text(reply) => {
                    self.emit_text(id, &reply).await;
                    return;
                }
                CommandReply::Search(query) => forced = Some(query),
            }
        }

        let question = forced.as_deref().unwrap_or(text);
        let intent = forced.clone().map(Intent::Search);
        if let Err(e) = self.answer(id, question, intent).await {
            error!(conversation_id = id, error = %e, "request failed");
            self.emit_text(id, &format!("Sorry, I couldn't get an answer right now. ({e})"))
                .await;
        }
    }

    async fn answer(
        &self,
        id: &str,
        text: &str,
        intent: Option<Intent>,
    ) -> Result<(), PipelineError> {
        if let Err(e) = self.transport.send_typing(id).await {
            debug!(conversation_id = id, error = %e, "typing indicator failed");
        }

        let history = self.history.load(id).await?;
        let prefs = self.prefs.load(id).await?;
        let today = (self.today)();

        let intent = match intent {
            Some(intent) => intent,
            None if self.search.is_enabled() => self.router.classify(&history, text, today).await,
            None => Intent::Direct,
        };

        let research = match &intent {
            Intent::Search(query) => {
                let block = self.search.research(query).await;
                Some(Research {
                    query: query.clone(),
                    block,
                })
            }
            Intent::Direct => None,
        };

        let system = prefs
            .system_prompt
            .as_deref()
            .unwrap_or(&self.config.system_prompt);
        let prompt = build_prompt(system, today, &history, research.as_ref(), text);
        let model = prefs
            .model
            .as_deref()
            .unwrap_or(&self.config.default_model);

        let reply = self.dispatcher.dispatch(&prompt, model).await.into_result()?;
        info!(
            conversation_id = id,
            model,
            searched = research.as_ref().is_some_and(|r| r.block.is_some()),
            "reply generated"
        );

        let rendered = format(&reply);
        let mut assistant = Message::assistant(reply);
        if let Some(provenance) = research.as_ref().and_then(Research::provenance) {
            assistant = assistant.with_provenance(provenance);
        }
        let mut updated = history;
        updated.push(Message::user(text));
        updated.push(assistant);
        if let Err(e) = self.history.save(id, updated).await {
            // The answer exists; deliver it even though this turn is lost.
            error!(conversation_id = id, error = %e, "failed to persist history");
        }

        self.emit(id, &rendered).await;
        Ok(())
    }

    /// Send plain text through the HTML path.
    pub(crate) async fn emit_text(&self, id: &str, text: &str) {
        self.emit(id, &escape_html(text)).await;
    }

    /// Send `rendered` chunk by chunk. A chunk the transport rejects as HTML
    /// is resent once as plain text. Network errors are only logged, since
    /// the first send may still have been delivered.
    async fn emit(&self, id: &str, rendered: &str) {
        for piece in chunk(rendered, self.config.max_message_chars) {
            match self.transport.send_text(id, piece, Markup::Html).await {
                Ok(()) => {}
                Err(e @ TransportError::Rejected { .. }) => {
                    warn!(conversation_id = id, error = %e, "HTML message rejected, resending as plain text");
                    let plain = strip_markup(piece);
                    if let Err(e) = self.transport.send_text(id, &plain, Markup::Plain).await {
                        error!(conversation_id = id, error = %e, "plain-text resend failed");
                    }
                }
                Err(e) => {
                    error!(conversation_id = id, error = %e, "failed to send message");
                }
            }
        }
    }
}

struct Research {
    query: String,
    block: Option<String>,
}

impl Research {
    fn provenance(&self) -> Option<String> {
        self.block
            .as_ref()
            .map(|block| format!("[search: {}]\n{block}", self.query))
    }
}

fn build_prompt(
    system: &str,
    today: NaiveDate,
    history: &[Message],
    research: Option<&Research>,
    text: &str,
) -> Vec<ChatMessage> {
    let mut prompt = vec![ChatMessage::new(
        Role::System,
        format!(
            "{system}\n\nToday is {}, {}.",
            today.format("%A"),
            today.format("%Y-%m-%d")
        ),
    )];
    prompt.extend(
        history
            .iter()
            .filter(|m| m.role != Role::System)
            .map(ChatMessage::from),
    );

    let context = match research {
        Some(Research {
            query,
            block: Some(block),
        }) => format!(
            "Live web search results for \"{query}\":\n\n{block}\n\n\
             Base your answer on these results and mention sources where useful. \
             If they do not cover the question, say so."
        ),
        Some(Research { query, block: None }) => format!(
            "A live web search for \"{query}\" returned nothing usable. You have no live data \
             for this question: say so plainly and do not fabricate current figures, dates or events."
        ),
        None => "No live web data was retrieved for this message. Do not present guesses \
                 about current events, prices or weather as fact."
            .to_string(),
    };
    prompt.push(ChatMessage::new(Role::System, context));
    prompt.push(ChatMessage::new(Role::User, text));
    prompt
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    #[test]
    fn test_prompt_layout() {
        let history = vec![
            Message::user("Who won?"),
            Message::assistant("Argentina.").with_provenance("[search: world cup winner]\nAnswer: Argentina"),
        ];
        let research = Research {
            query: "weather forecast Manila 2026-10-19".into(),
            block: Some("Answer: Rain.".into()),
        };
        let prompt = build_prompt("Be brief.", day(), &history, Some(&research), "And today?");

        assert_eq!(prompt.len(), 5);
        assert_eq!(prompt[0].role, Role::System);
        assert!(prompt[0].content.starts_with("Be brief."));
        assert!(prompt[0].content.contains("Monday, 2026-10-19"));
        // Stored provenance is replayed to the model.
        assert!(prompt[2].content.contains("[search: world cup winner]"));
        assert!(prompt[3].content.contains("Answer: Rain."));
        assert_eq!(prompt[4].content, "And today?");
        assert_eq!(prompt[4].role, Role::User);
    }

    #[test]
    fn test_prompt_without_live_data() {
        let failed = Research {
            query: "bitcoin price".into(),
            block: None,
        };
        let prompt = build_prompt("sys", day(), &[], Some(&failed), "price?");
        assert!(prompt[1].content.contains("no live data"));
        assert!(prompt[1].content.contains("do not fabricate"));

        let direct = build_prompt("sys", day(), &[], None, "hi");
        assert!(direct[1].content.contains("No live web data"));
    }

    #[test]
    fn test_provenance_only_with_results() {
        let hit = Research {
            query: "q".into(),
            block: Some("Answer: x".into()),
        };
        assert_eq!(hit.provenance().unwrap(), "[search: q]\nAnswer: x");
        let miss = Research {
            query: "q".into(),
            block: None,
        };
        assert!(miss.provenance().is_none());
    }
}
