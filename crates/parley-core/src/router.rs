/*
 * Parley - Resilient chat relay
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Decides whether a message needs live web search before it is answered.
//!
//! Cheap deterministic checks run first. Anything they cannot settle goes to
//! a small classifier model whose reply is parsed defensively; every failure
//! resolves to [`Intent::Direct`].

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::dispatch::ProviderDispatcher;
use crate::message::{ChatMessage, Intent, Message, Role};
use crate::payload::strip_think_tags;

/// Leading phrases that ask for a lookup. The remainder is the query.
const LOOKUP_PREFIXES: &[&str] = &[
    "search for",
    "search",
    "google",
    "look up",
    "lookup",
    "find online",
    "browse",
];

/// Short conversational openers that never need a lookup.
const CHATTER_PREFIXES: &[&str] = &[
    "hi",
    "hello",
    "hey",
    "yo",
    "thanks",
    "thank you",
    "thx",
    "ok",
    "okay",
    "cool",
    "nice",
    "great",
    "lol",
    "good morning",
    "good night",
    "bye",
];

/// Fast path only applies to chatter of at most this many words.
const CHATTER_MAX_WORDS: usize = 3;

/// Per-message cap on context handed to the classifier.
const CONTEXT_MESSAGE_CHARS: usize = 400;

/// Returns `Some` when the message can be routed without a model call.
#[must_use]
pub fn fast_path(message: &str) -> Option<Intent> {
    let trimmed = message.trim();
    let lower = trimmed.to_lowercase();

    for prefix in LOOKUP_PREFIXES {
        if let Some(rest) = strip_word_prefix(&lower, prefix) {
            // Slice the original text so the query keeps its casing, unless
            // lowercasing changed byte lengths.
            let original = if lower.len() == trimmed.len() {
                trimmed.get(trimmed.len() - rest.len()..).unwrap_or(rest)
            } else {
                rest
            };
            let query = original.trim_start_matches([':', ',', '-', ' ']).trim();
            if query.is_empty() {
                return None;
            }
            return Some(Intent::Search(query.to_string()));
        }
    }

    if lower.split_whitespace().count() <= CHATTER_MAX_WORDS
        && CHATTER_PREFIXES
            .iter()
            .any(|p| strip_word_prefix(&lower, p).is_some())
    {
        return Some(Intent::Direct);
    }
    None
}

/// `text` without `prefix` when `prefix` is followed by a non-alphanumeric
/// character or the end of the string.
fn strip_word_prefix<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = text.strip_prefix(prefix)?;
    match rest.chars().next() {
        None => Some(rest),
        Some(c) if !c.is_alphanumeric() => Some(rest),
        Some(_) => None,
    }
}

#[derive(Deserialize)]
struct JsonDecision {
    action: String,
    #[serde(default)]
    query: Option<String>,
}

/// Parse classifier output into an intent. Never fails; anything that is not
/// a clear search decision is `Direct`.
#[must_use]
pub fn parse_decision(raw: &str) -> Intent {
    let cleaned = strip_think_tags(raw);
    let body: String = cleaned
        .lines()
        .filter(|l| !l.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n");
    let body = body.trim();

    if body.starts_with('{') {
        return match serde_json::from_str::<JsonDecision>(body) {
            Ok(d) if d.action.eq_ignore_ascii_case("search") => d
                .query
                .map(|q| clean_query(&q))
                .filter(|q| !q.is_empty())
                .map_or(Intent::Direct, Intent::Search),
            _ => Intent::Direct,
        };
    }

    let Some(line) = body.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return Intent::Direct;
    };
    match line.get(..7) {
        Some(head) if head.eq_ignore_ascii_case("search:") => {
            let query = clean_query(&line[7..]);
            if query.is_empty() {
                Intent::Direct
            } else {
                Intent::Search(query)
            }
        }
        _ => Intent::Direct,
    }
}

fn clean_query(q: &str) -> String {
    q.trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`')
        .trim()
        .to_string()
}

fn instructions(today: NaiveDate) -> String {
    format!(
        "You route chat messages. Today is {weekday}, {iso}.\n\
         Decide whether answering the LAST user message needs a live web search \
         (news, weather, prices, scores, schedules, recent events, facts that change over time, \
         or anything after your training data).\n\
         Reply with exactly one line and nothing else:\n\
         SEARCH: <standalone search query>\n\
         or\n\
         DIRECT\n\
         Rules: resolve pronouns and follow-ups (\"why?\", \"is that true?\") using the conversation \
         so the query stands alone. Replace relative dates such as today, tomorrow or this week \
         with concrete dates based on {iso}. Greetings, opinions, writing, coding, math and \
         general knowledge are DIRECT.",
        weekday = today.format("%A"),
        iso = today.format("%Y-%m-%d"),
    )
}

fn render_context(recent: &[Message], message: &str) -> String {
    let mut out = String::new();
    if !recent.is_empty() {
        out.push_str("Conversation so far:\n");
        for m in recent {
            let speaker = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => continue,
            };
            let text: String = m.display_text().chars().take(CONTEXT_MESSAGE_CHARS).collect();
            out.push_str(&format!("{speaker}: {text}\n"));
        }
        out.push('\n');
    }
    out.push_str(&format!("LAST user message: {message}"));
    out
}

pub struct IntentRouter {
    dispatcher: Arc<ProviderDispatcher>,
    model: String,
    context_messages: usize,
}

impl IntentRouter {
    #[must_use]
    pub fn new(dispatcher: Arc<ProviderDispatcher>, model: &str, context_messages: usize) -> Self {
        Self {
            dispatcher,
            model: model.to_string(),
            context_messages,
        }
    }

    /// Route `message`, given the conversation so far and today's date.
    pub async fn classify(&self, history: &[Message], message: &str, today: NaiveDate) -> Intent {
        if let Some(intent) = fast_path(message) {
            debug!(?intent, "intent resolved by fast path");
            return intent;
        }

        let start = history.len().saturating_sub(self.context_messages);
        let prompt = vec![
            ChatMessage::new(Role::System, instructions(today)),
            ChatMessage::new(Role::User, render_context(&history[start..], message)),
        ];

        match self.dispatcher.dispatch(&prompt, &self.model).await.into_result() {
            Ok(raw) => {
                let intent = parse_decision(&raw);
                debug!(?intent, model = %self.model, "intent classified");
                intent
            }
            Err(e) => {
                warn!(error = %e, "intent classifier unavailable, answering directly");
                Intent::Direct
            }
        }
    }
}
