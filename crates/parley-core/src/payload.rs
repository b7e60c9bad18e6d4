/*
 * Parley - Resilient chat relay
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Normalization of raw completion payloads.
//!
//! Providers disagree on the response shape: a bare string, an OpenAI-style
//! `{message: {content}}` choice, an Anthropic-style list of typed content
//! blocks, or an error object delivered with HTTP 200. [`Payload::classify`]
//! maps a raw JSON value onto that closed set once, and everything downstream
//! matches on the variant.

use serde_json::Value;

/// Content block types whose `text` is user-visible output.
const TEXT_BLOCK_TYPES: &[&str] = &["text", "output_text"];

/// Phrases providers use when they answer HTTP 200 with a quota or rate-limit
/// message instead of a completion. Matched case-insensitively.
const SOFT_FAILURE_PHRASES: &[&str] = &[
    "usage limit",
    "rate limit exceeded",
    "rate limit reached",
    "rate limited",
    "rate-limited",
    "ratelimited",
    "quota exceeded",
    "exceeded your quota",
    "exceeded your current quota",
    "quota has been exceeded",
    "insufficient quota",
    "too many requests",
    "insufficient credits",
    "insufficient balance",
    "out of credits",
    "reached your limit",
    "reached your rate limit",
    "reached your daily limit",
    "daily limit exceeded",
    "requires more credits",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// `null` or no body.
    Empty,
    /// A structured error object. Holds the best available message.
    Error(String),
    /// A bare string.
    Text(String),
    /// `{message: {content: "..."}}`.
    Message(String),
    /// Typed content blocks; only textual ones are kept.
    Blocks(Vec<String>),
    Unknown,
}

impl Payload {
    #[must_use]
    pub fn classify(raw: Option<&Value>) -> Self {
        let Some(raw) = raw else {
            return Payload::Empty;
        };
        match raw {
            Value::Null => Payload::Empty,
            Value::String(s) => Payload::Text(s.clone()),
            Value::Array(items) => Payload::Blocks(text_blocks(items)),
            Value::Object(obj) => {
                if let Some(err) = obj.get("error").filter(|e| !e.is_null()) {
                    return Payload::Error(error_message(err));
                }
                let content = obj
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .or_else(|| obj.get("content"));
                match content {
                    Some(Value::String(s)) => Payload::Message(s.clone()),
                    Some(Value::Array(items)) => Payload::Blocks(text_blocks(items)),
                    _ => Payload::Unknown,
                }
            }
            Value::Bool(_) | Value::Number(_) => Payload::Unknown,
        }
    }

    /// Plain text carried by the payload, if it carries any.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        match self {
            Payload::Text(s) | Payload::Message(s) => Some(s.clone()),
            Payload::Blocks(blocks) => Some(blocks.concat()),
            Payload::Empty | Payload::Error(_) | Payload::Unknown => None,
        }
    }
}

fn text_blocks(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.clone()),
            Value::Object(obj) => {
                let kind = obj.get("type").and_then(Value::as_str).unwrap_or("text");
                if TEXT_BLOCK_TYPES.contains(&kind) {
                    obj.get("text").and_then(Value::as_str).map(str::to_string)
                } else {
                    None
                }
            }
            _ => None,
        })
        .collect()
}

fn error_message(err: &Value) -> String {
    match err {
        Value::String(s) => s.clone(),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| err.to_string(), str::to_string),
        other => other.to_string(),
    }
}

/// True for short replies that are really quota or rate-limit notices.
#[must_use]
pub fn is_soft_failure(text: &str, max_chars: usize) -> bool {
    if text.chars().count() >= max_chars {
        return false;
    }
    let lower = text.to_lowercase();
    SOFT_FAILURE_PHRASES.iter().any(|p| lower.contains(p))
}

/// Remove `<think>…</think>` reasoning spans that some models emit inline.
#[must_use]
pub fn strip_think_tags(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    // Orphaned </think> with no opener: everything before it is reasoning.
    if let Some(end) = rest.find("</think>") {
        if !rest[..end].contains("<think>") {
            rest = &rest[end + "</think>".len()..];
        }
    }

    while let Some(start) = rest.find("<think>") {
        result.push_str(&rest[..start]);
        if let Some(end) = rest[start..].find("</think>") {
            rest = &rest[start + end + "</think>".len()..];
        } else {
            // Unclosed <think>: drop the tail.
            return result.trim().to_string();
        }
    }
    result.push_str(rest);
    result.trim().to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_variants() {
        assert_eq!(Payload::classify(None), Payload::Empty);
        assert_eq!(Payload::classify(Some(&Value::Null)), Payload::Empty);
        assert_eq!(
            Payload::classify(Some(&json!("hello"))),
            Payload::Text("hello".into())
        );
        assert_eq!(
            Payload::classify(Some(&json!({"message": {"content": "hi"}}))),
            Payload::Message("hi".into())
        );
        assert_eq!(
            Payload::classify(Some(&json!({"error": {"message": "invalid key", "code": 401}}))),
            Payload::Error("invalid key".into())
        );
        assert_eq!(Payload::classify(Some(&json!(42))), Payload::Unknown);
        assert_eq!(
            Payload::classify(Some(&json!({"choices": []}))),
            Payload::Unknown
        );
    }

    #[test]
    fn test_null_error_field_is_not_an_error() {
        let p = Payload::classify(Some(&json!({"error": null, "message": {"content": "ok"}})));
        assert_eq!(p, Payload::Message("ok".into()));
    }

    #[test]
    fn test_blocks_keep_only_text() {
        let raw = json!([
            {"type": "thinking", "thinking": "hmm"},
            {"type": "text", "text": "Hello, "},
            {"type": "tool_use", "name": "x"},
            {"type": "text", "text": "world"}
        ]);
        let p = Payload::classify(Some(&raw));
        assert_eq!(p.text().unwrap(), "Hello, world");
    }

    #[test]
    fn test_message_content_blocks() {
        let raw = json!({"message": {"content": [{"type": "output_text", "text": "a"}, {"type": "text", "text": "b"}]}});
        assert_eq!(Payload::classify(Some(&raw)).text().unwrap(), "ab");
    }

    #[test]
    fn test_soft_failure_detection() {
        assert!(is_soft_failure("You have reached your usage limit", 150));
        assert!(is_soft_failure("RATE LIMIT exceeded, try again", 150));
        assert!(!is_soft_failure("Manila is sunny today.", 150));
        // Long answers that merely mention quotas are real answers.
        let long = format!("{} quota {}", "x".repeat(100), "y".repeat(100));
        assert!(!is_soft_failure(&long, 150));
    }

    #[test]
    fn test_short_answers_mentioning_quotas_are_not_failures() {
        for answer in [
            "A quota is a fixed share of something, like an import quota.",
            "Billing happens on the first of each month.",
            "The office is closed now, try again later this afternoon.",
            "Yes, you have reached your destination: Manila.",
            "A rate limit caps how many requests a client may send.",
        ] {
            assert!(!is_soft_failure(answer, 150), "{answer}");
        }
        assert!(is_soft_failure("You exceeded your current quota, please check your plan.", 150));
        assert!(is_soft_failure("Insufficient credits. Add more at openrouter.ai/credits", 150));
    }

    #[test]
    fn test_strip_think_tags() {
        assert_eq!(strip_think_tags("<think>plan</think>Answer"), "Answer");
        assert_eq!(strip_think_tags("reasoning</think> Answer"), "Answer");
        assert_eq!(strip_think_tags("A <think>x</think>B"), "A B");
        assert_eq!(strip_think_tags("Answer <think>never closed"), "Answer");
        assert_eq!(strip_think_tags("plain"), "plain");
    }
}
