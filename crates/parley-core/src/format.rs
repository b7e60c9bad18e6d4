/*
 * Parley - Resilient chat relay
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Model markdown to Telegram HTML, and splitting replies into sendable
//! chunks.

use std::sync::LazyLock;

use regex::{Captures, Regex};

static HEADER: LazyLock<Regex> = LazyLock::new(|| re(r"^\s{0,3}#{1,6}\s+(.+?)\s*#*\s*$"));
static BULLET: LazyLock<Regex> = LazyLock::new(|| re(r"^(\s*)[-*+]\s+"));
static QUOTE: LazyLock<Regex> = LazyLock::new(|| re(r"^&gt;\s?(.*)$"));
static RULE: LazyLock<Regex> = LazyLock::new(|| re(r"^\s*([-*_])(\s*[-*_]){2,}\s*$"));
static LINK: LazyLock<Regex> =
    LazyLock::new(|| re(r#"\[([^\]\n]+)\]\((https?://[^\s)"]+)\)"#));
static BOLD: LazyLock<Regex> = LazyLock::new(|| re(r"\*\*([^*\n]+?)\*\*|__([^_\n]+?)__"));
static ITALIC: LazyLock<Regex> =
    LazyLock::new(|| re(r"\*([^*\s](?:[^*\n]*[^*\s])?)\*|\b_([^_\n]+?)_\b"));
static STRIKE: LazyLock<Regex> = LazyLock::new(|| re(r"~~([^~\n]+?)~~"));
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| re("\u{1}(\\d+)\u{1}"));
static TAG: LazyLock<Regex> = LazyLock::new(|| re(r"<[^<>]*>|<[^<>]*$"));

fn re(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(r) => r,
        // Patterns are literals; a failure here is a programming error caught
        // by the tests below.
        Err(e) => panic!("invalid formatter pattern {pattern:?}: {e}"),
    }
}

/// Escape the three characters Telegram's HTML parser requires escaped.
#[must_use]
pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Render model markdown as Telegram-flavoured HTML.
#[must_use]
pub fn format(raw: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut fence: Option<(String, Vec<&str>)> = None;

    for line in raw.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("```") {
            match fence.take() {
                Some((lang, body)) => out.push(code_block(&lang, &body)),
                None => fence = Some((rest.trim().to_string(), Vec::new())),
            }
            continue;
        }
        match fence.as_mut() {
            Some((_, body)) => body.push(line),
            None => out.push(format_line(line)),
        }
    }
    // Unterminated fence: the rest is still code.
    if let Some((lang, body)) = fence {
        out.push(code_block(&lang, &body));
    }
    out.join("\n").trim().to_string()
}

fn code_block(lang: &str, body: &[&str]) -> String {
    let code = escape_html(&body.join("\n"));
    let lang: String = lang
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '_' | '#'))
        .collect();
    if lang.is_empty() {
        format!("<pre><code>{code}</code></pre>")
    } else {
        format!("<pre><code class=\"language-{lang}\">{code}</code></pre>")
    }
}

fn format_line(line: &str) -> String {
    if RULE.is_match(line) {
        return "──────────".to_string();
    }
    if let Some(caps) = HEADER.captures(line) {
        return format!("<b>{}</b>", format_inline(&caps[1]));
    }
    let escaped = escape_html(line);
    if let Some(caps) = QUOTE.captures(&escaped) {
        return format!("<blockquote>{}</blockquote>", format_inline_escaped(&caps[1]));
    }
    if let Some(caps) = BULLET.captures(&escaped) {
        let indent = caps[1].len();
        let rest = &escaped[caps[0].len()..];
        return format!("{}• {}", " ".repeat(indent), format_inline_escaped(rest));
    }
    format_inline_escaped(&escaped)
}

fn format_inline(text: &str) -> String {
    format_inline_escaped(&escape_html(text))
}

/// Inline markup over already-escaped text. Code spans and links are lifted
/// out first so emphasis rules never touch their contents.
fn format_inline_escaped(text: &str) -> String {
    let mut protected: Vec<String> = Vec::new();
    let mut staged = String::with_capacity(text.len());

    for (i, segment) in text.split('`').enumerate() {
        if i % 2 == 1 {
            staged.push_str(&protect(&mut protected, format!("<code>{segment}</code>")));
        } else {
            staged.push_str(segment);
        }
    }
    // An odd number of backticks leaves the last span unclosed; render it
    // verbatim rather than as code.
    if text.matches('`').count() % 2 == 1 {
        staged = text.to_string();
        protected.clear();
    }

    let staged = LINK.replace_all(&staged, |c: &Captures| {
        protect(&mut protected, format!("<a href=\"{}\">{}</a>", &c[2], &c[1]))
    });
    let staged = BOLD.replace_all(&staged, |c: &Captures| {
        format!("<b>{}</b>", c.get(1).or_else(|| c.get(2)).map_or("", |m| m.as_str()))
    });
    let staged = ITALIC.replace_all(&staged, |c: &Captures| {
        format!("<i>{}</i>", c.get(1).or_else(|| c.get(2)).map_or("", |m| m.as_str()))
    });
    let staged = STRIKE.replace_all(&staged, "<s>$1</s>");

    PLACEHOLDER
        .replace_all(&staged, |c: &Captures| {
            c[1].parse::<usize>()
                .ok()
                .and_then(|i| protected.get(i).cloned())
                .unwrap_or_default()
        })
        .into_owned()
}

fn protect(protected: &mut Vec<String>, fragment: String) -> String {
    protected.push(fragment);
    format!("\u{1}{}\u{1}", protected.len() - 1)
}

/// Plain-text rendition of formatter output: tags dropped, entities restored.
#[must_use]
pub fn strip_markup(html: &str) -> String {
    TAG.replace_all(html, "")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

// ---------------------------------------------------------------------------
// Chunking
// ---------------------------------------------------------------------------

/// Lazily split `text` into pieces of at most `max` characters.
///
/// Splits on the last line break inside the window, otherwise hard-cuts at
/// `max`. Whitespace-only pieces are skipped. The iterator is `Clone`, so the
/// same split can be replayed.
#[must_use]
pub fn chunk(text: &str, max: usize) -> Chunks<'_> {
    Chunks {
        rest: text,
        max: max.max(1),
    }
}

#[derive(Clone, Debug)]
pub struct Chunks<'a> {
    rest: &'a str,
    max: usize,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        loop {
            if self.rest.is_empty() {
                return None;
            }
            let piece = match self.rest.char_indices().nth(self.max) {
                None => std::mem::take(&mut self.rest),
                Some((end, next)) => {
                    let window = &self.rest[..end];
                    // A break right after the window still counts as a line break.
                    let split = if next == '\n' { Some(end) } else { window.rfind('\n') };
                    match split {
                        Some(nl) => {
                            let piece = &self.rest[..nl];
                            self.rest = &self.rest[nl + 1..];
                            piece
                        }
                        None => {
                            self.rest = &self.rest[end..];
                            window
                        }
                    }
                }
            };
            if !piece.trim().is_empty() {
                return Some(piece);
            }
        }
    }
}
