/*
 * Parley - Resilient chat relay
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Request handling for the Parley chat relay: credential rotation over a
//! completion provider, search-intent routing, web augmentation, bounded
//! history and Telegram-safe reply formatting.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod commands;
pub mod credentials;
pub mod dispatch;
pub mod format;
pub mod history;
pub mod kv;
pub mod message;
pub mod payload;
pub mod pipeline;
pub mod provider;
pub mod router;
pub mod search;
pub mod telegram;
pub mod transport;

pub use credentials::{Credential, CredentialPool, CredentialSource, mask};
pub use dispatch::{DispatchError, DispatchOutcome, ProviderDispatcher};
pub use history::{ConversationStore, PreferenceStore, Preferences};
pub use kv::{KeyValueStore, MemoryStore, PgStore, StoreError, open_store};
pub use message::{ChatMessage, Intent, Message, Role};
pub use pipeline::{PipelineConfig, PipelineError, RequestPipeline};
pub use provider::{CompletionProvider, OpenAiCompatible, ProviderError};
pub use router::IntentRouter;
pub use search::{SearchAugmenter, SearchProvider, TavilySearch};
pub use telegram::{TelegramTransport, parse_update};
pub use transport::{Inbound, Markup, Transport, TransportError};
