/*
 * Parley - Resilient chat relay
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 *
 * This program is free software: you can redistribute it
 * and/or modify it under the terms of the GNU Affero
 * General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * This program is distributed in the hope that it will be
 * useful, but WITHOUT ANY WARRANTY; without even the
 * implied warranty of MERCHANTABILITY or FITNESS FOR A
 * PARTICULAR PURPOSE. See the GNU Affero General Public
 * License for more details.
 *
 * You should have received a copy of the GNU Affero General
 * Public License along with this program. If not, see
 * <https://www.gnu.org/licenses/>.
 */

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use serde::Deserialize;

#[derive(Deserialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServiceConfig {
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub tls_cert_path: Option<String>,
    #[serde(default)]
    pub tls_key_path: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            env: default_env(),
            port: default_port(),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

fn default_env() -> String {
    "dev".to_string()
}

fn default_port() -> u16 {
    3320
}

#[derive(Deserialize, Clone, Debug)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Expected `X-Telegram-Bot-Api-Secret-Token` header; unset disables the check.
    #[serde(default)]
    pub secret_token: Option<String>,
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    #[serde(default = "default_telegram_timeout")]
    pub timeout_seconds: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            secret_token: None,
            api_base: default_telegram_api_base(),
            max_message_chars: default_max_message_chars(),
            timeout_seconds: default_telegram_timeout(),
        }
    }
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

// Telegram caps messages at 4096; leave headroom for entity expansion.
fn default_max_message_chars() -> usize {
    4000
}

fn default_telegram_timeout() -> u64 {
    15
}

#[derive(Deserialize, Clone, Debug)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,
    /// Static credentials. Dynamic ones are registered at runtime and persisted.
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_chat_model")]
    pub default_model: String,
    #[serde(default = "default_router_model")]
    pub router_model: String,
    #[serde(default = "default_provider_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_soft_failure_max_chars")]
    pub soft_failure_max_chars: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_base_url(),
            api_keys: Vec::new(),
            default_model: default_chat_model(),
            router_model: default_router_model(),
            timeout_seconds: default_provider_timeout(),
            soft_failure_max_chars: default_soft_failure_max_chars(),
        }
    }
}

fn default_provider_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_chat_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

fn default_router_model() -> String {
    "google/gemini-2.0-flash-lite-001".to_string()
}

fn default_provider_timeout() -> u64 {
    60
}

fn default_soft_failure_max_chars() -> usize {
    150
}

#[derive(Deserialize, Clone, Debug)]
pub struct SearchConfig {
    #[serde(default = "default_search_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_search_max_results")]
    pub max_results: u32,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
    #[serde(default = "default_search_timeout")]
    pub timeout_seconds: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: default_search_base_url(),
            api_keys: Vec::new(),
            max_results: default_search_max_results(),
            snippet_chars: default_snippet_chars(),
            timeout_seconds: default_search_timeout(),
        }
    }
}

fn default_search_base_url() -> String {
    "https://api.tavily.com".to_string()
}

fn default_search_max_results() -> u32 {
    5
}

fn default_snippet_chars() -> usize {
    300
}

fn default_search_timeout() -> u64 {
    15
}

#[derive(Deserialize, Clone, Debug)]
pub struct ChatConfig {
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Messages of recent context handed to the intent classifier.
    #[serde(default = "default_router_context")]
    pub router_context_messages: usize,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// User ids allowed to run key-management commands. Empty allows everyone.
    #[serde(default)]
    pub admin_ids: Vec<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            router_context_messages: default_router_context(),
            system_prompt: default_system_prompt(),
            admin_ids: Vec::new(),
        }
    }
}

fn default_history_limit() -> usize {
    20
}

fn default_router_context() -> usize {
    6
}

fn default_system_prompt() -> String {
    "You are a helpful, concise assistant chatting over Telegram. \
     Answer in the language the user writes in. Use short paragraphs and simple markdown."
        .to_string()
}

#[derive(Deserialize, Clone, Debug)]
pub struct StorageConfig {
    /// `memory` or `postgres`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default = "default_pg_max")]
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            postgres_url: None,
            max_connections: default_pg_max(),
        }
    }
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

fn default_pg_max() -> u32 {
    5
}

#[derive(Deserialize, Clone, Debug)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: default_otlp_endpoint(),
            sample_rate: default_sample_rate(),
        }
    }
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_sample_rate() -> f64 {
    1.0
}

impl Config {
    /// Load configuration from the file named by `PARLEY_CONFIG`, with
    /// `PARLEY_`-prefixed environment variable overrides.
    ///
    /// The file is only required when `PARLEY_CONFIG` is set explicitly;
    /// otherwise `config.toml` is read if present.
    ///
    /// # Errors
    ///
    /// Returns `config::ConfigError` if the config file is missing (when
    /// required), malformed, or a value has the wrong type.
    pub fn load() -> Result<Self, config::ConfigError> {
        let explicit = std::env::var("PARLEY_CONFIG").ok();
        match explicit {
            Some(path) => Self::load_from(&path, true),
            None => Self::load_from("config.toml", false),
        }
    }

    /// Load configuration from `path`, with environment overrides.
    ///
    /// Environment keys use `__` between section and field, e.g.
    /// `PARLEY_PROVIDER__API_KEYS=sk-a,sk-b`.
    ///
    /// # Errors
    ///
    /// Returns `config::ConfigError` if `required` and the file is missing,
    /// or if the merged settings fail to deserialize.
    pub fn load_from(path: &str, required: bool) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(required))
            .add_source(
                config::Environment::with_prefix("PARLEY")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("provider.api_keys")
                    .with_list_parse_key("search.api_keys")
                    .with_list_parse_key("chat.admin_ids")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }
}
