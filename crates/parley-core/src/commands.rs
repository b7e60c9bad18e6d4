/*
 * Parley - Resilient chat relay
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Slash commands.

use std::fmt::Write as _;

use tracing::{info, warn};

use crate::credentials::{CredentialError, mask};
use crate::history::Preferences;
use crate::pipeline::RequestPipeline;
use crate::provider::ProviderError;
use crate::transport::Inbound;

/// Cap on model ids listed by `/models`.
const MODELS_SHOWN: usize = 40;

const HELP: &str = "\
I answer questions and look things up on the web when needed.

/clear - forget this conversation
/model [id|reset] - show or change the model
/models [filter] - list available models
/system [text|reset] - show or change the system prompt
/search <query> - answer using a web search
/keys, /addkey <key>, /delkey <n>, /prunekeys, /balance - manage API keys";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Clear,
    Model(Option<String>),
    Models(Option<String>),
    System(Option<String>),
    Search(String),
    Keys,
    AddKey(String),
    DelKey(String),
    PruneKeys,
    Balance,
    Unknown(String),
}

impl Command {
    fn is_admin_only(&self) -> bool {
        matches!(
            self,
            Command::Keys
                | Command::AddKey(_)
                | Command::DelKey(_)
                | Command::PruneKeys
                | Command::Balance
        )
    }
}

/// What the pipeline does after a command ran.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandReply {
    /// Send this text and stop.
    Text(String),
    /// Answer `query` through the normal flow with search forced on.
    Search(String),
}

/// Parse `/name[@bot] args...`. `None` if `text` is not a command.
#[must_use]
pub fn parse_command(text: &str) -> Option<Command> {
    let text = text.trim();
    let body = text.strip_prefix('/')?;
    let (head, rest) = match body.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (body, ""),
    };
    let name = head.split('@').next().unwrap_or(head).to_lowercase();
    if name.is_empty() {
        return None;
    }
    let arg = (!rest.is_empty()).then(|| rest.to_string());

    Some(match name.as_str() {
        "start" => Command::Start,
        "help" => Command::Help,
        "clear" | "reset" => Command::Clear,
        "model" => Command::Model(arg),
        "models" => Command::Models(arg),
        "system" => Command::System(arg),
        "search" => Command::Search(rest.to_string()),
        "keys" => Command::Keys,
        "addkey" => Command::AddKey(rest.to_string()),
        "delkey" => Command::DelKey(rest.to_string()),
        "prunekeys" => Command::PruneKeys,
        "balance" => Command::Balance,
        _ => Command::Unknown(name),
    })
}

fn is_reset(arg: &str) -> bool {
    matches!(arg.to_lowercase().as_str(), "reset" | "default")
}

impl RequestPipeline {
    fn is_admin(&self, inbound: &Inbound) -> bool {
        let admins = &self.config.admin_ids;
        admins.is_empty()
            || inbound
                .user_id
                .as_ref()
                .is_some_and(|u| admins.iter().any(|a| a == u))
    }

    pub(crate) async fn run_command(&self, inbound: &Inbound, command: Command) -> CommandReply {
        let id = inbound.conversation_id.as_str();
        if command.is_admin_only() && !self.is_admin(inbound) {
            warn!(conversation_id = id, user_id = ?inbound.user_id, "admin command refused");
            return CommandReply::Text("That command is restricted to administrators.".to_string());
        }

        let reply = match command {
            Command::Start | Command::Help => HELP.to_string(),
            Command::Clear => match self.history.clear(id).await {
                Ok(()) => "Conversation cleared.".to_string(),
                Err(e) => format!("Could not clear the conversation: {e}"),
            },
            Command::Model(arg) => self.model_command(id, arg).await,
            Command::Models(filter) => self.models_command(filter.as_deref()).await,
            Command::System(arg) => self.system_command(id, arg).await,
            Command::Search(query) if query.is_empty() => "Usage: /search <query>".to_string(),
            Command::Search(query) => return CommandReply::Search(query),
            Command::Keys => self.keys_command().await,
            Command::AddKey(key) => self.add_key_command(&key).await,
            Command::DelKey(arg) => self.del_key_command(&arg).await,
            Command::PruneKeys => self.prune_command().await,
            Command::Balance => self.balance_command().await,
            Command::Unknown(name) => format!("Unknown command /{name}. Try /help."),
        };
        CommandReply::Text(reply)
    }

    async fn update_prefs(
        &self,
        id: &str,
        change: impl FnOnce(&mut Preferences),
    ) -> Result<(), crate::kv::StoreError> {
        let mut prefs = self.prefs.load(id).await?;
        change(&mut prefs);
        self.prefs.save(id, &prefs).await
    }

    async fn model_command(&self, id: &str, arg: Option<String>) -> String {
        let Some(arg) = arg else {
            return match self.prefs.load(id).await {
                Ok(p) => match p.model {
                    Some(m) => format!("Model: {m} (default: {})", self.config.default_model),
                    None => format!("Model: {} (default)", self.config.default_model),
                },
                Err(e) => format!("Could not read preferences: {e}"),
            };
        };
        let model = (!is_reset(&arg)).then_some(arg);
        let reply = match &model {
            Some(m) => format!("Model set to {m}."),
            None => format!("Model reset to {}.", self.config.default_model),
        };
        match self.update_prefs(id, |p| p.model = model).await {
            Ok(()) => reply,
            Err(e) => format!("Could not save preferences: {e}"),
        }
    }

    async fn system_command(&self, id: &str, arg: Option<String>) -> String {
        let Some(arg) = arg else {
            return match self.prefs.load(id).await {
                Ok(p) => match p.system_prompt {
                    Some(s) => format!("System prompt (custom):\n{s}"),
                    None => format!("System prompt (default):\n{}", self.config.system_prompt),
                },
                Err(e) => format!("Could not read preferences: {e}"),
            };
        };
        let prompt = (!is_reset(&arg)).then_some(arg);
        let reply = if prompt.is_some() {
            "System prompt updated."
        } else {
            "System prompt reset to default."
        };
        match self.update_prefs(id, |p| p.system_prompt = prompt).await {
            Ok(()) => reply.to_string(),
            Err(e) => format!("Could not save preferences: {e}"),
        }
    }

    async fn models_command(&self, filter: Option<&str>) -> String {
        let credentials = match self.dispatcher.pool().all().await {
            Ok(c) => c,
            Err(e) => return format!("Could not read credentials: {e}"),
        };
        let mut last: Option<ProviderError> = None;
        for credential in &credentials {
            match self.dispatcher.provider().list_models(credential).await {
                Ok(models) => {
                    let needle = filter.map(str::to_lowercase);
                    let matching: Vec<&String> = models
                        .iter()
                        .filter(|m| needle.as_ref().is_none_or(|n| m.to_lowercase().contains(n)))
                        .collect();
                    if matching.is_empty() {
                        return "No matching models.".to_string();
                    }
                    let mut out = format!("Models ({}):\n", matching.len());
                    for m in matching.iter().take(MODELS_SHOWN) {
                        let _ = writeln!(out, "{m}");
                    }
                    if matching.len() > MODELS_SHOWN {
                        let _ = writeln!(out, "... and {} more. Narrow with /models <filter>.", matching.len() - MODELS_SHOWN);
                    }
                    return out.trim_end().to_string();
                }
                Err(e) => {
                    warn!(credential = %credential.masked(), error = %e, "model listing failed");
                    last = Some(e);
                }
            }
        }
        match last {
            Some(e) => format!("Could not list models: {e}"),
            None => "No API keys configured.".to_string(),
        }
    }

    async fn keys_command(&self) -> String {
        let pool = self.dispatcher.pool();
        let credentials = match pool.all().await {
            Ok(c) => c,
            Err(e) => return format!("Could not read credentials: {e}"),
        };
        if credentials.is_empty() {
            return "No API keys configured. Add one with /addkey <key>.".to_string();
        }
        let mut out = format!("API keys ({}):\n", credentials.len());
        for (i, c) in credentials.iter().enumerate() {
            let _ = writeln!(out, "{}. {} ({})", i + 1, c.masked(), c.source.as_str());
        }
        let _ = write!(
            out,
            "Search keys: {}",
            self.search.key_count()
        );
        out
    }

    async fn add_key_command(&self, key: &str) -> String {
        let key = key.trim();
        match self.dispatcher.pool().add(key).await {
            Ok(true) => {
                info!(credential = %mask(key), "key added via command");
                format!("Added key {}. Consider deleting your message.", mask(key))
            }
            Ok(false) => format!("Key {} is already in the pool.", mask(key)),
            Err(CredentialError::Empty) => "Usage: /addkey <key>".to_string(),
            Err(e) => format!("Could not add key: {e}"),
        }
    }

    async fn del_key_command(&self, arg: &str) -> String {
        let Some(index) = arg.trim().parse::<usize>().ok().filter(|n| *n > 0) else {
            return "Usage: /delkey <n> (see /keys for numbers)".to_string();
        };
        match self.dispatcher.pool().remove_at(index - 1).await {
            Ok(removed) => format!("Removed key {}.", removed.masked()),
            Err(CredentialError::IndexOutOfRange(_)) => format!("There is no key #{index}."),
            Err(CredentialError::StaticCredential(m)) => {
                format!("Key {m} comes from configuration and cannot be removed here.")
            }
            Err(e) => format!("Could not remove key: {e}"),
        }
    }

    async fn prune_command(&self) -> String {
        let provider = self.dispatcher.provider().clone();
        let result = self
            .dispatcher
            .pool()
            .prune(|credential| {
                let provider = provider.clone();
                async move {
                    let remaining = provider.remaining_quota(&credential).await?;
                    Ok::<bool, ProviderError>(remaining.is_some_and(|r| r <= 0.0))
                }
            })
            .await;
        match result {
            Ok(0) => "No exhausted keys found.".to_string(),
            Ok(n) => format!("Pruned {n} exhausted key(s)."),
            Err(e) => format!("Could not prune keys: {e}"),
        }
    }

    async fn balance_command(&self) -> String {
        let credentials = match self.dispatcher.pool().all().await {
            Ok(c) => c,
            Err(e) => return format!("Could not read credentials: {e}"),
        };
        if credentials.is_empty() {
            return "No API keys configured.".to_string();
        }
        let mut out = String::from("Remaining credit:\n");
        for (i, c) in credentials.iter().enumerate() {
            let balance = match self.dispatcher.provider().remaining_quota(c).await {
                Ok(Some(r)) => format!("{r:.2}"),
                Ok(None) => "unlimited".to_string(),
                Err(e) => format!("unavailable ({e})"),
            };
            let _ = writeln!(out, "{}. {}: {balance}", i + 1, c.masked());
        }
        out.trim_end().to_string()
    }
}
