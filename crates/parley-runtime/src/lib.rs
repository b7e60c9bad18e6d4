/*
 * Parley - Resilient chat relay
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Shared runtime utilities for Parley services.
//!
//! - [`KeyedLocks`]: per-key async mutual exclusion (one conversation at a time)
//! - [`shutdown_signal`]: graceful SIGINT/SIGTERM handler
//! - [`load_dotenv`]: `.env` loading before the async runtime starts

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info};

// ---------------------------------------------------------------------------
// Keyed locks
// ---------------------------------------------------------------------------

/// Hands out one async mutex per key so that work for the same key runs
/// strictly one at a time while different keys proceed in parallel.
///
/// Entries are dropped once no guard or waiter holds them, so the map only
/// grows with the number of keys in flight.
#[derive(Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Guard for one key. Releases the key and prunes the slot on drop.
pub struct KeyedGuard<'a> {
    owner: &'a KeyedLocks,
    key: String,
    slot: Arc<tokio::sync::Mutex<()>>,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `key` is free and take it.
    pub async fn lock(&self, key: &str) -> KeyedGuard<'_> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(key.to_string()).or_default())
        };
        let guard = Arc::clone(&slot).lock_owned().await;
        KeyedGuard {
            owner: self,
            key: key.to_string(),
            slot,
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or awaited.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut slots = self
            .owner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Two strong refs left (map + this guard) means nobody else is waiting.
        if Arc::strong_count(&self.slot) <= 2 {
            slots.remove(&self.key);
        }
    }
}

// ---------------------------------------------------------------------------
// Shutdown signal
// ---------------------------------------------------------------------------

/// Wait for SIGINT (ctrl-c) or SIGTERM, then return.
///
/// Use with `tokio::select!` or `axum::serve(...).with_graceful_shutdown(...)`.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .unwrap_or_else(|e| error!(error = %e, "ctrl-c handler failed"));
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "SIGTERM handler unavailable, relying on ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// .env loading
// ---------------------------------------------------------------------------

/// Parse `KEY=VALUE` lines, skipping blanks and `#` comments. Surrounding
/// quotes on the value are removed.
#[must_use]
pub fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, val)| {
            let val = val.trim();
            let val = val
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(val);
            (key.trim().to_string(), val.to_string())
        })
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// Load `.env` from the working directory into the process environment.
///
/// Must be called from `main()` before the tokio runtime is built.
pub fn load_dotenv() {
    match std::fs::read_to_string(".env") {
        Ok(contents) => {
            for (key, val) in parse_dotenv(&contents) {
                // SAFETY: called before the tokio runtime exists, so no other
                // threads can be reading the environment concurrently.
                unsafe {
                    std::env::set_var(&key, val);
                }
                eprintln!(".env: loaded {key}");
            }
        }
        Err(e) => {
            eprintln!(".env: not loaded ({e})");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
