/*
 * Parley - Resilient chat relay
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

//! Parley gateway: Telegram webhook in, resilient LLM replies out.
//!
//! Exposes:
//! - `POST /webhook/telegram`: receive Telegram bot updates
//! - `GET  /health`: health check

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, Request, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use parley_config::Config;
use parley_core::{
    CredentialPool, OpenAiCompatible, PipelineConfig, ProviderDispatcher, RequestPipeline,
    SearchAugmenter, TavilySearch, TelegramTransport, open_store, parse_update,
};
use parley_runtime::KeyedLocks;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

const SERVICE_NAME: &str = "parley-gateway";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
const SECRET_HEADER: &str = "X-Telegram-Bot-Api-Secret-Token";
/// How long shutdown waits for replies that are still being produced.
const DRAIN_GRACE: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct AppState {
    pipeline: RequestPipeline,
    locks: KeyedLocks,
    tasks: TaskTracker,
    secret_token: Option<String>,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    // Load .env in single-threaded context before spawning the tokio runtime
    parley_runtime::load_dotenv();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(async_main());
}

async fn async_main() {
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fatal: failed to load config: {e}");
            process::exit(1);
        }
    };

    let _telemetry_guard =
        parley_telemetry::init_telemetry(SERVICE_NAME, SERVICE_VERSION, &config.telemetry)
            .unwrap_or_else(|e| {
                eprintln!("fatal: telemetry init failed: {e}");
                process::exit(1);
            });

    info!(service = SERVICE_NAME, version = SERVICE_VERSION, env = %config.service.env, "starting");

    if config.telegram.bot_token.trim().is_empty() {
        error!("telegram.bot_token is not set");
        process::exit(1);
    }

    let state = match build_state(&config).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to initialise");
            process::exit(1);
        }
    };

    let app = router(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.service.port));

    match (&config.service.tls_cert_path, &config.service.tls_key_path) {
        (Some(cert_path), Some(key_path)) => {
            info!(addr = %addr, cert = %cert_path, "gateway listening with TLS");
            let tls_config =
                axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path)
                    .await
                    .unwrap_or_else(|e| {
                        error!(error = %e, "failed to load TLS certs");
                        process::exit(1);
                    });

            let handle = axum_server::Handle::new();
            let shutdown = handle.clone();
            tokio::spawn(async move {
                parley_runtime::shutdown_signal().await;
                shutdown.graceful_shutdown(Some(Duration::from_secs(30)));
            });

            if let Err(e) = axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await
            {
                error!(error = %e, "TLS server error");
            }
        }
        _ => {
            if config.service.env != "dev" && config.service.env != "local" {
                warn!("TLS is disabled in non-dev environment; expecting a terminating proxy");
            }
            info!(addr = %addr, "gateway listening (plaintext)");

            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, "failed to bind");
                    process::exit(1);
                }
            };

            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(parley_runtime::shutdown_signal())
                .await
            {
                error!(error = %e, "server error");
            }
        }
    }

    drain_updates(&state.tasks, DRAIN_GRACE).await;
    info!("shutdown complete");
}

async fn build_state(config: &Config) -> Result<AppState, Box<dyn std::error::Error>> {
    let store = open_store(&config.storage).await?;
    info!(backend = %config.storage.backend, "store ready");

    let provider = OpenAiCompatible::with_timeout(
        &config.provider.base_url,
        Duration::from_secs(config.provider.timeout_seconds),
    )?;
    let pool = CredentialPool::new(config.provider.api_keys.clone(), store.clone());
    if pool.static_count() == 0 {
        warn!("no provider.api_keys configured; add keys at runtime with /addkey");
    }
    let dispatcher = ProviderDispatcher::new(
        Arc::new(pool),
        Arc::new(provider),
        config.provider.soft_failure_max_chars,
    );

    let search = TavilySearch::with_timeout(
        &config.search.base_url,
        config.search.max_results,
        Duration::from_secs(config.search.timeout_seconds),
    )?;
    let augmenter = SearchAugmenter::new(
        Arc::new(search),
        config.search.api_keys.clone(),
        config.search.snippet_chars,
    );
    if !augmenter.is_enabled() {
        info!("no search.api_keys configured; web search disabled");
    }

    let transport = TelegramTransport::with_timeout(
        &config.telegram.api_base,
        &config.telegram.bot_token,
        Duration::from_secs(config.telegram.timeout_seconds),
    )?;

    let pipeline = RequestPipeline::new(
        PipelineConfig::from_config(config),
        Arc::new(dispatcher),
        augmenter,
        store,
        Arc::new(transport),
    );

    Ok(AppState {
        pipeline,
        locks: KeyedLocks::new(),
        tasks: TaskTracker::new(),
        secret_token: config
            .telegram
            .secret_token
            .clone()
            .filter(|s| !s.is_empty()),
    })
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook/telegram", post(webhook_telegram_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(1_048_576)) // 1 MiB
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Security headers middleware
// ---------------------------------------------------------------------------

async fn security_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert(
        "X-Content-Type-Options",
        header::HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        "Cache-Control",
        header::HeaderValue::from_static("no-store, no-cache, must-revalidate"),
    );
    headers.insert(
        "Strict-Transport-Security",
        header::HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    resp
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

// ---------------------------------------------------------------------------
// POST /webhook/telegram
// ---------------------------------------------------------------------------

async fn webhook_telegram_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Some(ref secret) = state.secret_token {
        let provided = headers
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !constant_time_eq(secret.as_bytes(), provided.as_bytes()) {
            warn!("Telegram webhook secret token verification failed");
            return (StatusCode::UNAUTHORIZED, "invalid secret token").into_response();
        }
    }

    let payload: serde_json::Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid json: {e}")).into_response();
        }
    };

    let Some(inbound) = parse_update(&payload) else {
        debug!("ignoring update without a message");
        return (StatusCode::OK, "").into_response();
    };

    // Telegram retries slow webhooks, so answer now and reply out of band.
    // Updates for one chat are still handled one at a time.
    let request_id = Uuid::new_v4().to_string();
    let span = info_span!(
        "telegram_update",
        request_id = %request_id,
        conversation_id = %inbound.conversation_id
    );
    let tasks = state.tasks.clone();
    tasks.spawn(
        async move {
            let _turn = state.locks.lock(&inbound.conversation_id).await;
            state.pipeline.handle(&inbound).await;
        }
        .instrument(span),
    );

    (StatusCode::OK, "").into_response()
}

/// Stop accepting update tasks and wait up to `grace` for the running ones.
/// Returns `false` when some were still running at the deadline.
async fn drain_updates(tasks: &TaskTracker, grace: Duration) -> bool {
    tasks.close();
    if tasks.is_empty() {
        return true;
    }
    info!(pending = tasks.len(), "waiting for in-flight updates");
    if tokio::time::timeout(grace, tasks.wait()).await.is_ok() {
        return true;
    }
    warn!(pending = tasks.len(), "shutdown grace expired, dropping in-flight updates");
    false
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let dispatcher = state.pipeline.dispatcher();
    let (status, credentials) = match dispatcher.pool().all().await {
        Ok(all) => ("ok", all.len()),
        Err(e) => {
            warn!(error = %e, "health: credential store unavailable");
            ("degraded", 0)
        }
    };

    axum::Json(serde_json::json!({
        "status": status,
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
        "credentials": credentials,
        "static_credentials": dispatcher.pool().static_count(),
        "search_keys": state.pipeline.search().key_count(),
        "in_flight": state.locks.in_flight(),
        "pending_updates": state.tasks.len(),
    }))
}
