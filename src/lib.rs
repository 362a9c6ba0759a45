//! The Small POS - dashboard access gate and realtime order bridge.
//!
//! Two services share one process: the HTTP gate that decides, before any
//! protected page renders, whether a request may proceed, and the realtime
//! hub that keeps every terminal of a branch in sync on new orders and
//! status changes.

use anyhow::Context;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::rolling::{Builder as RollingBuilder, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod access;
pub mod api;
pub mod config;
pub mod error;
pub mod http;
pub mod orders;
pub mod realtime;

use access::{AccessGate, GateState, RoutePermissionTable};
use api::DashboardApi;
use config::DashboardConfig;
use realtime::RealtimeServer;

const LOG_FILE_PREFIX: &str = "dashboard";
const LOG_FILES_KEPT: usize = 14;

pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

/// Like [`value_str`], but numeric identifiers are accepted too.
pub(crate) fn value_id(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match v.get(*key) {
            Some(serde_json::Value::Number(n)) => return Some(n.to_string()),
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => {
                return Some(s.trim().to_string())
            }
            _ => {}
        }
    }
    None
}

// ============================================================================
// Logging
// ============================================================================

/// Console plus daily rolling file output. The file writer's guard is leaked
/// so buffered lines flush for the whole process lifetime.
fn init_logging(log_dir: &Path, json_console: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,the_small_pos_dashboard_lib=debug"));

    std::fs::create_dir_all(log_dir).ok();
    let file_layer = match RollingBuilder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(LOG_FILES_KEPT)
        .build(log_dir)
    {
        Ok(appender) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            std::mem::forget(guard);
            Some(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(true),
            )
        }
        Err(e) => {
            eprintln!("file logging disabled ({}): {e}", log_dir.display());
            None
        }
    };

    let (json_layer, text_layer) = if json_console {
        (Some(fmt::layer().json().with_target(true)), None)
    } else {
        (None, Some(fmt::layer().with_target(true)))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .init();
}

// ============================================================================
// Entry point
// ============================================================================

pub async fn run() -> anyhow::Result<()> {
    let config = DashboardConfig::from_env_or_file()?;
    init_logging(&config.log_dir, config.json_logs);
    info!(
        "Starting The Small POS dashboard v{} ({})",
        env!("CARGO_PKG_VERSION"),
        option_env!("BUILD_GIT_SHA").unwrap_or("unknown")
    );

    let decoder = config.token_decoder();
    let gate = AccessGate::new(decoder.clone(), RoutePermissionTable::default());
    let state = GateState::new(gate, &config.token_cookie);

    if let Some(url) = config.api_url.as_deref() {
        let backend = DashboardApi::new(url, "").context("admin dashboard client")?;
        tokio::spawn(async move {
            let result = backend.test_connectivity().await;
            if result.success {
                info!(url = backend.base_url(), latency_ms = ?result.latency_ms, "admin dashboard reachable");
            } else {
                warn!(
                    url = backend.base_url(),
                    error = result.error.as_deref().unwrap_or(""),
                    "admin dashboard unreachable"
                );
            }
        });
    }

    let shutdown = CancellationToken::new();

    let realtime =
        RealtimeServer::bind(config.realtime_bind, decoder, config.realtime_server_config())
            .await
            .with_context(|| format!("bind realtime hub on {}", config.realtime_bind))?;
    let realtime_task = tokio::spawn(realtime.serve(shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(config.http_bind)
        .await
        .with_context(|| format!("bind http on {}", config.http_bind))?;
    info!(addr = %config.http_bind, cookie = %config.token_cookie, "access gate listening");
    let http_shutdown = shutdown.clone();
    let http_task = tokio::spawn(async move {
        axum::serve(listener, http::router(state))
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for shutdown signal");
    }
    info!("shutting down");
    shutdown.cancel();

    http_task.await.context("http task")??;
    realtime_task.await.context("realtime task")??;
    Ok(())
}
