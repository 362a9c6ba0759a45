//! Process configuration sourced from `SMALL_POS_*` environment variables,
//! with an optional JSON override file named by `SMALL_POS_CONFIG`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::access::{TokenDecoder, DEFAULT_TOKEN_COOKIE};
use crate::realtime::{FanoutPolicy, RealtimeServerConfig};

const DEFAULT_HTTP_BIND: &str = "0.0.0.0:3001";
const DEFAULT_REALTIME_BIND: &str = "0.0.0.0:3002";
const DEFAULT_TOKEN_LEEWAY_SECS: u64 = 30;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;
const DEFAULT_OUTBOUND_QUEUE: usize = 256;
const DEFAULT_LOG_DIR: &str = "logs";

#[derive(Debug, Clone)]
pub struct DashboardConfig {
    // Gate and decision API listener.
    pub http_bind: SocketAddr,
    // Realtime hub listener.
    pub realtime_bind: SocketAddr,
    // HS256 secret; unset means claims are read without signature checks.
    pub jwt_secret: Option<String>,
    pub token_cookie: String,
    pub token_leeway_secs: u64,
    pub handshake_timeout_ms: u64,
    pub max_frame_bytes: usize,
    // Frames buffered per realtime connection before dropping.
    pub outbound_queue: usize,
    // Echo realtime events back to their sender.
    pub include_sender: bool,
    // Admin dashboard backend for REST calls.
    pub api_url: Option<String>,
    pub log_dir: PathBuf,
    pub json_logs: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DashboardConfigOverride {
    http_bind: Option<String>,
    realtime_bind: Option<String>,
    jwt_secret: Option<String>,
    token_cookie: Option<String>,
    token_leeway_secs: Option<u64>,
    handshake_timeout_ms: Option<u64>,
    max_frame_bytes: Option<usize>,
    outbound_queue: Option<usize>,
    include_sender: Option<bool>,
    api_url: Option<String>,
    log_dir: Option<String>,
    json_logs: Option<bool>,
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl DashboardConfig {
    pub fn from_env() -> Result<Self> {
        let http_bind = std::env::var("SMALL_POS_HTTP_BIND")
            .unwrap_or_else(|_| DEFAULT_HTTP_BIND.to_string())
            .parse()
            .with_context(|| "parse SMALL_POS_HTTP_BIND")?;
        let realtime_bind = std::env::var("SMALL_POS_REALTIME_BIND")
            .unwrap_or_else(|_| DEFAULT_REALTIME_BIND.to_string())
            .parse()
            .with_context(|| "parse SMALL_POS_REALTIME_BIND")?;
        let jwt_secret = env_nonempty("SMALL_POS_JWT_SECRET");
        let token_cookie =
            env_nonempty("SMALL_POS_TOKEN_COOKIE").unwrap_or_else(|| DEFAULT_TOKEN_COOKIE.to_string());
        let token_leeway_secs = std::env::var("SMALL_POS_TOKEN_LEEWAY_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TOKEN_LEEWAY_SECS);
        let handshake_timeout_ms = std::env::var("SMALL_POS_HANDSHAKE_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS);
        let max_frame_bytes = std::env::var("SMALL_POS_MAX_FRAME_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);
        let outbound_queue = std::env::var("SMALL_POS_OUTBOUND_QUEUE")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_OUTBOUND_QUEUE);
        let include_sender = env_flag("SMALL_POS_INCLUDE_SENDER").unwrap_or(false);
        let api_url = env_nonempty("SMALL_POS_API_URL");
        let log_dir = env_nonempty("SMALL_POS_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));
        let json_logs = env_flag("SMALL_POS_JSON_LOGS").unwrap_or(false);

        Ok(Self {
            http_bind,
            realtime_bind,
            jwt_secret,
            token_cookie,
            token_leeway_secs,
            handshake_timeout_ms,
            max_frame_bytes,
            outbound_queue,
            include_sender,
            api_url,
            log_dir,
            json_logs,
        })
    }

    /// [`Self::from_env`] plus the override file, when `SMALL_POS_CONFIG` is set.
    pub fn from_env_or_file() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Some(path) = env_nonempty("SMALL_POS_CONFIG") {
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read SMALL_POS_CONFIG: {path}"))?;
            let override_cfg: DashboardConfigOverride =
                serde_json::from_str(&contents).with_context(|| "parse dashboard config json")?;
            config.apply(override_cfg)?;
        }
        Ok(config)
    }

    fn apply(&mut self, override_cfg: DashboardConfigOverride) -> Result<()> {
        if let Some(value) = override_cfg.http_bind {
            self.http_bind = value.parse().with_context(|| "parse http_bind")?;
        }
        if let Some(value) = override_cfg.realtime_bind {
            self.realtime_bind = value.parse().with_context(|| "parse realtime_bind")?;
        }
        if let Some(value) = override_cfg.jwt_secret {
            self.jwt_secret = Some(value).filter(|s| !s.is_empty());
        }
        if let Some(value) = override_cfg.token_cookie.filter(|v| !v.is_empty()) {
            self.token_cookie = value;
        }
        if let Some(value) = override_cfg.token_leeway_secs {
            self.token_leeway_secs = value;
        }
        if let Some(value) = override_cfg.handshake_timeout_ms.filter(|v| *v > 0) {
            self.handshake_timeout_ms = value;
        }
        if let Some(value) = override_cfg.max_frame_bytes.filter(|v| *v > 0) {
            self.max_frame_bytes = value;
        }
        if let Some(value) = override_cfg.outbound_queue.filter(|v| *v > 0) {
            self.outbound_queue = value;
        }
        if let Some(value) = override_cfg.include_sender {
            self.include_sender = value;
        }
        if let Some(value) = override_cfg.api_url {
            self.api_url = Some(value).filter(|s| !s.is_empty());
        }
        if let Some(value) = override_cfg.log_dir {
            self.log_dir = PathBuf::from(value);
        }
        if let Some(value) = override_cfg.json_logs {
            self.json_logs = value;
        }
        Ok(())
    }

    pub fn token_decoder(&self) -> TokenDecoder {
        let decoder = match self.jwt_secret.as_deref() {
            Some(secret) => TokenDecoder::hs256(secret.as_bytes()),
            None => {
                warn!("SMALL_POS_JWT_SECRET not set; token signatures are not verified");
                TokenDecoder::unverified()
            }
        };
        decoder.with_leeway(self.token_leeway_secs)
    }

    pub fn realtime_server_config(&self) -> RealtimeServerConfig {
        RealtimeServerConfig {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            max_frame_bytes: self.max_frame_bytes,
            outbound_queue: self.outbound_queue,
            fanout: if self.include_sender {
                FanoutPolicy::IncludeSender
            } else {
                FanoutPolicy::ExcludeSender
            },
        }
    }
}
