//! Error types shared across the gate, the realtime bridge and the API client.
//!
//! The access gate itself never surfaces these to callers: every failure is
//! folded into a routing decision. They exist for the building blocks
//! underneath it (token decoding, route table construction) and for the
//! transport-facing parts of the crate.

use thiserror::Error;

/// Failure to turn a raw access token into [`crate::access::AccessClaims`].
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("access token is empty")]
    Empty,
    #[error("access token rejected: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("access token carries no recognised role claim")]
    MissingRole,
}

/// Invalid static route → permission table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteTableError {
    #[error("route pattern must start with '/': {0}")]
    InvalidPattern(String),
    #[error("duplicate route pattern: {0}")]
    DuplicatePattern(String),
}

/// Realtime bridge transport failures.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame codec error: {0}")]
    Codec(#[from] tokio_util::codec::LinesCodecError),
    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),
    #[error("handshake rejected: {0}")]
    Rejected(String),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("connection closed by peer")]
    Closed,
}

/// Admin dashboard REST API failures, already phrased for display.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Transport(String),
    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },
    #[error("Invalid JSON from admin dashboard: {0}")]
    InvalidJson(String),
    #[error("Unexpected response shape: {0}")]
    UnexpectedShape(String),
}
