//! Error types and failure classification.
//!
//! Every per-call failure is a [`CallError`]. The send loop never escalates
//! these; it logs them and reports them through [`FailureKind`] labels in
//! metrics. Caller-facing errors of the control surface are
//! [`ControlError`], configuration problems are [`ConfigError`].

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::trace::Stage;

/// Outcome classes a single call can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Could not resolve or connect to the remote (or the proxy).
    Dial,

    /// Proxy answered but refused to open a tunnel.
    ProxyTunnel,

    /// TLS handshake failed or timed out.
    Tls,

    /// Connection-level failure after the connection was obtained,
    /// including the response-header timeout.
    Transport,

    /// Headers arrived but the body could not be read.
    ResponseRead,

    /// Remote answered with a status other than 200.
    RemoteRejected,

    /// The per-call deadline fired.
    DeadlineExceeded,

    /// The caller canceled the call (stop requested).
    Canceled,

    /// The request itself could not be built.
    InvalidRequest,
}

impl FailureKind {
    /// Label used in metrics and compact log lines.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::Dial => "dial_failure",
            FailureKind::ProxyTunnel => "proxy_tunnel_failure",
            FailureKind::Tls => "tls_failure",
            FailureKind::Transport => "transport_failure",
            FailureKind::ResponseRead => "response_read_failure",
            FailureKind::RemoteRejected => "remote_rejected",
            FailureKind::DeadlineExceeded => "deadline_exceeded",
            FailureKind::Canceled => "canceled",
            FailureKind::InvalidRequest => "invalid_request",
        }
    }

    /// Human-readable description of this failure kind.
    pub fn description(&self) -> &'static str {
        match self {
            FailureKind::Dial => "DNS/TCP dial failure",
            FailureKind::ProxyTunnel => "Proxy tunnel not established",
            FailureKind::Tls => "TLS handshake failure",
            FailureKind::Transport => "Transport failure",
            FailureKind::ResponseRead => "Response body read failure",
            FailureKind::RemoteRejected => "Remote rejected the request",
            FailureKind::DeadlineExceeded => "Per-call deadline exceeded",
            FailureKind::Canceled => "Explicitly canceled",
            FailureKind::InvalidRequest => "Invalid request",
        }
    }

}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Why a single call failed.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("could not build request: {0}")]
    InvalidRequest(String),

    #[error("dial failed at {stage}: {message}")]
    Dial { stage: Stage, message: String },

    #[error("proxy tunnel not established: {0}")]
    ProxyTunnel(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("transport error at {stage}: {message}")]
    Transport { stage: Stage, message: String },

    #[error("response read failed at {stage}: {message}")]
    ResponseRead { stage: Stage, message: String },

    #[error("status is not ok: {status}, body: {body}")]
    RemoteRejected { status: u16, body: String },

    #[error("per-call deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("call canceled")]
    Canceled,
}

impl CallError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CallError::InvalidRequest(_) => FailureKind::InvalidRequest,
            CallError::Dial { .. } => FailureKind::Dial,
            CallError::ProxyTunnel(_) => FailureKind::ProxyTunnel,
            CallError::Tls(_) => FailureKind::Tls,
            CallError::Transport { .. } => FailureKind::Transport,
            CallError::ResponseRead { .. } => FailureKind::ResponseRead,
            CallError::RemoteRejected { .. } => FailureKind::RemoteRejected,
            CallError::DeadlineExceeded(_) => FailureKind::DeadlineExceeded,
            CallError::Canceled => FailureKind::Canceled,
        }
    }
}

/// Problems with an operator-supplied configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("chat ID is required")]
    ChatIdRequired,

    #[error("bot token is required")]
    BotTokenRequired,

    #[error("invalid proxy URL '{url}': {message}")]
    InvalidProxyUrl { url: String, message: String },

    #[error("unsupported proxy scheme '{0}' (expected http, socks5 or socks5h)")]
    UnsupportedProxyScheme(String),

    #[error("invalid API base URL '{url}': {message}")]
    InvalidEndpoint { url: String, message: String },

    #[error("field '{field}' must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("invalid duration for '{field}': {message}")]
    InvalidDuration { field: String, message: String },

    #[error("failed to read config file: {0}")]
    FileRead(String),

    #[error("failed to parse config file: {0}")]
    Parse(String),

    #[error("invalid value for {var}: {message}")]
    InvalidEnv { var: String, message: String },
}

/// Errors returned synchronously by the control surface.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("sending is already running")]
    AlreadyRunning,

    #[error("sending is not running")]
    NotRunning,

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("failed to create client: {0}")]
    ClientBuild(String),
}

/// Canonical reason phrase for common HTTP status codes.
pub fn status_reason(status_code: u16) -> &'static str {
    match status_code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown Status",
    }
}
