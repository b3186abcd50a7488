//! Error types for the proctor-proxy crate.

use thiserror::Error;

/// Errors that can occur in the gateway, workers and lease registry.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Proxy bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Host blocked by session policy: {host}: {reason}")]
    HostBlocked { host: String, reason: String },

    #[error("Session credential rejected")]
    AuthFailed,

    #[error("No free port left in range {start}-{end}")]
    PoolExhausted { start: u16, end: u16 },

    #[error("No lease for {0}")]
    LeaseNotFound(String),

    #[error("Time budget exhausted for session {session_id}")]
    BudgetExhausted { session_id: String },

    #[error("Upstream connection failed to {host}: {reason}")]
    UpstreamConnect { host: String, reason: String },

    #[error("HTTP parse error: {0}")]
    HttpParse(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Lease database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Session directory error: {0}")]
    Directory(String),

    #[error("Policy notification error: {0}")]
    Notification(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Proxy shutdown")]
    Shutdown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
