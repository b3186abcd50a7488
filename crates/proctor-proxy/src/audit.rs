//! Audit logging for gateway and worker decisions.
//!
//! Logs with structured fields via `tracing`. Credentials are never
//! included; sessions are identified by id only.

use tracing::info;

/// Request form seen by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// `CONNECT host:port` tunnel
    Connect,
    /// Absolute-URI HTTP request
    Http,
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestKind::Connect => write!(f, "connect"),
            RequestKind::Http => write!(f, "http"),
        }
    }
}

/// Log an allowed proxy request.
pub fn log_allowed(session_id: &str, kind: RequestKind, host: &str, port: u16, method: &str) {
    info!(
        target: "proctor_proxy::audit",
        session = session_id,
        kind = %kind,
        host = host,
        port = port,
        method = method,
        decision = "allow",
        "proxy request allowed"
    );
}

/// Log a blocked proxy request.
pub fn log_blocked(session_id: &str, kind: RequestKind, host: &str, port: u16, reason: &str) {
    info!(
        target: "proctor_proxy::audit",
        session = session_id,
        kind = %kind,
        host = host,
        port = port,
        decision = "deny",
        reason = reason,
        "proxy request blocked"
    );
}

/// Log a gateway port assignment.
pub fn log_assigned(session_id: &str, port: u16, reused: bool) {
    info!(
        target: "proctor_proxy::audit",
        session = session_id,
        port = port,
        reused = reused,
        "gateway assigned port"
    );
}

/// Log connections closed by a policy change.
pub fn log_policy_applied(session_id: &str, changed: &[String], closed: usize) {
    info!(
        target: "proctor_proxy::audit",
        session = session_id,
        changed = ?changed,
        closed = closed,
        "blocklist update applied"
    );
}
