//! Per-session forward proxy for proctored assessments.
//!
//! `proctor-proxy` gives every participant session its own proxy port:
//!
//! 1. **Gateway** (`gateway`) - Authenticates a session credential with a
//!    one-line handshake, leases a port from a fixed range and starts the
//!    session's worker before answering `ASSIGNED_PORT:<n>`.
//!
//! 2. **Workers** (`worker`) - One listener per leased port. Requests are
//!    parsed as absolute-URI or `CONNECT`, checked against the session's
//!    blocklist and either refused with `403` or relayed upstream.
//!
//! 3. **Hot reload** (`reload`) - A poller over a durable notification
//!    table pushes blocklist changes into running workers, closing only the
//!    connections whose host changed status.
//!
//! Port leases and notifications live in SQLite (`lease`), so a restarted
//! gateway hands each session the same port and keeps counting its time
//! budget where it left off.

pub mod audit;
pub mod blocking;
pub mod config;
pub mod connect;
pub mod connections;
pub mod directory;
pub mod error;
pub mod filter;
pub mod gateway;
pub mod lease;
pub mod reload;
pub mod token;
pub mod worker;

pub use config::GatewayConfig;
pub use error::{ProxyError, Result};
pub use gateway::{start, GatewayHandle};
