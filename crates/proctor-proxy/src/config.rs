//! Gateway configuration types.
//!
//! Defines the listening endpoint, the port pool workers are leased from,
//! the lease database location, polling intervals, and how sessions are
//! looked up.

use crate::directory::Session;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the gateway and its workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bind address for the gateway and every worker (default: 127.0.0.1)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Well-known gateway port clients authenticate against.
    /// 0 = OS-assigned, which is only useful in tests.
    #[serde(default = "default_gateway_port")]
    pub gateway_port: u16,

    /// Port pool workers are leased from.
    #[serde(default)]
    pub port_range: PortRange,

    /// SQLite file holding port leases and policy notifications.
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// How often the hot-reload poller reads the notification queue.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How often each worker re-checks the session's time budget.
    #[serde(default = "default_budget_check_secs")]
    pub budget_check_secs: u64,

    /// Minimum spacing between `last_activity_at` writes for one lease.
    #[serde(default = "default_activity_write_secs")]
    pub activity_write_secs: u64,

    /// Timeout for upstream TCP connect.
    #[serde(default = "default_upstream_connect_secs")]
    pub upstream_connect_secs: u64,

    /// Timeout for reading the gateway handshake line.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Where sessions, violation logs and time accounting live.
    #[serde(default)]
    pub directory: DirectoryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            gateway_port: default_gateway_port(),
            port_range: PortRange::default(),
            database: default_database(),
            poll_interval_ms: default_poll_interval_ms(),
            budget_check_secs: default_budget_check_secs(),
            activity_write_secs: default_activity_write_secs(),
            upstream_connect_secs: default_upstream_connect_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            directory: DirectoryConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn budget_check_interval(&self) -> Duration {
        Duration::from_secs(self.budget_check_secs.max(1))
    }

    pub fn activity_write_interval(&self) -> Duration {
        Duration::from_secs(self.activity_write_secs)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_secs.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }

    /// Reject configurations that cannot lease a single port.
    pub fn validate(&self) -> crate::Result<()> {
        if self.port_range.start == 0 || self.port_range.start > self.port_range.end {
            return Err(crate::ProxyError::Config(format!(
                "invalid port range {}-{}",
                self.port_range.start, self.port_range.end
            )));
        }
        if self.gateway_port != 0 && self.port_range.contains(self.gateway_port) {
            return Err(crate::ProxyError::Config(format!(
                "gateway port {} lies inside the worker port range",
                self.gateway_port
            )));
        }
        Ok(())
    }
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
}

fn default_gateway_port() -> u16 {
    8000
}

fn default_database() -> PathBuf {
    PathBuf::from("proctor.db")
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_budget_check_secs() -> u64 {
    60
}

fn default_activity_write_secs() -> u64 {
    30
}

fn default_upstream_connect_secs() -> u64 {
    30
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

/// Inclusive range of worker ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 8001,
            end: 8999,
        }
    }
}

impl PortRange {
    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        if self.start > self.end {
            0
        } else {
            usize::from(self.end - self.start) + 1
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Session directory backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DirectoryConfig {
    /// Remote assessment service reached over HTTP.
    Http {
        /// Base URL, e.g. "https://exams.example.edu/api/proctor"
        base_url: String,
        /// Environment variable holding the service API token, if any.
        #[serde(default)]
        api_token_env: Option<String>,
        /// Per-request timeout in seconds.
        #[serde(default = "default_http_timeout_secs")]
        timeout_secs: u64,
    },
    /// Sessions listed inline. Violation logs go to the audit log only.
    ///
    /// The list is read once at startup. Policy notifications re-read the
    /// in-memory copy, so edits to the file take effect only on restart.
    Static {
        #[serde(default)]
        sessions: Vec<StaticSession>,
    },
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        DirectoryConfig::Static {
            sessions: Vec::new(),
        }
    }
}

fn default_http_timeout_secs() -> u64 {
    5
}

/// A session entry for the static directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticSession {
    /// Bearer credential that resolves to this session.
    pub credential: String,
    #[serde(flatten)]
    pub session: Session,
}
