//! Forward-proxy request handling primitives.
//!
//! A worker understands two request forms:
//! 1. `CONNECT host:port HTTP/1.1` - raw TCP tunnel, answered with
//!    `200 Connection Established` before relaying
//! 2. `METHOD http://host[:port]/path HTTP/1.1` - absolute-URI request,
//!    forwarded upstream as received
//!
//! Origin-form requests (`GET /path`) are not proxy requests and are
//! rejected. The proxy never terminates TLS; tunnelled bytes pass through.

use crate::audit::RequestKind;
use crate::connections::CloseSignal;
use crate::error::{ProxyError, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Target of a proxy request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub kind: RequestKind,
    pub method: String,
    pub host: String,
    pub port: u16,
}

impl ProxyRequest {
    /// `host:port` as used in violation logs.
    #[must_use]
    pub fn target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Parse the first line of a proxy request.
pub fn parse_request_line(line: &str) -> Result<ProxyRequest> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(ProxyError::HttpParse(format!(
            "malformed request line: {}",
            line
        )));
    }
    let method = parts[0];
    let target = parts[1];

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = parse_authority(target, 443)?;
        return Ok(ProxyRequest {
            kind: RequestKind::Connect,
            method: "CONNECT".to_string(),
            host,
            port,
        });
    }

    let (default_port, rest) = if let Some(rest) = strip_scheme(target, "http://") {
        (80, rest)
    } else if let Some(rest) = strip_scheme(target, "https://") {
        (443, rest)
    } else {
        return Err(ProxyError::HttpParse(format!(
            "not a proxy request (origin-form target): {}",
            target
        )));
    };

    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (host, port) = parse_authority(&rest[..authority_end], default_port)?;
    Ok(ProxyRequest {
        kind: RequestKind::Http,
        method: method.to_string(),
        host,
        port,
    })
}

fn strip_scheme<'a>(target: &'a str, scheme: &str) -> Option<&'a str> {
    target
        .get(..scheme.len())
        .filter(|prefix| prefix.eq_ignore_ascii_case(scheme))
        .map(|_| &target[scheme.len()..])
}

/// Split `host[:port]`, `[v6]` or `[v6]:port`, dropping any userinfo.
fn parse_authority(authority: &str, default_port: u16) -> Result<(String, u16)> {
    let authority = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host)| host);

    let (host, port_str) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(|| {
            ProxyError::HttpParse(format!("unterminated IPv6 literal: {}", authority))
        })?;
        match after.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if after.is_empty() => (host, None),
            None => {
                return Err(ProxyError::HttpParse(format!(
                    "invalid authority: {}",
                    authority
                )))
            }
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(ProxyError::HttpParse(format!(
            "missing host in: {}",
            authority
        )));
    }

    let port = match port_str {
        Some(p) => p
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| ProxyError::HttpParse(format!("invalid port in: {}", authority)))?,
        None => default_port,
    };
    Ok((host.to_string(), port))
}

/// Resolve and connect to the upstream with a per-address timeout.
///
/// Tries each resolved address in order until one succeeds.
pub async fn connect_upstream(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = tokio::time::timeout(timeout, tokio::net::lookup_host((host, port)))
        .await
        .map_err(|_| ProxyError::UpstreamConnect {
            host: host.to_string(),
            reason: "DNS resolution timed out".to_string(),
        })?
        .map_err(|e| ProxyError::UpstreamConnect {
            host: host.to_string(),
            reason: format!("DNS resolution failed: {}", e),
        })?
        .collect();

    let mut last_err = None;
    for addr in &addrs {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_err = Some(e.to_string());
            }
            Err(_) => {
                debug!("Connect to {} timed out", addr);
                last_err = Some("connection timed out".to_string());
            }
        }
    }
    Err(ProxyError::UpstreamConnect {
        host: host.to_string(),
        reason: last_err.unwrap_or_else(|| "no addresses to connect to".to_string()),
    })
}

/// How a relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// Client side reached EOF or failed
    Client,
    /// Upstream side reached EOF or failed
    Upstream,
    /// Closed by the connection registry
    Closed,
}

/// Relay bytes both ways until either direction ends or `close` fires.
///
/// Both sockets are dropped on return, which closes them.
pub async fn relay(client: TcpStream, upstream: TcpStream, close: CloseSignal) -> RelayEnd {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    tokio::select! {
        result = tokio::io::copy(&mut client_read, &mut upstream_write) => {
            debug!("client->upstream ended: {:?}", result);
            RelayEnd::Client
        }
        result = tokio::io::copy(&mut upstream_read, &mut client_write) => {
            debug!("upstream->client ended: {:?}", result);
            RelayEnd::Upstream
        }
        () = close.closed() => RelayEnd::Closed,
    }
}

/// Send `200 Connection Established` for a CONNECT tunnel.
pub async fn send_established<W: AsyncWrite + Unpin>(stream: &mut W) -> Result<()> {
    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    stream.flush().await?;
    Ok(())
}

/// Send an empty error response; the connection is closed afterwards.
pub async fn send_error<W: AsyncWrite + Unpin>(stream: &mut W, status: u16, reason: &str) -> Result<()> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status, reason
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
