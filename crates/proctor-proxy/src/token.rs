//! Session credential extraction and comparison.
//!
//! The local client agent authenticates against the gateway with a single
//! line, `Authorization: Bearer <credential>`. The credential is opaque to
//! the gateway; it is held in a `Zeroizing<String>` so it is cleared from
//! memory once the session lookup is done.

use crate::error::{ProxyError, Result};
use subtle::ConstantTimeEq;
use tracing::warn;
use zeroize::Zeroizing;

/// Longest handshake line accepted, including the line terminator.
pub const MAX_HANDSHAKE_LINE: usize = 4096;

const AUTHORIZATION_PREFIX: &str = "authorization:";
const BEARER_SCHEME: &str = "bearer";

/// Constant-time comparison of two credential strings.
///
/// Uses the `subtle` crate's `ConstantTimeEq` so response timing does not
/// leak how much of a guessed credential was correct.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Extract the bearer credential from a gateway handshake line.
///
/// Header name and scheme are matched case-insensitively. Surrounding
/// whitespace and the LF/CRLF terminator are ignored.
pub fn parse_handshake(line: &str) -> Result<Zeroizing<String>> {
    let line = line.trim();
    let has_header = line
        .get(..AUTHORIZATION_PREFIX.len())
        .is_some_and(|name| name.eq_ignore_ascii_case(AUTHORIZATION_PREFIX));
    if !has_header {
        warn!("Handshake without Authorization header");
        return Err(ProxyError::Handshake(
            "expected 'Authorization: Bearer <credential>'".to_string(),
        ));
    }

    let value = line[AUTHORIZATION_PREFIX.len()..].trim_start();
    let (scheme, credential) = value
        .split_once(char::is_whitespace)
        .ok_or_else(|| ProxyError::Handshake("missing bearer credential".to_string()))?;

    if !scheme.eq_ignore_ascii_case(BEARER_SCHEME) {
        warn!("Handshake with unsupported auth scheme");
        return Err(ProxyError::Handshake(format!(
            "unsupported auth scheme: {}",
            scheme
        )));
    }

    let credential = credential.trim();
    if credential.is_empty() || credential.contains(char::is_whitespace) {
        return Err(ProxyError::Handshake(
            "malformed bearer credential".to_string(),
        ));
    }

    Ok(Zeroizing::new(credential.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_handshake_crlf() {
        let cred = parse_handshake("Authorization: Bearer abc123\r\n").unwrap();
        assert_eq!(cred.as_str(), "abc123");
    }

    #[test]
    fn test_parse_handshake_lf_and_case() {
        let cred = parse_handshake("authorization: BEARER abc123\n").unwrap();
        assert_eq!(cred.as_str(), "abc123");
    }

    #[test]
    fn test_parse_handshake_wrong_header() {
        assert!(parse_handshake("Proxy-Authorization: Bearer abc\r\n").is_err());
        assert!(parse_handshake("").is_err());
    }

    #[test]
    fn test_parse_handshake_wrong_scheme() {
        assert!(parse_handshake("Authorization: Basic abc123").is_err());
    }

    #[test]
    fn test_parse_handshake_missing_credential() {
        assert!(parse_handshake("Authorization: Bearer").is_err());
        assert!(parse_handshake("Authorization: Bearer    ").is_err());
        assert!(parse_handshake("Authorization: Bearer a b").is_err());
    }

    #[test]
    fn test_constant_time_eq_same() {
        assert!(constant_time_eq(b"hello", b"hello"));
    }

    #[test]
    fn test_constant_time_eq_different() {
        assert!(!constant_time_eq(b"hello", b"world"));
    }

    #[test]
    fn test_constant_time_eq_different_length() {
        assert!(!constant_time_eq(b"hello", b"hi"));
    }
}
