//! Session blocklist matching.
//!
//! A blocklist entry blocks the host itself and every subdomain of it.
//! Wildcard entries (`*.exam-cheat.com`) are normalised to their base
//! domain, so `*.exam-cheat.com` blocks both `exam-cheat.com` and
//! `www.exam-cheat.com`. Matching is case-insensitive and ignores a
//! trailing root dot.

use std::collections::BTreeSet;

/// Result of a blocklist check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterResult {
    /// Host is not covered by any entry
    Allow,
    /// Host equals or is a subdomain of a blocklist entry
    Blocked {
        /// The host that was requested
        host: String,
        /// The normalised entry that matched
        entry: String,
    },
}

impl FilterResult {
    /// Whether the result is an allow decision
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, FilterResult::Allow)
    }

    /// A human-readable reason for the decision
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            FilterResult::Allow => "not in session blocklist".to_string(),
            FilterResult::Blocked { host, entry } => {
                if host.eq_ignore_ascii_case(entry) {
                    format!("host {} is in the session blocklist", host)
                } else {
                    format!("host {} is covered by blocklist entry {}", host, entry)
                }
            }
        }
    }
}

/// Normalise a hostname or blocklist entry for comparison.
///
/// Lowercases, strips a leading `*.` wildcard and a trailing `.`.
#[must_use]
pub fn normalize_host(entry: &str) -> String {
    let lower = entry.trim().to_ascii_lowercase();
    let without_wildcard = lower.strip_prefix("*.").unwrap_or(&lower);
    without_wildcard.trim_end_matches('.').to_string()
}

/// Whether `host` equals `domain` or is one of its subdomains.
///
/// Both arguments must already be normalised.
#[must_use]
pub fn host_matches(host: &str, domain: &str) -> bool {
    if domain.is_empty() {
        return false;
    }
    if host == domain {
        return true;
    }
    host.len() > domain.len()
        && host.ends_with(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
}

/// Snapshot of a session's blocked hosts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockFilter {
    /// Normalised entries
    entries: BTreeSet<String>,
}

impl BlockFilter {
    /// Build a filter from raw blocklist entries.
    #[must_use]
    pub fn new<S: AsRef<str>>(blocked_hosts: &[S]) -> Self {
        Self {
            entries: blocked_hosts
                .iter()
                .map(|h| normalize_host(h.as_ref()))
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    /// Check a requested host against the blocklist.
    #[must_use]
    pub fn check_host(&self, host: &str) -> FilterResult {
        let host = normalize_host(host);
        match self.entries.iter().find(|entry| host_matches(&host, entry)) {
            Some(entry) => FilterResult::Blocked {
                host,
                entry: entry.clone(),
            },
            None => FilterResult::Allow,
        }
    }

    /// Hosts present in exactly one of the two filters.
    #[must_use]
    pub fn symmetric_difference(&self, other: &BlockFilter) -> Vec<String> {
        self.entries
            .symmetric_difference(&other.entries)
            .cloned()
            .collect()
    }

    /// Normalised entries, sorted.
    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// Number of distinct blocked entries.
    #[must_use]
    pub fn blocked_count(&self) -> usize {
        self.entries.len()
    }
}
