//! Session directory: the external assessment service.
//!
//! The gateway never owns session state. It resolves credentials, re-reads
//! blocklists and monitoring flags, appends violation logs and reports
//! connected time through [`SessionDirectory`]. Two backends exist:
//! [`HttpDirectory`] talks to the assessment service, [`StaticDirectory`]
//! serves sessions listed in the configuration file.
//!
//! Implementations are blocking; async callers go through
//! [`crate::blocking::run_blocking`].

use crate::config::{DirectoryConfig, StaticSession};
use crate::error::{ProxyError, Result};
use crate::token;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts made for a violation log before it is dropped.
pub const VIOLATION_LOG_ATTEMPTS: u32 = 3;

/// Backoff unit between violation log attempts (attempt n waits n units).
pub const VIOLATION_LOG_BACKOFF: Duration = Duration::from_millis(500);

/// A participant's assessment attempt, as seen by the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub participant_id: String,
    pub assessment_id: String,
    /// Whether blocked requests should be reported as violations.
    #[serde(default)]
    pub monitoring_active: bool,
    /// Blocked hostnames; `*.domain` entries are allowed.
    #[serde(default)]
    pub blocked_hosts: Vec<String>,
    /// Total connected seconds allowed. `None` = unlimited.
    #[serde(default)]
    pub time_budget_secs: Option<u64>,
}

/// The external collaborator owning sessions.
pub trait SessionDirectory: Send + Sync {
    /// Map an opaque bearer credential to its session.
    fn resolve_session(&self, credential: &str) -> Result<Option<Session>>;

    /// Re-read a session by id.
    fn fetch_session(&self, session_id: &str) -> Result<Option<Session>>;

    /// Append one violation message to the session's log.
    fn append_violation_log(&self, session_id: &str, message: &str) -> Result<()>;

    /// Add connected seconds to the session's running total.
    fn accumulate_session_seconds(&self, session_id: &str, seconds: u64) -> Result<()>;
}

/// Build the directory backend named in the configuration.
pub fn from_config(config: &DirectoryConfig) -> Result<Arc<dyn SessionDirectory>> {
    match config {
        DirectoryConfig::Http {
            base_url,
            api_token_env,
            timeout_secs,
        } => {
            let api_token = match api_token_env {
                Some(var) => Some(std::env::var(var).map_err(|_| {
                    ProxyError::Config(format!("environment variable {} is not set", var))
                })?),
                None => None,
            };
            Ok(Arc::new(HttpDirectory::new(
                base_url,
                api_token,
                Duration::from_secs(*timeout_secs),
            )))
        }
        DirectoryConfig::Static { sessions } => Ok(Arc::new(StaticDirectory::new(sessions))),
    }
}

/// Report a blocked request, fire-and-forget.
///
/// Runs on the blocking pool. The monitoring flag is read from a fresh
/// lookup right before sending, since it can be toggled mid-session.
/// Failures are retried with linear backoff and then dropped; they never
/// reach the connection that triggered them.
pub fn spawn_violation_log(
    directory: Arc<dyn SessionDirectory>,
    session_id: String,
    message: String,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        send_violation_log(directory.as_ref(), &session_id, &message, VIOLATION_LOG_BACKOFF);
    })
}

/// Blocking body of [`spawn_violation_log`]. Returns whether a log was
/// written.
pub fn send_violation_log(
    directory: &dyn SessionDirectory,
    session_id: &str,
    message: &str,
    backoff: Duration,
) -> bool {
    for attempt in 1..=VIOLATION_LOG_ATTEMPTS {
        let result = directory.fetch_session(session_id).and_then(|session| {
            match session {
                Some(s) if s.monitoring_active => {
                    directory.append_violation_log(session_id, message)?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        });
        match result {
            Ok(sent) => {
                if !sent {
                    debug!(session = session_id, "monitoring inactive, violation not logged");
                }
                return sent;
            }
            Err(e) => {
                warn!(
                    session = session_id,
                    attempt = attempt,
                    "violation log failed: {}",
                    e
                );
                if attempt < VIOLATION_LOG_ATTEMPTS {
                    std::thread::sleep(backoff * attempt);
                }
            }
        }
    }
    warn!(session = session_id, "dropping violation log after {} attempts", VIOLATION_LOG_ATTEMPTS);
    false
}

// ============================================================================
// HTTP backend
// ============================================================================

#[derive(Debug, Serialize)]
struct ResolveRequest<'a> {
    credential: &'a str,
}

#[derive(Debug, Serialize)]
struct ViolationRequest<'a> {
    message: &'a str,
}

#[derive(Debug, Serialize)]
struct SecondsRequest {
    seconds: u64,
}

type HttpResponse = std::result::Result<ureq::http::Response<ureq::Body>, ureq::Error>;

/// Directory backed by the assessment service's proctoring API.
///
/// Endpoints, relative to `base_url`:
/// - `POST /sessions/resolve` with `{"credential": ...}` → `Session` or 404
/// - `GET /sessions/{id}` → `Session` or 404
/// - `POST /sessions/{id}/violations` with `{"message": ...}`
/// - `POST /sessions/{id}/seconds` with `{"seconds": n}`
pub struct HttpDirectory {
    base_url: String,
    api_token: Option<zeroize::Zeroizing<String>>,
    agent: ureq::Agent,
}

impl HttpDirectory {
    pub fn new(base_url: &str, api_token: Option<String>, timeout: Duration) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .new_agent();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.map(zeroize::Zeroizing::new),
            agent,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorization(&self) -> Option<String> {
        self.api_token
            .as_ref()
            .map(|t| format!("Bearer {}", t.as_str()))
    }

    fn post(&self, path: &str, body: &str) -> HttpResponse {
        let mut request = self
            .agent
            .post(self.url(path))
            .header("Content-Type", "application/json")
            .header(
                "User-Agent",
                format!("proctor-proxy/{}", env!("CARGO_PKG_VERSION")),
            );
        if let Some(auth) = self.authorization() {
            request = request.header("Authorization", auth.as_str());
        }
        request.send(body.as_bytes())
    }

    fn get(&self, path: &str) -> HttpResponse {
        let mut request = self.agent.get(self.url(path)).header(
            "User-Agent",
            format!("proctor-proxy/{}", env!("CARGO_PKG_VERSION")),
        );
        if let Some(auth) = self.authorization() {
            request = request.header("Authorization", auth.as_str());
        }
        request.call()
    }

    fn read_session(response: HttpResponse) -> Result<Option<Session>> {
        match response {
            Ok(response) => {
                let body = response
                    .into_body()
                    .read_to_string()
                    .map_err(|e| ProxyError::Directory(format!("reading session: {}", e)))?;
                let session = serde_json::from_str(&body)
                    .map_err(|e| ProxyError::Directory(format!("decoding session: {}", e)))?;
                Ok(Some(session))
            }
            Err(ureq::Error::StatusCode(401 | 403 | 404)) => Ok(None),
            Err(e) => Err(ProxyError::Directory(e.to_string())),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| ProxyError::Directory(e.to_string()))
}

fn session_path(session_id: &str, suffix: &str) -> String {
    format!("/sessions/{}{}", urlencoding::encode(session_id), suffix)
}

impl SessionDirectory for HttpDirectory {
    fn resolve_session(&self, credential: &str) -> Result<Option<Session>> {
        let body = encode(&ResolveRequest { credential })?;
        Self::read_session(self.post("/sessions/resolve", &body))
    }

    fn fetch_session(&self, session_id: &str) -> Result<Option<Session>> {
        Self::read_session(self.get(&session_path(session_id, "")))
    }

    fn append_violation_log(&self, session_id: &str, message: &str) -> Result<()> {
        let body = encode(&ViolationRequest { message })?;
        self.post(&session_path(session_id, "/violations"), &body)
            .map_err(|e| ProxyError::Directory(e.to_string()))?;
        Ok(())
    }

    fn accumulate_session_seconds(&self, session_id: &str, seconds: u64) -> Result<()> {
        let body = encode(&SecondsRequest { seconds })?;
        self.post(&session_path(session_id, "/seconds"), &body)
            .map_err(|e| ProxyError::Directory(e.to_string()))?;
        Ok(())
    }
}

// ============================================================================
// Static backend
// ============================================================================

/// In-process directory, for running without an assessment service.
///
/// Sessions can be replaced at runtime with [`StaticDirectory::upsert`];
/// violations and reported seconds are kept in memory and written to the
/// log. Nothing is re-read from the configuration file, so a policy
/// notification only picks up changes made through `upsert` or `update`.
#[derive(Default)]
pub struct StaticDirectory {
    inner: RwLock<StaticState>,
}

#[derive(Default)]
struct StaticState {
    credentials: Vec<(zeroize::Zeroizing<String>, String)>,
    sessions: HashMap<String, Session>,
    violations: Vec<(String, String)>,
    seconds: HashMap<String, u64>,
}

impl StaticDirectory {
    #[must_use]
    pub fn new(entries: &[StaticSession]) -> Self {
        let directory = Self::default();
        for entry in entries {
            directory.upsert(&entry.credential, entry.session.clone());
        }
        directory
    }

    /// Insert or replace a session and bind a credential to it.
    pub fn upsert(&self, credential: &str, session: Session) {
        let mut state = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state
            .credentials
            .retain(|(_, id)| id != &session.session_id);
        state.credentials.push((
            zeroize::Zeroizing::new(credential.to_string()),
            session.session_id.clone(),
        ));
        state.sessions.insert(session.session_id.clone(), session);
    }

    /// Change a session in place. Returns false when the session is unknown.
    pub fn update<F: FnOnce(&mut Session)>(&self, session_id: &str, f: F) -> bool {
        let mut state = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match state.sessions.get_mut(session_id) {
            Some(session) => {
                f(session);
                true
            }
            None => false,
        }
    }

    /// Violations logged so far, as `(session_id, message)`.
    #[must_use]
    pub fn violations(&self) -> Vec<(String, String)> {
        match self.inner.read() {
            Ok(state) => state.violations.clone(),
            Err(poisoned) => poisoned.into_inner().violations.clone(),
        }
    }

    /// Seconds reported for a session so far.
    #[must_use]
    pub fn reported_seconds(&self, session_id: &str) -> u64 {
        let read = |state: &StaticState| state.seconds.get(session_id).copied().unwrap_or(0);
        match self.inner.read() {
            Ok(state) => read(&*state),
            Err(poisoned) => read(&*poisoned.into_inner()),
        }
    }
}

impl SessionDirectory for StaticDirectory {
    fn resolve_session(&self, credential: &str) -> Result<Option<Session>> {
        let state = self
            .inner
            .read()
            .map_err(|_| ProxyError::Directory("static directory lock poisoned".to_string()))?;
        // Compare against every entry so lookup time does not depend on
        // which credential matched.
        let mut found = None;
        for (known, session_id) in &state.credentials {
            if token::constant_time_eq(known.as_bytes(), credential.as_bytes()) {
                found = Some(session_id.clone());
            }
        }
        Ok(found.and_then(|id| state.sessions.get(&id).cloned()))
    }

    fn fetch_session(&self, session_id: &str) -> Result<Option<Session>> {
        let state = self
            .inner
            .read()
            .map_err(|_| ProxyError::Directory("static directory lock poisoned".to_string()))?;
        Ok(state.sessions.get(session_id).cloned())
    }

    fn append_violation_log(&self, session_id: &str, message: &str) -> Result<()> {
        info!(session = session_id, "violation: {}", message);
        let mut state = self
            .inner
            .write()
            .map_err(|_| ProxyError::Directory("static directory lock poisoned".to_string()))?;
        state
            .violations
            .push((session_id.to_string(), message.to_string()));
        Ok(())
    }

    fn accumulate_session_seconds(&self, session_id: &str, seconds: u64) -> Result<()> {
        let mut state = self
            .inner
            .write()
            .map_err(|_| ProxyError::Directory("static directory lock poisoned".to_string()))?;
        *state.seconds.entry(session_id.to_string()).or_insert(0) += seconds;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    pub(crate) fn session(id: &str, blocked: &[&str], monitoring: bool) -> Session {
        Session {
            session_id: id.to_string(),
            participant_id: format!("participant-{}", id),
            assessment_id: "assessment-1".to_string(),
            monitoring_active: monitoring,
            blocked_hosts: blocked.iter().map(|s| s.to_string()).collect(),
            time_budget_secs: None,
        }
    }

    #[test]
    fn test_static_resolve_by_credential() {
        let dir = StaticDirectory::default();
        dir.upsert("cred-1", session("s1", &["exam-cheat.com"], true));
        dir.upsert("cred-2", session("s2", &[], false));

        let s = dir.resolve_session("cred-1").unwrap().unwrap();
        assert_eq!(s.session_id, "s1");
        assert!(dir.resolve_session("cred-3").unwrap().is_none());
        assert!(dir.resolve_session("").unwrap().is_none());
    }

    #[test]
    fn test_static_upsert_rebinds_credential() {
        let dir = StaticDirectory::default();
        dir.upsert("old", session("s1", &[], true));
        dir.upsert("new", session("s1", &[], true));
        assert!(dir.resolve_session("old").unwrap().is_none());
        assert!(dir.resolve_session("new").unwrap().is_some());
    }

    #[test]
    fn test_static_update_session() {
        let dir = StaticDirectory::default();
        dir.upsert("c", session("s1", &[], true));
        assert!(dir.update("s1", |s| s.blocked_hosts.push("x.com".to_string())));
        assert!(!dir.update("nope", |_| {}));
        let s = dir.fetch_session("s1").unwrap().unwrap();
        assert_eq!(s.blocked_hosts, vec!["x.com"]);
    }

    #[test]
    fn test_static_accumulates_seconds() {
        let dir = StaticDirectory::default();
        dir.accumulate_session_seconds("s1", 10).unwrap();
        dir.accumulate_session_seconds("s1", 15).unwrap();
        assert_eq!(dir.reported_seconds("s1"), 25);
        assert_eq!(dir.reported_seconds("s2"), 0);
    }

    #[test]
    fn test_violation_logged_when_monitoring() {
        let dir = StaticDirectory::default();
        dir.upsert("c", session("s1", &[], true));
        assert!(send_violation_log(&dir, "s1", "Blocked URL: x.com:443", Duration::ZERO));
        assert_eq!(
            dir.violations(),
            vec![("s1".to_string(), "Blocked URL: x.com:443".to_string())]
        );
    }

    #[test]
    fn test_violation_skipped_when_not_monitoring() {
        let dir = StaticDirectory::default();
        dir.upsert("c", session("s1", &[], false));
        assert!(!send_violation_log(&dir, "s1", "Blocked URL: x.com:443", Duration::ZERO));
        assert!(dir.violations().is_empty());
    }

    #[test]
    fn test_violation_rechecks_monitoring_at_send_time() {
        let dir = StaticDirectory::default();
        dir.upsert("c", session("s1", &[], false));
        dir.update("s1", |s| s.monitoring_active = true);
        assert!(send_violation_log(&dir, "s1", "m", Duration::ZERO));
        assert_eq!(dir.violations().len(), 1);
    }

    /// Fails the first `failures` appends.
    struct FlakyDirectory {
        inner: StaticDirectory,
        failures: u32,
        calls: AtomicU32,
    }

    impl SessionDirectory for FlakyDirectory {
        fn resolve_session(&self, credential: &str) -> Result<Option<Session>> {
            self.inner.resolve_session(credential)
        }
        fn fetch_session(&self, session_id: &str) -> Result<Option<Session>> {
            self.inner.fetch_session(session_id)
        }
        fn append_violation_log(&self, session_id: &str, message: &str) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(ProxyError::Directory("service unavailable".to_string()));
            }
            self.inner.append_violation_log(session_id, message)
        }
        fn accumulate_session_seconds(&self, session_id: &str, seconds: u64) -> Result<()> {
            self.inner.accumulate_session_seconds(session_id, seconds)
        }
    }

    #[test]
    fn test_violation_retried_then_sent_once() {
        let dir = FlakyDirectory {
            inner: StaticDirectory::default(),
            failures: 2,
            calls: AtomicU32::new(0),
        };
        dir.inner.upsert("c", session("s1", &[], true));
        assert!(send_violation_log(&dir, "s1", "m", Duration::ZERO));
        assert_eq!(dir.calls.load(Ordering::SeqCst), 3);
        assert_eq!(dir.inner.violations().len(), 1);
    }

    #[test]
    fn test_violation_dropped_after_attempts() {
        let dir = FlakyDirectory {
            inner: StaticDirectory::default(),
            failures: 10,
            calls: AtomicU32::new(0),
        };
        dir.inner.upsert("c", session("s1", &[], true));
        assert!(!send_violation_log(&dir, "s1", "m", Duration::ZERO));
        assert_eq!(dir.calls.load(Ordering::SeqCst), VIOLATION_LOG_ATTEMPTS);
        assert!(dir.inner.violations().is_empty());
    }

    #[test]
    fn test_session_path_escapes_id() {
        assert_eq!(session_path("s-1", ""), "/sessions/s-1");
        assert_eq!(session_path("a/b", "/seconds"), "/sessions/a%2Fb/seconds");
        assert_eq!(
            session_path("exam 1?ü", "/violations"),
            "/sessions/exam%201%3F%C3%BC/violations"
        );
    }

    #[tokio::test]
    async fn test_spawned_violation_log_runs_to_completion() {
        let dir = Arc::new(StaticDirectory::default());
        dir.upsert("cred-1", session("s1", &[], true));
        spawn_violation_log(
            Arc::clone(&dir) as Arc<dyn SessionDirectory>,
            "s1".to_string(),
            "Blocked URL: exam-cheat.com:443".to_string(),
        )
        .await
        .unwrap();
        assert_eq!(
            dir.violations(),
            vec![(
                "s1".to_string(),
                "Blocked URL: exam-cheat.com:443".to_string()
            )]
        );
    }

    #[test]
    fn test_session_json_defaults() {
        let s: Session = serde_json::from_str(
            r#"{"session_id":"s","participant_id":"p","assessment_id":"a"}"#,
        )
        .unwrap();
        assert!(!s.monitoring_active);
        assert!(s.blocked_hosts.is_empty());
        assert!(s.time_budget_secs.is_none());
    }
}
