//! Policy hot-reload channel.
//!
//! Blocklists are edited by the assessment service, which may run in
//! another process. It appends a record to the `policy_notifications`
//! table (same database as the port leases); a single poller picks
//! unprocessed records up in id order, re-reads the affected sessions and
//! pushes the new blocklist into their running workers.
//!
//! Every record is marked processed exactly once, whether or not handling
//! succeeded, so a malformed record cannot stall the queue.

use crate::blocking::run_blocking;
use crate::directory::SessionDirectory;
use crate::error::{ProxyError, Result};
use crate::worker::{Worker, WorkerPool};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS policy_notifications (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    target_kind  TEXT    NOT NULL,
    target_id    TEXT    NOT NULL,
    action       TEXT    NOT NULL,
    created_at   INTEGER NOT NULL,
    processed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_policy_notifications_pending
    ON policy_notifications (processed_at, id);
";

/// Records read per poll.
const BATCH_SIZE: usize = 256;

/// Which workers a notification is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationTarget {
    /// One participant session
    Session(String),
    /// Every session of an assessment
    Assessment(String),
}

impl NotificationTarget {
    fn kind(&self) -> &'static str {
        match self {
            NotificationTarget::Session(_) => "session",
            NotificationTarget::Assessment(_) => "assessment",
        }
    }

    fn id(&self) -> &str {
        match self {
            NotificationTarget::Session(id) | NotificationTarget::Assessment(id) => id,
        }
    }

    fn parse(kind: &str, id: &str) -> Result<Self> {
        if id.is_empty() {
            return Err(ProxyError::Notification("empty target id".to_string()));
        }
        match kind {
            "session" => Ok(NotificationTarget::Session(id.to_string())),
            "assessment" => Ok(NotificationTarget::Assessment(id.to_string())),
            other => Err(ProxyError::Notification(format!(
                "unknown target kind: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for NotificationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind(), self.id())
    }
}

/// What changed on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    BlocklistChanged,
    MonitoringChanged,
    /// Re-read everything
    Refresh,
}

impl PolicyAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::BlocklistChanged => "blocklist_changed",
            PolicyAction::MonitoringChanged => "monitoring_changed",
            PolicyAction::Refresh => "refresh",
        }
    }
}

impl FromStr for PolicyAction {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "blocklist_changed" => Ok(PolicyAction::BlocklistChanged),
            "monitoring_changed" => Ok(PolicyAction::MonitoringChanged),
            "refresh" => Ok(PolicyAction::Refresh),
            other => Err(ProxyError::Notification(format!("unknown action: {}", other))),
        }
    }
}

impl std::fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued record, as stored. Fields are validated when handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyNotification {
    pub id: i64,
    pub target_kind: String,
    pub target_id: String,
    pub action: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Durable notification queue.
#[derive(Debug, Clone)]
pub struct NotificationQueue {
    conn: Arc<Mutex<Connection>>,
}

impl NotificationQueue {
    /// Attach to a connection (usually the lease registry's), creating the
    /// table if needed.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Result<Self> {
        conn.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Append a typed notification.
    pub fn notify(&self, target: &NotificationTarget, action: PolicyAction) -> Result<i64> {
        self.append(target.kind(), target.id(), action.as_str())
    }

    /// Append a raw record, as an external writer would.
    pub fn append(&self, target_kind: &str, target_id: &str, action: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT INTO policy_notifications (target_kind, target_id, action, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![target_kind, target_id, action, Utc::now().timestamp()],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id = id, target_kind, target_id, action, "queued policy notification");
        Ok(id)
    }

    /// Unprocessed records, oldest first.
    pub fn pending(&self, limit: usize) -> Result<Vec<PolicyNotification>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT id, target_kind, target_id, action, created_at FROM policy_notifications \
             WHERE processed_at IS NULL ORDER BY id LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                Ok(PolicyNotification {
                    id: row.get(0)?,
                    target_kind: row.get(1)?,
                    target_id: row.get(2)?,
                    action: row.get(3)?,
                    created_at: row
                        .get::<_, Option<i64>>(4)?
                        .and_then(|s| DateTime::from_timestamp(s, 0)),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Mark a record processed. Returns false if it already was.
    pub fn mark_processed(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let updated = conn.execute(
            "UPDATE policy_notifications SET processed_at = ?2 \
             WHERE id = ?1 AND processed_at IS NULL",
            params![id, Utc::now().timestamp()],
        )?;
        Ok(updated == 1)
    }

    pub fn pending_count(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM policy_notifications WHERE processed_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

/// Applies queued notifications to running workers.
pub struct PolicyReloader {
    queue: NotificationQueue,
    pool: Arc<WorkerPool>,
    directory: Arc<dyn SessionDirectory>,
}

impl PolicyReloader {
    #[must_use]
    pub fn new(
        queue: NotificationQueue,
        pool: Arc<WorkerPool>,
        directory: Arc<dyn SessionDirectory>,
    ) -> Self {
        Self {
            queue,
            pool,
            directory,
        }
    }

    /// Process one batch of pending records. Returns how many were
    /// consumed.
    pub async fn poll_once(&self) -> Result<usize> {
        let queue = self.queue.clone();
        let pending = run_blocking(move || queue.pending(BATCH_SIZE)).await?;
        for notification in &pending {
            match self.handle(notification).await {
                Ok(updated) => debug!(
                    id = notification.id,
                    workers = updated,
                    "policy notification applied"
                ),
                Err(e) => error!(
                    id = notification.id,
                    target_kind = %notification.target_kind,
                    target_id = %notification.target_id,
                    action = %notification.action,
                    "policy notification failed: {}",
                    e
                ),
            }
            let queue = self.queue.clone();
            let id = notification.id;
            if !run_blocking(move || queue.mark_processed(id)).await? {
                warn!(id = notification.id, "notification already processed elsewhere");
            }
        }
        Ok(pending.len())
    }

    /// Apply one record. Returns the number of workers refreshed.
    async fn handle(&self, notification: &PolicyNotification) -> Result<usize> {
        let target = NotificationTarget::parse(&notification.target_kind, &notification.target_id)?;
        let action: PolicyAction = notification.action.parse()?;

        let workers = match &target {
            NotificationTarget::Session(id) => self.pool.for_session(id).await,
            NotificationTarget::Assessment(id) => self.pool.for_assessment(id).await,
        };
        if workers.is_empty() {
            debug!(target = %target, "no running worker for notification");
            return Ok(0);
        }

        let mut refreshed = 0;
        let mut failures = Vec::new();
        for worker in workers {
            match self.refresh(&worker).await {
                Ok(()) => refreshed += 1,
                Err(e) => failures.push(format!("{}: {}", worker.session_id(), e)),
            }
        }
        info!(action = %action, target = %target, refreshed = refreshed, "policy refreshed");

        if failures.is_empty() {
            Ok(refreshed)
        } else {
            Err(ProxyError::Notification(failures.join("; ")))
        }
    }

    async fn refresh(&self, worker: &Arc<Worker>) -> Result<()> {
        let directory = Arc::clone(&self.directory);
        let session_id = worker.session_id().to_string();
        let session = run_blocking(move || directory.fetch_session(&session_id))
            .await?
            .ok_or_else(|| {
                ProxyError::Notification(format!("session {} not found", worker.session_id()))
            })?;
        worker.apply_session(&session);
        Ok(())
    }
}

/// Spawn the poller. It runs until `shutdown_rx` turns true.
pub fn spawn_poller(
    reloader: PolicyReloader,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = reloader.poll_once().await {
                        warn!("Policy poll failed: {}", e);
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Policy poller shutting down");
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::directory::tests::session;
    use crate::directory::StaticDirectory;
    use crate::worker::tests::start_worker;

    fn reloader(pool: &Arc<WorkerPool>, dir: &Arc<StaticDirectory>) -> PolicyReloader {
        let queue = NotificationQueue::new(pool.context().registry.connection()).unwrap();
        PolicyReloader::new(queue, Arc::clone(pool), Arc::clone(dir) as Arc<dyn SessionDirectory>)
    }

    #[test]
    fn test_queue_order_and_mark_processed_once() {
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let queue = NotificationQueue::new(conn).unwrap();
        let first = queue
            .notify(
                &NotificationTarget::Session("s1".to_string()),
                PolicyAction::BlocklistChanged,
            )
            .unwrap();
        let second = queue.append("assessment", "a1", "refresh").unwrap();

        let pending = queue.pending(10).unwrap();
        assert_eq!(pending.iter().map(|n| n.id).collect::<Vec<_>>(), vec![first, second]);
        assert_eq!(pending[0].target_kind, "session");
        assert_eq!(pending[0].action, "blocklist_changed");
        assert!(pending[0].created_at.is_some());

        assert!(queue.mark_processed(first).unwrap());
        assert!(!queue.mark_processed(first).unwrap());
        assert_eq!(queue.pending_count().unwrap(), 1);
        assert_eq!(queue.pending(10).unwrap()[0].id, second);
    }

    #[test]
    fn test_action_round_trip() {
        for action in [
            PolicyAction::BlocklistChanged,
            PolicyAction::MonitoringChanged,
            PolicyAction::Refresh,
        ] {
            assert_eq!(action.as_str().parse::<PolicyAction>().unwrap(), action);
        }
        assert!("drop_tables".parse::<PolicyAction>().is_err());
    }

    #[test]
    fn test_target_parse() {
        assert_eq!(
            NotificationTarget::parse("session", "s1").unwrap(),
            NotificationTarget::Session("s1".to_string())
        );
        assert!(NotificationTarget::parse("participant", "p1").is_err());
        assert!(NotificationTarget::parse("session", "").is_err());
    }

    #[tokio::test]
    async fn test_poll_applies_new_blocklist_to_running_worker() {
        let dir = Arc::new(StaticDirectory::default());
        let (pool, worker) = start_worker(&dir, session("S", &["a.com", "b.com"], true)).await;
        let a = worker.connections().register("a.com");
        let _b = worker.connections().register("b.com");
        let _c = worker.connections().register("c.com");

        dir.update("S", |s| {
            s.blocked_hosts = vec!["b.com".to_string(), "c.com".to_string()];
        });
        let reloader = reloader(&pool, &dir);
        reloader
            .queue
            .notify(
                &NotificationTarget::Session("S".to_string()),
                PolicyAction::BlocklistChanged,
            )
            .unwrap();

        assert_eq!(reloader.poll_once().await.unwrap(), 1);
        assert_eq!(worker.blocked_hosts(), vec!["b.com", "c.com"]);
        assert_eq!(worker.connections().hosts(), vec!["b.com".to_string()]);
        assert!(tokio::time::timeout(Duration::from_millis(50), a.closed()).await.is_ok());
        assert_eq!(reloader.queue.pending_count().unwrap(), 0);

        // Nothing left: the next poll is empty.
        assert_eq!(reloader.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_assessment_target_reaches_only_its_workers() {
        let dir = Arc::new(StaticDirectory::default());
        let (pool, worker) = start_worker(&dir, session("S", &[], true)).await;
        let _conn = worker.connections().register("x.com");

        dir.update("S", |s| s.blocked_hosts = vec!["x.com".to_string()]);
        let reloader = reloader(&pool, &dir);
        reloader.queue.append("assessment", "other-exam", "refresh").unwrap();
        reloader.poll_once().await.unwrap();
        assert!(worker.blocked_hosts().is_empty());
        assert_eq!(worker.connections().len(), 1);

        reloader.queue.append("assessment", "assessment-1", "refresh").unwrap();
        reloader.poll_once().await.unwrap();
        assert_eq!(worker.blocked_hosts(), vec!["x.com"]);
        assert!(worker.connections().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_from_unchanged_static_sessions_keeps_connections() {
        let dir = Arc::new(StaticDirectory::default());
        let (pool, worker) = start_worker(&dir, session("S", &["a.com"], true)).await;
        let _allowed = worker.connections().register("b.com");

        // Nothing pushed into the directory: the refresh sees the same
        // session and changes nothing.
        let reloader = reloader(&pool, &dir);
        reloader.queue.append("session", "S", "blocklist_changed").unwrap();
        assert_eq!(reloader.poll_once().await.unwrap(), 1);
        assert_eq!(worker.blocked_hosts(), vec!["a.com"]);
        assert_eq!(worker.connections().len(), 1);
        assert_eq!(reloader.queue.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_records_are_consumed() {
        let dir = Arc::new(StaticDirectory::default());
        let (pool, worker) = start_worker(&dir, session("S", &[], true)).await;
        let reloader = reloader(&pool, &dir);

        reloader.queue.append("participant", "S", "refresh").unwrap();
        reloader.queue.append("session", "S", "explode").unwrap();
        reloader.queue.append("session", "", "refresh").unwrap();
        dir.update("S", |s| s.blocked_hosts = vec!["late.com".to_string()]);
        reloader.queue.append("session", "S", "refresh").unwrap();

        assert_eq!(reloader.poll_once().await.unwrap(), 4);
        assert_eq!(reloader.queue.pending_count().unwrap(), 0);
        // The valid record behind the poisoned ones still applied.
        assert_eq!(worker.blocked_hosts(), vec!["late.com"]);
    }

    #[tokio::test]
    async fn test_missing_session_is_consumed() {
        let dir = Arc::new(StaticDirectory::default());
        let (pool, worker) = start_worker(&dir, session("S", &["a.com"], true)).await;
        let reloader = reloader(&pool, &dir);

        let replacement = StaticDirectory::default();
        let reloader = PolicyReloader::new(
            reloader.queue.clone(),
            Arc::clone(&pool),
            Arc::new(replacement),
        );
        reloader.queue.append("session", "S", "refresh").unwrap();
        assert_eq!(reloader.poll_once().await.unwrap(), 1);
        assert_eq!(reloader.queue.pending_count().unwrap(), 0);
        assert_eq!(worker.blocked_hosts(), vec!["a.com"]);
    }

    #[tokio::test]
    async fn test_spawned_poller_applies_within_interval() {
        let dir = Arc::new(StaticDirectory::default());
        let (pool, worker) = start_worker(&dir, session("S", &[], true)).await;
        let reloader = reloader(&pool, &dir);
        let queue = reloader.queue.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_poller(reloader, Duration::from_millis(20), shutdown_rx);

        dir.update("S", |s| s.blocked_hosts = vec!["y.com".to_string()]);
        queue.append("session", "S", "blocklist_changed").unwrap();

        let mut applied = false;
        for _ in 0..100 {
            if worker.blocked_hosts() == vec!["y.com".to_string()] {
                applied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(applied);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
