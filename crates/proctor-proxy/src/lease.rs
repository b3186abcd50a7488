//! Port lease registry backed by `SQLite`.
//!
//! A lease binds one session to one worker port. It is the only state the
//! gateway persists: leases survive deactivation so that reconnecting
//! sessions get their old port back and connected time keeps adding up.
//!
//! # Schema
//!
//! `port_leases(port PK, session_id UNIQUE, active, total_seconds,
//! session_started_at, last_activity_at, sessions_started)`. Timestamps
//! are unix seconds.
//!
//! Every mutation runs inside a `BEGIN IMMEDIATE` transaction, which takes
//! the database write lock before reading. Two registries opened on the
//! same file (two gateway processes) therefore serialise too.

use crate::config::PortRange;
use crate::error::{ProxyError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS port_leases (
    port               INTEGER PRIMARY KEY,
    session_id         TEXT    NOT NULL UNIQUE,
    active             INTEGER NOT NULL DEFAULT 0,
    total_seconds      INTEGER NOT NULL DEFAULT 0,
    session_started_at INTEGER,
    last_activity_at   INTEGER,
    sessions_started   INTEGER NOT NULL DEFAULT 0,
    CHECK (active = 1 OR session_started_at IS NULL)
);
";

const LEASE_COLUMNS: &str = "port, session_id, active, total_seconds, \
                             session_started_at, last_activity_at, sessions_started";

/// How long a writer waits for another process holding the lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A persisted port lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortLease {
    pub port: u16,
    pub session_id: String,
    pub active: bool,
    /// Seconds accumulated by completed counting periods.
    pub total_seconds: u64,
    /// Start of the current counting period; `None` when inactive.
    pub session_started_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Number of counting periods started so far.
    pub sessions_started: u64,
}

impl PortLease {
    /// Connected seconds including the running period, as of `now`.
    #[must_use]
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> u64 {
        self.total_seconds + self.session_started_at.map_or(0, |s| seconds_between(s, now))
    }

    /// Seconds left of `budget`, as of `now`.
    #[must_use]
    pub fn remaining_seconds(&self, budget: u64, now: DateTime<Utc>) -> u64 {
        budget.saturating_sub(self.elapsed_seconds(now))
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            port: row.get(0)?,
            session_id: row.get(1)?,
            active: row.get(2)?,
            total_seconds: to_u64(row.get(3)?),
            session_started_at: row.get::<_, Option<i64>>(4)?.and_then(from_unix),
            last_activity_at: row.get::<_, Option<i64>>(5)?.and_then(from_unix),
            sessions_started: to_u64(row.get(6)?),
        })
    }
}

/// Outcome of [`LeaseRegistry::get_or_create_lease`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub port: u16,
    /// The session already held this port.
    pub reused: bool,
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    to_u64((end - start).num_seconds())
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

/// Durable registry of port leases.
#[derive(Debug, Clone)]
pub struct LeaseRegistry {
    conn: Arc<Mutex<Connection>>,
    range: PortRange,
}

impl LeaseRegistry {
    /// Open (or create) the lease database at `path`.
    pub fn open(path: &Path, range: PortRange) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        Self::with_connection(Arc::new(Mutex::new(conn)), range)
    }

    /// In-memory registry, gone when dropped.
    pub fn open_in_memory(range: PortRange) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(Arc::new(Mutex::new(conn)), range)
    }

    /// Use an already opened connection, creating the schema if needed.
    pub fn with_connection(conn: Arc<Mutex<Connection>>, range: PortRange) -> Result<Self> {
        conn.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .execute_batch(SCHEMA)?;
        Ok(Self { conn, range })
    }

    /// Shared handle to the underlying connection.
    #[must_use]
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    #[must_use]
    pub fn range(&self) -> PortRange {
        self.range
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic elsewhere cannot leave the connection half-written: every
        // mutation is a transaction that rolls back on drop.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the session's port, creating a lease on the lowest free port
    /// if it has none. The lease is active when this returns.
    pub fn get_or_create_lease(&self, session_id: &str) -> Result<LeaseGrant> {
        self.get_or_create_lease_at(session_id, Utc::now())
    }

    pub fn get_or_create_lease_at(&self, session_id: &str, now: DateTime<Utc>) -> Result<LeaseGrant> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<u16> = tx
            .query_row(
                "SELECT port FROM port_leases WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(port) = existing {
            activate_in(&tx, port, now)?;
            tx.commit()?;
            debug!(session = session_id, port = port, "reusing port lease");
            return Ok(LeaseGrant { port, reused: true });
        }

        let port = {
            let mut stmt = tx.prepare(
                "SELECT port FROM port_leases WHERE port BETWEEN ?1 AND ?2 ORDER BY port",
            )?;
            let taken = stmt
                .query_map(params![self.range.start, self.range.end], |row| {
                    row.get::<_, u16>(0)
                })?
                .collect::<rusqlite::Result<Vec<u16>>>()?;
            lowest_free(self.range, &taken)
        };

        let Some(port) = port else {
            // Dropping the transaction rolls it back; nothing was written.
            warn!(session = session_id, "port pool exhausted");
            return Err(ProxyError::PoolExhausted {
                start: self.range.start,
                end: self.range.end,
            });
        };

        tx.execute(
            "INSERT INTO port_leases (port, session_id, active, total_seconds, \
             session_started_at, last_activity_at, sessions_started) \
             VALUES (?1, ?2, 1, 0, ?3, ?3, 1)",
            params![port, session_id, now.timestamp()],
        )?;
        tx.commit()?;

        info!(session = session_id, port = port, "created port lease");
        Ok(LeaseGrant {
            port,
            reused: false,
        })
    }

    /// Start counting time on a lease if it is not counting already.
    ///
    /// Returns true when a new counting period began.
    pub fn activate(&self, port: u16) -> Result<bool> {
        self.activate_at(port, Utc::now())
    }

    pub fn activate_at(&self, port: u16, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let started = activate_in(&tx, port, now)?;
        tx.commit()?;
        Ok(started)
    }

    /// Deactivate a lease, folding the running period into its total.
    ///
    /// The lease row and its port are kept. Returns the seconds added.
    pub fn release(&self, port: u16) -> Result<u64> {
        self.release_at(port, Utc::now())
    }

    pub fn release_at(&self, port: u16, now: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let started: Option<i64> = tx
            .query_row(
                "SELECT session_started_at FROM port_leases WHERE port = ?1",
                params![port],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| ProxyError::LeaseNotFound(format!("port {}", port)))?;

        let added = started
            .and_then(from_unix)
            .map_or(0, |start| seconds_between(start, now));

        tx.execute(
            "UPDATE port_leases SET active = 0, session_started_at = NULL, \
             total_seconds = total_seconds + ?2, last_activity_at = ?3 WHERE port = ?1",
            params![port, to_i64(added), now.timestamp()],
        )?;
        tx.commit()?;

        debug!(port = port, seconds = added, "released port lease");
        Ok(added)
    }

    /// Add seconds to a lease's total directly.
    pub fn accumulate(&self, port: u16, seconds: u64) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = tx.execute(
            "UPDATE port_leases SET total_seconds = total_seconds + ?2 WHERE port = ?1",
            params![port, to_i64(seconds)],
        )?;
        if updated == 0 {
            return Err(ProxyError::LeaseNotFound(format!("port {}", port)));
        }
        tx.commit()?;
        Ok(())
    }

    /// Record activity on a lease. Callers throttle this.
    pub fn mark_activity(&self, port: u16) -> Result<()> {
        self.mark_activity_at(port, Utc::now())
    }

    pub fn mark_activity_at(&self, port: u16, now: DateTime<Utc>) -> Result<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE port_leases SET last_activity_at = ?2 WHERE port = ?1",
            params![port, now.timestamp()],
        )?;
        if updated == 0 {
            return Err(ProxyError::LeaseNotFound(format!("port {}", port)));
        }
        Ok(())
    }

    /// Fetch the lease on `port`.
    pub fn lease(&self, port: u16) -> Result<Option<PortLease>> {
        let conn = self.lock();
        let lease = conn
            .query_row(
                &format!("SELECT {} FROM port_leases WHERE port = ?1", LEASE_COLUMNS),
                params![port],
                PortLease::from_row,
            )
            .optional()?;
        Ok(lease)
    }

    /// Fetch the lease held by a session.
    pub fn lease_for_session(&self, session_id: &str) -> Result<Option<PortLease>> {
        let conn = self.lock();
        let lease = conn
            .query_row(
                &format!(
                    "SELECT {} FROM port_leases WHERE session_id = ?1",
                    LEASE_COLUMNS
                ),
                params![session_id],
                PortLease::from_row,
            )
            .optional()?;
        Ok(lease)
    }

    /// All leases, ordered by port.
    pub fn leases(&self) -> Result<Vec<PortLease>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM port_leases ORDER BY port",
            LEASE_COLUMNS
        ))?;
        let leases = stmt
            .query_map([], PortLease::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(leases)
    }

    /// Delete a session's lease, returning its port to the pool.
    pub fn delete_lease(&self, session_id: &str) -> Result<Option<u16>> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let port: Option<u16> = tx
            .query_row(
                "SELECT port FROM port_leases WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        if port.is_some() {
            tx.execute(
                "DELETE FROM port_leases WHERE session_id = ?1",
                params![session_id],
            )?;
        }
        tx.commit()?;
        if let Some(port) = port {
            info!(session = session_id, port = port, "deleted port lease");
        }
        Ok(port)
    }

    /// Close counting periods left open by a previous process.
    ///
    /// Nobody is connected after a restart, so each open period is closed
    /// at its last recorded activity. Returns the leases touched.
    pub fn deactivate_stale(&self) -> Result<Vec<u16>> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stale = {
            let mut stmt = tx.prepare(
                "SELECT port, session_started_at, last_activity_at FROM port_leases \
                 WHERE active = 1",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, u16>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        for (port, started, last_activity) in &stale {
            let added = match (started, last_activity) {
                (Some(s), Some(l)) => to_u64(l - s),
                _ => 0,
            };
            tx.execute(
                "UPDATE port_leases SET active = 0, session_started_at = NULL, \
                 total_seconds = total_seconds + ?2 WHERE port = ?1",
                params![port, to_i64(added)],
            )?;
        }
        tx.commit()?;

        let ports: Vec<u16> = stale.into_iter().map(|(port, _, _)| port).collect();
        if !ports.is_empty() {
            info!("Deactivated {} lease(s) left active by a previous run", ports.len());
        }
        Ok(ports)
    }
}

/// Mark a lease active, opening a counting period if none is running.
fn activate_in(tx: &rusqlite::Transaction<'_>, port: u16, now: DateTime<Utc>) -> Result<bool> {
    let started: Option<i64> = tx
        .query_row(
            "SELECT session_started_at FROM port_leases WHERE port = ?1",
            params![port],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| ProxyError::LeaseNotFound(format!("port {}", port)))?;

    if started.is_some() {
        tx.execute(
            "UPDATE port_leases SET active = 1, last_activity_at = ?2 WHERE port = ?1",
            params![port, now.timestamp()],
        )?;
        return Ok(false);
    }

    tx.execute(
        "UPDATE port_leases SET active = 1, session_started_at = ?2, last_activity_at = ?2, \
         sessions_started = sessions_started + 1 WHERE port = ?1",
        params![port, now.timestamp()],
    )?;
    Ok(true)
}

/// Lowest port in `range` not present in the sorted `taken` list.
fn lowest_free(range: PortRange, taken: &[u16]) -> Option<u16> {
    let mut candidate = range.start;
    for &port in taken {
        if port > candidate {
            break;
        }
        if port == candidate {
            if candidate == range.end {
                return None;
            }
            candidate += 1;
        }
    }
    (candidate <= range.end).then_some(candidate)
}
