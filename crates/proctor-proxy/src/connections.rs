//! Per-worker table of in-flight relayed connections.
//!
//! Each relayed connection registers its destination host together with a
//! close handle. A blocklist change closes only the connections whose host
//! is affected; everything else keeps relaying.

use crate::filter::{host_matches, normalize_host};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;

/// Identifier of a registered connection, unique within a worker.
pub type ConnectionId = u64;

struct ConnectionEntry {
    host: String,
    close_tx: oneshot::Sender<()>,
}

/// Handle held by the relay task. Resolves when the connection must close.
pub struct CloseSignal {
    pub id: ConnectionId,
    rx: oneshot::Receiver<()>,
}

impl CloseSignal {
    /// Wait until the registry asks this connection to close.
    ///
    /// Never resolves if the entry was dropped without a close request.
    pub async fn closed(self) {
        if self.rx.await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Concurrent map from connection id to destination host and close handle.
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection to `host`.
    pub fn register(&self, host: &str) -> CloseSignal {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (close_tx, rx) = oneshot::channel();
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                ConnectionEntry {
                    host: normalize_host(host),
                    close_tx,
                },
            );
        CloseSignal { id, rx }
    }

    /// Remove a connection that ended on its own.
    pub fn deregister(&self, id: ConnectionId) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Close every connection whose host equals or is a subdomain of one of
    /// `hosts`. Returns how many were closed.
    pub fn close_matching<S: AsRef<str>>(&self, hosts: &[S]) -> usize {
        let targets: Vec<String> = hosts.iter().map(|h| normalize_host(h.as_ref())).collect();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let matching: Vec<ConnectionId> = entries
            .iter()
            .filter(|(_, entry)| targets.iter().any(|t| host_matches(&entry.host, t)))
            .map(|(id, _)| *id)
            .collect();

        for id in &matching {
            if let Some(entry) = entries.remove(id) {
                debug!(connection = id, host = %entry.host, "closing connection");
                let _ = entry.close_tx.send(());
            }
        }
        matching.len()
    }

    /// Close every registered connection.
    pub fn close_all(&self) -> usize {
        let drained: Vec<ConnectionEntry> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.close_tx.send(());
        }
        count
    }

    /// Destination hosts of the registered connections, sorted.
    #[must_use]
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|e| e.host.clone())
            .collect();
        hosts.sort();
        hosts
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
