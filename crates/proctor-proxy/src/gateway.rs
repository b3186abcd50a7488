//! Gateway: handshake listener, port assignment, and lifecycle.
//!
//! The gateway listens on one well-known port. A client sends a single
//! line, `Authorization: Bearer <credential>`, and gets back one of:
//!
//! ```text
//! ASSIGNED_PORT:<n>   worker for the session is listening on port n
//! AUTH_FAILED         unknown or malformed credential
//! ERROR               pool exhausted, worker could not start
//! ```
//!
//! The worker is running before `ASSIGNED_PORT` is written, so the client
//! can connect to it immediately.

use crate::audit;
use crate::blocking::run_blocking;
use crate::config::GatewayConfig;
use crate::directory::SessionDirectory;
use crate::error::{ProxyError, Result};
use crate::lease::LeaseRegistry;
use crate::reload::{self, NotificationQueue, PolicyReloader};
use crate::token;
use crate::worker::{WorkerContext, WorkerPool};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const REPLY_AUTH_FAILED: &str = "AUTH_FAILED\n";
const REPLY_ERROR: &str = "ERROR\n";

/// Handle returned when the gateway starts.
///
/// Call [`GatewayHandle::stop`] to shut the gateway, the poller and every
/// worker down.
pub struct GatewayHandle {
    /// The port the gateway is listening on
    pub port: u16,
    /// Send `true` to trigger graceful shutdown
    shutdown_tx: watch::Sender<bool>,
    pool: Arc<WorkerPool>,
    queue: NotificationQueue,
}

impl GatewayHandle {
    /// Stop accepting handshakes and stop the poller. Running workers are
    /// left alone; see [`GatewayHandle::stop`].
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Shut down the gateway and stop every worker.
    pub async fn stop(&self) {
        self.shutdown();
        self.pool.stop_all().await;
        info!("Gateway stopped");
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// The policy notification queue, for in-process writers.
    #[must_use]
    pub fn notifications(&self) -> &NotificationQueue {
        &self.queue
    }
}

/// Shared state for the gateway accept loop.
struct GatewayState {
    pool: Arc<WorkerPool>,
}

impl GatewayState {
    fn ctx(&self) -> &WorkerContext {
        self.pool.context()
    }
}

/// Start the gateway.
///
/// Closes counting periods left open by a previous run, binds
/// `config.bind_addr:config.gateway_port`, and spawns the handshake accept
/// loop and the policy poller.
pub async fn start(
    config: GatewayConfig,
    directory: Arc<dyn SessionDirectory>,
    registry: LeaseRegistry,
) -> Result<GatewayHandle> {
    config.validate()?;

    let stale = {
        let registry = registry.clone();
        run_blocking(move || registry.deactivate_stale()).await?
    };
    if !stale.is_empty() {
        info!(ports = ?stale, "Closed lease periods left open by a previous run");
    }

    let bind_addr = SocketAddr::new(config.bind_addr, config.gateway_port);
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| ProxyError::Bind {
            addr: bind_addr.to_string(),
            source: e,
        })?;
    let local_addr = listener.local_addr().map_err(|e| ProxyError::Bind {
        addr: bind_addr.to_string(),
        source: e,
    })?;
    let port = local_addr.port();

    info!(
        "Gateway listening on {} (worker ports {}-{})",
        local_addr, config.port_range.start, config.port_range.end
    );

    let connection = registry.connection();
    let queue = run_blocking(move || NotificationQueue::new(connection)).await?;
    let poll_interval = config.poll_interval();
    let pool = Arc::new(WorkerPool::new(Arc::new(WorkerContext {
        config,
        registry,
        directory: Arc::clone(&directory),
    })));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    reload::spawn_poller(
        PolicyReloader::new(queue.clone(), Arc::clone(&pool), directory),
        poll_interval,
        shutdown_rx.clone(),
    );

    let state = Arc::new(GatewayState {
        pool: Arc::clone(&pool),
    });
    tokio::spawn(accept_loop(listener, state, shutdown_rx));

    Ok(GatewayHandle {
        port,
        shutdown_tx,
        pool,
        queue,
    })
}

/// Accept loop: listen for handshakes until shutdown.
async fn accept_loop(
    listener: TcpListener,
    state: Arc<GatewayState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!("Accepted handshake from {}", addr);
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_handshake(stream, &state).await {
                                debug!("Handshake handler error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Gateway shutting down");
                    return;
                }
            }
        }
    }
}

/// Read one handshake line, answer it, close.
async fn handle_handshake(mut stream: TcpStream, state: &GatewayState) -> Result<()> {
    let mut line = String::new();
    let read = {
        let mut reader = BufReader::new(&mut stream).take(token::MAX_HANDSHAKE_LINE as u64);
        tokio::time::timeout(
            state.ctx().config.handshake_timeout(),
            reader.read_line(&mut line),
        )
        .await
    };

    let reply = match read {
        Ok(Ok(_)) => match assign_port(&line, state).await {
            Ok(port) => format!("ASSIGNED_PORT:{}\n", port),
            Err(ProxyError::AuthFailed | ProxyError::Handshake(_)) => REPLY_AUTH_FAILED.to_string(),
            Err(e) => {
                warn!("Port assignment failed: {}", e);
                REPLY_ERROR.to_string()
            }
        },
        Ok(Err(e)) => {
            debug!("Handshake read failed: {}", e);
            REPLY_AUTH_FAILED.to_string()
        }
        Err(_) => {
            debug!("Handshake timed out");
            return Ok(());
        }
    };

    stream.write_all(reply.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Authenticate, lease, and make sure the session's worker runs.
async fn assign_port(line: &str, state: &GatewayState) -> Result<u16> {
    let credential = token::parse_handshake(line)?;

    let directory = Arc::clone(&state.ctx().directory);
    // Lookup failures answer ERROR; only an unknown credential is AUTH_FAILED.
    let session = run_blocking(move || directory.resolve_session(&credential))
        .await?
        .ok_or(ProxyError::AuthFailed)?;

    let registry = state.ctx().registry.clone();
    let session_id = session.session_id.clone();
    let grant = run_blocking(move || registry.get_or_create_lease(&session_id)).await?;

    if let Err(e) = state.pool.ensure_running(grant.port, &session).await {
        let registry = state.ctx().registry.clone();
        let port = grant.port;
        if let Err(release_err) = run_blocking(move || registry.release(port)).await {
            warn!(port = grant.port, "failed to release lease: {}", release_err);
        }
        return Err(e);
    }

    audit::log_assigned(&session.session_id, grant.port, grant.reused);
    Ok(grant.port)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::PortRange;
    use crate::directory::tests::session;
    use crate::directory::StaticDirectory;
    use crate::reload::{NotificationTarget, PolicyAction};
    use crate::worker::tests::free_port;
    use std::time::Duration;

    async fn start_gateway(dir: &Arc<StaticDirectory>, range: PortRange) -> GatewayHandle {
        let config = GatewayConfig {
            gateway_port: 0,
            port_range: range,
            poll_interval_ms: 20,
            activity_write_secs: 0,
            ..Default::default()
        };
        let registry = LeaseRegistry::open_in_memory(range).unwrap();
        start(config, Arc::clone(dir) as Arc<dyn SessionDirectory>, registry)
            .await
            .unwrap()
    }

    async fn handshake(gateway_port: u16, line: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", gateway_port)).await.unwrap();
        stream.write_all(line.as_bytes()).await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        reply
    }

    fn single_port() -> PortRange {
        let port = free_port();
        PortRange {
            start: port,
            end: port,
        }
    }

    #[tokio::test]
    async fn test_unknown_credential_rejected() {
        let dir = Arc::new(StaticDirectory::default());
        dir.upsert("good", session("S", &[], true));
        let gateway = start_gateway(&dir, single_port()).await;

        assert_eq!(
            handshake(gateway.port, "Authorization: Bearer wrong\n").await,
            "AUTH_FAILED\n"
        );
        assert_eq!(
            handshake(gateway.port, "GET / HTTP/1.1\r\n").await,
            "AUTH_FAILED\n"
        );
        assert!(gateway.pool().context().registry.leases().unwrap().is_empty());
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_assigns_and_reuses_port() {
        let dir = Arc::new(StaticDirectory::default());
        dir.upsert("good", session("S", &[], true));
        let range = single_port();
        let gateway = start_gateway(&dir, range).await;

        let expected = format!("ASSIGNED_PORT:{}\n", range.start);
        assert_eq!(
            handshake(gateway.port, "authorization: bearer good\r\n").await,
            expected
        );
        // The worker is already listening.
        TcpStream::connect(("127.0.0.1", range.start)).await.unwrap();

        assert_eq!(
            handshake(gateway.port, "Authorization: Bearer good\n").await,
            expected
        );
        let leases = gateway.pool().context().registry.leases().unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].session_id, "S");
        assert_eq!(gateway.pool().running().await.len(), 1);

        gateway.stop().await;
        assert!(gateway.pool().running().await.is_empty());
    }

    #[tokio::test]
    async fn test_pool_exhausted_returns_error_without_lease() {
        let dir = Arc::new(StaticDirectory::default());
        dir.upsert("first", session("S", &[], true));
        dir.upsert("second", session("T", &[], true));
        let range = single_port();
        let gateway = start_gateway(&dir, range).await;

        assert!(handshake(gateway.port, "Authorization: Bearer first\n")
            .await
            .starts_with("ASSIGNED_PORT:"));
        assert_eq!(
            handshake(gateway.port, "Authorization: Bearer second\n").await,
            "ERROR\n"
        );
        let registry = &gateway.pool().context().registry;
        assert!(registry.lease_for_session("T").unwrap().is_none());
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_returns_error_and_releases() {
        let dir = Arc::new(StaticDirectory::default());
        dir.upsert("good", session("S", &[], true));
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let gateway = start_gateway(&dir, PortRange { start: port, end: port }).await;

        assert_eq!(
            handshake(gateway.port, "Authorization: Bearer good\n").await,
            "ERROR\n"
        );
        let lease = gateway
            .pool()
            .context()
            .registry
            .lease_for_session("S")
            .unwrap()
            .unwrap();
        assert!(!lease.active);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_exhausted_budget_returns_error() {
        let dir = Arc::new(StaticDirectory::default());
        let mut s = session("S", &[], true);
        s.time_budget_secs = Some(60);
        dir.upsert("good", s);
        let range = single_port();
        let gateway = start_gateway(&dir, range).await;
        let registry = gateway.pool().context().registry.clone();

        let grant = registry.get_or_create_lease("S").unwrap();
        registry.release(grant.port).unwrap();
        registry.accumulate(grant.port, 60).unwrap();

        assert_eq!(
            handshake(gateway.port, "Authorization: Bearer good\n").await,
            "ERROR\n"
        );
        assert!(!registry.lease(grant.port).unwrap().unwrap().active);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_notification_reaches_assigned_worker() {
        let dir = Arc::new(StaticDirectory::default());
        dir.upsert("good", session("S", &[], true));
        let range = single_port();
        let gateway = start_gateway(&dir, range).await;
        handshake(gateway.port, "Authorization: Bearer good\n").await;

        dir.update("S", |s| s.blocked_hosts = vec!["exam-cheat.com".to_string()]);
        gateway
            .notifications()
            .notify(
                &NotificationTarget::Session("S".to_string()),
                PolicyAction::BlocklistChanged,
            )
            .unwrap();

        let worker = gateway.pool().get(range.start).await.unwrap();
        let mut applied = false;
        for _ in 0..100 {
            if worker.blocked_hosts() == vec!["exam-cheat.com".to_string()] {
                applied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(applied);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let dir = Arc::new(StaticDirectory::default());
        let range = PortRange {
            start: 9000,
            end: 8000,
        };
        let registry = LeaseRegistry::open_in_memory(PortRange::default()).unwrap();
        let config = GatewayConfig {
            gateway_port: 0,
            port_range: range,
            ..Default::default()
        };
        let err = start(config, dir as Arc<dyn SessionDirectory>, registry)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProxyError::Config(_)));
    }
}
