//! Per-port proxy workers.
//!
//! A worker owns one leased port. It accepts client connections, reads
//! the first HTTP line and headers, applies the session blocklist, and
//! either answers `403 Forbidden` or connects upstream and relays.
//!
//! Runtime state (blocklist snapshot, connection table, active-connection
//! counter) lives only in memory and is rebuilt from the lease and a fresh
//! session lookup whenever a worker starts.

use crate::audit;
use crate::audit::RequestKind;
use crate::blocking::run_blocking;
use crate::config::GatewayConfig;
use crate::connect::{self, ProxyRequest};
use crate::connections::ConnectionRegistry;
use crate::directory::{self, Session, SessionDirectory};
use crate::error::{ProxyError, Result};
use crate::filter::BlockFilter;
use crate::lease::LeaseRegistry;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Maximum total size of HTTP headers (64 KiB). Prevents OOM from
/// malicious clients sending unbounded header data.
const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Dependencies shared by the gateway, all workers and the reload poller.
pub struct WorkerContext {
    pub config: GatewayConfig,
    pub registry: LeaseRegistry,
    pub directory: Arc<dyn SessionDirectory>,
}

// ============================================================================
// Session clock
// ============================================================================

#[derive(Debug, Default)]
struct ClockState {
    active: usize,
    stopped: bool,
    last_activity_write: Option<Instant>,
}

/// Active-connection counter driving lease activation.
///
/// The first connection opens a counting period on the lease and the last
/// one to close ends it. The counter and the lease update happen under
/// one lock, so a connection opening while the previous one closes cannot
/// leave the lease inactive with a connection in flight.
///
/// Every method touches SQLite; async callers go through
/// [`run_blocking`].
pub struct SessionClock {
    port: u16,
    session_id: String,
    registry: LeaseRegistry,
    activity_interval: Duration,
    state: Mutex<ClockState>,
}

impl SessionClock {
    #[must_use]
    pub fn new(
        port: u16,
        session_id: &str,
        registry: LeaseRegistry,
        activity_interval: Duration,
    ) -> Self {
        Self {
            port,
            session_id: session_id.to_string(),
            registry,
            activity_interval,
            state: Mutex::new(ClockState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A connection opened.
    pub fn enter(&self) -> Result<()> {
        self.enter_at(Utc::now())
    }

    pub fn enter_at(&self, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock();
        if state.stopped {
            return Err(ProxyError::Shutdown);
        }
        if state.active == 0 {
            self.registry.activate_at(self.port, now)?;
            state.last_activity_write = Some(Instant::now());
        } else {
            self.touch_locked(&mut state);
        }
        state.active += 1;
        Ok(())
    }

    /// A connection closed. Returns the seconds folded into the lease when
    /// this was the last one.
    pub fn leave(&self) -> Option<u64> {
        self.leave_at(Utc::now())
    }

    pub fn leave_at(&self, now: DateTime<Utc>) -> Option<u64> {
        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);
        if state.active > 0 || state.stopped {
            return None;
        }
        self.release_own(now)
    }

    /// Record activity if connections are open and the last write is old.
    pub fn touch(&self) {
        let mut state = self.lock();
        if state.active > 0 && !state.stopped {
            self.touch_locked(&mut state);
        }
    }

    fn touch_locked(&self, state: &mut ClockState) {
        let due = state
            .last_activity_write
            .map_or(true, |at| at.elapsed() >= self.activity_interval);
        if !due {
            return;
        }
        match self.registry.mark_activity(self.port) {
            Ok(()) => state.last_activity_write = Some(Instant::now()),
            Err(e) => debug!(port = self.port, "activity write failed: {}", e),
        }
    }

    /// End a counting period that has no connection behind it.
    ///
    /// The gateway opens a period at handshake time; a client that never
    /// connects would otherwise be charged until it does. Returns the
    /// seconds folded into the lease.
    pub fn settle_idle(&self) -> Result<Option<u64>> {
        let state = self.lock();
        if state.active > 0 || state.stopped {
            return Ok(None);
        }
        let counting = self
            .registry
            .lease(self.port)?
            .is_some_and(|lease| lease.active && lease.session_id == self.session_id);
        if !counting {
            return Ok(None);
        }
        Ok(Some(self.registry.release(self.port)?))
    }

    /// Stop counting for good. Later `leave` calls no longer touch the
    /// lease, which may already belong to a restarted worker.
    pub fn stop(&self) -> Option<u64> {
        let mut state = self.lock();
        if state.stopped {
            return None;
        }
        state.stopped = true;
        self.release_own(Utc::now())
    }

    /// Release the port's lease if it still belongs to this session.
    fn release_own(&self, now: DateTime<Utc>) -> Option<u64> {
        let result = self.registry.lease(self.port).and_then(|lease| match lease {
            Some(lease) if lease.session_id == self.session_id => {
                self.registry.release_at(self.port, now).map(Some)
            }
            _ => Ok(None),
        });
        match result {
            Ok(seconds) => seconds,
            Err(e) => {
                warn!(port = self.port, "failed to release lease: {}", e);
                None
            }
        }
    }

    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.lock().active
    }
}

// ============================================================================
// Worker
// ============================================================================

/// One session's proxy on its leased port.
pub struct Worker {
    port: u16,
    session_id: String,
    assessment_id: String,
    policy: RwLock<BlockFilter>,
    budget_secs: RwLock<Option<u64>>,
    connections: ConnectionRegistry,
    clock: SessionClock,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    /// Owns the listener; the port is free once this task has finished.
    accept_task: Mutex<Option<JoinHandle<()>>>,
    ctx: Arc<WorkerContext>,
}

impl Worker {
    /// Bind the session's port and start accepting connections.
    pub async fn start(ctx: Arc<WorkerContext>, port: u16, session: &Session) -> Result<Arc<Self>> {
        let bind_addr = SocketAddr::new(ctx.config.bind_addr, port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ProxyError::Bind {
                addr: bind_addr.to_string(),
                source: e,
            })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Arc::new(Self {
            port,
            session_id: session.session_id.clone(),
            assessment_id: session.assessment_id.clone(),
            policy: RwLock::new(BlockFilter::new(&session.blocked_hosts)),
            budget_secs: RwLock::new(session.time_budget_secs),
            connections: ConnectionRegistry::new(),
            clock: SessionClock::new(
                port,
                &session.session_id,
                ctx.registry.clone(),
                ctx.config.activity_write_interval(),
            ),
            running: AtomicBool::new(true),
            shutdown_tx,
            accept_task: Mutex::new(None),
            ctx,
        });

        info!(
            session = %worker.session_id,
            port = port,
            blocked = worker.blocked_hosts().len(),
            "Worker listening on {}",
            bind_addr
        );

        let accept = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&worker),
            shutdown_rx.clone(),
        ));
        *worker
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(accept);
        tokio::spawn(budget_loop(Arc::clone(&worker), shutdown_rx));
        Ok(worker)
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn assessment_id(&self) -> &str {
        &self.assessment_id
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.clock.active_connections()
    }

    /// Current blocklist snapshot, normalised and sorted.
    #[must_use]
    pub fn blocked_hosts(&self) -> Vec<String> {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries()
            .map(str::to_string)
            .collect()
    }

    fn check_host(&self, host: &str) -> crate::filter::FilterResult {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .check_host(host)
    }

    /// Replace the blocklist and close connections to changed hosts.
    ///
    /// Returns the number of connections closed. An identical list is a
    /// no-op.
    pub fn apply_new_blocklist<S: AsRef<str>>(&self, hosts: &[S]) -> usize {
        let new = BlockFilter::new(hosts);
        let changed = {
            let mut policy = self.policy.write().unwrap_or_else(PoisonError::into_inner);
            if *policy == new {
                debug!(session = %self.session_id, "blocklist unchanged");
                return 0;
            }
            let changed = policy.symmetric_difference(&new);
            *policy = new;
            changed
        };
        let closed = self.connections.close_matching(&changed);
        audit::log_policy_applied(&self.session_id, &changed, closed);
        closed
    }

    /// Take a fresh session snapshot: blocklist and time budget.
    pub fn apply_session(&self, session: &Session) -> usize {
        *self
            .budget_secs
            .write()
            .unwrap_or_else(PoisonError::into_inner) = session.time_budget_secs;
        self.apply_new_blocklist(&session.blocked_hosts)
    }

    /// Seconds of budget left, `None` when unlimited.
    pub fn remaining_budget(&self) -> Result<Option<u64>> {
        let budget = *self
            .budget_secs
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(budget) = budget else {
            return Ok(None);
        };
        let lease = self
            .ctx
            .registry
            .lease(self.port)?
            .ok_or_else(|| ProxyError::LeaseNotFound(format!("port {}", self.port)))?;
        Ok(Some(lease.remaining_seconds(budget, Utc::now())))
    }

    /// Refresh the session and report whether its budget is used up.
    ///
    /// A counting period left open with no connection (a handshake whose
    /// client never connected) is closed first.
    pub async fn check_budget(self: &Arc<Self>) -> Result<bool> {
        let directory = Arc::clone(&self.ctx.directory);
        let session_id = self.session_id.clone();
        let session = run_blocking(move || directory.fetch_session(&session_id)).await?;
        match session {
            Some(session) => {
                self.apply_session(&session);
            }
            None => {
                warn!(session = %self.session_id, "session no longer exists");
                return Ok(true);
            }
        }

        let worker = Arc::clone(self);
        let (settled, remaining) = run_blocking(move || {
            worker.clock.touch();
            let settled = worker.clock.settle_idle()?;
            Ok((settled, worker.remaining_budget()?))
        })
        .await?;
        if let Some(seconds) = settled {
            debug!(session = %self.session_id, seconds = seconds, "closed idle lease period");
            self.report_seconds(seconds);
        }
        Ok(remaining == Some(0))
    }

    /// Stop accepting, force-close in-flight connections, end the lease's
    /// counting period.
    ///
    /// Returns once the listener is closed, so the port can be bound again
    /// immediately.
    pub async fn stop(self: &Arc<Self>) {
        if self.running.swap(false, Ordering::AcqRel) {
            let _ = self.shutdown_tx.send(true);
            let closed = self.connections.close_all();
            let worker = Arc::clone(self);
            match run_blocking(move || Ok(worker.clock.stop())).await {
                Ok(Some(seconds)) => self.report_seconds(seconds),
                Ok(None) => {}
                Err(e) => warn!(session = %self.session_id, "failed to end lease period: {}", e),
            }
            info!(session = %self.session_id, port = self.port, closed = closed, "Worker stopped");
        }

        let accept = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = accept {
            if let Err(e) = task.await {
                warn!(port = self.port, "accept loop ended abnormally: {}", e);
            }
        }
    }

    fn report_seconds(&self, seconds: u64) {
        if seconds == 0 {
            return;
        }
        let directory = Arc::clone(&self.ctx.directory);
        let session_id = self.session_id.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = directory.accumulate_session_seconds(&session_id, seconds) {
                warn!(session = %session_id, seconds = seconds, "failed to report session time: {}", e);
            }
        });
    }
}

/// Accept loop: listen for connections until shutdown.
async fn accept_loop(
    listener: TcpListener,
    worker: Arc<Worker>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(port = worker.port, "Accepted connection from {}", addr);
                        let worker = Arc::clone(&worker);
                        tokio::spawn(async move {
                            serve_client(stream, &worker).await;
                        });
                    }
                    Err(e) => {
                        warn!(port = worker.port, "Accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!(port = worker.port, "Accept loop shutting down");
                    return;
                }
            }
        }
    }
}

/// Budget timer: stops the worker once the session's time is used up.
async fn budget_loop(worker: Arc<Worker>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(worker.ctx.config.budget_check_interval());
    // The first tick completes immediately; the gateway checked the budget
    // before starting us.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match worker.check_budget().await {
                    Ok(true) => {
                        info!(session = %worker.session_id, "Time budget exhausted");
                        worker.stop().await;
                        return;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(session = %worker.session_id, "Budget check failed: {}", e),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

/// Count the connection against the lease around the actual handling.
async fn serve_client(mut stream: TcpStream, worker: &Arc<Worker>) {
    let clock_owner = Arc::clone(worker);
    if let Err(e) = run_blocking(move || clock_owner.clock.enter()).await {
        debug!(port = worker.port, "Refusing connection: {}", e);
        let _ = connect::send_error(&mut stream, 503, "Service Unavailable").await;
        return;
    }
    if let Err(e) = handle_connection(stream, worker).await {
        debug!(port = worker.port, "Connection handler error: {}", e);
    }
    let clock_owner = Arc::clone(worker);
    match run_blocking(move || Ok(clock_owner.clock.leave())).await {
        Ok(Some(seconds)) => worker.report_seconds(seconds),
        Ok(None) => {}
        Err(e) => warn!(port = worker.port, "failed to end connection: {}", e),
    }
}

/// Handle a single client connection.
async fn handle_connection(mut stream: TcpStream, worker: &Arc<Worker>) -> Result<()> {
    // Keep the BufReader alive until the full header is consumed so no
    // read-ahead bytes are lost; they are forwarded upstream afterwards.
    let mut buf_reader = BufReader::new(&mut stream);
    let mut first_line = String::new();
    buf_reader.read_line(&mut first_line).await?;

    if first_line.is_empty() {
        return Ok(()); // Client disconnected
    }

    let mut head = first_line.clone().into_bytes();
    loop {
        let mut line = String::new();
        let n = buf_reader.read_line(&mut line).await?;
        head.extend_from_slice(line.as_bytes());
        if n == 0 || line.trim().is_empty() {
            break;
        }
        if head.len() > MAX_HEADER_SIZE {
            drop(buf_reader);
            connect::send_error(&mut stream, 431, "Request Header Fields Too Large").await?;
            return Ok(());
        }
    }

    let buffered = buf_reader.buffer().to_vec();
    drop(buf_reader);

    let request = match connect::parse_request_line(first_line.trim_end()) {
        Ok(request) => request,
        Err(e) => {
            connect::send_error(&mut stream, 400, "Bad Request").await?;
            return Err(e);
        }
    };

    if let Err(e) = enforce_policy(&request, worker) {
        connect::send_error(&mut stream, 403, "Forbidden").await?;
        return Err(e);
    }

    let mut upstream = match connect::connect_upstream(
        &request.host,
        request.port,
        worker.ctx.config.upstream_connect_timeout(),
    )
    .await
    {
        Ok(upstream) => upstream,
        Err(e) => {
            connect::send_error(&mut stream, 502, "Bad Gateway").await?;
            return Err(e);
        }
    };

    let signal = worker.connections.register(&request.host);
    let id = signal.id;

    // The blocklist may have changed while we were connecting.
    if let Err(e) = enforce_policy(&request, worker) {
        worker.connections.deregister(id);
        connect::send_error(&mut stream, 403, "Forbidden").await?;
        return Err(e);
    }

    let forwarded = match request.kind {
        RequestKind::Connect => {
            connect::send_established(&mut stream).await?;
            Ok(())
        }
        RequestKind::Http => upstream.write_all(&head).await,
    };
    let forwarded = match forwarded {
        Ok(()) if !buffered.is_empty() => upstream.write_all(&buffered).await,
        other => other,
    };
    if let Err(e) = forwarded {
        worker.connections.deregister(id);
        return Err(e.into());
    }

    audit::log_allowed(
        &worker.session_id,
        request.kind,
        &request.host,
        request.port,
        &request.method,
    );

    let end = connect::relay(stream, upstream, signal).await;
    worker.connections.deregister(id);
    debug!(
        session = %worker.session_id,
        host = %request.host,
        "Relay for {} ended: {:?}",
        request.target(),
        end
    );
    Ok(())
}

/// Block the request if the session policy covers its host.
fn enforce_policy(request: &ProxyRequest, worker: &Worker) -> Result<()> {
    let check = worker.check_host(&request.host);
    if check.is_allowed() {
        return Ok(());
    }
    let reason = check.reason();
    audit::log_blocked(
        &worker.session_id,
        request.kind,
        &request.host,
        request.port,
        &reason,
    );
    directory::spawn_violation_log(
        Arc::clone(&worker.ctx.directory),
        worker.session_id.clone(),
        format!("Blocked URL: {}", request.target()),
    );
    Err(ProxyError::HostBlocked {
        host: request.host.clone(),
        reason,
    })
}

// ============================================================================
// Worker pool
// ============================================================================

/// Live workers indexed by port.
pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
    workers: tokio::sync::Mutex<HashMap<u16, Arc<Worker>>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self {
            ctx,
            workers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn context(&self) -> &Arc<WorkerContext> {
        &self.ctx
    }

    /// Return the running worker for `port`, starting one if needed.
    ///
    /// A running worker takes the fresh session snapshot. A new worker is
    /// refused when the session's budget is already used up.
    pub async fn ensure_running(&self, port: u16, session: &Session) -> Result<Arc<Worker>> {
        let mut workers = self.workers.lock().await;

        if let Some(worker) = workers.get(&port).cloned() {
            if worker.is_running() && worker.session_id() == session.session_id {
                worker.apply_session(session);
                return Ok(worker);
            }
            // The port changed hands or the worker stopped; its listener
            // must be gone before the port is bound again.
            worker.stop().await;
            workers.remove(&port);
        }

        if let Some(budget) = session.time_budget_secs {
            let registry = self.ctx.registry.clone();
            let session_id = session.session_id.clone();
            run_blocking(move || {
                let lease = registry
                    .lease(port)?
                    .ok_or_else(|| ProxyError::LeaseNotFound(format!("port {}", port)))?;
                if lease.remaining_seconds(budget, Utc::now()) == 0 {
                    registry.release(port)?;
                    return Err(ProxyError::BudgetExhausted { session_id });
                }
                Ok(())
            })
            .await?;
        }

        let worker = Worker::start(Arc::clone(&self.ctx), port, session).await?;
        workers.insert(port, Arc::clone(&worker));
        Ok(worker)
    }

    pub async fn get(&self, port: u16) -> Option<Arc<Worker>> {
        self.workers
            .lock()
            .await
            .get(&port)
            .filter(|w| w.is_running())
            .cloned()
    }

    /// Running workers.
    ///
    /// Stopped workers stay in the pool until their port is reused or the
    /// pool stops, which is when their listener gets awaited.
    pub async fn running(&self) -> Vec<Arc<Worker>> {
        self.workers
            .lock()
            .await
            .values()
            .filter(|w| w.is_running())
            .cloned()
            .collect()
    }

    pub async fn for_session(&self, session_id: &str) -> Vec<Arc<Worker>> {
        self.running()
            .await
            .into_iter()
            .filter(|w| w.session_id() == session_id)
            .collect()
    }

    pub async fn for_assessment(&self, assessment_id: &str) -> Vec<Arc<Worker>> {
        self.running()
            .await
            .into_iter()
            .filter(|w| w.assessment_id() == assessment_id)
            .collect()
    }

    /// Stop every worker.
    pub async fn stop_all(&self) {
        let mut workers = self.workers.lock().await;
        for worker in workers.values() {
            worker.stop().await;
        }
        workers.clear();
    }
}
