//! Listener supervisor.
//!
//! Owns the listening socket, turns accepted connections into supervised
//! sessions, and coordinates collective shutdown.
//!
//! The only state shared between tasks is the session registry: the live
//! session count, the accepting flag, cumulative statistics, and an abort
//! handle per session task for force-close escalation. The supervisor never
//! touches session data itself.

use slab::Slab;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::service::Service;
use crate::session::{Session, SessionId, Settings};

/// Startup and shutdown failures. Per-session errors never reach here.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    BindFailed { addr: String, source: io::Error },

    #[error("drain timed out after {timeout:?} with {remaining} sessions still active")]
    DrainTimeout { remaining: usize, timeout: Duration },
}

/// Snapshot of registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Sessions currently alive.
    pub active: usize,
    /// Sessions created since start.
    pub accepted: u64,
    /// Sessions that have ended, cleanly or not.
    pub closed: u64,
    /// Sessions that ended with an error.
    pub failed: u64,
}

struct RegistryState {
    accepting: bool,
    next_id: u64,
    stats: RegistryStats,
    /// `None` while the task is being spawned outside the lock.
    tasks: Slab<(SessionId, Option<AbortHandle>)>,
    /// Bumped by every `abort_all`.
    abort_epoch: u64,
}

/// Live session accounting shared by the accept loop, session tasks and
/// the drain waiter.
struct Registry {
    state: Mutex<RegistryState>,
    idle: Notify,
}

impl Registry {
    fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                accepting: true,
                next_id: 0,
                stats: RegistryStats::default(),
                tasks: Slab::new(),
                abort_epoch: 0,
            }),
            idle: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // Counters stay consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a session and spawn its task, unless accepting has stopped.
    ///
    /// The count is incremented and the slot reserved under the same lock
    /// that `stop_accepting` takes, so drain never misses a session. The
    /// spawn itself happens unlocked: a runtime that is shutting down drops
    /// the future in place, and the guard's release takes the lock.
    fn spawn_session<F, Fut>(self: &Arc<Self>, make: F) -> Option<SessionId>
    where
        F: FnOnce(SessionId, SessionGuard) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (id, key, epoch) = {
            let mut state = self.lock();
            if !state.accepting {
                return None;
            }

            state.next_id += 1;
            let id = SessionId(state.next_id);
            state.stats.active += 1;
            state.stats.accepted += 1;
            let key = state.tasks.insert((id, None));
            (id, key, state.abort_epoch)
        };

        let guard = SessionGuard {
            registry: Arc::clone(self),
            id,
            key,
            failed: false,
        };
        let handle = tokio::spawn(make(id, guard)).abort_handle();

        let mut state = self.lock();
        let swept = state.abort_epoch != epoch;
        let missed = match state.tasks.get_mut(key) {
            Some((owner, slot)) if *owner == id => {
                *slot = Some(handle);
                None
            }
            // The slot was swept by a force close while we were spawning.
            _ if swept => Some(handle),
            // The task already finished and released its slot.
            _ => None,
        };
        drop(state);

        if let Some(handle) = missed {
            handle.abort();
        }
        Some(id)
    }

    fn release(&self, id: SessionId, key: usize, failed: bool) {
        let mut state = self.lock();
        // The slot may already have been emptied by abort_all and reused.
        if matches!(state.tasks.get(key), Some((owner, _)) if *owner == id) {
            state.tasks.remove(key);
        }
        debug_assert!(state.stats.active > 0, "session released twice");
        state.stats.active = state.stats.active.saturating_sub(1);
        state.stats.closed += 1;
        if failed {
            state.stats.failed += 1;
        }
        let now_idle = state.stats.active == 0;
        drop(state);

        if now_idle {
            self.idle.notify_waiters();
        }
    }

    /// Returns true if this call switched accepting off.
    fn stop_accepting(&self) -> bool {
        std::mem::replace(&mut self.lock().accepting, false)
    }

    fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    fn stats(&self) -> RegistryStats {
        self.lock().stats
    }

    /// Abort every registered task. Slots still being spawned are counted
    /// and aborted by their spawner once it sees the epoch change.
    fn abort_all(&self) -> usize {
        let handles: Vec<_> = {
            let mut state = self.lock();
            state.abort_epoch += 1;
            state.tasks.drain().collect()
        };
        for (_, handle) in &handles {
            if let Some(handle) = handle {
                handle.abort();
            }
        }
        handles.len()
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not lost.
            notified.as_mut().enable();
            if self.lock().stats.active == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Releases a session's registry slot exactly once, on every exit path of
/// its task including abort.
struct SessionGuard {
    registry: Arc<Registry>,
    id: SessionId,
    key: usize,
    failed: bool,
}

impl SessionGuard {
    fn mark_failed(&mut self) {
        self.failed = true;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.release(self.id, self.key, self.failed);
    }
}

/// How the accept loop reacts to an accept error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptDisposition {
    /// Resource pressure or an aborted handshake: back off and retry.
    Retry,
    /// The listener itself is gone.
    Stop,
}

fn classify_accept_error(e: &io::Error) -> AcceptDisposition {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => return AcceptDisposition::Retry,
        _ => {}
    }
    match e.raw_os_error() {
        Some(libc::EBADF) | Some(libc::EINVAL) | Some(libc::ENOTSOCK) => AcceptDisposition::Stop,
        _ => AcceptDisposition::Retry,
    }
}

fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}

/// Supervises the listener and every session it spawned.
pub struct Supervisor {
    local_addr: SocketAddr,
    registry: Arc<Registry>,
    stop_tx: watch::Sender<bool>,
    drain_tx: watch::Sender<bool>,
    listener_closed: watch::Receiver<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Bind the listener and start accepting.
    ///
    /// Fails fast with `BindFailed` if the address is in use or invalid.
    pub async fn start<S: Service>(config: &Config, service: Arc<S>) -> Result<Self, ServerError> {
        let bind_failed = |source: io::Error| ServerError::BindFailed {
            addr: config.listen.clone(),
            source,
        };

        let addr = tokio::net::lookup_host(config.listen.as_str())
            .await
            .map_err(bind_failed)?
            .next()
            .ok_or_else(|| {
                bind_failed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "address resolved to nothing",
                ))
            })?;
        let listener = create_listener(addr, config.backlog).map_err(bind_failed)?;
        let listener = TcpListener::from_std(listener).map_err(bind_failed)?;
        let local_addr = listener.local_addr().map_err(bind_failed)?;

        let registry = Arc::new(Registry::new());
        let (stop_tx, stop_rx) = watch::channel(false);
        let (drain_tx, drain_rx) = watch::channel(false);
        let (closed_tx, listener_closed) = watch::channel(false);

        let accept_loop = AcceptLoop {
            listener,
            registry: Arc::clone(&registry),
            service,
            settings: Arc::new(Settings::from(config)),
            limit: Arc::new(Semaphore::new(config.max_connections)),
            retry_delay: config.accept_retry_delay,
            stop: stop_rx,
            drain: drain_rx,
            closed: closed_tx,
        };
        let accept_task = tokio::spawn(accept_loop.run());

        info!(
            address = %local_addr,
            max_connections = config.max_connections,
            max_frame_size = config.max_frame_size,
            "Supervisor listening"
        );

        Ok(Self {
            local_addr,
            registry,
            stop_tx,
            drain_tx,
            listener_closed,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_count(&self) -> usize {
        self.registry.stats().active
    }

    pub fn is_accepting(&self) -> bool {
        self.registry.is_accepting()
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Stop accepting, close the listener, ask every session to drain, and
    /// wait up to `timeout` for all of them to close.
    ///
    /// Sessions are never killed here; on `DrainTimeout` the caller decides
    /// whether to [`force_close`](Self::force_close). Calling this again is
    /// safe: later calls only wait.
    pub async fn drain(&self, timeout: Duration) -> Result<(), ServerError> {
        if self.registry.stop_accepting() {
            info!(active = self.active_count(), "Draining sessions");
        }

        self.stop_tx.send_replace(true);
        let accept_task = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(error = %e, "Accept loop panicked");
                }
            }
        }
        // Concurrent callers did not get the join handle; they wait here.
        // A closed channel means the accept task is gone, listener included.
        let _ = self.listener_closed.clone().wait_for(|closed| *closed).await;

        self.drain_tx.send_replace(true);

        match tokio::time::timeout(timeout, self.registry.wait_idle()).await {
            Ok(()) => {
                debug!("All sessions closed");
                Ok(())
            }
            Err(_) => Err(ServerError::DrainTimeout {
                remaining: self.active_count(),
                timeout,
            }),
        }
    }

    /// Abort every remaining session task. Returns how many were aborted.
    pub fn force_close(&self) -> usize {
        let aborted = self.registry.abort_all();
        if aborted > 0 {
            warn!(sessions = aborted, "Force-closing sessions");
        }
        aborted
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("local_addr", &self.local_addr)
            .field("stats", &self.stats())
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

struct AcceptLoop<S> {
    listener: TcpListener,
    registry: Arc<Registry>,
    service: Arc<S>,
    settings: Arc<Settings>,
    limit: Arc<Semaphore>,
    retry_delay: Duration,
    stop: watch::Receiver<bool>,
    drain: watch::Receiver<bool>,
    closed: watch::Sender<bool>,
}

impl<S: Service> AcceptLoop<S> {
    async fn run(mut self) {
        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                biased;
                _ = self.stop.changed() => break,
                permit = Arc::clone(&self.limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                biased;
                _ = self.stop.changed() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => match classify_accept_error(&e) {
                    AcceptDisposition::Retry => {
                        if is_resource_exhaustion(&e) {
                            warn!(error = %e, "Accept failed, resources exhausted");
                        } else {
                            debug!(error = %e, "Accept failed, retrying");
                        }
                        drop(permit);
                        tokio::select! {
                            biased;
                            _ = self.stop.changed() => break,
                            _ = tokio::time::sleep(self.retry_delay) => continue,
                        }
                    }
                    AcceptDisposition::Stop => {
                        error!(error = %e, "Listener failed");
                        break;
                    }
                },
            };

            let service = Arc::clone(&self.service);
            let settings = Arc::clone(&self.settings);
            let drain = self.drain.clone();

            let spawned = self.registry.spawn_session(move |id, mut guard| async move {
                let _permit = permit;
                let session = Session::new(id, peer.to_string());
                if let Err(e) = session.run(stream, &*service, &settings, drain).await {
                    guard.mark_failed();
                    warn!(session = %id, peer = %peer, error = %e, "Session failed");
                }
            });

            match spawned {
                Some(id) => debug!(session = %id, peer = %peer, "Accepted connection"),
                None => {
                    debug!(peer = %peer, "Rejected connection, not accepting");
                    break;
                }
            }
        }

        drop(self.listener);
        self.closed.send_replace(true);
        info!("Accept loop stopped");
    }
}

/// Create a non-blocking listening socket.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FrameClient;
    use crate::codec::{FrameError, DEFAULT_MAX_FRAME_SIZE};
    use crate::service::{service_fn, ServiceError};
    use crate::services::Echo;
    use bytes::Bytes;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_config() -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            ..Config::default()
        }
    }

    async fn wait_for_active(supervisor: &Supervisor, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while supervisor.active_count() != expected {
            assert!(
                Instant::now() < deadline,
                "active count stuck at {}, expected {}",
                supervisor.active_count(),
                expected
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_for_stats(supervisor: &Supervisor, done: impl Fn(&RegistryStats) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(&supervisor.stats()) {
            assert!(
                Instant::now() < deadline,
                "stats stuck at {:?}",
                supervisor.stats()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_classify_accept_error() {
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(classify_accept_error(&aborted), AcceptDisposition::Retry);

        let emfile = io::Error::from_raw_os_error(libc::EMFILE);
        assert_eq!(classify_accept_error(&emfile), AcceptDisposition::Retry);
        assert!(is_resource_exhaustion(&emfile));

        let ebadf = io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(classify_accept_error(&ebadf), AcceptDisposition::Stop);
        assert!(!is_resource_exhaustion(&ebadf));
    }

    #[tokio::test]
    async fn test_bind_failed_when_address_in_use() {
        let first = Supervisor::start(&test_config(), Arc::new(Echo)).await.unwrap();

        let config = Config {
            listen: first.local_addr().to_string(),
            ..Config::default()
        };
        match Supervisor::start(&config, Arc::new(Echo)).await {
            Err(ServerError::BindFailed { addr, .. }) => assert_eq!(addr, config.listen),
            other => panic!("unexpected: {:?}", other),
        }

        first.drain(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_resolves_host_name() {
        let config = Config {
            listen: "localhost:0".to_string(),
            ..Config::default()
        };
        let supervisor = Supervisor::start(&config, Arc::new(Echo)).await.unwrap();
        assert!(supervisor.local_addr().ip().is_loopback());
        assert_ne!(supervisor.local_addr().port(), 0);

        supervisor.drain(Duration::from_secs(1)).await.unwrap();
    }

    #[test]
    fn test_spawn_on_stopped_runtime_releases_slot() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let handle = runtime.handle().clone();
        drop(runtime);
        let _enter = handle.enter();

        let registry = Arc::new(Registry::new());
        let id = registry.spawn_session(|_id, _guard| async {});
        assert!(id.is_some());

        let stats = registry.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.closed, 1);
        assert!(registry.lock().tasks.is_empty());
    }

    #[tokio::test]
    async fn test_bind_failed_on_bad_address() {
        let config = Config {
            listen: "not an address".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            Supervisor::start(&config, Arc::new(Echo)).await,
            Err(ServerError::BindFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_ping_pong_rounds() {
        let supervisor = Supervisor::start(&test_config(), Arc::new(Echo)).await.unwrap();
        let mut client = FrameClient::connect(supervisor.local_addr(), DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();

        assert_eq!(&client.request(b"ping").await.unwrap()[..], b"ping");
        assert_eq!(supervisor.active_count(), 1);
        assert_eq!(&client.request(b"pong").await.unwrap()[..], b"pong");

        drop(client);
        wait_for_active(&supervisor, 0).await;

        let stats = supervisor.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_oversized_header_closes_without_reading_payload() {
        let supervisor = Supervisor::start(&test_config(), Arc::new(Echo)).await.unwrap();
        let mut stream = TcpStream::connect(supervisor.local_addr()).await.unwrap();

        stream.write_all(&2_000_000u32.to_be_bytes()).await.unwrap();

        let mut buf = [0u8; 16];
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => {}
            Ok(n) => panic!("unexpected {n} bytes from server"),
        }

        wait_for_active(&supervisor, 0).await;
        assert_eq!(supervisor.stats().failed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_clients() {
        let supervisor = Supervisor::start(&test_config(), Arc::new(Echo)).await.unwrap();
        let addr = supervisor.local_addr();

        let mut clients = Vec::new();
        for seed in 0..50u64 {
            clients.push(tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(seed);
                let mut client = FrameClient::connect(addr, DEFAULT_MAX_FRAME_SIZE)
                    .await
                    .unwrap();
                for _ in 0..10 {
                    let len = rng.random_range(1..=1000);
                    let payload: Vec<u8> = (0..len).map(|_| rng.random()).collect();
                    let reply = client.request(&payload).await.unwrap();
                    assert_eq!(&reply[..], &payload[..]);
                }
                10usize
            }));
        }

        let mut round_trips = 0;
        for client in clients {
            round_trips += client.await.unwrap();
        }
        assert_eq!(round_trips, 500);

        wait_for_active(&supervisor, 0).await;
        let stats = supervisor.stats();
        assert_eq!(stats.accepted, 50);
        assert_eq!(stats.closed, 50);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_idle_timeout_is_isolated() {
        let config = Config {
            idle_timeout: Duration::from_millis(200),
            ..test_config()
        };
        let supervisor = Supervisor::start(&config, Arc::new(Echo)).await.unwrap();

        let mut silent = TcpStream::connect(supervisor.local_addr()).await.unwrap();
        let mut busy = FrameClient::connect(supervisor.local_addr(), DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();

        for i in 0..6u8 {
            assert_eq!(&busy.request(&[i]).await.unwrap()[..], &[i]);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let mut buf = [0u8; 1];
        assert_eq!(silent.read(&mut buf).await.unwrap(), 0);
        assert_eq!(&busy.request(b"still here").await.unwrap()[..], b"still here");
        assert_eq!(supervisor.stats().failed, 0);

        supervisor.drain(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_error_in_one_session_does_not_affect_another() {
        let supervisor = Supervisor::start(&test_config(), Arc::new(Echo)).await.unwrap();

        let mut healthy = FrameClient::connect(supervisor.local_addr(), DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        assert_eq!(&healthy.request(b"one").await.unwrap()[..], b"one");

        let mut broken = TcpStream::connect(supervisor.local_addr()).await.unwrap();
        broken.write_all(b"\x00\x00").await.unwrap();
        broken.shutdown().await.unwrap();
        drop(broken);

        wait_for_stats(&supervisor, |stats| stats.closed == 1).await;
        let stats = supervisor.stats();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.failed, 1);

        assert_eq!(&healthy.request(b"two").await.unwrap()[..], b"two");
        assert_eq!(&healthy.request(b"three").await.unwrap()[..], b"three");
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight_exchanges() {
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);
        let slow = service_fn(move |req: Bytes| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok::<_, ServiceError>(req)
            }
        });
        let supervisor = Supervisor::start(&test_config(), Arc::new(slow)).await.unwrap();

        let mut clients = Vec::new();
        for i in 0..5u8 {
            let mut client = FrameClient::connect(supervisor.local_addr(), DEFAULT_MAX_FRAME_SIZE)
                .await
                .unwrap();
            clients.push(tokio::spawn(async move {
                let reply = client.request(&[i; 8]).await.unwrap();
                assert_eq!(&reply[..], &[i; 8]);
                // The server closes after the drained exchange.
                assert!(client.recv().await.unwrap_err().is_stream_closed());
            }));
        }

        while started.load(Ordering::SeqCst) < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        supervisor.drain(Duration::from_secs(5)).await.unwrap();
        assert_eq!(supervisor.active_count(), 0);
        assert!(!supervisor.is_accepting());

        for client in clients {
            client.await.unwrap();
        }
        assert_eq!(supervisor.stats().failed, 0);
    }

    #[tokio::test]
    async fn test_no_accepts_after_drain() {
        let supervisor = Supervisor::start(&test_config(), Arc::new(Echo)).await.unwrap();
        let addr = supervisor.local_addr();

        supervisor.drain(Duration::from_secs(1)).await.unwrap();
        assert_eq!(supervisor.active_count(), 0);

        match TcpStream::connect(addr).await {
            Err(_) => {}
            Ok(mut stream) => {
                // Nothing may serve a connection that slipped through.
                let mut buf = [0u8; 1];
                let _ = stream.write_all(b"\x00\x00\x00\x01x").await;
                assert!(matches!(stream.read(&mut buf).await, Ok(0) | Err(_)));
            }
        }
        assert_eq!(supervisor.stats().accepted, 0);
    }

    #[tokio::test]
    async fn test_concurrent_drains_both_wait_for_listener_close() {
        let supervisor = Supervisor::start(&test_config(), Arc::new(Echo)).await.unwrap();
        let addr = supervisor.local_addr();

        let drain_then_connect = || async {
            supervisor.drain(Duration::from_secs(1)).await.unwrap();
            TcpStream::connect(addr).await.is_err()
        };
        let (first_refused, second_refused) =
            tokio::join!(drain_then_connect(), drain_then_connect());

        assert!(first_refused);
        assert!(second_refused);
        assert_eq!(supervisor.stats().accepted, 0);
    }

    #[tokio::test]
    async fn test_drain_timeout_then_force_close() {
        let stuck = service_fn(|_req: Bytes| async move {
            std::future::pending::<()>().await;
            Ok::<_, ServiceError>(Bytes::new())
        });
        let supervisor = Supervisor::start(&test_config(), Arc::new(stuck)).await.unwrap();

        let mut client = FrameClient::connect(supervisor.local_addr(), DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        client.send(b"hang").await.unwrap();
        wait_for_active(&supervisor, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let timeout = Duration::from_millis(300);
        let began = Instant::now();
        match supervisor.drain(timeout).await {
            Err(ServerError::DrainTimeout { remaining: 1, .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
        let elapsed = began.elapsed();
        assert!(elapsed >= timeout, "returned early after {elapsed:?}");
        assert!(
            elapsed < timeout + Duration::from_secs(1),
            "returned late after {elapsed:?}"
        );

        assert_eq!(supervisor.force_close(), 1);
        supervisor.drain(Duration::from_secs(1)).await.unwrap();
        assert_eq!(supervisor.active_count(), 0);
        assert!(matches!(
            client.recv().await,
            Err(FrameError::StreamClosed) | Err(FrameError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_drain_is_idempotent() {
        let supervisor = Supervisor::start(&test_config(), Arc::new(Echo)).await.unwrap();
        let mut client = FrameClient::connect(supervisor.local_addr(), DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        client.request(b"hi").await.unwrap();

        supervisor.drain(Duration::from_secs(1)).await.unwrap();
        supervisor.drain(Duration::from_secs(1)).await.unwrap();

        let stats = supervisor.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.closed, 1);
        assert_eq!(supervisor.force_close(), 0);
    }
}
