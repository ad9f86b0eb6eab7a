//! Lifecycle controller.
//!
//! Ties a stop trigger (process signal, or an explicit call when embedded)
//! to the supervisor: start, wait, drain with a bounded timeout, and force
//! close whatever is left if configured to.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::service::Service;
use crate::supervisor::{RegistryStats, ServerError, Supervisor};

/// Grace period for aborted sessions to unwind after a force close.
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// How the drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every session finished within the shutdown timeout.
    Clean,
    /// Sessions were still alive at the deadline.
    TimedOut {
        /// Sessions alive when the timeout expired.
        remaining: usize,
        /// Sessions aborted by the force close (0 if disabled).
        forced: usize,
    },
}

/// Result of a completed shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub outcome: DrainOutcome,
    pub stats: RegistryStats,
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.outcome == DrainOutcome::Clean
    }
}

/// Cloneable trigger that stops a server started with [`Lifecycle::run`].
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Request shutdown. Calling it more than once has no further effect.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Top-level owner of a server instance.
pub struct Lifecycle<S> {
    config: Config,
    service: Arc<S>,
    stop: StopHandle,
}

impl<S: Service> Lifecycle<S> {
    pub fn new(config: Config, service: S) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            config,
            service: Arc::new(service),
            stop: StopHandle { tx: Arc::new(tx) },
        }
    }

    /// Handle for stopping a server driven by [`Lifecycle::run`].
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Start the server and run until a [`StopHandle`] is triggered.
    pub async fn run(self) -> Result<ShutdownReport, ServerError> {
        let stop = self.stop.clone();
        self.run_until(async move {
            // `stop` keeps the sender alive, so `changed` only ends on a send.
            let mut rx = stop.tx.subscribe();
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
    }

    /// Start the server. The returned handle stops it via
    /// [`Running::shutdown`].
    pub async fn start(self) -> Result<Running, ServerError> {
        let supervisor = Supervisor::start(&self.config, self.service).await?;
        info!(address = %supervisor.local_addr(), "Server ready");

        Ok(Running {
            supervisor,
            shutdown_timeout: self.config.shutdown_timeout,
            force_close_on_timeout: self.config.force_close_on_timeout,
        })
    }

    /// Start the server, run until `shutdown` resolves, then drain.
    ///
    /// Only `BindFailed` is returned as an error; a drain timeout is
    /// reported in the [`ShutdownReport`].
    pub async fn run_until<F>(self, shutdown: F) -> Result<ShutdownReport, ServerError>
    where
        F: Future<Output = ()>,
    {
        let running = self.start().await?;
        shutdown.await;
        Ok(running.shutdown().await)
    }
}

/// A started server.
#[derive(Debug)]
pub struct Running {
    supervisor: Supervisor,
    shutdown_timeout: Duration,
    force_close_on_timeout: bool,
}

impl Running {
    pub fn local_addr(&self) -> SocketAddr {
        self.supervisor.local_addr()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Drain the server and report how it went.
    pub async fn shutdown(self) -> ShutdownReport {
        let started = Instant::now();
        info!(
            active = self.supervisor.active_count(),
            timeout_ms = self.shutdown_timeout.as_millis() as u64,
            "Shutdown requested"
        );

        let outcome = match self.supervisor.drain(self.shutdown_timeout).await {
            Ok(()) => DrainOutcome::Clean,
            Err(e) => {
                let remaining = self.supervisor.active_count();
                warn!(error = %e, remaining, "Drain did not complete");

                let forced = if self.force_close_on_timeout {
                    let forced = self.supervisor.force_close();
                    if let Err(e) = self.supervisor.drain(FORCE_CLOSE_GRACE).await {
                        error!(error = %e, "Sessions survived force close");
                    }
                    forced
                } else {
                    0
                };
                DrainOutcome::TimedOut { remaining, forced }
            }
        };

        let report = ShutdownReport {
            outcome,
            stats: self.supervisor.stats(),
            elapsed: started.elapsed(),
        };
        info!(
            outcome = ?report.outcome,
            accepted = report.stats.accepted,
            failed = report.stats.failed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Shutdown complete"
        );
        report
    }
}

/// Resolves when the process receives Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
