//! Connection handler: drives one session from accept to close.
//!
//! Each session is owned by exactly one task and walks a small state
//! machine:
//!
//! ```text
//!            drain signal
//!   Open ───────────────────► Draining
//!     │                          │
//!     │ peer close, idle,        │ current exchange done
//!     │ error                    │
//!     ▼                          ▼
//!   Closed ◄─────────────────────┘
//! ```
//!
//! Frames are handled strictly in arrival order: a response is fully
//! written before the next frame is read.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use crate::codec::{read_frame, write_frame, FrameError};
use crate::config::{Config, OnServiceError};
use crate::service::{Service, ServiceError};

/// Process-unique session identifier, assigned in accept order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub(crate) u64);

impl SessionId {
    /// Wrap a raw id. The supervisor assigns ids itself; this is for
    /// callers driving [`Session::run`] directly.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Current state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Reading frames and producing responses.
    Open,
    /// Shutdown requested; no new frames are waited for.
    Draining,
    /// Socket closed and resources released.
    Closed,
}

/// Why a session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly close by the peer between frames.
    PeerClosed,
    /// No frame started within the idle timeout.
    IdleTimeout,
    /// Server shutdown.
    Drained,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::Drained => write!(f, "drained"),
        }
    }
}

/// Errors that end a session abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("frame not completed within {0:?}")]
    ReadTimeout(Duration),

    #[error("response not written within {0:?}")]
    WriteTimeout(Duration),

    #[error("service error: {0}")]
    Service(#[from] ServiceError),
}

/// Per-session limits and deadlines, resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub max_frame_size: usize,
    /// Maximum wait for the next frame to start.
    pub idle_timeout: Duration,
    /// Maximum time to receive the rest of a frame once it started.
    pub read_timeout: Duration,
    /// Maximum time to write one response frame.
    pub write_timeout: Duration,
    pub on_service_error: OnServiceError,
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
            idle_timeout: config.idle_timeout,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            on_service_error: config.on_service_error,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Final accounting for a session that closed cleanly.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: SessionId,
    pub remote_addr: String,
    pub reason: CloseReason,
    pub state: SessionState,
    pub frames_in: u64,
    pub frames_out: u64,
}

/// State for one accepted connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    remote_addr: String,
    state: SessionState,
    accepted_at: DateTime<Utc>,
    last_activity: Instant,
    frames_in: u64,
    frames_out: u64,
}

impl Session {
    pub fn new(id: SessionId, remote_addr: impl Into<String>) -> Self {
        Self {
            id,
            remote_addr: remote_addr.into(),
            state: SessionState::Open,
            accepted_at: Utc::now(),
            last_activity: Instant::now(),
            frames_in: 0,
            frames_out: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the read-dispatch-write loop until the session closes.
    ///
    /// Drain requests are honoured only between exchanges: a frame that
    /// has started arriving is read, answered, and written first.
    pub async fn run<IO, S>(
        mut self,
        stream: IO,
        service: &S,
        settings: &Settings,
        mut drain: watch::Receiver<bool>,
    ) -> Result<SessionSummary, SessionError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
        S: Service,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);

        debug!(
            session = %self.id,
            peer = %self.remote_addr,
            "Session opened"
        );

        let result = self
            .serve(&mut reader, &mut writer, service, settings, &mut drain)
            .await;
        self.state = SessionState::Closed;

        let lifetime_ms = (Utc::now() - self.accepted_at).num_milliseconds();
        match &result {
            Ok(reason) => debug!(
                session = %self.id,
                peer = %self.remote_addr,
                reason = %reason,
                frames_in = self.frames_in,
                frames_out = self.frames_out,
                lifetime_ms,
                "Session closed"
            ),
            Err(e) => debug!(
                session = %self.id,
                peer = %self.remote_addr,
                error = %e,
                frames_in = self.frames_in,
                frames_out = self.frames_out,
                lifetime_ms,
                "Session closed with error"
            ),
        }

        result.map(|reason| SessionSummary {
            id: self.id,
            remote_addr: self.remote_addr,
            reason,
            state: self.state,
            frames_in: self.frames_in,
            frames_out: self.frames_out,
        })
    }

    async fn serve<R, W, S>(
        &mut self,
        reader: &mut BufReader<R>,
        writer: &mut W,
        service: &S,
        settings: &Settings,
        drain: &mut watch::Receiver<bool>,
    ) -> Result<CloseReason, SessionError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
        S: Service,
    {
        loop {
            if let Some(reason) = self.await_next_frame(reader, settings, drain).await? {
                return Ok(reason);
            }

            let payload = match timeout(
                settings.read_timeout,
                read_frame(reader, settings.max_frame_size),
            )
            .await
            {
                Ok(Ok(payload)) => payload,
                Ok(Err(FrameError::StreamClosed)) => return Ok(CloseReason::PeerClosed),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(SessionError::ReadTimeout(settings.read_timeout)),
            };
            self.touch();
            self.frames_in += 1;
            trace!(session = %self.id, len = payload.len(), "Frame received");

            let response = match service.call(payload).await {
                Ok(response) => response,
                Err(e) => self.error_reply(e, settings)?,
            };

            match timeout(
                settings.write_timeout,
                write_frame(writer, &response, settings.max_frame_size),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(SessionError::WriteTimeout(settings.write_timeout)),
            }
            self.touch();
            self.frames_out += 1;
        }
    }

    /// Wait until the next frame starts arriving.
    ///
    /// Returns `Some(reason)` when the session should close instead.
    async fn await_next_frame<R>(
        &mut self,
        reader: &mut BufReader<R>,
        settings: &Settings,
        drain: &mut watch::Receiver<bool>,
    ) -> Result<Option<CloseReason>, SessionError>
    where
        R: AsyncRead + Unpin,
    {
        // Bytes already buffered belong to a frame the peer sent earlier.
        if !reader.buffer().is_empty() {
            return Ok(None);
        }
        if *drain.borrow_and_update() {
            return Ok(Some(self.begin_drain()));
        }

        tokio::select! {
            biased;
            filled = async { reader.fill_buf().await.map(|buf| buf.is_empty()) } => {
                match filled {
                    Ok(true) => {
                        trace!(session = %self.id, "Connection closed by peer");
                        Ok(Some(CloseReason::PeerClosed))
                    }
                    Ok(false) => Ok(None),
                    Err(e) => Err(FrameError::Io(e).into()),
                }
            }
            // A dropped sender means the supervisor is gone; treat it as drain.
            _ = drain.changed() => Ok(Some(self.begin_drain())),
            _ = tokio::time::sleep(settings.idle_timeout) => {
                debug!(
                    session = %self.id,
                    idle_ms = self.last_activity.elapsed().as_millis() as u64,
                    "Idle timeout"
                );
                Ok(Some(CloseReason::IdleTimeout))
            }
        }
    }

    /// Apply the service-error policy: either a reply to send, or the
    /// error that closes the session.
    fn error_reply(&self, e: ServiceError, settings: &Settings) -> Result<Bytes, SessionError> {
        match (settings.on_service_error, e.reply()) {
            (OnServiceError::Respond, Some(reply)) => {
                debug!(session = %self.id, error = %e, "Service error, sending reply");
                Ok(reply.clone())
            }
            _ => Err(SessionError::Service(e)),
        }
    }

    fn begin_drain(&mut self) -> CloseReason {
        self.state = SessionState::Draining;
        trace!(session = %self.id, "Session draining");
        CloseReason::Drained
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}
