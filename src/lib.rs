//! framed-server: a length-prefixed framed TCP server core.
//!
//! Layers, leaf first:
//! - `codec`: 4-byte big-endian length + payload frames
//! - `session`: per-connection read-dispatch-write loop
//! - `supervisor`: listener, session registry, drain
//! - `lifecycle`: start, wait for a stop trigger, drain, escalate
//!
//! Applications plug in through the [`Service`] trait. The `services`
//! module holds the built-in echo and ping services used by the binary.

pub mod client;
pub mod codec;
pub mod config;
pub mod lifecycle;
pub mod service;
pub mod services;
pub mod session;
pub mod supervisor;

pub use client::FrameClient;
pub use codec::{encode_frame, read_frame, write_frame, FrameError, DEFAULT_MAX_FRAME_SIZE};
pub use config::{Config, ConfigError};
pub use lifecycle::{
    shutdown_signal, DrainOutcome, Lifecycle, Running, ShutdownReport, StopHandle,
};
pub use service::{service_fn, Service, ServiceError};
pub use session::{CloseReason, Session, SessionError, SessionId, SessionState, Settings};
pub use supervisor::{RegistryStats, ServerError, Supervisor};
