//! Built-in services.
//!
//! - `echo`: returns every payload unchanged (default)
//! - `ping`: health check, answers `PING` with `PONG`
//!
//! Embedders supply their own [`Service`](crate::Service) instead.

pub mod echo;
pub mod ping;

pub use echo::Echo;
pub use ping::Ping;

use bytes::Bytes;

use crate::config::ServiceKind;
use crate::service::{Service, ServiceError};

/// Service selected from configuration.
#[derive(Debug, Clone, Copy)]
pub enum Builtin {
    Echo(Echo),
    Ping(Ping),
}

impl From<ServiceKind> for Builtin {
    fn from(kind: ServiceKind) -> Self {
        match kind {
            ServiceKind::Echo => Builtin::Echo(Echo),
            ServiceKind::Ping => Builtin::Ping(Ping),
        }
    }
}

impl Service for Builtin {
    async fn call(&self, request: Bytes) -> Result<Bytes, ServiceError> {
        match self {
            Builtin::Echo(echo) => echo.call(request).await,
            Builtin::Ping(ping) => ping.call(request).await,
        }
    }
}
