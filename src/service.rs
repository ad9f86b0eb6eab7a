//! Application service seam.
//!
//! A [`Service`] turns one request payload into one response payload. The
//! session invokes it exactly once per received frame and writes the response
//! before reading the next frame. Services own their internal timeouts; a
//! call that never completes holds its session open until the server force
//! closes it.

use bytes::Bytes;
use std::future::Future;
use thiserror::Error;

/// Request/response handler invoked for every frame.
pub trait Service: Send + Sync + 'static {
    /// Produce the response for one request payload.
    fn call(&self, request: Bytes) -> impl Future<Output = Result<Bytes, ServiceError>> + Send;
}

/// Failure returned by a [`Service`].
///
/// The optional reply is the service's own error frame. It is only sent when
/// the server runs with `on_service_error = respond`.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ServiceError {
    message: String,
    reply: Option<Bytes>,
}

impl ServiceError {
    /// Failure without an error reply; the session is always closed.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            reply: None,
        }
    }

    /// Failure carrying a reply payload to send back to the peer.
    pub fn with_reply(message: impl Into<String>, reply: impl Into<Bytes>) -> Self {
        Self {
            message: message.into(),
            reply: Some(reply.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn reply(&self) -> Option<&Bytes> {
        self.reply.as_ref()
    }
}

/// Service backed by an async closure. Built with [`service_fn`].
#[derive(Debug, Clone)]
pub struct ServiceFn<F> {
    f: F,
}

/// Wrap an async closure as a [`Service`].
///
/// ```ignore
/// let upper = service_fn(|req: Bytes| async move {
///     Ok(Bytes::from(req.to_ascii_uppercase()))
/// });
/// ```
pub fn service_fn<F, Fut>(f: F) -> ServiceFn<F>
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, ServiceError>> + Send,
{
    ServiceFn { f }
}

impl<F, Fut> Service for ServiceFn<F>
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, ServiceError>> + Send,
{
    fn call(&self, request: Bytes) -> impl Future<Output = Result<Bytes, ServiceError>> + Send {
        (self.f)(request)
    }
}
