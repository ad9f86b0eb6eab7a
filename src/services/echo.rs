//! Echo service.
//!
//! Returns each request payload unchanged. Useful for throughput testing
//! and for validating data integrity end to end.

use bytes::Bytes;

use crate::service::{Service, ServiceError};

#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

impl Service for Echo {
    async fn call(&self, request: Bytes) -> Result<Bytes, ServiceError> {
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo() {
        let response = Echo.call(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(&response[..], b"ping");

        let response = Echo.call(Bytes::new()).await.unwrap();
        assert!(response.is_empty());
    }
}
