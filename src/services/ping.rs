//! Ping service.
//!
//! A minimal health check over frames:
//!
//! ```text
//! Request:  PING
//! Response: PONG
//!
//! Request:  PING hello
//! Response: PONG hello
//! ```
//!
//! The command word is case-insensitive. Anything else fails with the
//! reply `ERROR unknown command`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::service::{Service, ServiceError};

/// Parsed ping command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Simple ping (no message).
    Ping,
    /// Ping with a message to echo back.
    PingMsg(Bytes),
}

/// Parse a ping request payload.
pub fn parse(input: &Bytes) -> Option<Command> {
    if input.eq_ignore_ascii_case(b"PING") {
        Some(Command::Ping)
    } else if input.len() > 5 && input[..5].eq_ignore_ascii_case(b"PING ") {
        Some(Command::PingMsg(input.slice(5..)))
    } else {
        None
    }
}

/// Format a PONG response.
pub fn response_pong() -> Bytes {
    Bytes::from_static(b"PONG")
}

/// Format a PONG response with message.
pub fn response_pong_msg(msg: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + msg.len());
    buf.put_slice(b"PONG ");
    buf.put_slice(msg);
    buf.freeze()
}

/// Format an error response.
pub fn response_error() -> Bytes {
    Bytes::from_static(b"ERROR unknown command")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Ping;

impl Service for Ping {
    async fn call(&self, request: Bytes) -> Result<Bytes, ServiceError> {
        match parse(&request) {
            Some(Command::Ping) => Ok(response_pong()),
            Some(Command::PingMsg(msg)) => Ok(response_pong_msg(&msg)),
            None => Err(ServiceError::with_reply(
                "unknown command",
                response_error(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ping() {
        assert_eq!(parse(&Bytes::from_static(b"PING")), Some(Command::Ping));
        assert_eq!(parse(&Bytes::from_static(b"ping")), Some(Command::Ping));
    }

    #[test]
    fn test_parse_ping_msg() {
        match parse(&Bytes::from_static(b"PING hello")) {
            Some(Command::PingMsg(msg)) => assert_eq!(&msg[..], b"hello"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(parse(&Bytes::from_static(b"FOO")), None);
        assert_eq!(parse(&Bytes::from_static(b"PING ")), None);
        assert_eq!(parse(&Bytes::new()), None);
    }

    #[tokio::test]
    async fn test_ping_service() {
        let pong = Ping.call(Bytes::from_static(b"PING")).await.unwrap();
        assert_eq!(&pong[..], b"PONG");

        let pong = Ping.call(Bytes::from_static(b"ping there")).await.unwrap();
        assert_eq!(&pong[..], b"PONG there");

        let err = Ping.call(Bytes::from_static(b"HELLO")).await.unwrap_err();
        assert_eq!(err.reply().map(|b| &b[..]), Some(&b"ERROR unknown command"[..]));
    }
}
