//! Frame client.
//!
//! Connects to a framed server and performs strict request/response
//! exchanges over the same codec the server uses.

use bytes::Bytes;
use std::io;
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::codec::{read_frame, write_frame, FrameError};

/// A client connection speaking the length-prefixed protocol.
#[derive(Debug)]
pub struct FrameClient {
    stream: TcpStream,
    max_frame_size: usize,
}

impl FrameClient {
    /// Connect to `addr`. Frames larger than `max_frame_size` are refused in
    /// both directions.
    pub async fn connect<A: ToSocketAddrs>(addr: A, max_frame_size: usize) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            max_frame_size,
        })
    }

    /// Send one request frame and wait for its response frame.
    pub async fn request(&mut self, payload: &[u8]) -> Result<Bytes, FrameError> {
        self.send(payload).await?;
        self.recv().await
    }

    /// Send one frame without waiting for a response.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        write_frame(&mut self.stream, payload, self.max_frame_size).await
    }

    /// Receive one frame. `StreamClosed` means the server closed the session.
    pub async fn recv(&mut self) -> Result<Bytes, FrameError> {
        read_frame(&mut self.stream, self.max_frame_size).await
    }
}
