//! Length-prefixed frame transport over a single TCP connection.
//!
//! A frame is the smallest on-wire unit: a 4-byte big-endian length followed
//! by that many payload bytes. The channel delivers whole payloads and never
//! splits or merges them; interpretation of the payload (chunk flags, the
//! version handshake) happens one layer up in [`crate::chunk`].

use crate::error::{ProtocolError, WireError, WireResult};
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

const LENGTH_FIELD_SIZE: usize = 4;

/// One master connection carrying length-prefixed frames.
///
/// The stream is decorated with a `BufWriter` so multi-frame messages do not
/// turn into one syscall per primitive write. Reads go through an internal
/// `BytesMut` that accumulates socket data until a full frame is present.
///
/// A channel is owned by the pool and borrowed for exactly one request at a
/// time; nothing here is shared or locked.
#[derive(Debug)]
pub struct Channel {
    stream: BufWriter<TcpStream>,
    read_buf: BytesMut,
    frame_length: u32,
    broken: bool,
}

impl Channel {
    pub fn new(socket: TcpStream, frame_length: u32) -> Channel {
        Channel {
            stream: BufWriter::new(socket),
            read_buf: BytesMut::with_capacity(4 * 1024),
            frame_length,
            broken: false,
        }
    }

    /// Maximum permitted frame payload length, inbound and outbound.
    pub fn frame_length(&self) -> u32 {
        self.frame_length
    }

    /// False once any transport or protocol fault has been observed. The
    /// pool refuses to re-idle a channel that is not alive.
    pub fn is_alive(&self) -> bool {
        !self.broken
    }

    pub(crate) fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Read a single frame payload from the underlying stream.
    ///
    /// Waits until a full frame has been buffered. Data past the frame stays
    /// in the read buffer for the next call. An oversized or zero-length
    /// inbound frame is fatal for the channel.
    pub async fn read_frame(&mut self) -> WireResult<Bytes> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                tracing::trace!(len = frame.len(), "frame in");
                return Ok(frame);
            }

            // `0` means the remote closed the connection. Mid-message that is
            // never clean; the caller is always expecting a frame here.
            let read = self.stream.read_buf(&mut self.read_buf).await;
            let n = match read {
                Ok(n) => n,
                Err(e) => return Err(self.fail_io(e)),
            };
            if n == 0 {
                self.broken = true;
                return Err(WireError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection reset by peer",
                )));
            }
        }
    }

    /// Try to slice one frame out of the read buffer; `None` means more
    /// socket data is needed.
    fn parse_frame(&mut self) -> WireResult<Option<Bytes>> {
        if self.read_buf.len() < LENGTH_FIELD_SIZE {
            return Ok(None);
        }
        let length = u32::from_be_bytes([
            self.read_buf[0],
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
        ]);
        if length == 0 {
            self.broken = true;
            return Err(ProtocolError::ZeroLengthFrame.into());
        }
        if length > self.frame_length {
            self.broken = true;
            return Err(ProtocolError::OversizedFrame {
                length,
                max: self.frame_length,
            }
            .into());
        }
        if self.read_buf.len() < LENGTH_FIELD_SIZE + length as usize {
            return Ok(None);
        }
        self.read_buf.advance(LENGTH_FIELD_SIZE);
        Ok(Some(self.read_buf.split_to(length as usize).freeze()))
    }

    /// Write one frame and flush it to the socket.
    ///
    /// Flushing per frame keeps streamed responses moving: a consumer lazily
    /// pulling a transaction stream must see each emitted chunk without
    /// waiting for the writer's `done()`.
    pub async fn write_frame(&mut self, payload: &[u8]) -> WireResult<()> {
        debug_assert!(
            !payload.is_empty() && payload.len() <= self.frame_length as usize,
            "outbound frame of {} bytes violates the frame length bound",
            payload.len()
        );
        tracing::trace!(len = payload.len(), "frame out");
        let written = async {
            self.stream.write_u32(payload.len() as u32).await?;
            self.stream.write_all(payload).await?;
            self.stream.flush().await
        }
        .await;
        match written {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail_io(e)),
        }
    }

    fn fail_io(&mut self, error: io::Error) -> WireError {
        self.broken = true;
        WireError::Transport(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{bind_listener, connect_channel};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn oversized_inbound_frame_is_fatal() {
        let (listener, addr) = bind_listener().await;

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&2048u32.to_be_bytes()).await.unwrap();
            socket.write_all(&[0u8; 16]).await.unwrap();
            socket
        });

        let mut chan = connect_channel(&addr, 1024).await;
        let err = chan.read_frame().await.unwrap_err();
        assert!(matches!(
            err,
            WireError::Protocol(ProtocolError::OversizedFrame {
                length: 2048,
                max: 1024,
            })
        ));
        assert!(!chan.is_alive());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn zero_length_frame_is_fatal() {
        let (listener, addr) = bind_listener().await;

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&0u32.to_be_bytes()).await.unwrap();
            socket
        });

        let mut chan = connect_channel(&addr, 1024).await;
        assert!(matches!(
            chan.read_frame().await.unwrap_err(),
            WireError::Protocol(ProtocolError::ZeroLengthFrame)
        ));
        assert!(!chan.is_alive());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn peer_close_mid_frame_is_transport_error() {
        let (listener, addr) = bind_listener().await;

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // Announce an 8-byte frame, deliver half of it, hang up.
            socket.write_all(&8u32.to_be_bytes()).await.unwrap();
            socket.write_all(&[0xAA; 4]).await.unwrap();
        });

        let mut chan = connect_channel(&addr, 1024).await;
        assert!(matches!(
            chan.read_frame().await.unwrap_err(),
            WireError::Transport(_)
        ));
        assert!(!chan.is_alive());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn frames_preserve_boundaries() {
        let (listener, addr) = bind_listener().await;

        let server = tokio::spawn(async move {
            let mut chan = connect_channel(&addr, 1024).await;
            chan.write_frame(&[1, 2, 3]).await.unwrap();
            chan.write_frame(&[4]).await.unwrap();
            chan.write_frame(&[5; 100]).await.unwrap();
            chan
        });

        let (socket, _) = listener.accept().await.unwrap();
        let mut chan = Channel::new(socket, 1024);
        assert_eq!(chan.read_frame().await.unwrap().as_ref(), &[1, 2, 3]);
        assert_eq!(chan.read_frame().await.unwrap().as_ref(), &[4]);
        assert_eq!(chan.read_frame().await.unwrap().as_ref(), &[5; 100]);

        server.await.unwrap();
    }
}
