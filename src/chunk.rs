//! Chunked logical messages over framed channels.
//!
//! A logical message is split across one or more frames. Each frame payload
//! starts with a one-byte continuation flag; the very first frame of a
//! message additionally carries the two protocol version bytes ahead of the
//! flag. [`ChunkWriter`] spills an intermediate frame whenever its buffer
//! reaches the frame length and terminates the message with `done()`;
//! [`ChunkReader`] reassembles the message and exposes blocking-style typed
//! reads over it.

use crate::channel::Channel;
use crate::error::{ProtocolError, WireError, WireResult};
use crate::types::ProtocolVersion;
use bytes::{Buf, BytesMut};
use num_enum::TryFromPrimitive;
use std::time::Duration;
use tokio::time;

/// Continuation flag carried as a prefix of every chunk.
#[derive(TryFromPrimitive)]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkFlag {
    /// More chunks of this message follow.
    More = 0x00,
    /// Last chunk of this message.
    Last = 0x01,
}

/// Bytes the first chunk of a message spends on the version handshake.
const HANDSHAKE_SIZE: usize = 2;
const FLAG_SIZE: usize = 1;

/// Writes one logical message as a sequence of chunks.
///
/// The writer borrows the channel exclusively for the lifetime of the
/// message, so frames of different messages can never interleave. Space for
/// the handshake and flag bytes is reserved up front in the buffer; flag
/// bytes are patched in when a chunk is emitted.
///
/// `done()` consumes the writer, so the final chunk is emitted exactly once.
pub struct ChunkWriter<'a> {
    chan: &'a mut Channel,
    buf: &'a mut BytesMut,
    flag_at: usize,
    wrote_data: bool,
}

impl<'a> ChunkWriter<'a> {
    pub fn new(chan: &'a mut Channel, buf: &'a mut BytesMut, versions: ProtocolVersion) -> Self {
        buf.clear();
        buf.extend_from_slice(&[versions.internal, versions.application, ChunkFlag::More as u8]);
        Self {
            chan,
            buf,
            flag_at: HANDSHAKE_SIZE,
            wrote_data: false,
        }
    }

    pub async fn write_u8(&mut self, value: u8) -> WireResult<()> {
        self.write_bytes(&[value]).await
    }

    pub async fn write_u32(&mut self, value: u32) -> WireResult<()> {
        self.write_bytes(&value.to_be_bytes()).await
    }

    pub async fn write_i32(&mut self, value: i32) -> WireResult<()> {
        self.write_bytes(&value.to_be_bytes()).await
    }

    pub async fn write_i64(&mut self, value: i64) -> WireResult<()> {
        self.write_bytes(&value.to_be_bytes()).await
    }

    pub async fn write_u64(&mut self, value: u64) -> WireResult<()> {
        self.write_bytes(&value.to_be_bytes()).await
    }

    /// Length-prefixed UTF-8 string: `u32` byte count, then the bytes.
    pub async fn write_string(&mut self, value: &str) -> WireResult<()> {
        self.write_u32(value.len() as u32).await?;
        self.write_bytes(value.as_bytes()).await
    }

    pub async fn write_bytes(&mut self, mut data: &[u8]) -> WireResult<()> {
        let cap = self.chan.frame_length() as usize;
        while !data.is_empty() {
            if self.buf.len() == cap {
                self.emit(ChunkFlag::More).await?;
            }
            let n = (cap - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..n]);
            data = &data[n..];
            self.wrote_data = true;
        }
        Ok(())
    }

    /// Push the partially-filled chunk to the wire as an intermediate frame.
    ///
    /// Streaming producers use this to make written data visible to a
    /// lazily-pulling consumer before the message is finished. A no-op when
    /// the current chunk holds no data yet.
    pub async fn flush_chunk(&mut self) -> WireResult<()> {
        if self.buf.len() > self.flag_at + FLAG_SIZE {
            self.emit(ChunkFlag::More).await?;
        }
        Ok(())
    }

    /// Emit the final chunk. Every message must carry at least one data byte.
    pub async fn done(mut self) -> WireResult<()> {
        if !self.wrote_data {
            return Err(WireError::Invariant("empty message written"));
        }
        self.emit(ChunkFlag::Last).await
    }

    async fn emit(&mut self, flag: ChunkFlag) -> WireResult<()> {
        self.buf[self.flag_at] = flag as u8;
        self.chan.write_frame(self.buf).await?;
        self.buf.clear();
        // Chunks after the first carry only the flag byte ahead of the data.
        self.buf.extend_from_slice(&[ChunkFlag::More as u8]);
        self.flag_at = 0;
        Ok(())
    }
}

/// Reassembles one logical message and reads typed values out of it.
///
/// The reader owns the channel for the whole response phase, including the
/// lazy transaction stream at the tail of a response; ownership is what
/// keeps the channel half-duplex. Each wait for a further frame is bounded
/// by the per-request timeout.
#[derive(Debug)]
pub struct ChunkReader {
    chan: Channel,
    buf: BytesMut,
    pos: usize,
    mark: Option<usize>,
    expected: ProtocolVersion,
    timeout: Duration,
    awaiting_first: bool,
    seen_last: bool,
    got_data: bool,
}

impl ChunkReader {
    pub fn new(chan: Channel, expected: ProtocolVersion, timeout: Duration) -> Self {
        Self {
            chan,
            buf: BytesMut::new(),
            pos: 0,
            mark: None,
            expected,
            timeout,
            awaiting_first: true,
            seen_last: false,
            got_data: false,
        }
    }

    pub fn into_channel(self) -> Channel {
        self.chan
    }

    pub async fn read_u8(&mut self) -> WireResult<u8> {
        self.fill(1).await?;
        let value = self.buf[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub async fn read_u32(&mut self) -> WireResult<u32> {
        let mut bytes = [0u8; 4];
        self.read_exact(&mut bytes).await?;
        Ok(u32::from_be_bytes(bytes))
    }

    pub async fn read_i32(&mut self) -> WireResult<i32> {
        let mut bytes = [0u8; 4];
        self.read_exact(&mut bytes).await?;
        Ok(i32::from_be_bytes(bytes))
    }

    pub async fn read_i64(&mut self) -> WireResult<i64> {
        let mut bytes = [0u8; 8];
        self.read_exact(&mut bytes).await?;
        Ok(i64::from_be_bytes(bytes))
    }

    pub async fn read_u64(&mut self) -> WireResult<u64> {
        let mut bytes = [0u8; 8];
        self.read_exact(&mut bytes).await?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Fill the caller's buffer completely or fail.
    pub async fn read_exact(&mut self, dst: &mut [u8]) -> WireResult<()> {
        self.fill(dst.len()).await?;
        dst.copy_from_slice(&self.buf[self.pos..self.pos + dst.len()]);
        self.pos += dst.len();
        Ok(())
    }

    /// Length-prefixed UTF-8 string, mirror of [`ChunkWriter::write_string`].
    pub async fn read_string(&mut self, field: &'static str) -> WireResult<String> {
        let len = self.read_u32().await? as usize;
        self.fill(len).await?;
        let bytes = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        String::from_utf8(bytes)
            .map_err(|source| ProtocolError::Utf8 { field, source }.into())
    }

    /// Remember the current read position. Single-mark discipline: a second
    /// `mark()` replaces the first.
    pub fn mark(&mut self) {
        self.mark = Some(self.pos);
    }

    /// Rewind to the mark set by [`mark`](Self::mark) and clear it.
    pub fn reset(&mut self) -> WireResult<()> {
        match self.mark.take() {
            Some(pos) => {
                self.pos = pos;
                Ok(())
            }
            None => Err(WireError::Invariant("reset without a mark")),
        }
    }

    /// True once the final chunk has arrived and every byte of the message
    /// has been consumed.
    pub fn fully_consumed(&self) -> bool {
        self.seen_last && self.available() == 0
    }

    /// Consume and discard the rest of the message, leaving the channel at
    /// a message boundary so it can carry another request.
    pub async fn finish(&mut self) -> WireResult<()> {
        while !self.seen_last {
            self.read_chunk().await?;
        }
        self.mark = None;
        self.pos = 0;
        self.buf.clear();
        Ok(())
    }

    fn available(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Block until at least `need` unconsumed bytes are buffered.
    async fn fill(&mut self, need: usize) -> WireResult<()> {
        while self.available() < need {
            if self.seen_last {
                return Err(if self.available() == 0 {
                    ProtocolError::EndOfMessage.into()
                } else {
                    ProtocolError::InsufficientData {
                        requested: need,
                        available: self.available(),
                    }
                    .into()
                });
            }
            self.read_chunk().await?;
        }
        Ok(())
    }

    /// Receive one more chunk of the current message, verifying the version
    /// handshake on the first.
    async fn read_chunk(&mut self) -> WireResult<()> {
        let received = time::timeout(self.timeout, self.chan.read_frame()).await;
        let mut frame = match received {
            Ok(result) => result?,
            Err(_) => {
                self.chan.mark_broken();
                return Err(WireError::Timeout(self.timeout));
            }
        };

        let header = if self.awaiting_first {
            HANDSHAKE_SIZE + FLAG_SIZE
        } else {
            FLAG_SIZE
        };
        if frame.len() < header {
            self.chan.mark_broken();
            return Err(ProtocolError::TruncatedChunk { length: frame.len() }.into());
        }

        if self.awaiting_first {
            let internal = frame.get_u8();
            let application = frame.get_u8();
            if internal != self.expected.internal || application != self.expected.application {
                self.chan.mark_broken();
                return Err(ProtocolError::VersionMismatch {
                    expected_internal: self.expected.internal,
                    expected_application: self.expected.application,
                    actual_internal: internal,
                    actual_application: application,
                }
                .into());
            }
            self.awaiting_first = false;
        }

        let flag_byte = frame.get_u8();
        let flag = ChunkFlag::try_from(flag_byte).map_err(|_| {
            self.chan.mark_broken();
            WireError::from(ProtocolError::BadChunkFlag(flag_byte))
        })?;

        if !frame.is_empty() {
            self.got_data = true;
        }
        if flag == ChunkFlag::Last {
            self.seen_last = true;
            if !self.got_data {
                self.chan.mark_broken();
                return Err(ProtocolError::EmptyMessage.into());
            }
        }

        // Reclaim consumed bytes before growing, unless a mark pins them.
        if self.mark.is_none() && self.pos > 0 {
            self.buf.advance(self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(&frame);
        Ok(())
    }
}
