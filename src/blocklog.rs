//! Block encoding for transaction payloads inside a response stream.
//!
//! Each transaction payload travels as a run of blocks: a one-byte size
//! header, then data. A header of `0` means a full intermediate block of
//! exactly [`DATA_SIZE`] bytes; a non-zero header means the terminal block
//! carrying that many bytes. `DATA_SIZE` is 255 so a terminal block that
//! happens to be full still has a representable size.

use crate::chunk::{ChunkReader, ChunkWriter};
use crate::error::{WireError, WireResult};
use bytes::BytesMut;

/// Data bytes carried by a full intermediate block.
pub const DATA_SIZE: usize = 255;

const FULL_BLOCK: u8 = 0;

/// Reads one transaction payload off a dechunked message.
///
/// Reads are satisfied across block boundaries transparently; once the
/// terminal block is exhausted the reader reports end-of-stream and leaves
/// the underlying message positioned at the next transaction record.
pub struct BlockLogReader<'a> {
    src: &'a mut ChunkReader,
    block_remaining: usize,
    terminal: bool,
}

impl<'a> BlockLogReader<'a> {
    pub fn new(src: &'a mut ChunkReader) -> Self {
        Self {
            src,
            block_remaining: 0,
            terminal: false,
        }
    }

    /// Read up to `dst.len()` bytes; returns the number read, `0` at the
    /// end of the payload.
    pub async fn read(&mut self, dst: &mut [u8]) -> WireResult<usize> {
        let mut filled = 0;
        while filled < dst.len() {
            if !self.advance_block().await? {
                break;
            }
            let n = self.block_remaining.min(dst.len() - filled);
            self.src.read_exact(&mut dst[filled..filled + n]).await?;
            self.block_remaining -= n;
            filled += n;
        }
        Ok(filled)
    }

    /// Append the rest of the payload to `out`.
    pub async fn read_to_end(&mut self, out: &mut BytesMut) -> WireResult<()> {
        while self.advance_block().await? {
            let start = out.len();
            out.resize(start + self.block_remaining, 0);
            self.src.read_exact(&mut out[start..]).await?;
            self.block_remaining = 0;
        }
        Ok(())
    }

    /// Ensure a block with unread bytes is current; `false` at end of
    /// stream.
    async fn advance_block(&mut self) -> WireResult<bool> {
        if self.block_remaining > 0 {
            return Ok(true);
        }
        if self.terminal {
            return Ok(false);
        }
        let header = self.src.read_u8().await?;
        if header == FULL_BLOCK {
            self.block_remaining = DATA_SIZE;
        } else {
            self.block_remaining = header as usize;
            self.terminal = true;
        }
        Ok(true)
    }
}

/// Writes one transaction payload as a block run.
///
/// The producing side of [`BlockLogReader`]: buffers up to [`DATA_SIZE`]
/// bytes, emitting a full block each time the buffer fills, and flushes the
/// remainder as the terminal block on `done()`.
pub struct BlockLogWriter<'a, 'w> {
    out: &'a mut ChunkWriter<'w>,
    block: [u8; DATA_SIZE],
    len: usize,
}

impl<'a, 'w> BlockLogWriter<'a, 'w> {
    pub fn new(out: &'a mut ChunkWriter<'w>) -> Self {
        Self {
            out,
            block: [0; DATA_SIZE],
            len: 0,
        }
    }

    pub async fn write(&mut self, mut data: &[u8]) -> WireResult<()> {
        while !data.is_empty() {
            if self.len == DATA_SIZE {
                self.out.write_u8(FULL_BLOCK).await?;
                self.out.write_bytes(&self.block).await?;
                self.len = 0;
            }
            let n = (DATA_SIZE - self.len).min(data.len());
            self.block[self.len..self.len + n].copy_from_slice(&data[..n]);
            self.len += n;
            data = &data[n..];
        }
        Ok(())
    }

    /// Emit the terminal block. Payloads must be non-empty; a terminal
    /// block of zero bytes is not representable on the wire.
    pub async fn done(self) -> WireResult<()> {
        if self.len == 0 {
            return Err(WireError::Invariant("empty block-log payload"));
        }
        self.out.write_u8(self.len as u8).await?;
        self.out.write_bytes(&self.block[..self.len]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{PEER_TIMEOUT, VERSIONS, accept_channel, bind_listener, connect_channel};
    use bytes::BytesMut;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Encode `payload` followed by a sentinel byte; return the raw block
    /// structure as `(header, data-length)` pairs seen by the peer.
    async fn block_layout(payload: Vec<u8>) -> Vec<(u8, usize)> {
        let (listener, addr) = bind_listener().await;
        let expected = payload.clone();

        let server = tokio::spawn(async move {
            let chan = accept_channel(&listener, 4096).await;
            let mut reader = ChunkReader::new(chan, VERSIONS, PEER_TIMEOUT);
            let mut layout = Vec::new();
            let mut data = Vec::new();
            loop {
                let header = reader.read_u8().await.unwrap();
                let len = if header == FULL_BLOCK {
                    DATA_SIZE
                } else {
                    header as usize
                };
                let mut block = vec![0u8; len];
                reader.read_exact(&mut block).await.unwrap();
                data.extend_from_slice(&block);
                layout.push((header, len));
                if header != FULL_BLOCK {
                    break;
                }
            }
            assert_eq!(data, expected);
            assert_eq!(reader.read_u8().await.unwrap(), 0x5A);
            layout
        });

        let mut chan = connect_channel(&addr, 4096).await;
        let mut buf = BytesMut::new();
        let mut writer = ChunkWriter::new(&mut chan, &mut buf, VERSIONS);
        let mut blocks = BlockLogWriter::new(&mut writer);
        blocks.write(&payload).await.unwrap();
        blocks.done().await.unwrap();
        writer.write_u8(0x5A).await.unwrap();
        writer.done().await.unwrap();

        server.await.unwrap()
    }

    #[tokio::test]
    async fn single_terminal_block() {
        assert_eq!(block_layout(pattern(1)).await, [(1, 1)]);
        assert_eq!(block_layout(pattern(100)).await, [(100, 100)]);
    }

    // A payload of exactly DATA_SIZE still ends in a terminal block; the
    // size fits the one-byte header because DATA_SIZE is 255.
    #[tokio::test]
    async fn exactly_full_terminal_block() {
        assert_eq!(block_layout(pattern(255)).await, [(255, 255)]);
        assert_eq!(block_layout(pattern(510)).await, [(0, 255), (255, 255)]);
    }

    #[tokio::test]
    async fn full_blocks_then_remainder() {
        assert_eq!(block_layout(pattern(256)).await, [(0, 255), (1, 1)]);
        assert_eq!(
            block_layout(pattern(520)).await,
            [(0, 255), (0, 255), (10, 10)]
        );
    }

    // Reads smaller than a block cross block boundaries transparently and
    // report end-of-stream as a zero-length read.
    #[tokio::test]
    async fn partial_reads_across_blocks() {
        let (listener, addr) = bind_listener().await;
        let payload = pattern(520);
        let expected = payload.clone();

        let server = tokio::spawn(async move {
            let mut chan = accept_channel(&listener, 4096).await;
            let mut buf = BytesMut::new();
            let mut writer = ChunkWriter::new(&mut chan, &mut buf, VERSIONS);
            let mut blocks = BlockLogWriter::new(&mut writer);
            blocks.write(&payload).await.unwrap();
            blocks.done().await.unwrap();
            writer.done().await.unwrap();
            chan
        });

        let chan = connect_channel(&addr, 4096).await;
        let mut reader = ChunkReader::new(chan, VERSIONS, PEER_TIMEOUT);
        let mut blocks = BlockLogReader::new(&mut reader);
        let mut data = Vec::new();
        let mut chunk = [0u8; 7];
        loop {
            let n = blocks.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            data.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(data, expected);
        assert_eq!(blocks.read(&mut chunk).await.unwrap(), 0);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn writer_refuses_empty_payload() {
        let (listener, addr) = bind_listener().await;
        let server = tokio::spawn(async move { accept_channel(&listener, 4096).await });

        let mut chan = connect_channel(&addr, 4096).await;
        let mut buf = BytesMut::new();
        let mut writer = ChunkWriter::new(&mut chan, &mut buf, VERSIONS);
        let blocks = BlockLogWriter::new(&mut writer);
        assert!(matches!(
            blocks.done().await.unwrap_err(),
            WireError::Invariant(_)
        ));

        server.await.unwrap();
    }
}
