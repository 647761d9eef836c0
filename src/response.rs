//! Typed response carrying a value, the master's store identity, and the
//! lazy transaction stream at the tail of the message.

use crate::blocklog::BlockLogReader;
use crate::chunk::ChunkReader;
use crate::error::{ProtocolError, WireResult};
use crate::pool::PooledChannel;
use crate::types::StoreId;
use bytes::{Bytes, BytesMut};

/// One transaction pulled off a response stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxRecord {
    /// Datasource name, always one of [`TxStream::datasources`].
    pub datasource: String,
    pub tx_id: i64,
    pub payload: Bytes,
}

/// Lazy tail of a response: zero or more transactions, read off the wire
/// one record per [`next`](Self::next) call.
///
/// The stream holds the borrowed channel for as long as it is open, which
/// is what back-pressures the master: frames beyond the record being pulled
/// are simply not read. [`close`](Self::close) consumes whatever remains
/// and hands the channel back to the pool; dropping the stream unclosed
/// disposes the channel instead, since unread frames make it unusable for
/// another request.
#[derive(Debug)]
pub struct TxStream {
    reader: Option<ChunkReader>,
    conn: Option<PooledChannel>,
    sources: Vec<String>,
    done: bool,
    failed: bool,
}

impl TxStream {
    pub(crate) fn new(reader: ChunkReader, conn: PooledChannel, sources: Vec<String>) -> Self {
        let done = sources.is_empty();
        Self {
            reader: Some(reader),
            conn: Some(conn),
            sources,
            done,
            failed: false,
        }
    }

    /// Datasource names announced by the stream header. Every yielded
    /// record names one of these.
    pub fn datasources(&self) -> &[String] {
        &self.sources
    }

    /// Pull the next transaction; `None` once the stream terminator has
    /// been read. Errors poison the stream: later calls return `None` and
    /// closing disposes the channel.
    pub async fn next(&mut self) -> WireResult<Option<TxRecord>> {
        if self.done {
            return Ok(None);
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let result = Self::read_record(reader, &self.sources).await;
        match &result {
            Ok(None) => self.done = true,
            Ok(Some(_)) => {}
            Err(_) => {
                self.done = true;
                self.failed = true;
            }
        }
        result
    }

    async fn read_record(
        reader: &mut ChunkReader,
        sources: &[String],
    ) -> WireResult<Option<TxRecord>> {
        let index = reader.read_u8().await?;
        if index == 0 {
            return Ok(None);
        }
        let datasource = sources
            .get(index as usize - 1)
            .cloned()
            .ok_or(ProtocolError::BadDatasourceIndex {
                index,
                count: sources.len(),
            })?;
        let tx_id = reader.read_i64().await?;
        let mut payload = BytesMut::new();
        BlockLogReader::new(reader).read_to_end(&mut payload).await?;
        Ok(Some(TxRecord {
            datasource,
            tx_id,
            payload: payload.freeze(),
        }))
    }

    /// Consume the rest of the stream and return the channel to the pool.
    /// Idempotent, and never fails: a stream that cannot be drained cleanly
    /// has its channel disposed instead of released.
    pub(crate) async fn close(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let Some(mut reader) = self.reader.take() else {
            return;
        };
        let clean = !self.failed
            && Self::drain(&mut reader, &self.sources, self.done).await
            && reader.finish().await.is_ok();
        if clean {
            conn.restore(reader.into_channel());
            conn.release();
        } else {
            tracing::debug!("disposing channel of an uncleanly closed response");
            conn.dispose();
        }
    }

    /// Read and discard records up to the terminator; false on any error.
    async fn drain(reader: &mut ChunkReader, sources: &[String], mut done: bool) -> bool {
        while !done {
            match Self::read_record(reader, sources).await {
                Ok(Some(_)) => {}
                Ok(None) => done = true,
                Err(_) => return false,
            }
        }
        true
    }
}

/// Typed response to one request.
///
/// The primary value and store identity are available immediately; the
/// transaction stream is lazy. Call [`close`](Self::close) when finished
/// with the stream; it is idempotent and never fails. Dropping an unclosed
/// response disposes its channel.
#[derive(Debug)]
pub struct Response<T> {
    value: T,
    store_id: StoreId,
    stream: TxStream,
}

impl<T> Response<T> {
    pub(crate) fn new(value: T, store_id: StoreId, stream: TxStream) -> Self {
        Self {
            value,
            store_id,
            stream,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Store identity the master stamped on this response.
    pub fn store_id(&self) -> StoreId {
        self.store_id
    }

    /// The embedded transaction stream. Reading the value does not consume
    /// it; records must be pulled in order.
    pub fn transactions(&mut self) -> &mut TxStream {
        &mut self.stream
    }

    /// Drain any unread transactions and return the channel to the pool.
    pub async fn close(&mut self) {
        self.stream.close().await;
    }
}
