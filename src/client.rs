//! Pooled request/response client.
//!
//! One [`WireClient`] binds to one master address and multiplexes any
//! number of calling tasks over a bounded set of channels. A request
//! borrows a channel for its entire lifecycle (write, read, and however
//! long the caller holds the returned transaction stream) and the channel
//! is half-duplex throughout: no pipelining, no interleaving.

use crate::chunk::{ChunkReader, ChunkWriter};
use crate::error::{WireError, WireResult};
use crate::pool::{ChannelFactory, ChannelPool, PoolConfig, PooledChannel};
use crate::request::{
    ConnectionLostHandler, IgnoreConnectionLoss, NoLocalStore, RequestKind, RequestWriter,
    ResponseReader, StoreIdSource,
};
use crate::response::{Response, TxStream};
use crate::types::{ProtocolVersion, SlaveContext, StoreId};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_FRAME_LENGTH: u32 = 1024 * 1024;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(20);

/// Client side of the master/slave transaction-shipping protocol.
///
/// Cheap to share behind an `Arc`; concurrent `send_request` calls are
/// serialized over the pool's channels.
pub struct WireClient {
    pool: ChannelPool,
    versions: ProtocolVersion,
    default_read_timeout: Duration,
    store_id_source: Arc<dyn StoreIdSource>,
}

impl WireClient {
    pub fn builder(addr: impl Into<String>, versions: ProtocolVersion) -> WireClientBuilder {
        WireClientBuilder::new(addr, versions)
    }

    /// Perform one request against the master.
    ///
    /// Acquires a channel, writes the kind tag, the slave context, and the
    /// serializer's payload as one chunked message, then reads the response:
    /// the deserializer's typed value, the store identity, and the
    /// transaction-stream header. The stream itself stays on the wire until
    /// pulled through the returned [`Response`].
    ///
    /// Any failure up to that point disposes the channel, never returning
    /// it to the pool mid-message, and surfaces as the [`WireError`]
    /// describing what went wrong.
    ///
    /// With `expected_store_id` unset, kinds that demand a store check are
    /// verified against the configured [`StoreIdSource`].
    pub async fn send_request<S, D>(
        &self,
        kind: RequestKind,
        context: &SlaveContext,
        serializer: &S,
        deserializer: &D,
        expected_store_id: Option<StoreId>,
    ) -> WireResult<Response<D::Value>>
    where
        S: RequestWriter,
        D: ResponseReader,
    {
        let mut conn = self.pool.acquire().await?;
        match self
            .exchange(&mut conn, kind, context, serializer, deserializer, expected_store_id)
            .await
        {
            Ok((value, store_id, reader, sources)) => Ok(Response::new(
                value,
                store_id,
                TxStream::new(reader, conn, sources),
            )),
            // The channel is mid-message in an unknown state; dropping the
            // borrow closes it, so the next acquire starts fresh.
            Err(error) => Err(error),
        }
    }

    async fn exchange<S, D>(
        &self,
        conn: &mut PooledChannel,
        kind: RequestKind,
        context: &SlaveContext,
        serializer: &S,
        deserializer: &D,
        expected_store_id: Option<StoreId>,
    ) -> WireResult<(D::Value, StoreId, ChunkReader, Vec<String>)>
    where
        S: RequestWriter,
        D: ResponseReader,
    {
        let mut chan = conn.take_channel()?;

        {
            let mut writer = ChunkWriter::new(&mut chan, &mut conn.out_buf, self.versions);
            writer.write_u8(kind.id).await?;
            context.encode(&mut writer).await?;
            serializer.write(&mut writer, &mut conn.scratch).await?;
            writer.done().await?;
        }

        let timeout = kind.read_timeout.unwrap_or(self.default_read_timeout);
        let mut reader = ChunkReader::new(chan, self.versions, timeout);
        let value = deserializer.read(&mut reader, &mut conn.scratch).await?;
        let store_id = StoreId::decode(&mut reader).await?;

        if kind.check_store_id {
            let expected = match expected_store_id {
                Some(id) => id,
                None => self.store_id_source.store_id()?,
            };
            if expected != store_id {
                return Err(WireError::StoreMismatch {
                    expected,
                    actual: store_id,
                });
            }
        }

        let count = reader.read_u8().await? as usize;
        let mut sources = Vec::with_capacity(count);
        for _ in 0..count {
            sources.push(reader.read_string("datasource name").await?);
        }

        Ok((value, store_id, reader, sources))
    }

    /// Close the pool: dispose idle channels and reject further requests.
    /// In-flight requests fail when their channel is torn down.
    pub fn shutdown(&self) {
        self.pool.close(true);
    }
}

/// Configures and builds a [`WireClient`].
pub struct WireClientBuilder {
    addr: String,
    versions: ProtocolVersion,
    frame_length: u32,
    read_timeout: Duration,
    max_connections: usize,
    max_idle: Option<usize>,
    store_id_source: Arc<dyn StoreIdSource>,
    lost_handler: Arc<dyn ConnectionLostHandler>,
}

impl WireClientBuilder {
    pub fn new(addr: impl Into<String>, versions: ProtocolVersion) -> Self {
        Self {
            addr: addr.into(),
            versions,
            frame_length: DEFAULT_FRAME_LENGTH,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_connections: 20,
            max_idle: None,
            store_id_source: Arc::new(NoLocalStore),
            lost_handler: Arc::new(IgnoreConnectionLoss),
        }
    }

    /// Maximum frame payload length, both directions.
    pub fn frame_length(mut self, frame_length: u32) -> Self {
        self.frame_length = frame_length;
        self
    }

    /// Default per-frame read timeout; kinds may override it.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Channels that may exist at once; further requests wait.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Idle channels kept for reuse. Defaults to `max_connections`.
    pub fn max_idle(mut self, max: usize) -> Self {
        self.max_idle = Some(max);
        self
    }

    pub fn store_id_source(mut self, source: impl StoreIdSource + 'static) -> Self {
        self.store_id_source = Arc::new(source);
        self
    }

    pub fn on_connection_lost(mut self, handler: impl ConnectionLostHandler + 'static) -> Self {
        self.lost_handler = Arc::new(handler);
        self
    }

    pub fn build(self) -> WireClient {
        let config = PoolConfig {
            max_active: self.max_connections,
            max_idle: self.max_idle.unwrap_or(self.max_connections),
        };
        let factory = ChannelFactory::new(self.addr, self.frame_length, self.lost_handler);
        WireClient {
            pool: ChannelPool::new(factory, config),
            versions: self.versions,
            default_read_timeout: self.read_timeout,
            store_id_source: self.store_id_source,
        }
    }
}
