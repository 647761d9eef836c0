//! Contracts between the communication core and the request kinds built on
//! top of it.
//!
//! The core never interprets a kind-specific payload: callers hand it a
//! [`RequestWriter`] for the outbound bytes and a [`ResponseReader`] for the
//! typed value at the head of the response. Kinds are numbered out-of-band;
//! nothing here registers them.

use crate::chunk::{ChunkReader, ChunkWriter};
use crate::error::{WireError, WireResult};
use crate::types::StoreId;
use bytes::BytesMut;
use std::future::Future;
use std::time::Duration;

/// Describes one request kind of the master/slave protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestKind {
    /// Wire tag, the first byte of every request body.
    pub id: u8,
    /// Whether the response's store identity must match the local store.
    pub check_store_id: bool,
    /// Overrides the client's default read timeout for this kind.
    pub read_timeout: Option<Duration>,
}

impl RequestKind {
    pub const fn new(id: u8) -> Self {
        Self {
            id,
            check_store_id: true,
            read_timeout: None,
        }
    }

    /// For kinds answered before a store exists, e.g. full store copy.
    pub const fn without_store_check(mut self) -> Self {
        self.check_store_id = false;
        self
    }

    /// For kinds with atypical response latency, e.g. long-held locks.
    pub const fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }
}

/// Serializes the kind-specific payload of a request.
///
/// Invoked after the kind tag and slave context have been written; whatever
/// it appends is the rest of the request body. The scratch buffer is the
/// borrowed channel's 1 MiB staging area, handy for assembling large
/// payloads without allocating per request.
pub trait RequestWriter: Send + Sync {
    fn write(
        &self,
        out: &mut ChunkWriter<'_>,
        scratch: &mut BytesMut,
    ) -> impl Future<Output = WireResult<()>> + Send;
}

/// Deserializes the typed value at the head of a response body.
///
/// Must consume exactly the kind-specific payload; the store identity and
/// transaction stream that follow are read by the client core.
pub trait ResponseReader: Send + Sync {
    type Value: Send;

    fn read(
        &self,
        src: &mut ChunkReader,
        scratch: &mut BytesMut,
    ) -> impl Future<Output = WireResult<Self::Value>> + Send;
}

/// Serializer/deserializer for kinds whose request or response body carries
/// nothing beyond the common prelude and trailer.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyPayload;

impl RequestWriter for EmptyPayload {
    async fn write(&self, _out: &mut ChunkWriter<'_>, _scratch: &mut BytesMut) -> WireResult<()> {
        Ok(())
    }
}

impl ResponseReader for EmptyPayload {
    type Value = ();

    async fn read(&self, _src: &mut ChunkReader, _scratch: &mut BytesMut) -> WireResult<()> {
        Ok(())
    }
}

/// Provides the local store identity for response verification.
pub trait StoreIdSource: Send + Sync {
    fn store_id(&self) -> WireResult<StoreId>;
}

/// Source for nodes that have no store yet, e.g. a backup target before its
/// first copy. Requests whose kind demands a store-id check fail against it.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoLocalStore;

impl StoreIdSource for NoLocalStore {
    fn store_id(&self) -> WireResult<StoreId> {
        Err(WireError::Invariant("no local store identity available"))
    }
}

/// Observes channel-establishment failures before they surface to the
/// caller, after the reconnect-dampening sleep.
pub trait ConnectionLostHandler: Send + Sync {
    fn on_connection_lost(&self, error: &WireError);
}

/// Default handler: do nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct IgnoreConnectionLoss;

impl ConnectionLostHandler for IgnoreConnectionLoss {
    fn on_connection_lost(&self, _error: &WireError) {}
}
