//! Client-side communication core for a replicated graph database.
//!
//! A master ships transactional state to slaves (and backup tools) over a
//! length-framed, chunked request/response protocol. This crate implements
//! the wire layers (framing, chunking, version handshake, block-log payload
//! encoding) and the pooled client that multiplexes callers over a small
//! set of long-lived TCP connections.
//!
//! Request kinds themselves live outside this crate: callers describe a
//! kind with a [`RequestKind`] plus a serializer/deserializer pair, and get
//! back a [`Response`] carrying the typed value, the master's store
//! identity, and a lazy stream of `(datasource, tx id, payload)` records.
//!
//! ```rust,no_run
//! use txwire::{
//!     EmptyPayload, ProtocolVersion, RequestKind, SlaveContext, StoreId, WireClient,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = WireClient::builder("master:6362", ProtocolVersion::new(1, 1)).build();
//!
//!     let context = SlaveContext::new(1, 7, 0, vec![("nioneo".into(), 12)]);
//!     let pull_updates = RequestKind::new(0x02);
//!     let mut response = client
//!         .send_request(
//!             pull_updates,
//!             &context,
//!             &EmptyPayload,
//!             &EmptyPayload,
//!             Some(StoreId::new(1, 2, 3)),
//!         )
//!         .await?;
//!
//!     while let Some(tx) = response.transactions().next().await? {
//!         println!("{} #{}: {} bytes", tx.datasource, tx.tx_id, tx.payload.len());
//!     }
//!     response.close().await;
//!
//!     client.shutdown();
//!     Ok(())
//! }
//! ```

pub mod blocklog;
pub mod channel;
pub mod chunk;
pub mod client;
pub mod error;
pub mod pool;
pub mod request;
pub mod response;
pub mod types;


pub use blocklog::{BlockLogReader, BlockLogWriter, DATA_SIZE};
pub use channel::Channel;
pub use chunk::{ChunkFlag, ChunkReader, ChunkWriter};
pub use client::{DEFAULT_FRAME_LENGTH, DEFAULT_READ_TIMEOUT, WireClient, WireClientBuilder};
pub use error::{ProtocolError, WireError, WireResult};
pub use pool::{ChannelPool, PoolConfig, PooledChannel};
pub use request::{
    ConnectionLostHandler, EmptyPayload, IgnoreConnectionLoss, NoLocalStore, RequestKind,
    RequestWriter, ResponseReader, StoreIdSource,
};
pub use response::{Response, TxRecord, TxStream};
pub use types::{ProtocolVersion, SlaveContext, StoreId};
