//! Shared protocol values: store identity, protocol versions, and the
//! slave context sent as the prelude of every request.

use crate::chunk::{ChunkReader, ChunkWriter};
use crate::error::{WireError, WireResult};
use core::fmt;

/// The pair of version bytes exchanged on the first chunk of every message.
///
/// `internal` versions the chunking/framing layer itself; `application`
/// versions the request/response payloads above it. Either one differing
/// between peers aborts the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub internal: u8,
    pub application: u8,
}

impl ProtocolVersion {
    pub const fn new(internal: u8, application: u8) -> Self {
        Self {
            internal,
            application,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.internal, self.application)
    }
}

/// 24-byte triple uniquely naming a database instance.
///
/// Appended to every response body so a slave can refuse state from a
/// master that is not serving the store it replicates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StoreId {
    pub creation_time: i64,
    pub random_id: i64,
    pub store_version: i64,
}

impl StoreId {
    pub const fn new(creation_time: i64, random_id: i64, store_version: i64) -> Self {
        Self {
            creation_time,
            random_id,
            store_version,
        }
    }

    pub async fn encode(&self, out: &mut ChunkWriter<'_>) -> WireResult<()> {
        out.write_i64(self.creation_time).await?;
        out.write_i64(self.random_id).await?;
        out.write_i64(self.store_version).await?;
        Ok(())
    }

    pub async fn decode(src: &mut ChunkReader) -> WireResult<Self> {
        Ok(Self {
            creation_time: src.read_i64().await?,
            random_id: src.read_i64().await?,
            store_version: src.read_i64().await?,
        })
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StoreId[{}, {}, v{}]",
            self.creation_time, self.random_id, self.store_version
        )
    }
}

/// Per-request prelude identifying the caller's session and the highest
/// transaction it has applied per datasource.
///
/// The datasource list is capped at 255 entries by the one-byte count on
/// the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlaveContext {
    pub session_id: u64,
    pub machine_id: i32,
    pub event_identifier: i32,
    /// `(datasource name, last applied transaction id)` pairs.
    pub last_applied_txs: Vec<(String, i64)>,
}

impl SlaveContext {
    pub fn new(
        session_id: u64,
        machine_id: i32,
        event_identifier: i32,
        last_applied_txs: Vec<(String, i64)>,
    ) -> Self {
        Self {
            session_id,
            machine_id,
            event_identifier,
            last_applied_txs,
        }
    }

    pub async fn encode(&self, out: &mut ChunkWriter<'_>) -> WireResult<()> {
        if self.last_applied_txs.len() > u8::MAX as usize {
            return Err(WireError::Invariant(
                "slave context lists more than 255 datasources",
            ));
        }
        out.write_u64(self.session_id).await?;
        out.write_i32(self.machine_id).await?;
        out.write_i32(self.event_identifier).await?;
        out.write_u8(self.last_applied_txs.len() as u8).await?;
        for (datasource, tx_id) in &self.last_applied_txs {
            out.write_string(datasource).await?;
            out.write_i64(*tx_id).await?;
        }
        Ok(())
    }

    pub async fn decode(src: &mut ChunkReader) -> WireResult<Self> {
        let session_id = src.read_u64().await?;
        let machine_id = src.read_i32().await?;
        let event_identifier = src.read_i32().await?;
        let count = src.read_u8().await? as usize;
        let mut last_applied_txs = Vec::with_capacity(count);
        for _ in 0..count {
            let datasource = src.read_string("datasource name").await?;
            let tx_id = src.read_i64().await?;
            last_applied_txs.push((datasource, tx_id));
        }
        Ok(Self {
            session_id,
            machine_id,
            event_identifier,
            last_applied_txs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WireError;
    use crate::tests::{PEER_TIMEOUT, VERSIONS, accept_channel, bind_listener, connect_channel};
    use bytes::BytesMut;

    #[tokio::test]
    async fn slave_context_and_store_id_roundtrip() {
        let (listener, addr) = bind_listener().await;
        let context = SlaveContext::new(
            u64::MAX,
            -3,
            42,
            vec![("nioneo".into(), i64::MAX), ("lucene".into(), -1)],
        );
        let store = StoreId::new(1234567890, -987654321, 3);
        let sent = context.clone();

        let server = tokio::spawn(async move {
            let chan = accept_channel(&listener, 1024).await;
            let mut reader = ChunkReader::new(chan, VERSIONS, PEER_TIMEOUT);
            assert_eq!(SlaveContext::decode(&mut reader).await.unwrap(), sent);
            assert_eq!(StoreId::decode(&mut reader).await.unwrap(), store);
        });

        let mut chan = connect_channel(&addr, 1024).await;
        let mut buf = BytesMut::new();
        let mut writer = ChunkWriter::new(&mut chan, &mut buf, VERSIONS);
        context.encode(&mut writer).await.unwrap();
        store.encode(&mut writer).await.unwrap();
        writer.done().await.unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn empty_tx_list_roundtrip() {
        let (listener, addr) = bind_listener().await;
        let context = SlaveContext::new(0, 0, 0, Vec::new());
        let sent = context.clone();

        let server = tokio::spawn(async move {
            let chan = accept_channel(&listener, 1024).await;
            let mut reader = ChunkReader::new(chan, VERSIONS, PEER_TIMEOUT);
            assert_eq!(SlaveContext::decode(&mut reader).await.unwrap(), sent);
        });

        let mut chan = connect_channel(&addr, 1024).await;
        let mut buf = BytesMut::new();
        let mut writer = ChunkWriter::new(&mut chan, &mut buf, VERSIONS);
        context.encode(&mut writer).await.unwrap();
        writer.done().await.unwrap();

        server.await.unwrap();
    }

    // The one-byte count caps the datasource list at 255 entries.
    #[tokio::test]
    async fn oversized_tx_list_rejected() {
        let (listener, addr) = bind_listener().await;
        let server = tokio::spawn(async move { accept_channel(&listener, 1024).await });

        let txs: Vec<(String, i64)> = (0..256).map(|i| (format!("ds{i}"), i)).collect();
        let context = SlaveContext::new(1, 1, 1, txs);

        let mut chan = connect_channel(&addr, 1024).await;
        let mut buf = BytesMut::new();
        let mut writer = ChunkWriter::new(&mut chan, &mut buf, VERSIONS);
        assert!(matches!(
            context.encode(&mut writer).await.unwrap_err(),
            WireError::Invariant(_)
        ));

        server.await.unwrap();
    }
}
