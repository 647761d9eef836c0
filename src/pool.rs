//! Bounded pool of reusable channels.
//!
//! Capacity is gated by a semaphore whose owned permits travel with the
//! borrowed channel, so the active-slot accounting cannot leak: whether a
//! request releases its channel back to the idle set or disposes it, the
//! slot frees exactly once when the permit drops. A channel is pushed to
//! the idle set *before* its permit is released, which keeps the live+idle
//! total within `max_active` at every instant.

use crate::channel::Channel;
use crate::error::{WireError, WireResult};
use crate::request::ConnectionLostHandler;
use bytes::BytesMut;
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time;

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep before surfacing a failed channel establishment, damping
/// reconnect storms against a dead master.
pub(crate) const RECONNECT_DAMPENING: Duration = Duration::from_secs(5);

/// Staging area handed to request serializers, one per pooled channel.
const SCRATCH_CAPACITY: usize = 1024 * 1024;

/// Pool capacity limits.
#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    /// Channels that may exist at once, borrowed or idle.
    pub max_active: usize,
    /// Idle channels kept for reuse; releases beyond this dispose instead.
    pub max_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: 20,
            max_idle: 20,
        }
    }
}

/// Opens channels to the configured master endpoint.
///
/// A plain value handed to the pool at construction; it captures the
/// address and framing bound, so no back-reference to the client is needed.
pub(crate) struct ChannelFactory {
    addr: String,
    frame_length: u32,
    lost_handler: Arc<dyn ConnectionLostHandler>,
}

impl ChannelFactory {
    pub(crate) fn new(
        addr: String,
        frame_length: u32,
        lost_handler: Arc<dyn ConnectionLostHandler>,
    ) -> Self {
        Self {
            addr,
            frame_length,
            lost_handler,
        }
    }

    async fn open(&self) -> WireResult<Channel> {
        let connected = time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.addr)).await;
        let socket = match connected {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                return self.fail(WireError::Connect(format!("{}: {e}", self.addr))).await;
            }
            Err(_) => {
                return self
                    .fail(WireError::Connect(format!(
                        "{}: connect timed out after {CONNECT_TIMEOUT:?}",
                        self.addr
                    )))
                    .await;
            }
        };
        tracing::debug!(addr = %self.addr, "opened channel");
        Ok(Channel::new(socket, self.frame_length))
    }

    async fn fail(&self, error: WireError) -> WireResult<Channel> {
        tracing::warn!(%error, "channel establishment failed");
        time::sleep(RECONNECT_DAMPENING).await;
        self.lost_handler.on_connection_lost(&error);
        Err(error)
    }
}

struct IdleEntry {
    channel: Channel,
    out_buf: BytesMut,
    scratch: BytesMut,
}

struct IdleState {
    entries: Vec<IdleEntry>,
    closed: bool,
}

struct PoolShared {
    factory: ChannelFactory,
    config: PoolConfig,
    slots: Arc<Semaphore>,
    idle: Mutex<IdleState>,
}

/// Bounded, blocking pool of channels to one endpoint.
pub struct ChannelPool {
    shared: Arc<PoolShared>,
}

impl ChannelPool {
    pub(crate) fn new(factory: ChannelFactory, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                factory,
                config,
                slots: Arc::new(Semaphore::new(config.max_active)),
                idle: Mutex::new(IdleState {
                    entries: Vec::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// Borrow a channel, reusing an idle one when possible and opening a
    /// fresh connection otherwise. Blocks while the pool is at capacity.
    ///
    /// The dampening sleep of the factory applies only to connect failures;
    /// waiting on a slot carries no artificial delay.
    pub async fn acquire(&self) -> WireResult<PooledChannel> {
        let permit = Arc::clone(&self.shared.slots)
            .acquire_owned()
            .await
            .map_err(|_| WireError::Connect("pool is shut down".into()))?;

        let reused = {
            let mut idle = self.shared.idle.lock().expect("pool lock poisoned");
            if idle.closed {
                return Err(WireError::Connect("pool is shut down".into()));
            }
            // Channels can die while idle; skip (and thereby close) those.
            loop {
                match idle.entries.pop() {
                    Some(entry) if entry.channel.is_alive() => break Some(entry),
                    Some(_dead) => continue,
                    None => break None,
                }
            }
        };

        let entry = match reused {
            Some(entry) => entry,
            None => IdleEntry {
                channel: self.shared.factory.open().await?,
                out_buf: BytesMut::new(),
                scratch: BytesMut::with_capacity(SCRATCH_CAPACITY),
            },
        };

        Ok(PooledChannel {
            channel: Some(entry.channel),
            out_buf: entry.out_buf,
            scratch: entry.scratch,
            shared: Arc::clone(&self.shared),
            _permit: permit,
        })
    }

    /// Dispose every idle channel; with `reject_new`, also fail all pending
    /// and future `acquire` calls.
    pub fn close(&self, reject_new: bool) {
        if reject_new {
            self.shared.slots.close();
        }
        let drained = {
            let mut idle = self.shared.idle.lock().expect("pool lock poisoned");
            if reject_new {
                idle.closed = true;
            }
            mem::take(&mut idle.entries)
        };
        tracing::debug!(disposed = drained.len(), reject_new, "pool closed");
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.shared.idle.lock().expect("pool lock poisoned").entries.len()
    }
}

/// A channel borrowed from the pool for exactly one request.
///
/// Dropping it disposes the channel (closing the socket) and frees the
/// slot; [`release`](Self::release) instead returns a live channel to the
/// idle set. Either way the slot accounting is handled by the owned permit.
pub struct PooledChannel {
    channel: Option<Channel>,
    pub(crate) out_buf: BytesMut,
    pub(crate) scratch: BytesMut,
    shared: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledChannel")
            .field("channel", &self.channel)
            .field("out_buf", &self.out_buf)
            .field("scratch", &self.scratch)
            .finish()
    }
}

impl PooledChannel {
    /// Take the channel for the duration of a request. The request path
    /// moves it through writer and reader and restores it on success.
    pub(crate) fn take_channel(&mut self) -> WireResult<Channel> {
        self.channel
            .take()
            .ok_or(WireError::Invariant("channel already taken from its slot"))
    }

    pub(crate) fn restore(&mut self, channel: Channel) {
        self.channel = Some(channel);
    }

    /// Return the channel to the idle set, or dispose it if it is dead or
    /// the idle set is full.
    pub fn release(mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        if !channel.is_alive() {
            tracing::debug!("disposing dead channel instead of re-idling");
            return;
        }
        let mut out_buf = mem::take(&mut self.out_buf);
        let mut scratch = mem::take(&mut self.scratch);
        out_buf.clear();
        scratch.clear();
        let mut idle = self.shared.idle.lock().expect("pool lock poisoned");
        if !idle.closed && idle.entries.len() < self.shared.config.max_idle {
            idle.entries.push(IdleEntry {
                channel,
                out_buf,
                scratch,
            });
        }
        // The permit drops with `self`, after the push above, so live+idle
        // never exceeds max_active.
    }

    /// Close the channel and free the slot without re-idling.
    pub fn dispose(mut self) {
        self.channel.take();
    }
}
