//! Packet stream abstraction and send synchronization.
//!
//! The core never depends on how packets are framed or encoded; it talks to
//! a [`PacketStream`]. The receive side is single-consumer by contract and
//! is never locked. The send side is shared by the announce task and every
//! in-flight content task, so [`SyncStream`] serializes it with a mutex.
//! That lock guarantees per-packet atomicity only, not ordering across
//! packets from different tasks.

use crate::protocol::packet::Packet;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

/// An ordered, lossless duplex packet channel.
#[async_trait]
pub trait PacketStream: Send + Sync {
    /// Receive the next packet. Invoked by a single logical consumer.
    async fn recv(&self) -> Result<Packet>;

    /// Send one packet. Callers must not interleave partial packets; wrap
    /// the stream in [`SyncStream`] before sharing it across tasks.
    async fn send(&self, packet: Packet) -> Result<()>;
}

/// Wraps a [`PacketStream`] so multiple concurrent tasks may send safely.
pub struct SyncStream<S> {
    inner: S,
    send_lock: Mutex<()>,
}

impl<S: PacketStream> SyncStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            send_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl<S: PacketStream> PacketStream for SyncStream<S> {
    async fn recv(&self) -> Result<Packet> {
        self.inner.recv().await
    }

    async fn send(&self, packet: Packet) -> Result<()> {
        let _guard = self.send_lock.lock().await;
        self.inner.send(packet).await
    }
}
