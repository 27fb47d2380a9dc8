//! Framed packet transport.
//!
//! One concrete [`PacketStream`]: a length-prefixed bincode framing over any
//! `AsyncRead`/`AsyncWrite` pair (a TCP socket, an SSH subprocess's stdio,
//! an in-memory duplex in tests). The protocol core never depends on this;
//! callers pick whatever transport fits their channel.
//!
//! Frame format: `len:u32 (big-endian) | bincode(Packet)`.

use crate::protocol::{Packet, PacketStream};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

pub struct FramedStream<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
}

impl<R, W> FramedStream<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<R, W> PacketStream for FramedStream<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn recv(&self) -> Result<Packet> {
        let mut reader = self.reader.lock().await;
        let len = reader
            .read_u32()
            .await
            .context("failed to read frame length")?;
        if len > MAX_FRAME_SIZE {
            anyhow::bail!("frame size {len} exceeds maximum {MAX_FRAME_SIZE}");
        }
        let mut payload = vec![0u8; len as usize];
        reader
            .read_exact(&mut payload)
            .await
            .context("failed to read frame payload")?;
        bincode::deserialize(&payload).context("failed to decode packet")
    }

    async fn send(&self, packet: Packet) -> Result<()> {
        let payload = bincode::serialize(&packet).context("failed to encode packet")?;
        let mut frame = BytesMut::with_capacity(4 + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_slice(&payload);

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&frame)
            .await
            .context("failed to write frame")?;
        writer.flush().await.context("failed to flush frame")?;
        Ok(())
    }
}

/// A connected pair of framed streams over an in-memory duplex channel.
/// Loopback transport for tests and examples.
pub fn loopback_pair(
    max_buf: usize,
) -> (
    FramedStream<ReadHalf<tokio::io::DuplexStream>, WriteHalf<tokio::io::DuplexStream>>,
    FramedStream<ReadHalf<tokio::io::DuplexStream>, WriteHalf<tokio::io::DuplexStream>>,
) {
    let (a, b) = tokio::io::duplex(max_buf);
    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);
    (FramedStream::new(ar, aw), FramedStream::new(br, bw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::walk::Entry;

    #[tokio::test]
    async fn frame_roundtrip() {
        let (a, b) = loopback_pair(64 * 1024);

        let entry = Entry {
            path: "dir/file.txt".to_string(),
            mode: libc::S_IFREG as u32 | 0o644,
            size: 11,
            mtime: 1234567890,
            uid: 0,
            gid: 0,
            rdev: 0,
            link_target: None,
        };
        a.send(Packet::Stat(Some(entry.clone()))).await.unwrap();
        a.send(Packet::Data {
            id: 3,
            data: b"hello world".to_vec(),
        })
        .await
        .unwrap();

        assert_eq!(b.recv().await.unwrap(), Packet::Stat(Some(entry)));
        assert_eq!(
            b.recv().await.unwrap(),
            Packet::Data {
                id: 3,
                data: b"hello world".to_vec()
            }
        );
    }

    #[tokio::test]
    async fn garbage_frame_is_an_error() {
        let (a, b) = tokio::io::duplex(1024);
        let (_ar, mut aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let framed = FramedStream::new(br, bw);

        aw.write_all(&[0, 0, 0, 3, 0xFF, 0xFF, 0xFF]).await.unwrap();
        assert!(framed.recv().await.is_err());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (a, b) = tokio::io::duplex(1024);
        let (_ar, mut aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let framed = FramedStream::new(br, bw);

        aw.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let err = framed.recv().await.unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }
}
