//! Sender state machine.
//!
//! Walks a source tree, announces every entry's metadata, and on demand
//! streams file content for entries the destination requests. Transfers are
//! unbounded fan-out: each request spawns its own content task, so the
//! destination can pipeline any number of outstanding requests and saturate
//! the transport instead of serializing them.

use crate::error::ProtocolError;
use crate::protocol::packet::Packet;
use crate::protocol::stream::{PacketStream, SyncStream};
use crate::walk::{walk, Entry, WalkOptions};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

/// Copy buffer size for file content (32KB)
pub const COPY_BUF_SIZE: usize = 32 * 1024;

/// Channel size between the blocking walk and the announce task
const WALK_CHANNEL_SIZE: usize = 128;

/// Progress observer: `(cumulative_bytes, done)`. Invoked after every packet
/// the sender emits, and once more with `done = true` when the exchange ends.
pub type ProgressFn = Box<dyn Fn(u64, bool) + Send + Sync>;

/// Run the source side of one exchange until the destination signals `Fin`
/// or an unrecoverable error occurs. Outstanding walk and content tasks are
/// aborted on return.
pub async fn send<S>(
    stream: S,
    root: impl Into<PathBuf>,
    options: WalkOptions,
    progress: Option<ProgressFn>,
) -> Result<()>
where
    S: PacketStream + 'static,
{
    let sender = Arc::new(Sender {
        stream: SyncStream::new(stream),
        root: root.into(),
        files: Mutex::new(HashMap::new()),
        progress,
        sent: AtomicU64::new(0),
    });
    sender.run(options).await
}

struct Sender<S> {
    stream: SyncStream<S>,
    root: PathBuf,
    /// Transfer table: id -> source-relative path, consumed once per request.
    files: Mutex<HashMap<u32, String>>,
    progress: Option<ProgressFn>,
    sent: AtomicU64,
}

impl<S: PacketStream + 'static> Sender<S> {
    async fn run(self: Arc<Self>, options: WalkOptions) -> Result<()> {
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        {
            let sender = self.clone();
            tasks.spawn(async move { sender.announce(options).await });
        }
        let result = self.clone().dispatch(&mut tasks).await;
        self.update_progress(0, true);
        // dropping the set aborts any outstanding walk or content work
        result
    }

    /// Message loop: one content task per request, `Fin` echoed to finish.
    /// Task failures are joined back here so a content or walk error aborts
    /// the whole exchange.
    async fn dispatch(self: Arc<Self>, tasks: &mut JoinSet<Result<()>>) -> Result<()> {
        loop {
            tokio::select! {
                packet = self.stream.recv() => {
                    match packet.context("failed to receive packet")? {
                        Packet::Req { id } => {
                            let path = self
                                .files
                                .lock()
                                .await
                                .remove(&id)
                                .ok_or(ProtocolError::InvalidFileId(id))?;
                            tracing::debug!(id, path = %path, "content requested");
                            let sender = self.clone();
                            tasks.spawn(async move { sender.send_file(id, path).await });
                        }
                        Packet::Fin => {
                            self.stream
                                .send(Packet::Fin)
                                .await
                                .context("failed to acknowledge fin")?;
                            return Ok(());
                        }
                        // stats and data carry no meaning on this side
                        Packet::Stat(_) | Packet::Data { .. } => {}
                    }
                }
                Some(joined) = tasks.join_next() => {
                    joined.context("sender task panicked")??;
                }
            }
        }
    }

    /// Walk the source tree, announcing each entry under the next sequential
    /// id, then terminate the metadata stream.
    async fn announce(self: Arc<Self>, options: WalkOptions) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<Result<Entry>>(WALK_CHANNEL_SIZE);
        let root = self.root.clone();
        let walker = tokio::task::spawn_blocking(move || {
            let result = walk(&root, &options, |entry| {
                tx.blocking_send(Ok(entry))
                    .map_err(|_| anyhow::anyhow!("walk output channel closed"))
            });
            if let Err(err) = result {
                let _ = tx.blocking_send(Err(err));
            }
        });

        let mut next_id: u32 = 0;
        while let Some(entry) = rx.recv().await {
            let entry = entry?;
            if entry.is_file() {
                self.files.lock().await.insert(next_id, entry.path.clone());
            }
            next_id += 1;

            let path = entry.path.clone();
            let packet = Packet::Stat(Some(entry));
            self.update_progress(packet.wire_size(), false);
            self.stream
                .send(packet)
                .await
                .with_context(|| format!("failed to send stat for {path}"))?;
        }
        walker.await.context("walk task panicked")?;

        let terminator = Packet::Stat(None);
        self.update_progress(terminator.wire_size(), false);
        self.stream
            .send(terminator)
            .await
            .context("failed to send final stat")
    }

    /// Stream one file's content as data chunks, terminated by an empty
    /// chunk. A file that cannot be opened is sent as empty content: the
    /// walk already announced it, and aborting the whole exchange for one
    /// unreadable file is worse than converging without it.
    async fn send_file(self: Arc<Self>, id: u32, path: String) -> Result<()> {
        match File::open(self.root.join(&path)).await {
            Ok(file) => {
                let mut reader = BufReader::new(file);
                let mut buf = vec![0u8; COPY_BUF_SIZE];
                loop {
                    let n = reader
                        .read(&mut buf)
                        .await
                        .with_context(|| format!("failed to read {path}"))?;
                    if n == 0 {
                        break;
                    }
                    let packet = Packet::Data {
                        id,
                        data: buf[..n].to_vec(),
                    };
                    self.update_progress(packet.wire_size(), false);
                    self.stream
                        .send(packet)
                        .await
                        .with_context(|| format!("failed to send data for {path}"))?;
                }
            }
            Err(err) => {
                tracing::warn!(path = %path, error = %err, "failed to open source file, sending empty content");
            }
        }
        let terminator = Packet::Data {
            id,
            data: Vec::new(),
        };
        self.update_progress(terminator.wire_size(), false);
        self.stream
            .send(terminator)
            .await
            .with_context(|| format!("failed to send end of content for {path}"))
    }

    fn update_progress(&self, delta: u64, done: bool) {
        if let Some(callback) = &self.progress {
            let total = self.sent.fetch_add(delta, Ordering::Relaxed) + delta;
            callback(total, done);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::stream::testing::ScriptedStream;
    use std::fs;
    use tempfile::TempDir;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn request_for_unknown_id_is_fatal() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "abcd").unwrap();

        let stream = ScriptedStream::new(vec![Packet::Req { id: 7 }]);
        let err = timeout(
            Duration::from_secs(10),
            send(stream, tmp.path(), WalkOptions::default(), None),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert_eq!(err.to_string(), "invalid file id 7");
    }

    #[tokio::test]
    async fn request_for_directory_id_is_fatal() {
        // directories are announced but never enter the transfer table, so
        // requesting their id is the same contract violation
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub").join("f.txt"), "x").unwrap();

        // id 0 is the directory entry
        let stream = ScriptedStream::new(vec![Packet::Req { id: 0 }]);
        let err = timeout(
            Duration::from_secs(10),
            send(stream, tmp.path(), WalkOptions::default(), None),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert_eq!(err.to_string(), "invalid file id 0");
    }

    #[tokio::test]
    async fn fin_is_echoed_and_ends_the_exchange() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "abcd").unwrap();

        let stream = ScriptedStream::new(vec![Packet::Fin]);
        timeout(
            Duration::from_secs(10),
            send(stream, tmp.path(), WalkOptions::default(), None),
        )
        .await
        .unwrap()
        .unwrap();
    }

    struct Shared(Arc<ScriptedStream>);

    #[async_trait::async_trait]
    impl PacketStream for Shared {
        async fn recv(&self) -> Result<Packet> {
            self.0.recv().await
        }
        async fn send(&self, packet: Packet) -> Result<()> {
            self.0.send(packet).await
        }
    }

    #[tokio::test]
    async fn announces_every_entry_then_terminates() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "abcd").unwrap();
        fs::create_dir(tmp.path().join("d")).unwrap();

        let scripted = Arc::new(ScriptedStream::new(vec![]));
        let sender = Arc::new(Sender {
            stream: SyncStream::new(Shared(scripted.clone())),
            root: tmp.path().to_path_buf(),
            files: Mutex::new(HashMap::new()),
            progress: None,
            sent: AtomicU64::new(0),
        });
        sender.clone().announce(WalkOptions::default()).await.unwrap();

        let sent = scripted.sent();
        let paths: Vec<Option<String>> = sent
            .iter()
            .map(|p| match p {
                Packet::Stat(Some(e)) => Some(e.path.clone()),
                Packet::Stat(None) => None,
                other => panic!("unexpected packet {other:?}"),
            })
            .collect();
        assert_eq!(
            paths,
            vec![Some("a.txt".to_string()), Some("d".to_string()), None]
        );

        // only the regular file enters the transfer table, under id 0
        let files = sender.files.lock().await;
        assert_eq!(files.len(), 1);
        assert_eq!(files.get(&0).map(String::as_str), Some("a.txt"));
    }
}
