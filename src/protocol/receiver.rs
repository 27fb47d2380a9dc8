//! Receiver state machine.
//!
//! Consumes the source's metadata announcement, diffs it against the
//! destination tree, requests content for files that need it, and routes
//! incoming data chunks to the per-file write task that asked for them.
//! The exchange ends with a mutual `Fin`: the receiver sends its `Fin` once
//! every disk write has finished, and returns when the source echoes it.

use crate::apply::{DiskWriter, FetchFn};
use crate::diff::double_walk_diff;
use crate::error::ProtocolError;
use crate::protocol::packet::Packet;
use crate::protocol::stream::{PacketStream, SyncStream};
use crate::walk::{walk, Entry, WalkOptions};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Channel size between the packet loop and the diff task
const FORWARD_CHANNEL_SIZE: usize = 128;

/// Channel size between the packet loop and one file's write task
const SINK_CHANNEL_SIZE: usize = 8;

/// Run the destination side of one exchange, making `dest` converge to the
/// tree the peer announces. Returns once the peer has echoed `Fin`.
pub async fn receive<S>(stream: S, dest: impl Into<PathBuf>) -> Result<()>
where
    S: PacketStream + 'static,
{
    let receiver = Arc::new(Receiver {
        stream: SyncStream::new(stream),
        dest: dest.into(),
        ids: Mutex::new(HashMap::new()),
        sinks: Mutex::new(HashMap::new()),
    });
    receiver.run().await
}

struct Receiver<S> {
    stream: SyncStream<S>,
    dest: PathBuf,
    /// Pending table: announced path -> id, consumed when content is fetched.
    ids: Mutex<HashMap<String, u32>>,
    /// Open content sinks: id -> chunk channel of the file's write task.
    sinks: Mutex<HashMap<u32, mpsc::Sender<Vec<u8>>>>,
}

impl<S: PacketStream + 'static> Receiver<S> {
    async fn run(self: Arc<Self>) -> Result<()> {
        tokio::fs::create_dir_all(&self.dest)
            .await
            .with_context(|| format!("failed to create destination {}", self.dest.display()))?;

        let (local_tx, local_rx) = mpsc::channel::<Result<Entry>>(FORWARD_CHANNEL_SIZE);
        let dest = self.dest.clone();
        let mut local_walk = Some(tokio::task::spawn_blocking(move || {
            let result = walk(&dest, &WalkOptions::default(), |entry| {
                local_tx
                    .blocking_send(Ok(entry))
                    .map_err(|_| anyhow::anyhow!("local walk channel closed"))
            });
            if let Err(err) = result {
                let _ = local_tx.blocking_send(Err(err));
            }
        }));

        let writer = Arc::new(DiskWriter::new(self.dest.clone(), self.fetcher()));
        let (forward_tx, forward_rx) = mpsc::channel::<Entry>(FORWARD_CHANNEL_SIZE);
        let mut forward_tx = Some(forward_tx);
        let mut diff_task = {
            let writer = writer.clone();
            Some(tokio::spawn(async move {
                double_walk_diff(local_rx, forward_rx, &*writer).await
            }))
        };

        // spawned once the metadata stream ends; waits out the disk writes
        // and sends our side of the fin handshake
        let mut fin_task: Option<JoinHandle<Result<()>>> = None;
        let mut fin_sent = false;
        let mut next_id: u32 = 0;

        loop {
            tokio::select! {
                packet = self.stream.recv() => match packet.context("failed to receive packet")? {
                    Packet::Stat(Some(entry)) => {
                        if entry.is_file() {
                            self.ids.lock().await.insert(entry.path.clone(), next_id);
                        }
                        next_id += 1;

                        let tx = forward_tx
                            .as_ref()
                            .context("stat received after metadata terminator")?;
                        if tx.send(entry).await.is_err() {
                            // the diff ended early, surface its error
                            diff_task
                                .take()
                                .context("diff task already joined")?
                                .await
                                .context("diff task panicked")??;
                            anyhow::bail!("diff ended before the metadata stream");
                        }
                    }
                    Packet::Stat(None) => {
                        // closing the forward channel lets the diff drain;
                        // every change is decided once it returns
                        forward_tx = None;
                        diff_task
                            .take()
                            .context("metadata terminator received twice")?
                            .await
                            .context("diff task panicked")??;
                        if let Some(task) = local_walk.take() {
                            task.await.context("local walk task panicked")?;
                        }

                        let receiver = self.clone();
                        let writer = writer.clone();
                        fin_task = Some(tokio::spawn(async move {
                            writer.wait().await?;
                            receiver
                                .stream
                                .send(Packet::Fin)
                                .await
                                .context("failed to send fin")
                        }));
                    }
                    Packet::Data { id, data } => {
                        if data.is_empty() {
                            // end of content, dropping the sink closes the
                            // write task's channel
                            self.sinks
                                .lock()
                                .await
                                .remove(&id)
                                .ok_or(ProtocolError::StrayData(id))?;
                        } else {
                            let tx = self
                                .sinks
                                .lock()
                                .await
                                .get(&id)
                                .cloned()
                                .ok_or(ProtocolError::StrayData(id))?;
                            tx.send(data)
                                .await
                                .with_context(|| format!("content sink closed for file id {id}"))?;
                        }
                    }
                    Packet::Fin => {
                        if let Some(task) = fin_task.take() {
                            task.await.context("finish task panicked")??;
                        } else if !fin_sent {
                            anyhow::bail!("fin received before metadata terminator");
                        }
                        return Ok(());
                    }
                    // requests flow the other way
                    Packet::Req { .. } => {}
                },
                joined = async { fin_task.as_mut().unwrap().await }, if fin_task.is_some() => {
                    // a failed disk write aborts the exchange instead of
                    // leaving us waiting for a fin that will never come
                    joined.context("finish task panicked")??;
                    fin_task = None;
                    fin_sent = true;
                }
            }
        }
    }

    /// Async-data callback handed to the disk writer. Looks up the announced
    /// id for the path, opens a content sink under it, asks the peer for the
    /// content and pumps the chunks into the destination file.
    fn fetcher(self: &Arc<Self>) -> FetchFn {
        let receiver = self.clone();
        Arc::new(move |path, file| {
            let receiver = receiver.clone();
            Box::pin(async move { receiver.fetch(path, file).await })
        })
    }

    async fn fetch(self: Arc<Self>, path: String, file: tokio::fs::File) -> Result<()> {
        let id = self
            .ids
            .lock()
            .await
            .remove(&path)
            .ok_or_else(|| ProtocolError::InvalidFileRequest(path.clone()))?;

        // register the sink before requesting so no chunk can beat it
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(SINK_CHANNEL_SIZE);
        self.sinks.lock().await.insert(id, tx);
        self.stream
            .send(Packet::Req { id })
            .await
            .with_context(|| format!("failed to request content for {path}"))?;

        let mut writer = BufWriter::new(file);
        while let Some(chunk) = rx.recv().await {
            writer
                .write_all(&chunk)
                .await
                .with_context(|| format!("failed to write content for {path}"))?;
        }
        writer
            .flush()
            .await
            .with_context(|| format!("failed to flush content for {path}"))
    }
}
