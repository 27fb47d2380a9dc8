//! Tree diff between two ordered entry sequences.
//!
//! Merges the destination's own walk against the stream of entries
//! announced by the source, in a single pass with no buffering: both
//! sequences arrive in walk order, so one comparison per step decides
//! whether an entry exists only locally (delete), only remotely (add),
//! or on both sides (update or skip).

use crate::walk::{Entry, EntryKind};
use anyhow::Result;
use async_trait::async_trait;
use std::cmp::Ordering;
use tokio::sync::mpsc;

/// A decided filesystem mutation.
#[derive(Debug, Clone)]
pub enum Change {
    /// Entry exists on the source only.
    Add(Entry),
    /// Entry exists on both sides but differs; carries the source entry.
    Update(Entry),
    /// Entry exists on the destination only; carries the local entry.
    Delete(Entry),
}

impl Change {
    pub fn path(&self) -> &str {
        match self {
            Change::Add(e) | Change::Update(e) | Change::Delete(e) => &e.path,
        }
    }
}

#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn handle_change(&self, change: Change) -> Result<()>;
}

/// Order consistent with the walk's depth-first emission: the separator
/// sorts before every other byte, so a directory's children follow it
/// immediately and precede its lexicographic successors.
pub fn compare_paths(a: &str, b: &str) -> Ordering {
    let key = |c: u8| if c == b'/' { 0 } else { c };
    let mut left = a.bytes();
    let mut right = b.bytes();
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match key(x).cmp(&key(y)) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

fn unchanged(local: &Entry, remote: &Entry) -> bool {
    if local.kind() != remote.kind() {
        return false;
    }
    match remote.kind() {
        EntryKind::File => {
            local.size == remote.size && local.mtime == remote.mtime && local.mode == remote.mode
        }
        EntryKind::Symlink => local.link_target == remote.link_target,
        EntryKind::Dir => local.mode == remote.mode,
        _ => local.mode == remote.mode && local.rdev == remote.rdev,
    }
}

/// Diff a local walk against a remote entry stream, invoking `handler` for
/// every decided change. The local stream carries walk results so a failed
/// destination walk aborts the diff; the remote stream ends when the peer's
/// metadata terminator closes it.
pub async fn double_walk_diff<H>(
    mut local: mpsc::Receiver<Result<Entry>>,
    mut remote: mpsc::Receiver<Entry>,
    handler: &H,
) -> Result<()>
where
    H: ChangeHandler + ?Sized,
{
    let mut next_local = local.recv().await.transpose()?;
    let mut next_remote = remote.recv().await;

    loop {
        let order = match (&next_local, &next_remote) {
            (None, None) => return Ok(()),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(l), Some(r)) => compare_paths(&l.path, &r.path),
        };
        match order {
            Ordering::Less => {
                let entry = next_local.take().unwrap();
                handler.handle_change(Change::Delete(entry)).await?;
                next_local = local.recv().await.transpose()?;
            }
            Ordering::Greater => {
                let entry = next_remote.take().unwrap();
                handler.handle_change(Change::Add(entry)).await?;
                next_remote = remote.recv().await;
            }
            Ordering::Equal => {
                let local_entry = next_local.take().unwrap();
                let remote_entry = next_remote.take().unwrap();
                if !unchanged(&local_entry, &remote_entry) {
                    handler.handle_change(Change::Update(remote_entry)).await?;
                }
                next_local = local.recv().await.transpose()?;
                next_remote = remote.recv().await;
            }
        }
    }
}
