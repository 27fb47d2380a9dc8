//! Disk writer: applies decided changes under a destination root.
//!
//! Directories, symlinks, fifos and device nodes are recreated structurally.
//! Regular-file content goes through the async-data callback supplied by the
//! receiver, which streams network-delivered bytes into a temp file that is
//! renamed into place once complete. File writes run as concurrent tasks;
//! [`DiskWriter::wait`] joins them all and surfaces the first error.

use crate::diff::{Change, ChangeHandler};
use crate::walk::{Entry, EntryKind};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

/// Async-data callback: fills the opened destination file with the content
/// of the named source-relative path.
pub type FetchFn =
    Arc<dyn Fn(String, fs::File) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub struct DiskWriter {
    dest: PathBuf,
    fetch: FetchFn,
    tasks: Mutex<JoinSet<Result<()>>>,
}

impl DiskWriter {
    pub fn new(dest: PathBuf, fetch: FetchFn) -> Self {
        Self {
            dest,
            fetch,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub async fn apply(&self, change: Change) -> Result<()> {
        match change {
            Change::Add(entry) | Change::Update(entry) => self.write_entry(entry).await,
            Change::Delete(entry) => self.delete_entry(entry).await,
        }
    }

    /// Block until every scheduled file write has finished.
    pub async fn wait(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.join_next().await {
            joined.context("disk write task panicked")??;
        }
        Ok(())
    }

    async fn write_entry(&self, entry: Entry) -> Result<()> {
        let target = validate_path(&self.dest, &entry.path)?;
        match entry.kind() {
            EntryKind::Dir => {
                if let Ok(meta) = fs::symlink_metadata(&target).await {
                    if !meta.is_dir() {
                        fs::remove_file(&target).await.with_context(|| {
                            format!("failed to replace entry with directory {}", entry.path)
                        })?;
                    }
                }
                fs::create_dir_all(&target)
                    .await
                    .with_context(|| format!("failed to create directory {}", entry.path))?;
                set_mode(&target, entry.mode).await;
            }
            EntryKind::Symlink => {
                let link_target = entry
                    .link_target
                    .clone()
                    .with_context(|| format!("symlink entry without target: {}", entry.path))?;
                validate_symlink_target(&self.dest, &target, &link_target)?;
                let _ = fs::remove_file(&target).await;
                fs::symlink(&link_target, &target)
                    .await
                    .with_context(|| format!("failed to create symlink {}", entry.path))?;
            }
            EntryKind::Fifo | EntryKind::CharDevice | EntryKind::BlockDevice => {
                let _ = fs::remove_file(&target).await;
                make_node(&target, entry.mode, entry.rdev)
                    .with_context(|| format!("failed to create node {}", entry.path))?;
            }
            EntryKind::File => {
                if let Ok(meta) = fs::symlink_metadata(&target).await {
                    if meta.is_dir() {
                        fs::remove_dir_all(&target).await.with_context(|| {
                            format!("failed to replace directory with file {}", entry.path)
                        })?;
                    }
                }
                let fetch = self.fetch.clone();
                self.tasks
                    .lock()
                    .await
                    .spawn(write_file(target, entry, fetch));
            }
            EntryKind::Socket | EntryKind::Other => {
                tracing::warn!(path = %entry.path, mode = entry.mode, "skipping unsupported entry type");
            }
        }
        Ok(())
    }

    async fn delete_entry(&self, entry: Entry) -> Result<()> {
        let target = validate_path(&self.dest, &entry.path)?;
        let removed = if entry.is_dir() {
            fs::remove_dir_all(&target).await
        } else {
            fs::remove_file(&target).await
        };
        match removed {
            Ok(()) => Ok(()),
            // already gone, e.g. with a deleted parent directory
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to delete {}", entry.path)),
        }
    }
}

#[async_trait]
impl ChangeHandler for DiskWriter {
    async fn handle_change(&self, change: Change) -> Result<()> {
        tracing::trace!(path = %change.path(), "applying change");
        self.apply(change).await
    }
}

async fn write_file(target: PathBuf, entry: Entry, fetch: FetchFn) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create parent directory for {}", entry.path))?;
    }

    let temp = temp_path(&target);
    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp)
        .await
        .with_context(|| format!("failed to create temp file for {}", entry.path))?;

    if let Err(err) = fetch(entry.path.clone(), file).await {
        let _ = fs::remove_file(&temp).await;
        return Err(err);
    }

    fs::rename(&temp, &target)
        .await
        .with_context(|| format!("failed to move {} into place", entry.path))?;
    set_mode(&target, entry.mode).await;

    let stamp = filetime::FileTime::from_unix_time(entry.mtime, 0);
    let path = target.clone();
    tokio::task::spawn_blocking(move || filetime::set_file_mtime(&path, stamp))
        .await
        .context("mtime task panicked")?
        .with_context(|| format!("failed to set mtime for {}", entry.path))?;
    Ok(())
}

fn temp_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".treesync.tmp");
    target.with_file_name(name)
}

async fn set_mode(target: &Path, mode: u32) {
    let perms = std::fs::Permissions::from_mode(mode & 0o7777);
    if let Err(err) = fs::set_permissions(target, perms).await {
        tracing::warn!(path = %target.display(), error = %err, "failed to set permissions");
    }
}

fn make_node(path: &Path, mode: u32, rdev: u64) -> Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).context("path contains NUL")?;
    let result = unsafe { libc::mknod(c_path.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) };
    if result != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Reject paths that could escape the destination root.
fn validate_path(root: &Path, relative: &str) -> Result<PathBuf> {
    if relative.is_empty() {
        anyhow::bail!("empty path not allowed");
    }
    let rel = Path::new(relative);
    if rel.is_absolute() {
        anyhow::bail!("absolute path not allowed: {relative}");
    }
    for component in rel.components() {
        match component {
            Component::ParentDir => anyhow::bail!("path traversal not allowed: {relative}"),
            Component::Prefix(_) => anyhow::bail!("prefixed path not allowed: {relative}"),
            _ => {}
        }
    }
    Ok(root.join(rel))
}

/// Symlink targets must stay inside the destination root.
fn validate_symlink_target(root: &Path, link: &Path, target: &str) -> Result<()> {
    let target_path = Path::new(target);
    if target_path.is_absolute() {
        anyhow::bail!(
            "absolute symlink target not allowed: {} -> {target}",
            link.display()
        );
    }
    if let Some(parent) = link.parent() {
        // normalize both sides, a root like `/tmp/./dst` must not change
        // the verdict
        let resolved = normalize(&parent.join(target_path));
        if !resolved.starts_with(normalize(root)) {
            anyhow::bail!(
                "symlink target escapes destination root: {} -> {target}",
                link.display()
            );
        }
    }
    Ok(())
}

/// Lexical normalization: drops `.` components and resolves `..` upward.
fn normalize(path: &Path) -> PathBuf {
    let mut resolved = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                resolved.pop();
            }
            Component::CurDir => {}
            c => resolved.push(c),
        }
    }
    resolved
}
