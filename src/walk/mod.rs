//! Deterministic filesystem walk.
//!
//! Produces one [`Entry`] per filesystem object under a root, depth-first
//! with children sorted by file name, so that two walks of identical trees
//! yield identical sequences. The sender and receiver both rely on this
//! ordering: entry ids are never carried in `Stat` packets, they are
//! reconstructed from arrival order alone.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

/// One filesystem object, with the stat surface needed to recreate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Path relative to the walk root, slash-separated.
    pub path: String,
    /// Raw unix mode, type bits included.
    pub mode: u32,
    pub size: u64,
    /// Modification time, unix seconds.
    pub mtime: i64,
    pub uid: u32,
    pub gid: u32,
    /// Device number for character/block device entries.
    pub rdev: u64,
    /// Symlink target, present only for symlink entries.
    pub link_target: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Fifo,
    CharDevice,
    BlockDevice,
    Socket,
    Other,
}

impl Entry {
    pub fn kind(&self) -> EntryKind {
        match self.mode & (libc::S_IFMT as u32) {
            m if m == libc::S_IFREG as u32 => EntryKind::File,
            m if m == libc::S_IFDIR as u32 => EntryKind::Dir,
            m if m == libc::S_IFLNK as u32 => EntryKind::Symlink,
            m if m == libc::S_IFIFO as u32 => EntryKind::Fifo,
            m if m == libc::S_IFCHR as u32 => EntryKind::CharDevice,
            m if m == libc::S_IFBLK as u32 => EntryKind::BlockDevice,
            m if m == libc::S_IFSOCK as u32 => EntryKind::Socket,
            _ => EntryKind::Other,
        }
    }

    /// Only regular files are eligible for content transfer.
    pub fn is_file(&self) -> bool {
        self.kind() == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == EntryKind::Dir
    }

    /// Approximate encoded size, used only for progress accounting.
    pub fn wire_size(&self) -> u64 {
        let link = self.link_target.as_ref().map_or(0, |t| t.len());
        40 + self.path.len() as u64 + link as u64
    }
}

/// Walk options.
///
/// Include patterns select which entries are announced; directories on the
/// way to a potential match are kept so the receiver can recreate the tree.
/// Exclude patterns prune whole subtrees.
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub follow_links: bool,
}

struct Filter {
    include: Vec<glob::Pattern>,
    include_raw: Vec<String>,
    exclude: Vec<glob::Pattern>,
}

impl Filter {
    fn new(options: &WalkOptions) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<glob::Pattern>> {
            patterns
                .iter()
                .map(|p| glob::Pattern::new(p).with_context(|| format!("invalid pattern {p}")))
                .collect()
        };
        Ok(Self {
            include: compile(&options.include_patterns)?,
            include_raw: options.include_patterns.clone(),
            exclude: compile(&options.exclude_patterns)?,
        })
    }

    fn keep(&self, path: &str, is_dir: bool) -> bool {
        if self.exclude.iter().any(|p| p.matches(path)) {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        if self.include.iter().any(|p| p.matches(path)) {
            return true;
        }
        is_dir && self.include_raw.iter().any(|raw| prefix_matches(raw, path))
    }
}

/// Whether a pattern truncated to this directory's depth still matches it,
/// meaning a match could live somewhere below.
fn prefix_matches(pattern: &str, dir: &str) -> bool {
    let depth = dir.split('/').count();
    let prefix: Vec<&str> = pattern.split('/').take(depth).collect();
    if prefix.iter().any(|c| *c == "**") {
        return true;
    }
    match glob::Pattern::new(&prefix.join("/")) {
        Ok(p) => p.matches(dir),
        Err(_) => false,
    }
}

/// Walk `root` in deterministic order, calling `visit` for each entry.
///
/// Blocking; callers on the async side bridge it through `spawn_blocking`
/// and a channel. Aborts on the first walk or visitor error.
pub fn walk(
    root: &Path,
    options: &WalkOptions,
    mut visit: impl FnMut(Entry) -> Result<()>,
) -> Result<()> {
    let filter = Filter::new(options)?;
    let filter_root = root.to_path_buf();

    let mut builder = ignore::WalkBuilder::new(root);
    builder
        .hidden(false)
        .ignore(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .parents(false)
        .follow_links(options.follow_links)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(move |dent| {
            if dent.depth() == 0 {
                return true;
            }
            let Some(rel) = relative_path(dent.path(), &filter_root) else {
                return true;
            };
            let is_dir = dent.file_type().is_some_and(|t| t.is_dir());
            filter.keep(&rel, is_dir)
        });

    for result in builder.build() {
        let dent = result.context("walk failed")?;
        if dent.depth() == 0 {
            continue;
        }
        let path = relative_path(dent.path(), root)
            .with_context(|| format!("entry outside walk root: {}", dent.path().display()))?;
        let meta = std::fs::symlink_metadata(dent.path())
            .with_context(|| format!("failed to stat {path}"))?;
        let link_target = if meta.file_type().is_symlink() {
            let target = std::fs::read_link(dent.path())
                .with_context(|| format!("failed to read link target of {path}"))?;
            Some(target.to_string_lossy().into_owned())
        } else {
            None
        };
        visit(Entry {
            path,
            mode: meta.mode(),
            size: meta.len(),
            mtime: meta.mtime(),
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev(),
            link_target,
        })?;
    }
    Ok(())
}

/// Slash-separated path of `path` relative to `root`, or `None` if outside.
fn relative_path(path: &Path, root: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(p) => Some(p.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    Some(parts.join("/"))
}
