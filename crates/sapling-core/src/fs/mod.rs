/// Filesystem data provider.
///
/// Children of a directory are its immediate entries, listed with `jwalk`
/// at depth 1. Directories sort before files (unless disabled), names
/// compare case-insensitively, and dot-files are filtered out unless hidden
/// entries are enabled.
pub mod entry;
pub mod size;

pub use entry::FsEntry;

use crate::provider::{ChildComparator, ChildFilter, DataProvider};
use anyhow::Context;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct FileSystemProvider {
    root: PathBuf,
    show_hidden: bool,
    dirs_first: bool,
}

impl FileSystemProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            show_hidden: false,
            dirs_first: true,
        }
    }

    /// Include dot-prefixed entries.
    pub fn with_hidden(mut self, show_hidden: bool) -> Self {
        self.show_hidden = show_hidden;
        self
    }

    /// Sort directories before files (the default).
    pub fn with_dirs_first(mut self, dirs_first: bool) -> Self {
        self.dirs_first = dirs_first;
        self
    }

    pub fn root_path(&self) -> &std::path::Path {
        &self.root
    }
}

impl DataProvider for FileSystemProvider {
    type Node = FsEntry;

    fn root(&self) -> FsEntry {
        FsEntry::from_path(&self.root).unwrap_or_else(|err| {
            debug!("Cannot stat root {}: {err}", self.root.display());
            FsEntry::unreadable_dir(&self.root)
        })
    }

    fn children(&self, parent: &FsEntry) -> anyhow::Result<Vec<FsEntry>> {
        // jwalk reports an unreadable directory as an error entry; probe it
        // first so the failure belongs to the parent rather than being skipped.
        std::fs::read_dir(&parent.path)
            .with_context(|| format!("listing {}", parent.path.display()))?;

        let walker = jwalk::WalkDir::new(&parent.path)
            .min_depth(1)
            .max_depth(1)
            .skip_hidden(false)
            .follow_links(false)
            .parallelism(jwalk::Parallelism::Serial);

        let mut children = Vec::new();
        for entry_result in walker {
            let entry = match entry_result {
                Ok(e) => e,
                Err(err) => {
                    debug!("Skipping unreadable entry under {}: {err}", parent.path.display());
                    continue;
                }
            };
            let is_dir = entry.file_type().is_dir();
            let (size, modified) = match entry.metadata() {
                Ok(meta) => (if is_dir { 0 } else { meta.len() }, meta.modified().ok()),
                Err(_) => (0, None),
            };
            children.push(FsEntry {
                name: entry.file_name().to_string_lossy().as_ref().into(),
                path: entry.path(),
                is_dir,
                size,
                modified,
            });
        }
        Ok(children)
    }

    fn children_comparator(&self, _parent: &FsEntry) -> Option<ChildComparator<FsEntry>> {
        let dirs_first = self.dirs_first;
        Some(Box::new(move |a, b| {
            let by_kind = if dirs_first {
                b.is_dir.cmp(&a.is_dir)
            } else {
                std::cmp::Ordering::Equal
            };
            by_kind.then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        }))
    }

    fn children_filter(&self, _parent: &FsEntry) -> Option<ChildFilter<FsEntry>> {
        if self.show_hidden {
            None
        } else {
            Some(Box::new(|entry| !entry.is_hidden()))
        }
    }

    fn is_leaf(&self, node: &FsEntry) -> bool {
        !node.is_dir
    }
}
