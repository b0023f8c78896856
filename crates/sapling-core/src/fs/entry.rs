/// A single file or directory as seen by the filesystem provider.
use crate::node::TreeNode;
use compact_str::CompactString;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEntry {
    /// Full path; also the node key.
    pub path: PathBuf,
    /// File name only. Drive roots use their display form (e.g. `C:`).
    pub name: CompactString,
    pub is_dir: bool,
    /// Logical size in bytes; `0` for directories.
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl FsEntry {
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            name: display_name(path),
            is_dir: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified: meta.modified().ok(),
        })
    }

    /// Placeholder for a root that cannot be stat'ed. Loading its children
    /// will fail, which surfaces the problem on the node.
    pub fn unreadable_dir(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            name: display_name(path),
            is_dir: true,
            size: 0,
            modified: None,
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.name.starts_with('.')
    }
}

impl TreeNode for FsEntry {
    type Key = PathBuf;

    fn key(&self) -> PathBuf {
        self.path.clone()
    }
}

/// Name shown for a path: the last component, or the trimmed path itself
/// for roots such as `/` or `C:\`.
fn display_name(path: &Path) -> CompactString {
    match path.file_name() {
        Some(name) => CompactString::new(name.to_string_lossy()),
        None => {
            let s = path.to_string_lossy();
            let trimmed = s.trim_end_matches(['\\', '/']);
            CompactString::new(if trimmed.is_empty() { s.as_ref() } else { trimmed })
        }
    }
}
