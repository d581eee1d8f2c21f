//! Tree scanning

use crate::error::{Error, Result};
use crate::plan::exclude::ExcludeSet;
use std::collections::BTreeMap;
use std::fs::Metadata;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Kind of a tree entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Other,
}

/// Size and modification time of one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStat {
    pub kind: EntryKind,
    pub size: u64,
    /// Seconds since the Unix epoch
    pub mtime: i64,
}

impl EntryStat {
    fn from_metadata(meta: &Metadata) -> Self {
        let file_type = meta.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };

        let mtime = match meta.modified() {
            Ok(t) => match t.duration_since(UNIX_EPOCH) {
                Ok(d) => d.as_secs() as i64,
                Err(e) => -(e.duration().as_secs() as i64),
            },
            Err(_) => 0,
        };

        EntryStat {
            kind,
            size: meta.len(),
            mtime,
        }
    }
}

/// Snapshot of a directory tree, keyed by path relative to the root
#[derive(Debug, Clone, Default)]
pub struct TreeScan {
    pub root: PathBuf,
    pub entries: BTreeMap<PathBuf, EntryStat>,
}

impl TreeScan {
    /// Walk `root`, skipping excluded entries and everything below them
    pub fn collect(root: &Path, exclude: &ExcludeSet, follow_links: bool) -> Result<Self> {
        Self::collect_scoped(root, Path::new(""), exclude, follow_links)
    }

    /// Walk only `root/scope`, keying entries relative to `root`.
    ///
    /// An empty scope is the whole tree. A scope missing under `root` gives
    /// an empty scan.
    pub fn collect_scoped(
        root: &Path,
        scope: &Path,
        exclude: &ExcludeSet,
        follow_links: bool,
    ) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::Internal(format!(
                "scan root {} is not a directory",
                root.display()
            )));
        }

        let mut entries = BTreeMap::new();
        let start = root.join(scope);
        if std::fs::symlink_metadata(&start).is_err() {
            debug!("{:?} does not exist, nothing to scan", start);
            return Ok(TreeScan {
                root: root.to_path_buf(),
                entries,
            });
        }

        let walker = WalkDir::new(&start)
            .follow_links(follow_links)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| match entry.path().strip_prefix(root) {
                Ok(rel) => rel.as_os_str().is_empty() || !exclude.is_excluded(rel),
                Err(_) => true,
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Ignoring unreadable entry: {}", e);
                    continue;
                }
            };
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("Ignoring {:?} (unable to stat): {}", entry.path(), e);
                    continue;
                }
            };
            let rel = match entry.path().strip_prefix(root) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
                _ => continue,
            };
            entries.insert(rel, EntryStat::from_metadata(&meta));
        }

        debug!("Scanned {} entries under {:?}", entries.len(), root);
        Ok(TreeScan {
            root: root.to_path_buf(),
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// BLAKE3 hash of a file's content
    pub fn content_hash(&self, rel: &Path) -> Result<blake3::Hash> {
        let mut file = std::fs::File::open(self.root.join(rel))?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize())
    }
}
