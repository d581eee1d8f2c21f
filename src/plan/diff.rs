//! Tree comparison report

use crate::error::Result;
use crate::plan::scan::{EntryKind, EntryStat, TreeScan};
use std::fmt::Write;
use std::path::{Path, PathBuf};

/// How two trees are compared
#[derive(Debug, Clone, Copy, Default)]
pub struct CompareOptions {
    pub ignore_time: bool,
    /// Hash files whose size and time agree
    pub content: bool,
    /// Seconds of mtime difference still treated as equal
    pub modify_window: u64,
}

/// Which way an entry would have to travel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Local copy is new or newer
    Push(EntryStat),
    /// Remote copy is new or newer
    Pull(EntryStat),
    /// Same size and time, different content
    Content { local: EntryStat, remote: EntryStat },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub path: PathBuf,
    pub change: Change,
}

/// Differences between the local tree and the remote view
#[derive(Debug, Clone, Default)]
pub struct DiffReport {
    pub entries: Vec<DiffEntry>,
}

/// Objects and bytes moving one way
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionSummary {
    pub objects: u64,
    pub bytes: u64,
}

impl DiffReport {
    /// Compare two scans
    pub fn compare(local: &TreeScan, remote: &TreeScan, opts: CompareOptions) -> Result<Self> {
        let mut entries = Vec::new();

        for (path, local_stat) in &local.entries {
            match remote.entries.get(path) {
                Some(remote_stat) => {
                    if let Some(change) = compare_stats(local, remote, path, local_stat, remote_stat, opts)? {
                        entries.push(DiffEntry {
                            path: path.clone(),
                            change,
                        });
                    }
                }
                None => entries.push(DiffEntry {
                    path: path.clone(),
                    change: Change::Push(*local_stat),
                }),
            }
        }

        for (path, remote_stat) in &remote.entries {
            if !local.entries.contains_key(path) {
                entries.push(DiffEntry {
                    path: path.clone(),
                    change: Change::Pull(*remote_stat),
                });
            }
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(DiffReport { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push_summary(&self) -> DirectionSummary {
        self.summary(|c| match c {
            Change::Push(stat) => Some(*stat),
            _ => None,
        })
    }

    pub fn pull_summary(&self) -> DirectionSummary {
        self.summary(|c| match c {
            Change::Pull(stat) => Some(*stat),
            _ => None,
        })
    }

    fn summary(&self, pick: impl Fn(&Change) -> Option<EntryStat>) -> DirectionSummary {
        let mut summary = DirectionSummary::default();
        for stat in self.entries.iter().filter_map(|e| pick(&e.change)) {
            summary.objects += 1;
            if stat.kind == EntryKind::File {
                summary.bytes += stat.size;
            }
        }
        summary
    }

    /// One line per entry followed by the pull and push summaries
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            let path = entry.path.display();
            let _ = match &entry.change {
                Change::Push(stat) if stat.kind == EntryKind::File => {
                    writeln!(out, "--> {} ({})", path, format_size(stat.size))
                }
                Change::Push(_) => writeln!(out, "--> {}", path),
                Change::Pull(stat) if stat.kind == EntryKind::File => {
                    writeln!(out, "<-- {} ({})", path, format_size(stat.size))
                }
                Change::Pull(_) => writeln!(out, "<-- {}", path),
                Change::Content { local, remote } => writeln!(
                    out,
                    "<-> {} ({}/{})",
                    path,
                    format_size(local.size),
                    format_size(remote.size)
                ),
            };
        }

        let pull = self.pull_summary();
        let push = self.push_summary();
        let _ = writeln!(out, "pull: {} objects ({})", pull.objects, format_size(pull.bytes));
        let _ = writeln!(out, "push: {} objects ({})", push.objects, format_size(push.bytes));
        out
    }
}

fn compare_stats(
    local: &TreeScan,
    remote: &TreeScan,
    path: &Path,
    local_stat: &EntryStat,
    remote_stat: &EntryStat,
    opts: CompareOptions,
) -> Result<Option<Change>> {
    if local_stat.kind == EntryKind::Dir && remote_stat.kind == EntryKind::Dir {
        return Ok(None);
    }

    let time_diff = local_stat.mtime - remote_stat.mtime;
    let time_differs = !opts.ignore_time && time_diff.unsigned_abs() > opts.modify_window;
    if local_stat.size != remote_stat.size || time_differs {
        return Ok(Some(if time_diff < 0 {
            Change::Pull(*remote_stat)
        } else {
            Change::Push(*local_stat)
        }));
    }

    if opts.content && local_stat.kind == EntryKind::File && remote_stat.kind == EntryKind::File {
        if local.content_hash(path)? != remote.content_hash(path)? {
            return Ok(Some(Change::Content {
                local: *local_stat,
                remote: *remote_stat,
            }));
        }
    }

    Ok(None)
}

/// Human readable size: divides by 1024 while the value has four digits
pub fn format_size(bytes: u64) -> String {
    let mut units = vec!["T", "G", "M", "K", ""];
    let mut value = bytes as f64;
    while units.len() > 1 && value >= 1000.0 {
        value /= 1024.0;
        units.pop();
    }
    format!("{:.1} {}B", value, units.last().copied().unwrap_or_default())
}
