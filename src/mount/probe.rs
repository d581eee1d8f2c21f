//! Mount point liveness probe

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Observed state of a mount point path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountPointState {
    /// Path does not exist
    Missing,
    /// Plain empty directory, nothing mounted
    Empty,
    /// Plain directory with content, or not a directory at all
    Occupied,
    /// A filesystem is mounted and answers
    Mounted,
    /// A filesystem is mounted but its backend is gone (ENOTCONN and friends)
    Unresponsive,
}

impl MountPointState {
    /// Something is mounted here, dead or alive
    pub fn is_mounted(&self) -> bool {
        matches!(self, MountPointState::Mounted | MountPointState::Unresponsive)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MountPointState::Missing => "missing",
            MountPointState::Empty => "empty",
            MountPointState::Occupied => "occupied",
            MountPointState::Mounted => "mounted",
            MountPointState::Unresponsive => "unresponsive",
        }
    }
}

/// Inspects mount points
pub trait MountProbe: Send + Sync {
    fn state(&self, path: &Path) -> MountPointState;
}

/// Probes the real filesystem.
///
/// A path is a mount point when it lives on a different device than its
/// parent directory. A dead fuse backend answers stat with ENOTCONN.
#[derive(Debug, Default, Clone)]
pub struct SystemProbe;

impl SystemProbe {
    pub fn new() -> Self {
        SystemProbe
    }
}

impl MountProbe for SystemProbe {
    fn state(&self, path: &Path) -> MountPointState {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return MountPointState::Missing,
            Err(e) if is_dead_mount(&e) => return MountPointState::Unresponsive,
            Err(_) => return MountPointState::Occupied,
        };

        if !meta.is_dir() {
            return MountPointState::Occupied;
        }

        let parent_dev = path
            .parent()
            .and_then(|p| fs::metadata(p).ok())
            .map(|m| m.dev());

        if parent_dev.is_some_and(|dev| dev != meta.dev()) {
            return match fs::read_dir(path) {
                Ok(_) => MountPointState::Mounted,
                Err(_) => MountPointState::Unresponsive,
            };
        }

        match fs::read_dir(path) {
            Ok(mut entries) => {
                if entries.next().is_none() {
                    MountPointState::Empty
                } else {
                    MountPointState::Occupied
                }
            }
            Err(e) if is_dead_mount(&e) => MountPointState::Unresponsive,
            Err(_) => MountPointState::Occupied,
        }
    }
}

fn is_dead_mount(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENOTCONN) | Some(libc::EIO) | Some(libc::ESTALE)
    )
}
