//! Owner marker for mount points and overlay views
//!
//! Written next to the path after a successful attach so a later run can
//! tell a path held by a live session from one left by a crashed or
//! finished process.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Who attached a mount, and when
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerMarker {
    pub pid: u32,
    pub host: String,
    pub session: Uuid,
    pub attached_at: DateTime<Utc>,
}

impl OwnerMarker {
    /// Marker for the current process and the given session
    pub fn current(session: Uuid) -> Self {
        OwnerMarker {
            pid: std::process::id(),
            host: local_hostname(),
            session,
            attached_at: Utc::now(),
        }
    }

    /// Path of the marker file belonging to a mount point
    pub fn path_for(mount_point: &Path) -> PathBuf {
        let mut name = mount_point
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".owner");
        mount_point.with_file_name(name)
    }

    pub fn read(mount_point: &Path) -> Option<OwnerMarker> {
        let content = std::fs::read_to_string(Self::path_for(mount_point)).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn write(&self, mount_point: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::path_for(mount_point), content)?;
        Ok(())
    }

    pub fn remove(mount_point: &Path) -> Result<()> {
        match std::fs::remove_file(Self::path_for(mount_point)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Refuse `path` when a live session other than `session` holds it
    pub fn check(path: &Path, session: Uuid) -> Result<()> {
        match Self::read(path) {
            Some(owner) if owner.session != session && owner.is_alive() => {
                Err(Error::MountAlreadyBusy {
                    mount_point: path.to_path_buf(),
                    reason: format!(
                        "in use by process {} on {} since {}",
                        owner.pid, owner.host, owner.attached_at
                    ),
                })
            }
            _ => Ok(()),
        }
    }

    /// Whether the owning process may still be running.
    ///
    /// A marker from another host is assumed alive since its process
    /// cannot be checked from here.
    pub fn is_alive(&self) -> bool {
        if self.host != local_hostname() {
            return true;
        }
        let Ok(pid) = i32::try_from(self.pid) else {
            return true;
        };
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
}
