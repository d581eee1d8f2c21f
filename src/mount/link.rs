//! Convenience symlink to an attached view
//!
//! A remote may name a path that is pointed at its view while it is
//! attached. Only symbolic links are ever replaced or removed there.

use crate::error::{Error, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Point `link` at `target`, replacing an older link
pub fn attach_link(link: &Path, target: &Path) -> Result<()> {
    match std::fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            debug!("Replacing link {:?}", link);
            std::fs::remove_file(link)?;
        }
        Ok(_) => {
            return Err(Error::MountAlreadyBusy {
                mount_point: link.to_path_buf(),
                reason: "exists and is not a symbolic link".to_string(),
            });
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    if let Some(parent) = link.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::os::unix::fs::symlink(target, link)?;
    info!("Linked {:?} -> {:?}", link, target);
    Ok(())
}

/// Remove `link` if it is a symbolic link. Returns whether one was removed.
pub fn detach_link(link: &Path) -> Result<bool> {
    match std::fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            std::fs::remove_file(link)?;
            debug!("Removed link {:?}", link);
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Target of `link` when it is a symbolic link
pub fn link_target(link: &Path) -> Option<PathBuf> {
    std::fs::read_link(link).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_link_replaces_old_link() {
        let dir = tempdir().unwrap();
        let link = dir.path().join("backup");
        let old = dir.path().join("old-view");
        let view = dir.path().join("view");
        std::fs::create_dir(&view).unwrap();
        std::os::unix::fs::symlink(&old, &link).unwrap();

        attach_link(&link, &view).unwrap();
        assert_eq!(link_target(&link), Some(view));

        assert!(detach_link(&link).unwrap());
        assert!(std::fs::symlink_metadata(&link).is_err());
        assert!(!detach_link(&link).unwrap());
    }

    #[test]
    fn test_real_directory_is_never_replaced() {
        let dir = tempdir().unwrap();
        let link = dir.path().join("backup");
        std::fs::create_dir(&link).unwrap();
        std::fs::write(link.join("keep.txt"), b"k").unwrap();

        let err = attach_link(&link, dir.path()).unwrap_err();
        assert!(matches!(err, Error::MountAlreadyBusy { .. }));
        assert!(!detach_link(&link).unwrap());
        assert!(link.join("keep.txt").is_file());
    }
}
