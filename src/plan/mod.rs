//! Diff planner
//!
//! Turns a session and an attached remote view into either a
//! [`TransferPlan`] for the transfer driver or a [`DiffReport`] comparing
//! both trees. The remote is always reached through its local view; the
//! plan never carries a remote URL.

pub mod diff;
pub mod exclude;
pub mod scan;

pub use diff::{format_size, Change, CompareOptions, DiffEntry, DiffReport, DirectionSummary};
pub use exclude::{builtin_patterns, normalise_patterns, ExcludeSet, PARTIAL_DIR};
pub use scan::{EntryKind, EntryStat, TreeScan};

use crate::error::{Error, Result};
use crate::session::{Direction, Epoch, SyncSession, CONTROL_DIR};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Direction the transfer engine actually runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Push,
    Pull,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransferDirection::Push => "push",
            TransferDirection::Pull => "pull",
        })
    }
}

/// Everything the transfer driver needs for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub direction: TransferDirection,
    /// Builtin patterns first, then the user's
    pub excludes: Vec<String>,
    /// Delete destination files missing at the source
    pub delete: bool,
    pub dry_run: bool,
    /// Never overwrite a destination file that is newer
    pub update_only: bool,
    /// Copy the targets of symbolic links
    pub copy_links: bool,
    /// Compare files by size alone
    pub size_only: bool,
    /// Compare files by checksum instead of size and time
    pub checksum: bool,
    /// Seconds two modification times may differ and still match
    pub modify_window: u64,
    /// Subtree to transfer, relative to both roots; empty for everything
    pub scope: PathBuf,
}

/// Resolves sessions into plans
#[derive(Debug, Default, Clone, Copy)]
pub struct Planner;

impl Planner {
    pub fn new() -> Self {
        Planner
    }

    /// Effective direction of a session
    pub fn direction(session: &SyncSession) -> Result<TransferDirection> {
        match (session.direction, session.epoch) {
            (Direction::Push, _) => Ok(TransferDirection::Push),
            (Direction::Pull, _) => Ok(TransferDirection::Pull),
            (Direction::BidirectionalDeclared, Some(Epoch::Local)) => Ok(TransferDirection::Push),
            (Direction::BidirectionalDeclared, Some(Epoch::Remote)) => Ok(TransferDirection::Pull),
            (Direction::BidirectionalDeclared, None) => Err(Error::InvalidSessionConfig(
                "bidirectional sync needs an explicit epoch (local or remote)".to_string(),
            )),
        }
    }

    /// Build the transfer plan for a session whose remote is visible at
    /// `remote_view`
    pub fn resolve(&self, session: &SyncSession, remote_view: &Path) -> Result<TransferPlan> {
        let direction = Self::direction(session)?;
        let local = session.local_root.clone();
        let remote = remote_view.to_path_buf();

        let (source, mut destination) = match direction {
            TransferDirection::Push => (local, remote),
            TransferDirection::Pull => (remote, local),
        };

        if !source.is_dir() {
            return Err(Error::Internal(format!(
                "transfer source {} is not a directory",
                source.display()
            )));
        }
        if !destination.is_dir() {
            return Err(Error::Internal(format!(
                "transfer destination {} is not a directory",
                destination.display()
            )));
        }
        if let Some(delta) = &session.options.delta {
            destination = delta.clone();
        }
        check_roots(&source, &destination)?;

        let scope = session.options.scope.clone();
        if !scope.as_os_str().is_empty() && std::fs::symlink_metadata(source.join(&scope)).is_err() {
            return Err(Error::InvalidSessionConfig(format!(
                "{} does not exist in {}",
                scope.display(),
                source.display()
            )));
        }

        let mut excludes = builtin_patterns();
        excludes.extend(normalise_patterns(&session.options.exclude));
        // compile once so a bad pattern fails here and not inside the engine
        ExcludeSet::new(&excludes)?;

        let plan = TransferPlan {
            source,
            destination,
            direction,
            excludes,
            delete: session.options.delete,
            dry_run: session.options.dry_run,
            update_only: session.direction != Direction::BidirectionalDeclared,
            copy_links: session.options.follow_links,
            size_only: session.options.ignore_time,
            checksum: session.options.content,
            modify_window: session.options.modify_window,
            scope,
        };
        debug!(
            "Planned {} from {:?} to {:?} ({} excludes, scope {:?})",
            plan.direction,
            plan.source,
            plan.destination,
            plan.excludes.len(),
            plan.scope
        );
        Ok(plan)
    }

    /// Scan both trees and report their differences
    pub fn compare(&self, session: &SyncSession, remote_view: &Path) -> Result<DiffReport> {
        let exclude = ExcludeSet::with_builtin(&session.options.exclude)?;
        let follow = session.options.follow_links;

        let scope = &session.options.scope;
        let local = TreeScan::collect_scoped(&session.local_root, scope, &exclude, follow)?;
        let remote = TreeScan::collect_scoped(remote_view, scope, &exclude, follow)?;

        let opts = CompareOptions {
            ignore_time: session.options.ignore_time,
            content: session.options.content,
            modify_window: session.options.modify_window,
        };
        DiffReport::compare(&local, &remote, opts)
    }
}

/// Source and destination must be distinct; one may only contain the other
/// inside its control directory, which every transfer excludes.
fn check_roots(source: &Path, destination: &Path) -> Result<()> {
    let a = source.canonicalize().unwrap_or_else(|_| source.to_path_buf());
    let b = destination
        .canonicalize()
        .unwrap_or_else(|_| destination.to_path_buf());

    let nested = |inner: &Path, outer: &Path| {
        inner.starts_with(outer) && !inner.starts_with(outer.join(CONTROL_DIR))
    };

    if a == b || nested(&a, &b) || nested(&b, &a) {
        return Err(Error::InvalidSessionConfig(format!(
            "transfer source {} and destination {} overlap",
            source.display(),
            destination.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::CipherConfig;
    use crate::secret::Secret;
    use crate::session::{EncryptionMode, RemoteEndpoint, TransferOptions};
    use tempfile::tempdir;

    fn session(root: &Path, direction: Direction, encryption: EncryptionMode) -> SyncSession {
        SyncSession::new(
            "backup",
            root,
            RemoteEndpoint::parse("server:/srv/data").unwrap(),
            encryption,
            direction,
        )
    }

    fn encrypted() -> EncryptionMode {
        EncryptionMode::Encrypted {
            cipher: CipherConfig::default(),
            key: Secret::new("key"),
        }
    }

    #[test]
    fn test_push_sources_local_root_in_both_modes() {
        let root = tempdir().unwrap();
        let view = tempdir().unwrap();

        for mode in [EncryptionMode::None, encrypted()] {
            let s = session(root.path(), Direction::Push, mode);
            let plan = Planner::new().resolve(&s, view.path()).unwrap();
            assert_eq!(plan.source, root.path());
            assert_eq!(plan.destination, view.path());
            assert_eq!(plan.direction, TransferDirection::Push);
            assert!(plan.update_only);
        }
    }

    #[test]
    fn test_pull_reverses_roots() {
        let root = tempdir().unwrap();
        let view = tempdir().unwrap();
        let s = session(root.path(), Direction::Pull, EncryptionMode::None);
        let plan = Planner::new().resolve(&s, view.path()).unwrap();
        assert_eq!(plan.source, view.path());
        assert_eq!(plan.destination, root.path());
    }

    #[test]
    fn test_bidirectional_requires_epoch() {
        let root = tempdir().unwrap();
        let view = tempdir().unwrap();
        let s = session(root.path(), Direction::BidirectionalDeclared, EncryptionMode::None);
        assert!(matches!(
            Planner::new().resolve(&s, view.path()),
            Err(Error::InvalidSessionConfig(_))
        ));

        let s = s.with_epoch(Epoch::Remote);
        let plan = Planner::new().resolve(&s, view.path()).unwrap();
        assert_eq!(plan.direction, TransferDirection::Pull);
        assert!(!plan.update_only);
    }

    #[test]
    fn test_excludes_always_cover_control_files() {
        let root = tempdir().unwrap();
        let view = tempdir().unwrap();
        let s = session(root.path(), Direction::Push, encrypted()).with_options(TransferOptions {
            exclude: vec!["*.tmp".to_string(), "cache/".to_string()],
            delete: true,
            ..TransferOptions::default()
        });
        let plan = Planner::new().resolve(&s, view.path()).unwrap();
        assert_eq!(
            plan.excludes,
            vec!["/.cryptsync", "/.encfs6.xml", ".rsync-partial", "*.tmp", "cache"]
        );
        assert!(plan.delete);
    }

    #[test]
    fn test_delta_redirects_destination() {
        let root = tempdir().unwrap();
        let view = tempdir().unwrap();
        let delta = tempdir().unwrap();
        let s = session(root.path(), Direction::Pull, EncryptionMode::None).with_options(TransferOptions {
            delta: Some(delta.path().to_path_buf()),
            ..TransferOptions::default()
        });
        let plan = Planner::new().resolve(&s, view.path()).unwrap();
        assert_eq!(plan.source, view.path());
        assert_eq!(plan.destination, delta.path());
    }

    #[test]
    fn test_comparison_options_reach_the_plan() {
        let root = tempdir().unwrap();
        let view = tempdir().unwrap();
        let s = session(root.path(), Direction::Push, EncryptionMode::None).with_options(TransferOptions {
            ignore_time: true,
            content: true,
            modify_window: 2,
            ..TransferOptions::default()
        });
        let plan = Planner::new().resolve(&s, view.path()).unwrap();
        assert!(plan.size_only);
        assert!(plan.checksum);
        assert_eq!(plan.modify_window, 2);

        let s = session(root.path(), Direction::Push, EncryptionMode::None);
        let plan = Planner::new().resolve(&s, view.path()).unwrap();
        assert!(!plan.size_only && !plan.checksum);
        assert_eq!(plan.modify_window, 0);
    }

    #[test]
    fn test_scope_must_exist_at_source() {
        let root = tempdir().unwrap();
        let view = tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("docs/a")).unwrap();
        let scoped = |direction, scope: &str| {
            session(root.path(), direction, EncryptionMode::None).with_options(TransferOptions {
                scope: PathBuf::from(scope),
                ..TransferOptions::default()
            })
        };

        let plan = Planner::new().resolve(&scoped(Direction::Push, "docs/a"), view.path()).unwrap();
        assert_eq!(plan.scope, PathBuf::from("docs/a"));

        // pulling a subtree the remote does not have
        assert!(matches!(
            Planner::new().resolve(&scoped(Direction::Pull, "docs/a"), view.path()),
            Err(Error::InvalidSessionConfig(_))
        ));
    }

    #[test]
    fn test_view_inside_control_dir_is_accepted() {
        let root = tempdir().unwrap();
        let view = root.path().join(CONTROL_DIR).join("backup-sshfs");
        std::fs::create_dir_all(&view).unwrap();
        let s = session(root.path(), Direction::Push, EncryptionMode::None);
        assert!(Planner::new().resolve(&s, &view).is_ok());

        let inside = root.path().join("sub");
        std::fs::create_dir_all(&inside).unwrap();
        assert!(Planner::new().resolve(&s, &inside).is_err());
    }

    #[test]
    fn test_compare_reports_differences() {
        let root = tempdir().unwrap();
        let view = tempdir().unwrap();
        std::fs::write(root.path().join("a"), b"a").unwrap();
        std::fs::create_dir(root.path().join(CONTROL_DIR)).unwrap();
        std::fs::write(view.path().join("b"), b"b").unwrap();

        let s = session(root.path(), Direction::Push, EncryptionMode::None);
        let report = Planner::new().compare(&s, view.path()).unwrap();
        assert_eq!(report.push_summary().objects, 1);
        assert_eq!(report.pull_summary().objects, 1);
    }

    #[test]
    fn test_compare_within_scope() {
        let root = tempdir().unwrap();
        let view = tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("docs")).unwrap();
        std::fs::write(root.path().join("docs/new.md"), b"n").unwrap();
        std::fs::write(root.path().join("outside.txt"), b"o").unwrap();
        std::fs::write(view.path().join("remote-only.txt"), b"r").unwrap();

        let s = session(root.path(), Direction::Push, EncryptionMode::None).with_options(TransferOptions {
            scope: PathBuf::from("docs"),
            ..TransferOptions::default()
        });
        let report = Planner::new().compare(&s, view.path()).unwrap();
        // docs/ and docs/new.md only exist locally; nothing outside docs counts
        assert_eq!(report.push_summary().objects, 2);
        assert_eq!(report.pull_summary().objects, 0);
    }
}
