//! Sync session model
//!
//! A [`SyncSession`] is created once per invocation, advanced only by the
//! orchestrator, and consumed by it. Its state machine is documented on
//! [`SessionState`].

use crate::error::{Error, Result};
use crate::overlay::CipherConfig;
use crate::secret::Secret;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Name of the per-tree control directory
pub const CONTROL_DIR: &str = ".cryptsync";

/// Where the remote directory lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteEndpoint {
    /// SSH host, `None` for a directory on this machine
    pub host: Option<String>,
    /// Directory on the host
    pub path: PathBuf,
}

impl RemoteEndpoint {
    /// Parse a `host:path` location; a location without `:` is local
    pub fn parse(location: &str) -> Result<Self> {
        let location = location.trim();
        if location.is_empty() {
            return Err(Error::InvalidSessionConfig(
                "remote location is empty".to_string(),
            ));
        }

        match location.split_once(':') {
            Some((host, path)) => {
                if host.is_empty() || path.is_empty() {
                    return Err(Error::InvalidSessionConfig(format!(
                        "remote location '{}' must look like HOST:PATH",
                        location
                    )));
                }
                Ok(RemoteEndpoint {
                    host: Some(host.to_string()),
                    path: PathBuf::from(path),
                })
            }
            None => Ok(RemoteEndpoint {
                host: None,
                path: PathBuf::from(location),
            }),
        }
    }

    pub fn is_local(&self) -> bool {
        self.host.is_none()
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) => write!(f, "{}:{}", host, self.path.display()),
            None => write!(f, "{}", self.path.display()),
        }
    }
}

/// Declared sync direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    /// Local tree is copied onto the remote view
    Push,
    /// Remote view is copied onto the local tree
    Pull,
    /// Both sides may have changed; an [`Epoch`] picks the winner
    BidirectionalDeclared,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Push => "push",
            Direction::Pull => "pull",
            Direction::BidirectionalDeclared => "bidirectional-declared",
        })
    }
}

/// The side considered authoritative in a bidirectional session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Epoch {
    Local,
    Remote,
}

/// Whether the remote copy is stored encrypted
#[derive(Debug, Clone)]
pub enum EncryptionMode {
    None,
    Encrypted { cipher: CipherConfig, key: Secret },
}

impl EncryptionMode {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, EncryptionMode::Encrypted { .. })
    }
}

/// What the session does once the remote view is attached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Run the transfer engine
    Transfer,
    /// Compare both trees and report, touching nothing
    Compare,
    /// Attach and leave the view attached for later sessions
    Attach,
    /// Detach whatever a previous session left attached
    Detach,
}

/// Options that shape the transfer plan
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    /// User exclusion patterns
    pub exclude: Vec<String>,
    /// Delete receiver files that do not exist on the sender
    pub delete: bool,
    /// Report what would change without changing anything
    pub dry_run: bool,
    /// Follow symbolic links instead of copying them as links
    pub follow_links: bool,
    /// Ignore modification times when comparing
    pub ignore_time: bool,
    /// Compare content hashes when size and time agree
    pub content: bool,
    /// Maximum modification time difference (seconds) treated as equal
    pub modify_window: u64,
    /// Write changed files here instead of the real destination
    pub delta: Option<PathBuf>,
    /// Subtree of the local root the session is limited to, relative to the
    /// root; empty for the whole tree
    pub scope: PathBuf,
}

/// Orchestrator states.
///
/// ```text
/// Idle -> MountAttaching -> [OverlayAttaching] -> Planning -> Transferring
///      -> [OverlayDetaching] -> MountDetaching -> Done
/// ```
///
/// `Failed` is reachable from every non-terminal state. A session that fails
/// after attaching something passes through the detaching states before
/// `Failed`. Compare sessions skip `Transferring`; attach-only sessions finish
/// right after attaching; detach-only sessions go straight from `Idle` to
/// teardown (or to `Done` when nothing is attached).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    MountAttaching,
    OverlayAttaching,
    Planning,
    Transferring,
    OverlayDetaching,
    MountDetaching,
    Done,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }

    /// Whether the transfer engine may have touched files by this state
    pub fn files_touched(&self) -> bool {
        matches!(
            self,
            SessionState::Transferring | SessionState::OverlayDetaching | SessionState::MountDetaching
        )
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Idle, MountAttaching)
                | (Idle, OverlayDetaching)
                | (Idle, MountDetaching)
                | (Idle, Done)
                | (MountAttaching, OverlayAttaching)
                | (MountAttaching, Planning)
                | (MountAttaching, Done)
                | (OverlayAttaching, Planning)
                | (OverlayAttaching, MountDetaching)
                | (OverlayAttaching, Done)
                | (Planning, Transferring)
                | (Planning, OverlayDetaching)
                | (Planning, MountDetaching)
                | (Transferring, OverlayDetaching)
                | (Transferring, MountDetaching)
                | (OverlayDetaching, MountDetaching)
                | (MountDetaching, Done)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Process exit status reported by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Partial,
    SetupFailed,
    CleanupRequired,
    InvalidConfig,
}

impl ExitStatus {
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Partial => 1,
            ExitStatus::SetupFailed => 2,
            ExitStatus::CleanupRequired => 3,
            ExitStatus::InvalidConfig => 4,
        }
    }
}

/// One invocation's unit of work
#[derive(Debug)]
pub struct SyncSession {
    pub id: Uuid,
    /// Remote name from the configuration
    pub name: String,
    pub local_root: PathBuf,
    pub endpoint: RemoteEndpoint,
    pub encryption: EncryptionMode,
    pub direction: Direction,
    pub epoch: Option<Epoch>,
    pub operation: Operation,
    pub options: TransferOptions,
    /// Symbolic link pointed at the attached view while it is attached
    pub link: Option<PathBuf>,
    state: SessionState,
    history: Vec<SessionState>,
}

impl SyncSession {
    pub fn new(
        name: impl Into<String>,
        local_root: impl Into<PathBuf>,
        endpoint: RemoteEndpoint,
        encryption: EncryptionMode,
        direction: Direction,
    ) -> Self {
        SyncSession {
            id: Uuid::new_v4(),
            name: name.into(),
            local_root: local_root.into(),
            endpoint,
            encryption,
            direction,
            epoch: None,
            operation: Operation::Transfer,
            options: TransferOptions::default(),
            link: None,
            state: SessionState::Idle,
            history: vec![SessionState::Idle],
        }
    }

    pub fn with_epoch(mut self, epoch: Epoch) -> Self {
        self.epoch = Some(epoch);
        self
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = operation;
        self
    }

    pub fn with_options(mut self, options: TransferOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_link(mut self, link: impl Into<PathBuf>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state the session has been in, in order
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    /// Control directory inside the local tree
    pub fn control_dir(&self) -> PathBuf {
        self.local_root.join(CONTROL_DIR)
    }

    /// Where the remote directory gets mounted
    pub fn mount_point(&self) -> PathBuf {
        self.control_dir().join(format!("{}-sshfs", self.name))
    }

    /// Where the decrypted view gets mounted
    pub fn overlay_view(&self) -> PathBuf {
        self.control_dir().join(format!("{}-encfs", self.name))
    }

    pub(crate) fn advance(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "illegal session transition {} -> {}",
                self.state, next
            )));
        }
        debug!("Session {}: {} -> {}", self.id, self.state, next);
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Check everything that can be checked before touching any resource
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(Error::InvalidSessionConfig(format!(
                "invalid remote name '{}'",
                self.name
            )));
        }

        if !self.local_root.is_dir() {
            return Err(Error::InvalidSessionConfig(format!(
                "local root {} is not a directory",
                self.local_root.display()
            )));
        }

        match (self.direction, self.epoch) {
            (Direction::BidirectionalDeclared, None) if self.operation == Operation::Transfer => {
                return Err(Error::InvalidSessionConfig(
                    "bidirectional sync needs an explicit epoch (local or remote)".to_string(),
                ));
            }
            (Direction::Push | Direction::Pull, Some(_)) => {
                return Err(Error::InvalidSessionConfig(format!(
                    "an epoch only applies to bidirectional sessions, not {}",
                    self.direction
                )));
            }
            _ => {}
        }

        if let EncryptionMode::Encrypted { cipher, key } = &self.encryption {
            if key.is_empty() {
                return Err(Error::InvalidSessionConfig(
                    "encrypted remote without a key".to_string(),
                ));
            }
            cipher.validate()?;
        }

        if self.endpoint.is_local() {
            let remote = &self.endpoint.path;
            if overlaps(&self.local_root, remote) {
                return Err(Error::InvalidSessionConfig(format!(
                    "remote directory {} overlaps the local root {}",
                    remote.display(),
                    self.local_root.display()
                )));
            }
        }

        let scope = &self.options.scope;
        let plain = scope.components().all(|c| matches!(c, Component::Normal(_)));
        if !plain || scope.starts_with(CONTROL_DIR) {
            return Err(Error::InvalidSessionConfig(format!(
                "path {} is not inside the tree",
                scope.display()
            )));
        }

        if let Some(link) = &self.link {
            if !link.is_absolute() {
                return Err(Error::InvalidSessionConfig(format!(
                    "mount point link {} must be an absolute path",
                    link.display()
                )));
            }
        }

        if let Some(delta) = &self.options.delta {
            if overlaps(&self.local_root, delta) {
                return Err(Error::InvalidSessionConfig(format!(
                    "delta directory {} overlaps the local root",
                    delta.display()
                )));
            }
        }

        Ok(())
    }
}

/// Subtree a command run from `cwd` works on.
///
/// `path` is taken relative to `cwd`, or as is when absolute; without it the
/// subtree is `cwd` itself. A `cwd` outside `root` means the whole tree. The
/// result is relative to `root` and never leaves it.
pub fn resolve_scope(root: &Path, cwd: &Path, path: Option<&Path>) -> Result<PathBuf> {
    let rel_cwd = cwd.strip_prefix(root).unwrap_or(Path::new(""));
    let outside = || {
        Error::InvalidSessionConfig(format!(
            "path {} is outside the tree at {}",
            path.unwrap_or(cwd).display(),
            root.display()
        ))
    };

    let joined = match path {
        Some(p) if p.is_absolute() => p.strip_prefix(root).map_err(|_| outside())?.to_path_buf(),
        Some(p) => rel_cwd.join(p),
        None => rel_cwd.to_path_buf(),
    };

    let mut scope = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::Normal(part) => scope.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !scope.pop() {
                    return Err(outside());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(outside()),
        }
    }
    Ok(scope)
}

/// Whether one path equals or contains the other
pub(crate) fn overlaps(a: &Path, b: &Path) -> bool {
    let a = a.canonicalize().unwrap_or_else(|_| a.to_path_buf());
    let b = b.canonicalize().unwrap_or_else(|_| b.to_path_buf());
    a.starts_with(&b) || b.starts_with(&a)
}
