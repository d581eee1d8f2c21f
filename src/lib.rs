//! cryptsync - mirror a directory tree to a remote over sshfs, optionally
//! through an encfs overlay, using rsync for the copy
//!
//! A [`SyncSession`] describes one push, pull, compare, mount or unmount.
//! The [`Orchestrator`] attaches what the session needs, does the work and
//! always detaches in reverse order, reporting anything it could not clean
//! up.

pub mod cancel;
pub mod config;
pub mod error;
pub mod mount;
pub mod orchestrator;
pub mod overlay;
pub mod plan;
pub mod process;
pub mod retry;
pub mod secret;
pub mod session;
pub mod transfer;

pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, SessionReport};
pub use session::SyncSession;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cancel::CancelSignal;
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::orchestrator::{Orchestrator, SessionReport};
    pub use crate::secret::Secret;
    pub use crate::session::{Direction, EncryptionMode, Epoch, ExitStatus, Operation, SyncSession};
}
