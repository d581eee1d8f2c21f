//! Remote mounts
//!
//! The [`MountManager`] makes the remote directory available as a local path,
//! either through sshfs or, for a directory on this machine, directly.

pub mod link;
pub mod manager;
pub mod owner;
pub mod probe;

pub use manager::{HandleState, MountHandle, MountKind, MountManager};
pub use owner::OwnerMarker;
pub use probe::{MountPointState, MountProbe, SystemProbe};
