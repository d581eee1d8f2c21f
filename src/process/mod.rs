//! Process runner
//!
//! Every external tool (sshfs, encfs, fusermount, rsync) is started through
//! [`ProcessRunner`] so the managers can be driven by a scripted double in
//! tests.

pub mod runner;

#[cfg(test)]
pub(crate) mod fake;

pub use runner::{CommandSpec, ProcessOutput, ProcessRunner, SystemRunner};
