//! Error types for cryptsync
//!
//! Every failure the orchestrator can report maps to exactly one
//! [`ErrorKind`]. The kind decides the exit code and is printed next to the
//! session state so the user can tell whether any files were touched.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the process runner, the managers, the planner, the
/// transfer driver and the orchestrator
#[derive(Debug, Error)]
pub enum Error {
    #[error("{program} did not finish within {timeout:?} and was killed")]
    ProcessTimeout { program: String, timeout: Duration },

    #[error("failed to launch {program}: {source}")]
    ProcessLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("remote {endpoint} is unreachable: {reason}")]
    MountUnreachable { endpoint: String, reason: String },

    #[error("authentication to {endpoint} was rejected: {reason}")]
    MountAuthFailed { endpoint: String, reason: String },

    #[error("mount point {} is busy: {reason}", mount_point.display())]
    MountAlreadyBusy { mount_point: PathBuf, reason: String },

    #[error(
        "could not unmount {} after {attempts} attempts: {reason}; manual cleanup required",
        mount_point.display()
    )]
    MountDetachFailed {
        mount_point: PathBuf,
        attempts: u32,
        reason: String,
    },

    #[error("encryption overlay at {} failed to start: {reason}", view.display())]
    OverlayInitFailed { view: PathBuf, reason: String },

    #[error("encrypted volume marker {} does not match configuration: {reason}", marker.display())]
    OverlayConfigMismatch { marker: PathBuf, reason: String },

    #[error(
        "could not stop encryption overlay at {} after {attempts} attempts: {reason}; manual cleanup required",
        view.display()
    )]
    OverlayDetachFailed {
        view: PathBuf,
        attempts: u32,
        reason: String,
    },

    #[error("transfer finished with {errored} file errors (exit code {exit_code})")]
    TransferPartialFailure { errored: u64, exit_code: i32 },

    #[error("transfer failed (exit code {exit_code}): {reason}")]
    TransferFatal { exit_code: i32, reason: String },

    #[error("invalid session configuration: {0}")]
    InvalidSessionConfig(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("session cancelled")]
    Cancelled,

    #[error("handle for {} was already detached", .0.display())]
    HandleDetached(PathBuf),

    #[error("teardown order violated: {0}")]
    TeardownOrder(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Fieldless classification of [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ProcessTimeout,
    ProcessLaunchError,
    MountUnreachable,
    MountAuthFailed,
    MountAlreadyBusy,
    MountDetachFailed,
    OverlayInitFailed,
    OverlayConfigMismatch,
    OverlayDetachFailed,
    TransferPartialFailure,
    TransferFatal,
    InvalidSessionConfig,
    Cancelled,
    Internal,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ProcessTimeout { .. } => ErrorKind::ProcessTimeout,
            Error::ProcessLaunch { .. } => ErrorKind::ProcessLaunchError,
            Error::MountUnreachable { .. } => ErrorKind::MountUnreachable,
            Error::MountAuthFailed { .. } => ErrorKind::MountAuthFailed,
            Error::MountAlreadyBusy { .. } => ErrorKind::MountAlreadyBusy,
            Error::MountDetachFailed { .. } => ErrorKind::MountDetachFailed,
            Error::OverlayInitFailed { .. } => ErrorKind::OverlayInitFailed,
            Error::OverlayConfigMismatch { .. } => ErrorKind::OverlayConfigMismatch,
            Error::OverlayDetachFailed { .. } => ErrorKind::OverlayDetachFailed,
            Error::TransferPartialFailure { .. } => ErrorKind::TransferPartialFailure,
            Error::TransferFatal { .. } => ErrorKind::TransferFatal,
            Error::InvalidSessionConfig(_) | Error::Config(_) => ErrorKind::InvalidSessionConfig,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::HandleDetached(_)
            | Error::TeardownOrder(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error means cleanup needs manual attention
    pub fn requires_manual_cleanup(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::MountDetachFailed | ErrorKind::OverlayDetachFailed
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ProcessTimeout => "ProcessTimeout",
            ErrorKind::ProcessLaunchError => "ProcessLaunchError",
            ErrorKind::MountUnreachable => "MountUnreachable",
            ErrorKind::MountAuthFailed => "MountAuthFailed",
            ErrorKind::MountAlreadyBusy => "MountAlreadyBusy",
            ErrorKind::MountDetachFailed => "MountDetachFailed",
            ErrorKind::OverlayInitFailed => "OverlayInitFailed",
            ErrorKind::OverlayConfigMismatch => "OverlayConfigMismatch",
            ErrorKind::OverlayDetachFailed => "OverlayDetachFailed",
            ErrorKind::TransferPartialFailure => "TransferPartialFailure",
            ErrorKind::TransferFatal => "TransferFatal",
            ErrorKind::InvalidSessionConfig => "InvalidSessionConfig",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Internal => "Internal",
        };
        f.write_str(name)
    }
}
