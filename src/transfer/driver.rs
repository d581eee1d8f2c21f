//! rsync invocation

use crate::error::{Error, Result};
use crate::plan::{TransferPlan, PARTIAL_DIR};
use crate::process::{CommandSpec, ProcessRunner};
use crate::transfer::summary::TransferResult;
use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Runs the transfer engine for a resolved plan
pub struct TransferDriver {
    runner: Arc<dyn ProcessRunner>,
    program: String,
    timeout: Option<Duration>,
}

impl TransferDriver {
    pub fn new(runner: Arc<dyn ProcessRunner>, program: impl Into<String>, timeout: Option<Duration>) -> Self {
        TransferDriver {
            runner,
            program: program.into(),
            timeout,
        }
    }

    /// Command line for a plan
    pub fn command(&self, plan: &TransferPlan) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.program)
            .args([
                "--archive",
                "--itemize-changes",
                "--stats",
                "--human-readable",
            ])
            .arg(format!("--partial-dir={}", PARTIAL_DIR))
            .timeout(self.timeout);

        if plan.update_only {
            spec = spec.arg("--update");
        }
        if plan.copy_links {
            spec = spec.arg("--copy-links");
        }
        if plan.delete {
            spec = spec.arg("--delete");
        }
        if plan.size_only {
            spec = spec.arg("--size-only");
        }
        if plan.checksum {
            spec = spec.arg("--checksum");
        }
        if plan.modify_window > 0 {
            spec = spec.arg(format!("--modify-window={}", plan.modify_window));
        }
        if plan.dry_run {
            spec = spec.arg("--dry-run");
        }
        for pattern in &plan.excludes {
            spec = spec.arg(format!("--exclude={}", pattern));
        }

        if plan.scope.as_os_str().is_empty() {
            return spec
                .arg(dir_operand(&plan.source))
                .arg(dir_operand(&plan.destination));
        }

        // `root/./scope` with --relative recreates `scope` under the destination
        let mut source = plan.source.as_os_str().to_os_string();
        source.push("/./");
        source.push(plan.scope.as_os_str());
        if plan.source.join(&plan.scope).is_dir() {
            source.push("/");
        }
        spec.arg("--relative")
            .arg(source)
            .arg(dir_operand(&plan.destination))
    }

    /// Run the transfer. Non-zero exits are classified in the result, not
    /// returned as errors; call [`TransferResult::check`] for that.
    pub async fn run(&self, plan: &TransferPlan) -> Result<TransferResult> {
        if !plan.source.is_dir() {
            return Err(Error::TransferFatal {
                exit_code: -1,
                reason: format!("source {} is not a directory", plan.source.display()),
            });
        }

        let spec = self.command(plan);
        info!(
            "Transferring ({}) {:?} -> {:?}{}",
            plan.direction,
            plan.source,
            plan.destination,
            if plan.dry_run { " [dry run]" } else { "" }
        );

        let output = self.runner.run(&spec).await?;
        let result = TransferResult::from_output(&output);

        for line in &result.diagnostics {
            debug!("rsync: {}", line);
        }
        if output.success() {
            info!("Transfer finished: {}", result);
        } else {
            warn!("Transfer finished: {}", result);
        }
        Ok(result)
    }
}

/// `dir/` so rsync copies the directory's contents
fn dir_operand(path: &Path) -> OsString {
    let mut operand = path.as_os_str().to_os_string();
    if !operand.to_string_lossy().ends_with('/') {
        operand.push("/");
    }
    operand
}
