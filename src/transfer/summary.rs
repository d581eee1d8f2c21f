//! rsync output classification
//!
//! Exit codes: 0 is success, 23 (some files could not be transferred) and 24
//! (source files vanished) are per-file failures, everything else is fatal.
//! Counts come from `--itemize-changes` lines and the `--stats` block.

use crate::error::{Error, Result};
use crate::process::ProcessOutput;
use regex::Regex;
use std::fmt;

/// Classification of a finished transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Success,
    Partial,
    Failed,
}

impl TransferOutcome {
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => TransferOutcome::Success,
            23 | 24 => TransferOutcome::Partial,
            _ => TransferOutcome::Failed,
        }
    }
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransferOutcome::Success => "success",
            TransferOutcome::Partial => "partial",
            TransferOutcome::Failed => "failed",
        })
    }
}

/// What the transfer engine did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    pub outcome: TransferOutcome,
    pub exit_code: i32,
    pub transferred: u64,
    /// Regular files looked at but left alone
    pub skipped: u64,
    pub errored: u64,
    pub deleted: u64,
    /// Raw stderr lines
    pub diagnostics: Vec<String>,
}

impl TransferResult {
    /// Classify captured rsync output
    pub fn from_output(output: &ProcessOutput) -> Self {
        let outcome = TransferOutcome::from_exit_code(output.exit_code);

        let mut itemized = 0u64;
        let mut deleted = 0u64;
        for line in output.stdout.lines() {
            if line.starts_with("*deleting") {
                deleted += 1;
            } else if is_file_update(line) {
                itemized += 1;
            }
        }

        let regular = stat_number(&output.stdout, r"Number of files: [\d,]+ \(reg: ([\d,]+)");
        let transferred = stat_number(&output.stdout, r"Number of regular files transferred: ([\d,]+)")
            .unwrap_or(itemized);
        let skipped = regular.map(|r| r.saturating_sub(transferred)).unwrap_or(0);

        let diagnostics: Vec<String> = output
            .stderr
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        let mut errored = diagnostics
            .iter()
            .filter(|l| l.starts_with("rsync: "))
            .count() as u64;
        if outcome == TransferOutcome::Partial && errored == 0 {
            errored = 1;
        }

        TransferResult {
            outcome,
            exit_code: output.exit_code,
            transferred,
            skipped,
            errored,
            deleted,
            diagnostics,
        }
    }

    /// Turn a non-successful outcome into its error
    pub fn check(&self) -> Result<()> {
        match self.outcome {
            TransferOutcome::Success => Ok(()),
            TransferOutcome::Partial => Err(Error::TransferPartialFailure {
                errored: self.errored,
                exit_code: self.exit_code,
            }),
            TransferOutcome::Failed => Err(Error::TransferFatal {
                exit_code: self.exit_code,
                reason: self
                    .diagnostics
                    .last()
                    .cloned()
                    .unwrap_or_else(|| format!("rsync exited with {}", self.exit_code)),
            }),
        }
    }
}

impl fmt::Display for TransferResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} transferred, {} skipped, {} errored, {} deleted",
            self.outcome, self.transferred, self.skipped, self.errored, self.deleted
        )
    }
}

/// `>f+++++++++ path` (received) or `<f.st...... path` (sent)
fn is_file_update(line: &str) -> bool {
    let mut chars = line.chars();
    matches!(
        (chars.next(), chars.next()),
        (Some('>') | Some('<'), Some('f'))
    )
}

fn stat_number(stdout: &str, pattern: &str) -> Option<u64> {
    let re = Regex::new(pattern).ok()?;
    let caps = re.captures(stdout)?;
    caps.get(1)?.as_str().replace(',', "").parse().ok()
}
