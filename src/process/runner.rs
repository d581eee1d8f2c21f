//! External command execution with a watchdog timeout

use crate::error::{Error, Result};
use crate::secret::Secret;
use async_trait::async_trait;
use std::ffi::{OsStr, OsString};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// How long to keep draining output pipes after the process exited.
/// Daemonizing tools may leave a grandchild holding the pipes open.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Description of one external command invocation
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Executable name or path
    pub program: String,
    /// Arguments
    pub args: Vec<OsString>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    /// Kill the process if it has not exited after this long
    pub timeout: Option<Duration>,
    /// Data written to stdin (a trailing newline is added if missing)
    pub stdin: Option<Secret>,
    /// Extra environment variables
    pub env: Vec<(OsString, OsString)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        CommandSpec {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout: None,
            stdin: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn stdin(mut self, input: Secret) -> Self {
        self.stdin = Some(input);
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Arguments as lossy UTF-8, for logging and classification
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// Human readable command line (stdin is never included)
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in self.args_lossy() {
            line.push(' ');
            line.push_str(&arg);
        }
        line
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; 128 + signal number if the process was killed by a signal
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        ProcessOutput {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty stderr line, falling back to the exit code
    pub fn diagnostic(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("exit code {}", self.exit_code))
    }
}

/// Executes external commands
///
/// Implementations never fail on a non-zero exit code; callers inspect
/// [`ProcessOutput::exit_code`]. There is no retry at this layer.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput>;
}

/// Runs commands as real OS processes
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        SystemRunner
    }
}

#[async_trait]
impl ProcessRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput> {
        debug!("Running: {}", spec.display());

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| Error::ProcessLaunch {
            program: spec.program.clone(),
            source,
        })?;

        if let (Some(input), Some(mut stdin)) = (&spec.stdin, child.stdin.take()) {
            let mut data = input.expose().as_bytes().to_vec();
            if data.last() != Some(&b'\n') {
                data.push(b'\n');
            }
            let written = stdin.write_all(&data).await;
            zeroize::Zeroize::zeroize(&mut data);
            match written {
                Ok(()) => {}
                // The process may exit before reading everything.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(Error::Io(e)),
            }
            drop(stdin);
        }

        let stdout_task = tokio::spawn(drain(child.stdout.take()));
        let stderr_task = tokio::spawn(drain(child.stderr.take()));

        let status = match spec.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    warn!("{} exceeded {:?}, killing it", spec.program, limit);
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill {}: {}", spec.program, e);
                    }
                    stdout_task.abort();
                    stderr_task.abort();
                    return Err(Error::ProcessTimeout {
                        program: spec.program.clone(),
                        timeout: limit,
                    });
                }
            },
            None => child.wait().await?,
        };

        let exit_code = status
            .code()
            .unwrap_or_else(|| 128 + status.signal().unwrap_or(0));
        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;

        debug!("{} exited with {}", spec.program, exit_code);
        Ok(ProcessOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!("Error reading process output: {}", e);
        }
    }
    buf
}

async fn collect(mut task: tokio::task::JoinHandle<Vec<u8>>) -> String {
    match tokio::time::timeout(DRAIN_GRACE, &mut task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => {
            debug!("Output reader failed: {}", e);
            String::new()
        }
        Err(_) => {
            debug!("Output pipe still open after exit, discarding");
            task.abort();
            String::new()
        }
    }
}
