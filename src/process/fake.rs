//! Scripted stand-in for the external tools
//!
//! [`FakeHost`] implements both [`ProcessRunner`] and [`MountProbe`] and
//! emulates just enough of sshfs, encfs, fusermount and rsync on plain
//! directories for the managers and the orchestrator to run end to end:
//!
//! * sshfs replaces the mount point with a symlink to a registered backing
//!   directory;
//! * encfs writes a volume marker on first use and fills the view from the
//!   underlying directory, where files are kept under hex-encoded names;
//! * fusermount flushes an overlay view back to the underlying directory, or
//!   restores an empty mount point directory;
//! * rsync copies regular files, honouring excludes, `--update`, `--delete`,
//!   `--size-only`, `--dry-run` and `--relative` sources of the form
//!   `base/./scope`, and prints itemized lines and a stats block.
//!
//! Every invocation is recorded in order.

use crate::cancel::CancelSignal;
use crate::error::{Error, Result};
use crate::mount::{MountPointState, MountProbe, SystemProbe};
use crate::overlay::cipher::{render_marker, CipherConfig, MARKER_FILE};
use crate::plan::ExcludeSet;
use crate::process::{CommandSpec, ProcessOutput, ProcessRunner};
use async_trait::async_trait;
use filetime::FileTime;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One recorded call
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl Invocation {
    /// Last argument that is not an option
    pub fn target(&self) -> Option<&str> {
        self.args
            .iter()
            .rev()
            .find(|a| !a.starts_with('-'))
            .map(String::as_str)
    }
}

enum Scripted {
    Output(ProcessOutput),
    Timeout,
}

enum Action {
    Emulate,
    Reply(ProcessOutput),
    Timeout,
    Hang(CancelSignal),
    EmulateThenHang(CancelSignal),
}

#[derive(Default)]
struct FakeState {
    invocations: Vec<Invocation>,
    /// `host:path` -> backing directory
    remotes: HashMap<String, PathBuf>,
    /// mount point -> backing directory
    mounts: HashMap<PathBuf, PathBuf>,
    /// overlay view -> canonical underlying directory
    overlays: HashMap<PathBuf, PathBuf>,
    /// canonical underlying directory -> volume key
    keys: HashMap<PathBuf, String>,
    unresponsive: HashSet<PathBuf>,
    scripted: HashMap<String, VecDeque<Scripted>>,
    busy: HashMap<PathBuf, u32>,
    unreadable: HashSet<PathBuf>,
    cancel_on: HashMap<String, CancelSignal>,
    cancel_after: HashMap<String, CancelSignal>,
}

/// Test double for the process runner and the mount probe
#[derive(Default)]
pub(crate) struct FakeHost {
    state: Mutex<FakeState>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `location` (`host:path`) mountable, backed by `backing`
    pub fn add_remote(&self, location: &str, backing: &Path) {
        self.state
            .lock()
            .remotes
            .insert(location.to_string(), backing.to_path_buf());
    }

    /// Answer the next call of `program` with `output` instead of emulating it
    pub fn script(&self, program: &str, output: ProcessOutput) {
        self.state
            .lock()
            .scripted
            .entry(program.to_string())
            .or_default()
            .push_back(Scripted::Output(output));
    }

    /// Let the next call of `program` run into its deadline
    pub fn script_timeout(&self, program: &str) {
        self.state
            .lock()
            .scripted
            .entry(program.to_string())
            .or_default()
            .push_back(Scripted::Timeout);
    }

    /// Refuse the next `times` unmounts of `path` as busy
    pub fn busy_unmount(&self, path: &Path, times: u32) {
        self.state.lock().busy.insert(path.to_path_buf(), times);
    }

    /// Make rsync fail to read this source-relative file
    pub fn unreadable(&self, rel: &str) {
        self.state.lock().unreadable.insert(PathBuf::from(rel));
    }

    /// The next call of `program` fires `signal` and never finishes
    pub fn cancel_during(&self, program: &str, signal: CancelSignal) {
        self.state
            .lock()
            .cancel_on
            .insert(program.to_string(), signal);
    }

    /// The next call of `program` does its work, then fires `signal` and
    /// never returns
    pub fn cancel_after(&self, program: &str, signal: CancelSignal) {
        self.state
            .lock()
            .cancel_after
            .insert(program.to_string(), signal);
    }

    /// Pretend a previous run left `backing` mounted at `mount_point`
    pub fn premount(&self, mount_point: &Path, backing: &Path) {
        if let Some(parent) = mount_point.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let _ = fs::remove_dir(mount_point);
        let _ = std::os::unix::fs::symlink(backing, mount_point);
        self.state
            .lock()
            .mounts
            .insert(mount_point.to_path_buf(), backing.to_path_buf());
    }

    /// Probe reports this path as a dead mount until it is unmounted
    pub fn mark_unresponsive(&self, path: &Path) {
        self.state.lock().unresponsive.insert(path.to_path_buf());
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.lock().invocations.clone()
    }

    /// Program names in call order
    pub fn programs(&self) -> Vec<String> {
        self.state
            .lock()
            .invocations
            .iter()
            .map(|i| i.program.clone())
            .collect()
    }

    pub fn count(&self, program: &str) -> usize {
        self.state
            .lock()
            .invocations
            .iter()
            .filter(|i| i.program == program)
            .count()
    }

    pub fn is_mounted(&self, path: &Path) -> bool {
        let state = self.state.lock();
        state.mounts.contains_key(path) || state.overlays.contains_key(path)
    }

    fn sshfs(&self, spec: &CommandSpec) -> Result<ProcessOutput> {
        let args = spec.args_lossy();
        let operands = operands(&args, &["-o"]);
        let (location, mount_point) = match operands.as_slice() {
            [.., location, mount_point] => (location.to_string(), PathBuf::from(mount_point)),
            _ => return Ok(ProcessOutput::new(1, "", "usage: sshfs [user@]host:[dir] mountpoint")),
        };

        let mut state = self.state.lock();
        let Some(backing) = state.remotes.get(&location).cloned() else {
            let host = location.split(':').next().unwrap_or_default();
            return Ok(ProcessOutput::new(
                255,
                "",
                format!(
                    "ssh: Could not resolve hostname {}: Name or service not known\nremote host has disconnected\n",
                    host
                ),
            ));
        };

        let empty = fs::read_dir(&mount_point)
            .map(|mut d| d.next().is_none())
            .unwrap_or(false);
        if !empty {
            return Ok(ProcessOutput::new(
                1,
                "",
                "fuse: mountpoint is not empty\nfuse: if you are sure this is safe, use the 'nonempty' mount option\n",
            ));
        }

        fs::remove_dir(&mount_point)?;
        std::os::unix::fs::symlink(&backing, &mount_point)?;
        state.mounts.insert(mount_point, backing);
        Ok(ProcessOutput::new(0, "", ""))
    }

    fn encfs(&self, spec: &CommandSpec) -> Result<ProcessOutput> {
        let args = spec.args_lossy();
        let operands = operands(&args, &[]);
        let (underlying, view) = match operands.as_slice() {
            [.., underlying, view] => (PathBuf::from(underlying), PathBuf::from(view)),
            _ => return Ok(ProcessOutput::new(1, "", "Missing one or more arguments, aborting.")),
        };
        let input = spec
            .stdin
            .as_ref()
            .map(|s| s.expose().to_string())
            .unwrap_or_default();
        let key = input
            .lines()
            .rev()
            .find(|l| !l.is_empty())
            .unwrap_or_default()
            .to_string();

        let Ok(underlying) = underlying.canonicalize() else {
            return Ok(ProcessOutput::new(
                1,
                "",
                format!("The directory \"{}\" does not exist.", underlying.display()),
            ));
        };

        let mut state = self.state.lock();
        let marker = underlying.join(MARKER_FILE);
        if marker.exists() {
            if let Some(known) = state.keys.get(&underlying) {
                if *known != key {
                    return Ok(ProcessOutput::new(1, "", "Error decoding volume key, password incorrect\n"));
                }
            }
        } else {
            if !input.starts_with("x\n") {
                return Ok(ProcessOutput::new(1, "", "Unable to load or parse config file\n"));
            }
            fs::write(&marker, render_marker(&CipherConfig::default()))?;
        }
        state.keys.insert(underlying.clone(), key);

        for entry in fs::read_dir(&underlying)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(rel) = decode_name(&entry.file_name().to_string_lossy()) {
                let target = view.join(rel);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(entry.path(), &target)?;
                copy_mtime(&entry.path(), &target)?;
            }
        }

        state.overlays.insert(view, underlying);
        Ok(ProcessOutput::new(0, "", ""))
    }

    fn fusermount(&self, spec: &CommandSpec) -> Result<ProcessOutput> {
        let args = spec.args_lossy();
        let Some(path) = operands(&args, &[]).last().map(PathBuf::from) else {
            return Ok(ProcessOutput::new(1, "", "fusermount: missing mountpoint argument"));
        };

        let mut state = self.state.lock();
        if let Some(remaining) = state.busy.get_mut(&path) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(busy(&path));
            }
        }

        if let Some(underlying) = state.overlays.remove(&path) {
            flush_overlay(&path, &underlying)?;
            return Ok(ProcessOutput::new(0, "", ""));
        }

        if let Some(backing) = state.mounts.get(&path).cloned() {
            let backing = backing.canonicalize().unwrap_or(backing);
            if state.overlays.values().any(|u| *u == backing) {
                return Ok(busy(&path));
            }
            state.mounts.remove(&path);
            state.unresponsive.remove(&path);
            fs::remove_file(&path)?;
            fs::create_dir(&path)?;
            return Ok(ProcessOutput::new(0, "", ""));
        }

        Ok(ProcessOutput::new(
            1,
            "",
            format!("fusermount: entry for {} not found in /etc/mtab\n", path.display()),
        ))
    }

    fn rsync(&self, spec: &CommandSpec) -> Result<ProcessOutput> {
        let args = spec.args_lossy();
        let has = |flag: &str| args.iter().any(|a| a == flag);
        let (delete, dry_run, update) = (has("--delete"), has("--dry-run"), has("--update"));
        let (relative, size_only) = (has("--relative"), has("--size-only"));
        let excludes: Vec<String> = args
            .iter()
            .filter_map(|a| a.strip_prefix("--exclude="))
            .map(str::to_string)
            .collect();
        let operands = operands(&args, &[]);
        let (source, destination) = match operands.as_slice() {
            [.., source, destination] => (PathBuf::from(source), PathBuf::from(destination)),
            _ => return Ok(ProcessOutput::new(1, "", "rsync: missing source or destination")),
        };

        let (source, scope) = split_relative(&source, relative);
        let Ok(source) = source.canonicalize() else {
            return Ok(ProcessOutput::new(
                23,
                "",
                format!(
                    "rsync: [sender] change_dir \"{}\" failed: No such file or directory (2)\n",
                    source.display()
                ),
            ));
        };
        let start = source.join(&scope);
        if !start.exists() {
            return Ok(ProcessOutput::new(
                23,
                "",
                format!(
                    "rsync: [sender] link_stat \"{}\" failed: No such file or directory (2)\n",
                    start.display()
                ),
            ));
        }
        if !dry_run {
            fs::create_dir_all(&destination)?;
        }
        let destination = destination.canonicalize().unwrap_or(destination);
        let exclude = ExcludeSet::new(&excludes)?;
        let unreadable = self.state.lock().unreadable.clone();

        let mut stdout = String::new();
        let mut stderr = String::new();
        let (mut regular, mut dirs, mut transferred) = (0u64, 0u64, 0u64);
        let mut seen = BTreeSet::new();

        for entry in walk(&source, &start, &exclude) {
            let rel = entry.path().strip_prefix(&source).map(Path::to_path_buf).unwrap_or_default();
            seen.insert(rel.clone());
            let target = destination.join(&rel);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                dirs += 1;
                if !target.is_dir() {
                    let _ = writeln!(stdout, "cd+++++++++ {}/", rel.display());
                    if !dry_run {
                        fs::create_dir_all(&target)?;
                    }
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            regular += 1;
            if unreadable.contains(&rel) {
                let _ = writeln!(
                    stderr,
                    "rsync: [sender] send_files failed to open \"{}\": Permission denied (13)",
                    entry.path().display()
                );
                continue;
            }

            let item = if target.is_file() {
                if update && mtime(&target)? > mtime(entry.path())? {
                    continue;
                }
                if size_only && fs::metadata(&target)?.len() == fs::metadata(entry.path())?.len() {
                    continue;
                }
                if fs::read(&target)? == fs::read(entry.path())? {
                    continue;
                }
                ">f.st......"
            } else {
                ">f+++++++++"
            };
            let _ = writeln!(stdout, "{} {}", item, rel.display());
            transferred += 1;
            if !dry_run {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(entry.path(), &target)?;
                copy_mtime(entry.path(), &target)?;
            }
        }

        let scoped_destination = destination.join(&scope);
        if delete && scoped_destination.is_dir() {
            let extraneous: Vec<PathBuf> = walk(&destination, &scoped_destination, &exclude)
                .filter_map(|e| e.path().strip_prefix(&destination).ok().map(Path::to_path_buf))
                .filter(|rel| !seen.contains(rel))
                .collect();
            for rel in extraneous.iter().rev() {
                let _ = writeln!(stdout, "*deleting   {}", rel.display());
                if !dry_run {
                    let path = destination.join(rel);
                    if path.is_dir() {
                        let _ = fs::remove_dir_all(&path);
                    } else {
                        let _ = fs::remove_file(&path);
                    }
                }
            }
        }

        let _ = write!(
            stdout,
            "\nNumber of files: {} (reg: {}, dir: {})\nNumber of regular files transferred: {}\n",
            regular + dirs,
            regular,
            dirs,
            transferred
        );

        if stderr.is_empty() {
            Ok(ProcessOutput::new(0, stdout, stderr))
        } else {
            stderr.push_str(
                "rsync error: some files/attrs were not transferred (see previous errors) (code 23) at main.c(1338) [sender=3.2.7]\n",
            );
            Ok(ProcessOutput::new(23, stdout, stderr))
        }
    }
}

#[async_trait]
impl ProcessRunner for FakeHost {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput> {
        let program = Path::new(&spec.program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| spec.program.clone());

        let action = {
            let mut state = self.state.lock();
            state.invocations.push(Invocation {
                program: program.clone(),
                args: spec.args_lossy(),
                stdin: spec.stdin.as_ref().map(|s| s.expose().to_string()),
            });
            if let Some(signal) = state.cancel_on.remove(&program) {
                Action::Hang(signal)
            } else if let Some(signal) = state.cancel_after.remove(&program) {
                Action::EmulateThenHang(signal)
            } else {
                match state.scripted.get_mut(&program).and_then(VecDeque::pop_front) {
                    Some(Scripted::Output(output)) => Action::Reply(output),
                    Some(Scripted::Timeout) => Action::Timeout,
                    None => Action::Emulate,
                }
            }
        };

        match action {
            Action::Reply(output) => Ok(output),
            Action::Timeout => Err(Error::ProcessTimeout {
                program: spec.program.clone(),
                timeout: spec.timeout.unwrap_or_default(),
            }),
            Action::Hang(signal) => {
                signal.cancel();
                std::future::pending::<Result<ProcessOutput>>().await
            }
            Action::EmulateThenHang(signal) => {
                let _ = self.emulate(&program, spec);
                signal.cancel();
                std::future::pending::<Result<ProcessOutput>>().await
            }
            Action::Emulate => self.emulate(&program, spec),
        }
    }
}

impl FakeHost {
    fn emulate(&self, program: &str, spec: &CommandSpec) -> Result<ProcessOutput> {
        match program {
            "sshfs" => self.sshfs(spec),
            "encfs" => self.encfs(spec),
            "fusermount" | "umount" => self.fusermount(spec),
            "rsync" => self.rsync(spec),
            _ => Err(Error::ProcessLaunch {
                program: spec.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"),
            }),
        }
    }
}

impl MountProbe for FakeHost {
    fn state(&self, path: &Path) -> MountPointState {
        {
            let state = self.state.lock();
            if state.unresponsive.contains(path) {
                return MountPointState::Unresponsive;
            }
            if state.mounts.contains_key(path) || state.overlays.contains_key(path) {
                return MountPointState::Mounted;
            }
        }
        SystemProbe::new().state(path)
    }
}

/// Hex file name under which the fake overlay stores `rel`
pub(crate) fn encode_name(rel: &Path) -> String {
    hex::encode(rel.to_string_lossy().as_bytes())
}

fn decode_name(name: &str) -> Option<PathBuf> {
    let bytes = hex::decode(name).ok()?;
    String::from_utf8(bytes).ok().map(PathBuf::from)
}

fn flush_overlay(view: &Path, underlying: &Path) -> Result<()> {
    for entry in fs::read_dir(underlying)? {
        let entry = entry?;
        if entry.file_type()?.is_file() && decode_name(&entry.file_name().to_string_lossy()).is_some() {
            fs::remove_file(entry.path())?;
        }
    }

    for entry in WalkDir::new(view).min_depth(1).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(view) else {
            continue;
        };
        let stored = underlying.join(encode_name(rel));
        fs::copy(entry.path(), &stored)?;
        copy_mtime(entry.path(), &stored)?;
    }

    for entry in fs::read_dir(view)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Entries under `start`, named relative to `root`, without `root` itself
fn walk<'a>(
    root: &'a Path,
    start: &Path,
    exclude: &'a ExcludeSet,
) -> impl Iterator<Item = walkdir::DirEntry> + 'a {
    WalkDir::new(start)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |e| match e.path().strip_prefix(root) {
            Ok(rel) => rel.as_os_str().is_empty() || !exclude.is_excluded(rel),
            Err(_) => true,
        })
        .filter_map(|e| e.ok())
        .filter(move |e| e.path() != root)
}

/// Split a `--relative` operand `base/./scope` into its two halves
fn split_relative(operand: &Path, relative: bool) -> (PathBuf, PathBuf) {
    let text = operand.to_string_lossy();
    match text.split_once("/./") {
        Some((base, scope)) if relative => (
            PathBuf::from(base),
            PathBuf::from(scope.trim_end_matches('/')),
        ),
        _ => (operand.to_path_buf(), PathBuf::new()),
    }
}

/// Positional arguments, skipping options and the values of `with_value`
fn operands<'a>(args: &'a [String], with_value: &[&str]) -> Vec<&'a str> {
    let mut out = Vec::new();
    let mut skip = false;
    for arg in args {
        if skip {
            skip = false;
            continue;
        }
        if with_value.contains(&arg.as_str()) {
            skip = true;
            continue;
        }
        if !arg.starts_with('-') {
            out.push(arg.as_str());
        }
    }
    out
}

fn busy(path: &Path) -> ProcessOutput {
    ProcessOutput::new(
        1,
        "",
        format!(
            "fusermount: failed to unmount {}: Device or resource busy\n",
            path.display()
        ),
    )
}

fn mtime(path: &Path) -> Result<FileTime> {
    Ok(FileTime::from_last_modification_time(&fs::metadata(path)?))
}

fn copy_mtime(from: &Path, to: &Path) -> Result<()> {
    filetime::set_file_mtime(to, mtime(from)?)?;
    Ok(())
}
