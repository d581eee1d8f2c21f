//! cryptsync - mirror a directory tree to an sshfs-mounted, optionally
//! encfs-encrypted remote
//!
//! Usage:
//!   cryptsync init <remote> <location>  - Add a remote to this tree
//!   cryptsync push <remote>             - Copy local changes to the remote
//!   cryptsync pull <remote>             - Copy remote changes here
//!   cryptsync sync <remote> --epoch E   - Both sides changed; E wins
//!   cryptsync diff <remote>             - Show differences
//!   cryptsync mount <remote>            - Leave the remote attached
//!   cryptsync umount <remote>           - Detach what mount left behind
//!   cryptsync status <remote>           - Show mount state

use clap::{Args, Parser, Subcommand, ValueEnum};
use cryptsync::{
    cancel::CancelSignal,
    config::{key_env_var, Config},
    error::ErrorKind,
    mount::SystemProbe,
    orchestrator::{Orchestrator, SessionReport},
    process::SystemRunner,
    secret::Secret,
    session::{
        resolve_scope, Direction, EncryptionMode, Epoch, ExitStatus, Operation, SyncSession, CONTROL_DIR,
    },
    Error, Result,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "cryptsync")]
#[command(author = "cryptsync Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Synchronize a directory with a mounted, optionally encrypted remote")]
struct Cli {
    /// Directory inside the tree (defaults to the current directory)
    #[arg(short = 'C', long)]
    root: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add or update a remote for this tree
    Init {
        /// Remote name
        name: String,

        /// `host:path` or a local directory
        location: String,

        /// Store the remote encrypted
        #[arg(long)]
        encrypted: bool,

        /// Exclude pattern (repeatable)
        #[arg(short, long)]
        exclude: Vec<String>,

        /// Delete extraneous files on the receiving side by default
        #[arg(long)]
        delete: bool,

        /// Symlink pointed at the mounted view by `mount`
        #[arg(long)]
        mount_point: Option<PathBuf>,
    },

    /// Copy local changes to the remote
    Push {
        remote: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Copy remote changes to the local tree
    Pull {
        remote: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Reconcile a tree where both sides changed
    Sync {
        remote: String,

        /// Side whose version wins
        #[arg(long, value_enum)]
        epoch: EpochArg,

        #[command(flatten)]
        transfer: TransferArgs,
    },

    /// Compare the local tree with the remote
    Diff {
        remote: String,

        /// Compare file contents when size and time agree
        #[arg(long)]
        content: bool,

        /// Ignore modification times
        #[arg(long)]
        ignore_time: bool,

        /// Only compare this path (defaults to the current directory)
        #[arg(short, long)]
        path: Option<PathBuf>,
    },

    /// Attach the remote and leave it attached
    Mount { remote: String },

    /// Detach what a previous mount left attached
    Umount { remote: String },

    /// Show mount and overlay state
    Status { remote: String },
}

#[derive(Args)]
struct TransferArgs {
    /// Show what would be transferred without changing anything
    #[arg(short = 'n', long)]
    simulate: bool,

    /// Delete files on the receiver that the sender does not have
    #[arg(long)]
    delete: bool,

    /// Copy symlink targets instead of links
    #[arg(long)]
    follow_links: bool,

    /// Write received files to this directory instead
    #[arg(long)]
    delta: Option<PathBuf>,

    /// Only transfer this path (defaults to the current directory)
    #[arg(short, long)]
    path: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum EpochArg {
    Local,
    Remote,
}

impl From<EpochArg> for Epoch {
    fn from(arg: EpochArg) -> Self {
        match arg {
            EpochArg::Local => Epoch::Local,
            EpochArg::Remote => Epoch::Remote,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false);
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = builder.with_env_filter(EnvFilter::from_default_env()).finish();
        tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
    } else {
        tracing::subscriber::set_global_default(builder.finish()).expect("Failed to set subscriber");
    }

    let start = match cli.root {
        Some(root) => expand_tilde(&root),
        None => PathBuf::from("."),
    };

    match run_command(cli.command, &start) {
        Ok(status) => std::process::exit(status.code()),
        Err(e) => {
            error!("Error: {}", e);
            let status = match e.kind() {
                ErrorKind::InvalidSessionConfig => ExitStatus::InvalidConfig,
                _ => ExitStatus::SetupFailed,
            };
            std::process::exit(status.code());
        }
    }
}

fn run_command(command: Commands, start: &Path) -> Result<ExitStatus> {
    match command {
        Commands::Init {
            name,
            location,
            encrypted,
            exclude,
            delete,
            mount_point,
        } => cmd_init(start, &name, location, encrypted, exclude, delete, mount_point),

        Commands::Push { remote, transfer } => {
            cmd_transfer(start, &remote, Direction::Push, None, transfer)
        }

        Commands::Pull { remote, transfer } => {
            cmd_transfer(start, &remote, Direction::Pull, None, transfer)
        }

        Commands::Sync {
            remote,
            epoch,
            transfer,
        } => cmd_transfer(
            start,
            &remote,
            Direction::BidirectionalDeclared,
            Some(epoch.into()),
            transfer,
        ),

        Commands::Diff {
            remote,
            content,
            ignore_time,
            path,
        } => cmd_diff(start, &remote, content, ignore_time, path),

        Commands::Mount { remote } => cmd_mount(start, &remote),

        Commands::Umount { remote } => cmd_umount(start, &remote),

        Commands::Status { remote } => cmd_status(start, &remote),
    }
}

fn cmd_init(
    start: &Path,
    name: &str,
    location: String,
    encrypted: bool,
    exclude: Vec<String>,
    delete: bool,
    mount_point: Option<PathBuf>,
) -> Result<ExitStatus> {
    let root = start.canonicalize()?;

    // only what was given on the command line changes
    let created = Config::init_remote(&root, name, |remote| {
        remote.location = location;
        remote.encrypted |= encrypted;
        remote.delete |= delete;
        if !exclude.is_empty() {
            remote.exclude = exclude;
        }
        if mount_point.is_some() {
            remote.mount_point = mount_point;
        }
    })?;
    if created {
        info!("Created {:?}", Config::path_in(&root));
    }
    info!("Remote '{}' configured", name);
    if encrypted {
        info!(
            "The key is prompted for on each run unless {} is set",
            key_env_var(name)
        );
    }
    Ok(ExitStatus::Success)
}

/// Configuration and tree root for `start`
struct Tree {
    root: PathBuf,
    /// Directory the command runs from, inside `root`
    cwd: PathBuf,
    config: Config,
}

impl Tree {
    fn open(start: &Path) -> Result<Self> {
        let cwd = start.canonicalize()?;
        let root = Config::find_root(&cwd)?;
        let config = Config::load(Config::path_in(&root))?;
        Ok(Tree { root, cwd, config })
    }

    /// Subtree selected by `-p`, relative to the root
    fn scope(&self, path: Option<&Path>) -> Result<PathBuf> {
        let path = path.map(expand_tilde);
        resolve_scope(&self.root, &self.cwd, path.as_deref())
    }

    /// Session for `name`, prompting for the key when it is needed and unset
    fn session(&self, name: &str, direction: Direction, needs_key: bool) -> Result<SyncSession> {
        let remote = self.config.remote(name)?;
        let key = if needs_key && remote.wants_encryption() && remote.key.is_none() {
            let key = rpassword::prompt_password(format!("Key for {}: ", name))
                .map_err(|e| Error::Internal(e.to_string()))?;
            Some(Secret::new(key))
        } else {
            None
        };

        let encryption = if needs_key {
            remote.encryption_mode(key)
        } else {
            EncryptionMode::None
        };

        let mut session = SyncSession::new(
            name,
            self.root.clone(),
            remote.endpoint()?,
            encryption,
            direction,
        )
        .with_options(remote.transfer_options());
        if let Some(link) = &remote.mount_point {
            session = session.with_link(self.root.join(expand_tilde(link)));
        }
        Ok(session)
    }

    fn orchestrator(&self, cancel: CancelSignal) -> Orchestrator {
        Orchestrator::from_config(
            Arc::new(SystemRunner::new()),
            Arc::new(SystemProbe::new()),
            &self.config,
            cancel,
        )
    }

    /// Run a session, cancelling it on Ctrl-C
    fn run(&self, session: SyncSession) -> Result<SessionReport> {
        let runtime = tokio::runtime::Runtime::new().map_err(|e| Error::Internal(e.to_string()))?;
        let cancel = CancelSignal::new();
        let orchestrator = self.orchestrator(cancel.clone());

        Ok(runtime.block_on(async {
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cleaning up");
                    cancel.cancel();
                }
            });
            orchestrator.run(session).await
        }))
    }
}

fn cmd_transfer(
    start: &Path,
    remote: &str,
    direction: Direction,
    epoch: Option<Epoch>,
    args: TransferArgs,
) -> Result<ExitStatus> {
    let tree = Tree::open(start)?;
    let mut session = tree.session(remote, direction, true)?;
    if let Some(epoch) = epoch {
        session = session.with_epoch(epoch);
    }
    session.options.dry_run = args.simulate;
    session.options.delete |= args.delete;
    session.options.follow_links |= args.follow_links;
    session.options.delta = args.delta.as_deref().map(expand_tilde);
    session.options.scope = tree.scope(args.path.as_deref())?;

    let report = tree.run(session)?;
    if let Some(transfer) = &report.transfer {
        println!("{}", transfer);
        for line in &transfer.diagnostics {
            println!("  {}", line);
        }
    }
    Ok(finish(&report))
}

fn cmd_diff(
    start: &Path,
    remote: &str,
    content: bool,
    ignore_time: bool,
    path: Option<PathBuf>,
) -> Result<ExitStatus> {
    let tree = Tree::open(start)?;
    let mut session = tree
        .session(remote, Direction::Push, true)?
        .with_operation(Operation::Compare);
    session.options.content |= content;
    session.options.ignore_time |= ignore_time;
    session.options.scope = tree.scope(path.as_deref())?;

    let report = tree.run(session)?;
    if let Some(diff) = &report.diff {
        print!("{}", diff.render());
    }
    Ok(finish(&report))
}

fn cmd_mount(start: &Path, remote: &str) -> Result<ExitStatus> {
    let tree = Tree::open(start)?;
    let session = tree
        .session(remote, Direction::Push, true)?
        .with_operation(Operation::Attach);
    let view = match &session.link {
        Some(link) => link.clone(),
        None if session.encryption.is_encrypted() => session.overlay_view(),
        None => session.mount_point(),
    };

    let report = tree.run(session)?;
    if report.succeeded() {
        println!("{} mounted at {}", remote, view.display());
    }
    Ok(finish(&report))
}

fn cmd_umount(start: &Path, remote: &str) -> Result<ExitStatus> {
    let tree = Tree::open(start)?;
    let session = tree
        .session(remote, Direction::Push, false)?
        .with_operation(Operation::Detach);

    let report = tree.run(session)?;
    Ok(finish(&report))
}

fn cmd_status(start: &Path, remote: &str) -> Result<ExitStatus> {
    let tree = Tree::open(start)?;
    let mut session = tree.session(remote, Direction::Push, false)?;
    session.encryption = tree.config.remote(remote)?.encryption_mode(None);
    let status = tree.orchestrator(CancelSignal::new()).status(&session);

    println!("Remote {}", remote);
    println!("==========");
    println!("Location: {}", session.endpoint);
    println!("Control directory: {:?}", tree.root.join(CONTROL_DIR));
    println!("Mount point: {} ({:?})", status.mount_point.as_str(), session.mount_point());
    match &status.owner {
        Some(owner) => println!(
            "Owner: process {} on {} since {} (session {})",
            owner.pid, owner.host, owner.attached_at, owner.session
        ),
        None => println!("Owner: none"),
    }
    if let Some(view) = status.overlay_view {
        println!("Overlay view: {} ({:?})", view.as_str(), session.overlay_view());
    }
    if let (Some(link), Some(target)) = (&session.link, &status.link) {
        println!("Link: {:?} -> {:?}", link, target);
    }
    Ok(ExitStatus::Success)
}

/// Exit status of a finished session
fn finish(report: &SessionReport) -> ExitStatus {
    if report.failure.is_none() && report.teardown_issues.is_empty() {
        info!("Session {} finished", report.session);
    }
    report.exit_status
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
