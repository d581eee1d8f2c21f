//! Sync orchestrator
//!
//! Drives one [`SyncSession`] through its states:
//!
//! ```text
//! Idle -> MountAttaching -> [OverlayAttaching] -> Planning -> Transferring
//!      -> [OverlayDetaching] -> MountDetaching -> Done | Failed
//! ```
//!
//! Every successful attach pushes a teardown obligation. Obligations are
//! discharged in reverse order on every exit path, including failures and
//! cancellation; an overlay that cannot be stopped leaves its mount in place
//! and both are reported for manual cleanup. An attach interrupted by
//! cancellation is checked for what it already mounted.

use crate::cancel::CancelSignal;
use crate::config::{Config, DetachConfig, TimeoutConfig, ToolConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::mount::link::{attach_link, detach_link, link_target};
use crate::mount::{HandleState, MountHandle, MountManager, MountPointState, MountProbe, OwnerMarker};
use crate::overlay::{CipherConfig, OverlayHandle, OverlayManager};
use crate::plan::{DiffReport, Planner};
use crate::process::ProcessRunner;
use crate::session::{EncryptionMode, ExitStatus, Operation, SessionState, SyncSession};
use crate::transfer::{TransferDriver, TransferResult};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A failure together with the state it happened in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub state: SessionState,
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    fn new(state: SessionState, err: &Error) -> Self {
        Failure {
            state,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed in state {} with {}: {}", self.state, self.kind, self.message)
    }
}

/// Outcome of one session
#[derive(Debug)]
pub struct SessionReport {
    pub session: Uuid,
    pub final_state: SessionState,
    pub history: Vec<SessionState>,
    pub transfer: Option<TransferResult>,
    pub diff: Option<DiffReport>,
    /// The error that ended the session early
    pub failure: Option<Failure>,
    /// Teardown errors; secondary when `failure` is set
    pub teardown_issues: Vec<Failure>,
    pub exit_status: ExitStatus,
}

impl SessionReport {
    pub fn succeeded(&self) -> bool {
        self.exit_status == ExitStatus::Success
    }
}

/// Status of a remote's mount point and overlay view
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub mount_point: MountPointState,
    pub owner: Option<OwnerMarker>,
    pub overlay_view: Option<MountPointState>,
    /// Where the remote's link currently points
    pub link: Option<PathBuf>,
}

enum Obligation {
    Mount(MountHandle),
    Overlay(OverlayHandle),
    Link(PathBuf),
}

/// Detach obligations, discharged last in, first out
#[derive(Default)]
struct Teardown {
    stack: Vec<Obligation>,
}

impl Teardown {
    fn push(&mut self, obligation: Obligation) {
        self.stack.push(obligation);
    }

    fn pop(&mut self) -> Option<Obligation> {
        self.stack.pop()
    }

    /// Leave everything attached
    fn keep_all(&mut self) {
        for obligation in self.stack.drain(..) {
            match obligation {
                Obligation::Mount(m) => info!("Leaving {} mounted at {:?}", m.endpoint(), m.path()),
                Obligation::Overlay(o) => info!("Leaving overlay running at {:?}", o.view()),
                Obligation::Link(link) => info!("Leaving link {:?} in place", link),
            }
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if !self.stack.is_empty() {
            error!(
                "{} teardown obligation(s) dropped without running; mounts may need manual cleanup",
                self.stack.len()
            );
        }
    }
}

/// What the working phase produced
#[derive(Default)]
struct Products {
    transfer: Option<TransferResult>,
    diff: Option<DiffReport>,
}

/// Runs sessions
pub struct Orchestrator {
    runner: Arc<dyn ProcessRunner>,
    probe: Arc<dyn MountProbe>,
    tools: ToolConfig,
    timeouts: TimeoutConfig,
    detach: DetachConfig,
    cancel: CancelSignal,
}

impl Orchestrator {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        probe: Arc<dyn MountProbe>,
        tools: ToolConfig,
        timeouts: TimeoutConfig,
        detach: DetachConfig,
        cancel: CancelSignal,
    ) -> Self {
        Orchestrator {
            runner,
            probe,
            tools,
            timeouts,
            detach,
            cancel,
        }
    }

    pub fn from_config(
        runner: Arc<dyn ProcessRunner>,
        probe: Arc<dyn MountProbe>,
        config: &Config,
        cancel: CancelSignal,
    ) -> Self {
        Self::new(
            runner,
            probe,
            config.tools.clone(),
            config.timeouts.clone(),
            config.detach.clone(),
            cancel,
        )
    }

    fn mount_manager(&self, session: &SyncSession) -> MountManager {
        MountManager::new(
            self.runner.clone(),
            self.probe.clone(),
            session.id,
            self.tools.clone(),
            self.timeouts.clone(),
            self.detach.clone(),
        )
    }

    fn overlay_manager(&self, session: &SyncSession) -> OverlayManager {
        OverlayManager::new(
            self.runner.clone(),
            self.probe.clone(),
            session.id,
            self.tools.clone(),
            self.timeouts.clone(),
            self.detach.clone(),
        )
    }

    /// Run a session to a terminal state
    pub async fn run(&self, mut session: SyncSession) -> SessionReport {
        info!(
            "Session {} ({}, {} {})",
            session.id, session.name, session.direction, session.endpoint
        );
        let mounts = self.mount_manager(&session);
        let overlays = self.overlay_manager(&session);
        let mut teardown = Teardown::default();
        let mut products = Products::default();

        let result = match session.validate() {
            Ok(()) => match session.operation {
                Operation::Detach => self.collect_leftovers(&session, &mounts, &overlays, &mut teardown).await,
                _ => {
                    self.execute(&mut session, &mounts, &overlays, &mut teardown, &mut products)
                        .await
                }
            },
            Err(e) => Err(e),
        };

        let failure = result.err().map(|e| {
            let failure = Failure::new(session.state(), &e);
            error!("Session {}", failure);
            failure
        });

        let teardown_issues = if session.state() == SessionState::Done {
            teardown.keep_all();
            Vec::new()
        } else {
            self.discharge(&mut session, &mounts, &overlays, &mut teardown).await
        };

        let terminal = if failure.is_some() {
            SessionState::Failed
        } else {
            SessionState::Done
        };
        if session.state() != terminal {
            enter(&mut session, terminal);
        }

        let exit_status = exit_status(failure.as_ref(), &teardown_issues);
        for issue in &teardown_issues {
            if failure.is_some() {
                warn!("Teardown also {}", issue);
            } else {
                error!("Teardown {}", issue);
            }
        }

        SessionReport {
            session: session.id,
            final_state: session.state(),
            history: session.history().to_vec(),
            transfer: products.transfer,
            diff: products.diff,
            failure,
            teardown_issues,
            exit_status,
        }
    }

    /// Attach, plan, and transfer or compare
    async fn execute(
        &self,
        session: &mut SyncSession,
        mounts: &MountManager,
        overlays: &OverlayManager,
        teardown: &mut Teardown,
        products: &mut Products,
    ) -> Result<()> {
        session.advance(SessionState::MountAttaching)?;
        let endpoint = session.endpoint.clone();
        let mount_point = session.mount_point();
        let mount = self
            .guard_attach(mounts.attach(&endpoint, &mount_point), teardown, || {
                mounts
                    .adopt(&endpoint, &mount_point)
                    .ok()
                    .flatten()
                    .map(Obligation::Mount)
            })
            .await?;
        teardown.push(Obligation::Mount(mount.clone()));

        let encryption = session.encryption.clone();
        let view = match &encryption {
            EncryptionMode::Encrypted { cipher, key } => {
                session.advance(SessionState::OverlayAttaching)?;
                let view = session.overlay_view();
                let overlay = self
                    .guard_attach(overlays.attach(&mount, &view, cipher, key), teardown, || {
                        overlays
                            .adopt(&mount, &view, cipher)
                            .ok()
                            .flatten()
                            .map(Obligation::Overlay)
                    })
                    .await?;
                teardown.push(Obligation::Overlay(overlay.clone()));
                overlay.view().to_path_buf()
            }
            EncryptionMode::None => mount.path().to_path_buf(),
        };

        if let Some(link) = &session.link {
            attach_link(link, &view)?;
            teardown.push(Obligation::Link(link.clone()));
        }

        if session.operation == Operation::Attach {
            info!("Remote {} available at {:?}", session.name, view);
            return session.advance(SessionState::Done);
        }

        session.advance(SessionState::Planning)?;
        let planner = Planner::new();
        match session.operation {
            Operation::Compare => {
                let report = planner.compare(session, &view)?;
                products.diff = Some(report);
            }
            _ => {
                let plan = planner.resolve(session, &view)?;
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                session.advance(SessionState::Transferring)?;

                let driver = TransferDriver::new(
                    self.runner.clone(),
                    self.tools.rsync.clone(),
                    self.timeouts.transfer(),
                );
                let result = self.guard(driver.run(&plan)).await?;
                let outcome = result.check();
                products.transfer = Some(result);
                outcome?;
            }
        }
        Ok(())
    }

    /// Find what a previous session left attached
    async fn collect_leftovers(
        &self,
        session: &SyncSession,
        mounts: &MountManager,
        overlays: &OverlayManager,
        teardown: &mut Teardown,
    ) -> Result<()> {
        let mount = if session.endpoint.is_local() {
            Some(mounts.attach(&session.endpoint, &session.mount_point()).await?)
        } else {
            mounts.adopt(&session.endpoint, &session.mount_point())?
        };

        match mount {
            Some(mount) => {
                teardown.push(Obligation::Mount(mount.clone()));
                let cipher = match &session.encryption {
                    EncryptionMode::Encrypted { cipher, .. } => cipher.clone(),
                    EncryptionMode::None => CipherConfig::default(),
                };
                if let Some(overlay) = overlays.adopt(&mount, &session.overlay_view(), &cipher)? {
                    teardown.push(Obligation::Overlay(overlay));
                }
            }
            None => info!("Nothing mounted for {}", session.name),
        }

        if let Some(link) = &session.link {
            if link_target(link).is_some() {
                teardown.push(Obligation::Link(link.clone()));
            }
        }
        Ok(())
    }

    /// Discharge teardown obligations in reverse order. Never cancelled.
    async fn discharge(
        &self,
        session: &mut SyncSession,
        mounts: &MountManager,
        overlays: &OverlayManager,
        teardown: &mut Teardown,
    ) -> Vec<Failure> {
        let mut issues = Vec::new();
        let mut overlay_stuck = false;

        while let Some(obligation) = teardown.pop() {
            match obligation {
                Obligation::Link(link) => {
                    if let Err(e) = detach_link(&link) {
                        warn!("Could not remove link {:?}: {}", link, e);
                    }
                }
                Obligation::Overlay(overlay) => {
                    enter(session, SessionState::OverlayDetaching);
                    if let Err(e) = overlays.detach(&overlay).await {
                        overlay_stuck = true;
                        issues.push(Failure::new(session.state(), &e));
                    }
                }
                Obligation::Mount(mount) => {
                    enter(session, SessionState::MountDetaching);
                    if overlay_stuck {
                        mount.mark(HandleState::Stale);
                        let e = Error::MountDetachFailed {
                            mount_point: mount.mount_point().to_path_buf(),
                            attempts: 0,
                            reason: "the overlay on it is still running".to_string(),
                        };
                        issues.push(Failure::new(session.state(), &e));
                        continue;
                    }
                    if let Err(e) = mounts.detach(&mount).await {
                        issues.push(Failure::new(session.state(), &e));
                    }
                }
            }
        }
        issues
    }

    /// Await an external step unless the session is cancelled first
    async fn guard<T, F>(&self, step: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                warn!("Cancelled, tearing down");
                Err(Error::Cancelled)
            }
            result = step => result,
        }
    }

    /// Like [`guard`](Self::guard) for an attach step. When the cancel wins,
    /// the step may already have mounted something; `salvage` looks for it
    /// so the teardown covers it.
    async fn guard_attach<T, F, S>(&self, step: F, teardown: &mut Teardown, salvage: S) -> Result<T>
    where
        F: Future<Output = Result<T>>,
        S: FnOnce() -> Option<Obligation>,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                warn!("Cancelled while attaching, tearing down");
                if let Some(obligation) = salvage() {
                    debug!("Attach completed before the cancel was seen");
                    teardown.push(obligation);
                }
                Err(Error::Cancelled)
            }
            result = step => result,
        }
    }

    /// Mount point and overlay view state for a session's remote
    pub fn status(&self, session: &SyncSession) -> StatusReport {
        let mounts = self.mount_manager(session);
        let (mount_point, owner) = if session.endpoint.is_local() {
            (MountPointState::Mounted, OwnerMarker::read(&session.mount_point()))
        } else {
            mounts.inspect(&session.mount_point())
        };
        let overlay_view = match session.encryption {
            EncryptionMode::Encrypted { .. } => Some(self.probe.state(&session.overlay_view())),
            EncryptionMode::None => None,
        };
        StatusReport {
            mount_point,
            owner,
            overlay_view,
            link: session.link.as_deref().and_then(link_target),
        }
    }
}

/// Advance during teardown, where an unexpected transition must not stop
/// the remaining detaches
fn enter(session: &mut SyncSession, state: SessionState) {
    if session.state() == state {
        return;
    }
    if let Err(e) = session.advance(state) {
        debug!("{}", e);
    }
}

fn exit_status(failure: Option<&Failure>, teardown_issues: &[Failure]) -> ExitStatus {
    match failure {
        None if teardown_issues.is_empty() => ExitStatus::Success,
        None => ExitStatus::CleanupRequired,
        Some(failure) => match failure.kind {
            ErrorKind::InvalidSessionConfig | ErrorKind::OverlayConfigMismatch => ExitStatus::InvalidConfig,
            ErrorKind::TransferPartialFailure => ExitStatus::Partial,
            ErrorKind::Cancelled if failure.state == SessionState::Transferring => ExitStatus::Partial,
            _ => ExitStatus::SetupFailed,
        },
    }
}
