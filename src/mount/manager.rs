//! Mount manager
//!
//! Attaches a remote directory at a local mount point through sshfs and
//! detaches it again. Handles are registered per endpoint so a second
//! attach of a live endpoint is answered from the registry.

use crate::config::{DetachConfig, TimeoutConfig, ToolConfig};
use crate::error::{Error, Result};
use crate::mount::owner::OwnerMarker;
use crate::mount::probe::{MountPointState, MountProbe};
use crate::process::{CommandSpec, ProcessOutput, ProcessRunner};
use crate::retry::RetrySchedule;
use crate::session::RemoteEndpoint;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How the remote directory is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// sshfs mount at the mount point
    Fuse,
    /// Directory on this machine, used in place
    Direct,
}

/// Lifecycle of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Attached,
    Detached,
    /// Detach was attempted and failed; the mount needs manual cleanup
    Stale,
}

#[derive(Debug)]
struct HandleInner {
    id: Uuid,
    endpoint: RemoteEndpoint,
    mount_point: PathBuf,
    attached_at: DateTime<Utc>,
    owner: Option<OwnerMarker>,
    kind: MountKind,
    state: Mutex<HandleState>,
    overlays: AtomicUsize,
}

/// An attached remote directory.
///
/// Clones share state: detaching through one clone detaches them all.
#[derive(Debug, Clone)]
pub struct MountHandle {
    inner: Arc<HandleInner>,
}

impl MountHandle {
    pub(crate) fn new(
        endpoint: RemoteEndpoint,
        mount_point: PathBuf,
        kind: MountKind,
        owner: Option<OwnerMarker>,
    ) -> Self {
        MountHandle {
            inner: Arc::new(HandleInner {
                id: Uuid::new_v4(),
                endpoint,
                mount_point,
                attached_at: Utc::now(),
                owner,
                kind,
                state: Mutex::new(HandleState::Attached),
                overlays: AtomicUsize::new(0),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn endpoint(&self) -> &RemoteEndpoint {
        &self.inner.endpoint
    }

    pub fn mount_point(&self) -> &Path {
        &self.inner.mount_point
    }

    /// Local path through which the remote directory is visible
    pub fn path(&self) -> &Path {
        match self.inner.kind {
            MountKind::Fuse => &self.inner.mount_point,
            MountKind::Direct => &self.inner.endpoint.path,
        }
    }

    pub fn attached_at(&self) -> DateTime<Utc> {
        self.inner.attached_at
    }

    pub fn owner(&self) -> Option<&OwnerMarker> {
        self.inner.owner.as_ref()
    }

    pub fn kind(&self) -> MountKind {
        self.inner.kind
    }

    pub fn state(&self) -> HandleState {
        *self.inner.state.lock()
    }

    pub fn is_stale(&self) -> bool {
        self.state() == HandleState::Stale
    }

    /// Path of an attached handle; errors once detach was issued
    pub fn ensure_attached(&self) -> Result<&Path> {
        match self.state() {
            HandleState::Attached => Ok(self.path()),
            _ => Err(Error::HandleDetached(self.inner.mount_point.clone())),
        }
    }

    /// Whether both handles refer to the same attachment
    pub fn same_as(&self, other: &MountHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Overlays currently layered on this mount
    pub fn overlay_count(&self) -> usize {
        self.inner.overlays.load(Ordering::SeqCst)
    }

    pub(crate) fn retain_overlay(&self) {
        self.inner.overlays.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn release_overlay(&self) {
        let _ = self
            .inner
            .overlays
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub(crate) fn mark(&self, state: HandleState) {
        *self.inner.state.lock() = state;
    }
}

/// Attaches and detaches remote directories
pub struct MountManager {
    runner: Arc<dyn ProcessRunner>,
    probe: Arc<dyn MountProbe>,
    session: Uuid,
    tools: ToolConfig,
    timeouts: TimeoutConfig,
    detach: DetachConfig,
    handles: DashMap<RemoteEndpoint, MountHandle>,
}

impl MountManager {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        probe: Arc<dyn MountProbe>,
        session: Uuid,
        tools: ToolConfig,
        timeouts: TimeoutConfig,
        detach: DetachConfig,
    ) -> Self {
        MountManager {
            runner,
            probe,
            session,
            tools,
            timeouts,
            detach,
            handles: DashMap::new(),
        }
    }

    /// Make `endpoint` visible locally, at `mount_point` for remote hosts.
    ///
    /// A live handle for the same endpoint is returned as is.
    pub async fn attach(&self, endpoint: &RemoteEndpoint, mount_point: &Path) -> Result<MountHandle> {
        let existing = self.handles.get(endpoint).map(|h| h.clone());
        if let Some(handle) = existing {
            let live = handle.state() == HandleState::Attached
                && (handle.kind() == MountKind::Direct
                    || self.probe.state(handle.mount_point()) == MountPointState::Mounted);
            if live {
                debug!("Reusing mount of {} at {:?}", endpoint, handle.path());
                return Ok(handle);
            }
            self.handles.remove(endpoint);
        }

        let handle = if endpoint.is_local() {
            self.attach_direct(endpoint, mount_point)?
        } else {
            self.attach_fuse(endpoint, mount_point).await?
        };
        self.handles.insert(endpoint.clone(), handle.clone());
        Ok(handle)
    }

    /// A local directory is used in place; the owner marker is still
    /// claimed at `mount_point` so two sessions do not share it.
    fn attach_direct(&self, endpoint: &RemoteEndpoint, mount_point: &Path) -> Result<MountHandle> {
        if !endpoint.path.is_dir() {
            return Err(Error::MountUnreachable {
                endpoint: endpoint.to_string(),
                reason: "directory does not exist".to_string(),
            });
        }
        self.check_owner(mount_point)?;
        if let Some(parent) = mount_point.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let owner = OwnerMarker::current(self.session);
        owner.write(mount_point)?;

        info!("Using local directory {:?}", endpoint.path);
        Ok(MountHandle::new(
            endpoint.clone(),
            mount_point.to_path_buf(),
            MountKind::Direct,
            Some(owner),
        ))
    }

    async fn attach_fuse(&self, endpoint: &RemoteEndpoint, mount_point: &Path) -> Result<MountHandle> {
        let mut created = false;

        match self.probe.state(mount_point) {
            MountPointState::Mounted => {
                self.check_owner(mount_point)?;
                info!("Adopting existing mount of {} at {:?}", endpoint, mount_point);
                let owner = OwnerMarker::current(self.session);
                owner.write(mount_point)?;
                return Ok(MountHandle::new(
                    endpoint.clone(),
                    mount_point.to_path_buf(),
                    MountKind::Fuse,
                    Some(owner),
                ));
            }
            MountPointState::Unresponsive => {
                self.check_owner(mount_point)?;
                warn!("Mount at {:?} is not responding, unmounting it", mount_point);
                let reason = match self.unmount_once(mount_point).await {
                    Ok(output) if output.success() => None,
                    Ok(output) => Some(output.diagnostic()),
                    Err(e) => Some(e.to_string()),
                };
                if let Some(reason) = reason {
                    return Err(Error::MountAlreadyBusy {
                        mount_point: mount_point.to_path_buf(),
                        reason: format!("stale mount could not be cleaned up: {}", reason),
                    });
                }
                OwnerMarker::remove(mount_point)?;
            }
            MountPointState::Occupied => {
                return Err(Error::MountAlreadyBusy {
                    mount_point: mount_point.to_path_buf(),
                    reason: "path exists and is not an empty directory".to_string(),
                });
            }
            MountPointState::Missing => {
                std::fs::create_dir_all(mount_point)?;
                created = true;
            }
            MountPointState::Empty => {}
        }

        let mut spec = CommandSpec::new(&self.tools.sshfs);
        for option in &self.tools.sshfs_options {
            spec = spec.arg("-o").arg(option);
        }
        let spec = spec
            .args(["-o", "BatchMode=yes"])
            .arg(endpoint.to_string())
            .arg(mount_point)
            .timeout(Some(self.timeouts.mount()));

        info!("Mounting {} at {:?}", endpoint, mount_point);
        let result = self.runner.run(&spec).await;
        let failure = match result {
            Ok(output) if output.success() => {
                if self.probe.state(mount_point) == MountPointState::Mounted {
                    None
                } else {
                    Some(Error::MountUnreachable {
                        endpoint: endpoint.to_string(),
                        reason: "sshfs exited but nothing is mounted".to_string(),
                    })
                }
            }
            Ok(output) => Some(classify_mount_failure(endpoint, mount_point, &output)),
            Err(Error::ProcessTimeout { timeout, .. }) => Some(Error::MountUnreachable {
                endpoint: endpoint.to_string(),
                reason: format!("no answer within {:?}", timeout),
            }),
            Err(e) => Some(e),
        };

        if let Some(err) = failure {
            if created && !self.probe.state(mount_point).is_mounted() {
                let _ = std::fs::remove_dir(mount_point);
            }
            return Err(err);
        }

        let owner = OwnerMarker::current(self.session);
        owner.write(mount_point)?;
        Ok(MountHandle::new(
            endpoint.clone(),
            mount_point.to_path_buf(),
            MountKind::Fuse,
            Some(owner),
        ))
    }

    fn check_owner(&self, mount_point: &Path) -> Result<()> {
        OwnerMarker::check(mount_point, self.session)
    }

    /// Handle for a mount a previous run left behind, if any
    pub fn adopt(&self, endpoint: &RemoteEndpoint, mount_point: &Path) -> Result<Option<MountHandle>> {
        if endpoint.is_local() || !self.probe.state(mount_point).is_mounted() {
            return Ok(None);
        }
        self.check_owner(mount_point)?;
        let handle = MountHandle::new(
            endpoint.clone(),
            mount_point.to_path_buf(),
            MountKind::Fuse,
            OwnerMarker::read(mount_point),
        );
        self.handles.insert(endpoint.clone(), handle.clone());
        Ok(Some(handle))
    }

    /// Probe state and owner of a mount point
    pub fn inspect(&self, mount_point: &Path) -> (MountPointState, Option<OwnerMarker>) {
        (self.probe.state(mount_point), OwnerMarker::read(mount_point))
    }

    /// Unmount and release a handle. Detaching a detached handle is a no-op.
    ///
    /// Busy unmounts are retried with backoff; once the retries are used up
    /// the handle is marked stale and [`Error::MountDetachFailed`] returned.
    pub async fn detach(&self, handle: &MountHandle) -> Result<()> {
        if handle.state() == HandleState::Detached {
            debug!("{:?} already detached", handle.mount_point());
            return Ok(());
        }
        if handle.overlay_count() > 0 {
            return Err(Error::TeardownOrder(format!(
                "{:?} still carries {} overlay(s)",
                handle.mount_point(),
                handle.overlay_count()
            )));
        }

        if handle.kind() == MountKind::Direct {
            if let Err(e) = OwnerMarker::remove(handle.mount_point()) {
                warn!("Could not remove owner marker of {:?}: {}", handle.mount_point(), e);
            }
            self.release(handle);
            return Ok(());
        }

        let mount_point = handle.mount_point();
        if !self.probe.state(mount_point).is_mounted() {
            debug!("{:?} is no longer mounted", mount_point);
            self.finish_detach(handle);
            return Ok(());
        }

        match unmount_with_retry(
            self.runner.as_ref(),
            &self.tools.fusermount,
            self.timeouts.unmount(),
            &self.detach,
            mount_point,
        )
        .await
        {
            Unmount::Done => {
                self.finish_detach(handle);
                Ok(())
            }
            Unmount::Failed { attempts, reason } => {
                handle.mark(HandleState::Stale);
                warn!("Giving up on unmounting {:?}: {}", mount_point, reason);
                Err(Error::MountDetachFailed {
                    mount_point: mount_point.to_path_buf(),
                    attempts,
                    reason,
                })
            }
        }
    }

    async fn unmount_once(&self, mount_point: &Path) -> Result<ProcessOutput> {
        let spec = unmount_command(&self.tools.fusermount, mount_point)
            .timeout(Some(self.timeouts.unmount()));
        self.runner.run(&spec).await
    }

    fn finish_detach(&self, handle: &MountHandle) {
        let mount_point = handle.mount_point();
        if let Err(e) = std::fs::remove_dir(mount_point) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove mount point {:?}: {}", mount_point, e);
            }
        }
        if let Err(e) = OwnerMarker::remove(mount_point) {
            warn!("Could not remove owner marker of {:?}: {}", mount_point, e);
        }
        info!("Detached {}", handle.endpoint());
        self.release(handle);
    }

    fn release(&self, handle: &MountHandle) {
        handle.mark(HandleState::Detached);
        self.handles
            .remove_if(handle.endpoint(), |_, registered| registered.same_as(handle));
    }
}

/// Result of [`unmount_with_retry`]
pub(crate) enum Unmount {
    Done,
    Failed { attempts: u32, reason: String },
}

/// Unmount `path`, retrying busy unmounts with backoff. A path that is not
/// mounted counts as unmounted. Never lazy, never forced.
pub(crate) async fn unmount_with_retry(
    runner: &dyn ProcessRunner,
    tool: &str,
    timeout: Duration,
    policy: &DetachConfig,
    path: &Path,
) -> Unmount {
    let mut schedule = RetrySchedule::from_millis(policy.base_delay_ms, policy.retries);
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        info!("Unmounting {:?} (attempt {})", path, attempts);

        let spec = unmount_command(tool, path).timeout(Some(timeout));
        let reason = match runner.run(&spec).await {
            Ok(output) if output.success() || is_not_mounted(&output) => return Unmount::Done,
            Ok(output) if is_busy(&output) => output.diagnostic(),
            Ok(output) => {
                return Unmount::Failed {
                    attempts,
                    reason: output.diagnostic(),
                }
            }
            Err(Error::ProcessTimeout { timeout, .. }) => {
                format!("unmount timed out after {:?}", timeout)
            }
            Err(e) => {
                return Unmount::Failed {
                    attempts,
                    reason: e.to_string(),
                }
            }
        };

        match schedule.next() {
            Some(delay) => {
                warn!("Unmount of {:?} failed ({}), retrying in {:?}", path, reason, delay);
                tokio::time::sleep(delay).await;
            }
            None => return Unmount::Failed { attempts, reason },
        }
    }
}

/// `fusermount -u <path>`, or `umount <path>` for other tools
pub(crate) fn unmount_command(tool: &str, path: &Path) -> CommandSpec {
    let spec = CommandSpec::new(tool);
    if tool.ends_with("fusermount") || tool.ends_with("fusermount3") {
        spec.arg("-u").arg(path)
    } else {
        spec.arg(path)
    }
}

pub(crate) fn is_busy(output: &ProcessOutput) -> bool {
    let stderr = output.stderr.to_lowercase();
    stderr.contains("busy")
}

pub(crate) fn is_not_mounted(output: &ProcessOutput) -> bool {
    let stderr = output.stderr.to_lowercase();
    stderr.contains("not found in /etc/mtab") || stderr.contains("not mounted")
}

/// One classification table for sshfs failures
fn classify_mount_failure(endpoint: &RemoteEndpoint, mount_point: &Path, output: &ProcessOutput) -> Error {
    let stderr = output.stderr.to_lowercase();
    let reason = output.diagnostic();
    let endpoint = endpoint.to_string();

    const AUTH: &[&str] = &["permission denied", "host key verification failed", "too many authentication failures"];
    const BUSY: &[&str] = &["nonempty", "not empty", "device or resource busy"];

    if AUTH.iter().any(|p| stderr.contains(p)) {
        Error::MountAuthFailed { endpoint, reason }
    } else if BUSY.iter().any(|p| stderr.contains(p)) {
        Error::MountAlreadyBusy {
            mount_point: mount_point.to_path_buf(),
            reason,
        }
    } else {
        Error::MountUnreachable { endpoint, reason }
    }
}
