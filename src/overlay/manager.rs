//! Encryption overlay manager
//!
//! Runs encfs on top of an attached mount. The underlying directory holds
//! the ciphertext; the view path shows the plaintext.

use crate::config::{DetachConfig, TimeoutConfig, ToolConfig};
use crate::error::{Error, Result};
use crate::mount::manager::{unmount_command, unmount_with_retry, Unmount};
use crate::mount::{HandleState, MountHandle, MountPointState, MountProbe, OwnerMarker};
use crate::overlay::cipher::{CipherConfig, MARKER_FILE};
use crate::process::{CommandSpec, ProcessRunner};
use crate::secret::Secret;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A running overlay. Holds a reference to its mount, which must not be
/// detached before the overlay is.
#[derive(Debug, Clone)]
pub struct OverlayHandle {
    mount: MountHandle,
    view: PathBuf,
    cipher: CipherConfig,
    state: Arc<Mutex<HandleState>>,
}

impl OverlayHandle {
    fn new(mount: &MountHandle, view: PathBuf, cipher: CipherConfig) -> Self {
        mount.retain_overlay();
        OverlayHandle {
            mount: mount.clone(),
            view,
            cipher,
            state: Arc::new(Mutex::new(HandleState::Attached)),
        }
    }

    pub fn mount(&self) -> &MountHandle {
        &self.mount
    }

    /// Decrypted view
    pub fn view(&self) -> &Path {
        &self.view
    }

    pub fn cipher(&self) -> &CipherConfig {
        &self.cipher
    }

    pub fn state(&self) -> HandleState {
        *self.state.lock()
    }

    pub fn is_stale(&self) -> bool {
        self.state() == HandleState::Stale
    }

    pub fn ensure_attached(&self) -> Result<&Path> {
        match self.state() {
            HandleState::Attached => Ok(&self.view),
            _ => Err(Error::HandleDetached(self.view.clone())),
        }
    }

    fn mark(&self, state: HandleState) {
        let mut current = self.state.lock();
        if *current != HandleState::Detached && state == HandleState::Detached {
            self.mount.release_overlay();
        }
        *current = state;
    }
}

/// Starts and stops encfs overlays
pub struct OverlayManager {
    runner: Arc<dyn ProcessRunner>,
    probe: Arc<dyn MountProbe>,
    session: Uuid,
    tools: ToolConfig,
    timeouts: TimeoutConfig,
    detach: DetachConfig,
}

impl OverlayManager {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        probe: Arc<dyn MountProbe>,
        session: Uuid,
        tools: ToolConfig,
        timeouts: TimeoutConfig,
        detach: DetachConfig,
    ) -> Self {
        OverlayManager {
            runner,
            probe,
            session,
            tools,
            timeouts,
            detach,
        }
    }

    /// Check the volume marker in the underlying directory against `cipher`.
    ///
    /// Returns true when there is no volume yet. The marker is only read.
    pub fn check_volume(&self, underlying: &Path, cipher: &CipherConfig) -> Result<bool> {
        let marker = underlying.join(MARKER_FILE);
        if marker.exists() {
            let recorded = CipherConfig::from_marker(&marker)?;
            let differences = cipher.differences(&recorded);
            if !differences.is_empty() {
                return Err(Error::OverlayConfigMismatch {
                    marker,
                    reason: differences.join("; "),
                });
            }
            return Ok(false);
        }

        let has_content = std::fs::read_dir(underlying)?.next().is_some();
        if has_content {
            return Err(Error::OverlayConfigMismatch {
                marker,
                reason: "directory has content but no encrypted volume marker".to_string(),
            });
        }
        Ok(true)
    }

    /// Start the overlay on an attached mount, showing the plaintext at `view`.
    ///
    /// A view held by another live session is refused with
    /// [`Error::MountAlreadyBusy`]; a running overlay of our own session or
    /// of a dead one is reused.
    pub async fn attach(
        &self,
        mount: &MountHandle,
        view: &Path,
        cipher: &CipherConfig,
        key: &Secret,
    ) -> Result<OverlayHandle> {
        let underlying = mount.ensure_attached()?.to_path_buf();
        OwnerMarker::check(view, self.session)?;
        let new_volume = self.check_volume(&underlying, cipher)?;

        let mut created = false;
        match self.probe.state(view) {
            MountPointState::Mounted => {
                info!("Reusing running overlay at {:?}", view);
                OwnerMarker::current(self.session).write(view)?;
                return Ok(OverlayHandle::new(mount, view.to_path_buf(), cipher.clone()));
            }
            MountPointState::Unresponsive => {
                warn!("Overlay at {:?} is not responding, unmounting it", view);
                let spec = unmount_command(&self.tools.fusermount, view)
                    .timeout(Some(self.timeouts.unmount()));
                let output = self.runner.run(&spec).await?;
                if !output.success() {
                    return Err(Error::OverlayInitFailed {
                        view: view.to_path_buf(),
                        reason: format!("stale overlay could not be stopped: {}", output.diagnostic()),
                    });
                }
            }
            MountPointState::Occupied => {
                return Err(Error::OverlayInitFailed {
                    view: view.to_path_buf(),
                    reason: "view path exists and is not an empty directory".to_string(),
                });
            }
            MountPointState::Missing => {
                std::fs::create_dir_all(view)?;
                created = true;
            }
            MountPointState::Empty => {}
        }

        let input = if new_volume {
            info!("Creating encrypted volume in {:?} ({})", underlying, cipher);
            Secret::new(format!("{}{}", cipher.expert_answers(), key.expose()))
        } else {
            key.clone()
        };
        let spec = CommandSpec::new(&self.tools.encfs)
            .arg("--stdinpass")
            .arg(&underlying)
            .arg(view)
            .stdin(input)
            .timeout(Some(self.timeouts.overlay()));

        info!("Starting overlay {:?} -> {:?}", underlying, view);
        let failure = match self.runner.run(&spec).await {
            Ok(output) if output.success() => self.verify_started(&underlying, view, new_volume),
            Ok(output) => Some(output.diagnostic()),
            Err(Error::ProcessLaunch { source, .. }) => Some(format!("cannot start encfs: {}", source)),
            Err(e) => {
                self.cleanup_view(view, created);
                return Err(e);
            }
        };

        if let Some(reason) = failure {
            self.cleanup_view(view, created);
            return Err(Error::OverlayInitFailed {
                view: view.to_path_buf(),
                reason,
            });
        }

        OwnerMarker::current(self.session).write(view)?;
        Ok(OverlayHandle::new(mount, view.to_path_buf(), cipher.clone()))
    }

    fn verify_started(&self, underlying: &Path, view: &Path, new_volume: bool) -> Option<String> {
        if self.probe.state(view) != MountPointState::Mounted {
            return Some("encfs exited but the view is not mounted".to_string());
        }
        if new_volume && !underlying.join(MARKER_FILE).exists() {
            return Some("encfs did not create a volume marker".to_string());
        }
        None
    }

    fn cleanup_view(&self, view: &Path, created: bool) {
        if created && !self.probe.state(view).is_mounted() {
            let _ = std::fs::remove_dir(view);
        }
    }

    /// Handle for an overlay left running on `mount`, unless another live
    /// session holds it
    pub fn adopt(
        &self,
        mount: &MountHandle,
        view: &Path,
        cipher: &CipherConfig,
    ) -> Result<Option<OverlayHandle>> {
        if !self.probe.state(view).is_mounted() {
            return Ok(None);
        }
        OwnerMarker::check(view, self.session)?;
        Ok(Some(OverlayHandle::new(mount, view.to_path_buf(), cipher.clone())))
    }

    /// Stop the overlay and remove its view. Must run before the mount's
    /// detach; detaching a detached overlay is a no-op.
    pub async fn detach(&self, overlay: &OverlayHandle) -> Result<()> {
        if overlay.state() == HandleState::Detached {
            debug!("Overlay {:?} already detached", overlay.view());
            return Ok(());
        }

        let view = overlay.view();
        if self.probe.state(view).is_mounted() {
            let outcome = unmount_with_retry(
                self.runner.as_ref(),
                &self.tools.fusermount,
                self.timeouts.unmount(),
                &self.detach,
                view,
            )
            .await;
            if let Unmount::Failed { attempts, reason } = outcome {
                overlay.mark(HandleState::Stale);
                warn!("Giving up on stopping overlay {:?}: {}", view, reason);
                return Err(Error::OverlayDetachFailed {
                    view: view.to_path_buf(),
                    attempts,
                    reason,
                });
            }
        }

        if let Err(e) = std::fs::remove_dir(view) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove overlay view {:?}: {}", view, e);
            }
        }
        if let Err(e) = OwnerMarker::remove(view) {
            warn!("Could not remove owner marker of {:?}: {}", view, e);
        }
        overlay.mark(HandleState::Detached);
        info!("Stopped overlay {:?}", view);
        Ok(())
    }
}
