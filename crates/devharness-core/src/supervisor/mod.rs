//! Child process lifecycle: workspace, spawn, readiness, teardown.
//!
//! [`launch`] performs the whole start sequence and leaves nothing behind
//! when it fails: the child is killed and the workspace removed before the
//! error is returned. A successful launch hands back a
//! [`ProcessSupervisor`] that owns both until [`ProcessSupervisor::teardown`].

pub mod command;

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ComponentSpec, HarnessConfig};
use crate::error::{HarnessError, Result};
use crate::logging::Logger;
use crate::manifest::{self, ManifestTemplates};
use crate::readiness::{AddressScanner, ComponentAddresses, ReadinessBarrier, required_endpoints};
use crate::toolchain::Toolchain;

pub use command::{ChildCommand, CommandSpec, Platform, STORAGE_DIR};

/// Module every harness talks to for RPCs.
pub const DEFAULT_MODULE: &str = "default";
/// Module declared by the implicit manifest when a component claims `default`.
pub const HELPER_MODULE: &str = "harness-helper";

/// How long the child gets to exit after the termination signal.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);
/// How long to wait for the stderr reader to drain once the child is gone.
const SCANNER_DRAIN: Duration = Duration::from_secs(1);
const EVENT_BUFFER: usize = 16;

/// Module name declared by the implicit manifest.
pub fn implicit_module(components: &[ComponentSpec]) -> &'static str {
    if components.iter().any(|c| c.name == DEFAULT_MODULE) {
        HELPER_MODULE
    } else {
        DEFAULT_MODULE
    }
}

/// Owns the child process and its workspace directory.
#[derive(Debug)]
pub struct ProcessSupervisor {
    child: Option<Child>,
    workspace: Option<TempDir>,
    scanner: Option<JoinHandle<()>>,
    terminate_grace: Duration,
}

impl ProcessSupervisor {
    /// Create the exclusive temporary workspace.
    pub fn create_workspace() -> Result<Self> {
        let workspace = tempfile::Builder::new()
            .prefix("devharness")
            .tempdir()
            .map_err(|e| HarnessError::workspace(std::env::temp_dir(), e))?;
        debug!(workspace = %workspace.path().display(), "workspace created");
        Ok(Self {
            child: None,
            workspace: Some(workspace),
            scanner: None,
            terminate_grace: TERMINATE_GRACE,
        })
    }

    /// Override how long [`terminate`](Self::terminate) waits before killing.
    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_ref().map(TempDir::path)
    }

    /// Where the child keeps its datastore.
    pub fn storage_dir(&self) -> Option<PathBuf> {
        self.workspace().map(|ws| ws.join(STORAGE_DIR))
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(_))) | None => false,
            Some(Err(e)) => {
                warn!(error = %e, "error checking child status");
                false
            }
        }
    }

    /// Start the child with stdout passed through and stderr captured.
    pub fn start(&mut self, command: &ChildCommand) -> Result<ChildStderr> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| HarnessError::Spawn {
            program: command.program.to_string_lossy().into_owned(),
            source: e,
        })?;
        info!(pid = child.id(), program = ?command.program, "dev server started");

        let stderr = child.stderr.take().ok_or_else(|| HarnessError::Spawn {
            program: command.program.to_string_lossy().into_owned(),
            source: std::io::Error::other("child stderr was not captured"),
        })?;
        self.child = Some(child);
        Ok(stderr)
    }

    /// Force-kill the child without the graceful signal. No-op if absent.
    pub async fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            let pid = child.id();
            if let Err(e) = child.kill().await {
                warn!(pid, error = %e, "failed to kill dev server");
            } else {
                debug!(pid, "dev server killed");
            }
        }
        self.drain_scanner().await;
    }

    /// Send the platform's termination signal and wait for exit.
    ///
    /// A failed wait, an abnormal exit, or a child that outlives the grace
    /// period and has to be killed is returned as [`HarnessError::ChildExit`].
    /// No-op when no child is running.
    pub async fn terminate(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            debug!("terminate called with no child running");
            return Ok(());
        };
        let pid = child.id();

        send_terminate(&mut child);

        let status = match tokio::time::timeout(self.terminate_grace, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                self.drain_scanner().await;
                return Err(HarnessError::ChildExit {
                    detail: format!("waiting for pid {pid:?} failed: {e}"),
                    status: None,
                });
            }
            Err(_elapsed) => {
                warn!(pid, "dev server ignored termination signal, killing");
                let status = match child.kill().await {
                    Ok(()) => child.wait().await.ok(),
                    Err(e) => {
                        warn!(pid, error = %e, "failed to kill dev server");
                        None
                    }
                };
                self.drain_scanner().await;
                return Err(HarnessError::ChildExit {
                    detail: "dev server ignored SIGTERM, killed".to_string(),
                    status,
                });
            }
        };
        self.drain_scanner().await;

        if exited_cleanly(&status) {
            info!(pid, %status, "dev server stopped");
            Ok(())
        } else {
            Err(HarnessError::ChildExit {
                detail: format!("dev server exited abnormally: {status}"),
                status: Some(status),
            })
        }
    }

    /// Delete the workspace. Failures are logged, not returned.
    pub fn remove_workspace(&mut self) {
        if let Some(workspace) = self.workspace.take() {
            let path = workspace.path().to_path_buf();
            match workspace.close() {
                Ok(()) => debug!(workspace = %path.display(), "workspace removed"),
                Err(e) => warn!(workspace = %path.display(), error = %e, "failed to remove workspace"),
            }
        }
    }

    /// Terminate the child, then remove the workspace. Safe to repeat.
    pub async fn teardown(&mut self) -> Result<()> {
        let terminated = self.terminate().await;
        self.remove_workspace();
        terminated
    }

    /// Cleanup for a failed start: kill, then remove the workspace.
    pub async fn abort(&mut self) {
        self.kill().await;
        self.remove_workspace();
    }

    async fn drain_scanner(&mut self) {
        if let Some(handle) = self.scanner.take() {
            if tokio::time::timeout(SCANNER_DRAIN, handle).await.is_err() {
                debug!("stderr reader still running after child exit");
            }
        }
    }

    async fn boot(
        &mut self,
        config: &HarnessConfig,
        toolchain: &Toolchain,
        platform: Platform,
        templates: &dyn ManifestTemplates,
        logger: Logger,
    ) -> Result<ComponentAddresses> {
        let workspace = self
            .workspace()
            .map(Path::to_path_buf)
            .ok_or_else(|| HarnessError::ConfigInvalid("workspace already removed".to_string()))?;

        let module = implicit_module(&config.components);
        let app_manifest = manifest::write_manifests(
            templates,
            &workspace,
            config.app_id(),
            module,
            &config.task_queues,
        )?;

        let mut manifests = vec![app_manifest];
        manifests.extend(config.components.iter().map(|c| c.manifest.clone()));
        let command = CommandSpec {
            toolchain,
            workspace: &workspace,
            log_level: logger.threshold(),
            manifests,
        }
        .build(platform);

        let stderr = self.start(&command)?;

        let endpoints = required_endpoints(module, &config.components);
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        self.scanner = Some(AddressScanner::new(&endpoints, logger).spawn(stderr, tx));

        let deadline = Instant::now() + config.startup_timeout;
        ReadinessBarrier::new(endpoints).await_all(&mut rx, deadline).await
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            warn!(pid = child.id(), "dev server dropped without teardown, killing");
            let _ = child.start_kill();
        }
        if let Some(handle) = self.scanner.take() {
            handle.abort();
        }
        // The TempDir removes the workspace on drop.
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    // SAFETY: pid belongs to a child we spawned and have not yet reaped.
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret != 0 {
        warn!(pid, error = %std::io::Error::last_os_error(), "SIGTERM failed, killing");
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(pid = child.id(), error = %e, "failed to terminate dev server");
    }
}

/// Exit code zero, or death by the signal we sent.
fn exited_cleanly(status: &ExitStatus) -> bool {
    if status.success() {
        return true;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if matches!(status.signal(), Some(libc::SIGTERM) | Some(libc::SIGKILL)) {
            return true;
        }
    }
    false
}

/// Resolve dependencies, create the workspace, start the child, and wait
/// for every component to announce itself.
pub async fn launch(
    config: &HarnessConfig,
    templates: &dyn ManifestTemplates,
    logger: Logger,
) -> Result<(ProcessSupervisor, ComponentAddresses)> {
    let toolchain = match &config.toolchain {
        Some(toolchain) => toolchain.clone(),
        None => Toolchain::discover()?,
    };
    let platform = Platform::current()?;

    let mut supervisor = ProcessSupervisor::create_workspace()?;
    match supervisor
        .boot(config, &toolchain, platform, templates, logger)
        .await
    {
        Ok(addresses) => Ok((supervisor, addresses)),
        Err(e) => {
            warn!(error = %e, "dev server failed to start, cleaning up");
            supervisor.abort().await;
            Err(e)
        }
    }
}
