//! External collaborators that touch host networking and disk images.
//!
//! Each concern is a narrow trait taking a named-parameter request so the
//! pipeline can be exercised against mocks. [`ScriptRunner`] is the
//! production implementation: it shells out to the deployment's helper
//! scripts (`setup_tap.sh`, `teardown_tap.sh`, `create_rootfs.sh`,
//! `cleanup.sh`).

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use firefleet_core::StorageSize;
use tokio::process::Command;

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed ({}): {diagnostic}", exit_label(.status))]
pub struct ScriptFailure {
    /// Collaborator operation, e.g. `"attach_tap"`.
    pub operation: &'static str,
    /// Exit code, if the collaborator ran and exited normally.
    pub status: Option<i32>,
    /// Captured stderr, or the reason the collaborator could not run.
    pub diagnostic: String,
}

fn exit_label(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit {code}"),
        None => "did not run to completion".to_owned(),
    }
}

/// Parameters for attaching a tap device to a host bridge.
#[derive(Debug, Clone, Copy)]
pub struct TapRequest<'a> {
    pub iface: &'a str,
    pub bridge: &'a str,
}

/// Parameters for deriving a VM's root disk from a staged image.
#[derive(Debug, Clone, Copy)]
pub struct RootfsRequest<'a> {
    pub src_image: &'a Path,
    pub dest_image: &'a Path,
    pub size: &'a StorageSize,
    pub ip_addr: &'a str,
    pub gateway: &'a str,
    pub hostname: &'a str,
    pub ssh_key: &'a str,
}

/// Host network wiring.
#[async_trait]
pub trait NetworkSetup: Send + Sync {
    /// Create `iface` and attach it to `bridge`.
    ///
    /// # Errors
    /// Returns [`ScriptFailure`] if the device could not be wired.
    async fn attach_tap(&self, request: &TapRequest<'_>) -> Result<(), ScriptFailure>;

    /// Remove `iface`. Must tolerate an already-absent device.
    ///
    /// # Errors
    /// Returns [`ScriptFailure`] if the device exists but cannot be removed.
    async fn detach_tap(&self, iface: &str) -> Result<(), ScriptFailure>;
}

/// Root disk preparation.
#[async_trait]
pub trait StorageSetup: Send + Sync {
    /// Write `dest_image`, sized and customised for the guest.
    ///
    /// # Errors
    /// Returns [`ScriptFailure`] if the image cannot be produced.
    async fn prepare_rootfs(&self, request: &RootfsRequest<'_>) -> Result<(), ScriptFailure>;
}

/// Host-side release of anything bound to a control socket.
#[async_trait]
pub trait Cleanup: Send + Sync {
    /// Release resources tied to `socket_path`.
    ///
    /// # Errors
    /// Returns [`ScriptFailure`] if the release did not complete.
    async fn release(&self, socket_path: &Path) -> Result<(), ScriptFailure>;
}

/// The set of collaborators the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub network: Arc<dyn NetworkSetup>,
    pub storage: Arc<dyn StorageSetup>,
    pub cleanup: Arc<dyn Cleanup>,
}

impl Collaborators {
    /// Use one script runner for every concern.
    #[must_use]
    pub fn scripts(runner: ScriptRunner) -> Self {
        let runner = Arc::new(runner);
        Self {
            network: runner.clone(),
            storage: runner.clone(),
            cleanup: runner,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Runs the deployment's bash helper scripts.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    script_dir: PathBuf,
    use_sudo: bool,
}

impl ScriptRunner {
    /// Create a runner resolving scripts relative to `script_dir`.
    #[must_use]
    pub fn new(script_dir: PathBuf, use_sudo: bool) -> Self {
        Self { script_dir, use_sudo }
    }

    fn command(&self, script: &str, args: &[&OsStr]) -> Command {
        let script_path = self.script_dir.join(script);
        let mut command = if self.use_sudo {
            let mut c = Command::new("sudo");
            c.arg("bash");
            c
        } else {
            Command::new("bash")
        };
        command.arg(script_path).args(args);
        command.stdin(std::process::Stdio::null());
        command
    }

    async fn run(
        &self,
        operation: &'static str,
        script: &str,
        args: &[&OsStr],
    ) -> Result<(), ScriptFailure> {
        tracing::debug!(operation, script, "running collaborator script");

        let output = self
            .command(script, args)
            .output()
            .await
            .map_err(|e| ScriptFailure {
                operation,
                status: None,
                diagnostic: format!("cannot execute {script}: {e}"),
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        tracing::warn!(operation, script, status = ?output.status.code(), %stderr, "collaborator script failed");
        Err(ScriptFailure {
            operation,
            status: output.status.code(),
            diagnostic: stderr,
        })
    }
}

#[async_trait]
impl NetworkSetup for ScriptRunner {
    async fn attach_tap(&self, request: &TapRequest<'_>) -> Result<(), ScriptFailure> {
        self.run(
            "attach_tap",
            "setup_tap.sh",
            &[OsStr::new(request.iface), OsStr::new(request.bridge)],
        )
        .await
    }

    async fn detach_tap(&self, iface: &str) -> Result<(), ScriptFailure> {
        self.run("detach_tap", "teardown_tap.sh", &[OsStr::new(iface)]).await
    }
}

#[async_trait]
impl StorageSetup for ScriptRunner {
    async fn prepare_rootfs(&self, request: &RootfsRequest<'_>) -> Result<(), ScriptFailure> {
        let size = OsString::from(request.size.as_str());
        self.run(
            "prepare_rootfs",
            "create_rootfs.sh",
            &[
                request.src_image.as_os_str(),
                request.dest_image.as_os_str(),
                &size,
                OsStr::new(request.ip_addr),
                OsStr::new(request.gateway),
                OsStr::new(request.hostname),
                OsStr::new(request.ssh_key),
            ],
        )
        .await
    }
}

#[async_trait]
impl Cleanup for ScriptRunner {
    async fn release(&self, socket_path: &Path) -> Result<(), ScriptFailure> {
        self.run("release", "cleanup.sh", &[socket_path.as_os_str()]).await
    }
}
