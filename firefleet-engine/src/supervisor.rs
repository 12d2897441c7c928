//! Process supervisor: owns every hypervisor process and control socket.
//!
//! Handles live in a map keyed by VM id. The map lock is only held for
//! bookkeeping; socket I/O, waits and kills happen after it is released.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use firefleet_core::VmId;
use tokio::sync::Mutex;

use crate::backend::{LaunchSpec, VmmBackend};
use crate::bridge::ControlBridge;
use crate::control::{self, ControlAction};
use crate::handle::{LogTail, VmHandle, VmProcess};
use crate::{EngineConfig, EngineError};

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Timing and exposure settings taken from [`EngineConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub socket_timeout: Duration,
    pub terminate_timeout: Duration,
    pub bridge_host: Option<IpAddr>,
}

impl From<&EngineConfig> for SupervisorSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            socket_timeout: config.socket_timeout,
            terminate_timeout: config.terminate_timeout,
            bridge_host: config.control_bridge_host,
        }
    }
}

pub struct ProcessSupervisor {
    backend: Arc<dyn VmmBackend>,
    handles: Mutex<HashMap<VmId, VmHandle>>,
    settings: SupervisorSettings,
}

impl ProcessSupervisor {
    #[must_use]
    pub fn new(backend: Arc<dyn VmmBackend>, settings: SupervisorSettings) -> Self {
        Self {
            backend,
            handles: Mutex::new(HashMap::new()),
            settings,
        }
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn VmmBackend> {
        &self.backend
    }

    /// Spawn the hypervisor for `vm_id` and start tracking it.
    ///
    /// Stdout (the serial console) goes to `spec.console_log` and stderr to
    /// `spec.log_path`. The hypervisor runs in its own process group and is
    /// not tied to this process: it survives a restart of the service and is
    /// only stopped through [`terminate`](Self::terminate).
    ///
    /// # Errors
    /// Returns [`EngineError::LaunchFailure`] if the process cannot be spawned.
    pub async fn launch(&self, vm_id: VmId, spec: &LaunchSpec) -> Result<(), EngineError> {
        let launch_failure = |diagnostic: String| EngineError::LaunchFailure { vm_id, diagnostic };

        let open = |path: &Path| {
            std::fs::File::create(path)
                .map_err(|e| launch_failure(format!("open {}: {e}", path.display())))
        };
        let console = open(&spec.console_log)?;
        let log = open(&spec.log_path)?;

        let mut command = self.backend.command(spec);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(console))
            .stderr(Stdio::from(log))
            .process_group(0);

        let child = command
            .spawn()
            .map_err(|e| launch_failure(format!("exec hypervisor: {e}")))?;

        tracing::info!(
            %vm_id,
            pid = ?child.id(),
            socket = %spec.socket_path.display(),
            "hypervisor spawned"
        );

        let handle = VmHandle::owned(vm_id, spec.socket_path.clone(), child, LogTail::at(spec.log_path.clone()));
        if let Some(previous) = self.handles.lock().await.insert(vm_id, handle) {
            tracing::warn!(%vm_id, pid = ?previous.pid(), "replaced an existing handle");
        }
        Ok(())
    }

    /// Track a hypervisor this supervisor did not spawn.
    pub async fn adopt(&self, vm_id: VmId, socket_path: PathBuf) {
        tracing::info!(%vm_id, socket = %socket_path.display(), "adopting running hypervisor");
        self.handles
            .lock()
            .await
            .insert(vm_id, VmHandle::adopted(vm_id, socket_path));
    }

    /// Whether `vm_id` has a handle.
    pub async fn is_tracked(&self, vm_id: VmId) -> bool {
        self.handles.lock().await.contains_key(&vm_id)
    }

    /// Whether the hypervisor for `vm_id` is still running.
    ///
    /// Owned processes are polled without blocking; adopted ones are probed
    /// through their socket. Untracked ids are not alive.
    pub async fn check_alive(&self, vm_id: VmId) -> bool {
        let adopted_socket = {
            let mut handles = self.handles.lock().await;
            match handles.get_mut(&vm_id).map(|h| (&mut h.process, &h.socket_path)) {
                None => return false,
                Some((VmProcess::Owned(child), _)) => {
                    return matches!(child.try_wait(), Ok(None));
                }
                Some((VmProcess::Adopted, socket)) => socket.clone(),
            }
        };
        control::probe(&adopted_socket).await
    }

    /// Best available explanation of why `vm_id`'s hypervisor exited.
    pub async fn exit_diagnostic(&self, vm_id: VmId) -> String {
        let (status, log) = {
            let mut handles = self.handles.lock().await;
            match handles.get_mut(&vm_id) {
                Some(handle) => {
                    let status = match &mut handle.process {
                        VmProcess::Owned(child) => child.try_wait().ok().flatten(),
                        VmProcess::Adopted => None,
                    };
                    (status, handle.log.clone())
                }
                None => return "hypervisor is not supervised".to_owned(),
            }
        };

        let text = log.text().await;
        match (status, text.is_empty()) {
            (_, false) => text,
            (Some(status), true) => format!("hypervisor exited with {status}"),
            (None, true) => "hypervisor exited without output".to_owned(),
        }
    }

    /// Poll until `socket_path` exists.
    ///
    /// # Errors
    /// Returns [`EngineError::ControlUnreachable`] on timeout.
    pub async fn wait_for_socket(&self, socket_path: &Path) -> Result<(), EngineError> {
        let deadline = tokio::time::Instant::now() + self.settings.socket_timeout;
        loop {
            if tokio::fs::try_exists(socket_path).await.unwrap_or(false) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::ControlUnreachable {
                    socket: socket_path.to_owned(),
                    reason: format!(
                        "socket did not appear within {}ms",
                        self.settings.socket_timeout.as_millis()
                    ),
                });
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
    }

    /// Send `action` to a live hypervisor.
    ///
    /// # Errors
    /// Returns [`EngineError::ControlUnreachable`] if the VM is not tracked,
    /// not alive, or its socket does not answer, and
    /// [`EngineError::ControlRejected`] if the hypervisor refuses the action.
    pub async fn send_control(&self, vm_id: VmId, action: ControlAction) -> Result<(), EngineError> {
        let socket = self.handles.lock().await.get(&vm_id).map(|h| h.socket_path.clone());
        let Some(socket) = socket else {
            return Err(EngineError::ControlUnreachable {
                socket: PathBuf::new(),
                reason: format!("VM {vm_id} is not supervised"),
            });
        };
        if !self.check_alive(vm_id).await {
            return Err(EngineError::ControlUnreachable {
                socket,
                reason: "hypervisor is not running".to_owned(),
            });
        }
        control::send_action(&socket, action).await
    }

    /// Expose `vm_id`'s control socket on `port`. Bind failure is logged and
    /// otherwise ignored. Returns the bound address.
    pub async fn expose(&self, vm_id: VmId, port: u16) -> Option<SocketAddr> {
        let host = self.settings.bridge_host?;
        let socket = self.handles.lock().await.get(&vm_id).map(|h| h.socket_path.clone())?;

        let bridge = match ControlBridge::bind(SocketAddr::new(host, port), socket).await {
            Ok(bridge) => bridge,
            Err(e) => {
                tracing::warn!(%vm_id, port, error = %e, "control bridge bind failed");
                return None;
            }
        };
        let addr = bridge.local_addr();
        match self.handles.lock().await.get_mut(&vm_id) {
            Some(handle) => {
                handle.bridge = Some(bridge);
                tracing::info!(%vm_id, %addr, "control socket exposed");
                Some(addr)
            }
            // Terminated while binding; dropping the bridge closes it.
            None => None,
        }
    }

    /// Stop `vm_id`'s hypervisor and remove its socket file.
    ///
    /// Sends `SendCtrlAltDel`, waits up to the terminate timeout, then kills.
    /// Calling this for an untracked or already stopped VM only removes the
    /// socket file.
    ///
    /// # Errors
    /// Returns [`EngineError::Io`] if the process cannot be killed or
    /// [`EngineError::Workspace`] if the socket file cannot be removed.
    pub async fn terminate(&self, vm_id: VmId, socket_path: &Path) -> Result<(), EngineError> {
        let handle = self.handles.lock().await.remove(&vm_id);
        let mut result = Ok(());

        if let Some(mut handle) = handle {
            drop(handle.bridge.take());
            result = match &mut handle.process {
                VmProcess::Owned(child) => self.stop_owned(vm_id, &handle.socket_path, child).await,
                VmProcess::Adopted => {
                    self.stop_adopted(vm_id, &handle.socket_path).await;
                    Ok(())
                }
            };
        }

        match tokio::fs::remove_file(socket_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                if result.is_ok() {
                    result = Err(EngineError::workspace(socket_path, e));
                }
            }
        }
        result
    }

    async fn stop_owned(
        &self,
        vm_id: VmId,
        socket: &Path,
        child: &mut tokio::process::Child,
    ) -> Result<(), EngineError> {
        if !matches!(child.try_wait(), Ok(None)) {
            tracing::debug!(%vm_id, "hypervisor already exited");
            return Ok(());
        }

        match control::send_action(socket, ControlAction::SendCtrlAltDel).await {
            Ok(()) => {
                if let Ok(status) =
                    tokio::time::timeout(self.settings.terminate_timeout, child.wait()).await
                {
                    tracing::info!(%vm_id, status = ?status.ok(), "hypervisor shut down");
                    return Ok(());
                }
                tracing::warn!(%vm_id, "graceful shutdown timed out, killing");
            }
            Err(e) => {
                tracing::debug!(%vm_id, error = %e, "graceful shutdown unavailable, killing");
            }
        }

        child.kill().await?;
        tracing::info!(%vm_id, "hypervisor killed");
        Ok(())
    }

    async fn stop_adopted(&self, vm_id: VmId, socket: &Path) {
        if control::send_action(socket, ControlAction::SendCtrlAltDel).await.is_err() {
            return;
        }
        let deadline = tokio::time::Instant::now() + self.settings.terminate_timeout;
        while tokio::time::Instant::now() < deadline {
            if !control::probe(socket).await {
                tracing::info!(%vm_id, "adopted hypervisor shut down");
                return;
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
        tracing::warn!(%vm_id, "adopted hypervisor still answering after shutdown request");
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
