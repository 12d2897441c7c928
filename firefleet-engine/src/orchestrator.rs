//! High-level VM orchestrator.
//!
//! Owns the registry, allocator, workspace manager, supervisor and
//! collaborators, and exposes the engine's entry points. Creation lives in
//! [`crate::pipeline`]; deletion, stats, the liveness sweep and startup
//! reconciliation live here.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use firefleet_core::{OwnerId, VmId, VmRecord, VmState};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::allocator::ResourceAllocator;
use crate::backend::VmmBackend;
use crate::collaborator::{Collaborators, ScriptRunner};
use crate::control::{self, ControlAction};
use crate::firecracker::FirecrackerBackend;
use crate::registry::{SqliteRegistry, VmRegistry};
use crate::supervisor::{ProcessSupervisor, SupervisorSettings};
use crate::workspace::WorkspaceManager;
use crate::{EngineConfig, EngineError};

/// Outcome of a successful deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub vm_id: VmId,
    /// Collaborator and cleanup errors met during teardown.
    pub warnings: Vec<String>,
}

/// What startup reconciliation did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Running records whose hypervisor still answers.
    pub adopted: Vec<VmId>,
    /// Running records whose hypervisor is gone.
    pub failed: Vec<VmId>,
    /// Records caught mid-creation or mid-deletion.
    pub rolled_back: Vec<VmId>,
    pub stale_sockets_removed: usize,
    pub stale_workspaces_removed: usize,
}

/// High-level orchestrator for VM lifecycle management.
///
/// All operations are safe to call concurrently.
pub struct VmOrchestrator {
    pub(crate) config: EngineConfig,
    pub(crate) registry: Arc<dyn VmRegistry>,
    pub(crate) allocator: ResourceAllocator,
    pub(crate) workspace: WorkspaceManager,
    pub(crate) supervisor: ProcessSupervisor,
    pub(crate) collaborators: Collaborators,
}

impl VmOrchestrator {
    #[must_use]
    pub fn new(
        config: EngineConfig,
        registry: Arc<dyn VmRegistry>,
        backend: Arc<dyn VmmBackend>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            allocator: ResourceAllocator::new(Arc::clone(&registry), &config),
            workspace: WorkspaceManager::new(config.base_dir.clone()),
            supervisor: ProcessSupervisor::new(backend, SupervisorSettings::from(&config)),
            registry,
            collaborators,
            config,
        }
    }

    /// Production wiring: SQLite registry at `database_path`, the
    /// Firecracker backend and the script collaborators.
    ///
    /// # Errors
    /// Returns an error if the registry cannot be opened.
    pub fn from_config(config: EngineConfig) -> Result<Self, EngineError> {
        let registry = Arc::new(SqliteRegistry::open(&config.database_path)?);
        let backend = Arc::new(FirecrackerBackend::new(config.firecracker_binary.clone()));
        let collaborators =
            Collaborators::scripts(ScriptRunner::new(config.script_dir.clone(), config.use_sudo));
        Ok(Self::new(config, registry, backend, collaborators))
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Check that the hypervisor can run on this host.
    ///
    /// # Errors
    /// Propagates [`VmmBackend::health_check`].
    pub async fn health_check(&self) -> Result<(), EngineError> {
        self.supervisor.backend().health_check().await
    }

    /// One record.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] if no such record exists.
    pub fn get(&self, vm_id: VmId) -> Result<VmRecord, EngineError> {
        self.registry.get(vm_id)?.ok_or(EngineError::NotFound(vm_id))
    }

    /// Every record, or those of `owner`, ordered by id.
    ///
    /// # Errors
    /// Returns [`EngineError::Registry`] on store failure.
    pub fn list(&self, owner: Option<OwnerId>) -> Result<Vec<VmRecord>, EngineError> {
        self.registry.list(owner)
    }

    /// Tear a VM down and remove its record.
    ///
    /// Deletion is irreversible: once started, the record is removed even if
    /// a teardown step fails. Such failures come back as warnings.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] if there is no record, including
    /// when a concurrent delete got there first.
    pub async fn delete(&self, vm_id: VmId) -> Result<DeleteReport, EngineError> {
        let record = self.get(vm_id)?;
        tracing::info!(%vm_id, state = %record.state, "deleting VM");

        match self.registry.update_state(vm_id, &VmState::ALL, VmState::Deleting) {
            Ok(_) => {}
            Err(EngineError::InvalidTransition { from, .. }) => {
                tracing::warn!(%vm_id, %from, "deleting from a state without a delete edge");
            }
            Err(e) => return Err(e),
        }

        let warnings = self.teardown(&record, true).await;
        self.finish(vm_id, VmState::Deleting)?;

        if warnings.is_empty() {
            tracing::info!(%vm_id, "VM deleted");
        } else {
            tracing::warn!(%vm_id, warnings = warnings.len(), "VM deleted with warnings");
        }
        Ok(DeleteReport { vm_id, warnings })
    }

    /// Ask a running hypervisor to flush its metrics.
    ///
    /// A Running record whose hypervisor has died is reclaimed on the spot.
    ///
    /// # Errors
    /// - [`EngineError::NotFound`] if there is no record.
    /// - [`EngineError::ControlUnreachable`] if the hypervisor is not alive or
    ///   its socket does not answer.
    /// - [`EngineError::ControlRejected`] if the hypervisor refuses.
    pub async fn flush_stats(&self, vm_id: VmId) -> Result<(), EngineError> {
        let record = self.get(vm_id)?;

        if record.state == VmState::Running && !self.supervisor.check_alive(vm_id).await {
            let diagnostic = self.supervisor.exit_diagnostic(vm_id).await;
            self.reclaim(&record).await;
            return Err(EngineError::ControlUnreachable {
                socket: record.paths.socket_path,
                reason: format!("hypervisor is no longer running ({diagnostic}); VM reclaimed"),
            });
        }

        self.supervisor
            .send_control(vm_id, ControlAction::FlushMetrics)
            .await?;
        tracing::debug!(%vm_id, "metrics flushed");
        Ok(())
    }

    /// Reclaim every Running VM whose hypervisor has exited. Returns the
    /// reclaimed ids.
    ///
    /// # Errors
    /// Returns [`EngineError::Registry`] if records cannot be listed.
    pub async fn sweep(&self) -> Result<Vec<VmId>, EngineError> {
        let mut reclaimed = Vec::new();
        for record in self.registry.list(None)? {
            if record.state != VmState::Running || self.supervisor.check_alive(record.id).await {
                continue;
            }
            let diagnostic = self.supervisor.exit_diagnostic(record.id).await;
            tracing::warn!(vm_id = %record.id, %diagnostic, "hypervisor exited unexpectedly");
            self.reclaim(&record).await;
            reclaimed.push(record.id);
        }
        Ok(reclaimed)
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval`, if configured.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let period = self.config.sweep_interval?;
        let engine = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match engine.sweep().await {
                    Ok(reclaimed) if !reclaimed.is_empty() => {
                        tracing::info!(count = reclaimed.len(), "sweep reclaimed dead VMs");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "liveness sweep failed"),
                }
            }
        }))
    }

    /// Bring the registry, the filesystem and the supervisor back in line
    /// after a restart. Call before serving requests.
    ///
    /// # Errors
    /// Returns [`EngineError::Registry`] if records cannot be listed, or
    /// [`EngineError::Workspace`] if the base directory cannot be scanned.
    pub async fn reconcile(&self) -> Result<ReconcileReport, EngineError> {
        let mut report = ReconcileReport::default();

        for record in self.registry.list(None)? {
            let vm_id = record.id;
            if record.state != VmState::Running {
                tracing::info!(%vm_id, state = %record.state, "rolling back interrupted VM");
                let warnings = self.teardown(&record, true).await;
                log_warnings(vm_id, &warnings);
                self.remove_record(vm_id);
                report.rolled_back.push(vm_id);
                continue;
            }

            if self.supervisor.is_tracked(vm_id).await {
                continue;
            }
            if control::probe(&record.paths.socket_path).await {
                self.supervisor.adopt(vm_id, record.paths.socket_path.clone()).await;
                self.supervisor.expose(vm_id, record.network.port).await;
                report.adopted.push(vm_id);
            } else {
                tracing::warn!(%vm_id, "running VM has no live hypervisor");
                self.reclaim(&record).await;
                report.failed.push(vm_id);
            }
        }

        let live: BTreeSet<VmId> = self.registry.list(None)?.iter().map(|r| r.id).collect();
        report.stale_sockets_removed = self.remove_stale_sockets(&live).await;

        for entry in self.workspace.list_vm_dirs().await? {
            if live.contains(&entry.vm_id) {
                continue;
            }
            match self.workspace.destroy(&entry.path).await {
                Ok(()) => report.stale_workspaces_removed += 1,
                Err(e) => tracing::warn!(path = %entry.path.display(), error = %e, "cannot remove stale workspace"),
            }
        }

        tracing::info!(
            adopted = report.adopted.len(),
            failed = report.failed.len(),
            rolled_back = report.rolled_back.len(),
            stale_sockets = report.stale_sockets_removed,
            stale_workspaces = report.stale_workspaces_removed,
            "reconciliation complete"
        );
        Ok(report)
    }

    /// Undo every side effect a VM may have on the host. Never stops early;
    /// each failure becomes a warning.
    pub(crate) async fn teardown(&self, record: &VmRecord, detach_tap: bool) -> Vec<String> {
        let vm_id = record.id;
        let socket = &record.paths.socket_path;
        let mut warnings = Vec::new();

        if let Err(e) = self.supervisor.terminate(vm_id, socket).await {
            warnings.push(format!("terminate: {e}"));
        }
        if let Err(e) = self.collaborators.cleanup.release(socket).await {
            warnings.push(e.to_string());
        }
        if detach_tap {
            if let Err(e) = self.collaborators.network.detach_tap(&record.network.vm_iface).await {
                warnings.push(e.to_string());
            }
        }
        if let Err(e) = self.workspace.destroy(&record.paths.vm_dir).await {
            warnings.push(e.to_string());
        }
        match tokio::fs::remove_file(socket).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warnings.push(format!("remove socket {}: {e}", socket.display())),
        }

        for warning in &warnings {
            tracing::warn!(%vm_id, %warning, "teardown step failed");
        }
        warnings
    }

    /// Fail, tear down and forget a VM whose hypervisor is gone.
    async fn reclaim(&self, record: &VmRecord) {
        let vm_id = record.id;
        if let Err(e) = self
            .registry
            .update_state(vm_id, &[VmState::Running], VmState::Failed)
        {
            tracing::warn!(%vm_id, error = %e, "cannot mark VM failed");
        }
        self.teardown(record, true).await;
        self.remove_record(vm_id);
        tracing::info!(%vm_id, "dead VM reclaimed");
    }

    /// Step a torn-down record to Deleted and remove it.
    pub(crate) fn finish(&self, vm_id: VmId, from: VmState) -> Result<(), EngineError> {
        if let Err(e) = self.registry.update_state(vm_id, &[from], VmState::Deleted) {
            tracing::debug!(%vm_id, error = %e, "record not stepped to deleted");
        }
        if !self.registry.delete(vm_id)? {
            return Err(EngineError::NotFound(vm_id));
        }
        Ok(())
    }

    /// Best-effort record removal for cleanup paths that must not fail.
    pub(crate) fn remove_record(&self, vm_id: VmId) {
        if let Err(e) = self.registry.delete(vm_id) {
            tracing::error!(%vm_id, error = %e, "cannot remove record");
        }
    }

    async fn remove_stale_sockets(&self, live: &BTreeSet<VmId>) -> usize {
        let dir = &self.config.socket_dir;
        let prefix = format!("{}_", self.config.socket_prefix);
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(dir = %dir.display(), error = %e, "cannot scan socket directory");
                }
                return 0;
            }
        };

        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| n.strip_prefix(&prefix))
                .and_then(|n| n.strip_suffix(".sock"))
                .and_then(|n| n.parse::<i64>().ok())
            else {
                continue;
            };
            if live.contains(&VmId::new(id)) {
                continue;
            }
            let path: PathBuf = entry.path();
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(socket = %path.display(), error = %e, "cannot remove stale socket"),
            }
        }
        removed
    }
}

fn log_warnings(vm_id: VmId, warnings: &[String]) {
    if !warnings.is_empty() {
        tracing::warn!(%vm_id, count = warnings.len(), "rollback finished with warnings");
    }
}

impl std::fmt::Debug for VmOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmOrchestrator")
            .field("config", &self.config)
            .field("supervisor", &self.supervisor)
            .finish_non_exhaustive()
    }
}
