//! Provisioning pipeline: from a validated request to a Running VM.
//!
//! ```text
//! allocate ─► materialize ─► attach tap ─► prepare rootfs ─► write config
//!    ─► Provisioning ─► launch ─► grace + liveness ─► socket ─► Running
//! ```
//!
//! Any failure after allocation rolls back every side effect and removes
//! the record before the error is returned.

use std::path::PathBuf;

use chrono::Utc;
use firefleet_core::{CreateVmRequest, VmId, VmNetwork, VmPaths, VmRecord, VmResources, VmState};
use serde::Serialize;

use crate::allocator::Reservation;
use crate::backend::LaunchSpec;
use crate::collaborator::{RootfsRequest, TapRequest};
use crate::firecracker::{FirecrackerConfig, MachineSpec};
use crate::orchestrator::VmOrchestrator;
use crate::workspace::VmLayout;
use crate::EngineError;

/// Result of a successful creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Created {
    pub vm_id: VmId,
    pub port: u16,
    pub socket_path: PathBuf,
}

/// Side effects rollback cannot infer on its own. Termination, release and
/// workspace removal are idempotent and always run.
#[derive(Debug, Default)]
struct Progress {
    tap_attached: bool,
}

impl VmOrchestrator {
    /// Provision one VM.
    ///
    /// # Errors
    /// - [`EngineError::InvalidRequest`] before anything is reserved.
    /// - [`EngineError::AllocationConflict`] or [`EngineError::Exhausted`]
    ///   if no reservation could be made.
    /// - [`EngineError::Workspace`], [`EngineError::ExternalScript`],
    ///   [`EngineError::LaunchFailure`], [`EngineError::ControlUnreachable`]
    ///   or [`EngineError::InvalidTransition`] after a full rollback.
    pub async fn create(&self, request: &CreateVmRequest) -> Result<Created, EngineError> {
        request.validate()?;
        let owner = request.owner();
        tracing::info!(
            owner = %owner,
            identifier = request.identifier,
            hostname = %request.hostname,
            state = %VmState::Requested,
            "VM creation requested"
        );

        let (reservation, record) = self.allocator.allocate(|reservation| {
            let layout = self.workspace.layout(owner, reservation.id, &request.template)?;
            Ok(build_record(request, reservation, &layout))
        })?;
        let layout = self
            .workspace
            .layout(owner, reservation.id, &request.template)?;

        let mut progress = Progress::default();
        match self.provision(request, &reservation, &layout, &mut progress).await {
            Ok(()) => {
                tracing::info!(
                    vm_id = %reservation.id,
                    port = reservation.port,
                    tap = %reservation.tap_name,
                    socket = %reservation.socket_path.display(),
                    "VM running"
                );
                Ok(Created {
                    vm_id: reservation.id,
                    port: reservation.port,
                    socket_path: reservation.socket_path,
                })
            }
            Err(e) => {
                tracing::error!(vm_id = %reservation.id, error = %e, "provisioning failed, rolling back");
                self.rollback(&record, &progress).await;
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        request: &CreateVmRequest,
        reservation: &Reservation,
        layout: &VmLayout,
        progress: &mut Progress,
    ) -> Result<(), EngineError> {
        let vm_id = reservation.id;

        self.workspace.materialize(layout, &request.template).await?;

        progress.tap_attached = true;
        self.collaborators
            .network
            .attach_tap(&TapRequest {
                iface: &reservation.tap_name,
                bridge: &self.config.bridge_name,
            })
            .await?;

        self.collaborators
            .storage
            .prepare_rootfs(&RootfsRequest {
                src_image: &layout.rootfs_image,
                dest_image: &layout.disk_image,
                size: &request.template.storage,
                ip_addr: &request.ip_addr,
                gateway: &request.gateway,
                hostname: &request.hostname,
                ssh_key: &request.ssh_key,
            })
            .await?;

        let machine = FirecrackerConfig::for_vm(&MachineSpec {
            kernel_image: &layout.kernel_image,
            disk_image: &layout.disk_image,
            tap_name: &reservation.tap_name,
            vcpu_count: request.template.cpu,
            mem_size_mib: request.template.ram,
            boot_args: &self.config.boot_args,
            metrics_path: Some(&layout.metrics_path),
        });
        self.workspace.write_config(layout, &machine).await?;

        self.registry
            .update_state(vm_id, &[VmState::Allocated], VmState::Provisioning)?;

        if let Some(dir) = reservation.socket_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| EngineError::workspace(dir, e))?;
        }

        self.supervisor
            .launch(
                vm_id,
                &LaunchSpec {
                    config_path: layout.config_path.clone(),
                    socket_path: reservation.socket_path.clone(),
                    console_log: layout.console_log.clone(),
                    log_path: layout.hypervisor_log.clone(),
                },
            )
            .await?;

        tokio::time::sleep(self.config.liveness_grace).await;
        if !self.supervisor.check_alive(vm_id).await {
            return Err(EngineError::LaunchFailure {
                vm_id,
                diagnostic: self.supervisor.exit_diagnostic(vm_id).await,
            });
        }

        if let Err(e) = self.supervisor.wait_for_socket(&reservation.socket_path).await {
            if !self.supervisor.check_alive(vm_id).await {
                return Err(EngineError::LaunchFailure {
                    vm_id,
                    diagnostic: self.supervisor.exit_diagnostic(vm_id).await,
                });
            }
            return Err(e);
        }

        self.registry
            .update_state(vm_id, &[VmState::Provisioning], VmState::Running)?;

        self.supervisor.expose(vm_id, reservation.port).await;
        Ok(())
    }

    /// Reverse a partial creation. Always removes the record.
    async fn rollback(&self, record: &VmRecord, progress: &Progress) {
        let vm_id = record.id;
        if let Err(e) = self.registry.update_state(
            vm_id,
            &[VmState::Allocated, VmState::Provisioning, VmState::Running],
            VmState::Failed,
        ) {
            tracing::debug!(%vm_id, error = %e, "record not marked failed");
        }

        let warnings = self.teardown(record, progress.tap_attached).await;
        self.remove_record(vm_id);

        if warnings.is_empty() {
            tracing::info!(%vm_id, "rollback complete");
        } else {
            tracing::warn!(%vm_id, warnings = warnings.len(), "rollback complete with warnings");
        }
    }
}

fn build_record(request: &CreateVmRequest, reservation: &Reservation, layout: &VmLayout) -> VmRecord {
    let now = Utc::now();
    VmRecord {
        id: reservation.id,
        owner_id: request.owner(),
        identifier: request.identifier,
        resources: VmResources {
            cpu: request.template.cpu,
            ram_mib: request.template.ram,
            storage: request.template.storage.clone(),
        },
        network: VmNetwork {
            ip_addr: request.ip_addr.clone(),
            hostname: request.hostname.clone(),
            gateway: request.gateway.clone(),
            vm_iface: reservation.tap_name.clone(),
            port: reservation.port,
        },
        paths: VmPaths {
            kernel_image: layout.kernel_image.clone(),
            rootfs_image: layout.rootfs_image.clone(),
            vm_dir: layout.vm_dir.clone(),
            config_path: layout.config_path.clone(),
            socket_path: reservation.socket_path.clone(),
        },
        state: VmState::Requested,
        created_at: now,
        updated_at: now,
    }
}
