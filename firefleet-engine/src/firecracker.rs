//! Firecracker VMM backend implementation.
//!
//! Firecracker is started with `--config-file`, so the whole machine
//! (kernel, root drive, tap-backed NIC, sizing, metrics sink) is described
//! by one JSON document and the guest boots without any API calls.
//!
//! # API Reference
//! Firecracker API spec: `firecracker/src/api_server/swagger/firecracker.yaml`

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::backend::{LaunchSpec, VmmBackend};
use crate::EngineError;

/// Contents of `vm_config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirecrackerConfig {
    #[serde(rename = "boot-source")]
    pub boot_source: BootSource,
    pub drives: Vec<Drive>,
    #[serde(rename = "network-interfaces")]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(rename = "machine-config")]
    pub machine_config: MachineConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSource {
    pub kernel_image_path: PathBuf,
    pub boot_args: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub metrics_path: PathBuf,
}

/// Inputs for [`FirecrackerConfig::for_vm`].
#[derive(Debug, Clone, Copy)]
pub struct MachineSpec<'a> {
    pub kernel_image: &'a Path,
    pub disk_image: &'a Path,
    pub tap_name: &'a str,
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub boot_args: &'a str,
    pub metrics_path: Option<&'a Path>,
}

impl FirecrackerConfig {
    /// Single-NIC, single-drive machine booting from `disk_image`.
    #[must_use]
    pub fn for_vm(spec: &MachineSpec<'_>) -> Self {
        Self {
            boot_source: BootSource {
                kernel_image_path: spec.kernel_image.to_owned(),
                boot_args: spec.boot_args.to_owned(),
            },
            drives: vec![Drive {
                drive_id: "rootfs".to_owned(),
                path_on_host: spec.disk_image.to_owned(),
                is_root_device: true,
                is_read_only: false,
            }],
            network_interfaces: vec![NetworkInterface {
                iface_id: "eth0".to_owned(),
                host_dev_name: spec.tap_name.to_owned(),
            }],
            machine_config: MachineConfig {
                vcpu_count: spec.vcpu_count,
                mem_size_mib: spec.mem_size_mib,
            },
            metrics: spec.metrics_path.map(|path| Metrics { metrics_path: path.to_owned() }),
        }
    }
}

/// Firecracker VMM backend.
#[derive(Debug, Clone)]
pub struct FirecrackerBackend {
    /// Path to the `firecracker` binary.
    binary_path: PathBuf,
}

impl FirecrackerBackend {
    #[must_use]
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }
}

#[async_trait]
impl VmmBackend for FirecrackerBackend {
    fn command(&self, spec: &LaunchSpec) -> Command {
        let mut command = Command::new(&self.binary_path);
        command
            .arg("--api-sock")
            .arg(&spec.socket_path)
            .arg("--config-file")
            .arg(&spec.config_path);
        command
    }

    async fn health_check(&self) -> Result<(), EngineError> {
        if !Path::new("/dev/kvm").exists() {
            return Err(EngineError::KvmUnavailable {
                reason: "/dev/kvm not found".to_owned(),
            });
        }

        tokio::fs::metadata("/dev/kvm").await.map_err(|_| EngineError::KvmUnavailable {
            reason: "cannot access /dev/kvm (permission denied?)".to_owned(),
        })?;

        which_binary(&self.binary_path)?;

        Ok(())
    }
}

/// Verify a binary exists either at the given path or in PATH.
fn which_binary(path: &Path) -> Result<(), EngineError> {
    if path.is_absolute() {
        if path.exists() {
            return Ok(());
        }
        return Err(EngineError::BinaryNotFound { path: path.to_owned() });
    }

    let found = std::env::var("PATH")
        .unwrap_or_default()
        .split(':')
        .map(|dir| Path::new(dir).join(path))
        .any(|p| p.exists());

    if found {
        Ok(())
    } else {
        Err(EngineError::BinaryNotFound { path: path.to_owned() })
    }
}
