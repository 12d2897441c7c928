use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{OwnerId, VmId};
use crate::state::VmState;
use crate::template::StorageSize;

/// Durable record of a single microVM, as stored by the lifecycle registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    /// Allocator-issued identifier.
    pub id: VmId,
    /// User the VM belongs to.
    pub owner_id: OwnerId,
    /// Caller-supplied label; not unique.
    pub identifier: i64,
    /// Sizing copied from the template at creation.
    pub resources: VmResources,
    /// Guest addressing plus the host-side tap and control port.
    pub network: VmNetwork,
    /// Per-VM filesystem locations.
    pub paths: VmPaths,
    /// Current lifecycle state.
    pub state: VmState,
    /// When the record was first inserted.
    pub created_at: DateTime<Utc>,
    /// When the state last changed.
    pub updated_at: DateTime<Utc>,
}

/// Immutable sizing of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmResources {
    pub cpu: u32,
    pub ram_mib: u32,
    pub storage: StorageSize,
}

/// Network identity of a VM.
///
/// `vm_iface` and `port` are globally unique among live records; the guest
/// addressing fields are caller-owned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmNetwork {
    /// Guest address, optionally with prefix length (`192.168.5.8/24`).
    pub ip_addr: String,
    pub hostname: String,
    pub gateway: String,
    /// Host tap device, e.g. `tap3`.
    pub vm_iface: String,
    /// Host port the control socket is exposed on.
    pub port: u16,
}

/// Filesystem locations owned by a VM. Every path embeds the VM id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmPaths {
    /// Staged kernel image inside `vm_dir`.
    pub kernel_image: PathBuf,
    /// Staged root filesystem image inside `vm_dir`.
    pub rootfs_image: PathBuf,
    /// Per-VM working directory.
    pub vm_dir: PathBuf,
    /// Generated hypervisor configuration file.
    pub config_path: PathBuf,
    /// Hypervisor control socket.
    pub socket_path: PathBuf,
}
