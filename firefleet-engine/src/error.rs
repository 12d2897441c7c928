//! Error types for the engine crate.

use std::path::PathBuf;

use firefleet_core::{CoreError, VmId, VmState};

use crate::collaborator::ScriptFailure;

/// Errors that can occur while allocating, provisioning or supervising VMs.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The creation request failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] CoreError),

    /// Every allocation attempt lost its race against a concurrent writer.
    #[error("allocation conflict persisted after {attempts} attempts")]
    AllocationConflict { attempts: u32 },

    /// A sequence ran past the largest value it can represent.
    #[error("no {resource} left to allocate")]
    Exhausted { resource: &'static str },

    /// The registry rejected an insert that collides with a live record.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Creating, copying or removing per-VM files failed.
    #[error("workspace error at {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A network, storage or cleanup collaborator reported failure.
    #[error(transparent)]
    ExternalScript(#[from] ScriptFailure),

    /// The hypervisor could not be spawned or exited during the grace period.
    #[error("hypervisor launch failed for VM {vm_id}: {diagnostic}")]
    LaunchFailure { vm_id: VmId, diagnostic: String },

    /// The control socket could not be reached.
    #[error("control socket {} unreachable: {reason}", socket.display())]
    ControlUnreachable { socket: PathBuf, reason: String },

    /// The hypervisor answered a control request with a non-2xx status.
    #[error("control request rejected with HTTP {status}: {body}")]
    ControlRejected { status: u16, body: String },

    /// No record exists for the id.
    #[error("VM not found: {0}")]
    NotFound(VmId),

    /// The record is not in a state that permits the requested step.
    #[error("VM {vm_id} cannot move from {from} to {to}")]
    InvalidTransition { vm_id: VmId, from: VmState, to: VmState },

    /// The registry's backing store failed.
    #[error("registry error: {0}")]
    Registry(#[from] rusqlite::Error),

    /// A stored row could not be decoded into a record.
    #[error("corrupt registry row {id}: {reason}")]
    CorruptRecord { id: i64, reason: String },

    /// A configuration value could not be parsed.
    #[error("invalid configuration {key}: {reason}")]
    Config { key: &'static str, reason: String },

    /// Firecracker binary not found at the configured path.
    #[error("firecracker binary not found at {path}")]
    BinaryNotFound { path: PathBuf },

    /// KVM device is not available or not accessible.
    #[error("KVM not available: {reason}")]
    KvmUnavailable { reason: String },

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether the caller may simply retry the same operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::AllocationConflict { .. } | EngineError::DuplicateKey(_)
        )
    }

    pub(crate) fn workspace(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Workspace { path: path.into(), source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_allocation_races_are_retryable() {
        assert!(EngineError::AllocationConflict { attempts: 3 }.is_retryable());
        assert!(EngineError::DuplicateKey("port".to_owned()).is_retryable());
        assert!(!EngineError::NotFound(VmId::new(1)).is_retryable());
        assert!(!EngineError::LaunchFailure {
            vm_id: VmId::new(1),
            diagnostic: "exit 1".to_owned()
        }
        .is_retryable());
    }

    #[test]
    fn launch_failure_display_carries_diagnostic() {
        let err = EngineError::LaunchFailure {
            vm_id: VmId::new(9),
            diagnostic: "Error: kernel not found".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("VM 9"), "{msg}");
        assert!(msg.contains("kernel not found"), "{msg}");
    }
}
