use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle state of a VM record.
///
/// ```text
/// Requested ─► Allocated ─► Provisioning ─► Running ─► Deleting ─► Deleted
///     │            │             │             │           ▲
///     └────────────┴─────────────┴─────────────┴─► Failed ─┘
/// ```
///
/// `Allocated` and `Provisioning` records may also move straight to
/// `Deleting` when a delete request races an in-flight creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum VmState {
    /// Creation call accepted, nothing reserved yet.
    Requested,
    /// Id, port, tap name and socket path reserved in the registry.
    Allocated,
    /// Network and storage prepared, config written, hypervisor launching.
    Provisioning,
    /// Hypervisor confirmed alive past the liveness grace period.
    Running,
    /// A step errored; rollback is in progress.
    Failed,
    /// Teardown requested.
    Deleting,
    /// Teardown complete; the record is about to disappear.
    Deleted,
}

impl VmState {
    /// All states, in lifecycle order.
    pub const ALL: [VmState; 7] = [
        VmState::Requested,
        VmState::Allocated,
        VmState::Provisioning,
        VmState::Running,
        VmState::Failed,
        VmState::Deleting,
        VmState::Deleted,
    ];

    /// Stable name used for persistence and the HTTP API.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            VmState::Requested => "requested",
            VmState::Allocated => "allocated",
            VmState::Provisioning => "provisioning",
            VmState::Running => "running",
            VmState::Failed => "failed",
            VmState::Deleting => "deleting",
            VmState::Deleted => "deleted",
        }
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    #[must_use]
    pub const fn can_transition_to(self, next: VmState) -> bool {
        use VmState::{Allocated, Deleted, Deleting, Failed, Provisioning, Requested, Running};
        matches!(
            (self, next),
            (Requested, Allocated | Failed)
                | (Allocated, Provisioning | Failed | Deleting)
                | (Provisioning, Running | Failed | Deleting)
                | (Running, Deleting | Failed)
                | (Failed, Deleting | Deleted)
                | (Deleting, Deleting | Deleted)
        )
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VmState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| CoreError::UnknownState(s.to_owned()))
    }
}
