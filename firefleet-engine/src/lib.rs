//! Firecracker microVM allocation, provisioning and supervision.
//!
//! [`VmOrchestrator`] is the entry point: it reserves ids, ports and tap
//! devices through the [`registry`], lays out per-VM workspaces, drives the
//! network and storage [`collaborator`]s, launches hypervisors under the
//! [`supervisor`] and rolls everything back when a step fails.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod allocator;
pub mod backend;
pub mod bridge;
pub mod collaborator;
pub mod config;
pub mod control;
pub mod error;
pub mod firecracker;
pub mod handle;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod supervisor;
pub mod workspace;

mod unix_client;

pub use allocator::{Reservation, ResourceAllocator};
pub use backend::{LaunchSpec, VmmBackend};
pub use collaborator::{
    Cleanup, Collaborators, NetworkSetup, RootfsRequest, ScriptFailure, ScriptRunner,
    StorageSetup, TapRequest,
};
pub use config::EngineConfig;
pub use control::ControlAction;
pub use error::EngineError;
pub use firecracker::{FirecrackerBackend, FirecrackerConfig};
pub use handle::VmHandle;
pub use orchestrator::{DeleteReport, ReconcileReport, VmOrchestrator};
pub use pipeline::Created;
pub use registry::{SqliteRegistry, VmRegistry};
pub use supervisor::{ProcessSupervisor, SupervisorSettings};
pub use workspace::{VmLayout, WorkspaceManager};
