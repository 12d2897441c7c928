//! Core types for the firefleet microVM provisioning engine.
//!
//! Defines the VM record held by the lifecycle registry, its state machine,
//! the resource template and the creation request accepted from callers.

#![warn(clippy::pedantic)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod id;
pub mod record;
pub mod request;
pub mod state;
pub mod template;

pub use error::CoreError;
pub use id::{OwnerId, VmId};
pub use record::{VmNetwork, VmPaths, VmRecord, VmResources};
pub use request::CreateVmRequest;
pub use state::VmState;
pub use template::{StorageSize, VmTemplate, MAX_VCPUS};
