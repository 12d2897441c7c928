//! VMM backend abstraction trait.
//!
//! A backend knows how to turn a prepared config file into a hypervisor
//! command line and how to check that the host can run it. Process
//! ownership stays with the supervisor.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

use crate::EngineError;

/// Files a hypervisor is launched against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Generated hypervisor config.
    pub config_path: PathBuf,
    /// Control socket the hypervisor must create.
    pub socket_path: PathBuf,
    /// File receiving the serial console.
    pub console_log: PathBuf,
    /// File receiving the hypervisor's own stderr.
    pub log_path: PathBuf,
}

/// Virtual Machine Manager abstraction.
///
/// Implementations must be `Send + Sync` to allow use across async tasks.
#[async_trait]
pub trait VmmBackend: Send + Sync {
    /// Build the command that starts one hypervisor for `spec`.
    ///
    /// The supervisor sets stdio and spawns it.
    fn command(&self, spec: &LaunchSpec) -> Command;

    /// Check if the backend is available and properly configured.
    ///
    /// # Errors
    /// Returns [`EngineError::BinaryNotFound`] or [`EngineError::KvmUnavailable`]
    /// if the environment is not ready.
    async fn health_check(&self) -> Result<(), EngineError>;
}
