//! VM handle: the supervisor's view of one running hypervisor.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use firefleet_core::VmId;

use crate::bridge::ControlBridge;

/// Lines of hypervisor stderr reported in diagnostics.
pub const LOG_TAIL_LINES: usize = 64;

/// How the supervisor is attached to the hypervisor.
#[derive(Debug)]
pub enum VmProcess {
    /// Spawned by this supervisor.
    Owned(tokio::process::Child),
    /// Found running at startup; supervised through its socket only.
    Adopted,
}

/// A handle to a supervised Firecracker microVM.
///
/// Dropping a handle leaves the hypervisor running so a restarted service
/// can adopt it. Call
/// [`ProcessSupervisor::terminate`](crate::ProcessSupervisor::terminate)
/// to stop it.
#[derive(Debug)]
#[non_exhaustive]
pub struct VmHandle {
    pub vm_id: VmId,

    /// Path to the Firecracker API Unix socket.
    pub socket_path: PathBuf,

    pub process: VmProcess,

    /// Stderr log of an owned process.
    pub log: LogTail,

    /// TCP exposure of the control socket, once bound.
    pub bridge: Option<ControlBridge>,

    pub started_at: DateTime<Utc>,
}

impl VmHandle {
    #[must_use]
    pub fn owned(vm_id: VmId, socket_path: PathBuf, child: tokio::process::Child, log: LogTail) -> Self {
        Self {
            vm_id,
            socket_path,
            process: VmProcess::Owned(child),
            log,
            bridge: None,
            started_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn adopted(vm_id: VmId, socket_path: PathBuf) -> Self {
        Self {
            vm_id,
            socket_path,
            process: VmProcess::Adopted,
            log: LogTail::empty(),
            bridge: None,
            started_at: Utc::now(),
        }
    }

    /// OS process id of an owned, not yet reaped hypervisor.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        match &self.process {
            VmProcess::Owned(child) => child.id(),
            VmProcess::Adopted => None,
        }
    }
}

/// Reads the end of a hypervisor's stderr log file.
///
/// The hypervisor writes to the file directly; the log outlives this
/// process.
#[derive(Debug, Clone, Default)]
pub struct LogTail {
    path: Option<PathBuf>,
}

impl LogTail {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn at(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    /// The last [`LOG_TAIL_LINES`] lines, joined with newlines. A missing or
    /// unreadable log reads as empty.
    pub async fn text(&self) -> String {
        let Some(path) = &self.path else {
            return String::new();
        };
        match tokio::fs::read(path).await {
            Ok(raw) => last_lines(&String::from_utf8_lossy(&raw), LOG_TAIL_LINES),
            Err(_) => String::new(),
        }
    }
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(count)..].join("\n")
}
