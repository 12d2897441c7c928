//! Resource allocator: collision-free id, port, tap name and socket path.
//!
//! Candidates come from scanning the registry's maxima; the registry's
//! atomic insert is what actually arbitrates. A caller that loses the race
//! gets `DuplicateKey` back from the insert and scans again.

use std::path::PathBuf;
use std::sync::Arc;

use firefleet_core::{VmId, VmRecord, VmState};

use crate::registry::{Maxima, VmRegistry};
use crate::{EngineConfig, EngineError};

/// Values reserved for one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: VmId,
    pub port: u16,
    pub tap_index: u32,
    pub tap_name: String,
    pub socket_path: PathBuf,
}

/// Hands out reservations backed by registry inserts.
pub struct ResourceAllocator {
    registry: Arc<dyn VmRegistry>,
    socket_dir: PathBuf,
    socket_prefix: String,
    tap_prefix: String,
    start_port: u16,
    start_tap: u32,
    attempts: u32,
}

impl ResourceAllocator {
    #[must_use]
    pub fn new(registry: Arc<dyn VmRegistry>, config: &EngineConfig) -> Self {
        Self {
            registry,
            socket_dir: config.socket_dir.clone(),
            socket_prefix: config.socket_prefix.clone(),
            tap_prefix: config.tap_prefix.clone(),
            start_port: config.start_port,
            start_tap: config.start_tap,
            attempts: config.allocation_attempts.max(1),
        }
    }

    /// Control socket path for `id`.
    #[must_use]
    pub fn socket_path(&self, id: VmId) -> PathBuf {
        self.socket_dir
            .join(format!("{}_{}.sock", self.socket_prefix, id.get()))
    }

    /// Tap device name for `index`.
    #[must_use]
    pub fn tap_name(&self, index: u32) -> String {
        format!("{}{index}", self.tap_prefix)
    }

    /// Reserve the next id, port and tap, and insert the record produced by
    /// `build` in state `Allocated`. Errors from `build` abort allocation.
    ///
    /// A stale socket file at the reserved path is removed once the insert
    /// has succeeded.
    ///
    /// # Errors
    /// - [`EngineError::AllocationConflict`] after the configured number of
    ///   lost races.
    /// - [`EngineError::Exhausted`] if a sequence has no values left.
    /// - [`EngineError::Workspace`] if a stale socket cannot be removed; the
    ///   inserted record is deleted first.
    pub fn allocate(
        &self,
        build: impl Fn(&Reservation) -> Result<VmRecord, EngineError>,
    ) -> Result<(Reservation, VmRecord), EngineError> {
        for attempt in 1..=self.attempts {
            let reservation = self.next_candidate(self.registry.maxima()?)?;
            let mut record = build(&reservation)?;
            record.state = VmState::Allocated;

            match self.registry.insert(&record, reservation.tap_index) {
                Ok(()) => {
                    self.clear_stale_socket(&reservation)?;
                    tracing::debug!(
                        vm_id = %reservation.id,
                        port = reservation.port,
                        tap = %reservation.tap_name,
                        attempt,
                        "resources reserved"
                    );
                    return Ok((reservation, record));
                }
                Err(EngineError::DuplicateKey(key)) => {
                    tracing::debug!(attempt, %key, "allocation lost a race, rescanning");
                }
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(attempts = self.attempts, "allocation conflict persisted");
        Err(EngineError::AllocationConflict { attempts: self.attempts })
    }

    fn next_candidate(&self, maxima: Maxima) -> Result<Reservation, EngineError> {
        let id = match maxima.id {
            Some(max) => max.checked_add(1).ok_or(EngineError::Exhausted { resource: "vm id" })?,
            None => 1,
        };

        let port = match maxima.port {
            Some(max) => max.saturating_add(1).max(i64::from(self.start_port)),
            None => i64::from(self.start_port),
        };
        let port = u16::try_from(port).map_err(|_| EngineError::Exhausted { resource: "port" })?;

        let tap_index = match maxima.tap_index {
            Some(max) => max.saturating_add(1).max(i64::from(self.start_tap)),
            None => i64::from(self.start_tap),
        };
        let tap_index =
            u32::try_from(tap_index).map_err(|_| EngineError::Exhausted { resource: "tap" })?;

        let id = VmId::new(id);
        Ok(Reservation {
            id,
            port,
            tap_index,
            tap_name: self.tap_name(tap_index),
            socket_path: self.socket_path(id),
        })
    }

    fn clear_stale_socket(&self, reservation: &Reservation) -> Result<(), EngineError> {
        match std::fs::remove_file(&reservation.socket_path) {
            Ok(()) => {
                tracing::info!(
                    vm_id = %reservation.id,
                    socket = %reservation.socket_path.display(),
                    "removed stale control socket"
                );
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                if let Err(undo) = self.registry.delete(reservation.id) {
                    tracing::error!(vm_id = %reservation.id, error = %undo, "failed to drop reservation");
                }
                Err(EngineError::workspace(&reservation.socket_path, e))
            }
        }
    }
}

impl std::fmt::Debug for ResourceAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceAllocator")
            .field("socket_dir", &self.socket_dir)
            .field("start_port", &self.start_port)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}
