//! Hypervisor actions sent over the control socket.

use std::fmt;
use std::path::Path;

use hyper::Method;
use serde::Serialize;

use crate::unix_client::api_request;
use crate::EngineError;

/// Body of `PUT /actions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub enum ControlAction {
    /// Boot a configured but not yet started guest.
    InstanceStart,
    /// Write pending metrics to the configured metrics sink.
    FlushMetrics,
    /// Ask the guest to shut down (x86 keyboard reset).
    SendCtrlAltDel,
}

impl ControlAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ControlAction::InstanceStart => "InstanceStart",
            ControlAction::FlushMetrics => "FlushMetrics",
            ControlAction::SendCtrlAltDel => "SendCtrlAltDel",
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize)]
struct ActionBody {
    action_type: ControlAction,
}

/// Issue `action` against the socket at `socket_path`.
///
/// # Errors
/// Returns [`EngineError::ControlUnreachable`] or
/// [`EngineError::ControlRejected`].
pub async fn send_action(socket_path: &Path, action: ControlAction) -> Result<(), EngineError> {
    let body = serde_json::to_string(&ActionBody { action_type: action }).map_err(|e| {
        EngineError::ControlUnreachable {
            socket: socket_path.to_owned(),
            reason: format!("encode {action}: {e}"),
        }
    })?;
    api_request(socket_path, Method::PUT, "/actions", Some(body)).await?;
    tracing::debug!(socket = %socket_path.display(), %action, "control action accepted");
    Ok(())
}

/// Whether a hypervisor answers on `socket_path`. Any HTTP answer counts,
/// including an error status.
pub async fn probe(socket_path: &Path) -> bool {
    match api_request(socket_path, Method::GET, "/", None).await {
        Ok(_) | Err(EngineError::ControlRejected { .. }) => true,
        Err(e) => {
            tracing::debug!(socket = %socket_path.display(), error = %e, "control socket probe failed");
            false
        }
    }
}
