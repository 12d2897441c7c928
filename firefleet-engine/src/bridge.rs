//! TCP control bridge: exposes a VM's control socket on its allocated port.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::{TcpListener, UnixStream};
use tokio::task::JoinHandle;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause after the `failures`-th consecutive accept error (1-based).
/// Doubles from [`ACCEPT_BACKOFF_MIN`] up to [`ACCEPT_BACKOFF_MAX`].
fn accept_backoff(failures: u32) -> Duration {
    let doublings = failures.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1 << doublings)
        .min(ACCEPT_BACKOFF_MAX)
}

/// A listening forwarder from `local_addr` to one Unix socket.
///
/// Dropping the bridge stops accepting new connections.
#[derive(Debug)]
pub struct ControlBridge {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ControlBridge {
    /// Bind `addr` and start forwarding every accepted connection to
    /// `socket_path`.
    ///
    /// # Errors
    /// Returns the bind error.
    pub async fn bind(addr: SocketAddr, socket_path: PathBuf) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::debug!(%local_addr, socket = %socket_path.display(), "control bridge listening");

        let task = tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                let (mut tcp, peer) = match listener.accept().await {
                    Ok(conn) => {
                        failures = 0;
                        conn
                    }
                    Err(e) => {
                        // Errors such as EMFILE persist until something closes.
                        failures = failures.saturating_add(1);
                        let pause = accept_backoff(failures);
                        tracing::warn!(%local_addr, error = %e, ?pause, "control bridge accept failed");
                        tokio::time::sleep(pause).await;
                        continue;
                    }
                };
                let socket_path = socket_path.clone();
                tokio::spawn(async move {
                    let mut unix = match UnixStream::connect(&socket_path).await {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::debug!(%peer, socket = %socket_path.display(), error = %e, "bridge target unreachable");
                            return;
                        }
                    };
                    if let Err(e) = tokio::io::copy_bidirectional(&mut tcp, &mut unix).await {
                        tracing::debug!(%peer, error = %e, "bridge connection ended");
                    }
                });
            }
        });

        Ok(Self { local_addr, task })
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for ControlBridge {
    fn drop(&mut self) {
        self.task.abort();
    }
}
