//! Minimal HTTP client over a Unix domain socket.
//!
//! Firecracker exposes its management API via a Unix socket, not TCP.
//! Standard HTTP clients (reqwest) don't support Unix sockets, so we
//! build a thin wrapper using hyper + tokio's `UnixStream`.

use std::path::Path;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, Response, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

use crate::EngineError;

/// Send an HTTP request to a Firecracker API socket.
///
/// The `uri_path` should be the path component only (e.g. `/actions`).
/// The host header is set to `localhost` as required by Firecracker.
///
/// # Errors
/// - [`EngineError::ControlUnreachable`] if the socket cannot be connected
///   to or the exchange breaks off.
/// - [`EngineError::ControlRejected`] if Firecracker answers non-2xx.
pub(crate) async fn api_request(
    socket_path: &Path,
    method: Method,
    uri_path: &str,
    body: Option<String>,
) -> Result<String, EngineError> {
    let unreachable = |reason: String| EngineError::ControlUnreachable {
        socket: socket_path.to_owned(),
        reason,
    };

    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| unreachable(format!("connect: {e}")))?;

    let io = TokioIo::new(stream);

    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| unreachable(format!("HTTP handshake: {e}")))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!("Firecracker connection closed: {e}");
        }
    });

    let body_bytes = body.map(Bytes::from).unwrap_or_default();
    let content_len = body_bytes.len();

    let uri: Uri = uri_path
        .parse()
        .map_err(|e| unreachable(format!("invalid URI path {uri_path}: {e}")))?;

    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Host", "localhost");

    if content_len > 0 {
        builder = builder.header("Content-Type", "application/json");
        builder = builder.header("Content-Length", content_len.to_string());
    }

    let req = builder
        .body(Full::new(body_bytes))
        .map_err(|e| unreachable(format!("build request: {e}")))?;

    let resp: Response<_> = sender
        .send_request(req)
        .await
        .map_err(|e| unreachable(format!("send request: {e}")))?;

    let status = resp.status();
    let body_bytes = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| unreachable(format!("read response body: {e}")))?
        .to_bytes();

    let body_str = String::from_utf8_lossy(&body_bytes).into_owned();

    if !status.is_success() {
        return Err(EngineError::ControlRejected {
            status: status.as_u16(),
            body: body_str,
        });
    }

    Ok(body_str)
}
