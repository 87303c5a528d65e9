//! Control socket between the CLI and a running daemon
//!
//! One request and one response per connection. Each frame is a big-endian
//! `u32` byte count followed by that many bytes of JSON.

use color_eyre::eyre::{self, Context, Result};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Upper bound on a single frame body
const FRAME_LIMIT: usize = 1 << 20;
/// Deadline for receiving a whole frame
const RECV_DEADLINE: Duration = Duration::from_secs(10);
const CONNECT_DEADLINE: Duration = Duration::from_secs(5);
const PROBE_DEADLINE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    Status,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Status {
        version: String,
        uptime_secs: u64,
        /// Key of the monitor that currently holds focus
        monitor: Option<String>,
        /// Device most recently switched to by the daemon
        device: Option<String>,
        mapped_monitors: usize,
    },
    Ok {
        message: String,
    },
    Error {
        message: String,
    },
}

/// `$XDG_RUNTIME_DIR/mosw.sock`, or `/tmp/mosw-<uid>.sock` without a runtime dir
#[must_use]
pub fn get_socket_path() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|dir| !dir.is_empty())
        .map_or_else(
            || PathBuf::from(format!("/tmp/mosw-{}.sock", users::get_current_uid())),
            |dir| PathBuf::from(dir).join("mosw.sock"),
        )
}

async fn answers(path: &Path, deadline: Duration) -> bool {
    matches!(timeout(deadline, UnixStream::connect(path)).await, Ok(Ok(_)))
}

async fn recv_frame<T, S>(stream: &mut S) -> Result<T>
where
    T: DeserializeOwned,
    S: AsyncRead + Unpin,
{
    let body = timeout(RECV_DEADLINE, async {
        let len = stream.read_u32().await.context("Failed to read frame header")? as usize;
        if len > FRAME_LIMIT {
            eyre::bail!("Frame too large: {len} bytes, limit is {FRAME_LIMIT}");
        }
        let mut body = vec![0u8; len];
        stream
            .read_exact(&mut body)
            .await
            .context("Failed to read frame body")?;
        Ok::<_, eyre::Report>(body)
    })
    .await
    .context("Timed out waiting for frame")??;

    serde_json::from_slice(&body).context("Malformed frame body")
}

async fn send_frame<T, S>(stream: &mut S, value: &T) -> Result<()>
where
    T: Serialize,
    S: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(value).context("Failed to encode frame")?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|&len| len as usize <= FRAME_LIMIT)
        .ok_or_else(|| eyre::eyre!("Frame too large: {} bytes", body.len()))?;

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);

    stream.write_all(&frame).await.context("Failed to send frame")?;
    stream.flush().await.context("Failed to send frame")
}

/// Whether a daemon is accepting connections on the control socket
pub async fn is_daemon_running() -> bool {
    answers(&get_socket_path(), PROBE_DEADLINE).await
}

/// Ask the daemon something and wait for the answer
///
/// # Errors
/// Returns an error if no daemon is listening or the exchange fails.
pub async fn send_request(request: Request) -> Result<Response> {
    let path = get_socket_path();
    let mut stream = timeout(CONNECT_DEADLINE, UnixStream::connect(&path))
        .await
        .with_context(|| format!("Daemon did not accept a connection on {}", path.display()))?
        .with_context(|| format!("No daemon listening on {}", path.display()))?;

    send_frame(&mut stream, &request).await?;
    recv_frame(&mut stream).await
}

/// # Errors
/// Returns an error on timeout, or an oversized or malformed frame.
pub async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Request> {
    recv_frame(stream).await
}

/// # Errors
/// Returns an error if the frame cannot be written.
pub async fn write_response<S: AsyncWrite + Unpin>(stream: &mut S, response: &Response) -> Result<()> {
    send_frame(stream, response).await
}

/// Listening end of the control socket, owned by the daemon
///
/// The socket file is removed when this is dropped.
pub struct ControlSocket {
    path: PathBuf,
    listener: UnixListener,
}

impl ControlSocket {
    /// # Errors
    /// Returns an error if another daemon holds the socket or binding fails.
    pub async fn bind() -> Result<Self> {
        Self::bind_at(get_socket_path()).await
    }

    /// Bind `path`, taking over a leftover socket file nobody answers on
    ///
    /// # Errors
    /// Returns an error if another daemon holds the socket or binding fails.
    pub async fn bind_at(path: PathBuf) -> Result<Self> {
        if path.exists() {
            if answers(&path, Duration::from_millis(100)).await {
                eyre::bail!("Another mosw daemon is already listening on {}", path.display());
            }
            debug!("Replacing stale socket {}", path.display());
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
        }

        let listener = UnixListener::bind(&path)
            .with_context(|| format!("Failed to bind control socket {}", path.display()))?;
        Ok(Self { path, listener })
    }

    /// Next client connection; `None` after a failed accept
    pub async fn accept(&self) -> Option<UnixStream> {
        self.listener
            .accept()
            .await
            .map(|(stream, _)| stream)
            .inspect_err(|e| error!("Control socket accept failed: {}", e))
            .ok()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed {}", self.path.display()),
            Err(e) => warn!("Could not remove {}: {}", self.path.display(), e),
        }
    }
}
