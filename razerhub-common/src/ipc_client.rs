//! Client side of the razerhub control socket.
//!
//! The daemon listens on a Unix stream socket and exchanges
//! length-prefixed bincode frames: a little-endian u32 payload length
//! followed by the encoded [`Request`] or [`Response`]. This module wraps
//! that framing in a small client with connect retries and per-operation
//! timeouts so front-ends do not reimplement it.

use crate::{deserialize, ErrorKind, Request, Response};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;

/// Socket path used when `$XDG_RUNTIME_DIR` is not set.
pub const DEFAULT_SOCKET_PATH: &str = "/run/razerhub.sock";
/// Default per-operation timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
/// Upper bound on a single frame, matching the daemon's limit.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
/// Default number of connection attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default pause between connection attempts in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// The socket path for the current session: `$XDG_RUNTIME_DIR/razerhub.sock`
/// when the variable is set, [`DEFAULT_SOCKET_PATH`] otherwise.
pub fn resolve_socket_path() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => Path::new(&dir).join("razerhub.sock"),
        _ => PathBuf::from(DEFAULT_SOCKET_PATH),
    }
}

/// Errors surfaced by the IPC client.
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("I/O error during IPC exchange: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode request: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode response: {0}")]
    Decode(#[source] bincode::Error),
    #[error("connection attempt timed out")]
    ConnectionTimeout,
    #[error("operation timed out after {0} ms")]
    OperationTimeout(u64),
    #[error("daemon is not running at {0}")]
    DaemonNotRunning(String),
    #[error("message of {0} bytes exceeds the {1} byte limit")]
    MessageTooLarge(usize, usize),
    #[error("connection closed before a full response arrived")]
    ConnectionClosed,
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("daemon reported {kind:?}: {message}")]
    Daemon { kind: ErrorKind, message: String },
}

/// Connection settings plus the framed request/response exchange.
#[derive(Debug, Clone)]
pub struct IpcClient {
    socket_path: PathBuf,
    timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
}

impl Default for IpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl IpcClient {
    /// Client for the current session's socket with default settings.
    pub fn new() -> Self {
        Self::with_socket_path(resolve_socket_path())
    }

    /// Client for an explicit socket path.
    pub fn with_socket_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            socket_path: path.as_ref().to_path_buf(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }

    /// Set the per-operation timeout in milliseconds.
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Duration::from_millis(timeout_ms);
        self
    }

    /// Set the connection retry count and delay between attempts.
    pub fn with_retry_params(mut self, max_retries: u32, retry_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = Duration::from_millis(retry_delay_ms);
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Quick liveness probe: can the socket be connected to right now?
    pub async fn is_daemon_running(&self) -> bool {
        matches!(
            timeout(Duration::from_millis(500), UnixStream::connect(&self.socket_path)).await,
            Ok(Ok(_))
        )
    }

    /// Connect with retries. Exhausted attempts map to `DaemonNotRunning`,
    /// a final timed-out attempt to `ConnectionTimeout`.
    pub async fn connect(&self) -> Result<UnixStream, IpcError> {
        let attempts = self.max_retries.max(1);
        let mut timed_out = false;
        for attempt in 1..=attempts {
            match timeout(self.timeout, UnixStream::connect(&self.socket_path)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    tracing::debug!(
                        "Connection attempt {}/{} failed: {}",
                        attempt,
                        attempts,
                        e
                    );
                    timed_out = false;
                }
                Err(_) => timed_out = true,
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        if timed_out {
            Err(IpcError::ConnectionTimeout)
        } else {
            Err(IpcError::DaemonNotRunning(
                self.socket_path.display().to_string(),
            ))
        }
    }

    /// Send one request and wait for its response on a fresh connection.
    pub async fn send(&self, request: &Request) -> Result<Response, IpcError> {
        let bytes = bincode::serialize(request).map_err(IpcError::Encode)?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(IpcError::MessageTooLarge(bytes.len(), MAX_MESSAGE_SIZE));
        }
        let mut stream = self.connect().await?;
        self.exchange(&mut stream, &bytes).await
    }

    /// Send one request and require an `Ack`, converting daemon errors into
    /// typed [`IpcError::Daemon`] values.
    pub async fn expect_ack(&self, request: &Request) -> Result<(), IpcError> {
        match self.send(request).await? {
            Response::Ack => Ok(()),
            Response::Error { kind, message } => Err(IpcError::Daemon { kind, message }),
            other => Err(IpcError::UnexpectedResponse(format!("{:?}", other))),
        }
    }

    async fn exchange(
        &self,
        stream: &mut UnixStream,
        request_bytes: &[u8],
    ) -> Result<Response, IpcError> {
        let timeout_ms = self.timeout.as_millis() as u64;
        let io = async {
            stream.write_u32_le(request_bytes.len() as u32).await?;
            stream.write_all(request_bytes).await?;
            stream.flush().await?;

            let len = stream.read_u32_le().await.map_err(eof_as_closed)? as usize;
            if len > MAX_MESSAGE_SIZE {
                return Err(IpcError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
            }
            let mut payload = vec![0u8; len];
            stream.read_exact(&mut payload).await.map_err(eof_as_closed)?;
            deserialize::<Response>(&payload).map_err(IpcError::Decode)
        };
        match timeout(self.timeout, io).await {
            Ok(result) => result,
            Err(_) => Err(IpcError::OperationTimeout(timeout_ms)),
        }
    }
}

fn eof_as_closed(e: std::io::Error) -> IpcError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        IpcError::ConnectionClosed
    } else {
        IpcError::Io(e)
    }
}

/// One-shot request against the session socket with default settings.
pub async fn send(request: &Request) -> Result<Response, IpcError> {
    IpcClient::new().send(request).await
}

/// One-shot request against an explicit socket path.
pub async fn send_to_path<P: AsRef<Path>>(
    path: P,
    request: &Request,
) -> Result<Response, IpcError> {
    IpcClient::with_socket_path(path).send(request).await
}

/// Liveness probe against an explicit path, or the session socket when
/// `path` is `None`.
pub async fn is_daemon_running(path: Option<&Path>) -> bool {
    let client = match path {
        Some(p) => IpcClient::with_socket_path(p),
        None => IpcClient::new(),
    };
    client.is_daemon_running().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{serialize, DaemonStatus, DeviceState, WatcherState};
    use tokio::net::UnixListener;

    fn sample_status() -> DaemonStatus {
        DaemonStatus {
            version: "0.3.0".into(),
            uptime_seconds: 42,
            active_profile: "default".into(),
            profiles: 1,
            macros: 0,
            device: DeviceState::Running { grabbed: 1 },
            injection_failures: 0,
            lighting_available: false,
            watcher: WatcherState {
                enabled: true,
                backend: "x11".into(),
                last_context: None,
            },
        }
    }

    async fn spawn_mock_daemon(path: PathBuf) {
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    loop {
                        let Ok(len) = stream.read_u32_le().await else {
                            break;
                        };
                        let mut payload = vec![0u8; len as usize];
                        if stream.read_exact(&mut payload).await.is_err() {
                            break;
                        }
                        let request: Request = deserialize(&payload).unwrap();
                        let response = match request {
                            Request::GetStatus => Response::Status(sample_status()),
                            Request::SwitchProfile { id } if id == "missing" => {
                                Response::error(ErrorKind::ProfileNotFound, "no such profile")
                            }
                            _ => Response::Ack,
                        };
                        let bytes = serialize(&response);
                        if stream.write_u32_le(bytes.len() as u32).await.is_err() {
                            break;
                        }
                        if stream.write_all(&bytes).await.is_err() {
                            break;
                        }
                        let _ = stream.flush().await;
                    }
                });
            }
        });
    }

    #[test]
    fn builder_settings() {
        let client = IpcClient::with_socket_path("/tmp/test.sock")
            .with_timeout(250)
            .with_retry_params(7, 10);
        assert_eq!(client.socket_path(), Path::new("/tmp/test.sock"));
        assert_eq!(client.timeout, Duration::from_millis(250));
        assert_eq!(client.max_retries, 7);
        assert_eq!(client.retry_delay, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn request_response_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("razerhub.sock");
        spawn_mock_daemon(socket.clone()).await;

        let client = IpcClient::with_socket_path(&socket).with_retry_params(10, 50);
        assert!(client.is_daemon_running().await);

        match client.send(&Request::GetStatus).await.unwrap() {
            Response::Status(status) => assert_eq!(status.active_profile, "default"),
            other => panic!("unexpected response: {:?}", other),
        }
        client
            .expect_ack(&Request::SwitchProfile { id: "gaming".into() })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn daemon_errors_become_typed() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("razerhub.sock");
        spawn_mock_daemon(socket.clone()).await;

        let client = IpcClient::with_socket_path(&socket).with_retry_params(10, 50);
        let err = client
            .expect_ack(&Request::SwitchProfile { id: "missing".into() })
            .await
            .unwrap_err();
        match err {
            IpcError::Daemon { kind, .. } => assert_eq!(kind, ErrorKind::ProfileNotFound),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn missing_daemon_is_reported() {
        let client = IpcClient::with_socket_path("/tmp/razerhub-none.sock")
            .with_timeout(200)
            .with_retry_params(1, 10);
        assert!(!client.is_daemon_running().await);
        match client.send(&Request::GetStatus).await.unwrap_err() {
            IpcError::DaemonNotRunning(_) | IpcError::ConnectionTimeout => {}
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn oversized_requests_are_rejected_before_connecting() {
        let mut profile = crate::Profile::passthrough_default();
        profile.name = "x".repeat(2 * MAX_MESSAGE_SIZE);
        let client = IpcClient::with_socket_path("/tmp/razerhub-none.sock");
        match client
            .send(&Request::SaveProfile { profile })
            .await
            .unwrap_err()
        {
            IpcError::MessageTooLarge(size, limit) => {
                assert!(size > limit);
                assert_eq!(limit, MAX_MESSAGE_SIZE);
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
