//! Control socket for clients.
//!
//! Frames are a u32 little-endian length followed by a bincode payload,
//! one request/response pair per frame. Clients may keep a connection
//! open and pipeline requests; the connection closes on EOF, an I/O
//! error, or an oversized frame.

use crate::{config, security, DaemonState};
use razerhub_common::{
    deserialize, serialize, DaemonStatus, ErrorKind, Request, Response, WatcherState,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Largest frame either side will accept.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

pub struct IpcServer {
    socket_path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl IpcServer {
    /// Prepare the server, removing a stale socket file from a previous
    /// run.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> io::Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();
        if socket_path.exists() {
            debug!("Removing stale socket at {}", socket_path.display());
            std::fs::remove_file(&socket_path)?;
        }
        Ok(Self { socket_path, shutdown_tx: None })
    }

    /// Bind the socket and spawn the accept loop.
    pub async fn start(&mut self, state: Arc<DaemonState>) -> io::Result<()> {
        info!("Starting IPC server at {}", self.socket_path.display());
        let listener = UnixListener::bind(&self.socket_path)?;
        if let Err(e) = security::set_socket_permissions(&self.socket_path) {
            warn!("Failed to set socket permissions: {}", e);
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    connection = listener.accept() => match connection {
                        Ok((stream, _)) => {
                            debug!("Client connected");
                            let state = Arc::clone(&state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, state).await {
                                    debug!("Client connection ended: {}", e);
                                }
                            });
                        }
                        Err(e) => error!("Failed to accept connection: {}", e),
                    },
                    _ = &mut shutdown_rx => {
                        info!("IPC server stopping");
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    pub fn shutdown(&mut self) -> io::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        Ok(())
    }
}

async fn handle_client(mut stream: UnixStream, state: Arc<DaemonState>) -> io::Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }
        let frame_len = u32::from_le_bytes(len_buf) as usize;
        if frame_len > MAX_FRAME_BYTES {
            warn!("Client sent a {} byte frame, closing", frame_len);
            let response = Response::error(ErrorKind::Validation, "frame exceeds 1 MiB");
            write_frame(&mut stream, &response).await?;
            // The stream cannot be resynchronized past a bad length.
            return Ok(());
        }

        let mut frame = vec![0u8; frame_len];
        stream.read_exact(&mut frame).await?;
        let response = match deserialize::<Request>(&frame) {
            Ok(request) => {
                debug!("Received request: {:?}", request);
                handle_request(&state, request).await
            }
            Err(e) => Response::error(ErrorKind::Validation, format!("malformed request: {}", e)),
        };
        write_frame(&mut stream, &response).await?;
    }
}

async fn write_frame(stream: &mut UnixStream, response: &Response) -> io::Result<()> {
    let bytes = serialize(response);
    stream.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await
}

/// Dispatch one request. Split out from the socket loop so tests can call
/// it without a listener.
pub async fn handle_request(state: &DaemonState, request: Request) -> Response {
    match request {
        Request::GetStatus => Response::Status(status_snapshot(state).await),
        Request::GetDevices => Response::Devices(state.manager.devices().await),
        Request::ListProfiles => Response::Profiles(state.store.list().await),
        Request::GetActiveProfile => {
            Response::ActiveProfile { id: state.store.active_id().await }
        }
        Request::SwitchProfile { id } => match state.store.switch_to(&id).await {
            Ok(()) => Response::Ack,
            Err(e) => profile_error(e),
        },
        Request::SaveProfile { profile } => match state.store.upsert(profile).await {
            Ok(()) => Response::Ack,
            Err(e) => profile_error(e),
        },
        Request::DeleteProfile { id } => match state.store.remove(&id).await {
            Ok(()) => Response::Ack,
            Err(e) => profile_error(e),
        },
        Request::ListMacros => Response::Macros(state.store.macros().await),
        Request::SaveMacro { definition } => match state.store.upsert_macro(definition).await {
            Ok(()) => Response::Ack,
            Err(e) => profile_error(e),
        },
        Request::DeleteMacro { id } => match state.store.remove_macro(&id).await {
            Ok(()) => Response::Ack,
            Err(e) => profile_error(e),
        },
        Request::PlayMacro { id } => match state.player.play_once(&id).await {
            Ok(()) => Response::Ack,
            Err(e) => macro_error(e),
        },
        Request::RecordMacro { id } => {
            if !config::valid_id(&id) {
                return Response::error(
                    ErrorKind::Validation,
                    format!("invalid macro id '{}'", id),
                );
            }
            match state.recorder.start(&id).await {
                Ok(()) => {
                    info!("Recording macro {}", id);
                    Response::RecordingStarted { id }
                }
                Err(e) => macro_error(e),
            }
        }
        Request::StopRecording => match state.recorder.stop().await {
            Ok(definition) => {
                if definition.steps.is_empty() {
                    return Response::error(
                        ErrorKind::Validation,
                        "recording captured no events",
                    );
                }
                info!(
                    "Recorded macro {} with {} step(s)",
                    definition.id,
                    definition.steps.len()
                );
                match state.store.upsert_macro(definition.clone()).await {
                    Ok(()) => Response::RecordingStopped { definition },
                    Err(e) => profile_error(e),
                }
            }
            Err(e) => macro_error(e),
        },
        Request::SetWatcherEnabled { enabled } => {
            state.watcher_enabled.store(enabled, Ordering::SeqCst);
            info!(
                "Automatic profile switching {}",
                if enabled { "enabled" } else { "disabled" }
            );
            Response::Ack
        }
        Request::Reload => {
            if let Err(e) = state.store.reload().await {
                return profile_error(e);
            }
            state.manager.rescan().await;
            let grabbed = state.manager.grab_all().await;
            info!("Reload complete, {} device(s) grabbed", grabbed);
            Response::Ack
        }
    }
}

async fn status_snapshot(state: &DaemonState) -> DaemonStatus {
    DaemonStatus {
        version: crate::VERSION.to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        active_profile: state.store.active_id().await,
        profiles: state.store.profile_count().await as u32,
        macros: state.store.macro_count().await as u32,
        device: state.manager.state().await,
        injection_failures: state.injection_failures.load(Ordering::Relaxed),
        lighting_available: state
            .lighting
            .as_ref()
            .map(|bridge| bridge.is_available())
            .unwrap_or(false),
        watcher: WatcherState {
            enabled: state.watcher_enabled.load(Ordering::SeqCst),
            backend: state.watcher_backend.clone(),
            last_context: state.last_context.read().await.clone(),
        },
    }
}

fn profile_error(e: crate::profiles::ProfileError) -> Response {
    use crate::profiles::ProfileError;
    let kind = match &e {
        ProfileError::NotFound(_) => ErrorKind::ProfileNotFound,
        ProfileError::Invalid { .. } => ErrorKind::ProfileInvalid,
        ProfileError::Refused(_) => ErrorKind::Validation,
        ProfileError::Storage(_) => ErrorKind::Internal,
    };
    Response::error(kind, e.to_string())
}

fn macro_error(e: crate::macros::MacroError) -> Response {
    use crate::macros::MacroError;
    let kind = match &e {
        MacroError::Conflict(_) => ErrorKind::MacroConflict,
        MacroError::Unknown(_)
        | MacroError::LimitReached(_)
        | MacroError::RecordingActive
        | MacroError::NotRecording => ErrorKind::Validation,
    };
    Response::error(kind, e.to_string())
}
