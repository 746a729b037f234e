//! Razerhub daemon entry point.
//!
//! Wires the components together: config, device grabbing, the remap
//! engine, macro playback, the focus watcher, the lighting bridge, and
//! the IPC control socket. Shutdown runs the stages in an order that
//! never leaves a key stuck or a device grabbed.

use razerhubd::{
    config, device, engine, ipc, lighting, macros, output, profiles, security, watcher,
    DaemonState, VERSION,
};
use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config_dir: Option<PathBuf> = None;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => match args.next() {
                Some(dir) => config_dir = Some(PathBuf::from(dir)),
                None => {
                    eprintln!("--config requires a directory");
                    std::process::exit(2);
                }
            },
            "--version" => {
                println!("razerhubd {}", VERSION);
                return Ok(());
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                eprintln!("Usage: razerhubd [--config DIR] [--version]");
                std::process::exit(2);
            }
        }
    }

    let config = Arc::new(match config_dir {
        Some(dir) => config::ConfigManager::with_base_dir(dir)?,
        None => config::ConfigManager::new()?,
    });
    let settings = config.settings().clone();

    let level = settings
        .daemon
        .log_level
        .parse()
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    info!("Starting razerhubd v{}", VERSION);

    if !security::has_input_access() {
        error!("Cannot open /dev/uinput; run as root or add this user to the input group");
        return Err("insufficient privileges for uinput".into());
    }

    let socket_path = config.socket_path();
    info!("Using socket path: {}", socket_path.display());

    // Size the virtual device from what the hardware reports plus every
    // key the stored profiles and macros can emit. uinput capabilities
    // cannot grow after creation.
    let (events_tx, events_rx) = mpsc::channel(settings.devices.event_queue_size.max(1));
    let manager = Arc::new(device::DeviceManager::new(
        events_tx,
        settings.devices.vendor_filter,
        settings.reconnect.clone(),
    ));
    let discovered = manager.rescan().await;

    let mut caps = output::OutputCapabilities::baseline();
    device::collect_capabilities(&discovered, &mut caps);
    caps.add_keys(razerhub_common::target_key_codes(
        &config.load_profiles(),
        &config.load_macros(),
    ));

    let sink = Arc::new(output::UinputOutput::create("Razerhub Virtual Input", &caps)?);
    info!("Virtual output device created");
    let sink_dyn: Arc<dyn output::EventSink> = sink.clone();

    let injection_failures = Arc::new(AtomicU64::new(0));
    let library = Arc::new(RwLock::new(std::collections::HashMap::new()));
    let player = Arc::new(
        macros::MacroPlayer::new(
            library.clone(),
            sink_dyn.clone(),
            injection_failures.clone(),
            settings.macros.max_concurrent,
        )
        .with_default_delay(settings.macros.default_delay_ms),
    );
    let recorder = Arc::new(macros::MacroRecorder::new());
    let engine = Arc::new(engine::RemapEngine::new(
        sink_dyn,
        player.clone(),
        recorder.clone(),
        injection_failures.clone(),
    ));

    let lighting = if settings.lighting.enabled {
        match lighting::LightingBridge::connect().await {
            Ok(bridge) => Some(Arc::new(bridge)),
            Err(e) => {
                warn!("Lighting disabled: {}", e);
                None
            }
        }
    } else {
        info!("Lighting disabled by configuration");
        None
    };

    let store = Arc::new(profiles::ProfileStore::new(
        config.clone(),
        engine.clone(),
        library,
        lighting.clone(),
    ));
    store.bootstrap().await;

    let supervised = manager.grab_all().await;
    if supervised == 0 {
        warn!("No devices grabbed; remapping is idle until hardware appears");
    }
    tokio::spawn(engine.clone().run(events_rx));

    // The focus watcher runs whenever its backend connects; the enabled
    // flag only gates switching so clients can toggle it at runtime.
    let watcher_enabled = Arc::new(AtomicBool::new(settings.watcher.enabled));
    let last_context = Arc::new(RwLock::new(None));
    if settings.watcher.backend == "x11" {
        match watcher::X11Backend::spawn() {
            Ok(backend) => {
                let focus = watcher::AppWatcher::new(
                    store.clone(),
                    Box::new(backend),
                    watcher_enabled.clone(),
                    settings.watcher.debounce_ms,
                    last_context.clone(),
                );
                tokio::spawn(focus.run());
            }
            Err(e) => {
                warn!("Automatic profile switching unavailable: {}", e);
                watcher_enabled.store(false, Ordering::SeqCst);
            }
        }
    } else {
        warn!(
            "Unknown watcher backend '{}', automatic switching disabled",
            settings.watcher.backend
        );
        watcher_enabled.store(false, Ordering::SeqCst);
    }

    let state = Arc::new(DaemonState {
        start_time: Instant::now(),
        store,
        player: player.clone(),
        recorder,
        manager: manager.clone(),
        lighting,
        injection_failures,
        watcher_enabled,
        watcher_backend: settings.watcher.backend.clone(),
        last_context,
    });

    let outcome = serve_until_signal(&socket_path, state).await;

    // Order matters from here on, even when serving failed: stop feeding
    // the engine, wind down macros and held keys while the virtual device
    // still exists, then drop the grabs so the hardware returns to the
    // compositor, and only then tear down the output device and the
    // socket.
    manager.stop_forwarding();
    player.shutdown().await;
    engine.release_all().await;
    manager.release_all().await;
    sink.shutdown().await;

    match outcome {
        Ok(mut server) => {
            if let Err(e) = server.shutdown() {
                warn!("IPC cleanup failed: {}", e);
            }
            info!("razerhubd stopped");
            Ok(())
        }
        Err(e) => {
            error!("Daemon failed: {}", e);
            Err(e.into())
        }
    }
}

/// Bind the control socket and block until SIGTERM or SIGINT. The server
/// comes back to the caller so the socket outlives the shutdown stages.
async fn serve_until_signal(
    socket_path: &Path,
    state: Arc<DaemonState>,
) -> io::Result<ipc::IpcServer> {
    let mut server = ipc::IpcServer::new(socket_path)?;
    server.start(state).await?;
    info!("razerhubd ready");

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
        _ = interrupt.recv() => info!("Received SIGINT, shutting down"),
    }
    Ok(server)
}
