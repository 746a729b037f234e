//! Razerhub daemon library.
//!
//! Core functionality for the daemon:
//! - Razer device discovery, exclusive grabbing, and reconnection
//! - Key remapping through per-profile dispatch tables
//! - Macro recording and playback
//! - Virtual output device via uinput
//! - Per-application profile switching
//! - OpenRazer lighting bridge
//! - IPC control socket

use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

pub mod config;
pub mod device;
pub mod engine;
pub mod ipc;
pub mod lighting;
pub mod macros;
pub mod output;
pub mod profiles;
pub mod security;
pub mod watcher;

// Re-export common types
pub use razerhub_common::{AppContext, DeviceInfo, MacroDefinition, Profile};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything the control surface needs a handle on. Built once in main
/// after the components are wired together, then shared immutably.
pub struct DaemonState {
    pub start_time: Instant,
    pub store: Arc<profiles::ProfileStore>,
    pub player: Arc<macros::MacroPlayer>,
    pub recorder: Arc<macros::MacroRecorder>,
    pub manager: Arc<device::DeviceManager>,
    pub lighting: Option<Arc<lighting::LightingBridge>>,
    pub injection_failures: Arc<AtomicU64>,
    pub watcher_enabled: Arc<AtomicBool>,
    pub watcher_backend: String,
    pub last_context: Arc<RwLock<Option<AppContext>>>,
}
