//! Shared types for razerhub.
//!
//! Everything that crosses the daemon boundary lives here: the input/output
//! event model, profiles and macros, the IPC request/response protocol, and
//! the bincode framing helpers. The daemon, the e2e suite, and external
//! front-ends all build against this crate so the wire format has a single
//! definition.

pub use bincode;
pub use serde;
pub use tokio;
pub use tracing;

pub mod ipc_client;
pub mod keymap;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Linux input event type, mirroring the kernel EV_* class of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// EV_SYN synchronization marker.
    Sync,
    /// EV_KEY key or button edge.
    Key,
    /// EV_REL relative axis (mouse movement, wheel).
    Relative,
    /// EV_ABS absolute axis.
    Absolute,
    /// Any other event class, carrying the raw type code.
    Other(u16),
}

impl EventType {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => EventType::Sync,
            1 => EventType::Key,
            2 => EventType::Relative,
            3 => EventType::Absolute,
            other => EventType::Other(other),
        }
    }

    pub fn raw(&self) -> u16 {
        match self {
            EventType::Sync => 0,
            EventType::Key => 1,
            EventType::Relative => 2,
            EventType::Absolute => 3,
            EventType::Other(raw) => *raw,
        }
    }
}

/// A single event read from a grabbed physical device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputEvent {
    /// Device node the event came from, e.g. `/dev/input/event7`.
    pub device_id: String,
    pub event_type: EventType,
    pub code: u16,
    pub value: i32,
    /// Microseconds since the Unix epoch, as stamped by the kernel.
    pub timestamp_us: u64,
}

/// A single event written to the virtual output device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub event_type: EventType,
    pub code: u16,
    pub value: i32,
}

impl OutputEvent {
    /// Key or button event with the given press value (1 press, 0 release,
    /// 2 auto-repeat).
    pub fn key(code: u16, value: i32) -> Self {
        Self { event_type: EventType::Key, code, value }
    }
}

impl From<&InputEvent> for OutputEvent {
    fn from(event: &InputEvent) -> Self {
        Self { event_type: event.event_type, code: event.code, value: event.value }
    }
}

/// What the engine does with a key code that reaches it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TargetAction {
    /// Emit the event unchanged.
    PassThrough,
    /// Emit with the substituted key code, preserving the press value.
    Remap(u16),
    /// Feed press/release edges to the named macro, emit nothing directly.
    Macro(String),
    /// Drop the event silently.
    Suppress,
}

/// One row of a profile's key mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    /// Source key code on the physical device.
    pub source: u16,
    pub action: TargetAction,
}

/// One step of a macro: the event to emit plus the pause before the next
/// step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroStep {
    pub event: OutputEvent,
    pub delay_ms: u32,
}

/// How a macro behaves while its trigger key is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayMode {
    /// Play the steps exactly once per press.
    Once,
    /// Replay the steps until the trigger is released; the pass in flight
    /// when the release arrives still completes.
    HoldRepeat,
}

/// A stored macro. Macros live in a daemon-wide library and are referenced
/// from mappings by id so profiles can share one definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroDefinition {
    pub id: String,
    pub steps: Vec<MacroStep>,
    pub mode: ReplayMode,
}

/// Matches a focused application. At least one field must be set; each
/// pattern is a regular expression, falling back to a substring match if it
/// does not parse as one.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AppMatchRule {
    /// Pattern against the executable name (`/proc/<pid>/comm`).
    #[serde(default)]
    pub exe: Option<String>,
    /// Pattern against the window class.
    #[serde(default)]
    pub class: Option<String>,
}

/// Lighting effect pushed to the hardware service on profile activation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LightingEffect {
    Static { r: u8, g: u8, b: u8 },
    Spectrum,
    Breathing { r: u8, g: u8, b: u8 },
}

/// Per-profile lighting settings, opaque to the remap core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightingConfig {
    pub effect: LightingEffect,
    /// Percent, 0..=100.
    #[serde(default)]
    pub brightness: Option<u8>,
    #[serde(default)]
    pub dpi: Option<(u16, u16)>,
}

/// A named remapping configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mapping: Vec<MappingEntry>,
    /// Ids of the macros this profile relies on. Every macro referenced by
    /// the mapping must be listed here and exist in the library.
    #[serde(default)]
    pub macros: Vec<String>,
    #[serde(default)]
    pub lighting: Option<LightingConfig>,
    /// Application rules for automatic switching, checked in order.
    #[serde(default)]
    pub rules: Vec<AppMatchRule>,
}

/// Id of the built-in pass-through profile.
pub const DEFAULT_PROFILE_ID: &str = "default";

impl Profile {
    /// The built-in profile: every event passes through untouched.
    pub fn passthrough_default() -> Self {
        Self {
            id: DEFAULT_PROFILE_ID.to_string(),
            name: "Default Profile".to_string(),
            mapping: Vec::new(),
            macros: Vec::new(),
            lighting: None,
            rules: Vec::new(),
        }
    }
}

/// Foreground application as reported by the focus watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppContext {
    pub exe: String,
    pub class: String,
}

/// A physical input device the daemon knows about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub path: PathBuf,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Kernel physical path, e.g. `usb-0000:00:14.0-1/input0`.
    pub phys: String,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (VID: {:04X}, PID: {:04X})",
            self.name, self.vendor_id, self.product_id
        )
    }
}

/// Health of the device source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceState {
    /// Grabbed and forwarding events from `grabbed` devices.
    Running { grabbed: u32 },
    /// Lost a device, retrying with backoff.
    Reconnecting { attempt: u32 },
    /// Retry budget exhausted; the daemon stays up and queryable.
    Degraded { reason: String },
}

/// Application watcher state as exposed over IPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatcherState {
    pub enabled: bool,
    pub backend: String,
    pub last_context: Option<AppContext>,
}

/// Full daemon status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    pub uptime_seconds: u64,
    pub active_profile: String,
    pub profiles: u32,
    pub macros: u32,
    pub device: DeviceState,
    /// Events dropped because the virtual device write failed.
    pub injection_failures: u64,
    pub lighting_available: bool,
    pub watcher: WatcherState,
}

/// Wire-level error classification carried by `Response::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ProfileNotFound,
    ProfileInvalid,
    DeviceUnavailable,
    Injection,
    HardwareUnavailable,
    MacroConflict,
    Validation,
    Internal,
}

/// Requests accepted on the control socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Full status snapshot.
    GetStatus,
    /// Discovered input devices.
    GetDevices,
    /// All loaded profiles, in definition order.
    ListProfiles,
    /// Id of the active profile.
    GetActiveProfile,
    /// Activate the named profile.
    SwitchProfile { id: String },
    /// Validate, store, and persist a profile.
    SaveProfile { profile: Profile },
    /// Delete a stored profile. The active profile cannot be deleted.
    DeleteProfile { id: String },
    /// All macros in the library.
    ListMacros,
    /// Validate, store, and persist a macro definition.
    SaveMacro { definition: MacroDefinition },
    /// Delete a macro that no profile references.
    DeleteMacro { id: String },
    /// Play a macro once, as if its trigger had been pressed.
    PlayMacro { id: String },
    /// Begin recording key events into a new macro.
    RecordMacro { id: String },
    /// Finish recording and return the captured definition.
    StopRecording,
    /// Enable or disable automatic profile switching.
    SetWatcherEnabled { enabled: bool },
    /// Re-read profiles and macros from disk and retry degraded devices.
    Reload,
}

/// Responses sent back on the control socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Status(DaemonStatus),
    Devices(Vec<DeviceInfo>),
    Profiles(Vec<Profile>),
    ActiveProfile { id: String },
    Macros(Vec<MacroDefinition>),
    RecordingStarted { id: String },
    RecordingStopped { definition: MacroDefinition },
    /// The operation succeeded with nothing to report.
    Ack,
    Error { kind: ErrorKind, message: String },
}

impl Response {
    /// Convenience constructor for error responses.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Response::Error { kind, message: message.into() }
    }
}

/// Collect the key codes a set of profiles and macros can emit. Used to
/// size the virtual device's capability set at startup.
pub fn target_key_codes(
    profiles: &[Profile],
    macros: &HashMap<String, MacroDefinition>,
) -> Vec<u16> {
    let mut codes = std::collections::BTreeSet::new();
    for profile in profiles {
        for entry in &profile.mapping {
            codes.insert(entry.source);
            if let TargetAction::Remap(code) = entry.action {
                codes.insert(code);
            }
        }
    }
    for def in macros.values() {
        for step in &def.steps {
            if step.event.event_type == EventType::Key {
                codes.insert(step.event.code);
            }
        }
    }
    codes.into_iter().collect()
}

/// Serialize a message for the wire. Falls back to an empty frame on
/// failure, which the peer treats as a protocol error.
pub fn serialize<T: Serialize>(msg: &T) -> Vec<u8> {
    bincode::serialize(msg).unwrap_or_else(|e| {
        tracing::error!("Failed to serialize message: {}", e);
        Vec::new()
    })
}

/// Deserialize a message from the wire.
pub fn deserialize<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}
