//! Virtual output device.
//!
//! Rewritten events re-enter the input stack through a uinput device that
//! is created once at startup with the union of every capability the
//! daemon can need: the grabbed devices' keys and relative axes plus every
//! key code the loaded profiles and macros can produce. The [`EventSink`]
//! trait is the narrow seam between the engine/macro player and the
//! device, so tests substitute a recording sink.

use async_trait::async_trait;
use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AttributeSet, Key, RelativeAxisType};
use razerhub_common::OutputEvent;
use std::collections::BTreeSet;
use std::io;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A write to the virtual device failed. The event is dropped and counted;
/// injection failures are never fatal.
#[derive(Debug, Error)]
#[error("virtual device write failed: {0}")]
pub struct InjectionError(#[from] pub io::Error);

/// Where rewritten events go. `emit` writes the batch followed by a
/// synchronization report.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, events: &[OutputEvent]) -> Result<(), InjectionError>;

    /// Single key or button edge.
    async fn key(&self, code: u16, value: i32) -> Result<(), InjectionError> {
        self.emit(&[OutputEvent::key(code, value)]).await
    }
}

/// Capability set registered on the virtual device at creation.
#[derive(Debug, Clone, Default)]
pub struct OutputCapabilities {
    pub keys: BTreeSet<u16>,
    pub relative_axes: BTreeSet<u16>,
}

impl OutputCapabilities {
    /// Full keyboard range, mouse buttons, and the usual relative axes.
    /// Device- and profile-specific codes are added on top of this floor.
    pub fn baseline() -> Self {
        let mut caps = Self::default();
        caps.keys.extend(1..=255u16);
        caps.keys.extend(272..=279u16);
        // REL_X, REL_Y, REL_HWHEEL, REL_WHEEL and the hi-res variants.
        caps.relative_axes.extend([0u16, 1, 6, 8, 11, 12]);
        caps
    }

    pub fn add_keys<I: IntoIterator<Item = u16>>(&mut self, codes: I) {
        self.keys.extend(codes);
    }

    pub fn add_relative_axes<I: IntoIterator<Item = u16>>(&mut self, axes: I) {
        self.relative_axes.extend(axes);
    }
}

/// The real uinput-backed sink.
pub struct UinputOutput {
    device: Mutex<Option<VirtualDevice>>,
}

impl UinputOutput {
    /// Create the uinput device. Failure here is an unrecoverable startup
    /// error (no uinput access, kernel module missing).
    pub fn create(name: &str, caps: &OutputCapabilities) -> io::Result<Self> {
        let mut keys = AttributeSet::<Key>::new();
        for &code in &caps.keys {
            keys.insert(Key::new(code));
        }
        let mut axes = AttributeSet::<RelativeAxisType>::new();
        for &axis in &caps.relative_axes {
            axes.insert(RelativeAxisType(axis));
        }

        let device = VirtualDeviceBuilder::new()?
            .name(name)
            .with_keys(&keys)?
            .with_relative_axes(&axes)?
            .build()?;
        info!(
            "Created virtual device {:?} ({} keys, {} axes)",
            name,
            caps.keys.len(),
            caps.relative_axes.len()
        );
        Ok(Self { device: Mutex::new(Some(device)) })
    }

    /// Destroy the uinput node. Later emits fail with `InjectionError`.
    pub async fn shutdown(&self) {
        let mut guard = self.device.lock().await;
        if guard.take().is_some() {
            debug!("Destroyed virtual device");
        }
    }
}

#[async_trait]
impl EventSink for UinputOutput {
    async fn emit(&self, events: &[OutputEvent]) -> Result<(), InjectionError> {
        let raw: Vec<evdev::InputEvent> = events.iter().map(to_evdev).collect();
        let mut guard = self.device.lock().await;
        match guard.as_mut() {
            Some(device) => device.emit(&raw).map_err(InjectionError::from),
            None => Err(InjectionError(io::Error::new(
                io::ErrorKind::NotConnected,
                "virtual device already destroyed",
            ))),
        }
    }
}

fn to_evdev(event: &OutputEvent) -> evdev::InputEvent {
    evdev::InputEvent::new(
        evdev::EventType(event.event_type.raw()),
        event.code,
        event.value,
    )
}
