//! Physical device discovery, exclusive grabs, and event forwarding.
//!
//! Discovery walks the udev `input` subsystem and keeps event nodes whose
//! USB vendor id matches the configured filter. Each grabbed device is
//! served by its own supervisor task: open, grab, then pump the evdev
//! event stream into the engine channel. The stream owns the grabbed
//! device handle, so the file descriptor that holds the grab is the one
//! being read. Read errors enter a bounded backoff loop; an exhausted
//! budget leaves the device behind without taking the daemon down.

use crate::config::ReconnectSection;
use razerhub_common::{DeviceInfo, DeviceState, EventType, InputEvent};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Enumerate input event nodes and keep those matching the vendor filter.
/// A filter of 0 keeps every node that reports key capabilities.
pub fn discover_devices(vendor_filter: u16) -> Vec<DeviceInfo> {
    let mut found = Vec::new();
    let mut enumerator = match udev::Enumerator::new() {
        Ok(enumerator) => enumerator,
        Err(e) => {
            warn!("udev enumeration unavailable: {}", e);
            return found;
        }
    };
    if let Err(e) = enumerator.match_subsystem("input") {
        warn!("udev subsystem filter failed: {}", e);
        return found;
    }
    let devices = match enumerator.scan_devices() {
        Ok(devices) => devices,
        Err(e) => {
            warn!("udev scan failed: {}", e);
            return found;
        }
    };
    for device in devices {
        let Some(node) = device.devnode() else { continue };
        if !node.to_string_lossy().contains("/event") {
            continue;
        }
        if let Some(info) = probe_node(node, vendor_filter) {
            debug!("Discovered {}", info);
            found.push(info);
        }
    }
    found.sort_by(|a, b| a.path.cmp(&b.path));
    found
}

/// Open a node to read its identity. Nodes without key capabilities (for
/// example lighting-only interfaces) are skipped.
fn probe_node(node: &Path, vendor_filter: u16) -> Option<DeviceInfo> {
    let device = evdev::Device::open(node).ok()?;
    let id = device.input_id();
    if vendor_filter != 0 && id.vendor() != vendor_filter {
        return None;
    }
    device.supported_keys()?;
    Some(DeviceInfo {
        name: device.name().unwrap_or("unknown").to_string(),
        path: node.to_path_buf(),
        vendor_id: id.vendor(),
        product_id: id.product(),
        phys: device.physical_path().unwrap_or("").to_string(),
    })
}

/// Union the key and relative-axis capabilities of the given nodes into
/// the output capability set.
pub fn collect_capabilities(
    devices: &[DeviceInfo],
    caps: &mut crate::output::OutputCapabilities,
) {
    for info in devices {
        match evdev::Device::open(&info.path) {
            Ok(device) => {
                if let Some(keys) = device.supported_keys() {
                    caps.add_keys(keys.iter().map(|k| k.code()));
                }
                if let Some(axes) = device.supported_relative_axes() {
                    caps.add_relative_axes(axes.iter().map(|a| a.0));
                }
            }
            Err(e) => warn!("Could not probe {}: {}", info.path.display(), e),
        }
    }
}

/// Exponential backoff schedule: `initial * 2^(attempt-1)`, capped.
fn backoff_delay(reconnect: &ReconnectSection, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let ms = reconnect
        .initial_delay_ms
        .saturating_mul(1u64 << shift)
        .min(reconnect.max_delay_ms);
    Duration::from_millis(ms)
}

#[derive(Clone)]
struct SupervisorCtx {
    events: mpsc::Sender<InputEvent>,
    reconnect: ReconnectSection,
    forwarding: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    grabbed: Arc<AtomicU32>,
    state: Arc<RwLock<DeviceState>>,
    supervised: Arc<Mutex<HashMap<PathBuf, Arc<Notify>>>>,
}

impl SupervisorCtx {
    async fn refresh_running(&self) {
        *self.state.write().await =
            DeviceState::Running { grabbed: self.grabbed.load(Ordering::SeqCst) };
    }

    /// Reconnecting/Degraded only surface while no device is grabbed;
    /// otherwise the healthy devices keep the source Running.
    async fn set_reconnecting(&self, attempt: u32) {
        if self.grabbed.load(Ordering::SeqCst) == 0 {
            *self.state.write().await = DeviceState::Reconnecting { attempt };
        }
    }

    async fn set_degraded(&self, reason: String) {
        if self.grabbed.load(Ordering::SeqCst) == 0 {
            *self.state.write().await = DeviceState::Degraded { reason };
        }
    }
}

/// Owns discovery results and the per-device supervisor tasks.
pub struct DeviceManager {
    events: mpsc::Sender<InputEvent>,
    vendor_filter: u16,
    reconnect: ReconnectSection,
    forwarding: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    grabbed: Arc<AtomicU32>,
    state: Arc<RwLock<DeviceState>>,
    devices: RwLock<Vec<DeviceInfo>>,
    supervised: Arc<Mutex<HashMap<PathBuf, Arc<Notify>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceManager {
    pub fn new(
        events: mpsc::Sender<InputEvent>,
        vendor_filter: u16,
        reconnect: ReconnectSection,
    ) -> Self {
        Self {
            events,
            vendor_filter,
            reconnect,
            forwarding: Arc::new(AtomicBool::new(true)),
            stopping: Arc::new(AtomicBool::new(false)),
            grabbed: Arc::new(AtomicU32::new(0)),
            state: Arc::new(RwLock::new(DeviceState::Running { grabbed: 0 })),
            devices: RwLock::new(Vec::new()),
            supervised: Arc::new(Mutex::new(HashMap::new())),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub async fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.read().await.clone()
    }

    pub async fn state(&self) -> DeviceState {
        self.state.read().await.clone()
    }

    pub fn grabbed_count(&self) -> u32 {
        self.grabbed.load(Ordering::SeqCst)
    }

    /// Run discovery again and remember the result.
    pub async fn rescan(&self) -> Vec<DeviceInfo> {
        let found = discover_devices(self.vendor_filter);
        info!("Discovered {} matching input devices", found.len());
        *self.devices.write().await = found.clone();
        found
    }

    /// Spawn a supervisor for every known device that does not have one
    /// yet. Returns how many supervisors were started.
    pub async fn grab_all(&self) -> usize {
        if self.devices.read().await.is_empty() {
            self.rescan().await;
        }
        let devices = self.devices.read().await.clone();
        if devices.is_empty() {
            warn!("No matching input devices to grab");
            *self.state.write().await =
                DeviceState::Degraded { reason: "no matching input devices".to_string() };
            return 0;
        }

        self.stopping.store(false, Ordering::SeqCst);
        let mut started = 0;
        for info in devices {
            let stop = {
                let mut supervised = self.supervised.lock().await;
                if supervised.contains_key(&info.path) {
                    continue;
                }
                let stop = Arc::new(Notify::new());
                supervised.insert(info.path.clone(), stop.clone());
                stop
            };
            let ctx = SupervisorCtx {
                events: self.events.clone(),
                reconnect: self.reconnect.clone(),
                forwarding: self.forwarding.clone(),
                stopping: self.stopping.clone(),
                grabbed: self.grabbed.clone(),
                state: self.state.clone(),
                supervised: self.supervised.clone(),
            };
            self.tasks.lock().await.push(tokio::spawn(supervise(ctx, info, stop)));
            started += 1;
        }
        started
    }

    /// First shutdown stage: readers keep their grabs but drop every event
    /// on the floor.
    pub fn stop_forwarding(&self) {
        self.forwarding.store(false, Ordering::SeqCst);
        debug!("Input forwarding stopped");
    }

    /// Stop every supervisor and wait for the grabs to be released.
    pub async fn release_all(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        {
            let supervised = self.supervised.lock().await;
            for stop in supervised.values() {
                stop.notify_one();
            }
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Device supervisor task failed: {}", e);
            }
        }
        self.supervised.lock().await.clear();
        self.refresh_state().await;
        info!("Released all device grabs");
    }

    async fn refresh_state(&self) {
        *self.state.write().await =
            DeviceState::Running { grabbed: self.grabbed.load(Ordering::SeqCst) };
    }
}

enum PumpEnd {
    Stopped,
    Error(std::io::Error),
}

async fn supervise(ctx: SupervisorCtx, info: DeviceInfo, stop: Arc<Notify>) {
    let mut attempt: u32 = 0;
    loop {
        if ctx.stopping.load(Ordering::SeqCst) {
            break;
        }
        match open_and_grab(&info.path) {
            Ok(device) => {
                attempt = 0;
                ctx.grabbed.fetch_add(1, Ordering::SeqCst);
                ctx.refresh_running().await;
                info!("Grabbed {}", info);
                let end = pump_events(device, &ctx, &info, &stop).await;
                ctx.grabbed.fetch_sub(1, Ordering::SeqCst);
                ctx.refresh_running().await;
                match end {
                    PumpEnd::Stopped => break,
                    PumpEnd::Error(e) => warn!("Device {} read failed: {}", info, e),
                }
            }
            Err(e) => warn!("Could not grab {}: {}", info, e),
        }

        attempt += 1;
        if attempt > ctx.reconnect.max_attempts {
            warn!(
                "Device {} unavailable after {} attempts, giving up until reload",
                info, ctx.reconnect.max_attempts
            );
            ctx.set_degraded(format!(
                "{} unavailable after {} attempts",
                info.path.display(),
                ctx.reconnect.max_attempts
            ))
            .await;
            break;
        }
        ctx.set_reconnecting(attempt).await;
        let delay = backoff_delay(&ctx.reconnect, attempt);
        debug!(
            "Retrying {} in {:?} (attempt {}/{})",
            info, delay, attempt, ctx.reconnect.max_attempts
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.notified() => break,
        }
    }
    ctx.supervised.lock().await.remove(&info.path);
    debug!("Supervisor for {} ended", info.path.display());
}

fn open_and_grab(path: &Path) -> std::io::Result<evdev::Device> {
    let mut device = evdev::Device::open(path)?;
    device.grab()?;
    Ok(device)
}

async fn pump_events(
    device: evdev::Device,
    ctx: &SupervisorCtx,
    info: &DeviceInfo,
    stop: &Notify,
) -> PumpEnd {
    let mut stream = match device.into_event_stream() {
        Ok(stream) => stream,
        Err(e) => return PumpEnd::Error(e),
    };
    let device_id = info.path.to_string_lossy().to_string();
    loop {
        if ctx.stopping.load(Ordering::SeqCst) {
            ungrab_stream(&mut stream, info);
            return PumpEnd::Stopped;
        }
        tokio::select! {
            _ = stop.notified() => {
                ungrab_stream(&mut stream, info);
                return PumpEnd::Stopped;
            }
            next = stream.next_event() => match next {
                Ok(event) => {
                    if !ctx.forwarding.load(Ordering::SeqCst) {
                        continue;
                    }
                    let input = convert_event(&device_id, &event);
                    if ctx.events.send(input).await.is_err() {
                        debug!("Event channel closed, stopping {}", info);
                        ungrab_stream(&mut stream, info);
                        return PumpEnd::Stopped;
                    }
                }
                Err(e) => return PumpEnd::Error(e),
            }
        }
    }
}

fn ungrab_stream(stream: &mut evdev::EventStream, info: &DeviceInfo) {
    if let Err(e) = stream.device_mut().ungrab() {
        debug!("Ungrab of {} failed: {}", info, e);
    }
}

fn convert_event(device_id: &str, event: &evdev::InputEvent) -> InputEvent {
    let timestamp_us = event
        .timestamp()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    InputEvent {
        device_id: device_id.to_string(),
        event_type: EventType::from_raw(event.event_type().0),
        code: event.code(),
        value: event.value(),
        timestamp_us,
    }
}
