//! Bridge to the OpenRazer userspace daemon over the session bus.
//!
//! Lighting is best-effort: remapping and profile switching never wait on
//! or fail because of this module. Every call failure is logged, flips the
//! availability flag reported in status, and is otherwise swallowed.

use razerhub_common::{LightingConfig, LightingEffect};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use zbus::Connection;

const RAZER_BUS: &str = "org.razer";
const MANAGER_PATH: &str = "/org/razer";
const MANAGER_IFACE: &str = "razer.devices";
const CHROMA_IFACE: &str = "razer.device.lighting.chroma";
const BRIGHTNESS_IFACE: &str = "razer.device.lighting.brightness";
const DPI_IFACE: &str = "razer.device.dpi";

#[derive(Debug, Error)]
pub enum LightingError {
    #[error("hardware service unavailable: {0}")]
    Unavailable(String),
}

fn device_path(serial: &str) -> String {
    format!("/org/razer/device/{}", serial)
}

fn brightness_level(percent: u8) -> f64 {
    f64::from(percent.min(100))
}

/// What a probed device accepts. OpenRazer exposes one object per device
/// regardless of type, so a headset without lighting still shows up in
/// `getDevices`.
#[derive(Debug, Clone, Copy)]
struct DeviceCaps {
    lighting: bool,
    dpi: bool,
}

pub struct LightingBridge {
    conn: Connection,
    available: Arc<AtomicBool>,
}

impl LightingBridge {
    /// Connect to the session bus and probe the OpenRazer service once.
    /// The service being down is not an error here; a later `apply` picks
    /// it up if it appears.
    pub async fn connect() -> Result<Self, LightingError> {
        let conn = Connection::session()
            .await
            .map_err(|e| LightingError::Unavailable(e.to_string()))?;
        let bridge = Self { conn, available: Arc::new(AtomicBool::new(false)) };
        match bridge.devices().await {
            Ok(serials) => {
                info!("OpenRazer reachable with {} device(s)", serials.len());
                bridge.available.store(true, Ordering::SeqCst);
            }
            Err(e) => warn!("OpenRazer not reachable: {}", e),
        }
        Ok(bridge)
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Push a profile's lighting settings to every connected device that
    /// accepts them.
    pub async fn apply(&self, config: &LightingConfig) -> Result<(), LightingError> {
        let serials = match self.devices().await {
            Ok(serials) => serials,
            Err(e) => {
                self.available.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let mut failures = 0usize;
        for serial in &serials {
            if let Err(e) = self.apply_to(serial, config).await {
                warn!("Lighting update on {} failed: {}", serial, e);
                failures += 1;
            }
        }

        if !serials.is_empty() && failures == serials.len() {
            self.available.store(false, Ordering::SeqCst);
            return Err(LightingError::Unavailable(format!(
                "all {} device(s) rejected the update",
                serials.len()
            )));
        }
        self.available.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn devices(&self) -> Result<Vec<String>, LightingError> {
        let reply = self
            .conn
            .call_method(
                Some(RAZER_BUS),
                MANAGER_PATH,
                Some(MANAGER_IFACE),
                "getDevices",
                &(),
            )
            .await
            .map_err(|e| LightingError::Unavailable(e.to_string()))?;
        reply
            .body()
            .deserialize()
            .map_err(|e| LightingError::Unavailable(e.to_string()))
    }

    async fn apply_to(&self, serial: &str, config: &LightingConfig) -> Result<(), LightingError> {
        let caps = self.probe(serial).await;
        if caps.lighting {
            match config.effect {
                LightingEffect::Static { r, g, b } => {
                    self.device_call(serial, CHROMA_IFACE, "setStatic", &(r, g, b)).await?;
                }
                LightingEffect::Spectrum => {
                    self.device_call(serial, CHROMA_IFACE, "setSpectrum", &()).await?;
                }
                LightingEffect::Breathing { r, g, b } => {
                    self.device_call(serial, CHROMA_IFACE, "setBreathSingle", &(r, g, b)).await?;
                }
            }
            if let Some(percent) = config.brightness {
                self.device_call(
                    serial,
                    BRIGHTNESS_IFACE,
                    "setBrightness",
                    &(brightness_level(percent),),
                )
                .await?;
            }
        }
        if let Some((dpi_x, dpi_y)) = config.dpi {
            if caps.dpi {
                self.device_call(serial, DPI_IFACE, "setDPI", &(dpi_x, dpi_y)).await?;
            }
        }
        if !caps.lighting && !caps.dpi {
            debug!("Device {} accepts neither lighting nor DPI, skipping", serial);
        }
        Ok(())
    }

    /// A capability is whatever the device's object answers getters for.
    async fn probe(&self, serial: &str) -> DeviceCaps {
        let lighting = self
            .device_call(serial, BRIGHTNESS_IFACE, "getBrightness", &())
            .await
            .is_ok();
        let dpi = self.device_call(serial, DPI_IFACE, "getDPI", &()).await.is_ok();
        DeviceCaps { lighting, dpi }
    }

    async fn device_call<B>(
        &self,
        serial: &str,
        interface: &str,
        method: &str,
        body: &B,
    ) -> Result<zbus::Message, LightingError>
    where
        B: serde::ser::Serialize + zbus::zvariant::DynamicType + Sync,
    {
        let path = device_path(serial);
        self.conn
            .call_method(Some(RAZER_BUS), path.as_str(), Some(interface), method, body)
            .await
            .map_err(|e| LightingError::Unavailable(e.to_string()))
    }
}
