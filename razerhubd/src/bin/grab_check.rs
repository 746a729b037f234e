//! CLI tool for checking device grabbing outside the daemon.
//! Usage: cargo run --bin grab_check -- [/dev/input/eventX]
//!
//! Without a path it lists the Razer input devices it can see. With a
//! path it grabs that device exclusively and prints every key event
//! until Ctrl+C.

use evdev::{Device, EventType};
use razerhub_common::keymap;
use razerhubd::device::discover_devices;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();

    let devices = discover_devices(0x1532);
    let args: Vec<String> = std::env::args().collect();

    let Some(device_path) = args.get(1) else {
        info!("Found {} Razer input device(s):", devices.len());
        for device in &devices {
            info!("  {} at {}", device, device.path.display());
        }
        info!("Run again with a device path to test an exclusive grab.");
        return Ok(());
    };

    info!("Testing exclusive grab of {}", device_path);
    let mut device = match Device::open(device_path) {
        Ok(device) => device,
        Err(e) => {
            error!("Cannot open {}: {}", device_path, e);
            error!("Device access needs root or membership in the input group.");
            std::process::exit(1);
        }
    };
    info!(
        "Opened {} (VID:{:04x} PID:{:04x})",
        device.name().unwrap_or("unnamed"),
        device.input_id().vendor(),
        device.input_id().product()
    );

    device.grab()?;
    info!("Device grabbed. Key events appear here and nowhere else.");
    info!("Press Ctrl+C to release and exit.");

    let mut stream = device.into_event_stream()?;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = stream.next_event() => {
                let event = event?;
                if event.event_type() != EventType::KEY {
                    continue;
                }
                let action = match event.value() {
                    1 => "PRESSED",
                    0 => "RELEASED",
                    _ => "REPEAT",
                };
                info!("Key {} ({}) {}", event.code(), keymap::name_for(event.code()), action);
            }
            _ = &mut shutdown => {
                info!("Received Ctrl+C, releasing the device");
                break;
            }
        }
    }

    stream.device_mut().ungrab()?;
    info!("Device released.");
    Ok(())
}
