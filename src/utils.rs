use serde::{Deserialize, Serialize};
use tracing::info;

use crate::capture::{DeviceHandle, FormatCapability, PixelFormat, StreamConfig};
use crate::error::{CaptureError, Result};
use crate::hub::CaptureHub;

/// Formats tried by auto-detection, most preferred first
const PREFERRED_FORMATS: [PixelFormat; 2] = [PixelFormat::Mjpeg, PixelFormat::Yuyv];

// Detected capture device info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoundDevice {
    pub device: DeviceHandle,
    /// Largest mode in the preferred format
    pub mode: FormatCapability,
}

impl FoundDevice {
    /// A request for exactly the detected mode.
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig::new(self.mode.format, self.mode.width, self.mode.height, self.mode.fps)
    }
}

fn area(mode: &FormatCapability) -> u64 {
    u64::from(mode.width) * u64::from(mode.height)
}

/// Auto-detect best capture device: the first one offering MJPEG, else the
/// first offering YUYV.
pub fn auto_detect_device(hub: &CaptureHub) -> Result<FoundDevice> {
    info!("Auto-detecting capture devices...");

    let mut candidates = Vec::new();
    for device in hub.list_devices()? {
        match hub.formats(&device.id) {
            Ok(modes) => candidates.push((device, modes)),
            Err(e) => info!("Skipping {}: {}", device.id, e),
        }
    }

    for format in PREFERRED_FORMATS {
        for (device, modes) in &candidates {
            let best = modes
                .iter()
                .filter(|m| m.format == format)
                .max_by(|a, b| area(a).cmp(&area(b)).then(a.fps.total_cmp(&b.fps)));
            if let Some(mode) = best {
                info!("Found {} device: {} - {}", format, device.id, device.name);
                return Ok(FoundDevice {
                    device: device.clone(),
                    mode: *mode,
                });
            }
        }
    }

    Err(CaptureError::unavailable("auto", "No suitable capture device found"))
}
