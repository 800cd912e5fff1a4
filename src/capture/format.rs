//! Stream configuration and negotiation against a device's native modes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capture::frame::PixelFormat;
use crate::error::{CaptureError, Result};

pub const MAX_DIMENSION: u32 = 4096;
pub const MAX_CANVAS: u64 = 4096 * 2304;

/// What the caller asks for when starting a stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub fps: f32,
    /// Accept the nearest native resolution instead of an exact match.
    #[serde(default)]
    pub allow_resolution_change: bool,
}

impl StreamConfig {
    pub fn new(format: PixelFormat, width: u32, height: u32, fps: f32) -> Self {
        Self {
            format,
            width,
            height,
            fps,
            allow_resolution_change: false,
        }
    }

    pub fn with_resolution_change(mut self, allow: bool) -> Self {
        self.allow_resolution_change = allow;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::InvalidConfig(format!(
                "resolution {}x{} has a zero dimension",
                self.width, self.height
            )));
        }
        if self.width > MAX_DIMENSION || self.height > MAX_DIMENSION {
            return Err(CaptureError::InvalidConfig(format!(
                "resolution {}x{} exceeds {MAX_DIMENSION} pixels per side",
                self.width, self.height
            )));
        }
        if self.width as u64 * self.height as u64 > MAX_CANVAS {
            return Err(CaptureError::InvalidConfig(format!(
                "resolution {}x{} exceeds the maximum canvas",
                self.width, self.height
            )));
        }
        if !self.fps.is_finite() || self.fps <= 0.0 {
            return Err(CaptureError::InvalidConfig(format!(
                "frame rate {} must be positive",
                self.fps
            )));
        }
        Ok(())
    }
}

impl fmt::Display for StreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{}@{}",
            self.format, self.width, self.height, self.fps
        )
    }
}

/// One native mode a device can stream in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FormatCapability {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub fps: f32,
}

impl FormatCapability {
    pub fn new(format: PixelFormat, width: u32, height: u32, fps: f32) -> Self {
        Self {
            format,
            width,
            height,
            fps,
        }
    }
}

impl fmt::Display for FormatCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{}@{}",
            self.format, self.width, self.height, self.fps
        )
    }
}

/// Pick the native mode closest to `request`.
///
/// The pixel format must match exactly. Width is matched first, then height
/// among the best widths, then frame rate among those; ties keep the first
/// mode in the device's order. Unless the request allows a resolution change,
/// only exact resolution matches are candidates.
pub fn negotiate(request: &StreamConfig, modes: &[FormatCapability]) -> Option<FormatCapability> {
    let candidates = modes.iter().filter(|m| {
        m.format == request.format
            && (request.allow_resolution_change
                || (m.width == request.width && m.height == request.height))
    });

    candidates
        .min_by(|a, b| {
            let key = |m: &FormatCapability| {
                (
                    m.width.abs_diff(request.width),
                    m.height.abs_diff(request.height),
                )
            };
            key(a).cmp(&key(b)).then_with(|| {
                let da = (a.fps - request.fps).abs();
                let db = (b.fps - request.fps).abs();
                da.total_cmp(&db)
            })
        })
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modes() -> Vec<FormatCapability> {
        vec![
            FormatCapability::new(PixelFormat::Mjpeg, 1280, 720, 30.0),
            FormatCapability::new(PixelFormat::Mjpeg, 1920, 1080, 30.0),
            FormatCapability::new(PixelFormat::Yuyv, 640, 480, 30.0),
            FormatCapability::new(PixelFormat::Yuyv, 640, 480, 15.0),
            FormatCapability::new(PixelFormat::Yuyv, 320, 240, 30.0),
        ]
    }

    #[test]
    fn exact_match_wins() {
        let req = StreamConfig::new(PixelFormat::Mjpeg, 1280, 720, 30.0);
        assert_eq!(
            negotiate(&req, &modes()),
            Some(FormatCapability::new(PixelFormat::Mjpeg, 1280, 720, 30.0))
        );
    }

    #[test]
    fn missing_raw_720p_is_rejected() {
        let req = StreamConfig::new(PixelFormat::Yuyv, 1280, 720, 30.0);
        assert_eq!(negotiate(&req, &modes()), None);
    }

    #[test]
    fn resolution_change_picks_nearest_width_then_height() {
        let req = StreamConfig::new(PixelFormat::Yuyv, 1280, 720, 30.0).with_resolution_change(true);
        assert_eq!(
            negotiate(&req, &modes()),
            Some(FormatCapability::new(PixelFormat::Yuyv, 640, 480, 30.0))
        );
    }

    #[test]
    fn frame_rate_is_approximated() {
        let req = StreamConfig::new(PixelFormat::Yuyv, 640, 480, 12.0);
        assert_eq!(negotiate(&req, &modes()).map(|m| m.fps), Some(15.0));
    }

    #[test]
    fn format_must_match_exactly() {
        let req = StreamConfig::new(PixelFormat::Nv12, 640, 480, 30.0).with_resolution_change(true);
        assert_eq!(negotiate(&req, &modes()), None);
    }

    #[test]
    fn validation_rejects_degenerate_requests() {
        assert!(StreamConfig::new(PixelFormat::Yuyv, 0, 480, 30.0).validate().is_err());
        assert!(StreamConfig::new(PixelFormat::Yuyv, 8192, 480, 30.0).validate().is_err());
        assert!(StreamConfig::new(PixelFormat::Yuyv, 4096, 4096, 30.0).validate().is_err());
        assert!(StreamConfig::new(PixelFormat::Yuyv, 640, 480, 0.0).validate().is_err());
        assert!(StreamConfig::new(PixelFormat::Yuyv, 640, 480, f32::NAN).validate().is_err());
        assert!(StreamConfig::new(PixelFormat::Yuyv, 640, 480, 30.0).validate().is_ok());
    }
}
