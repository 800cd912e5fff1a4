use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::CaptureError;

/// Frame data with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame bytes exactly as the device produced them
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Time the capture callback received the frame
    pub timestamp: Instant,
}

impl Frame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("bytes", &self.data.len())
            .field("meta", &self.meta)
            .finish()
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats a stream can be negotiated in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Mjpeg,
    Yuyv,
    Uyvy,
    Nv12,
    Yv12,
    Rgb24,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 6] = [
        PixelFormat::Mjpeg,
        PixelFormat::Yuyv,
        PixelFormat::Uyvy,
        PixelFormat::Nv12,
        PixelFormat::Yv12,
        PixelFormat::Rgb24,
    ];

    /// V4L2 / UVC four-character code.
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Uyvy => *b"UYVY",
            PixelFormat::Nv12 => *b"NV12",
            PixelFormat::Yv12 => *b"YV12",
            PixelFormat::Rgb24 => *b"RGB3",
        }
    }

    pub fn from_fourcc(code: &[u8; 4]) -> Option<Self> {
        Self::ALL.into_iter().find(|f| &f.fourcc() == code)
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, PixelFormat::Mjpeg)
    }

    /// Packed size of one uncompressed frame, `None` for compressed formats.
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Mjpeg => None,
            PixelFormat::Yuyv | PixelFormat::Uyvy => Some(pixels * 2),
            PixelFormat::Nv12 | PixelFormat::Yv12 => Some(pixels * 3 / 2),
            PixelFormat::Rgb24 => Some(pixels * 3),
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.fourcc();
        f.write_str(std::str::from_utf8(&code).unwrap_or("????"))
    }
}

impl FromStr for PixelFormat {
    type Err = CaptureError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "mjpg" | "mjpeg" | "jpeg" | "compressed" => Ok(PixelFormat::Mjpeg),
            "raw" | "yuyv" | "yuy2" => Ok(PixelFormat::Yuyv),
            "uyvy" => Ok(PixelFormat::Uyvy),
            "nv12" => Ok(PixelFormat::Nv12),
            "yv12" => Ok(PixelFormat::Yv12),
            "rgb24" | "rgb" | "rgb3" => Ok(PixelFormat::Rgb24),
            _ => Err(CaptureError::UnsupportedFormat {
                requested: format!("unknown format tag '{tag}'"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_tag_is_two_bytes_per_pixel() {
        let fmt: PixelFormat = "raw".parse().unwrap();
        assert_eq!(fmt, PixelFormat::Yuyv);
        assert_eq!(fmt.frame_len(1280, 720), Some(1_843_200));
    }

    #[test]
    fn tags_are_case_insensitive() {
        assert_eq!("MJPG".parse::<PixelFormat>().unwrap(), PixelFormat::Mjpeg);
        assert_eq!("Yuy2".parse::<PixelFormat>().unwrap(), PixelFormat::Yuyv);
        assert!("h264".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn fourcc_lookup() {
        assert_eq!(PixelFormat::from_fourcc(b"NV12"), Some(PixelFormat::Nv12));
        assert_eq!(PixelFormat::from_fourcc(b"H264"), None);
        assert_eq!(PixelFormat::Rgb24.to_string(), "RGB3");
    }

    #[test]
    fn planar_and_compressed_sizes() {
        assert_eq!(PixelFormat::Nv12.frame_len(640, 480), Some(460_800));
        assert_eq!(PixelFormat::Mjpeg.frame_len(640, 480), None);
        assert!(PixelFormat::Mjpeg.is_compressed());
    }
}
