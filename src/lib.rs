pub mod capture;
pub mod control;
pub mod error;
pub mod hub;
pub mod pipeline;
pub mod utils;

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::capture::{CaptureBackend, PixelFormat, StreamConfig, SyntheticBackend};

pub use crate::capture::{DeviceHandle, DeviceId, FormatCapability, Frame, SessionState};
pub use crate::control::{Property, PropertyDescriptor, PropertyKind};
pub use crate::error::{CaptureError, Result};
pub use crate::hub::CaptureHub;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Prefix for environment overrides, e.g. `CAMTAP_CAPTURE__BUFFER_COUNT=8`
pub const ENV_PREFIX: &str = "CAMTAP";

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendKind,
    /// `tracing_subscriber::EnvFilter` directive, `RUST_LOG` wins when set
    pub log_filter: String,
    pub capture: CaptureSettings,
    pub stream: StreamSettings,
    pub synthetic: SyntheticSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// V4L2 when compiled in, synthetic otherwise
    Auto,
    V4l2,
    Synthetic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub buffer_count: u32,
    pub open_timeout_ms: u64,
    pub poll_timeout_ms: u64,
    pub allow_resolution_change: bool,
    /// USB vendor ids whose devices are listed; empty lists every device
    pub vendor_ids: Vec<u16>,
}

/// Stream requested when the caller does not name one
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub fps: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticSettings {
    pub devices: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            log_filter: "camtap=info".into(),
            capture: CaptureSettings::default(),
            stream: StreamSettings::default(),
            synthetic: SyntheticSettings::default(),
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            buffer_count: 4,
            open_timeout_ms: 2000,
            poll_timeout_ms: 100,
            allow_resolution_change: false,
            vendor_ids: Vec::new(),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            format: "mjpeg".into(),
            width: 1280,
            height: 720,
            fps: 30.0,
        }
    }
}

impl Default for SyntheticSettings {
    fn default() -> Self {
        Self { devices: 1 }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `CAMTAP_*` environment
    /// variables, later sources overriding earlier ones.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder().add_source(::config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        let layered = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("capture.vendor_ids"),
            )
            .build()?;

        let config: Config = layered.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capture.buffer_count == 0 {
            return Err(CaptureError::InvalidConfig("capture.buffer_count must be at least 1".into()));
        }
        if self.capture.open_timeout_ms == 0 {
            return Err(CaptureError::InvalidConfig("capture.open_timeout_ms must be positive".into()));
        }
        self.stream.to_stream_config(&self.capture)?.validate()
    }

    /// Construct the backend this configuration selects.
    pub fn backend(&self) -> Result<Arc<dyn CaptureBackend>> {
        match self.backend {
            BackendKind::Synthetic => Ok(Arc::new(SyntheticBackend::with_webcams(self.synthetic.devices))),
            #[cfg(all(target_os = "linux", feature = "v4l2"))]
            BackendKind::V4l2 | BackendKind::Auto => Ok(Arc::new(capture::V4l2Backend::new(&self.capture))),
            #[cfg(not(all(target_os = "linux", feature = "v4l2")))]
            BackendKind::V4l2 => Err(CaptureError::InvalidConfig("v4l2 backend is not compiled in".into())),
            #[cfg(not(all(target_os = "linux", feature = "v4l2")))]
            BackendKind::Auto => Ok(Arc::new(SyntheticBackend::with_webcams(self.synthetic.devices))),
        }
    }
}

impl StreamSettings {
    pub fn pixel_format(&self) -> Result<PixelFormat> {
        self.format.parse()
    }

    pub fn to_stream_config(&self, capture: &CaptureSettings) -> Result<StreamConfig> {
        Ok(StreamConfig::new(self.pixel_format()?, self.width, self.height, self.fps)
            .with_resolution_change(capture.allow_resolution_change))
    }
}
