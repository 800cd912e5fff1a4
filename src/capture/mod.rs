pub mod backend;
pub mod device;
pub mod format;
pub mod frame;
pub mod session;
pub mod synthetic;
#[cfg(all(target_os = "linux", feature = "v4l2"))]
pub mod v4l2;

pub use backend::{CaptureBackend, Delivery, DeviceDriver, FrameCallback, RawFrame};
pub use device::{DeviceHandle, DeviceId};
pub use format::{negotiate, FormatCapability, StreamConfig};
pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use session::{CaptureSession, FrameReader, SessionState, SessionStats, StopReason};
pub use synthetic::{CameraSpec, Pacing, SyntheticBackend, SyntheticCamera, SyntheticControl};
#[cfg(all(target_os = "linux", feature = "v4l2"))]
pub use v4l2::V4l2Backend;
