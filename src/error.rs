//! Error taxonomy for the capture core.
//!
//! "No frame yet" is deliberately absent: an empty poll is `Ok(None)`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CaptureError>;

#[derive(Debug, Error)]
pub enum CaptureError {
    /// Device absent, unplugged, or not answering the driver handshake.
    #[error("device {device} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    /// No native mode of the device can satisfy the request.
    #[error("unsupported stream format: {requested}")]
    UnsupportedFormat { requested: String },

    #[error("unknown property '{0}'")]
    UnknownProperty(String),

    #[error("device {device} does not implement property '{property}'")]
    UnsupportedProperty { device: String, property: String },

    #[error("value {value} for '{property}' outside [{min}, {max}]")]
    OutOfRange {
        property: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("property '{property}' is not currently controllable")]
    ReadOnlyProperty { property: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("device {device} is already streaming; stop it before reconfiguring")]
    SessionActive { device: String },

    #[error("device {device} has no configured stream")]
    NotConfigured { device: String },

    #[error("backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Settings(#[from] config::ConfigError),
}

impl CaptureError {
    pub fn unavailable(device: impl Into<String>, reason: impl ToString) -> Self {
        Self::DeviceUnavailable {
            device: device.into(),
            reason: reason.to_string(),
        }
    }

    /// True for errors after which the device handle must be re-enumerated.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::DeviceUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_message_names_bounds() {
        let err = CaptureError::OutOfRange {
            property: "brightness".into(),
            value: 300.0,
            min: 0.0,
            max: 255.0,
        };
        assert_eq!(
            err.to_string(),
            "value 300 for 'brightness' outside [0, 255]"
        );
    }

    #[test]
    fn unavailable_helper() {
        let err = CaptureError::unavailable("cam0", "unplugged");
        assert!(err.is_unavailable());
        assert_eq!(err.to_string(), "device cam0 unavailable: unplugged");
        assert!(!CaptureError::UnknownProperty("x".into()).is_unavailable());
    }
}
