use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Stable identifier of a physical camera within one backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Detected capture device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub id: DeviceId,
    pub name: String,
    /// Device node, when the backend exposes one (e.g. `/dev/video0`)
    pub path: Option<PathBuf>,
    pub driver: Option<String>,
    pub bus: Option<String>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceHandle {
    pub fn new(id: impl Into<DeviceId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            path: None,
            driver: None,
            bus: None,
            vendor_id: None,
            product_id: None,
        }
    }

    pub fn with_usb_ids(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.vendor_id = Some(vendor_id);
        self.product_id = Some(product_id);
        self
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.id, self.name)?;
        if let (Some(vid), Some(pid)) = (self.vendor_id, self.product_id) {
            write!(f, " ({vid:04x}:{pid:04x})")?;
        }
        if let Some(path) = &self.path {
            write!(f, " at {}", path.display())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_usb_ids_and_path() {
        let mut dev = DeviceHandle::new("usb-0000:00:14.0-1", "PanaCast 20").with_usb_ids(0x0b0e, 0x3012);
        dev.path = Some(PathBuf::from("/dev/video2"));
        assert_eq!(
            dev.to_string(),
            "[usb-0000:00:14.0-1] PanaCast 20 (0b0e:3012) at /dev/video2"
        );
    }

    #[test]
    fn display_without_optional_fields() {
        let dev = DeviceHandle::new("synthetic-0", "Synthetic Camera 0");
        assert_eq!(dev.to_string(), "[synthetic-0] Synthetic Camera 0");
    }
}
