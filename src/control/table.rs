//! Per-device capability table and the get/set paths over a driver.

use std::collections::BTreeMap;

use tracing::{debug, instrument};

use crate::capture::backend::DeviceDriver;
use crate::capture::device::DeviceId;
use crate::control::property::{Property, PropertyDescriptor, PropertyKind};
use crate::error::{CaptureError, Result};

/// A device control, as reported by the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlInfo {
    pub property: Property,
    /// Backend-native control identifier
    pub control_id: u32,
    pub kind: PropertyKind,
    pub read_only: bool,
}

/// Mapping from property to the device's control, built when the device is
/// opened.
#[derive(Debug, Clone)]
pub struct PropertyTable {
    device: DeviceId,
    entries: BTreeMap<Property, ControlInfo>,
}

impl PropertyTable {
    pub fn new(device: DeviceId, controls: Vec<ControlInfo>) -> Self {
        let mut entries = BTreeMap::new();
        for info in controls {
            // First control wins when a driver maps two ids onto one property
            entries.entry(info.property).or_insert(info);
        }
        Self { device, entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn supported(&self) -> impl Iterator<Item = Property> + '_ {
        self.entries.keys().copied()
    }

    /// Resolve a caller-supplied name to the device control.
    pub fn lookup(&self, name: &str) -> Result<&ControlInfo> {
        let property: Property = name.parse()?;
        self.entries
            .get(&property)
            .ok_or_else(|| CaptureError::UnsupportedProperty {
                device: self.device.to_string(),
                property: property.name().to_string(),
            })
    }

    pub fn get(&self, driver: &dyn DeviceDriver, name: &str) -> Result<f64> {
        let info = self.lookup(name)?;
        Ok(driver.read_control(info.control_id)? as f64)
    }

    pub fn describe(&self, driver: &dyn DeviceDriver, name: &str) -> Result<PropertyDescriptor> {
        let info = self.lookup(name)?;
        self.descriptor(driver, info)
    }

    pub fn describe_all(&self, driver: &dyn DeviceDriver) -> Result<Vec<PropertyDescriptor>> {
        self.entries
            .values()
            .map(|info| self.descriptor(driver, info))
            .collect()
    }

    #[instrument(skip(self, driver), fields(device = %self.device))]
    pub fn set(&self, driver: &dyn DeviceDriver, name: &str, value: f64) -> Result<()> {
        let info = self.lookup(name)?;
        let raw = info.kind.validate(info.property, value)?;
        if info.read_only || !driver.control_active(info.control_id)? {
            return Err(CaptureError::ReadOnlyProperty {
                property: info.property.name().to_string(),
            });
        }
        driver.write_control(info.control_id, raw)?;
        debug!(property = %info.property, raw, "control written");
        Ok(())
    }

    fn descriptor(&self, driver: &dyn DeviceDriver, info: &ControlInfo) -> Result<PropertyDescriptor> {
        let value = driver.read_control(info.control_id)? as f64;
        let controllable = !info.read_only && driver.control_active(info.control_id)?;
        Ok(PropertyDescriptor {
            property: info.property,
            value,
            kind: info.kind.clone(),
            unit: info.property.unit(),
            controllable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::backend::CaptureBackend;
    use crate::capture::synthetic::{CameraSpec, Pacing, SyntheticBackend, SyntheticControl};

    fn open(spec: CameraSpec) -> (Box<dyn DeviceDriver>, PropertyTable) {
        let backend = SyntheticBackend::new();
        let camera = backend.plug(spec.with_pacing(Pacing::Manual));
        let driver = backend.open(camera.handle()).unwrap();
        let table = PropertyTable::new(camera.id().clone(), driver.controls().unwrap());
        (driver, table)
    }

    #[test]
    fn lookup_distinguishes_unknown_from_unsupported() {
        let (_, table) = open(CameraSpec::webcam(0));
        assert!(matches!(table.lookup("frobnicate"), Err(CaptureError::UnknownProperty(_))));
        assert!(matches!(
            table.lookup("zoom"),
            Err(CaptureError::UnsupportedProperty { property, .. }) if property == "zoom"
        ));
        assert_eq!(table.lookup("BRIGHTNESS").unwrap().property, Property::Brightness);
    }

    #[test]
    fn set_then_get() {
        let (driver, table) = open(CameraSpec::webcam(0));
        table.set(driver.as_ref(), "contrast", 50.0).unwrap();
        assert_eq!(table.get(driver.as_ref(), "contrast").unwrap(), 50.0);
    }

    #[test]
    fn rejected_value_leaves_device_untouched() {
        let (driver, table) = open(CameraSpec::webcam(0));
        let before = table.get(driver.as_ref(), "saturation").unwrap();
        assert!(matches!(
            table.set(driver.as_ref(), "saturation", 500.0),
            Err(CaptureError::OutOfRange { .. })
        ));
        assert!(matches!(
            table.set(driver.as_ref(), "saturation", 10.5),
            Err(CaptureError::OutOfRange { .. })
        ));
        assert_eq!(table.get(driver.as_ref(), "saturation").unwrap(), before);
    }

    #[test]
    fn read_only_and_inactive_controls_refuse_writes() {
        let mut spec = CameraSpec::webcam(0);
        spec.controls
            .push(SyntheticControl::ranged(Property::Gain, 0, 255, 1, 32).read_only());
        let (driver, table) = open(spec);

        assert!(matches!(
            table.set(driver.as_ref(), "gain", 40.0),
            Err(CaptureError::ReadOnlyProperty { .. })
        ));
        // White balance temperature is inactive while auto white balance is on
        assert!(matches!(
            table.set(driver.as_ref(), "whitebalance", 5000.0),
            Err(CaptureError::ReadOnlyProperty { .. })
        ));
        table.set(driver.as_ref(), "auto_whitebalance", 0.0).unwrap();
        table.set(driver.as_ref(), "whitebalance", 5000.0).unwrap();
    }

    #[test]
    fn descriptors_cover_every_supported_property() {
        let (driver, table) = open(CameraSpec::webcam(0));
        let all = table.describe_all(driver.as_ref()).unwrap();
        assert_eq!(all.len(), table.len());
        let exposure = table.describe(driver.as_ref(), "exposure").unwrap();
        assert!(!exposure.controllable);
        assert_eq!(exposure.range(), (3.0, 2047.0));
    }
}
