//! Video4Linux2 backend
//!
//! Devices are `/dev/video*` nodes that advertise video capture and at least
//! one pixel format. Streaming uses memory-mapped buffers dequeued by a
//! driver-owned thread, which hands each buffer to the session callback
//! while it is still mapped.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Description, Flags as CtrlFlags, MenuItem, Type as CtrlType, Value};
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::backend::{CaptureBackend, Delivery, DeviceDriver, FrameCallback, RawFrame};
use crate::capture::device::{DeviceHandle, DeviceId};
use crate::capture::format::FormatCapability;
use crate::capture::frame::PixelFormat;
use crate::control::{ControlInfo, MenuOption, Property, PropertyKind};
use crate::error::{CaptureError, Result};
use crate::CaptureSettings;

const CID_USER_BASE: u32 = 0x0098_0900;
const CID_CAMERA_BASE: u32 = 0x009a_0900;

/// V4L2 control ids for the property vocabulary.
const CONTROL_MAP: [(u32, Property); 18] = [
    (CID_USER_BASE, Property::Brightness),
    (CID_USER_BASE + 1, Property::Contrast),
    (CID_USER_BASE + 2, Property::Saturation),
    (CID_USER_BASE + 3, Property::Hue),
    (CID_USER_BASE + 12, Property::AutoWhiteBalance),
    (CID_USER_BASE + 16, Property::Gamma),
    (CID_USER_BASE + 19, Property::Gain),
    (CID_USER_BASE + 24, Property::PowerLineFrequency),
    (CID_USER_BASE + 26, Property::WhiteBalance),
    (CID_USER_BASE + 27, Property::Sharpness),
    (CID_USER_BASE + 28, Property::BacklightCompensation),
    (CID_CAMERA_BASE + 1, Property::AutoExposure),
    (CID_CAMERA_BASE + 2, Property::Exposure),
    (CID_CAMERA_BASE + 8, Property::Pan),
    (CID_CAMERA_BASE + 9, Property::Tilt),
    (CID_CAMERA_BASE + 10, Property::Focus),
    (CID_CAMERA_BASE + 12, Property::AutoFocus),
    (CID_CAMERA_BASE + 13, Property::Zoom),
];

/// Resolutions offered inside stepwise/continuous frame size ranges
const STEPWISE_SIZES: [(u32, u32); 4] = [(640, 480), (1280, 720), (1920, 1080), (3840, 2160)];

fn property_for(id: u32) -> Option<Property> {
    CONTROL_MAP.iter().find(|(cid, _)| *cid == id).map(|(_, p)| *p)
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::ENODEV) | Some(libc::ENXIO))
}

/// Video4Linux2 capture backend
pub struct V4l2Backend {
    buffer_count: u32,
    open_timeout: Duration,
    poll_timeout: Duration,
}

impl V4l2Backend {
    pub fn new(settings: &CaptureSettings) -> Self {
        Self {
            buffer_count: settings.buffer_count.max(2),
            open_timeout: Duration::from_millis(settings.open_timeout_ms),
            poll_timeout: Duration::from_millis(settings.poll_timeout_ms.max(1)),
        }
    }

    fn inspect(node: &Path, index: usize) -> Option<DeviceHandle> {
        let dev = match Device::with_path(node) {
            Ok(dev) => dev,
            Err(e) => {
                debug!("Skipping {}: {}", node.display(), e);
                return None;
            }
        };
        let caps = dev.query_caps().ok()?;
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return None;
        }
        // Metadata nodes share the capture flag but list no formats
        if dev.enum_formats().map(|f| f.is_empty()).unwrap_or(true) {
            return None;
        }

        let id = if caps.bus.is_empty() {
            node.display().to_string()
        } else {
            caps.bus.clone()
        };
        let mut handle = DeviceHandle::new(id, caps.card.clone());
        handle.path = Some(node.to_path_buf());
        handle.driver = Some(caps.driver.clone());
        handle.bus = Some(caps.bus.clone()).filter(|b| !b.is_empty());
        if let Some((vid, pid)) = usb_ids(index) {
            handle = handle.with_usb_ids(vid, pid);
        }
        debug!("Found capture device: {} - {}", node.display(), caps.card);
        Some(handle)
    }
}

/// Vendor/product ids from sysfs; the node's `device` link points at the USB
/// interface whose parent carries the ids.
fn usb_ids(index: usize) -> Option<(u16, u16)> {
    let base = PathBuf::from(format!("/sys/class/video4linux/video{index}/device/.."));
    let read = |name: &str| {
        let raw = fs::read_to_string(base.join(name)).ok()?;
        u16::from_str_radix(raw.trim(), 16).ok()
    };
    Some((read("idVendor")?, read("idProduct")?))
}

impl CaptureBackend for V4l2Backend {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn enumerate(&self) -> Result<Vec<DeviceHandle>> {
        let mut nodes = v4l::context::enum_devices();
        nodes.sort_by_key(|n| n.index());

        let mut devices: Vec<DeviceHandle> = Vec::new();
        for node in nodes {
            let Some(mut handle) = Self::inspect(node.path(), node.index()) else {
                continue;
            };
            // One physical device can expose several capture nodes
            if devices.iter().any(|d| d.id == handle.id) {
                handle.id = DeviceId::new(format!("{}#{}", handle.id, node.index()));
            }
            devices.push(handle);
        }
        Ok(devices)
    }

    #[instrument(skip(self, device), fields(device = %device.id))]
    fn open(&self, device: &DeviceHandle) -> Result<Box<dyn DeviceDriver>> {
        let path = device
            .path
            .clone()
            .ok_or_else(|| CaptureError::unavailable(device.id.as_str(), "no device node"))?;
        let dev = Device::with_path(&path).map_err(|e| CaptureError::unavailable(device.id.as_str(), e))?;
        let caps = dev
            .query_caps()
            .map_err(|e| CaptureError::unavailable(device.id.as_str(), e))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        let descriptions = dev.query_controls().unwrap_or_else(|e| {
            warn!("Control query failed on {}: {}", path.display(), e);
            Vec::new()
        });
        let boolean_controls = descriptions
            .iter()
            .map(|d| (d.id, d.typ == CtrlType::Boolean))
            .collect();

        Ok(Box::new(V4l2Driver {
            id: device.id.clone(),
            path,
            device: Arc::new(dev),
            boolean_controls,
            buffer_count: self.buffer_count,
            open_timeout: self.open_timeout,
            poll_timeout: self.poll_timeout,
            worker: None,
        }))
    }
}

/// An open V4L2 node
pub struct V4l2Driver {
    id: DeviceId,
    path: PathBuf,
    device: Arc<Device>,
    boolean_controls: HashMap<u32, bool>,
    buffer_count: u32,
    open_timeout: Duration,
    poll_timeout: Duration,
    worker: Option<(Arc<AtomicBool>, JoinHandle<()>)>,
}

impl V4l2Driver {
    fn io_err(&self, err: io::Error) -> CaptureError {
        if is_disconnect(&err) || !self.path.exists() {
            CaptureError::unavailable(self.id.as_str(), err)
        } else {
            CaptureError::Backend(format!("{}: {}", self.path.display(), err))
        }
    }

    fn frame_rates(&self, fourcc: FourCC, width: u32, height: u32) -> Vec<f32> {
        let intervals = match self.device.enum_frameintervals(fourcc, width, height) {
            Ok(intervals) => intervals,
            Err(e) => {
                debug!("No frame intervals for {} {}x{}: {}", fourcc, width, height, e);
                return Vec::new();
            }
        };

        let to_fps = |num: u32, den: u32| (num > 0 && den > 0).then(|| den as f32 / num as f32);
        let mut rates = Vec::new();
        for interval in intervals {
            match interval.interval {
                FrameIntervalEnum::Discrete(frac) => rates.extend(to_fps(frac.numerator, frac.denominator)),
                FrameIntervalEnum::Stepwise(step) => {
                    rates.extend(to_fps(step.min.numerator, step.min.denominator));
                    rates.extend(to_fps(step.max.numerator, step.max.denominator));
                }
            }
        }
        rates
    }

    fn control_info(desc: &Description) -> Option<ControlInfo> {
        let property = property_for(desc.id)?;
        if desc.flags.contains(CtrlFlags::DISABLED) {
            return None;
        }
        let kind = match desc.typ {
            CtrlType::Integer | CtrlType::Integer64 => PropertyKind::Ranged {
                min: desc.minimum,
                max: desc.maximum,
                step: desc.step,
                default: desc.default,
            },
            CtrlType::Boolean => PropertyKind::Boolean,
            CtrlType::Menu | CtrlType::IntegerMenu => PropertyKind::Enumerated {
                options: desc
                    .items
                    .iter()
                    .flatten()
                    .map(|(index, item)| MenuOption {
                        value: *index as i64,
                        label: match item {
                            MenuItem::Name(name) => name.clone(),
                            MenuItem::Value(value) => value.to_string(),
                        },
                    })
                    .collect(),
            },
            _ => return None,
        };
        Some(ControlInfo {
            property,
            control_id: desc.id,
            kind,
            read_only: desc.flags.contains(CtrlFlags::READ_ONLY),
        })
    }
}

impl DeviceDriver for V4l2Driver {
    fn capabilities(&self) -> Result<Vec<FormatCapability>> {
        let formats = self.device.enum_formats().map_err(|e| self.io_err(e))?;

        let mut modes = Vec::new();
        for desc in formats {
            let Some(format) = PixelFormat::from_fourcc(&desc.fourcc.repr) else {
                debug!("Ignoring unsupported fourcc {}", desc.fourcc);
                continue;
            };
            let sizes = self.device.enum_framesizes(desc.fourcc).map_err(|e| self.io_err(e))?;
            for size in sizes {
                let dims: Vec<(u32, u32)> = match size.size {
                    FrameSizeEnum::Discrete(d) => vec![(d.width, d.height)],
                    FrameSizeEnum::Stepwise(s) => STEPWISE_SIZES
                        .iter()
                        .copied()
                        .filter(|&(w, h)| {
                            (s.min_width..=s.max_width).contains(&w)
                                && (s.min_height..=s.max_height).contains(&h)
                        })
                        .chain([(s.max_width, s.max_height)])
                        .collect(),
                };
                for (width, height) in dims {
                    for fps in self.frame_rates(desc.fourcc, width, height) {
                        let mode = FormatCapability::new(format, width, height, fps);
                        if !modes.contains(&mode) {
                            modes.push(mode);
                        }
                    }
                }
            }
        }
        Ok(modes)
    }

    fn controls(&self) -> Result<Vec<ControlInfo>> {
        let descriptions = self.device.query_controls().map_err(|e| self.io_err(e))?;
        Ok(descriptions.iter().filter_map(Self::control_info).collect())
    }

    fn control_active(&self, control_id: u32) -> Result<bool> {
        let descriptions = self.device.query_controls().map_err(|e| self.io_err(e))?;
        Ok(descriptions
            .iter()
            .find(|d| d.id == control_id)
            .map_or(false, |d| !d.flags.contains(CtrlFlags::INACTIVE)))
    }

    fn read_control(&self, control_id: u32) -> Result<i64> {
        let control = self.device.control(control_id).map_err(|e| self.io_err(e))?;
        match control.value {
            Value::Integer(v) => Ok(v),
            Value::Boolean(b) => Ok(b as i64),
            other => Err(CaptureError::Backend(format!(
                "control {control_id:#x} has non-scalar value {other:?}"
            ))),
        }
    }

    fn write_control(&self, control_id: u32, value: i64) -> Result<()> {
        let value = if self.boolean_controls.get(&control_id).copied().unwrap_or(false) {
            Value::Boolean(value != 0)
        } else {
            Value::Integer(value)
        };
        self.device
            .set_control(Control { id: control_id, value })
            .map_err(|e| self.io_err(e))
    }

    #[instrument(skip(self, callback), fields(device = %self.id))]
    fn start_stream(&mut self, mode: &FormatCapability, mut callback: FrameCallback) -> Result<()> {
        self.stop_stream()?;

        // Set format
        let mut fmt = self.device.format().map_err(|e| self.io_err(e))?;
        fmt.width = mode.width;
        fmt.height = mode.height;
        fmt.fourcc = FourCC::new(&mode.format.fourcc());
        let actual = self.device.set_format(&fmt).map_err(|e| self.io_err(e))?;
        if actual.width != mode.width || actual.height != mode.height || actual.fourcc != fmt.fourcc {
            return Err(CaptureError::UnsupportedFormat {
                requested: format!(
                    "{mode}, driver chose {} {}x{}",
                    actual.fourcc, actual.width, actual.height
                ),
            });
        }
        if let Err(e) = self.device.set_params(&Parameters::with_fps(mode.fps.round() as u32)) {
            warn!("Frame rate {} not applied: {}", mode.fps, e);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = flume::bounded::<io::Result<()>>(1);
        let device = Arc::clone(&self.device);
        let flag = Arc::clone(&stop);
        let buffer_count = self.buffer_count;
        let poll_timeout = self.poll_timeout;

        let handle = thread::Builder::new()
            .name(format!("camtap-v4l2-{}", self.id))
            .spawn(move || {
                let mut stream = match MmapStream::with_buffers(&device, Type::VideoCapture, buffer_count) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                stream.set_timeout(poll_timeout);
                let _ = ready_tx.send(Ok(()));

                while !flag.load(Ordering::Acquire) {
                    match CaptureStream::next(&mut stream) {
                        Ok((buf, meta)) => {
                            let used = (meta.bytesused as usize).min(buf.len());
                            if used == 0 {
                                callback(Delivery::Fault("empty buffer".into()));
                                continue;
                            }
                            callback(Delivery::Frame(RawFrame {
                                data: &buf[..used],
                                device_timestamp: Some(
                                    Duration::from_secs(meta.timestamp.sec as u64)
                                        + Duration::from_micros(meta.timestamp.usec as u64),
                                ),
                            }));
                        }
                        Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                        Err(e) if is_disconnect(&e) => {
                            callback(Delivery::Disconnected);
                            break;
                        }
                        Err(e) => {
                            callback(Delivery::Fault(e.to_string()));
                            thread::sleep(poll_timeout / 10);
                        }
                    }
                }
                // Dropping the stream turns streaming off and unmaps buffers
            })
            .map_err(|e| CaptureError::Backend(format!("failed to spawn capture thread: {e}")))?;

        let started = match ready_rx.recv_timeout(self.open_timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.io_err(e)),
            Err(_) => Err(CaptureError::unavailable(
                self.id.as_str(),
                format!("stream did not start within {:?}", self.open_timeout),
            )),
        };
        if let Err(err) = started {
            stop.store(true, Ordering::Release);
            let _ = handle.join();
            return Err(err);
        }

        self.worker = Some((stop, handle));
        info!("Capture stream started with {} buffers", buffer_count);
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<()> {
        if let Some((stop, handle)) = self.worker.take() {
            stop.store(true, Ordering::Release);
            if handle.join().is_err() {
                warn!(device = %self.id, "capture thread panicked");
            }
            debug!(device = %self.id, "capture stream stopped");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.path.exists()
    }
}

impl Drop for V4l2Driver {
    fn drop(&mut self) {
        let _ = self.stop_stream();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_ids_map_to_properties() {
        assert_eq!(property_for(0x0098_0900), Some(Property::Brightness));
        assert_eq!(property_for(0x0098_091b), Some(Property::Sharpness));
        assert_eq!(property_for(0x009a_0902), Some(Property::Exposure));
        assert_eq!(property_for(0x0098_0901 + 100), None);
    }

    #[test]
    fn every_property_has_a_v4l2_control() {
        for p in Property::ALL {
            assert!(CONTROL_MAP.iter().any(|(_, q)| *q == p), "{p} unmapped");
        }
    }

    #[test]
    fn enodev_is_a_disconnect() {
        assert!(is_disconnect(&io::Error::from_raw_os_error(libc::ENODEV)));
        assert!(!is_disconnect(&io::Error::from_raw_os_error(libc::EINVAL)));
    }
}
