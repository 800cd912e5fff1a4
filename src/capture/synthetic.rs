//! In-process virtual cameras.
//!
//! Each [`SyntheticCamera`] behaves like a UVC webcam: a fixed list of native
//! modes, a control table with device-side validation, and a delivery thread
//! that renders test-pattern frames. With [`Pacing::Manual`] no thread is
//! spawned and the owner drives deliveries with [`SyntheticCamera::emit_frame`]
//! and friends, standing in for the OS media thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tracing::{debug, info, warn};

use crate::capture::backend::{CaptureBackend, Delivery, DeviceDriver, FrameCallback, RawFrame};
use crate::capture::device::{DeviceHandle, DeviceId};
use crate::capture::format::FormatCapability;
use crate::capture::frame::PixelFormat;
use crate::control::{ControlInfo, MenuOption, Property, PropertyKind};
use crate::error::{CaptureError, Result};

const VENDOR_ID: u16 = 0x1d6b;
const PRODUCT_ID: u16 = 0x0102;

/// Who drives frame delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// A background thread delivers at the negotiated frame rate.
    Timed,
    /// Frames are delivered only when the owner calls `emit_*`.
    Manual,
}

#[derive(Debug, Clone)]
pub struct SyntheticControl {
    pub property: Property,
    pub kind: PropertyKind,
    pub read_only: bool,
    pub value: i64,
}

impl SyntheticControl {
    pub fn ranged(property: Property, min: i64, max: i64, step: u64, default: i64) -> Self {
        Self {
            property,
            kind: PropertyKind::Ranged {
                min,
                max,
                step,
                default,
            },
            read_only: false,
            value: default,
        }
    }

    pub fn boolean(property: Property, value: bool) -> Self {
        Self {
            property,
            kind: PropertyKind::Boolean,
            read_only: false,
            value: value as i64,
        }
    }

    pub fn menu(property: Property, options: &[(i64, &str)], value: i64) -> Self {
        Self {
            property,
            kind: PropertyKind::Enumerated {
                options: options
                    .iter()
                    .map(|(value, label)| MenuOption {
                        value: *value,
                        label: label.to_string(),
                    })
                    .collect(),
            },
            read_only: false,
            value,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Blueprint for a virtual camera.
#[derive(Debug, Clone)]
pub struct CameraSpec {
    pub id: String,
    pub name: String,
    pub modes: Vec<FormatCapability>,
    pub controls: Vec<SyntheticControl>,
    pub pacing: Pacing,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl CameraSpec {
    /// A typical USB webcam: MJPEG up to 1080p, raw YUYV only up to 480p.
    pub fn webcam(index: usize) -> Self {
        use PixelFormat::{Mjpeg, Yuyv};

        Self {
            id: format!("synthetic-{index}"),
            name: format!("Synthetic Camera {index}"),
            modes: vec![
                FormatCapability::new(Mjpeg, 1920, 1080, 30.0),
                FormatCapability::new(Mjpeg, 1280, 720, 30.0),
                FormatCapability::new(Mjpeg, 1280, 720, 15.0),
                FormatCapability::new(Mjpeg, 640, 480, 30.0),
                FormatCapability::new(Yuyv, 640, 480, 30.0),
                FormatCapability::new(Yuyv, 640, 480, 15.0),
                FormatCapability::new(Yuyv, 320, 240, 30.0),
            ],
            controls: vec![
                SyntheticControl::ranged(Property::Brightness, -64, 64, 1, 0),
                SyntheticControl::ranged(Property::Contrast, 0, 95, 1, 32),
                SyntheticControl::ranged(Property::Saturation, 0, 128, 1, 64),
                SyntheticControl::ranged(Property::Hue, -40, 40, 1, 0),
                SyntheticControl::ranged(Property::Sharpness, 0, 7, 1, 3),
                SyntheticControl::ranged(Property::Gamma, 72, 500, 1, 100),
                SyntheticControl::boolean(Property::AutoWhiteBalance, true),
                SyntheticControl::ranged(Property::WhiteBalance, 2800, 6500, 1, 4600),
                SyntheticControl::menu(
                    Property::AutoExposure,
                    &[(1, "Manual Mode"), (3, "Aperture Priority Mode")],
                    3,
                ),
                SyntheticControl::ranged(Property::Exposure, 3, 2047, 1, 250),
                SyntheticControl::menu(
                    Property::PowerLineFrequency,
                    &[(0, "Disabled"), (1, "50 Hz"), (2, "60 Hz")],
                    1,
                ),
                SyntheticControl::ranged(Property::BacklightCompensation, 0, 2, 1, 1),
            ],
            pacing: Pacing::Timed,
            vendor_id: VENDOR_ID,
            product_id: PRODUCT_ID,
        }
    }

    /// A camera whose only raw mode is 720p YUYV.
    pub fn hd_raw(index: usize) -> Self {
        let mut spec = Self::webcam(index);
        spec.name = format!("Synthetic HD Camera {index}");
        spec.modes = vec![
            FormatCapability::new(PixelFormat::Yuyv, 1280, 720, 30.0),
            FormatCapability::new(PixelFormat::Mjpeg, 1280, 720, 30.0),
        ];
        spec
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_usb_ids(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.vendor_id = vendor_id;
        self.product_id = product_id;
        self
    }
}

pub struct SyntheticCamera {
    handle: DeviceHandle,
    modes: Vec<FormatCapability>,
    controls: Vec<ControlInfo>,
    values: Mutex<HashMap<u32, i64>>,
    pacing: Pacing,
    connected: AtomicBool,
    /// Installed callback; emissions hold this lock while delivering
    delivery: Mutex<Option<FrameCallback>>,
    active_mode: Mutex<Option<FormatCapability>>,
    jpeg_cache: Mutex<Option<(FormatCapability, Arc<Vec<u8>>)>>,
    rendered: AtomicU64,
    deliveries: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SyntheticCamera {
    fn new(spec: CameraSpec) -> Self {
        let mut values = HashMap::new();
        let controls = spec
            .controls
            .into_iter()
            .enumerate()
            .map(|(i, control)| {
                let control_id = i as u32 + 1;
                values.insert(control_id, control.value);
                ControlInfo {
                    property: control.property,
                    control_id,
                    kind: control.kind,
                    read_only: control.read_only,
                }
            })
            .collect();

        Self {
            handle: DeviceHandle::new(spec.id, spec.name).with_usb_ids(spec.vendor_id, spec.product_id),
            modes: spec.modes,
            controls,
            values: Mutex::new(values),
            pacing: spec.pacing,
            connected: AtomicBool::new(true),
            delivery: Mutex::new(None),
            active_mode: Mutex::new(None),
            jpeg_cache: Mutex::new(None),
            rendered: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.handle.id
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_streaming(&self) -> bool {
        lock(&self.delivery).is_some()
    }

    /// Number of times a callback has been invoked on this camera.
    pub fn deliveries(&self) -> u64 {
        self.deliveries.load(Ordering::Relaxed)
    }

    /// The device-side value of a control, bypassing the capture core.
    pub fn control_value(&self, property: Property) -> Option<i64> {
        let info = self.controls.iter().find(|c| c.property == property)?;
        lock(&self.values).get(&info.control_id).copied()
    }

    /// Render and deliver one frame of the active mode. Returns whether a
    /// callback was invoked.
    pub fn emit_frame(&self) -> bool {
        let Some(mode) = *lock(&self.active_mode) else {
            return false;
        };
        let n = self.rendered.fetch_add(1, Ordering::Relaxed);
        let data = self.render(&mode, n);
        self.deliver(Delivery::Frame(RawFrame {
            data: &data,
            device_timestamp: Some(Duration::from_micros(n * 1_000_000 / mode.fps.max(1.0) as u64)),
        }))
    }

    /// Deliver arbitrary bytes as if the driver produced them.
    pub fn emit_raw(&self, data: &[u8]) -> bool {
        self.deliver(Delivery::Frame(RawFrame {
            data,
            device_timestamp: None,
        }))
    }

    pub fn emit_fault(&self, reason: &str) -> bool {
        self.deliver(Delivery::Fault(reason.to_string()))
    }

    /// Simulate the cable being pulled.
    pub fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(device = %self.handle.id, "synthetic camera unplugged");
        let mut delivery = lock(&self.delivery);
        if let Some(callback) = delivery.as_mut() {
            self.deliveries.fetch_add(1, Ordering::Relaxed);
            callback(Delivery::Disconnected);
        }
    }

    fn deliver(&self, event: Delivery<'_>) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mut delivery = lock(&self.delivery);
        match delivery.as_mut() {
            Some(callback) => {
                self.deliveries.fetch_add(1, Ordering::Relaxed);
                callback(event);
                true
            }
            None => false,
        }
    }

    fn render(&self, mode: &FormatCapability, n: u64) -> Vec<u8> {
        let (w, h) = (mode.width as usize, mode.height as usize);
        let shade = |x: usize| ((x * 255 / w.max(1)) as u64 + n) as u8;

        match mode.format {
            PixelFormat::Yuyv | PixelFormat::Uyvy => {
                let mut data = Vec::with_capacity(w * h * 2);
                for _ in 0..h {
                    for x in (0..w).step_by(2) {
                        let y = shade(x);
                        if mode.format == PixelFormat::Yuyv {
                            data.extend_from_slice(&[y, 128, y, 128]);
                        } else {
                            data.extend_from_slice(&[128, y, 128, y]);
                        }
                    }
                }
                data
            }
            PixelFormat::Nv12 | PixelFormat::Yv12 => {
                let mut data = Vec::with_capacity(w * h * 3 / 2);
                for _ in 0..h {
                    data.extend((0..w).map(shade));
                }
                data.resize(w * h * 3 / 2, 128);
                data
            }
            PixelFormat::Rgb24 => rgb_pattern(w, h, n),
            PixelFormat::Mjpeg => self.jpeg(mode).as_ref().clone(),
        }
    }

    fn jpeg(&self, mode: &FormatCapability) -> Arc<Vec<u8>> {
        let mut cache = lock(&self.jpeg_cache);
        if let Some((cached_mode, data)) = cache.as_ref() {
            if cached_mode == mode {
                return Arc::clone(data);
            }
        }

        let (w, h) = (mode.width, mode.height);
        let rgb = rgb_pattern(w as usize, h as usize, 0);
        let mut out = Vec::new();
        // An empty buffer is dropped downstream as a malformed frame
        if let Err(err) = JpegEncoder::new_with_quality(&mut out, 75).encode(&rgb, w, h, ExtendedColorType::Rgb8) {
            debug!("synthetic jpeg encode failed: {err}");
            out.clear();
        }
        let data = Arc::new(out);
        *cache = Some((*mode, Arc::clone(&data)));
        data
    }

    fn check_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(CaptureError::unavailable(self.handle.id.as_str(), "device unplugged"))
        }
    }

    fn control(&self, control_id: u32) -> Result<&ControlInfo> {
        self.controls
            .iter()
            .find(|c| c.control_id == control_id)
            .ok_or_else(|| CaptureError::Backend(format!("no control with id {control_id}")))
    }
}

fn rgb_pattern(w: usize, h: usize, n: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(w * h * 3);
    for y in 0..h {
        for x in 0..w {
            data.extend_from_slice(&[
                (x * 255 / w.max(1)) as u8,
                (y * 255 / h.max(1)) as u8,
                n as u8,
            ]);
        }
    }
    data
}

/// Driver view of a synthetic camera.
pub struct SyntheticDriver {
    camera: Arc<SyntheticCamera>,
    pump: Option<(Arc<AtomicBool>, JoinHandle<()>)>,
}

impl DeviceDriver for SyntheticDriver {
    fn capabilities(&self) -> Result<Vec<FormatCapability>> {
        self.camera.check_connected()?;
        Ok(self.camera.modes.clone())
    }

    fn controls(&self) -> Result<Vec<ControlInfo>> {
        self.camera.check_connected()?;
        Ok(self.camera.controls.clone())
    }

    fn control_active(&self, control_id: u32) -> Result<bool> {
        self.camera.check_connected()?;
        let active = match self.camera.control(control_id)?.property {
            Property::WhiteBalance => self.camera.control_value(Property::AutoWhiteBalance) != Some(1),
            Property::Exposure => self.camera.control_value(Property::AutoExposure).map_or(true, |mode| mode == 1),
            _ => true,
        };
        Ok(active)
    }

    fn read_control(&self, control_id: u32) -> Result<i64> {
        self.camera.check_connected()?;
        self.camera.control(control_id)?;
        Ok(lock(&self.camera.values).get(&control_id).copied().unwrap_or_default())
    }

    fn write_control(&self, control_id: u32, value: i64) -> Result<()> {
        self.camera.check_connected()?;
        let info = self.camera.control(control_id)?;
        let (min, max) = info.kind.bounds();
        if info.read_only || (value as f64) < min || (value as f64) > max {
            return Err(CaptureError::Backend(format!(
                "device rejected value {value} for {}",
                info.property
            )));
        }
        lock(&self.camera.values).insert(control_id, value);
        Ok(())
    }

    fn start_stream(&mut self, mode: &FormatCapability, callback: FrameCallback) -> Result<()> {
        self.camera.check_connected()?;
        if !self.camera.modes.contains(mode) {
            return Err(CaptureError::UnsupportedFormat {
                requested: mode.to_string(),
            });
        }
        self.stop_stream()?;

        *lock(&self.camera.delivery) = Some(callback);
        *lock(&self.camera.active_mode) = Some(*mode);

        if self.camera.pacing == Pacing::Timed {
            let stop = Arc::new(AtomicBool::new(false));
            let camera = Arc::clone(&self.camera);
            let period = Duration::from_secs_f32(1.0 / mode.fps);
            let flag = Arc::clone(&stop);
            let handle = thread::Builder::new()
                .name(format!("synthetic-{}", camera.handle.id))
                .spawn(move || {
                    while !flag.load(Ordering::Acquire) && camera.is_connected() {
                        camera.emit_frame();
                        thread::sleep(period);
                    }
                })
                .map_err(|e| CaptureError::Backend(format!("failed to spawn delivery thread: {e}")))?;
            self.pump = Some((stop, handle));
        }

        debug!(device = %self.camera.handle.id, %mode, "synthetic stream on");
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<()> {
        if let Some((stop, handle)) = self.pump.take() {
            stop.store(true, Ordering::Release);
            let _ = handle.join();
        }
        // Waits for an in-flight manual emission, then drops the callback
        lock(&self.camera.delivery).take();
        lock(&self.camera.active_mode).take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.camera.is_connected()
    }
}

impl Drop for SyntheticDriver {
    fn drop(&mut self) {
        let _ = self.stop_stream();
    }
}

/// Backend exposing a mutable set of virtual cameras.
#[derive(Default)]
pub struct SyntheticBackend {
    cameras: Mutex<Vec<Arc<SyntheticCamera>>>,
}

impl SyntheticBackend {
    /// A backend with no cameras attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend with `count` timed webcams.
    pub fn with_webcams(count: usize) -> Self {
        let backend = Self::new();
        for index in 0..count {
            backend.plug(CameraSpec::webcam(index));
        }
        backend
    }

    /// Attach a camera; it shows up on the next enumeration. Modes without
    /// a positive, finite frame rate are not offered.
    pub fn plug(&self, mut spec: CameraSpec) -> Arc<SyntheticCamera> {
        spec.modes.retain(|mode| {
            let usable = mode.fps.is_finite() && mode.fps > 0.0;
            if !usable {
                warn!(device = %spec.id, %mode, "dropping mode without a usable frame rate");
            }
            usable
        });
        let camera = Arc::new(SyntheticCamera::new(spec));
        lock(&self.cameras).push(Arc::clone(&camera));
        camera
    }

    /// Detach a camera: it disappears from enumeration and any open driver
    /// sees it as disconnected.
    pub fn unplug(&self, id: &DeviceId) -> bool {
        let removed: Vec<_> = {
            let mut cameras = lock(&self.cameras);
            let (gone, kept): (Vec<_>, Vec<_>) = cameras.drain(..).partition(|c| c.id() == id);
            *cameras = kept;
            gone
        };
        for camera in &removed {
            camera.disconnect();
        }
        !removed.is_empty()
    }

    pub fn camera(&self, id: &DeviceId) -> Option<Arc<SyntheticCamera>> {
        lock(&self.cameras).iter().find(|c| c.id() == id).cloned()
    }
}

impl CaptureBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn enumerate(&self) -> Result<Vec<DeviceHandle>> {
        Ok(lock(&self.cameras)
            .iter()
            .filter(|c| c.is_connected())
            .map(|c| c.handle.clone())
            .collect())
    }

    fn open(&self, device: &DeviceHandle) -> Result<Box<dyn DeviceDriver>> {
        let camera = self
            .camera(&device.id)
            .filter(|c| c.is_connected())
            .ok_or_else(|| CaptureError::unavailable(device.id.as_str(), "no such device"))?;
        Ok(Box::new(SyntheticDriver { camera, pump: None }))
    }
}
