//! Lifecycle of one device's stream.
//!
//! ```text
//!   Closed ──configure──▶ Configuring ──started──▶ Streaming
//!     ▲                        │                      │
//!     │                  start failed              stop()
//!     └────────────────────────┘                      ▼
//!                                          Stopped(Requested)
//!
//!   any state ──device gone──▶ Stopped(Disconnected)   (terminal)
//! ```
//!
//! The driver thread only touches [`Shared`]: the frame buffer, a few
//! atomics, and the callback gate. Everything else is owned by the caller
//! side and mutated under `&mut self`. A [`FrameReader`] is a second handle
//! on `Shared`, so frames can be pulled while the session itself is busy
//! with a control round trip or a restart.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, instrument, trace, warn};

use crate::capture::backend::{CaptureBackend, Delivery, DeviceDriver, FrameCallback, RawFrame};
use crate::capture::device::{DeviceHandle, DeviceId};
use crate::capture::format::{negotiate, FormatCapability, StreamConfig};
use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::control::{PropertyDescriptor, PropertyTable};
use crate::error::{CaptureError, Result};
use crate::pipeline::{BufferStats, FrameBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Configuring,
    Streaming,
    Stopped(StopReason),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Closed => f.write_str("closed"),
            SessionState::Configuring => f.write_str("configuring"),
            SessionState::Streaming => f.write_str("streaming"),
            SessionState::Stopped(StopReason::Requested) => f.write_str("stopped"),
            SessionState::Stopped(StopReason::Disconnected) => f.write_str("disconnected"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub buffer: BufferStats,
    /// Deliveries the callback discarded: driver faults, malformed frames
    /// and frames that raced a `stop`
    pub faults: usize,
}

/// State shared with the driver's delivery thread.
struct Shared {
    buffer: FrameBuffer,
    /// `true` while deliveries may be published. The callback only ever
    /// `try_read`s it; `stop` takes the write side to wait out an in-flight
    /// delivery.
    gate: RwLock<bool>,
    disconnected: AtomicBool,
    /// Mirrors `SessionState::Streaming` for readers without the session
    streaming: AtomicBool,
    sequence: AtomicU64,
    faults: AtomicUsize,
}

impl Shared {
    fn new() -> Self {
        Self {
            buffer: FrameBuffer::new(),
            gate: RwLock::new(false),
            disconnected: AtomicBool::new(false),
            streaming: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            faults: AtomicUsize::new(0),
        }
    }

    fn set_gate(&self, open: bool) {
        let mut gate = self.gate.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *gate = open;
    }

    fn fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("camtap_frames_faulted_total").increment(1);
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    fn try_read(&self, device: &DeviceId) -> Result<Option<Frame>> {
        if self.is_disconnected() {
            return Err(CaptureError::unavailable(device.as_str(), "device disconnected"));
        }
        if !self.streaming.load(Ordering::Acquire) {
            return Err(CaptureError::NotConfigured {
                device: device.to_string(),
            });
        }
        Ok(self.buffer.try_read())
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            buffer: self.buffer.stats(),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}

/// Pull side of a session's frame buffer, usable without access to the
/// session. Only atomics are touched, so a read never waits on the driver.
#[derive(Clone)]
pub struct FrameReader {
    device: DeviceId,
    shared: Arc<Shared>,
}

impl FrameReader {
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Same contract as [`CaptureSession::try_read`], except that a
    /// disconnect is reported without moving the session's state.
    pub fn try_read(&self) -> Result<Option<Frame>> {
        self.shared.try_read(&self.device)
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.streaming.load(Ordering::Acquire) && !self.shared.is_disconnected()
    }

    pub fn is_disconnected(&self) -> bool {
        self.shared.is_disconnected()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats()
    }
}

impl fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameReader")
            .field("device", &self.device)
            .field("streaming", &self.is_streaming())
            .finish_non_exhaustive()
    }
}

pub struct CaptureSession {
    device: DeviceHandle,
    driver: Box<dyn DeviceDriver>,
    properties: PropertyTable,
    state: SessionState,
    config: Option<StreamConfig>,
    mode: Option<FormatCapability>,
    shared: Arc<Shared>,
}

impl fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSession")
            .field("device", &self.device.id)
            .field("state", &self.state)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl CaptureSession {
    /// Open `device` and discover its controls. The session starts `Closed`;
    /// properties are usable right away.
    #[instrument(skip(backend, device), fields(backend = backend.name(), device = %device.id))]
    pub fn open(backend: &dyn CaptureBackend, device: &DeviceHandle) -> Result<Self> {
        let driver = backend.open(device)?;
        let controls = driver.controls()?;
        let properties = PropertyTable::new(device.id.clone(), controls);
        info!("Opened {} with {} controls", device.name, properties.len());

        Ok(Self {
            device: device.clone(),
            driver,
            properties,
            state: SessionState::Closed,
            config: None,
            mode: None,
            shared: Arc::new(Shared::new()),
        })
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// Reports `Stopped(Disconnected)` as soon as the driver signalled it,
    /// even before the session has released the stream.
    pub fn state(&self) -> SessionState {
        if self.shared.is_disconnected() {
            SessionState::Stopped(StopReason::Disconnected)
        } else {
            self.state
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == SessionState::Streaming
    }

    pub fn reader(&self) -> FrameReader {
        FrameReader {
            device: self.device.id.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    /// The request the active stream was configured with.
    pub fn config(&self) -> Option<&StreamConfig> {
        self.config.as_ref()
    }

    /// The native mode the device is actually streaming.
    pub fn mode(&self) -> Option<&FormatCapability> {
        self.mode.as_ref()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats()
    }

    pub fn formats(&mut self) -> Result<Vec<FormatCapability>> {
        self.ensure_connected()?;
        let modes = self.driver.capabilities();
        self.observe(modes)
    }

    /// Negotiate `config` against the device and start streaming.
    #[instrument(skip(self), fields(device = %self.device.id))]
    pub fn configure(&mut self, config: StreamConfig) -> Result<FormatCapability> {
        self.ensure_connected()?;
        if matches!(self.state, SessionState::Streaming | SessionState::Configuring) {
            return Err(CaptureError::SessionActive {
                device: self.device.id.to_string(),
            });
        }
        config.validate()?;

        let modes = self.driver.capabilities();
        let modes = self.observe(modes)?;
        let mode = negotiate(&config, &modes).ok_or_else(|| CaptureError::UnsupportedFormat {
            requested: format!("{config} on {}", self.device.name),
        })?;
        debug!(%mode, "negotiated");

        let previous = self.state;
        self.state = SessionState::Configuring;
        self.shared.buffer.clear();
        self.shared.set_gate(true);

        let callback = frame_callback(Arc::clone(&self.shared), mode);
        if let Err(err) = self.driver.start_stream(&mode, callback) {
            self.shared.set_gate(false);
            self.state = previous;
            return Err(self.observe_err(err));
        }

        self.state = SessionState::Streaming;
        self.shared.streaming.store(true, Ordering::Release);
        self.config = Some(config);
        self.mode = Some(mode);
        metrics::counter!("camtap_streams_started_total").increment(1);
        info!(%mode, "Streaming {}", self.device.name);
        Ok(mode)
    }

    /// Halt delivery. After this returns the callback will not run again.
    #[instrument(skip(self), fields(device = %self.device.id))]
    pub fn stop(&mut self) -> Result<()> {
        if self.shared.is_disconnected() {
            self.mark_disconnected();
            return Ok(());
        }
        if !matches!(self.state, SessionState::Streaming | SessionState::Configuring) {
            return Ok(());
        }
        self.halt();
        self.state = SessionState::Stopped(StopReason::Requested);
        info!("Stopped {}", self.device.name);
        Ok(())
    }

    /// Non-blocking pull of the latest frame. `Ok(None)` means no new frame
    /// arrived since the last pull.
    pub fn try_read(&mut self) -> Result<Option<Frame>> {
        if self.shared.is_disconnected() {
            self.mark_disconnected();
        }
        self.shared.try_read(&self.device.id)
    }

    pub fn get_property(&mut self, name: &str) -> Result<f64> {
        self.ensure_connected()?;
        let value = self.properties.get(self.driver.as_ref(), name);
        self.observe(value)
    }

    pub fn describe_property(&mut self, name: &str) -> Result<PropertyDescriptor> {
        self.ensure_connected()?;
        let descriptor = self.properties.describe(self.driver.as_ref(), name);
        self.observe(descriptor)
    }

    pub fn properties(&mut self) -> Result<Vec<PropertyDescriptor>> {
        self.ensure_connected()?;
        let all = self.properties.describe_all(self.driver.as_ref());
        self.observe(all)
    }

    pub fn set_property(&mut self, name: &str, value: f64) -> Result<()> {
        self.ensure_connected()?;
        let written = self.properties.set(self.driver.as_ref(), name, value);
        self.observe(written)
    }

    /// Move to the terminal disconnected state, releasing the stream.
    pub fn mark_disconnected(&mut self) {
        if self.state == SessionState::Stopped(StopReason::Disconnected) {
            return;
        }
        warn!(device = %self.device.id, "{} disconnected", self.device.name);
        self.shared.disconnected.store(true, Ordering::Release);
        self.halt();
        self.state = SessionState::Stopped(StopReason::Disconnected);
    }

    fn halt(&mut self) {
        self.shared.streaming.store(false, Ordering::Release);
        self.shared.set_gate(false);
        if let Err(err) = self.driver.stop_stream() {
            warn!(device = %self.device.id, "driver stop failed: {err}");
        }
        self.shared.buffer.clear();
    }

    fn ensure_connected(&mut self) -> Result<()> {
        if self.state != SessionState::Stopped(StopReason::Disconnected)
            && (self.shared.is_disconnected() || !self.driver.is_connected())
        {
            self.mark_disconnected();
        }
        if self.state == SessionState::Stopped(StopReason::Disconnected) {
            return Err(self.unavailable());
        }
        Ok(())
    }

    /// Route a driver result through the disconnect transition.
    fn observe<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|err| self.observe_err(err))
    }

    fn observe_err(&mut self, err: CaptureError) -> CaptureError {
        if err.is_unavailable() {
            self.mark_disconnected();
        }
        err
    }

    fn unavailable(&self) -> CaptureError {
        CaptureError::unavailable(self.device.id.as_str(), "device disconnected")
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Build the callback the driver invokes for every delivery.
///
/// Runs on the driver's thread: it must not block, so the gate is only
/// `try_read` and anything unexpected drops the frame.
fn frame_callback(shared: Arc<Shared>, mode: FormatCapability) -> FrameCallback {
    let expected_len = mode.format.frame_len(mode.width, mode.height);

    Box::new(move |delivery: Delivery<'_>| {
        let Ok(gate) = shared.gate.try_read() else {
            shared.fault();
            return;
        };
        if !*gate {
            return;
        }

        match delivery {
            Delivery::Frame(raw) => match payload(&raw, mode.format, expected_len) {
                Some(bytes) => {
                    let sequence = shared.sequence.fetch_add(1, Ordering::Relaxed) + 1;
                    let frame = Frame {
                        data: Bytes::copy_from_slice(bytes),
                        meta: Arc::new(FrameMetadata {
                            sequence,
                            width: mode.width,
                            height: mode.height,
                            format: mode.format,
                            device_timestamp: raw.device_timestamp,
                        }),
                        timestamp: Instant::now(),
                    };
                    shared.buffer.publish(frame);
                    metrics::counter!("camtap_frames_published_total").increment(1);
                }
                None => {
                    trace!(len = raw.data.len(), "malformed frame dropped");
                    shared.fault();
                }
            },
            Delivery::Fault(reason) => {
                trace!(%reason, "driver fault, frame dropped");
                shared.fault();
            }
            Delivery::Disconnected => {
                shared.disconnected.store(true, Ordering::Release);
            }
        }
    })
}

/// The publishable part of a raw delivery, or `None` if it is unusable.
fn payload<'a>(raw: &RawFrame<'a>, format: PixelFormat, expected_len: Option<usize>) -> Option<&'a [u8]> {
    match expected_len {
        // Drivers may hand over a larger buffer than the packed image
        Some(len) => raw.data.get(..len),
        None if format.is_compressed() => raw.data.starts_with(&[0xFF, 0xD8]).then_some(raw.data),
        None => (!raw.data.is_empty()).then_some(raw.data),
    }
}
