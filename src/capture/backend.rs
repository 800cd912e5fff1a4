//! Seam between the capture core and an OS media framework.
//!
//! A [`CaptureBackend`] enumerates devices and opens them into a
//! [`DeviceDriver`]. Once started, the driver delivers frames by invoking the
//! installed [`FrameCallback`] from a thread the core does not control.
//!
//! Driver contract:
//! - the callback may run concurrently with any consumer call;
//! - `stop_stream` returns only after the callback has returned for the last
//!   time, and the driver has dropped it;
//! - after a [`Delivery::Disconnected`] the driver delivers nothing else.

use std::time::Duration;

use crate::capture::device::DeviceHandle;
use crate::capture::format::FormatCapability;
use crate::control::ControlInfo;
use crate::error::Result;

/// A frame as handed over by the driver. The bytes are only borrowed for the
/// duration of the callback.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    pub data: &'a [u8],
    pub device_timestamp: Option<Duration>,
}

/// One event from the driver's delivery thread.
#[derive(Debug)]
pub enum Delivery<'a> {
    Frame(RawFrame<'a>),
    /// Transient per-frame failure (bad buffer, dequeue error, ...).
    Fault(String),
    /// The device went away; no further deliveries follow.
    Disconnected,
}

pub type FrameCallback = Box<dyn FnMut(Delivery<'_>) + Send + 'static>;

pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Currently attached capture devices. Empty when none are present.
    fn enumerate(&self) -> Result<Vec<DeviceHandle>>;

    /// Open a device for control access and streaming.
    fn open(&self, device: &DeviceHandle) -> Result<Box<dyn DeviceDriver>>;
}

pub trait DeviceDriver: Send {
    /// Native stream modes.
    fn capabilities(&self) -> Result<Vec<FormatCapability>>;

    /// Controls the device implements, mapped onto the property vocabulary.
    fn controls(&self) -> Result<Vec<ControlInfo>>;

    /// Whether a control accepts writes right now (e.g. manual exposure is
    /// inactive while auto exposure is on).
    fn control_active(&self, _control_id: u32) -> Result<bool> {
        Ok(true)
    }

    fn read_control(&self, control_id: u32) -> Result<i64>;

    fn write_control(&self, control_id: u32, value: i64) -> Result<()>;

    /// Start delivering frames of `mode` to `callback`.
    fn start_stream(&mut self, mode: &FormatCapability, callback: FrameCallback) -> Result<()>;

    /// Stop delivery. Idempotent.
    fn stop_stream(&mut self) -> Result<()>;

    /// Cheap liveness check used before control round trips.
    fn is_connected(&self) -> bool;
}
