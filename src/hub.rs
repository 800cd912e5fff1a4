//! Capture facade
//!
//! `CaptureHub` is the entry point for applications: it enumerates devices,
//! keeps one `CaptureSession` per opened device and routes every call to it
//! by `DeviceId`. Devices are opened on first use, so properties can be read
//! and written without ever starting a stream.
//!
//! Each device gets its own session lock. The hub-wide map lock is only held
//! to look up or swap entries, never across driver work, and `pull_frame`
//! goes through the session's `FrameReader` without taking the session lock
//! at all.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, instrument, warn};

use crate::capture::{
    CaptureBackend, CaptureSession, DeviceHandle, DeviceId, FormatCapability, Frame, FrameReader,
    PixelFormat, SessionState, SessionStats, StreamConfig,
};
use crate::control::PropertyDescriptor;
use crate::error::{CaptureError, Result};
use crate::{CaptureSettings, Config, CONFIG};

/// One opened device.
#[derive(Clone)]
struct Slot {
    session: Arc<Mutex<CaptureSession>>,
    reader: FrameReader,
}

impl Slot {
    fn new(session: CaptureSession) -> Self {
        Self {
            reader: session.reader(),
            session: Arc::new(Mutex::new(session)),
        }
    }

    fn is_stale(&self) -> bool {
        self.reader.is_disconnected()
    }
}

pub struct CaptureHub {
    backend: Arc<dyn CaptureBackend>,
    settings: CaptureSettings,
    /// Result of the most recent enumeration
    devices: Mutex<Vec<DeviceHandle>>,
    sessions: Mutex<HashMap<DeviceId, Slot>>,
    /// Serializes device opens so a device is never opened twice
    opening: Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CaptureHub {
    pub fn new(backend: Arc<dyn CaptureBackend>, settings: CaptureSettings) -> Self {
        info!("Capture hub using {} backend", backend.name());
        if !settings.vendor_ids.is_empty() {
            info!("Only devices from vendors {:04x?} are listed", settings.vendor_ids);
        }
        Self {
            backend,
            settings,
            devices: Mutex::new(Vec::new()),
            sessions: Mutex::new(HashMap::new()),
            opening: Mutex::new(()),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(config.backend()?, config.capture.clone()))
    }

    /// Build a hub from the process-wide configuration snapshot.
    pub fn from_global() -> Result<Self> {
        Self::from_config(&CONFIG.load())
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Enumerate attached devices, restricted to `capture.vendor_ids` when
    /// set. Sessions whose device is no longer listed are moved to
    /// `Stopped(Disconnected)`.
    #[instrument(skip(self), fields(backend = self.backend.name()))]
    pub fn list_devices(&self) -> Result<Vec<DeviceHandle>> {
        let devices = self.enumerate()?;
        let gone: Vec<Slot> = lock(&self.sessions)
            .iter()
            .filter(|(id, _)| !devices.iter().any(|d| &d.id == *id))
            .map(|(_, slot)| slot.clone())
            .collect();
        for slot in gone {
            lock(&slot.session).mark_disconnected();
        }
        debug!("{} capture device(s) attached", devices.len());
        Ok(devices)
    }

    pub fn formats(&self, device: &DeviceId) -> Result<Vec<FormatCapability>> {
        self.with_session(device, CaptureSession::formats)
    }

    /// Start streaming `format` (a tag such as `"mjpeg"` or `"raw"`) at the
    /// given resolution and rate. Resolution changes follow
    /// `capture.allow_resolution_change`.
    pub fn configure(
        &self,
        device: &DeviceId,
        format: &str,
        width: u32,
        height: u32,
        fps: f32,
    ) -> Result<FormatCapability> {
        let format: PixelFormat = format.parse()?;
        let config = StreamConfig::new(format, width, height, fps)
            .with_resolution_change(self.settings.allow_resolution_change);
        self.configure_with(device, config)
    }

    /// Start streaming with an explicit request, restarting any active
    /// stream on the device.
    #[instrument(skip(self, device), fields(device = %device))]
    pub fn configure_with(&self, device: &DeviceId, config: StreamConfig) -> Result<FormatCapability> {
        config.validate()?;
        self.with_session(device, |session| {
            session.stop()?;
            session.configure(config)
        })
    }

    /// Latest frame from the device's stream, `Ok(None)` if nothing new
    /// arrived since the previous pull. Never blocks on the device, nor on
    /// calls in flight for this or any other device.
    pub fn pull_frame(&self, device: &DeviceId) -> Result<Option<Frame>> {
        let slot = self.slot(device).ok_or_else(|| CaptureError::NotConfigured {
            device: device.to_string(),
        })?;
        let pulled = slot.reader.try_read();
        if pulled.as_ref().is_err_and(CaptureError::is_unavailable) {
            // Release the stream now unless another call holds the session
            if let Ok(mut session) = slot.session.try_lock() {
                session.mark_disconnected();
            }
        }
        pulled
    }

    pub fn get_property(&self, device: &DeviceId, name: &str) -> Result<f64> {
        self.with_session(device, |session| session.get_property(name))
    }

    pub fn set_property(&self, device: &DeviceId, name: &str, value: f64) -> Result<()> {
        self.with_session(device, |session| session.set_property(name, value))
    }

    pub fn describe_property(&self, device: &DeviceId, name: &str) -> Result<PropertyDescriptor> {
        self.with_session(device, |session| session.describe_property(name))
    }

    pub fn properties(&self, device: &DeviceId) -> Result<Vec<PropertyDescriptor>> {
        self.with_session(device, CaptureSession::properties)
    }

    /// Stop streaming; the device stays open. No-op if it is not streaming.
    pub fn stop(&self, device: &DeviceId) -> Result<()> {
        match self.slot(device) {
            Some(slot) => lock(&slot.session).stop(),
            None => Ok(()),
        }
    }

    /// Stop streaming and release the device.
    pub fn close(&self, device: &DeviceId) -> Result<()> {
        let removed = lock(&self.sessions).remove(device);
        if let Some(slot) = removed {
            lock(&slot.session).stop()?;
            info!("Closed {}", device);
        }
        Ok(())
    }

    /// `Closed` for devices without an open session.
    pub fn session_state(&self, device: &DeviceId) -> SessionState {
        self.slot(device)
            .map_or(SessionState::Closed, |slot| lock(&slot.session).state())
    }

    pub fn frame_stats(&self, device: &DeviceId) -> Option<SessionStats> {
        self.slot(device).map(|slot| slot.reader.stats())
    }

    fn slot(&self, device: &DeviceId) -> Option<Slot> {
        lock(&self.sessions).get(device).cloned()
    }

    /// Run `op` against the device's session, opening it first if needed.
    /// A session left disconnected is replaced when the device is back.
    fn with_session<T>(&self, device: &DeviceId, op: impl FnOnce(&mut CaptureSession) -> Result<T>) -> Result<T> {
        let slot = match self.slot(device) {
            Some(slot) if !slot.is_stale() => slot,
            _ => self.open(device)?,
        };
        let mut session = lock(&slot.session);
        op(&mut session)
    }

    /// Open `device` and install its session, replacing a disconnected one.
    fn open(&self, device: &DeviceId) -> Result<Slot> {
        let _opening = lock(&self.opening);

        let stale = match self.slot(device) {
            // Opened by a concurrent caller
            Some(slot) if !slot.is_stale() => return Ok(slot),
            Some(slot) => Some(slot),
            None => None,
        };
        let handle = match stale {
            Some(ref slot) => {
                // Finish the transition before the device is reopened
                lock(&slot.session).mark_disconnected();
                let handle = self.rediscover(device)?;
                debug!("Reopening {} after reconnect", device);
                handle
            }
            None => self.resolve(device)?,
        };

        let slot = Slot::new(CaptureSession::open(self.backend.as_ref(), &handle)?);
        let replaced = lock(&self.sessions).insert(device.clone(), slot.clone());
        drop(replaced);
        Ok(slot)
    }

    /// Backend enumeration with the vendor filter applied. Refreshes the
    /// cached device list.
    fn enumerate(&self) -> Result<Vec<DeviceHandle>> {
        let mut devices = self.backend.enumerate()?;
        devices.retain(|device| {
            let admitted = self.admits(device);
            if !admitted {
                debug!("Skipping {} from an unlisted vendor", device);
            }
            admitted
        });
        *lock(&self.devices) = devices.clone();
        Ok(devices)
    }

    fn admits(&self, device: &DeviceHandle) -> bool {
        let vendors = &self.settings.vendor_ids;
        vendors.is_empty() || device.vendor_id.is_some_and(|vendor| vendors.contains(&vendor))
    }

    /// Handle from the last enumeration, enumerating again if the device is
    /// not known yet.
    fn resolve(&self, device: &DeviceId) -> Result<DeviceHandle> {
        let known = lock(&self.devices).iter().find(|d| &d.id == device).cloned();
        match known {
            Some(handle) => Ok(handle),
            None => self.rediscover(device),
        }
    }

    fn rediscover(&self, device: &DeviceId) -> Result<DeviceHandle> {
        self.enumerate()?
            .into_iter()
            .find(|d| &d.id == device)
            .ok_or_else(|| CaptureError::unavailable(device.as_str(), "not attached"))
    }
}

impl Drop for CaptureHub {
    fn drop(&mut self) {
        let sessions = self.sessions.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        for (id, slot) in sessions.drain() {
            if let Err(e) = lock(&slot.session).stop() {
                warn!("Failed to stop {}: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CameraSpec, Pacing, SyntheticBackend};

    fn hub_with(backend: &Arc<SyntheticBackend>) -> CaptureHub {
        CaptureHub::new(backend.clone(), CaptureSettings::default())
    }

    #[test]
    fn pull_without_configure_is_not_configured() {
        let backend = Arc::new(SyntheticBackend::with_webcams(1));
        let hub = hub_with(&backend);
        let id = hub.list_devices().unwrap()[0].id.clone();
        assert!(matches!(hub.pull_frame(&id), Err(CaptureError::NotConfigured { .. })));
    }

    #[test]
    fn properties_open_device_on_demand() {
        let backend = Arc::new(SyntheticBackend::with_webcams(1));
        let hub = hub_with(&backend);
        let id = hub.list_devices().unwrap()[0].id.clone();

        assert_eq!(hub.session_state(&id), SessionState::Closed);
        assert_eq!(hub.get_property(&id, "Brightness").unwrap(), 0.0);
        assert!(hub.frame_stats(&id).is_some());
    }

    #[test]
    fn reconfigure_restarts_stream() {
        let backend = Arc::new(SyntheticBackend::new());
        let camera = backend.plug(CameraSpec::webcam(0).with_pacing(Pacing::Manual));
        let hub = hub_with(&backend);

        hub.configure(camera.id(), "mjpeg", 640, 480, 30.0).unwrap();
        camera.emit_frame();
        let mode = hub.configure(camera.id(), "raw", 640, 480, 15.0).unwrap();
        assert_eq!(mode.format, PixelFormat::Yuyv);
        assert_eq!(hub.session_state(camera.id()), SessionState::Streaming);
        // The stale MJPEG frame was discarded on restart
        assert!(hub.pull_frame(camera.id()).unwrap().is_none());
    }

    #[test]
    fn invalid_request_does_not_open_device() {
        let backend = Arc::new(SyntheticBackend::with_webcams(1));
        let hub = hub_with(&backend);
        let id = hub.list_devices().unwrap()[0].id.clone();

        let err = hub.configure(&id, "mjpeg", 0, 480, 30.0).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidConfig(_)));
        assert!(hub.frame_stats(&id).is_none());
    }

    #[test]
    fn unknown_device_is_unavailable() {
        let backend = Arc::new(SyntheticBackend::new());
        let hub = hub_with(&backend);
        let err = hub.get_property(&DeviceId::new("nope"), "brightness").unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn close_releases_session() {
        let backend = Arc::new(SyntheticBackend::new());
        let camera = backend.plug(CameraSpec::webcam(0).with_pacing(Pacing::Manual));
        let hub = hub_with(&backend);

        hub.configure(camera.id(), "mjpeg", 1280, 720, 30.0).unwrap();
        assert!(camera.is_streaming());
        hub.close(camera.id()).unwrap();
        assert!(!camera.is_streaming());
        assert_eq!(hub.session_state(camera.id()), SessionState::Closed);
        hub.close(camera.id()).unwrap();
    }
}
