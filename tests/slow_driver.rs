//! Frame pulls must not wait on driver work in flight, whether it is for
//! another device or for the device being read.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use camtap::capture::{
    CameraSpec, CaptureBackend, DeviceDriver, FormatCapability, FrameCallback, Pacing, SyntheticBackend,
};
use camtap::control::ControlInfo;
use camtap::{CaptureHub, CaptureSettings, DeviceHandle, DeviceId, Result};

const CONTROL_DELAY: Duration = Duration::from_millis(500);
const PULL_BUDGET: Duration = Duration::from_millis(100);

/// Synthetic cameras behind a driver whose control reads and stream
/// starts take `CONTROL_DELAY`, like a UVC device stuck in a slow
/// control transfer.
struct SluggishBackend {
    cameras: SyntheticBackend,
}

struct SluggishDriver {
    inner: Box<dyn DeviceDriver>,
}

impl CaptureBackend for SluggishBackend {
    fn name(&self) -> &'static str {
        "sluggish"
    }

    fn enumerate(&self) -> Result<Vec<DeviceHandle>> {
        self.cameras.enumerate()
    }

    fn open(&self, device: &DeviceHandle) -> Result<Box<dyn DeviceDriver>> {
        Ok(Box::new(SluggishDriver {
            inner: self.cameras.open(device)?,
        }))
    }
}

impl DeviceDriver for SluggishDriver {
    fn capabilities(&self) -> Result<Vec<FormatCapability>> {
        self.inner.capabilities()
    }

    fn controls(&self) -> Result<Vec<ControlInfo>> {
        self.inner.controls()
    }

    fn control_active(&self, control_id: u32) -> Result<bool> {
        self.inner.control_active(control_id)
    }

    fn read_control(&self, control_id: u32) -> Result<i64> {
        thread::sleep(CONTROL_DELAY);
        self.inner.read_control(control_id)
    }

    fn write_control(&self, control_id: u32, value: i64) -> Result<()> {
        self.inner.write_control(control_id, value)
    }

    fn start_stream(&mut self, mode: &FormatCapability, callback: FrameCallback) -> Result<()> {
        thread::sleep(CONTROL_DELAY);
        self.inner.start_stream(mode, callback)
    }

    fn stop_stream(&mut self) -> Result<()> {
        self.inner.stop_stream()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }
}

fn sluggish_hub(count: usize) -> (Arc<CaptureHub>, Vec<Arc<camtap::capture::SyntheticCamera>>) {
    let cameras = SyntheticBackend::new();
    let plugged = (0..count)
        .map(|index| cameras.plug(CameraSpec::webcam(index).with_pacing(Pacing::Manual)))
        .collect();
    let hub = CaptureHub::new(Arc::new(SluggishBackend { cameras }), CaptureSettings::default());
    (Arc::new(hub), plugged)
}

fn read_in_background(hub: &Arc<CaptureHub>, id: &DeviceId) -> thread::JoinHandle<Result<f64>> {
    let hub = Arc::clone(hub);
    let id = id.clone();
    thread::spawn(move || hub.get_property(&id, "brightness"))
}

#[test]
fn pull_is_not_held_up_by_another_device() {
    let (hub, cameras) = sluggish_hub(2);
    let (a, b) = (&cameras[0], &cameras[1]);
    hub.configure(a.id(), "mjpeg", 640, 480, 30.0).unwrap();
    a.emit_frame();

    let busy = read_in_background(&hub, b.id());
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    let frame = hub.pull_frame(a.id()).unwrap();
    let waited = started.elapsed();

    assert!(frame.is_some());
    assert!(waited < PULL_BUDGET, "pull_frame on {} waited {waited:?}", a.id());
    assert!(!busy.is_finished(), "control read on {} finished too early", b.id());
    assert_eq!(busy.join().unwrap().unwrap(), 0.0);
}

#[test]
fn pull_is_not_held_up_by_its_own_device() {
    let (hub, cameras) = sluggish_hub(1);
    let camera = &cameras[0];
    hub.configure(camera.id(), "yuyv", 320, 240, 30.0).unwrap();

    let busy = read_in_background(&hub, camera.id());
    thread::sleep(Duration::from_millis(100));
    camera.emit_frame();

    let started = Instant::now();
    let frame = hub.pull_frame(camera.id()).unwrap();
    assert!(started.elapsed() < PULL_BUDGET);
    assert_eq!(frame.map(|f| f.sequence()), Some(1));
    busy.join().unwrap().unwrap();
}

#[test]
fn pull_is_not_held_up_by_a_restart_elsewhere() {
    let (hub, cameras) = sluggish_hub(2);
    let (a, b) = (&cameras[0], &cameras[1]);
    hub.configure(a.id(), "mjpeg", 640, 480, 30.0).unwrap();

    let restarting = {
        let hub = Arc::clone(&hub);
        let id = b.id().clone();
        thread::spawn(move || hub.configure(&id, "mjpeg", 1280, 720, 30.0))
    };
    thread::sleep(Duration::from_millis(100));
    a.emit_frame();

    let started = Instant::now();
    assert!(hub.pull_frame(a.id()).unwrap().is_some());
    assert!(started.elapsed() < PULL_BUDGET);
    // The stream on B is not up yet, so B has nothing to pull
    assert!(hub.pull_frame(b.id()).is_err());
    restarting.join().unwrap().unwrap();
}
