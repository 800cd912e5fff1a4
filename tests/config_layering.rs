use std::io::Write;

use camtap::{BackendKind, CaptureError, CaptureHub, Config};

fn settings_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn file_overrides_defaults() {
    let file = settings_file(
        r#"
backend = "synthetic"

[capture]
buffer_count = 6
allow_resolution_change = true

[stream]
format = "raw"
width = 640
height = 480
"#,
    );

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.backend, BackendKind::Synthetic);
    assert_eq!(config.capture.buffer_count, 6);
    assert!(config.capture.allow_resolution_change);
    // Untouched keys keep their defaults
    assert_eq!(config.capture.open_timeout_ms, 2000);
    assert_eq!(config.stream.fps, 30.0);
    assert_eq!((config.stream.width, config.stream.height), (640, 480));
}

#[test]
fn environment_overrides_file() {
    let file = settings_file(
        r#"
backend = "synthetic"

[capture]
vendor_ids = [0x2b93]

[synthetic]
devices = 2
"#,
    );

    std::env::set_var("CAMTAP_SYNTHETIC__DEVICES", "5");
    std::env::set_var("CAMTAP_CAPTURE__VENDOR_IDS", "7531,2830");
    let loaded = Config::load(Some(file.path()));
    std::env::remove_var("CAMTAP_SYNTHETIC__DEVICES");
    std::env::remove_var("CAMTAP_CAPTURE__VENDOR_IDS");

    let config = loaded.unwrap();
    assert_eq!(config.synthetic.devices, 5);
    // 0x1d6b, the synthetic cameras' vendor, and 0x0b0e
    assert_eq!(config.capture.vendor_ids, vec![0x1d6b, 0x0b0e]);
    let hub = CaptureHub::from_config(&config).unwrap();
    assert_eq!(hub.backend_name(), "synthetic");
    assert_eq!(hub.list_devices().unwrap().len(), 5);
}

#[test]
fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
    assert!(matches!(err, CaptureError::Settings(_)));
}

#[test]
fn invalid_values_are_rejected() {
    let file = settings_file("[capture]\nbuffer_count = 0\n");
    assert!(matches!(
        Config::load(Some(file.path())),
        Err(CaptureError::InvalidConfig(_))
    ));

    let file = settings_file("[stream]\nformat = \"theora\"\n");
    assert!(matches!(
        Config::load(Some(file.path())),
        Err(CaptureError::UnsupportedFormat { .. })
    ));

    let file = settings_file("backend = \"directshow\"\n");
    assert!(matches!(Config::load(Some(file.path())), Err(CaptureError::Settings(_))));
}
