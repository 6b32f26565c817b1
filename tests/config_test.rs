//! Loading and validating configuration files.

use daq_scan::{ScanConfig, ScanError};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn shipped_config_matches_defaults() {
    let config = ScanConfig::load_from("config/scan.toml").unwrap();
    assert_eq!(config, ScanConfig::default());
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = ScanConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.pipeline.queue_capacity, 3);
    assert!(!config.scan.return_to_original_positions);
}

#[test]
fn sections_override_independently() {
    let file = write_config(
        r#"
[motion]
busy_poll_interval_ms = 2
collection_time_tolerance = 0.05

[scan]
return_to_original_positions = true
"#,
    );

    let config = ScanConfig::load_from(file.path()).unwrap();
    assert_eq!(config.motion.busy_poll_interval_ms, 2);
    assert_eq!(config.motion.motion_poll_interval_ms, 50);
    assert!((config.motion.collection_time_tolerance - 0.05).abs() < f64::EPSILON);
    assert!(config.scan.return_to_original_positions);
    assert_eq!(config.pipeline, ScanConfig::default().pipeline);
}

#[test]
fn invalid_values_are_rejected() {
    for contents in [
        "[pipeline]\ndeferred_pool_size = 0",
        "[motion]\nbusy_poll_interval_ms = 0",
        "[application]\nlog_level = \"chatty\"",
        "[pipeline]\nqueue_capacity = \"many\"",
    ] {
        let file = write_config(contents);
        let err = ScanConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ScanError::Config(_)), "{contents}: {err}");
    }
}
