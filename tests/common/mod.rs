//! Shared helpers for the integration tests.
#![allow(dead_code)]

use daq_scan::sim::{EventLog, SimDetector, SimMotor};
use daq_scan::{DeviceHandle, ScanConfig, ScanDataPoint};
use std::sync::Arc;

/// A fast motor (100 units/s) recording into `log`.
pub fn motor(name: &str, level: i32, log: &EventLog) -> (Arc<SimMotor>, DeviceHandle) {
    let motor = Arc::new(SimMotor::new(name).with_level(level).with_speed(100.0).with_log(log));
    (motor.clone(), DeviceHandle::scannable(motor))
}

/// A detector with a 5ms exposure recording into `log`.
pub fn detector(name: &str, log: &EventLog) -> (Arc<SimDetector>, DeviceHandle) {
    let detector = Arc::new(SimDetector::new(name).with_collection_time(0.005).with_log(log));
    (detector.clone(), DeviceHandle::detector(detector))
}

/// Default configuration with fast polling.
pub fn config(concurrent: bool) -> ScanConfig {
    let mut config = ScanConfig::default();
    config.pipeline.concurrent_readout = concurrent;
    config.motion.busy_poll_interval_ms = 1;
    config.motion.motion_poll_interval_ms = 5;
    config.motion.pause_poll_interval_ms = 5;
    config
}

/// Point indices in publication order.
pub fn indices(points: &[ScanDataPoint]) -> Vec<usize> {
    points.iter().map(|p| p.index).collect()
}
