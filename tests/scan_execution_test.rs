//! End-to-end scans over simulated devices: point counts, readout modes,
//! failures and the scan status outcome.

mod common;

use common::{config, detector, indices, motor};
use async_trait::async_trait;
use daq_scan::sim::{DeviceAction, EventLog, SimDetector};
use daq_scan::{scan_args, DataSink, DeviceHandle, MemorySink, Scan, ScanDataPoint, ScanError, ScanStatus};
use std::sync::Arc;
use std::time::Duration;

/// Memory sink that also records each write in the device event log.
struct LoggedSink {
    inner: MemorySink,
    log: EventLog,
}

#[async_trait]
impl DataSink for LoggedSink {
    async fn write(&self, point: &ScanDataPoint) -> anyhow::Result<()> {
        self.inner.write(point).await?;
        self.log.record("sink", DeviceAction::Hook("write"));
        Ok(())
    }

    fn current_output_identifier(&self) -> Option<String> {
        self.inner.current_output_identifier()
    }

    async fn complete_collection(&self) -> anyhow::Result<()> {
        self.inner.complete_collection().await
    }
}

#[tokio::test]
async fn nested_scan_publishes_product_of_dimensions() {
    let log = EventLog::new();
    let (_, x) = motor("x", 1, &log);
    let (_, y) = motor("y", 2, &log);
    let (_, z) = motor("z", 3, &log);
    let (det, det_handle) = detector("det", &log);
    let sink = Arc::new(MemorySink::default());

    let scan = Scan::builder()
        .args(scan_args![&x, 0, 2, 1, &y, 0, 1, 1, &z, 0.0, 0.3, 0.1, &det_handle])
        .config(config(false))
        .sink(sink.clone())
        .build()
        .await
        .unwrap();
    assert_eq!(scan.tree().dimensions(), vec![3, 2, 4]);

    let summary = scan.run().await.unwrap();

    assert_eq!(summary.status, ScanStatus::CompletedOkay);
    assert_eq!(summary.points_published, 24);
    let points = sink.points();
    assert_eq!(indices(&points), (0..24).collect::<Vec<_>>());
    assert!(points.iter().all(|p| p.dimensions == vec![3, 2, 4] && p.total_points == 24));
    assert_eq!(det.acquisition_count(), 24);
    assert!(sink.is_completed());

    // Point 13 = x step 1, y step 1, z step 1
    let step_ids: Vec<usize> = points[13].step_ids.iter().map(|s| s.as_ref().unwrap().index).collect();
    assert_eq!(step_ids, vec![1, 1, 1]);
    assert_eq!(log.count("z", &DeviceAction::Hook("at_scan_line_start")), 6);
}

#[tokio::test]
async fn synchronous_five_step_scan_reads_detector_before_publish() {
    let log = EventLog::new();
    let (_, a) = motor("a", 1, &log);
    let (det, det_handle) = detector("det", &log);
    let sink = Arc::new(MemorySink::default());

    let summary = Scan::builder()
        .args(scan_args![&a, 0, 4, 1, &det_handle, 0.002])
        .config(config(false))
        .sink(sink.clone())
        .build()
        .await
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.points_published, 5);
    let points = sink.points();
    assert_eq!(indices(&points), vec![0, 1, 2, 3, 4]);
    for (i, point) in points.iter().enumerate() {
        assert_eq!(point.detector("det").and_then(|v| v.as_f64()), Some((i + 1) as f64));
        assert_eq!(point.scannable("a").and_then(|v| v.as_f64()), Some(i as f64));
    }
    assert!(det.is_prepared() && det.collection_ended());
    assert_eq!(summary.command, "scan a 0 4 1 det 0.002");
}

#[tokio::test]
async fn concurrent_readout_waits_for_previous_readout_before_next_acquisition() {
    let log = EventLog::new();
    let (_, a) = motor("a", 1, &log);
    let det = Arc::new(
        SimDetector::new("det")
            .with_collection_time(0.002)
            .with_readout_delay(Duration::from_millis(20))
            .with_log(&log),
    );
    let sink = Arc::new(MemorySink::default());

    let summary = Scan::builder()
        .args(scan_args![&a, 0, 4, 1, DeviceHandle::detector(det.clone())])
        .config(config(true))
        .sink(sink.clone())
        .build()
        .await
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.points_published, 5);
    assert_eq!(indices(&sink.points()), vec![0, 1, 2, 3, 4]);

    // Every acquisition after the first starts only once the previous readout is done.
    let actions: Vec<DeviceAction> = log
        .actions_for("det")
        .into_iter()
        .filter(|a| matches!(a, DeviceAction::Collect | DeviceAction::ReadoutDone))
        .collect();
    let expected: Vec<DeviceAction> = (0..5)
        .flat_map(|_| [DeviceAction::Collect, DeviceAction::ReadoutDone])
        .collect();
    assert_eq!(actions, expected);
}

#[tokio::test]
async fn concurrent_deferred_values_publish_in_order() {
    let log = EventLog::new();
    let (_, a) = motor("a", 1, &log);
    let det = Arc::new(
        SimDetector::new("det")
            .with_collection_time(0.001)
            .with_random_deferred_delay(Duration::from_millis(30)),
    );
    let handle = DeviceHandle::detector(det.clone()).with_deferred_values(det);
    let sink = Arc::new(MemorySink::default());

    Scan::builder()
        .args(scan_args![&a, 0, 19, 1, handle])
        .config(config(true))
        .sink(sink.clone())
        .build()
        .await
        .unwrap()
        .run()
        .await
        .unwrap();

    let points = sink.points();
    assert_eq!(indices(&points), (0..20).collect::<Vec<_>>());
    let values: Vec<f64> = points.iter().filter_map(|p| p.detector("det")?.as_f64()).collect();
    assert_eq!(values, (1..=20).map(|v| v as f64).collect::<Vec<_>>());
}

#[tokio::test]
async fn concurrent_deferred_acquisition_waits_for_previous_point_to_be_written() {
    let log = EventLog::new();
    let (_, a) = motor("a", 1, &log);
    let det = Arc::new(
        SimDetector::new("det")
            .with_collection_time(0.002)
            .with_readout_delay(Duration::from_millis(40))
            .with_log(&log),
    );
    let handle = DeviceHandle::detector(det.clone()).with_deferred_values(det);
    let sink = Arc::new(LoggedSink {
        inner: MemorySink::default(),
        log: log.clone(),
    });

    let summary = Scan::builder()
        .args(scan_args![&a, 0, 4, 1, handle])
        .config(config(true))
        .sink(sink.clone())
        .build()
        .await
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.points_published, 5);
    assert_eq!(indices(&sink.inner.points()), vec![0, 1, 2, 3, 4]);

    let order: Vec<&str> = log
        .events()
        .iter()
        .filter_map(|e| match (e.device.as_str(), &e.action) {
            ("det", DeviceAction::Collect) => Some("collect"),
            ("sink", DeviceAction::Hook("write")) => Some("write"),
            _ => None,
        })
        .collect();
    assert_eq!(order, ["collect", "write"].repeat(5));
}

#[tokio::test]
async fn detector_failure_stops_everything_and_is_returned_once() {
    let log = EventLog::new();
    let (x_motor, x) = motor("x", 1, &log);
    let det = Arc::new(SimDetector::new("det").with_collection_time(0.001).failing_readout_at(3).with_log(&log));
    let sink = Arc::new(MemorySink::default());

    let scan = Scan::builder()
        .args(scan_args![&x, 0, 9, 1, DeviceHandle::detector(det.clone())])
        .config(config(false))
        .sink(sink.clone())
        .build()
        .await
        .unwrap();
    let control = scan.control();

    let err = scan.run().await.unwrap_err();

    assert!(matches!(err, ScanError::Device { ref device, operation: "readout", .. } if device == "det"));
    assert_eq!(control.status(), ScanStatus::CompletedAfterFailure);
    assert_eq!(sink.len(), 2);
    assert!(sink.is_completed());
    assert_eq!(x_motor.stop_count(), 1);
    assert_eq!(det.stop_count(), 1);
    assert_eq!(log.count("x", &DeviceAction::Hook("at_command_failure")), 1);
    assert_eq!(log.count("det", &DeviceAction::Hook("at_command_failure")), 1);
    assert_eq!(log.count("x", &DeviceAction::Hook("at_scan_end")), 0);
}

#[tokio::test]
async fn deferred_failure_poisons_pipeline() {
    let log = EventLog::new();
    let (_, x) = motor("x", 1, &log);
    let det = Arc::new(SimDetector::new("det").with_collection_time(0.001).failing_readout_at(3));
    let handle = DeviceHandle::detector(det.clone()).with_deferred_values(det.clone());
    let sink = Arc::new(MemorySink::default());

    let err = Scan::builder()
        .args(scan_args![&x, 0, 9, 1, handle])
        .config(config(true))
        .sink(sink.clone())
        .build()
        .await
        .unwrap()
        .run()
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ScanError::Device {
            device: "det".to_string(),
            operation: "deferred value",
            message: "deferred readout of acquisition 3 failed".to_string(),
        }
    );
    // Points 0 and 1 made it; nothing after the failed point reached the sink.
    assert_eq!(indices(&sink.points()), vec![0, 1]);
    assert!(det.stop_count() >= 1);
}

#[tokio::test]
async fn motor_failure_fails_scan() {
    let log = EventLog::new();
    let motor = Arc::new(daq_scan::sim::SimMotor::new("x").with_speed(f64::INFINITY).failing_at(2.0));
    let (_, det) = detector("det", &log);

    let scan = Scan::builder()
        .args(scan_args![DeviceHandle::scannable(motor.clone()), 0, 4, 1, &det])
        .config(config(false))
        .build()
        .await
        .unwrap();

    let err = scan.run().await.unwrap_err();
    assert!(matches!(err, ScanError::Device { operation: "move_to", .. }));
    assert_eq!(motor.stop_count(), 1);
}

#[tokio::test]
async fn invalid_positions_rejected_at_build() {
    let motor = Arc::new(daq_scan::sim::SimMotor::new("x").with_limits(0.0, 2.0));
    let result = Scan::builder()
        .args(scan_args![DeviceHandle::scannable(motor.clone()), 0, 4, 1])
        .build()
        .await;

    assert!(matches!(result, Err(ScanError::Construction(_))));
    assert_eq!(motor.move_count(), 0);
}

#[tokio::test]
async fn returns_to_original_positions_when_configured() {
    let x = Arc::new(
        daq_scan::sim::SimMotor::new("x")
            .with_speed(f64::INFINITY)
            .with_position(7.5),
    );
    let mut config = config(false);
    config.scan.return_to_original_positions = true;

    Scan::builder()
        .args(scan_args![DeviceHandle::scannable(x.clone()), 0, 2, 1])
        .config(config)
        .build()
        .await
        .unwrap()
        .run()
        .await
        .unwrap();

    x.wait_idle().await;
    assert_eq!(x.current_position(), 7.5);
}
