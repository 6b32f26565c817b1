//! Pause, resume, finish-early and abort requests against running scans.

mod common;

use common::{config, indices};
use daq_scan::sim::{SimDetector, SimMotor};
use daq_scan::{scan_args, BroadcastObserver, DeviceHandle, MemorySink, Scan, ScanEvent, ScanStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

/// A 1-D scan of `points` points taking roughly 20ms each.
async fn slow_scan(points: i32, concurrent: bool) -> (Scan, Arc<MemorySink>, Arc<SimMotor>, Arc<SimDetector>) {
    let motor = Arc::new(SimMotor::new("x").with_speed(100.0));
    let det = Arc::new(SimDetector::new("det").with_collection_time(0.01));
    let sink = Arc::new(MemorySink::default());
    let scan = Scan::builder()
        .args(scan_args![
            DeviceHandle::scannable(motor.clone()),
            0,
            points - 1,
            1,
            DeviceHandle::detector(det.clone())
        ])
        .config(config(concurrent))
        .sink(sink.clone())
        .build()
        .await
        .unwrap();
    (scan, sink, motor, det)
}

async fn wait_for_points(sink: &MemorySink, count: usize) {
    timeout(Duration::from_secs(10), async {
        while sink.len() < count {
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("scan did not publish in time");
}

#[tokio::test]
async fn pause_and_resume_keep_count_and_order() {
    let (scan, sink, _, _) = slow_scan(8, false).await;
    let control = scan.control();
    let running = tokio::spawn(scan.run());

    wait_for_points(&sink, 2).await;
    assert!(control.pause());
    assert!(!control.pause(), "pausing twice is a no-op");
    assert_eq!(control.status(), ScanStatus::Paused);

    // The point in progress may still complete; after that nothing moves.
    sleep(Duration::from_millis(100)).await;
    let while_paused = sink.len();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.len(), while_paused);
    assert!(while_paused < 8);

    assert!(control.resume());
    assert!(!control.resume(), "resuming twice is a no-op");

    let summary = running.await.unwrap().unwrap();
    assert_eq!(summary.status, ScanStatus::CompletedOkay);
    assert_eq!(indices(&sink.points()), (0..8).collect::<Vec<_>>());
}

#[tokio::test]
async fn finish_early_completes_current_point() {
    let (scan, sink, _, _) = slow_scan(50, true).await;
    let control = scan.control();
    let running = tokio::spawn(scan.run());

    wait_for_points(&sink, 3).await;
    control.request_finish_early();
    assert!(!control.pause(), "a scan finishing early cannot be paused");

    let summary = running.await.unwrap().unwrap();
    assert_eq!(summary.status, ScanStatus::CompletedEarly);
    assert!(summary.points_published < 50);
    assert_eq!(summary.points_discarded, 0);
    let points = sink.points();
    assert_eq!(indices(&points), (0..points.len()).collect::<Vec<_>>());
}

#[tokio::test]
async fn finish_early_while_paused() {
    let (scan, sink, _, _) = slow_scan(50, false).await;
    let control = scan.control();
    let running = tokio::spawn(scan.run());

    wait_for_points(&sink, 1).await;
    assert!(control.pause());
    control.request_finish_early();

    let summary = timeout(Duration::from_secs(10), running).await.unwrap().unwrap().unwrap();
    assert_eq!(summary.status, ScanStatus::CompletedEarly);
}

#[tokio::test]
async fn abort_stops_devices_and_completes_after_stop() {
    let (scan, sink, motor, det) = slow_scan(50, true).await;
    let control = scan.control();
    let running = tokio::spawn(scan.run());

    wait_for_points(&sink, 2).await;
    assert!(control.abort());

    let summary = timeout(Duration::from_secs(10), running).await.unwrap().unwrap().unwrap();
    assert_eq!(summary.status, ScanStatus::CompletedAfterStop);
    assert!(summary.points_published < 50);
    assert_eq!(motor.stop_count(), 1);
    assert_eq!(det.stop_count(), 1);
    assert!(sink.is_completed());
    assert!(!control.resume());
}

#[tokio::test]
async fn abort_paused_scan() {
    let (scan, sink, motor, _) = slow_scan(50, false).await;
    let control = scan.control();
    let running = tokio::spawn(scan.run());

    wait_for_points(&sink, 1).await;
    assert!(control.pause());
    assert_eq!(control.wait_for(ScanStatus::Paused).await, ScanStatus::Paused);
    assert!(control.abort());

    let summary = timeout(Duration::from_secs(10), running).await.unwrap().unwrap().unwrap();
    assert_eq!(summary.status, ScanStatus::CompletedAfterStop);
    assert_eq!(motor.stop_count(), 1);
}

#[tokio::test]
async fn pause_during_move_holds_the_point_until_resume() {
    let motor = Arc::new(SimMotor::new("x").with_speed(10.0));
    let sink = Arc::new(MemorySink::default());
    let scan = Scan::builder()
        .args(scan_args![DeviceHandle::scannable(motor.clone()), 0, 2, 1])
        .config(config(false))
        .sink(sink.clone())
        .build()
        .await
        .unwrap();
    let control = scan.control();
    let running = tokio::spawn(scan.run());

    wait_for_points(&sink, 1).await;
    // x is now on its 100ms move to 1.
    sleep(Duration::from_millis(20)).await;
    assert!(control.pause());

    sleep(Duration::from_millis(300)).await;
    assert_eq!(sink.len(), 1, "the point after the move waits for resume");
    assert_eq!(control.status(), ScanStatus::Paused);

    assert!(control.resume());
    let summary = timeout(Duration::from_secs(10), running).await.unwrap().unwrap().unwrap();
    assert_eq!(summary.status, ScanStatus::CompletedOkay);
    assert_eq!(indices(&sink.points()), vec![0, 1, 2]);
}

#[tokio::test]
async fn abort_while_waiting_for_a_deferred_value() {
    for concurrent in [false, true] {
        let motor = Arc::new(SimMotor::new("x").with_speed(f64::INFINITY));
        // The deferred value of every acquisition takes an hour.
        let det = Arc::new(
            SimDetector::new("det")
                .with_collection_time(0.001)
                .with_readout_delay(Duration::from_secs(3600)),
        );
        let handle = DeviceHandle::detector(det.clone()).with_deferred_values(det.clone());
        let sink = Arc::new(MemorySink::default());
        let scan = Scan::builder()
            .args(scan_args![DeviceHandle::scannable(motor.clone()), 0, 4, 1, handle])
            .config(config(concurrent))
            .sink(sink.clone())
            .build()
            .await
            .unwrap();
        let control = scan.control();
        let running = tokio::spawn(scan.run());

        sleep(Duration::from_millis(200)).await;
        assert!(sink.is_empty());
        assert!(control.abort());

        let summary = timeout(Duration::from_secs(3), running)
            .await
            .expect("abort should end a scan waiting on a point")
            .unwrap()
            .unwrap();
        assert_eq!(summary.status, ScanStatus::CompletedAfterStop, "concurrent = {concurrent}");
        assert_eq!(summary.points_published, 0);
        assert_eq!(summary.points_discarded, 1);
        assert_eq!(motor.stop_count(), 1);
        assert_eq!(det.stop_count(), 1);
        assert!(sink.is_completed());
    }
}

#[tokio::test]
async fn abort_before_start() {
    let (scan, sink, motor, _) = slow_scan(5, false).await;
    let control = scan.control();
    assert!(control.abort());

    let summary = scan.run().await.unwrap();
    assert_eq!(summary.status, ScanStatus::CompletedAfterStop);
    assert_eq!(summary.points_published, 0);
    assert!(sink.is_empty());
    assert_eq!(motor.move_count(), 0);
}

#[tokio::test]
async fn observers_see_status_changes_and_points() {
    let motor = Arc::new(SimMotor::new("x").with_speed(f64::INFINITY));
    let observer = Arc::new(BroadcastObserver::default());
    let mut events = observer.subscribe();

    Scan::builder()
        .args(scan_args![DeviceHandle::scannable(motor), 0, 2, 1])
        .config(config(false))
        .observer(observer.clone())
        .build()
        .await
        .unwrap()
        .run()
        .await
        .unwrap();

    let mut statuses = Vec::new();
    let mut points = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            ScanEvent::Status { status } => statuses.push(status),
            ScanEvent::Point { point } => points.push(point.index),
        }
    }
    assert_eq!(statuses, vec![ScanStatus::Running, ScanStatus::CompletedOkay]);
    assert_eq!(points, vec![0, 1, 2]);
}
