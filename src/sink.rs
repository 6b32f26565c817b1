//! Consumers of published scan data.
//!
//! A [`DataSink`] persists points (file writers live outside this crate); a
//! [`ScanObserver`] is notified of every published point and status change
//! and can not fail the scan. [`MemorySink`] and [`BroadcastObserver`] are the
//! in-process implementations used by the CLI and by tests.

use crate::data_point::ScanDataPoint;
use crate::status::ScanStatus;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Destination for published points.
///
/// # Contract
/// - `write` is called once per point, in point order, from a single task
/// - `complete_collection` is called once when the pipeline shuts down
#[async_trait]
pub trait DataSink: Send + Sync {
    /// Persist one point
    async fn write(&self, point: &ScanDataPoint) -> Result<()>;

    /// Identifier of the output currently being written (e.g. a file path)
    fn current_output_identifier(&self) -> Option<String>;

    /// Flush and close
    async fn complete_collection(&self) -> Result<()>;
}

/// Something that happened during a scan.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    /// A point was published
    Point {
        /// The published point
        point: Arc<ScanDataPoint>,
    },
    /// The scan status changed
    Status {
        /// New status
        status: ScanStatus,
    },
}

/// Fire-and-forget listener for scan events.
pub trait ScanObserver: Send + Sync {
    /// Handle one event; must not block
    fn notify(&self, event: &ScanEvent);
}

/// Sink that keeps every point in memory.
#[derive(Debug)]
pub struct MemorySink {
    identifier: String,
    points: Mutex<Vec<ScanDataPoint>>,
    completed: AtomicBool,
}

impl MemorySink {
    /// Create an empty sink reporting `identifier` as its output.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            points: Mutex::new(Vec::new()),
            completed: AtomicBool::new(false),
        }
    }

    /// Copy of every point written so far
    #[must_use]
    pub fn points(&self) -> Vec<ScanDataPoint> {
        self.points.lock().clone()
    }

    /// Number of points written
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.lock().len()
    }

    /// True if nothing has been written
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.lock().is_empty()
    }

    /// Whether `complete_collection` has been called
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl DataSink for MemorySink {
    async fn write(&self, point: &ScanDataPoint) -> Result<()> {
        if self.is_completed() {
            anyhow::bail!("sink '{}' is already closed", self.identifier);
        }
        self.points.lock().push(point.clone());
        Ok(())
    }

    fn current_output_identifier(&self) -> Option<String> {
        Some(self.identifier.clone())
    }

    async fn complete_collection(&self) -> Result<()> {
        self.completed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Observer that re-broadcasts events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastObserver {
    tx: broadcast::Sender<ScanEvent>,
}

impl BroadcastObserver {
    /// Create an observer buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive events from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastObserver {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl ScanObserver for BroadcastObserver {
    fn notify(&self, event: &ScanEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn point(index: usize) -> ScanDataPoint {
        ScanDataPoint {
            index,
            total_points: 2,
            scan_id: Uuid::new_v4(),
            command: "scan x 0 1 1".to_string(),
            step_ids: Vec::new(),
            dimensions: vec![2],
            scannables: Vec::new(),
            detectors: Vec::new(),
            output_identifier: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn memory_sink_rejects_writes_after_completion() {
        let sink = MemorySink::new("run-1");
        sink.write(&point(0)).await.unwrap();
        sink.complete_collection().await.unwrap();

        assert!(sink.write(&point(1)).await.is_err());
        assert_eq!(sink.len(), 1);
        assert!(sink.is_completed());
        assert_eq!(sink.current_output_identifier().as_deref(), Some("run-1"));
    }

    #[tokio::test]
    async fn broadcast_observer_fans_out() {
        let observer = BroadcastObserver::default();
        let mut first = observer.subscribe();
        let mut second = observer.subscribe();

        observer.notify(&ScanEvent::Status { status: ScanStatus::Running });

        for rx in [&mut first, &mut second] {
            match rx.recv().await.unwrap() {
                ScanEvent::Status { status } => assert_eq!(status, ScanStatus::Running),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(ScanEvent::Status { status: ScanStatus::Paused }).unwrap();
        assert_eq!(json["event"], "status");
        assert_eq!(json["status"], "paused");
    }
}
