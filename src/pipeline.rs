//! Data-point pipeline.
//!
//! Points enter through [`DataPointPipeline::submit`] and are published (sink
//! write, then observer notification) by a single consumer task, so
//! publication order is submission order. The queue between the two is
//! bounded; a full queue makes `submit` wait, which throttles the scan.
//!
//! Deferred field values are dispatched onto a semaphore-bounded worker pool
//! as soon as a point is submitted, so several points can resolve in
//! parallel while still being published one at a time.
//!
//! The first error seen while resolving, writing or notifying poisons the
//! pipeline: queued points are discarded, and every later `submit` or
//! `check` returns that same error.

use crate::config::PipelineConfig;
use crate::data_point::{DataField, FieldValue, PendingDataPoint, PendingField, ScanDataPoint};
use crate::error::{ScanError, ScanResult};
use crate::sink::{DataSink, ScanEvent, ScanObserver};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument};

/// How detector data is read and handed to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadoutMode {
    /// Detectors are read on the scan task and `submit` returns once the
    /// point has been published.
    Synchronous,
    /// Detectors are read by a background task per point while the scan
    /// moves on; `submit` returns once the point is queued, and the readout
    /// task waits for publication with `submit_and_wait`.
    Concurrent,
}

impl ReadoutMode {
    /// Mode selected by the pipeline configuration
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        if config.concurrent_readout {
            Self::Concurrent
        } else {
            Self::Synchronous
        }
    }
}

impl fmt::Display for ReadoutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Synchronous => f.write_str("synchronous"),
            Self::Concurrent => f.write_str("concurrent"),
        }
    }
}

struct PublishJob {
    point: PendingDataPoint,
    ack: Option<oneshot::Sender<ScanResult<()>>>,
}

struct Publisher {
    sink: Arc<dyn DataSink>,
    observers: Vec<Arc<dyn ScanObserver>>,
    failure: OnceLock<ScanError>,
    published: AtomicUsize,
    discarded: AtomicUsize,
}

impl Publisher {
    async fn publish(&self, point: PendingDataPoint) -> ScanResult<()> {
        let PendingDataPoint {
            index,
            total_points,
            scan_id,
            command,
            step_ids,
            dimensions,
            scannables,
            detectors,
        } = point;

        let scannables = resolve_fields(scannables).await?;
        let detectors = resolve_fields(detectors).await?;

        let mut point = ScanDataPoint {
            index,
            total_points,
            scan_id,
            command,
            step_ids,
            dimensions,
            scannables,
            detectors,
            output_identifier: None,
            timestamp: Utc::now(),
        };

        self.sink
            .write(&point)
            .await
            .map_err(|e| ScanError::Pipeline(format!("data sink rejected point {index}: {e:#}")))?;
        point.output_identifier = self.sink.current_output_identifier();

        let event = ScanEvent::Point {
            point: Arc::new(point),
        };
        for observer in &self.observers {
            observer.notify(&event);
        }

        self.published.fetch_add(1, Ordering::SeqCst);
        trace!(index, "Published scan data point");
        Ok(())
    }

    /// Record `err` unless an earlier error is already stored; returns the stored error.
    fn poison(&self, err: ScanError) -> ScanError {
        if self.failure.set(err.clone()).is_ok() {
            error!(error = %err, "Scan data pipeline failed; no further points will be published");
        }
        self.failure.get().cloned().unwrap_or(err)
    }

    fn discard(&self, count: usize, reason: &str) {
        if count > 0 {
            self.discarded.fetch_add(count, Ordering::SeqCst);
            warn!(discarded = count, reason, "Discarded unpublished scan data points");
        }
    }
}

async fn resolve_fields(fields: Vec<PendingField>) -> ScanResult<Vec<DataField>> {
    let mut resolved = Vec::with_capacity(fields.len());
    for PendingField { name, value, formats } in fields {
        let value = match value {
            FieldValue::Resolved(value) => value,
            FieldValue::Pending(handle) => handle
                .resolve()
                .await
                .map_err(|e| ScanError::device(name.as_str(), "deferred value", e))?,
        };
        resolved.push(DataField { name, value, formats });
    }
    Ok(resolved)
}

async fn consume(mut rx: mpsc::Receiver<PublishJob>, publisher: Arc<Publisher>, abandon: CancellationToken) {
    let mut dropped_in_flight = 0;
    loop {
        let job = tokio::select! {
            biased;
            _ = abandon.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => return,
            },
        };

        let PublishJob { point, ack } = job;
        let result = tokio::select! {
            biased;
            _ = abandon.cancelled() => {
                dropped_in_flight = 1;
                break;
            }
            result = publisher.publish(point) => result,
        };

        match result {
            Ok(()) => {
                if let Some(ack) = ack {
                    let _ = ack.send(Ok(()));
                }
            }
            Err(err) => {
                let err = publisher.poison(err);
                if let Some(ack) = ack {
                    let _ = ack.send(Err(err));
                }
                break;
            }
        }
    }

    rx.close();
    let mut queued = 0;
    while rx.try_recv().is_ok() {
        queued += 1;
    }
    let reason = if abandon.is_cancelled() { "shutdown" } else { "pipeline failure" };
    publisher.discard(queued + dropped_in_flight, reason);
}

/// Ordered, bounded, poisonable publication of scan data points.
pub struct DataPointPipeline {
    mode: ReadoutMode,
    pool: Arc<Semaphore>,
    publisher: Arc<Publisher>,
    queue: Mutex<Option<mpsc::Sender<PublishJob>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    abandon: CancellationToken,
    cancel: CancellationToken,
    shut_down: AtomicBool,
}

impl DataPointPipeline {
    /// Start the consumer task. Must be called within a Tokio runtime.
    pub fn start(sink: Arc<dyn DataSink>, observers: Vec<Arc<dyn ScanObserver>>, config: &PipelineConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let publisher = Arc::new(Publisher {
            sink,
            observers,
            failure: OnceLock::new(),
            published: AtomicUsize::new(0),
            discarded: AtomicUsize::new(0),
        });
        let abandon = CancellationToken::new();
        let consumer = tokio::spawn(consume(rx, publisher.clone(), abandon.clone()).in_current_span());
        let mode = ReadoutMode::from_config(config);

        debug!(
            %mode,
            queue_capacity = config.queue_capacity,
            deferred_pool_size = config.deferred_pool_size,
            "Started scan data pipeline"
        );

        Self {
            mode,
            pool: Arc::new(Semaphore::new(config.deferred_pool_size.max(1))),
            publisher,
            queue: Mutex::new(Some(tx)),
            consumer: Mutex::new(Some(consumer)),
            abandon,
            cancel: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Operating mode
    #[must_use]
    pub fn mode(&self) -> ReadoutMode {
        self.mode
    }

    /// Abort waits in `submit` with [`ScanError::Interrupted`] once `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Hand a point over for publication.
    ///
    /// Waits while the queue is full. In synchronous mode it also waits until
    /// the point has been published and returns any error from doing so.
    pub async fn submit(&self, point: PendingDataPoint) -> ScanResult<()> {
        match self.mode {
            ReadoutMode::Concurrent => self.enqueue(point, None).await,
            ReadoutMode::Synchronous => self.submit_and_wait(point).await,
        }
    }

    /// Submit a point and wait until it has been published, whatever the mode.
    pub async fn submit_and_wait(&self, point: PendingDataPoint) -> ScanResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.enqueue(point, Some(ack_tx)).await?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ScanError::Interrupted),
            ack = ack_rx => ack.unwrap_or_else(|_| Err(self.closed_error())),
        }
    }

    async fn enqueue(&self, point: PendingDataPoint, ack: Option<oneshot::Sender<ScanResult<()>>>) -> ScanResult<()> {
        self.check()?;
        let tx = self.queue.lock().clone().ok_or(ScanError::PipelineClosed)?;
        let point = point.dispatch_deferred(&self.pool);
        trace!(index = point.index, "Submitting scan data point");

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ScanError::Interrupted),
            sent = tx.send(PublishJob { point, ack }) => sent.map_err(|_| self.closed_error()),
        }
    }

    /// Return the stored failure, if the pipeline is poisoned.
    pub fn check(&self) -> ScanResult<()> {
        match self.publisher.failure.get() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Whether a publication error has been recorded
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.publisher.failure.get().is_some()
    }

    /// Points published so far
    #[must_use]
    pub fn published(&self) -> usize {
        self.publisher.published.load(Ordering::SeqCst)
    }

    /// Points dropped without publication
    #[must_use]
    pub fn discarded(&self) -> usize {
        self.publisher.discarded.load(Ordering::SeqCst)
    }

    /// Stop accepting points and close the sink.
    ///
    /// With `wait` every queued point is published first and a stored
    /// failure is returned; cancellation turns the drain into a discard and
    /// returns [`ScanError::Interrupted`]. Without it, outstanding work is
    /// cancelled and queued points are discarded. Only the first call does
    /// anything.
    pub async fn shutdown(&self, wait: bool) -> ScanResult<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Scan data pipeline already shut down");
            return Ok(());
        }

        drop(self.queue.lock().take());
        if !wait {
            self.abandon.cancel();
        }

        let mut interrupted = false;
        let consumer = self.consumer.lock().take();
        if let Some(mut consumer) = consumer {
            let drained = tokio::select! {
                biased;
                joined = &mut consumer => Some(joined),
                _ = self.cancel.cancelled(), if wait => None,
            };
            let joined = match drained {
                Some(joined) => joined,
                None => {
                    interrupted = true;
                    self.abandon.cancel();
                    consumer.await
                }
            };
            if let Err(e) = joined {
                self.publisher
                    .poison(ScanError::Pipeline(format!("publisher task failed: {e}")));
            }
        }

        let closed = self
            .publisher
            .sink
            .complete_collection()
            .await
            .map_err(|e| ScanError::Pipeline(format!("closing data sink failed: {e:#}")));

        info!(
            published = self.published(),
            discarded = self.discarded(),
            graceful = wait && !interrupted,
            "Scan data pipeline shut down"
        );

        if interrupted {
            return Err(ScanError::Interrupted);
        }
        if wait {
            self.check()?;
        }
        closed
    }

    fn closed_error(&self) -> ScanError {
        self.publisher
            .failure
            .get()
            .cloned()
            .unwrap_or(ScanError::PipelineClosed)
    }
}

impl fmt::Debug for DataPointPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataPointPipeline")
            .field("mode", &self.mode)
            .field("published", &self.published())
            .field("discarded", &self.discarded())
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_point::{DataValue, DeferredHandle};
    use crate::sink::MemorySink;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::timeout;
    use tracing_test::traced_test;
    use uuid::Uuid;

    fn config(concurrent: bool, queue_capacity: usize) -> PipelineConfig {
        PipelineConfig {
            queue_capacity,
            deferred_pool_size: 2,
            concurrent_readout: concurrent,
        }
    }

    fn point(index: usize, value: FieldValue) -> PendingDataPoint {
        PendingDataPoint {
            index,
            total_points: 10,
            scan_id: Uuid::nil(),
            command: "test".to_string(),
            step_ids: Vec::new(),
            dimensions: vec![10],
            scannables: vec![PendingField {
                name: "x".to_string(),
                value,
                formats: vec!["%.1f".to_string()],
            }],
            detectors: Vec::new(),
        }
    }

    fn resolved(index: usize) -> PendingDataPoint {
        point(index, FieldValue::Resolved(DataValue::Scalar(index as f64)))
    }

    /// Sink whose writes wait for a gate and can fail on one index.
    struct GatedSink {
        inner: MemorySink,
        gate: Notify,
        gated_index: Option<usize>,
        fail_index: Option<usize>,
    }

    impl GatedSink {
        fn new(gated_index: Option<usize>, fail_index: Option<usize>) -> Arc<Self> {
            Arc::new(Self {
                inner: MemorySink::new("gated"),
                gate: Notify::new(),
                gated_index,
                fail_index,
            })
        }

        fn indices(&self) -> Vec<usize> {
            self.inner.points().iter().map(|p| p.index).collect()
        }
    }

    #[async_trait]
    impl DataSink for GatedSink {
        async fn write(&self, point: &ScanDataPoint) -> anyhow::Result<()> {
            if self.gated_index == Some(point.index) {
                self.gate.notified().await;
            }
            if self.fail_index == Some(point.index) {
                anyhow::bail!("disk full");
            }
            self.inner.write(point).await
        }

        fn current_output_identifier(&self) -> Option<String> {
            self.inner.current_output_identifier()
        }

        async fn complete_collection(&self) -> anyhow::Result<()> {
            self.inner.complete_collection().await
        }
    }

    #[tokio::test]
    async fn synchronous_submit_returns_after_publish() {
        let sink = Arc::new(MemorySink::new("sync"));
        let pipeline = DataPointPipeline::start(sink.clone(), Vec::new(), &config(false, 3));

        pipeline.submit(resolved(0)).await.unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.points()[0].scannable("x"), Some(&DataValue::Scalar(0.0)));

        pipeline.shutdown(true).await.unwrap();
        assert!(sink.is_completed());
    }

    #[tokio::test]
    async fn deferred_values_resolve_out_of_order_but_publish_in_order() {
        let sink = Arc::new(MemorySink::new("ordered"));
        let pipeline = DataPointPipeline::start(sink.clone(), Vec::new(), &config(true, 8));

        for index in 0..6 {
            let delay = Duration::from_millis(((6 - index) * 10) as u64);
            let handle = DeferredHandle::new(async move {
                tokio::time::sleep(delay).await;
                Ok(DataValue::Scalar(index as f64))
            });
            pipeline.submit(point(index, FieldValue::Pending(handle))).await.unwrap();
        }
        pipeline.shutdown(true).await.unwrap();

        let values: Vec<f64> = sink
            .points()
            .iter()
            .map(|p| p.scannable("x").and_then(DataValue::as_f64).unwrap())
            .collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(pipeline.published(), 6);
    }

    #[tokio::test]
    async fn worker_pool_bounds_parallel_resolution() {
        let sink = Arc::new(MemorySink::new("pool"));
        let pipeline = DataPointPipeline::start(sink.clone(), Vec::new(), &config(true, 8));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for index in 0..6 {
            let (active, peak) = (active.clone(), peak.clone());
            let handle = DeferredHandle::new(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(DataValue::Scalar(index as f64))
            });
            pipeline.submit(point(index, FieldValue::Pending(handle))).await.unwrap();
        }
        pipeline.shutdown(true).await.unwrap();

        assert_eq!(sink.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn submit_blocks_when_queue_is_full() {
        let sink = GatedSink::new(Some(0), None);
        let pipeline = Arc::new(DataPointPipeline::start(sink.clone(), Vec::new(), &config(true, 2)));

        pipeline.submit(resolved(0)).await.unwrap();
        // Let the consumer pick up point 0 and block in the sink.
        tokio::time::sleep(Duration::from_millis(20)).await;
        pipeline.submit(resolved(1)).await.unwrap();
        pipeline.submit(resolved(2)).await.unwrap();

        let blocked = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.submit(resolved(3)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "submit should wait for queue space");

        sink.gate.notify_one();
        timeout(Duration::from_secs(1), blocked).await.unwrap().unwrap().unwrap();
        pipeline.shutdown(true).await.unwrap();
        assert_eq!(sink.indices(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn submit_and_wait_returns_after_publish_in_concurrent_mode() {
        let sink = GatedSink::new(Some(0), None);
        let pipeline = Arc::new(DataPointPipeline::start(sink.clone(), Vec::new(), &config(true, 3)));

        let waiting = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.submit_and_wait(resolved(0)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiting.is_finished(), "point 0 is queued but not yet written");

        sink.gate.notify_one();
        timeout(Duration::from_secs(1), waiting).await.unwrap().unwrap().unwrap();
        assert_eq!(sink.indices(), vec![0]);
        pipeline.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_interrupts_waiting_submit_and_drain() {
        let cancel = CancellationToken::new();
        let sink = GatedSink::new(Some(0), None);
        let pipeline = Arc::new(
            DataPointPipeline::start(sink.clone(), Vec::new(), &config(false, 1)).with_cancellation(cancel.clone()),
        );

        let waiting = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.submit(resolved(0)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let err = timeout(Duration::from_secs(1), waiting).await.unwrap().unwrap().unwrap_err();
        assert_eq!(err, ScanError::Interrupted);
        assert_eq!(pipeline.submit(resolved(1)).await.unwrap_err(), ScanError::Interrupted);

        let drained = timeout(Duration::from_secs(1), pipeline.shutdown(true)).await.unwrap();
        assert_eq!(drained.unwrap_err(), ScanError::Interrupted);
        assert!(sink.indices().is_empty());
        assert_eq!(pipeline.discarded(), 1);
        assert!(sink.inner.is_completed());
    }

    #[traced_test]
    #[tokio::test]
    async fn first_error_poisons_pipeline() {
        let sink = GatedSink::new(Some(1), Some(1));
        let pipeline = DataPointPipeline::start(sink.clone(), Vec::new(), &config(true, 3));

        for index in 0..4 {
            pipeline.submit(resolved(index)).await.unwrap();
        }
        sink.gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let first = pipeline.check().unwrap_err();
        assert!(first.to_string().contains("disk full"));
        assert_eq!(pipeline.submit(resolved(4)).await.unwrap_err(), first);
        assert_eq!(pipeline.check().unwrap_err(), first);
        assert_eq!(sink.indices(), vec![0]);
        assert_eq!(pipeline.discarded(), 2);
        assert!(logs_contain("Discarded unpublished scan data points"));

        assert_eq!(pipeline.shutdown(true).await.unwrap_err(), first);
        assert!(pipeline.shutdown(true).await.is_ok());
    }

    #[tokio::test]
    async fn synchronous_submit_reports_deferred_failure() {
        let sink = Arc::new(MemorySink::new("sync"));
        let pipeline = DataPointPipeline::start(sink.clone(), Vec::new(), &config(false, 3));

        let handle = DeferredHandle::new(async { Err(anyhow::anyhow!("frame lost")) });
        let err = pipeline.submit(point(0, FieldValue::Pending(handle))).await.unwrap_err();
        assert!(matches!(err, ScanError::Device { ref device, .. } if device == "x"));
        assert!(sink.is_empty());
        assert!(pipeline.is_poisoned());
    }

    #[tokio::test]
    async fn immediate_shutdown_discards_queued_points() {
        let sink = GatedSink::new(Some(0), None);
        let pipeline = DataPointPipeline::start(sink.clone(), Vec::new(), &config(true, 3));

        for index in 0..3 {
            pipeline.submit(resolved(index)).await.unwrap();
        }
        timeout(Duration::from_secs(1), pipeline.shutdown(false))
            .await
            .unwrap()
            .unwrap();

        assert!(sink.indices().is_empty());
        assert_eq!(pipeline.discarded(), 3);
        assert!(sink.inner.is_completed());
        assert_eq!(pipeline.submit(resolved(3)).await.unwrap_err(), ScanError::PipelineClosed);
    }
}
