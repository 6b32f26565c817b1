//! Scan execution core.
//!
//! [`Scan`] owns one composed [`ScanTree`] and runs it through the scan
//! lifecycle:
//!
//! ```text
//! NotStarted → Running → prepare → collect → end of scan → CompletedOkay
//!                 │                    │
//!                 │                    ├─ error  → TidyingUpAfterFailure → CompletedAfterFailure
//!                 │                    └─ abort  → TidyingUpAfterStop    → CompletedAfterStop
//!                 └─ pause / resume / finish early via ScanControl
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_scan::{scan_args, Scan};
//!
//! let scan = Scan::builder()
//!     .args(scan_args![&x, 0.0, 10.0, 1.0, &det, 0.1])
//!     .sink(sink.clone())
//!     .build()
//!     .await?;
//!
//! let control = scan.control();
//! let summary = scan.run().await?;
//! println!("{} points, {}", summary.points_published, summary.status);
//! ```

use crate::composer::{ScanArg, ScanTree};
use crate::config::ScanConfig;
use crate::context::ScanContext;
use crate::device::DeviceHandle;
use crate::error::{DeviceResultExt, ScanError, ScanResult};
use crate::pipeline::DataPointPipeline;
use crate::readout::RunState;
use crate::sink::{DataSink, MemorySink, ScanObserver};
use crate::status::{ScanStatus, StatusCell};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Outcome of a scan that ran to a terminal state without failing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanSummary {
    /// Scan identifier
    pub scan_id: Uuid,
    /// Command the scan was built from
    pub command: String,
    /// Terminal status
    pub status: ScanStatus,
    /// Points written to the sink
    pub points_published: usize,
    /// Points dropped by an abort
    pub points_discarded: usize,
    /// Points the scan would have produced if run to the end
    pub total_points: usize,
    /// Sink output identifier at the end of the scan
    pub output_identifier: Option<String>,
}

/// Builder for [`Scan`].
#[derive(Default)]
pub struct ScanBuilder {
    args: Vec<ScanArg>,
    config: ScanConfig,
    sink: Option<Arc<dyn DataSink>>,
    observers: Vec<Arc<dyn ScanObserver>>,
}

impl ScanBuilder {
    /// Append one argument
    #[must_use]
    pub fn arg(mut self, arg: impl Into<ScanArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append an argument list
    #[must_use]
    pub fn args(mut self, args: Vec<ScanArg>) -> Self {
        self.args.extend(args);
        self
    }

    /// Engine configuration (defaults otherwise)
    #[must_use]
    pub fn config(mut self, config: ScanConfig) -> Self {
        self.config = config;
        self
    }

    /// Destination for published points (an in-memory sink otherwise)
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn DataSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Add an observer of points and status changes
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn ScanObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Validate the configuration, compose the scan and check every target
    /// position with its device.
    pub async fn build(self) -> ScanResult<Scan> {
        self.config.validate()?;
        let tree = ScanTree::parse(self.args)?;
        tree.validate().await?;

        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(MemorySink::default()) as Arc<dyn DataSink>);
        let status = Arc::new(StatusCell::new(self.observers.clone()));

        Ok(Scan {
            id: Uuid::new_v4(),
            tree,
            config: Arc::new(self.config),
            sink,
            observers: self.observers,
            status,
            cancel: CancellationToken::new(),
            originals: Vec::new(),
        })
    }
}

/// Handle for steering a running scan from another task.
#[derive(Clone, Debug)]
pub struct ScanControl {
    status: Arc<StatusCell>,
    cancel: CancellationToken,
}

impl ScanControl {
    /// Pause at the next point boundary. Returns `false` if not running.
    pub fn pause(&self) -> bool {
        self.status.pause()
    }

    /// Resume a paused scan. Returns `false` if not paused.
    pub fn resume(&self) -> bool {
        self.status.resume()
    }

    /// Finish after the current point and complete normally.
    pub fn request_finish_early(&self) {
        self.status.request_finish_early();
    }

    /// Abort: stop every device and discard unpublished points.
    pub fn abort(&self) -> bool {
        let current = self.status.get();
        let accepted = current == ScanStatus::TidyingUpAfterStop || self.status.set(ScanStatus::TidyingUpAfterStop);
        if accepted {
            self.cancel.cancel();
        }
        accepted
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> ScanStatus {
        self.status.get()
    }

    /// Receiver that sees every status change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ScanStatus> {
        self.status.subscribe()
    }

    /// Wait until the scan is in `status` (or has completed).
    pub async fn wait_for(&self, status: ScanStatus) -> ScanStatus {
        let mut rx = self.status.subscribe();
        let reached = match rx.wait_for(|s| *s == status || s.is_complete()).await {
            Ok(reached) => *reached,
            Err(_) => self.status.get(),
        };
        reached
    }
}

/// A composed scan, ready to run once.
pub struct Scan {
    id: Uuid,
    tree: ScanTree,
    config: Arc<ScanConfig>,
    sink: Arc<dyn DataSink>,
    observers: Vec<Arc<dyn ScanObserver>>,
    status: Arc<StatusCell>,
    cancel: CancellationToken,
    originals: Vec<(DeviceHandle, f64)>,
}

impl Scan {
    /// Start building a scan
    #[must_use]
    pub fn builder() -> ScanBuilder {
        ScanBuilder::default()
    }

    /// Scan identifier
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The composed dimensions and devices
    #[must_use]
    pub fn tree(&self) -> &ScanTree {
        &self.tree
    }

    /// Points the scan will produce
    #[must_use]
    pub fn total_points(&self) -> usize {
        self.tree.total_points()
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> ScanStatus {
        self.status.get()
    }

    /// A control handle; may be cloned and moved to other tasks
    #[must_use]
    pub fn control(&self) -> ScanControl {
        ScanControl {
            status: self.status.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Run the scan to a terminal state.
    ///
    /// # Returns
    /// - Ok(summary) when the scan completed, finished early or was aborted
    /// - Err with the first failure otherwise; the status is then
    ///   `CompletedAfterFailure`
    pub async fn run(mut self) -> ScanResult<ScanSummary> {
        let span = info_span!("scan", scan_id = %self.id, command = %self.tree.command());
        async move {
            if self.status.get() == ScanStatus::TidyingUpAfterStop {
                info!("Scan aborted before it started");
                let status = self.status.complete();
                return Ok(self.summary(status, 0, 0));
            }
            if !self.status.set(ScanStatus::Running) {
                return Err(ScanError::State(format!(
                    "scan cannot be started from {}",
                    self.status.get()
                )));
            }

            info!(
                points = self.tree.total_points(),
                dimensions = ?self.tree.dimensions(),
                levels = %self.tree.report_devices_by_level(),
                "Starting scan"
            );
            let concurrent = self.tree.detectors_moving_concurrently();
            if !concurrent.is_empty() {
                info!(detectors = ?concurrent, "Detectors will acquire while scannables at their level move");
            }

            let pipeline = Arc::new(
                DataPointPipeline::start(self.sink.clone(), self.observers.clone(), &self.config.pipeline)
                    .with_cancellation(self.cancel.child_token()),
            );
            let ctx = ScanContext {
                scan_id: self.id,
                command: self.tree.command().to_string(),
                devices: self.tree.devices().clone(),
                pipeline: pipeline.clone(),
                status: self.status.clone(),
                cancel: self.cancel.clone(),
                config: self.config.clone(),
                dimensions: self.tree.dimensions(),
                total_points: self.tree.total_points(),
            };
            let mut run = RunState::new(ctx.dimensions.len());

            let failure = match self.collect_scan(&ctx, &mut run).await {
                Ok(()) => {
                    if self.config.scan.return_to_original_positions {
                        if let Err(e) = self.return_to_original_positions(&ctx).await {
                            warn!(error = %e, "Failed to return scannables to their original positions");
                        }
                    }
                    None
                }
                Err(e) => self.tidy_up(&ctx, &mut run, e).await,
            };

            let status = self.status.complete();
            let summary = self.summary(status, pipeline.published(), pipeline.discarded());
            info!(
                %status,
                published = summary.points_published,
                discarded = summary.points_discarded,
                total = summary.total_points,
                "Scan finished"
            );

            match failure {
                Some(e) => Err(e),
                None => Ok(summary),
            }
        }
        .instrument(span)
        .await
    }

    async fn collect_scan(&mut self, ctx: &ScanContext, run: &mut RunState) -> ScanResult<()> {
        if self.config.scan.return_to_original_positions {
            self.originals = record_positions(&self.tree.moved_scannables()).await?;
        }

        self.prepare(ctx).await?;
        self.tree.collect(ctx, run).await?;
        run.wait_for_readout(&ctx.cancel).await?;
        ctx.pipeline.shutdown(true).await?;

        for device in ctx.devices.all() {
            device
                .as_scannable()
                .at_scan_end()
                .await
                .on_device(device.name(), "at_scan_end")?;
        }
        for device in &ctx.devices.detectors {
            if let Some(detector) = device.as_detector() {
                detector.end_collection().await.on_device(device.name(), "end_collection")?;
            }
        }
        Ok(())
    }

    async fn prepare(&self, ctx: &ScanContext) -> ScanResult<()> {
        for device in ctx.devices.all() {
            device
                .as_scannable()
                .at_scan_start()
                .await
                .on_device(device.name(), "at_scan_start")?;
        }
        for (device, seconds) in self.tree.collection_times() {
            if let Some(detector) = device.as_detector() {
                detector
                    .set_collection_time(*seconds)
                    .await
                    .on_device(device.name(), "set_collection_time")?;
            }
        }
        for device in &ctx.devices.detectors {
            if let Some(detector) = device.as_detector() {
                detector
                    .prepare_for_collection()
                    .await
                    .on_device(device.name(), "prepare_for_collection")?;
            }
        }
        Ok(())
    }

    /// Clean up after an error or abort. Returns the error to surface, if any.
    async fn tidy_up(&self, ctx: &ScanContext, run: &mut RunState, cause: ScanError) -> Option<ScanError> {
        let aborted = cause.is_interrupted() || self.status.get() == ScanStatus::TidyingUpAfterStop;
        if aborted {
            if self.status.get() != ScanStatus::TidyingUpAfterStop {
                self.status.set(ScanStatus::TidyingUpAfterStop);
            }
            warn!("Scan aborted; stopping all devices");
        } else {
            self.status.set(ScanStatus::TidyingUpAfterFailure);
            error!(error = %cause, "Scan failed; stopping all devices");
        }
        self.cancel.cancel();
        run.cancel_readout();

        for device in ctx.devices.all() {
            if let Err(e) = device.as_scannable().at_command_failure().await {
                warn!(device = device.name(), error = %e, "at_command_failure hook failed");
            }
        }
        for device in ctx.devices.all() {
            if let Err(e) = device.as_scannable().stop().await {
                warn!(device = device.name(), error = %e, "Failed to stop device");
            }
        }
        if let Err(e) = ctx.pipeline.shutdown(false).await {
            warn!(error = %e, "Failed to shut down scan data pipeline");
        }

        (!aborted).then_some(cause)
    }

    async fn return_to_original_positions(&self, ctx: &ScanContext) -> ScanResult<()> {
        let devices: Vec<DeviceHandle> = self.originals.iter().map(|(d, _)| d.clone()).collect();
        for (device, position) in &self.originals {
            info!(device = device.name(), position, "Returning to original position");
            device
                .as_scannable()
                .move_to(*position)
                .await
                .on_device(device.name(), "move_to")?;
        }
        crate::coordinator::wait_until_idle(ctx, &devices).await
    }

    fn summary(&self, status: ScanStatus, published: usize, discarded: usize) -> ScanSummary {
        ScanSummary {
            scan_id: self.id,
            command: self.tree.command().to_string(),
            status,
            points_published: published,
            points_discarded: discarded,
            total_points: self.tree.total_points(),
            output_identifier: self.sink.current_output_identifier(),
        }
    }
}

async fn record_positions(devices: &[DeviceHandle]) -> ScanResult<Vec<(DeviceHandle, f64)>> {
    let mut positions = Vec::with_capacity(devices.len());
    for device in devices {
        let value = device
            .as_scannable()
            .position()
            .await
            .on_device(device.name(), "position")?;
        if let Some(position) = value.as_f64() {
            positions.push((device.clone(), position));
        }
    }
    Ok(positions)
}
