//! Sampling devices into points, and the per-point readout task.
//!
//! In synchronous mode detectors are read on the scan task. In concurrent mode
//! one task per point reads every detector in parallel, runs the detector
//! point hooks, submits the point and waits until it is published, while the
//! scan task moves on. At most one such task is outstanding;
//! [`RunState::wait_for_readout`] is the back-pressure valve that joins it, so
//! a detector never starts on a point before the previous one is written.

use crate::context::ScanContext;
use crate::data_point::{DeferredHandle, FieldValue, PendingDataPoint, PendingField, StepId};
use crate::device::DeviceHandle;
use crate::error::{DeviceResultExt, ScanError, ScanResult};
use crate::pipeline::ReadoutMode;
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, Instrument};

/// Per-run cursor: point counter, current step labels and the readout in flight.
pub(crate) struct RunState {
    next_index: usize,
    step_ids: Vec<Option<StepId>>,
    readout: Option<ReadoutTask>,
}

struct ReadoutTask {
    index: usize,
    task: AbortOnDropHandle<ScanResult<()>>,
}

impl RunState {
    pub fn new(dimensions: usize) -> Self {
        Self {
            next_index: 0,
            step_ids: vec![None; dimensions],
            readout: None,
        }
    }

    /// Index for the next point; advances the counter.
    pub fn next_point_index(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    /// Record the step of dimension `depth`; `None` keeps the previous label.
    pub fn set_step_id(&mut self, depth: usize, step: Option<StepId>) {
        if let (Some(slot), Some(step)) = (self.step_ids.get_mut(depth), step) {
            *slot = Some(step);
        }
    }

    pub fn step_ids(&self) -> Vec<Option<StepId>> {
        self.step_ids.clone()
    }

    /// Join the outstanding readout task, if any. Cancellation aborts it.
    pub async fn wait_for_readout(&mut self, cancel: &CancellationToken) -> ScanResult<()> {
        let Some(ReadoutTask { index, task }) = self.readout.take() else {
            return Ok(());
        };
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(index, "Abandoning detector readout");
                return Err(ScanError::Interrupted);
            }
            joined = task => joined,
        };
        match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(ScanError::Interrupted),
            Err(e) => Err(ScanError::Pipeline(format!("readout of point {index} panicked: {e}"))),
        }
    }

    /// Abort the outstanding readout task, if any.
    pub fn cancel_readout(&mut self) {
        if let Some(ReadoutTask { index, task }) = self.readout.take() {
            debug!(index, "Cancelling detector readout");
            task.abort();
        }
    }
}

/// Sample every scannable that contributes a field.
pub(crate) async fn sample_scannables(scannables: &[DeviceHandle]) -> ScanResult<Vec<PendingField>> {
    let mut fields = Vec::with_capacity(scannables.len());
    for device in scannables {
        let formats = device.as_scannable().output_format();
        if formats.is_empty() {
            continue;
        }
        let value = match device.as_deferred() {
            Some(provider) => FieldValue::Pending(DeferredHandle::from(
                provider.deferred_value().on_device(device.name(), "deferred_value")?,
            )),
            None => FieldValue::Resolved(
                device
                    .as_scannable()
                    .position()
                    .await
                    .on_device(device.name(), "position")?,
            ),
        };
        fields.push(PendingField {
            name: device.name().to_string(),
            value,
            formats,
        });
    }
    Ok(fields)
}

/// Read one detector, or take a deferred handle for its data.
pub(crate) async fn read_detector(device: &DeviceHandle) -> ScanResult<PendingField> {
    let value = if let Some(provider) = device.as_deferred() {
        FieldValue::Pending(DeferredHandle::from(
            provider.deferred_value().on_device(device.name(), "deferred_value")?,
        ))
    } else {
        let detector = device.as_detector().ok_or_else(|| {
            ScanError::Construction(format!("'{}' is listed as a detector but cannot read out", device.name()))
        })?;
        FieldValue::Resolved(detector.readout().await.on_device(device.name(), "readout")?)
    };
    Ok(PendingField {
        name: device.name().to_string(),
        value,
        formats: device.as_scannable().output_format(),
    })
}

async fn read_detectors_in_sequence(detectors: &[DeviceHandle]) -> ScanResult<Vec<PendingField>> {
    let mut fields = Vec::with_capacity(detectors.len());
    for device in detectors {
        fields.push(read_detector(device).await?);
    }
    Ok(fields)
}

/// One task per detector; results keep declared order, first failure cancels the rest.
async fn read_detectors_in_parallel(detectors: &[DeviceHandle]) -> ScanResult<Vec<PendingField>> {
    let tasks = detectors.iter().cloned().map(|device| {
        let task = AbortOnDropHandle::new(tokio::spawn(
            async move { read_detector(&device).await }.in_current_span(),
        ));
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(ScanError::Interrupted),
                Err(e) => Err(ScanError::Pipeline(format!("detector readout task panicked: {e}"))),
            }
        }
    });
    try_join_all(tasks).await
}

#[derive(Clone, Copy)]
enum PointHook {
    Start,
    End,
}

async fn run_detector_hook(detectors: &[DeviceHandle], hook: PointHook) -> ScanResult<()> {
    for device in detectors {
        let scannable = device.as_scannable();
        match hook {
            PointHook::Start => scannable.at_point_start().await.on_device(device.name(), "at_point_start")?,
            PointHook::End => scannable.at_point_end().await.on_device(device.name(), "at_point_end")?,
        }
    }
    Ok(())
}

/// Sample the current point and hand it to the pipeline.
///
/// Synchronous mode reads detectors here and returns once the point is
/// published. Concurrent mode starts the readout task and returns.
pub(crate) async fn read_and_publish(
    ctx: &ScanContext,
    run: &mut RunState,
    index: usize,
    last_in_line: bool,
) -> ScanResult<()> {
    let mut point = ctx.new_point(index, run.step_ids());
    point.scannables = sample_scannables(&ctx.devices.scannables).await?;

    match ctx.readout_mode() {
        ReadoutMode::Synchronous => {
            point.detectors = read_detectors_in_sequence(&ctx.devices.detectors).await?;
            ctx.pipeline.submit_and_wait(point).await
        }
        ReadoutMode::Concurrent => {
            run.wait_for_readout(&ctx.cancel).await?;
            let task = spawn_readout(ctx, point, last_in_line);
            run.readout = Some(ReadoutTask { index, task });
            Ok(())
        }
    }
}

fn spawn_readout(
    ctx: &ScanContext,
    mut point: PendingDataPoint,
    last_in_line: bool,
) -> AbortOnDropHandle<ScanResult<()>> {
    let devices = ctx.devices.clone();
    let pipeline = ctx.pipeline.clone();
    let task = async move {
        point.detectors = read_detectors_in_parallel(&devices.detectors).await?;
        run_detector_hook(&devices.detectors, PointHook::End).await?;
        if !last_in_line {
            run_detector_hook(&devices.detectors, PointHook::Start).await?;
        }
        pipeline.submit_and_wait(point).await
    };
    AbortOnDropHandle::new(tokio::spawn(task.in_current_span()))
}
