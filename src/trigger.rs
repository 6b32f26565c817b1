//! Hardware-triggered lines.
//!
//! A motion controller, not the scan loop, produces the trigger pulses. Every
//! detector is armed concurrently, the controller is loaded with the
//! trajectory and trigger period, and a single coordinated move is started.
//! One point per frame is submitted with deferred detector values; the scan
//! task then watches both the motion and the pipeline so that a readout
//! failure discovered in the background still stops the move.

use crate::composer::ChildDimension;
use crate::context::ScanContext;
use crate::coordinator::wait_until_idle;
use crate::data_point::{DataValue, DeferredHandle, FieldValue, PendingField, StepId};
use crate::device::{ContinuousMoveController, DeviceHandle, HardwareTriggeredDetector};
use crate::error::{DeviceResultExt, ScanError, ScanResult};
use crate::readout::{sample_scannables, RunState};
use crate::scan_object::{number_of_points, sort_step, ScanObject};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

/// A continuous move of one axis with hardware-triggered detectors.
pub struct HardwareTriggeredLine {
    axis: DeviceHandle,
    controller: Arc<dyn ContinuousMoveController>,
    start: f64,
    stop: f64,
    step: f64,
    positions: Vec<f64>,
    detectors: Vec<DeviceHandle>,
}

impl HardwareTriggeredLine {
    /// A line from `start` to `stop` with one trigger every `step`.
    pub fn new(
        axis: DeviceHandle,
        controller: Arc<dyn ContinuousMoveController>,
        start: f64,
        stop: f64,
        step: f64,
    ) -> ScanResult<Self> {
        if axis.is_detector() {
            return Err(ScanError::Construction(format!(
                "'{}' is a detector and cannot be the axis of a triggered line",
                axis.name()
            )));
        }
        let step = sort_step(start, stop, step);
        let count = number_of_points(start, stop, step)?;
        let positions = (0..count).map(|i| start + i as f64 * step).collect();
        Ok(Self {
            axis,
            controller,
            start,
            stop,
            step,
            positions,
            detectors: Vec::new(),
        })
    }

    /// Add a detector. It must support hardware triggering.
    pub fn with_detector(mut self, detector: DeviceHandle) -> ScanResult<Self> {
        if detector.as_hardware_triggered().is_none() {
            return Err(ScanError::Construction(format!(
                "detector '{}' does not support hardware triggering",
                detector.name()
            )));
        }
        if self.detectors.iter().any(|d| d.same_device(&detector)) {
            return Err(ScanError::Construction(format!(
                "detector '{}' added to the line twice",
                detector.name()
            )));
        }
        self.detectors.push(detector);
        Ok(self)
    }

    /// Wrap as a dimension for the composer.
    #[must_use]
    pub fn into_child(self) -> ChildDimension {
        ChildDimension::hardware_triggered(self)
    }

    /// The moving axis
    #[must_use]
    pub fn axis(&self) -> &DeviceHandle {
        &self.axis
    }

    /// Name of the moving axis
    #[must_use]
    pub fn axis_name(&self) -> &str {
        self.axis.name()
    }

    /// Triggered detectors in declared order
    #[must_use]
    pub fn detectors(&self) -> &[DeviceHandle] {
        &self.detectors
    }

    /// Trigger positions
    #[must_use]
    pub fn positions(&self) -> &[f64] {
        &self.positions
    }

    /// Frames per line
    #[must_use]
    pub fn number_points(&self) -> usize {
        self.positions.len()
    }

    pub(crate) fn describe(&self) -> String {
        let mut text = format!("{} {} {} {}", self.axis.name(), self.start, self.stop, self.step.abs());
        for detector in &self.detectors {
            text.push(' ');
            text.push_str(detector.name());
        }
        text
    }

    pub(crate) async fn validate_points(&self) -> ScanResult<()> {
        if self.detectors.is_empty() {
            return Err(ScanError::Construction(format!(
                "triggered line on '{}' has no detectors",
                self.axis.name()
            )));
        }
        let scannable = self.axis.as_scannable();
        for &position in &self.positions {
            if let Some(reason) = scannable
                .check_position_valid(position)
                .await
                .on_device(self.axis.name(), "check_position_valid")?
            {
                return Err(ScanError::Construction(format!(
                    "position {position} is not valid for '{}': {reason}",
                    self.axis.name()
                )));
            }
        }
        Ok(())
    }

    /// Run one line. `shared` holds objects moved once before the line starts.
    pub(crate) async fn run(
        &self,
        shared: &mut [ScanObject],
        depth: usize,
        ctx: &ScanContext,
        run: &mut RunState,
    ) -> ScanResult<()> {
        if !shared.is_empty() {
            for object in shared.iter_mut() {
                object.move_to_start().await?;
            }
            let devices: Vec<DeviceHandle> = shared.iter().map(|o| o.device().clone()).collect();
            wait_until_idle(ctx, &devices).await?;
        }

        let result = self.run_triggered(depth, ctx, run).await;
        if result.is_err() {
            if let Err(e) = self.controller.stop().await {
                warn!(controller = self.controller.name(), error = %e, "Failed to stop trajectory");
            }
        }
        let restored = self.restore_triggering().await;
        result?;
        restored
    }

    async fn run_triggered(&self, depth: usize, ctx: &ScanContext, run: &mut RunState) -> ScanResult<()> {
        ctx.check_cancelled()?;
        let controller = self.controller.name();

        self.controller
            .set_operating_continuously(true)
            .await
            .on_device(controller, "set_operating_continuously")?;
        for device in &self.detectors {
            self.triggered(device)?
                .set_hardware_triggering(true)
                .await
                .on_device(device.name(), "set_hardware_triggering")?;
        }

        let period = self.collection_period(ctx).await?;
        arm_detectors(&self.detectors).await?;
        ctx.check_cancelled()?;

        self.controller
            .stop_and_reset()
            .await
            .on_device(controller, "stop_and_reset")?;
        self.controller
            .set_trigger_period(period)
            .await
            .on_device(controller, "set_trigger_period")?;
        self.controller
            .set_trajectory(&self.positions)
            .await
            .on_device(controller, "set_trajectory")?;
        self.controller
            .prepare_for_move()
            .await
            .on_device(controller, "prepare_for_move")?;
        self.controller.start_move().await.on_device(controller, "start_move")?;
        info!(
            axis = self.axis.name(),
            frames = self.positions.len(),
            period,
            "Started hardware-triggered line"
        );

        for (frame, &position) in self.positions.iter().enumerate() {
            ctx.check_cancelled()?;
            let index = run.next_point_index();
            run.set_step_id(
                depth,
                Some(StepId {
                    device: self.axis.name().to_string(),
                    index: frame,
                    position,
                }),
            );

            let mut point = ctx.new_point(index, run.step_ids());
            point.scannables = sample_scannables(&ctx.devices.scannables).await?;
            if let Some(field) = point.scannables.iter_mut().find(|f| f.name == self.axis.name()) {
                field.value = FieldValue::Resolved(DataValue::Scalar(position));
            }
            for device in &self.detectors {
                let value = self
                    .triggered(device)?
                    .frame_value(frame)
                    .on_device(device.name(), "frame_value")?;
                point.detectors.push(PendingField {
                    name: device.name().to_string(),
                    value: FieldValue::Pending(DeferredHandle::from(value)),
                    formats: device.as_scannable().output_format(),
                });
            }
            ctx.pipeline.submit(point).await?;
        }

        let interval = ctx.config.motion.motion_poll_interval();
        loop {
            ctx.pipeline.check()?;
            ctx.wait_if_paused().await?;
            if !self.controller.is_moving().await.on_device(controller, "is_moving")? {
                break;
            }
            ctx.sleep(interval).await?;
        }
        debug!(axis = self.axis.name(), "Hardware-triggered line complete");
        ctx.pipeline.check()
    }

    async fn collection_period(&self, ctx: &ScanContext) -> ScanResult<f64> {
        let mut times = Vec::with_capacity(self.detectors.len());
        for device in &self.detectors {
            let time = self
                .triggered(device)?
                .collection_time()
                .await
                .on_device(device.name(), "collection_time")?;
            times.push((device.name().to_string(), time));
        }
        common_collection_period(&times, ctx.config.motion.collection_time_tolerance)
    }

    /// Switch every flag set for the line back off. Every device is visited
    /// even if one fails; the first failure is returned.
    async fn restore_triggering(&self) -> ScanResult<()> {
        let mut first_error = None;
        for device in &self.detectors {
            let Some(triggered) = device.as_hardware_triggered() else {
                continue;
            };
            if let Err(e) = triggered
                .set_hardware_triggering(false)
                .await
                .on_device(device.name(), "set_hardware_triggering")
            {
                warn!(error = %e, "Failed to restore software triggering");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self
            .controller
            .set_operating_continuously(false)
            .await
            .on_device(self.controller.name(), "set_operating_continuously")
        {
            warn!(error = %e, "Failed to leave continuous operation");
            first_error.get_or_insert(e);
        }
        first_error.map_or(Ok(()), Err)
    }

    fn triggered(&self, device: &DeviceHandle) -> ScanResult<Arc<dyn HardwareTriggeredDetector>> {
        device.as_hardware_triggered().cloned().ok_or_else(|| {
            ScanError::Construction(format!(
                "detector '{}' does not support hardware triggering",
                device.name()
            ))
        })
    }
}

impl fmt::Debug for HardwareTriggeredLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareTriggeredLine")
            .field("axis", &self.axis.name())
            .field("controller", &self.controller.name())
            .field("frames", &self.positions.len())
            .field("detectors", &self.detectors.len())
            .finish()
    }
}

/// Arm every detector in its own task and wait for all of them.
///
/// The first failure aborts the remaining arm tasks, stops every detector and
/// is returned as a single [`ScanError::Arming`].
pub async fn arm_detectors(detectors: &[DeviceHandle]) -> ScanResult<()> {
    let mut tasks = JoinSet::new();
    for device in detectors {
        let triggered = device.as_hardware_triggered().cloned().ok_or_else(|| {
            ScanError::Construction(format!(
                "detector '{}' does not support hardware triggering",
                device.name()
            ))
        })?;
        let name = device.name().to_string();
        tasks.spawn(
            async move {
                let result = triggered.arm().await;
                (name, result)
            }
            .in_current_span(),
        );
    }

    while let Some(joined) = tasks.join_next().await {
        let (device, message) = match joined {
            Ok((_, Ok(()))) => continue,
            Ok((device, Err(e))) => (device, format!("{e:#}")),
            Err(e) => ("unknown".to_string(), format!("arm task panicked: {e}")),
        };

        let cancelled = tasks.len();
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        stop_detectors(detectors).await;

        error!(device = %device, cancelled, error = %message, "Arming failed");
        return Err(ScanError::Arming {
            device,
            message,
            cancelled,
        });
    }

    debug!(detectors = detectors.len(), "Armed detectors");
    Ok(())
}

async fn stop_detectors(detectors: &[DeviceHandle]) {
    for device in detectors {
        if let Err(e) = device.as_scannable().stop().await {
            warn!(device = device.name(), error = %e, "Failed to stop detector");
        }
    }
}

/// Trigger period shared by all detectors.
///
/// Every collection time must be within `tolerance` (relative) of the mean;
/// the mean is returned.
pub fn common_collection_period(times: &[(String, f64)], tolerance: f64) -> ScanResult<f64> {
    if times.is_empty() {
        return Err(ScanError::Construction(
            "no detectors to take the collection time from".to_string(),
        ));
    }
    let mean = times.iter().map(|(_, t)| t).sum::<f64>() / times.len() as f64;
    if !mean.is_finite() || mean <= 0.0 {
        return Err(ScanError::Construction(format!(
            "collection time must be positive, got {mean}"
        )));
    }
    if let Some((name, time)) = times
        .iter()
        .find(|(_, t)| (t - mean).abs() > tolerance * mean)
    {
        let listed: Vec<String> = times.iter().map(|(n, t)| format!("{n}={t}")).collect();
        return Err(ScanError::Construction(format!(
            "collection time {time} of '{name}' does not match the other detectors ({})",
            listed.join(", ")
        )));
    }
    Ok(mean)
}
