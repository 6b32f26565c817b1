//! Scan objects: one device bound to the positions it visits.

use crate::data_point::StepId;
use crate::device::DeviceHandle;
use crate::error::{DeviceResultExt, ScanError, ScanResult};
use std::fmt;

/// Fraction of a step tolerated when counting the points of a range.
const STEP_TOLERANCE: f64 = 1e-6;

/// Most points a single range may expand to.
pub const MAX_RANGE_POINTS: usize = 10_000_000;

#[derive(Debug, Clone, PartialEq)]
enum Motion {
    /// Sampled only
    ReadOnly,
    /// Moved once per line
    Fixed(f64),
    /// Stepped along with the dimension it is shared into
    Stepped { start: f64, step: f64 },
    /// Inclusive range, defines a dimension
    Range { start: f64, stop: f64, step: f64 },
    /// Explicit list, defines a dimension
    Explicit,
}

/// One device and its position sequence within a scan.
#[derive(Clone)]
pub struct ScanObject {
    device: DeviceHandle,
    motion: Motion,
    points: Vec<f64>,
    cursor: usize,
}

impl ScanObject {
    /// A device that is sampled but never moved.
    #[must_use]
    pub fn read_only(device: DeviceHandle) -> Self {
        Self {
            device,
            motion: Motion::ReadOnly,
            points: Vec::new(),
            cursor: 0,
        }
    }

    /// A device moved to `position` at the start of every line.
    #[must_use]
    pub fn fixed(device: DeviceHandle, position: f64) -> Self {
        Self {
            device,
            motion: Motion::Fixed(position),
            points: vec![position],
            cursor: 0,
        }
    }

    /// A device stepped from `start` by `step` alongside the innermost dimension.
    ///
    /// The number of points is set when the scan is composed.
    #[must_use]
    pub fn stepped(device: DeviceHandle, start: f64, step: f64) -> Self {
        Self {
            device,
            motion: Motion::Stepped { start, step },
            points: vec![start],
            cursor: 0,
        }
    }

    /// An inclusive range from `start` to `stop`.
    ///
    /// The sign of `step` is corrected to point from `start` towards `stop`.
    pub fn range(device: DeviceHandle, start: f64, stop: f64, step: f64) -> ScanResult<Self> {
        let step = sort_step(start, stop, step);
        let count = number_of_points(start, stop, step)?;
        let points = (0..count).map(|i| start + i as f64 * step).collect();
        Ok(Self {
            device,
            motion: Motion::Range { start, stop, step },
            points,
            cursor: 0,
        })
    }

    /// An explicit list of positions.
    pub fn explicit(device: DeviceHandle, positions: Vec<f64>) -> ScanResult<Self> {
        if positions.is_empty() {
            return Err(ScanError::Construction(format!(
                "position list for '{}' is empty",
                device.name()
            )));
        }
        if let Some(bad) = positions.iter().find(|p| !p.is_finite()) {
            return Err(ScanError::Construction(format!(
                "position list for '{}' contains {bad}",
                device.name()
            )));
        }
        Ok(Self {
            device,
            motion: Motion::Explicit,
            points: positions,
            cursor: 0,
        })
    }

    /// The bound device
    #[must_use]
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// Whether the device is moved at all
    #[must_use]
    pub fn has_start(&self) -> bool {
        !matches!(self.motion, Motion::ReadOnly)
    }

    /// Whether this object defines its own dimension
    #[must_use]
    pub fn has_stop(&self) -> bool {
        matches!(self.motion, Motion::Range { .. } | Motion::Explicit)
    }

    /// Whether the device moves on every step (as opposed to once per line)
    #[must_use]
    pub fn is_stepped(&self) -> bool {
        matches!(self.motion, Motion::Stepped { .. }) || self.has_stop()
    }

    /// Points this object defines on its own, if it defines any
    #[must_use]
    pub fn number_points(&self) -> Option<usize> {
        self.has_stop().then_some(self.points.len())
    }

    /// Every target position in visiting order
    #[must_use]
    pub fn points(&self) -> &[f64] {
        &self.points
    }

    /// Set the point count of a stepped object to match its dimension.
    pub(crate) fn set_number_points(&mut self, count: usize) {
        if let Motion::Stepped { start, step } = self.motion {
            self.points = (0..count).map(|i| start + i as f64 * step).collect();
        }
    }

    /// Ask the device whether every target position is acceptable.
    pub async fn validate_points(&self) -> ScanResult<()> {
        if !self.has_start() {
            return Ok(());
        }
        let scannable = self.device.as_scannable();
        for &position in &self.points {
            if let Some(reason) = scannable
                .check_position_valid(position)
                .await
                .on_device(self.device.name(), "check_position_valid")?
            {
                return Err(ScanError::Construction(format!(
                    "position {position} is not valid for '{}': {reason}",
                    self.device.name()
                )));
            }
        }
        Ok(())
    }

    /// Start moving to the first position.
    ///
    /// Returns the step label, or `None` for read-only objects.
    pub async fn move_to_start(&mut self) -> ScanResult<Option<StepId>> {
        self.cursor = 0;
        self.move_to_cursor().await
    }

    /// Start moving to the next position.
    ///
    /// Fixed objects stay where they are.
    pub async fn move_step(&mut self) -> ScanResult<Option<StepId>> {
        if !self.is_stepped() {
            return Ok(None);
        }
        if self.cursor + 1 >= self.points.len() {
            return Err(ScanError::State(format!(
                "'{}' has no position after step {}",
                self.device.name(),
                self.cursor
            )));
        }
        self.cursor += 1;
        self.move_to_cursor().await
    }

    async fn move_to_cursor(&mut self) -> ScanResult<Option<StepId>> {
        let Some(&position) = self.points.get(self.cursor) else {
            return Ok(None);
        };
        if !self.has_start() {
            return Ok(None);
        }
        self.device
            .as_scannable()
            .move_to(position)
            .await
            .on_device(self.device.name(), "move_to")?;
        Ok(Some(StepId {
            device: self.device.name().to_string(),
            index: self.cursor,
            position,
        }))
    }

    /// Arguments that recreate this object in a scan command
    pub(crate) fn command_args(&self) -> String {
        match &self.motion {
            Motion::ReadOnly => String::new(),
            Motion::Fixed(position) => format!(" {position}"),
            Motion::Stepped { start, step } => format!(" {start} {step}"),
            Motion::Range { start, stop, step } => format!(" {start} {stop} {step}"),
            Motion::Explicit => {
                let list: Vec<String> = self.points.iter().map(f64::to_string).collect();
                format!(" [{}]", list.join(", "))
            }
        }
    }
}

impl fmt::Debug for ScanObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanObject")
            .field("device", &self.device.name())
            .field("motion", &self.motion)
            .field("points", &self.points.len())
            .field("cursor", &self.cursor)
            .finish()
    }
}

/// Give `step` the sign that moves from `start` towards `stop`.
#[must_use]
pub fn sort_step(start: f64, stop: f64, step: f64) -> f64 {
    if stop < start {
        -step.abs()
    } else {
        step.abs()
    }
}

/// Points in the inclusive range `start..=stop` taken `step` apart.
///
/// A final partial step shorter than the step size is dropped; rounding
/// noise up to a millionth of a step is tolerated.
pub fn number_of_points(start: f64, stop: f64, step: f64) -> ScanResult<usize> {
    if !(start.is_finite() && stop.is_finite() && step.is_finite()) {
        return Err(ScanError::Construction(format!(
            "range {start} to {stop} by {step} is not finite"
        )));
    }
    if step == 0.0 {
        if start == stop {
            return Ok(1);
        }
        return Err(ScanError::Construction(format!(
            "step size is zero for range {start} to {stop}"
        )));
    }
    let steps = ((stop - start) / step).abs() + STEP_TOLERANCE;
    if !steps.is_finite() || steps >= MAX_RANGE_POINTS as f64 {
        return Err(ScanError::Construction(format!(
            "range {start} to {stop} by {step} exceeds {MAX_RANGE_POINTS} points"
        )));
    }
    Ok(steps.floor() as usize + 1)
}
