//! Nested scan composer.
//!
//! A scan is written as a flat argument list, the way it would be typed at a
//! beamline console:
//!
//! ```text
//! scan x 0 10 1  y 0 2 1  z 5  w 0 0.5  temp  det 0.1
//! ```
//!
//! The first device must define a range (`start stop step`) or an explicit
//! position list. After that:
//!
//! | arguments               | meaning                                       |
//! |-------------------------|-----------------------------------------------|
//! | `dev`                   | sampled on every point, never moved           |
//! | `dev pos`               | moved to `pos` at the start of every line     |
//! | `dev start step`        | stepped along with the innermost dimension    |
//! | `dev start stop step`   | a new, nested dimension                       |
//! | `dev [p0, p1, ...]`     | a new, nested dimension                       |
//! | `det` / `det time`      | detector, optionally with a collection time   |
//! | [`ChildDimension`]      | a pre-built dimension, e.g. a triggered line  |
//!
//! Each dimension runs the next one to exhaustion for every one of its own
//! steps, so the total point count is the product of the step counts.

use crate::context::ScanContext;
use crate::coordinator::{self, wait_until_idle};
use crate::device::DeviceHandle;
use crate::error::{DeviceResultExt, ScanError, ScanResult};
use crate::pipeline::ReadoutMode;
use crate::readout::{self, RunState};
use crate::scan_object::ScanObject;
use crate::trigger::HardwareTriggeredLine;
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info_span, Instrument};

/// Every device taking part in a scan, in declared order.
#[derive(Debug, Clone, Default)]
pub struct DeviceSet {
    /// Scannables (moved or sampled)
    pub scannables: Vec<DeviceHandle>,
    /// Detectors
    pub detectors: Vec<DeviceHandle>,
}

impl DeviceSet {
    fn add_scannable(&mut self, device: DeviceHandle) -> ScanResult<()> {
        if self.contains(&device) {
            return Err(ScanError::Construction(format!(
                "'{}' appears more than once in the scan",
                device.name()
            )));
        }
        self.scannables.push(device);
        Ok(())
    }

    fn add_detector(&mut self, device: DeviceHandle) -> ScanResult<()> {
        if self.contains(&device) {
            return Err(ScanError::Construction(format!(
                "'{}' appears more than once in the scan",
                device.name()
            )));
        }
        self.detectors.push(device);
        Ok(())
    }

    fn contains(&self, device: &DeviceHandle) -> bool {
        self.all().any(|d| d.same_device(device))
    }

    /// Scannables followed by detectors
    pub fn all(&self) -> impl Iterator<Item = &DeviceHandle> {
        self.scannables.iter().chain(&self.detectors)
    }

    /// Number of devices
    #[must_use]
    pub fn len(&self) -> usize {
        self.scannables.len() + self.detectors.len()
    }

    /// True if there are no devices
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One element of a scan argument list.
pub enum ScanArg {
    /// A device
    Device(DeviceHandle),
    /// A number qualifying the preceding device
    Number(f64),
    /// An explicit position list for the preceding device
    Positions(Vec<f64>),
    /// A pre-built dimension
    Child(ChildDimension),
}

impl From<DeviceHandle> for ScanArg {
    fn from(device: DeviceHandle) -> Self {
        Self::Device(device)
    }
}

impl From<&DeviceHandle> for ScanArg {
    fn from(device: &DeviceHandle) -> Self {
        Self::Device(device.clone())
    }
}

impl From<f64> for ScanArg {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for ScanArg {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<Vec<f64>> for ScanArg {
    fn from(positions: Vec<f64>) -> Self {
        Self::Positions(positions)
    }
}

impl From<ChildDimension> for ScanArg {
    fn from(child: ChildDimension) -> Self {
        Self::Child(child)
    }
}

impl From<HardwareTriggeredLine> for ScanArg {
    fn from(line: HardwareTriggeredLine) -> Self {
        Self::Child(ChildDimension::hardware_triggered(line))
    }
}

impl fmt::Debug for ScanArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(device) => write!(f, "Device({})", device.name()),
            Self::Number(value) => write!(f, "Number({value})"),
            Self::Positions(positions) => write!(f, "Positions({positions:?})"),
            Self::Child(child) => write!(f, "Child({})", child.describe()),
        }
    }
}

/// Build an argument list from mixed devices, numbers and dimensions.
///
/// ```rust,ignore
/// let args = scan_args![x, 0.0, 4.0, 1.0, det, 0.1];
/// ```
#[macro_export]
macro_rules! scan_args {
    ($($arg:expr),* $(,)?) => {
        vec![$($crate::composer::ScanArg::from($arg)),*]
    };
}

enum LineStrategy {
    Stepped,
    HardwareTriggered(HardwareTriggeredLine),
}

/// A dimension built outside the argument grammar.
pub struct ChildDimension {
    principal: Option<ScanObject>,
    strategy: LineStrategy,
    must_be_innermost: bool,
}

impl ChildDimension {
    /// A stepped dimension driven by `object`, which must define its own range.
    pub fn stepped(object: ScanObject) -> ScanResult<Self> {
        if !object.has_stop() {
            return Err(ScanError::Construction(format!(
                "'{}' does not define a range and cannot form a dimension",
                object.device().name()
            )));
        }
        Ok(Self {
            principal: Some(object),
            strategy: LineStrategy::Stepped,
            must_be_innermost: false,
        })
    }

    /// A hardware-triggered line; always relocated to be the innermost dimension.
    #[must_use]
    pub fn hardware_triggered(line: HardwareTriggeredLine) -> Self {
        Self {
            principal: None,
            strategy: LineStrategy::HardwareTriggered(line),
            must_be_innermost: true,
        }
    }

    /// Require this dimension to be the innermost one.
    #[must_use]
    pub fn must_be_innermost(mut self) -> Self {
        self.must_be_innermost = true;
        self
    }

    fn describe(&self) -> String {
        match (&self.strategy, &self.principal) {
            (LineStrategy::HardwareTriggered(line), _) => line.describe(),
            (LineStrategy::Stepped, Some(object)) => {
                format!("{}{}", object.device().name(), object.command_args())
            }
            (LineStrategy::Stepped, None) => String::new(),
        }
    }
}

struct Dimension {
    objects: Vec<ScanObject>,
    strategy: LineStrategy,
    must_be_innermost: bool,
    points: usize,
}

impl Dimension {
    fn from_object(object: ScanObject) -> Self {
        Self {
            points: object.number_points().unwrap_or(1),
            objects: vec![object],
            strategy: LineStrategy::Stepped,
            must_be_innermost: false,
        }
    }

    fn from_child(child: ChildDimension) -> Self {
        let points = match (&child.strategy, &child.principal) {
            (LineStrategy::HardwareTriggered(line), _) => line.number_points(),
            (LineStrategy::Stepped, Some(object)) => object.number_points().unwrap_or(1),
            (LineStrategy::Stepped, None) => 1,
        };
        Self {
            objects: child.principal.into_iter().collect(),
            strategy: child.strategy,
            must_be_innermost: child.must_be_innermost,
            points,
        }
    }

    fn label(&self) -> String {
        match (&self.strategy, self.objects.first()) {
            (LineStrategy::HardwareTriggered(line), _) => line.axis_name().to_string(),
            (LineStrategy::Stepped, Some(object)) => object.device().name().to_string(),
            (LineStrategy::Stepped, None) => "?".to_string(),
        }
    }
}

/// A composed scan: a chain of dimensions over a shared device set.
pub struct ScanTree {
    dimensions: Vec<Dimension>,
    devices: Arc<DeviceSet>,
    collection_times: Vec<(DeviceHandle, f64)>,
    command: String,
}

impl ScanTree {
    /// Parse an argument list into a chain of dimensions.
    ///
    /// Device position checks are asynchronous and done by [`ScanTree::validate`].
    pub fn parse(args: Vec<ScanArg>) -> ScanResult<Self> {
        let mut args = args.into_iter().peekable();
        let mut devices = DeviceSet::default();
        let mut dimensions: Vec<Dimension> = Vec::new();
        let mut shared: Vec<ScanObject> = Vec::new();
        let mut collection_times = Vec::new();
        let mut command = String::from("scan");

        while let Some(arg) = args.next() {
            let device = match arg {
                ScanArg::Device(device) => device,
                ScanArg::Child(child) => {
                    if dimensions.is_empty() {
                        return Err(ScanError::Construction(
                            "the first argument must be a scannable with a range".to_string(),
                        ));
                    }
                    command.push(' ');
                    command.push_str(&child.describe());
                    if let Some(object) = &child.principal {
                        devices.add_scannable(object.device().clone())?;
                    }
                    if let LineStrategy::HardwareTriggered(line) = &child.strategy {
                        devices.add_scannable(line.axis().clone())?;
                        for detector in line.detectors() {
                            devices.add_detector(detector.clone())?;
                        }
                    }
                    dimensions.push(Dimension::from_child(child));
                    continue;
                }
                ScanArg::Number(value) => {
                    return Err(ScanError::Construction(format!(
                        "value {value} does not follow a device"
                    )))
                }
                ScanArg::Positions(positions) => {
                    return Err(ScanError::Construction(format!(
                        "position list {positions:?} does not follow a device"
                    )))
                }
            };

            let mut numbers = Vec::new();
            let mut positions = None;
            while matches!(args.peek(), Some(ScanArg::Number(_) | ScanArg::Positions(_))) {
                match args.next() {
                    Some(ScanArg::Number(value)) if positions.is_none() => numbers.push(value),
                    Some(ScanArg::Positions(list)) if positions.is_none() && numbers.is_empty() => {
                        positions = Some(list)
                    }
                    _ => {
                        return Err(ScanError::Construction(format!(
                            "'{}' takes either numbers or one position list",
                            device.name()
                        )))
                    }
                }
            }

            command.push(' ');
            command.push_str(device.name());

            if device.is_detector() {
                if dimensions.is_empty() {
                    return Err(ScanError::Construction(format!(
                        "the first argument must be a scannable with a range, not detector '{}'",
                        device.name()
                    )));
                }
                match (numbers.as_slice(), positions) {
                    ([], None) => {}
                    ([time], None) => {
                        command.push_str(&format!(" {time}"));
                        collection_times.push((device.clone(), *time));
                    }
                    _ => {
                        return Err(ScanError::Construction(format!(
                            "detector '{}' takes at most a collection time",
                            device.name()
                        )))
                    }
                }
                devices.add_detector(device)?;
                continue;
            }

            let object = match (numbers.as_slice(), positions) {
                ([], Some(list)) => ScanObject::explicit(device.clone(), list)?,
                ([], None) => ScanObject::read_only(device.clone()),
                ([position], None) => ScanObject::fixed(device.clone(), *position),
                ([start, step], None) => ScanObject::stepped(device.clone(), *start, *step),
                ([start, stop, step], None) => ScanObject::range(device.clone(), *start, *stop, *step)?,
                _ => {
                    return Err(ScanError::Construction(format!(
                        "'{}' takes 0 to 3 numbers, got {}",
                        device.name(),
                        numbers.len()
                    )))
                }
            };

            if dimensions.is_empty() && !object.has_stop() {
                return Err(ScanError::Construction(format!(
                    "the first argument must be a scannable with a range, '{}' has none",
                    device.name()
                )));
            }

            command.push_str(&object.command_args());
            devices.add_scannable(device)?;
            if object.has_stop() {
                dimensions.push(Dimension::from_object(object));
            } else {
                shared.push(object);
            }
        }

        if dimensions.is_empty() {
            return Err(ScanError::Construction("no devices to scan".to_string()));
        }

        relocate_innermost(&mut dimensions)?;
        share_into_innermost(&mut dimensions, shared)?;
        check_point_counts(&dimensions)?;
        check_hardware_triggering(&dimensions, &devices)?;

        let tree = Self {
            dimensions,
            devices: Arc::new(devices),
            collection_times,
            command,
        };
        debug!(command = %tree.command, dimensions = ?tree.dimensions(), "Composed scan");
        Ok(tree)
    }

    /// Ask every device whether its target positions are acceptable.
    pub async fn validate(&self) -> ScanResult<()> {
        for dimension in &self.dimensions {
            for object in &dimension.objects {
                object.validate_points().await?;
            }
            if let LineStrategy::HardwareTriggered(line) = &dimension.strategy {
                line.validate_points().await?;
            }
        }
        Ok(())
    }

    /// Points per dimension, outermost first
    #[must_use]
    pub fn dimensions(&self) -> Vec<usize> {
        self.dimensions.iter().map(|d| d.points).collect()
    }

    /// Product of the dimension sizes
    #[must_use]
    pub fn total_points(&self) -> usize {
        self.dimensions.iter().map(|d| d.points).product()
    }

    /// The shared device set
    #[must_use]
    pub fn devices(&self) -> &Arc<DeviceSet> {
        &self.devices
    }

    /// Command string the tree was built from
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Detector collection times given in the argument list
    pub(crate) fn collection_times(&self) -> &[(DeviceHandle, f64)] {
        &self.collection_times
    }

    /// Names of the principal device of each dimension, outermost first
    #[must_use]
    pub fn dimension_labels(&self) -> Vec<String> {
        self.dimensions.iter().map(Dimension::label).collect()
    }

    /// Whether the scan moves `device` at all
    #[must_use]
    pub fn is_moved(&self, device: &DeviceHandle) -> bool {
        self.dimensions.iter().any(|dimension| {
            dimension
                .objects
                .iter()
                .any(|o| o.has_start() && o.device().same_device(device))
                || matches!(&dimension.strategy, LineStrategy::HardwareTriggered(line) if line.axis().same_device(device))
        })
    }

    /// Move order summary, e.g. `| x | y, *det || temp |`
    #[must_use]
    pub fn report_devices_by_level(&self) -> String {
        coordinator::report_devices_by_level(&self.devices, |d| self.is_moved(d))
    }

    /// Detectors that acquire while scannables on their level are moving
    #[must_use]
    pub fn detectors_moving_concurrently(&self) -> Vec<String> {
        coordinator::detectors_moving_concurrently(&self.devices, |d| self.is_moved(d))
    }

    /// Scannables that the scan moves, with their current positions
    pub(crate) fn moved_scannables(&self) -> Vec<DeviceHandle> {
        self.devices
            .scannables
            .iter()
            .filter(|d| self.is_moved(d))
            .cloned()
            .collect()
    }

    /// Run every dimension to completion.
    pub(crate) async fn collect(&mut self, ctx: &ScanContext, run: &mut RunState) -> ScanResult<()> {
        collect_dimension(&mut self.dimensions, 0, ctx, run).await
    }
}

impl fmt::Debug for ScanTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanTree")
            .field("command", &self.command)
            .field("dimensions", &self.dimensions())
            .field("devices", &self.devices.len())
            .finish()
    }
}

fn relocate_innermost(dimensions: &mut Vec<Dimension>) -> ScanResult<()> {
    let flagged: Vec<usize> = dimensions
        .iter()
        .enumerate()
        .filter(|(_, d)| d.must_be_innermost)
        .map(|(i, _)| i)
        .collect();
    match flagged.as_slice() {
        [] => Ok(()),
        [index] => {
            let dimension = dimensions.remove(*index);
            dimensions.push(dimension);
            Ok(())
        }
        _ => Err(ScanError::Construction(format!(
            "{} dimensions must be innermost; only one can be",
            flagged.len()
        ))),
    }
}

fn share_into_innermost(dimensions: &mut [Dimension], shared: Vec<ScanObject>) -> ScanResult<()> {
    let Some(innermost) = dimensions.last_mut() else {
        return Ok(());
    };
    for mut object in shared {
        if matches!(innermost.strategy, LineStrategy::HardwareTriggered(_)) && object.is_stepped() {
            return Err(ScanError::Construction(format!(
                "'{}' cannot be stepped during a hardware-triggered line",
                object.device().name()
            )));
        }
        object.set_number_points(innermost.points);
        innermost.objects.push(object);
    }
    Ok(())
}

fn check_point_counts(dimensions: &[Dimension]) -> ScanResult<()> {
    for dimension in dimensions {
        if dimension.points == 0 {
            return Err(ScanError::Construction(format!(
                "dimension '{}' has no points",
                dimension.label()
            )));
        }
        for object in &dimension.objects {
            let count = object.number_points().unwrap_or(object.points().len());
            if object.is_stepped() && count != dimension.points {
                return Err(ScanError::Construction(format!(
                    "'{}' has {count} points but its dimension has {}",
                    object.device().name(),
                    dimension.points
                )));
            }
        }
    }
    Ok(())
}

fn check_hardware_triggering(dimensions: &[Dimension], devices: &DeviceSet) -> ScanResult<()> {
    let Some(line) = dimensions.iter().find_map(|d| match &d.strategy {
        LineStrategy::HardwareTriggered(line) => Some(line),
        LineStrategy::Stepped => None,
    }) else {
        return Ok(());
    };
    for detector in &devices.detectors {
        if !line.detectors().iter().any(|d| d.same_device(detector)) {
            return Err(ScanError::Construction(format!(
                "detector '{}' is not part of the hardware-triggered line and cannot be triggered",
                detector.name()
            )));
        }
    }
    Ok(())
}

fn collect_dimension<'a>(
    dimensions: &'a mut [Dimension],
    depth: usize,
    ctx: &'a ScanContext,
    run: &'a mut RunState,
) -> BoxFuture<'a, ScanResult<()>> {
    async move {
        let Some((dimension, inner)) = dimensions.split_first_mut() else {
            return Ok(());
        };

        if inner.is_empty() {
            let span = info_span!("line", dimension = depth, points = dimension.points);
            return run_line(dimension, depth, ctx, run).instrument(span).await;
        }

        for step in 0..dimension.points {
            if step > 0 {
                ctx.wait_if_paused().await?;
                if ctx.finish_early_requested() {
                    return Ok(());
                }
            }
            let step_id = move_principal(dimension, ctx, step == 0).await?;
            run.set_step_id(depth, step_id);
            collect_dimension(inner, depth + 1, ctx, run).await?;
            if ctx.finish_early_requested() {
                return Ok(());
            }
        }
        Ok(())
    }
    .boxed()
}

/// Step an outer dimension: only its principal object moves.
async fn move_principal(
    dimension: &mut Dimension,
    ctx: &ScanContext,
    first: bool,
) -> ScanResult<Option<crate::data_point::StepId>> {
    let Some(principal) = dimension.objects.first_mut() else {
        return Ok(None);
    };
    let device = principal.device().clone();
    let scannable = device.as_scannable();

    ctx.check_cancelled()?;
    scannable.at_level_start().await.on_device(device.name(), "at_level_start")?;
    scannable
        .at_level_move_start()
        .await
        .on_device(device.name(), "at_level_move_start")?;
    let step = if first {
        principal.move_to_start().await?
    } else {
        principal.move_step().await?
    };
    wait_until_idle(ctx, std::slice::from_ref(&device)).await?;
    scannable.at_level_end().await.on_device(device.name(), "at_level_end")?;
    Ok(step)
}

async fn run_line(dimension: &mut Dimension, depth: usize, ctx: &ScanContext, run: &mut RunState) -> ScanResult<()> {
    for device in ctx.devices.all() {
        device
            .as_scannable()
            .at_scan_line_start()
            .await
            .on_device(device.name(), "at_scan_line_start")?;
    }

    match &dimension.strategy {
        LineStrategy::Stepped => run_stepped_line(dimension, depth, ctx, run).await?,
        LineStrategy::HardwareTriggered(line) => line.run(&mut dimension.objects, depth, ctx, run).await?,
    }

    for device in ctx.devices.all() {
        device
            .as_scannable()
            .at_scan_line_end()
            .await
            .on_device(device.name(), "at_scan_line_end")?;
    }
    Ok(())
}

async fn run_stepped_line(
    dimension: &mut Dimension,
    depth: usize,
    ctx: &ScanContext,
    run: &mut RunState,
) -> ScanResult<()> {
    let concurrent = ctx.readout_mode() == ReadoutMode::Concurrent;
    let points = dimension.points;

    for step in 0..points {
        if step > 0 {
            ctx.wait_if_paused().await?;
            if ctx.finish_early_requested() {
                break;
            }
        }
        let first = step == 0;
        let last = step + 1 == points;

        for device in &ctx.devices.scannables {
            device
                .as_scannable()
                .at_point_start()
                .await
                .on_device(device.name(), "at_point_start")?;
        }
        // In concurrent mode the readout task starts the next point's detector hooks.
        if !concurrent || first {
            for device in &ctx.devices.detectors {
                device
                    .as_scannable()
                    .at_point_start()
                    .await
                    .on_device(device.name(), "at_point_start")?;
            }
        }

        let index = run.next_point_index();
        let step_id = coordinator::acquire_point(ctx, &mut dimension.objects, run, first, true).await?;
        run.set_step_id(depth, step_id);
        ctx.check_cancelled()?;

        readout::read_and_publish(ctx, run, index, last).await?;

        for device in &ctx.devices.scannables {
            device
                .as_scannable()
                .at_point_end()
                .await
                .on_device(device.name(), "at_point_end")?;
        }
        if !concurrent {
            for device in &ctx.devices.detectors {
                device
                    .as_scannable()
                    .at_point_end()
                    .await
                    .on_device(device.name(), "at_point_end")?;
            }
        }
        ctx.check_cancelled()?;
    }

    run.wait_for_readout(&ctx.cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDetector, SimMotor, SimMoveController, SimTriggeredDetector};

    fn motor(name: &str) -> DeviceHandle {
        DeviceHandle::scannable(Arc::new(SimMotor::new(name)))
    }

    fn detector(name: &str) -> DeviceHandle {
        DeviceHandle::detector(Arc::new(SimDetector::new(name)))
    }

    fn triggered_line(axis: &DeviceHandle, detectors: &[&str]) -> HardwareTriggeredLine {
        let mut line = HardwareTriggeredLine::new(
            axis.clone(),
            Arc::new(SimMoveController::new("ctrl")),
            0.0,
            1.0,
            0.25,
        )
        .unwrap();
        for name in detectors {
            line = line
                .with_detector(DeviceHandle::hardware_triggered(Arc::new(SimTriggeredDetector::new(name))))
                .unwrap();
        }
        line
    }

    #[test]
    fn nested_ranges_multiply() {
        let (x, y, det) = (motor("x"), motor("y"), detector("det"));
        let tree = ScanTree::parse(scan_args![&x, 0, 4, 1, &y, 0.0, 1.0, 0.5, &det, 0.1]).unwrap();

        assert_eq!(tree.dimensions(), vec![5, 3]);
        assert_eq!(tree.total_points(), 15);
        assert_eq!(tree.command(), "scan x 0 4 1 y 0 1 0.5 det 0.1");
        assert_eq!(tree.dimension_labels(), vec!["x", "y"]);
        assert_eq!(tree.devices().detectors.len(), 1);
        assert_eq!(tree.collection_times().len(), 1);
    }

    #[test]
    fn fixed_and_stepped_objects_join_innermost() {
        let (x, y, z, w, temp) = (motor("x"), motor("y"), motor("z"), motor("w"), motor("temp"));
        let tree = ScanTree::parse(scan_args![&x, 0, 2, 1, &y, vec![5.0, 6.0], &z, 3, &w, 10, -1, &temp]).unwrap();

        assert_eq!(tree.dimensions(), vec![3, 2]);
        let innermost = tree.dimensions.last().unwrap();
        let names: Vec<&str> = innermost.objects.iter().map(|o| o.device().name()).collect();
        assert_eq!(names, vec!["y", "z", "w", "temp"]);
        assert_eq!(innermost.objects[2].points(), &[10.0, 9.0]);
        assert!(tree.is_moved(&z));
        assert!(!tree.is_moved(&temp));
        assert_eq!(tree.report_devices_by_level(), "| x, y, z, w || temp |");
    }

    #[test]
    fn first_argument_needs_a_range() {
        let (x, det) = (motor("x"), detector("det"));
        assert!(ScanTree::parse(scan_args![&x, 1]).is_err());
        assert!(ScanTree::parse(scan_args![&det, 0, 1, 1]).is_err());
        assert!(ScanTree::parse(Vec::new()).is_err());
        assert!(ScanTree::parse(scan_args![1.0]).is_err());
    }

    #[test]
    fn argument_count_errors() {
        let (x, y) = (motor("x"), motor("y"));
        let err = ScanTree::parse(scan_args![&x, 0, 1, 1, &y, 1, 2, 3, 4]).unwrap_err();
        assert!(err.to_string().contains("0 to 3 numbers"));
        assert!(ScanTree::parse(scan_args![&x, 0, 1, 1, &x, 2]).is_err());
    }

    #[test]
    fn hardware_line_is_moved_innermost() {
        let (x, axis, y) = (motor("x"), motor("theta"), motor("y"));
        let line = triggered_line(&axis, &["d1", "d2"]);
        let tree = ScanTree::parse(scan_args![&x, 0, 1, 1, line, &y, 0, 2, 1]).unwrap();

        assert_eq!(tree.dimensions(), vec![2, 3, 5]);
        assert_eq!(tree.dimension_labels(), vec!["x", "y", "theta"]);
        assert_eq!(tree.devices().detectors.len(), 2);
        assert!(tree.command().contains("theta 0 1 0.25 d1 d2"));
    }

    #[test]
    fn only_one_innermost_dimension() {
        let (x, a, b) = (motor("x"), motor("a"), motor("b"));
        let err = ScanTree::parse(scan_args![&x, 0, 1, 1, triggered_line(&a, &["d1"]), triggered_line(&b, &["d2"])])
            .unwrap_err();
        assert!(err.to_string().contains("innermost"));
    }

    #[test]
    fn software_detectors_rejected_with_hardware_line() {
        let (x, axis, det) = (motor("x"), motor("theta"), detector("det"));
        let err = ScanTree::parse(scan_args![&x, 0, 1, 1, triggered_line(&axis, &["d1"]), &det]).unwrap_err();
        assert!(err.to_string().contains("det"));
    }

    #[tokio::test]
    async fn validation_checks_shared_objects() {
        let x = motor("x");
        let limited = DeviceHandle::scannable(Arc::new(SimMotor::new("lim").with_limits(0.0, 1.0)));
        let tree = ScanTree::parse(scan_args![&x, 0, 3, 1, &limited, 0, 0.5]).unwrap();

        let err = tree.validate().await.unwrap_err();
        assert!(err.to_string().contains("lim"));
    }
}
