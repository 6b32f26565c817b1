//! Level-ordered move coordinator.
//!
//! Devices are grouped by level, lowest first. Within a level every move (and
//! every detector acquisition) is started before any of them is waited on, so
//! devices on the same level move together; the next level does not start
//! until every device on this one reports idle.

use crate::composer::DeviceSet;
use crate::context::ScanContext;
use crate::data_point::StepId;
use crate::device::{DeviceHandle, Level};
use crate::error::{DeviceResultExt, ScanResult};
use crate::pipeline::ReadoutMode;
use crate::readout::RunState;
use crate::scan_object::ScanObject;
use futures::future::try_join_all;
use std::collections::BTreeMap;
use tracing::trace;

/// Devices grouped by level, lowest level first, declared order within a level.
pub(crate) fn devices_by_level(devices: &DeviceSet, include_detectors: bool) -> BTreeMap<Level, Vec<DeviceHandle>> {
    let mut levels: BTreeMap<Level, Vec<DeviceHandle>> = BTreeMap::new();
    let detectors = devices.detectors.iter().filter(|_| include_detectors);
    for device in devices.scannables.iter().chain(detectors) {
        levels.entry(device.level()).or_default().push(device.clone());
    }
    levels
}

/// One-line summary of the move order: `| x | y, *det || monitor |`.
///
/// Detectors are starred; scannables that are never moved are listed after
/// the double bar.
pub(crate) fn report_devices_by_level(devices: &DeviceSet, is_moved: impl Fn(&DeviceHandle) -> bool) -> String {
    let mut groups = Vec::new();
    for group in devices_by_level(devices, true).values() {
        let names: Vec<String> = group
            .iter()
            .filter_map(|device| {
                if device.is_detector() {
                    Some(format!("*{}", device.name()))
                } else {
                    is_moved(device).then(|| device.name().to_string())
                }
            })
            .collect();
        if !names.is_empty() {
            groups.push(names.join(", "));
        }
    }

    let monitors: Vec<&str> = devices
        .scannables
        .iter()
        .filter(|device| !is_moved(device))
        .map(DeviceHandle::name)
        .collect();

    let mut report = format!("| {} |", groups.join(" | "));
    if !monitors.is_empty() {
        report.push_str(&format!("| {} |", monitors.join(", ")));
    }
    report
}

/// Detectors that acquire while a moved scannable on the same level is in motion.
pub(crate) fn detectors_moving_concurrently(devices: &DeviceSet, is_moved: impl Fn(&DeviceHandle) -> bool) -> Vec<String> {
    devices_by_level(devices, true)
        .values()
        .filter(|group| group.iter().any(|d| !d.is_detector() && is_moved(d)))
        .flat_map(|group| group.iter().filter(|d| d.is_detector()).map(|d| d.name().to_string()))
        .collect()
}

/// Move this dimension's scan objects one step (or to their start) and, if
/// asked, trigger the detectors, level by level.
///
/// Returns the step label of the dimension's principal scan object.
pub(crate) async fn acquire_point(
    ctx: &ScanContext,
    objects: &mut [ScanObject],
    run: &mut RunState,
    move_to_first: bool,
    trigger_detectors: bool,
) -> ScanResult<Option<StepId>> {
    let mut principal_step = None;

    for (level, devices) in devices_by_level(&ctx.devices, trigger_detectors) {
        if ctx.readout_mode() == ReadoutMode::Concurrent && devices.iter().any(DeviceHandle::is_detector) {
            run.wait_for_readout(&ctx.cancel).await?;
        }
        ctx.check_cancelled()?;
        trace!(level, devices = devices.len(), "Moving level");

        for device in &devices {
            device
                .as_scannable()
                .at_level_start()
                .await
                .on_device(device.name(), "at_level_start")?;
        }
        for device in &devices {
            if objects.iter().any(|o| o.has_start() && o.device().same_device(device)) {
                device
                    .as_scannable()
                    .at_level_move_start()
                    .await
                    .on_device(device.name(), "at_level_move_start")?;
            }
        }

        for device in &devices {
            if let Some(position) = objects.iter().position(|o| o.device().same_device(device)) {
                let object = &mut objects[position];
                let step = if move_to_first {
                    object.move_to_start().await?
                } else {
                    object.move_step().await?
                };
                if position == 0 {
                    principal_step = step;
                }
            } else if let Some(detector) = device.as_detector() {
                detector
                    .collect_data()
                    .await
                    .on_device(device.name(), "collect_data")?;
            }
        }

        wait_until_idle(ctx, &devices).await?;

        for device in &devices {
            device
                .as_scannable()
                .at_level_end()
                .await
                .on_device(device.name(), "at_level_end")?;
        }
    }

    Ok(principal_step)
}

/// Poll until none of `devices` is busy. A pause holds the poll loop until
/// the scan is resumed.
pub(crate) async fn wait_until_idle(ctx: &ScanContext, devices: &[DeviceHandle]) -> ScanResult<()> {
    let interval = ctx.config.motion.busy_poll_interval();
    loop {
        ctx.check_cancelled()?;
        ctx.wait_if_paused().await?;
        let queries = devices.iter().map(|device| async move {
            device.as_scannable().is_busy().await.on_device(device.name(), "is_busy")
        });
        if !try_join_all(queries).await?.into_iter().any(|busy| busy) {
            return Ok(());
        }
        ctx.sleep(interval).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDetector, SimMotor};
    use std::sync::Arc;

    fn device_set() -> DeviceSet {
        let x = DeviceHandle::scannable(Arc::new(SimMotor::new("x").with_level(1)));
        let y = DeviceHandle::scannable(Arc::new(SimMotor::new("y").with_level(3)));
        let z = DeviceHandle::scannable(Arc::new(SimMotor::new("z").with_level(3)));
        let monitor = DeviceHandle::scannable(Arc::new(SimMotor::new("temp").with_level(1)));
        let det = DeviceHandle::detector(Arc::new(SimDetector::new("det").with_level(3)));
        DeviceSet {
            scannables: vec![y, x, z, monitor],
            detectors: vec![det],
        }
    }

    #[test]
    fn groups_ascending_in_declared_order() {
        let levels = devices_by_level(&device_set(), true);
        let names: Vec<(Level, Vec<&str>)> = levels
            .iter()
            .map(|(level, devices)| (*level, devices.iter().map(DeviceHandle::name).collect()))
            .collect();
        assert_eq!(names, vec![(1, vec!["x", "temp"]), (3, vec!["y", "z", "det"])]);

        let without_detectors = devices_by_level(&device_set(), false);
        assert_eq!(without_detectors[&3].len(), 2);
    }

    #[test]
    fn report_marks_detectors_and_monitors() {
        let devices = device_set();
        let report = report_devices_by_level(&devices, |d| d.name() != "temp");
        assert_eq!(report, "| x | y, z, *det || temp |");
        assert_eq!(detectors_moving_concurrently(&devices, |d| d.name() != "temp"), vec!["det"]);
    }
}
