//! Device capability contracts.
//!
//! The scan engine never owns hardware. It drives devices through small
//! capability traits, and a [`DeviceHandle`] records explicitly which
//! capabilities a device offers:
//!
//! - every device is a [`Scannable`] (level, position, non-blocking move, busy)
//! - a [`Detector`] additionally starts acquisitions and reads them out
//! - a [`DeferredValueProvider`] hands out a deferred value instead of a value
//! - a [`HardwareTriggeredDetector`] is armed once and then produces one frame
//!   per external trigger
//! - a [`ContinuousMoveController`] runs a whole trajectory in one motion
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//!
//! Capabilities are attached when the handle is built, so the engine never
//! inspects concrete device types at run time.
//!
//! # Example
//!
//! ```rust,ignore
//! let stage = Arc::new(SimMotor::new("stage_x"));
//! let counter = Arc::new(SimDetector::new("counter"));
//!
//! let stage = DeviceHandle::scannable(stage);
//! let counter = DeviceHandle::detector(counter);
//! ```

use crate::data_point::{DataValue, ValueFuture, DEFAULT_FORMAT};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Movement order. Lower levels move first; equal levels move together.
pub type Level = i32;

/// Level used by devices that do not choose one.
pub const DEFAULT_LEVEL: Level = 5;

/// Capability: something that can be positioned and sampled.
///
/// # Contract
/// - `move_to` starts motion and returns without waiting for it to finish
/// - `is_busy` reports whether a previously started move is still running
/// - `position` may be queried at any time
/// - hooks default to no-ops; devices override the ones they need
///
/// # Thread Safety
/// - All methods take `&self`; use interior mutability for state
#[async_trait]
pub trait Scannable: Send + Sync {
    /// Unique device name, used as the field name in data points
    fn name(&self) -> &str;

    /// Movement level
    fn level(&self) -> Level {
        DEFAULT_LEVEL
    }

    /// Display formats, one per element of the value.
    ///
    /// A device with no formats contributes no field to data points; such
    /// devices exist only for their hooks.
    fn output_format(&self) -> Vec<String> {
        vec![DEFAULT_FORMAT.to_string()]
    }

    /// Current position
    async fn position(&self) -> Result<DataValue>;

    /// Start moving to `position`
    ///
    /// # Returns
    /// - Ok(()) once motion has been initiated
    /// - Err if the move was rejected or the hardware failed
    async fn move_to(&self, position: f64) -> Result<()>;

    /// Whether a move (or acquisition) is in progress
    async fn is_busy(&self) -> Result<bool>;

    /// Stop motion immediately
    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Check a target without moving.
    ///
    /// # Returns
    /// `None` if the position is acceptable, otherwise the reason it is not.
    async fn check_position_valid(&self, _position: f64) -> Result<Option<String>> {
        Ok(None)
    }

    /// Called once before the first point of the scan
    async fn at_scan_start(&self) -> Result<()> {
        Ok(())
    }

    /// Called once after the last point of the scan
    async fn at_scan_end(&self) -> Result<()> {
        Ok(())
    }

    /// Called before each innermost line
    async fn at_scan_line_start(&self) -> Result<()> {
        Ok(())
    }

    /// Called after each innermost line
    async fn at_scan_line_end(&self) -> Result<()> {
        Ok(())
    }

    /// Called before any device at this device's level is moved
    async fn at_level_start(&self) -> Result<()> {
        Ok(())
    }

    /// Called just before this device is moved at its level
    async fn at_level_move_start(&self) -> Result<()> {
        Ok(())
    }

    /// Called once every device at this level is idle
    async fn at_level_end(&self) -> Result<()> {
        Ok(())
    }

    /// Called before each point
    async fn at_point_start(&self) -> Result<()> {
        Ok(())
    }

    /// Called after each point
    async fn at_point_end(&self) -> Result<()> {
        Ok(())
    }

    /// Called when the scan fails or is aborted
    async fn at_command_failure(&self) -> Result<()> {
        Ok(())
    }
}

/// Capability: measurement device.
///
/// # Contract
/// - `collect_data` starts an acquisition and returns immediately
/// - `is_busy` (from [`Scannable`]) is true while acquiring
/// - `readout` returns the data of the last acquisition
#[async_trait]
pub trait Detector: Scannable {
    /// Start an acquisition
    async fn collect_data(&self) -> Result<()>;

    /// Acquisition time in seconds
    async fn collection_time(&self) -> Result<f64>;

    /// Set the acquisition time in seconds
    async fn set_collection_time(&self, seconds: f64) -> Result<()>;

    /// Data from the last acquisition
    async fn readout(&self) -> Result<DataValue>;

    /// Wait until the current acquisition completes.
    ///
    /// # Default Implementation
    /// Polls `is_busy` every 10 ms.
    async fn wait_while_busy(&self) -> Result<()> {
        while self.is_busy().await? {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    /// Called once before the scan starts collecting
    async fn prepare_for_collection(&self) -> Result<()> {
        Ok(())
    }

    /// Called once after the scan has collected its last point
    async fn end_collection(&self) -> Result<()> {
        Ok(())
    }
}

/// Capability: value available later.
///
/// Returning the future must not block; the future itself is resolved by the
/// data-point pipeline on its worker pool.
pub trait DeferredValueProvider: Send + Sync {
    /// A future yielding the value for the point being sampled now
    fn deferred_value(&self) -> Result<ValueFuture>;
}

/// Capability: detector driven by external triggers during a continuous move.
///
/// # Contract
/// - `set_hardware_triggering(true)` before arming, `false` afterwards
/// - `arm` completes once the detector is ready to accept triggers
/// - `frame_value(i)` yields the data of frame `i` once it has been taken
#[async_trait]
pub trait HardwareTriggeredDetector: Detector {
    /// Switch between software and hardware triggering
    async fn set_hardware_triggering(&self, enabled: bool) -> Result<()>;

    /// Arm for a hardware-triggered line
    async fn arm(&self) -> Result<()>;

    /// Deferred data of one frame
    fn frame_value(&self, frame: usize) -> Result<ValueFuture>;
}

/// Capability: trajectory controller for hardware-triggered lines.
#[async_trait]
pub trait ContinuousMoveController: Send + Sync {
    /// Controller name, for logs and errors
    fn name(&self) -> &str;

    /// Enter or leave continuous operation
    async fn set_operating_continuously(&self, enabled: bool) -> Result<()>;

    /// Stop any motion and clear the previous trajectory
    async fn stop_and_reset(&self) -> Result<()>;

    /// Time between triggers, in seconds
    async fn set_trigger_period(&self, seconds: f64) -> Result<()>;

    /// Positions at which triggers are generated
    async fn set_trajectory(&self, positions: &[f64]) -> Result<()>;

    /// Move to the run-up position and load the trajectory
    async fn prepare_for_move(&self) -> Result<()>;

    /// Start the trajectory; returns without waiting for it
    async fn start_move(&self) -> Result<()>;

    /// Whether the trajectory is still running
    async fn is_moving(&self) -> Result<bool>;

    /// Abort the trajectory
    async fn stop(&self) -> Result<()>;
}

/// A device as the scan sees it: a scannable plus optional capabilities.
#[derive(Clone)]
pub struct DeviceHandle {
    scannable: Arc<dyn Scannable>,
    detector: Option<Arc<dyn Detector>>,
    deferred: Option<Arc<dyn DeferredValueProvider>>,
    triggered: Option<Arc<dyn HardwareTriggeredDetector>>,
}

impl DeviceHandle {
    /// A plain scannable.
    pub fn scannable<T: Scannable + 'static>(device: Arc<T>) -> Self {
        Self {
            scannable: device,
            detector: None,
            deferred: None,
            triggered: None,
        }
    }

    /// A detector.
    pub fn detector<T: Detector + 'static>(device: Arc<T>) -> Self {
        Self {
            scannable: device.clone(),
            detector: Some(device),
            deferred: None,
            triggered: None,
        }
    }

    /// A hardware-triggered detector.
    pub fn hardware_triggered<T: HardwareTriggeredDetector + 'static>(device: Arc<T>) -> Self {
        Self {
            scannable: device.clone(),
            detector: Some(device.clone()),
            deferred: None,
            triggered: Some(device),
        }
    }

    /// Sample this device through a deferred value instead of `position`/`readout`.
    #[must_use]
    pub fn with_deferred_values<T: DeferredValueProvider + 'static>(mut self, provider: Arc<T>) -> Self {
        self.deferred = Some(provider);
        self
    }

    /// Device name
    #[must_use]
    pub fn name(&self) -> &str {
        self.scannable.name()
    }

    /// Device level
    #[must_use]
    pub fn level(&self) -> Level {
        self.scannable.level()
    }

    /// The scannable view
    #[must_use]
    pub fn as_scannable(&self) -> &Arc<dyn Scannable> {
        &self.scannable
    }

    /// The detector capability, if present
    #[must_use]
    pub fn as_detector(&self) -> Option<&Arc<dyn Detector>> {
        self.detector.as_ref()
    }

    /// The deferred-value capability, if present
    #[must_use]
    pub fn as_deferred(&self) -> Option<&Arc<dyn DeferredValueProvider>> {
        self.deferred.as_ref()
    }

    /// The hardware-triggering capability, if present
    #[must_use]
    pub fn as_hardware_triggered(&self) -> Option<&Arc<dyn HardwareTriggeredDetector>> {
        self.triggered.as_ref()
    }

    /// True for detectors
    #[must_use]
    pub fn is_detector(&self) -> bool {
        self.detector.is_some()
    }

    /// True if both handles refer to the same device instance
    #[must_use]
    pub fn same_device(&self, other: &DeviceHandle) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.scannable), Arc::as_ptr(&other.scannable))
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("name", &self.name())
            .field("level", &self.level())
            .field("detector", &self.detector.is_some())
            .field("deferred", &self.deferred.is_some())
            .field("hardware_triggered", &self.triggered.is_some())
            .finish()
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
