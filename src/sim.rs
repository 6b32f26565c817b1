//! Simulated devices
//!
//! Software stand-ins for motors, counters, hardware-triggered detectors and
//! trajectory controllers, used by the CLI demo and the test suite. All of
//! them use async timing (`tokio::time::sleep`), never blocking sleeps, and
//! honour the non-blocking `move_to` / `collect_data` contract by running the
//! motion or exposure in a background task.
//!
//! Every device can share an [`EventLog`], which records each call with a
//! timestamp so tests can check the order in which the scan drove devices.
//!
//! # Available Devices
//!
//! - `SimMotor` - axis with speed, soft limits and failure injection
//! - `SimDetector` - counter with exposure time, readout delay and optional
//!   deferred values
//! - `SimTriggeredDetector` - detector armed for hardware-triggered lines
//! - `SimMoveController` - trajectory controller for hardware-triggered lines

use crate::data_point::{DataValue, ValueFuture};
use crate::device::{
    ContinuousMoveController, DeferredValueProvider, Detector, HardwareTriggeredDetector, Level, Scannable,
    DEFAULT_LEVEL,
};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

// =============================================================================
// EventLog - recording of device calls
// =============================================================================

/// A call made on a simulated device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceAction {
    /// `move_to` accepted
    MoveTo(f64),
    /// Motion finished
    MoveDone,
    /// `collect_data` accepted
    Collect,
    /// `readout` started
    ReadoutStart,
    /// `readout` returned
    ReadoutDone,
    /// `arm` started
    Arm,
    /// `stop` called
    Stop,
    /// Hook or lifecycle call, by name
    Hook(&'static str),
}

/// One recorded call.
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    /// Device name
    pub device: String,
    /// What happened
    pub action: DeviceAction,
    /// When it happened
    pub at: Instant,
}

/// Shared, append-only record of device calls.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<DeviceEvent>>>,
}

impl EventLog {
    /// New empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event
    pub fn record(&self, device: &str, action: DeviceAction) {
        self.events.lock().push(DeviceEvent {
            device: device.to_string(),
            action,
            at: Instant::now(),
        });
    }

    /// Copy of all events in order
    #[must_use]
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events.lock().clone()
    }

    /// Actions recorded for one device, in order
    #[must_use]
    pub fn actions_for(&self, device: &str) -> Vec<DeviceAction> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.device == device)
            .map(|e| e.action.clone())
            .collect()
    }

    /// Number of times `device` performed `action`
    #[must_use]
    pub fn count(&self, device: &str, action: &DeviceAction) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.device == device && &e.action == action)
            .count()
    }
}

/// Records hooks into an optional log.
#[derive(Debug, Clone, Default)]
struct Recorder {
    name: String,
    log: Option<EventLog>,
}

impl Recorder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            log: None,
        }
    }

    fn record(&self, action: DeviceAction) {
        if let Some(log) = &self.log {
            log.record(&self.name, action);
        }
    }

    fn hook(&self, hook: &'static str) -> Result<()> {
        self.record(DeviceAction::Hook(hook));
        Ok(())
    }
}

fn task_running(task: &Mutex<Option<JoinHandle<()>>>) -> bool {
    task.lock().as_ref().is_some_and(|t| !t.is_finished())
}

fn replace_task(task: &Mutex<Option<JoinHandle<()>>>, next: JoinHandle<()>) {
    if let Some(previous) = task.lock().replace(next) {
        previous.abort();
    }
}

fn abort_task(task: &Mutex<Option<JoinHandle<()>>>) {
    if let Some(running) = task.lock().take() {
        running.abort();
    }
}

// =============================================================================
// SimMotor - simulated axis
// =============================================================================

/// Simulated motion axis
///
/// Simulates a linear axis with:
/// - configurable speed (default 10 units/sec, `f64::INFINITY` for instant moves)
/// - optional soft limits reported through `check_position_valid`
/// - optional failure when asked to move to a given position
///
/// # Example
///
/// ```
/// # use daq_scan::device::Scannable;
/// # use daq_scan::sim::SimMotor;
/// # tokio_test::block_on(async {
/// let stage = SimMotor::new("stage_x").with_speed(50.0);
/// stage.move_to(10.0).await?; // returns immediately
/// stage.wait_idle().await;    // ~200ms later
/// assert_eq!(stage.current_position(), 10.0);
/// # Ok::<(), anyhow::Error>(())
/// # }).unwrap();
/// ```
pub struct SimMotor {
    recorder: Recorder,
    level: Level,
    position: Arc<Mutex<f64>>,
    speed: f64,
    limits: Option<(f64, f64)>,
    fail_at: Option<f64>,
    motion: Mutex<Option<JoinHandle<()>>>,
    moves: AtomicUsize,
    stops: AtomicUsize,
}

impl SimMotor {
    /// New motor at 0.0 on the default level
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            recorder: Recorder::new(name),
            level: DEFAULT_LEVEL,
            position: Arc::new(Mutex::new(0.0)),
            speed: 10.0,
            limits: None,
            fail_at: None,
            motion: Mutex::new(None),
            moves: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    /// Set the movement level
    #[must_use]
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Set the speed in units per second
    #[must_use]
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    /// Set the initial position
    #[must_use]
    pub fn with_position(self, position: f64) -> Self {
        *self.position.lock() = position;
        self
    }

    /// Reject targets outside `low..=high`
    #[must_use]
    pub fn with_limits(mut self, low: f64, high: f64) -> Self {
        self.limits = Some((low, high));
        self
    }

    /// Fail any move to `position`
    #[must_use]
    pub fn failing_at(mut self, position: f64) -> Self {
        self.fail_at = Some(position);
        self
    }

    /// Record calls into `log`
    #[must_use]
    pub fn with_log(mut self, log: &EventLog) -> Self {
        self.recorder.log = Some(log.clone());
        self
    }

    /// Position right now (mid-move positions are not interpolated)
    #[must_use]
    pub fn current_position(&self) -> f64 {
        *self.position.lock()
    }

    /// Number of accepted moves
    #[must_use]
    pub fn move_count(&self) -> usize {
        self.moves.load(Ordering::SeqCst)
    }

    /// Number of `stop` calls
    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Wait until any move in progress has finished
    pub async fn wait_idle(&self) {
        while task_running(&self.motion) {
            sleep(Duration::from_millis(1)).await;
        }
    }

    fn limit_violation(&self, position: f64) -> Option<String> {
        let (low, high) = self.limits?;
        (position < low || position > high).then(|| format!("outside limits [{low}, {high}]"))
    }
}

#[async_trait]
impl Scannable for SimMotor {
    fn name(&self) -> &str {
        &self.recorder.name
    }

    fn level(&self) -> Level {
        self.level
    }

    async fn position(&self) -> Result<DataValue> {
        Ok(DataValue::Scalar(self.current_position()))
    }

    async fn move_to(&self, target: f64) -> Result<()> {
        if self.fail_at == Some(target) {
            bail!("drive fault moving to {target}");
        }
        if let Some(reason) = self.limit_violation(target) {
            bail!("target {target} is {reason}");
        }

        let distance = (target - self.current_position()).abs();
        let delay = if self.speed.is_finite() && self.speed > 0.0 {
            Duration::from_secs_f64(distance / self.speed)
        } else {
            Duration::ZERO
        };

        self.recorder.record(DeviceAction::MoveTo(target));
        self.moves.fetch_add(1, Ordering::SeqCst);

        let position = self.position.clone();
        let recorder = self.recorder.clone();
        let motion = tokio::spawn(async move {
            sleep(delay).await;
            *position.lock() = target;
            recorder.record(DeviceAction::MoveDone);
        });
        replace_task(&self.motion, motion);
        Ok(())
    }

    async fn is_busy(&self) -> Result<bool> {
        Ok(task_running(&self.motion))
    }

    async fn stop(&self) -> Result<()> {
        abort_task(&self.motion);
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.recorder.record(DeviceAction::Stop);
        Ok(())
    }

    async fn check_position_valid(&self, position: f64) -> Result<Option<String>> {
        Ok(self.limit_violation(position))
    }

    async fn at_scan_start(&self) -> Result<()> {
        self.recorder.hook("at_scan_start")
    }

    async fn at_scan_end(&self) -> Result<()> {
        self.recorder.hook("at_scan_end")
    }

    async fn at_scan_line_start(&self) -> Result<()> {
        self.recorder.hook("at_scan_line_start")
    }

    async fn at_scan_line_end(&self) -> Result<()> {
        self.recorder.hook("at_scan_line_end")
    }

    async fn at_level_start(&self) -> Result<()> {
        self.recorder.hook("at_level_start")
    }

    async fn at_level_move_start(&self) -> Result<()> {
        self.recorder.hook("at_level_move_start")
    }

    async fn at_level_end(&self) -> Result<()> {
        self.recorder.hook("at_level_end")
    }

    async fn at_point_start(&self) -> Result<()> {
        self.recorder.hook("at_point_start")
    }

    async fn at_point_end(&self) -> Result<()> {
        self.recorder.hook("at_point_end")
    }

    async fn at_command_failure(&self) -> Result<()> {
        self.recorder.hook("at_command_failure")
    }
}

// =============================================================================
// SimDetector - simulated counter
// =============================================================================

/// Simulated counting detector
///
/// Each acquisition takes the collection time (default 10ms) and yields
/// `acquisition_number * gain`, plus uniform noise if configured. Readout
/// takes `readout_delay`. Used as a deferred-value provider it hands out a
/// future that completes after the readout delay (or a random delay up to
/// the configured maximum).
pub struct SimDetector {
    recorder: Recorder,
    level: Level,
    collection_time: Mutex<f64>,
    readout_delay: Duration,
    random_delay: Option<Duration>,
    gain: f64,
    noise: f64,
    fail_readout_at: Option<usize>,
    acquisition: Mutex<Option<JoinHandle<()>>>,
    acquisitions: AtomicUsize,
    last_value: Mutex<f64>,
    prepared: AtomicBool,
    collection_ended: AtomicBool,
    stops: AtomicUsize,
}

impl SimDetector {
    /// New detector on the default level
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            recorder: Recorder::new(name),
            level: DEFAULT_LEVEL,
            collection_time: Mutex::new(0.01),
            readout_delay: Duration::ZERO,
            random_delay: None,
            gain: 1.0,
            noise: 0.0,
            fail_readout_at: None,
            acquisition: Mutex::new(None),
            acquisitions: AtomicUsize::new(0),
            last_value: Mutex::new(0.0),
            prepared: AtomicBool::new(false),
            collection_ended: AtomicBool::new(false),
            stops: AtomicUsize::new(0),
        }
    }

    /// Set the movement level
    #[must_use]
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Set the collection time in seconds
    #[must_use]
    pub fn with_collection_time(self, seconds: f64) -> Self {
        *self.collection_time.lock() = seconds;
        self
    }

    /// Make each readout take `delay`
    #[must_use]
    pub fn with_readout_delay(mut self, delay: Duration) -> Self {
        self.readout_delay = delay;
        self
    }

    /// Deferred values complete after a random delay up to `max`
    #[must_use]
    pub fn with_random_deferred_delay(mut self, max: Duration) -> Self {
        self.random_delay = Some(max);
        self
    }

    /// Scale the counts
    #[must_use]
    pub fn with_gain(mut self, gain: f64) -> Self {
        self.gain = gain;
        self
    }

    /// Add uniform noise of the given amplitude
    #[must_use]
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise = amplitude;
        self
    }

    /// Fail the readout of the given (1-based) acquisition
    #[must_use]
    pub fn failing_readout_at(mut self, acquisition: usize) -> Self {
        self.fail_readout_at = Some(acquisition);
        self
    }

    /// Record calls into `log`
    #[must_use]
    pub fn with_log(mut self, log: &EventLog) -> Self {
        self.recorder.log = Some(log.clone());
        self
    }

    /// Number of acquisitions started
    #[must_use]
    pub fn acquisition_count(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Number of `stop` calls
    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Whether `prepare_for_collection` has been called
    #[must_use]
    pub fn is_prepared(&self) -> bool {
        self.prepared.load(Ordering::SeqCst)
    }

    /// Whether `end_collection` has been called
    #[must_use]
    pub fn collection_ended(&self) -> bool {
        self.collection_ended.load(Ordering::SeqCst)
    }

    fn sample(&self, acquisition: usize) -> f64 {
        let noise = if self.noise > 0.0 {
            rand::thread_rng().gen_range(-self.noise..=self.noise)
        } else {
            0.0
        };
        acquisition as f64 * self.gain + noise
    }

    fn deferred_delay(&self) -> Duration {
        match self.random_delay {
            Some(max) if !max.is_zero() => rand::thread_rng().gen_range(Duration::ZERO..=max),
            _ => self.readout_delay,
        }
    }
}

#[async_trait]
impl Scannable for SimDetector {
    fn name(&self) -> &str {
        &self.recorder.name
    }

    fn level(&self) -> Level {
        self.level
    }

    fn output_format(&self) -> Vec<String> {
        vec!["%8.2f".to_string()]
    }

    async fn position(&self) -> Result<DataValue> {
        Ok(DataValue::Scalar(*self.last_value.lock()))
    }

    /// Moving a detector sets its collection time and starts an acquisition.
    async fn move_to(&self, seconds: f64) -> Result<()> {
        self.set_collection_time(seconds).await?;
        self.collect_data().await
    }

    async fn is_busy(&self) -> Result<bool> {
        Ok(task_running(&self.acquisition))
    }

    async fn stop(&self) -> Result<()> {
        abort_task(&self.acquisition);
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.recorder.record(DeviceAction::Stop);
        Ok(())
    }

    async fn at_scan_start(&self) -> Result<()> {
        self.recorder.hook("at_scan_start")
    }

    async fn at_scan_end(&self) -> Result<()> {
        self.recorder.hook("at_scan_end")
    }

    async fn at_scan_line_start(&self) -> Result<()> {
        self.recorder.hook("at_scan_line_start")
    }

    async fn at_scan_line_end(&self) -> Result<()> {
        self.recorder.hook("at_scan_line_end")
    }

    async fn at_level_start(&self) -> Result<()> {
        self.recorder.hook("at_level_start")
    }

    async fn at_level_end(&self) -> Result<()> {
        self.recorder.hook("at_level_end")
    }

    async fn at_point_start(&self) -> Result<()> {
        self.recorder.hook("at_point_start")
    }

    async fn at_point_end(&self) -> Result<()> {
        self.recorder.hook("at_point_end")
    }

    async fn at_command_failure(&self) -> Result<()> {
        self.recorder.hook("at_command_failure")
    }
}

#[async_trait]
impl Detector for SimDetector {
    async fn collect_data(&self) -> Result<()> {
        let exposure = Duration::from_secs_f64(self.collection_time.lock().max(0.0));
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        self.recorder.record(DeviceAction::Collect);
        replace_task(&self.acquisition, tokio::spawn(sleep(exposure)));
        Ok(())
    }

    async fn collection_time(&self) -> Result<f64> {
        Ok(*self.collection_time.lock())
    }

    async fn set_collection_time(&self, seconds: f64) -> Result<()> {
        if !seconds.is_finite() || seconds < 0.0 {
            bail!("invalid collection time {seconds}");
        }
        *self.collection_time.lock() = seconds;
        Ok(())
    }

    async fn readout(&self) -> Result<DataValue> {
        self.recorder.record(DeviceAction::ReadoutStart);
        sleep(self.readout_delay).await;
        let acquisition = self.acquisition_count();
        if self.fail_readout_at == Some(acquisition) {
            bail!("readout of acquisition {acquisition} failed");
        }
        let value = self.sample(acquisition);
        *self.last_value.lock() = value;
        self.recorder.record(DeviceAction::ReadoutDone);
        Ok(DataValue::Scalar(value))
    }

    async fn prepare_for_collection(&self) -> Result<()> {
        self.prepared.store(true, Ordering::SeqCst);
        self.recorder.hook("prepare_for_collection")
    }

    async fn end_collection(&self) -> Result<()> {
        self.collection_ended.store(true, Ordering::SeqCst);
        self.recorder.hook("end_collection")
    }
}

impl DeferredValueProvider for SimDetector {
    fn deferred_value(&self) -> Result<ValueFuture> {
        let acquisition = self.acquisition_count();
        let fail = self.fail_readout_at == Some(acquisition);
        let value = self.sample(acquisition);
        let delay = self.deferred_delay();
        Ok(async move {
            sleep(delay).await;
            if fail {
                return Err(anyhow!("deferred readout of acquisition {acquisition} failed"));
            }
            Ok(DataValue::Scalar(value))
        }
        .boxed())
    }
}

// =============================================================================
// SimTriggeredDetector - simulated hardware-triggered detector
// =============================================================================

/// Simulated detector for hardware-triggered lines
///
/// Arming takes `arm_delay` and can be made to fail. Frame `i` becomes
/// available one collection time after it is requested and holds `i`.
pub struct SimTriggeredDetector {
    recorder: Recorder,
    collection_time: Mutex<f64>,
    arm_delay: Duration,
    arm_failure: Option<String>,
    lost_frame: Option<usize>,
    armed: AtomicBool,
    hardware_triggering: AtomicBool,
    stops: AtomicUsize,
}

impl SimTriggeredDetector {
    /// New detector with a 10ms collection time
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            recorder: Recorder::new(name),
            collection_time: Mutex::new(0.01),
            arm_delay: Duration::ZERO,
            arm_failure: None,
            lost_frame: None,
            armed: AtomicBool::new(false),
            hardware_triggering: AtomicBool::new(false),
            stops: AtomicUsize::new(0),
        }
    }

    /// Set the collection time in seconds
    #[must_use]
    pub fn with_collection_time(self, seconds: f64) -> Self {
        *self.collection_time.lock() = seconds;
        self
    }

    /// Make arming take `delay`
    #[must_use]
    pub fn with_arm_delay(mut self, delay: Duration) -> Self {
        self.arm_delay = delay;
        self
    }

    /// Make arming fail with `message` (after the arm delay)
    #[must_use]
    pub fn failing_arm(mut self, message: &str) -> Self {
        self.arm_failure = Some(message.to_string());
        self
    }

    /// Fail the readout of `frame` once its exposure is over
    #[must_use]
    pub fn losing_frame(mut self, frame: usize) -> Self {
        self.lost_frame = Some(frame);
        self
    }

    /// Record calls into `log`
    #[must_use]
    pub fn with_log(mut self, log: &EventLog) -> Self {
        self.recorder.log = Some(log.clone());
        self
    }

    /// Whether an arm call completed successfully (cleared by `stop`)
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Whether hardware triggering is enabled
    #[must_use]
    pub fn is_hardware_triggering(&self) -> bool {
        self.hardware_triggering.load(Ordering::SeqCst)
    }

    /// Number of `stop` calls
    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scannable for SimTriggeredDetector {
    fn name(&self) -> &str {
        &self.recorder.name
    }

    async fn position(&self) -> Result<DataValue> {
        Ok(DataValue::Scalar(0.0))
    }

    async fn move_to(&self, seconds: f64) -> Result<()> {
        self.set_collection_time(seconds).await
    }

    async fn is_busy(&self) -> Result<bool> {
        Ok(false)
    }

    async fn stop(&self) -> Result<()> {
        self.armed.store(false, Ordering::SeqCst);
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.recorder.record(DeviceAction::Stop);
        Ok(())
    }

    async fn at_scan_line_start(&self) -> Result<()> {
        self.recorder.hook("at_scan_line_start")
    }

    async fn at_scan_line_end(&self) -> Result<()> {
        self.recorder.hook("at_scan_line_end")
    }

    async fn at_command_failure(&self) -> Result<()> {
        self.recorder.hook("at_command_failure")
    }
}

#[async_trait]
impl Detector for SimTriggeredDetector {
    async fn collect_data(&self) -> Result<()> {
        bail!("{} only acquires on hardware triggers", self.recorder.name)
    }

    async fn collection_time(&self) -> Result<f64> {
        Ok(*self.collection_time.lock())
    }

    async fn set_collection_time(&self, seconds: f64) -> Result<()> {
        *self.collection_time.lock() = seconds;
        Ok(())
    }

    async fn readout(&self) -> Result<DataValue> {
        bail!("{} delivers data per frame", self.recorder.name)
    }
}

#[async_trait]
impl HardwareTriggeredDetector for SimTriggeredDetector {
    async fn set_hardware_triggering(&self, enabled: bool) -> Result<()> {
        self.hardware_triggering.store(enabled, Ordering::SeqCst);
        self.recorder.hook(if enabled {
            "hardware_triggering_on"
        } else {
            "hardware_triggering_off"
        })
    }

    async fn arm(&self) -> Result<()> {
        self.recorder.record(DeviceAction::Arm);
        sleep(self.arm_delay).await;
        if let Some(message) = &self.arm_failure {
            bail!("{message}");
        }
        self.armed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn frame_value(&self, frame: usize) -> Result<ValueFuture> {
        let exposure = Duration::from_secs_f64(self.collection_time.lock().max(0.0));
        let lost = self.lost_frame == Some(frame);
        Ok(async move {
            sleep(exposure).await;
            if lost {
                return Err(anyhow!("frame {frame} lost"));
            }
            Ok(DataValue::Scalar(frame as f64))
        }
        .boxed())
    }
}

// =============================================================================
// SimMoveController - simulated trajectory controller
// =============================================================================

/// Simulated trajectory controller
///
/// A trajectory of `n` positions takes `n` trigger periods to run.
pub struct SimMoveController {
    recorder: Recorder,
    continuous: AtomicBool,
    prepared: AtomicBool,
    period: Mutex<f64>,
    trajectory: Mutex<Vec<f64>>,
    motion: Mutex<Option<JoinHandle<()>>>,
    resets: AtomicUsize,
    stops: AtomicUsize,
}

impl SimMoveController {
    /// New idle controller
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            recorder: Recorder::new(name),
            continuous: AtomicBool::new(false),
            prepared: AtomicBool::new(false),
            period: Mutex::new(0.0),
            trajectory: Mutex::new(Vec::new()),
            motion: Mutex::new(None),
            resets: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    /// Record calls into `log`
    #[must_use]
    pub fn with_log(mut self, log: &EventLog) -> Self {
        self.recorder.log = Some(log.clone());
        self
    }

    /// Whether continuous operation is enabled
    #[must_use]
    pub fn is_operating_continuously(&self) -> bool {
        self.continuous.load(Ordering::SeqCst)
    }

    /// Trigger period last set, in seconds
    #[must_use]
    pub fn trigger_period(&self) -> f64 {
        *self.period.lock()
    }

    /// Trajectory last set
    #[must_use]
    pub fn trajectory(&self) -> Vec<f64> {
        self.trajectory.lock().clone()
    }

    /// Number of `stop_and_reset` calls
    #[must_use]
    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    /// Number of `stop` calls
    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContinuousMoveController for SimMoveController {
    fn name(&self) -> &str {
        &self.recorder.name
    }

    async fn set_operating_continuously(&self, enabled: bool) -> Result<()> {
        self.continuous.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_and_reset(&self) -> Result<()> {
        abort_task(&self.motion);
        self.prepared.store(false, Ordering::SeqCst);
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.recorder.hook("stop_and_reset")
    }

    async fn set_trigger_period(&self, seconds: f64) -> Result<()> {
        if !seconds.is_finite() || seconds <= 0.0 {
            bail!("trigger period must be positive, got {seconds}");
        }
        *self.period.lock() = seconds;
        Ok(())
    }

    async fn set_trajectory(&self, positions: &[f64]) -> Result<()> {
        *self.trajectory.lock() = positions.to_vec();
        Ok(())
    }

    async fn prepare_for_move(&self) -> Result<()> {
        if self.trajectory.lock().is_empty() {
            bail!("no trajectory loaded");
        }
        self.prepared.store(true, Ordering::SeqCst);
        self.recorder.hook("prepare_for_move")
    }

    async fn start_move(&self) -> Result<()> {
        if !self.prepared.swap(false, Ordering::SeqCst) {
            bail!("start_move called before prepare_for_move");
        }
        let duration = Duration::from_secs_f64(*self.period.lock() * self.trajectory.lock().len() as f64);
        let recorder = self.recorder.clone();
        recorder.record(DeviceAction::MoveTo(self.trajectory.lock().last().copied().unwrap_or(0.0)));
        replace_task(
            &self.motion,
            tokio::spawn(async move {
                sleep(duration).await;
                recorder.record(DeviceAction::MoveDone);
            }),
        );
        Ok(())
    }

    async fn is_moving(&self) -> Result<bool> {
        Ok(task_running(&self.motion))
    }

    async fn stop(&self) -> Result<()> {
        abort_task(&self.motion);
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.recorder.record(DeviceAction::Stop);
        Ok(())
    }
}
