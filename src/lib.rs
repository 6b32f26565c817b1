//! # daq_scan
//!
//! A concurrent step-scan engine for data-acquisition systems. Scans move
//! instrument axes ("scannables") and trigger detectors through a
//! multi-dimensional grid of positions, sampling one data point per grid
//! coordinate. Detector readout and data publication can run concurrently with
//! the motion to the next point while points are still published strictly in
//! order, exactly once.
//!
//! ## Crate Structure
//!
//! - **`device`**: capability traits (`Scannable`, `Detector`,
//!   `DeferredValueProvider`, `HardwareTriggeredDetector`,
//!   `ContinuousMoveController`) and the `DeviceHandle` that carries them.
//! - **`scan_object`**: one device bound to the positions it visits.
//! - **`coordinator`**: level-ordered moves for one point.
//! - **`composer`**: turns a flat argument list into nested dimensions and
//!   runs them.
//! - **`pipeline`**: ordered, bounded, poisonable publication of points.
//! - **`trigger`**: hardware-triggered lines and concurrent detector arming.
//! - **`status`**: the scan status state machine.
//! - **`scan`**: the execution core, `Scan`, `ScanControl` and `ScanSummary`.
//! - **`data_point`**, **`sink`**: point records, sinks and observers.
//! - **`config`**, **`telemetry`**, **`error`**: ambient configuration,
//!   logging and error types.
//! - **`sim`**: simulated devices for the CLI and tests.

pub mod composer;
pub mod config;
pub(crate) mod context;
pub(crate) mod coordinator;
pub mod data_point;
pub mod device;
pub mod error;
pub mod pipeline;
pub(crate) mod readout;
pub mod scan;
pub mod scan_object;
pub mod sim;
pub mod sink;
pub mod status;
pub mod telemetry;
pub mod trigger;

pub use composer::{ChildDimension, DeviceSet, ScanArg, ScanTree};
pub use config::ScanConfig;
pub use data_point::{DataValue, ScanDataPoint};
pub use device::{DeviceHandle, Level};
pub use error::{ScanError, ScanResult};
pub use pipeline::{DataPointPipeline, ReadoutMode};
pub use scan::{Scan, ScanBuilder, ScanControl, ScanSummary};
pub use sink::{BroadcastObserver, DataSink, MemorySink, ScanEvent, ScanObserver};
pub use status::ScanStatus;
pub use trigger::HardwareTriggeredLine;
