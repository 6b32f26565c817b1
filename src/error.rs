//! Error types for the scan engine.
//!
//! `ScanError` is the single error type surfaced by scan construction, scan
//! execution and the data-point pipeline. Device capability traits return
//! `anyhow::Result` (drivers are free to attach whatever context they like);
//! those errors are converted into `ScanError::Device` at the call site, which
//! records the device name and the operation that failed.
//!
//! ## Error Hierarchy
//!
//! - **`Construction`**: the scan definition is invalid (bad argument list,
//!   inconsistent step counts, positions rejected by a device).
//! - **`Device`**: a device operation failed while the scan was running.
//! - **`Interrupted`**: the scan was aborted on request. This is never treated
//!   as a failure; the scan finishes in `CompletedAfterStop`.
//! - **`Arming`**: one aggregated error for a failed hardware-triggered arming
//!   phase.
//! - **`Pipeline`** / **`PipelineClosed`**: the data-point pipeline failed or was
//!   used after shutdown.
//! - **`Config`**: configuration could not be loaded or failed validation.
//!
//! `ScanError` is `Clone` so that a poisoned pipeline can hand the very same
//! error to every later caller.

use thiserror::Error;

/// Convenience alias for results using the scan error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Errors produced while building or running a scan.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    /// The scan definition is invalid.
    #[error("Invalid scan: {0}")]
    Construction(String),

    /// A device operation failed.
    #[error("Device '{device}' failed during {operation}: {message}")]
    Device {
        /// Name of the device that failed.
        device: String,
        /// The operation that was being performed.
        operation: &'static str,
        /// Rendered error chain from the device.
        message: String,
    },

    /// The scan was aborted on request.
    #[error("Scan aborted on request")]
    Interrupted,

    /// Hardware-triggered arming failed.
    #[error("Arming failed on detector '{device}': {message} ({cancelled} other arm task(s) cancelled)")]
    Arming {
        /// The first detector whose arm operation failed.
        device: String,
        /// Rendered error chain of that failure.
        message: String,
        /// Number of arm tasks still running when the failure was seen.
        cancelled: usize,
    },

    /// The data-point pipeline failed.
    #[error("Scan data pipeline failed: {0}")]
    Pipeline(String),

    /// The data-point pipeline has already been shut down.
    #[error("Scan data pipeline is shut down")]
    PipelineClosed,

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A lifecycle operation was requested in the wrong state.
    #[error("Illegal scan state: {0}")]
    State(String),
}

impl ScanError {
    /// Wrap a device-level error with the device name and operation.
    pub fn device(device: impl Into<String>, operation: &'static str, err: anyhow::Error) -> Self {
        Self::Device {
            device: device.into(),
            operation,
            message: format!("{err:#}"),
        }
    }

    /// True if this error is the result of an abort request.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

impl From<figment::Error> for ScanError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Attach device context to an `anyhow::Result` returned by a capability.
pub(crate) trait DeviceResultExt<T> {
    fn on_device(self, device: &str, operation: &'static str) -> ScanResult<T>;
}

impl<T> DeviceResultExt<T> for anyhow::Result<T> {
    fn on_device(self, device: &str, operation: &'static str) -> ScanResult<T> {
        self.map_err(|err| ScanError::device(device, operation, err))
    }
}
