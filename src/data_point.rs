//! Scan data points.
//!
//! A point starts life as a [`PendingDataPoint`]: the scan task fills in the
//! scannable positions, the readout stage fills in detector data, and any
//! field may still be a [`DeferredHandle`] that resolves later (a detector
//! frame still being written, a position latched by hardware). The pipeline
//! resolves every handle and only then produces the immutable
//! [`ScanDataPoint`] that sinks and observers see.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::task::AbortOnDropHandle;
use uuid::Uuid;

/// A future producing one field value.
pub type ValueFuture = BoxFuture<'static, anyhow::Result<DataValue>>;

/// Default display format for numeric fields.
pub const DEFAULT_FORMAT: &str = "%5.5g";

/// A value read from a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataValue {
    /// A single number (motor position, counter value)
    Scalar(f64),
    /// Several numbers from one device (multi-channel counters, ROI sums)
    Array(Vec<f64>),
    /// Free text (file names written by area detectors)
    Text(String),
}

impl DataValue {
    /// The value as a single number, if it is one.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            Self::Array(values) if values.len() == 1 => Some(values[0]),
            _ => None,
        }
    }

    /// Render the value with one format per element.
    ///
    /// Arrays use `formats[i]` for element `i`, falling back to the last
    /// format when there are more elements than formats.
    #[must_use]
    pub fn format_with(&self, formats: &[String]) -> Vec<String> {
        let format_at = |i: usize| -> &str {
            formats
                .get(i)
                .or_else(|| formats.last())
                .map_or(DEFAULT_FORMAT, String::as_str)
        };
        match self {
            Self::Scalar(v) => vec![format_number(format_at(0), *v)],
            Self::Array(values) => values
                .iter()
                .enumerate()
                .map(|(i, v)| format_number(format_at(i), *v))
                .collect(),
            Self::Text(text) => vec![text.clone()],
        }
    }
}

impl From<f64> for DataValue {
    fn from(v: f64) -> Self {
        Self::Scalar(v)
    }
}

impl From<Vec<f64>> for DataValue {
    fn from(values: Vec<f64>) -> Self {
        Self::Array(values)
    }
}

impl From<String> for DataValue {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// Handle to a value that is not available yet.
///
/// Starts as a not-yet-started future; the pipeline dispatches it onto its
/// bounded worker pool, after which it is a running task. Dropping a handle
/// cancels the work.
pub struct DeferredHandle {
    state: DeferredState,
}

enum DeferredState {
    Callable(ValueFuture),
    Running(AbortOnDropHandle<anyhow::Result<DataValue>>),
}

impl DeferredHandle {
    /// Wrap a future that will produce the value.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<DataValue>> + Send + 'static,
    {
        Self {
            state: DeferredState::Callable(future.boxed()),
        }
    }

    /// True once the value is being computed on the worker pool.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.state, DeferredState::Running(_))
    }

    /// Start resolving on the worker pool; no-op if already running.
    pub(crate) fn dispatch(self, pool: &Arc<Semaphore>) -> Self {
        match self.state {
            DeferredState::Callable(future) => {
                let pool = Arc::clone(pool);
                let task = tokio::spawn(async move {
                    let _permit = pool
                        .acquire_owned()
                        .await
                        .map_err(|_| anyhow::anyhow!("deferred value pool is closed"))?;
                    future.await
                });
                Self {
                    state: DeferredState::Running(AbortOnDropHandle::new(task)),
                }
            }
            running => Self { state: running },
        }
    }

    /// Wait for the value.
    pub(crate) async fn resolve(self) -> anyhow::Result<DataValue> {
        match self.state {
            DeferredState::Callable(future) => future.await,
            DeferredState::Running(task) => match task.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(anyhow::anyhow!("deferred value was cancelled")),
                Err(e) => Err(anyhow::anyhow!("deferred value task panicked: {e}")),
            },
        }
    }
}

impl From<ValueFuture> for DeferredHandle {
    fn from(future: ValueFuture) -> Self {
        Self {
            state: DeferredState::Callable(future),
        }
    }
}

impl fmt::Debug for DeferredHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            DeferredState::Callable(_) => "callable",
            DeferredState::Running(_) => "running",
        };
        f.debug_struct("DeferredHandle").field("state", &state).finish()
    }
}

/// A field value in an in-flight point.
#[derive(Debug)]
pub enum FieldValue {
    /// Already known
    Resolved(DataValue),
    /// Still being produced
    Pending(DeferredHandle),
}

impl FieldValue {
    /// True if the value still has to be resolved.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

/// Named field of an in-flight point.
#[derive(Debug)]
pub struct PendingField {
    /// Device name
    pub name: String,
    /// Value or handle
    pub value: FieldValue,
    /// Display formats, one per element
    pub formats: Vec<String>,
}

/// Label of the step taken by one dimension for a point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepId {
    /// Name of the principal device of the dimension
    pub device: String,
    /// Zero-based step index within the dimension
    pub index: usize,
    /// Demanded position
    pub position: f64,
}

/// A point whose fields may not all be known yet.
#[derive(Debug)]
pub struct PendingDataPoint {
    /// Zero-based index within the scan
    pub index: usize,
    /// Total number of points in the scan
    pub total_points: usize,
    /// Scan identifier
    pub scan_id: Uuid,
    /// Command the scan was built from
    pub command: String,
    /// Step labels, outermost dimension first
    pub step_ids: Vec<Option<StepId>>,
    /// Points per dimension, outermost first
    pub dimensions: Vec<usize>,
    /// Scannable fields in declared order
    pub scannables: Vec<PendingField>,
    /// Detector fields in declared order
    pub detectors: Vec<PendingField>,
}

impl PendingDataPoint {
    /// Number of fields that still hold a handle.
    #[must_use]
    pub fn pending_fields(&self) -> usize {
        self.scannables
            .iter()
            .chain(&self.detectors)
            .filter(|field| field.value.is_pending())
            .count()
    }

    /// Dispatch every not-yet-started handle onto the worker pool.
    pub(crate) fn dispatch_deferred(mut self, pool: &Arc<Semaphore>) -> Self {
        for field in self.scannables.iter_mut().chain(self.detectors.iter_mut()) {
            let value = std::mem::replace(&mut field.value, FieldValue::Resolved(DataValue::Scalar(0.0)));
            field.value = match value {
                FieldValue::Pending(handle) => FieldValue::Pending(handle.dispatch(pool)),
                resolved => resolved,
            };
        }
        self
    }
}

/// A resolved, named field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataField {
    /// Device name
    pub name: String,
    /// Value
    pub value: DataValue,
    /// Display formats, one per element
    pub formats: Vec<String>,
}

impl DataField {
    /// Cells for a table row.
    #[must_use]
    pub fn cells(&self) -> Vec<String> {
        self.value.format_with(&self.formats)
    }
}

/// A fully resolved, published data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanDataPoint {
    /// Zero-based index within the scan
    pub index: usize,
    /// Total number of points in the scan
    pub total_points: usize,
    /// Scan identifier
    pub scan_id: Uuid,
    /// Command the scan was built from
    pub command: String,
    /// Step labels, outermost dimension first
    pub step_ids: Vec<Option<StepId>>,
    /// Points per dimension, outermost first
    pub dimensions: Vec<usize>,
    /// Scannable fields in declared order
    pub scannables: Vec<DataField>,
    /// Detector fields in declared order
    pub detectors: Vec<DataField>,
    /// Identifier of the output the sink wrote this point to
    pub output_identifier: Option<String>,
    /// Time the point was published
    pub timestamp: DateTime<Utc>,
}

impl ScanDataPoint {
    /// Field names in column order.
    #[must_use]
    pub fn header(&self) -> Vec<String> {
        self.scannables
            .iter()
            .chain(&self.detectors)
            .map(|field| field.name.clone())
            .collect()
    }

    /// Formatted cells in column order; array fields span several cells.
    #[must_use]
    pub fn to_row(&self) -> Vec<String> {
        self.scannables
            .iter()
            .chain(&self.detectors)
            .flat_map(DataField::cells)
            .collect()
    }

    /// Value of a scannable field.
    #[must_use]
    pub fn scannable(&self, name: &str) -> Option<&DataValue> {
        self.scannables.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    /// Value of a detector field.
    #[must_use]
    pub fn detector(&self, name: &str) -> Option<&DataValue> {
        self.detectors.iter().find(|f| f.name == name).map(|f| &f.value)
    }
}

/// Render a number with a printf-style format (`%[-][0][width][.precision]conv`).
///
/// Supported conversions are `f`, `e`, `g` and `d`. Anything else falls back to
/// Rust's default float formatting.
#[must_use]
pub fn format_number(format: &str, value: f64) -> String {
    let Some(spec) = FormatSpec::parse(format) else {
        return value.to_string();
    };
    let body = match spec.conversion {
        'f' => format!("{:.*}", spec.precision.unwrap_or(6), value),
        'e' => c_exponent(value, spec.precision.unwrap_or(6)),
        'd' => format!("{}", value.round() as i64),
        'g' => c_general(value, spec.precision.unwrap_or(6)),
        _ => value.to_string(),
    };
    spec.pad(body)
}

struct FormatSpec {
    left_align: bool,
    zero_pad: bool,
    width: usize,
    precision: Option<usize>,
    conversion: char,
}

impl FormatSpec {
    fn parse(format: &str) -> Option<Self> {
        let rest = format.strip_prefix('%')?;
        let mut chars = rest.chars().peekable();
        let mut left_align = false;
        let mut zero_pad = false;
        while let Some(&c) = chars.peek() {
            match c {
                '-' => left_align = true,
                '0' => zero_pad = true,
                '+' | ' ' | '#' => {}
                _ => break,
            }
            chars.next();
        }
        let mut width = String::new();
        while let Some(&c) = chars.peek().filter(|c| c.is_ascii_digit()) {
            width.push(c);
            chars.next();
        }
        let mut precision = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut digits = String::new();
            while let Some(&c) = chars.peek().filter(|c| c.is_ascii_digit()) {
                digits.push(c);
                chars.next();
            }
            precision = Some(digits.parse().unwrap_or(0));
        }
        let conversion = chars.next()?.to_ascii_lowercase();
        Some(Self {
            left_align,
            zero_pad,
            width: width.parse().unwrap_or(0),
            precision,
            conversion,
        })
    }

    fn pad(&self, body: String) -> String {
        if body.len() >= self.width {
            return body;
        }
        let fill = self.width - body.len();
        if self.left_align {
            format!("{body}{}", " ".repeat(fill))
        } else if self.zero_pad && !body.starts_with('-') {
            format!("{}{body}", "0".repeat(fill))
        } else if self.zero_pad {
            format!("-{}{}", "0".repeat(fill), &body[1..])
        } else {
            format!("{}{body}", " ".repeat(fill))
        }
    }
}

/// C-style `%e`: mantissa, `e`, sign and at least two exponent digits.
fn c_exponent(value: f64, precision: usize) -> String {
    let rendered = format!("{value:.precision$e}");
    match rendered.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exponent.abs())
        }
        None => rendered,
    }
}

/// C-style `%g`: shortest of fixed and exponent form at `precision` significant digits.
fn c_general(value: f64, precision: usize) -> String {
    if value == 0.0 || !value.is_finite() {
        return if value == 0.0 { "0".to_string() } else { value.to_string() };
    }
    let precision = precision.max(1);
    let rounded = format!("{value:.*e}", precision - 1);
    let exponent: i32 = rounded
        .split_once('e')
        .and_then(|(_, e)| e.parse().ok())
        .unwrap_or(0);
    if exponent < -4 || exponent >= precision as i32 {
        let rendered = c_exponent(value, precision - 1);
        match rendered.split_once('e') {
            Some((mantissa, exponent)) => format!("{}e{exponent}", trim_fraction(mantissa)),
            None => rendered,
        }
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        trim_fraction(&format!("{value:.decimals$}")).to_string()
    }
}

fn trim_fraction(number: &str) -> &str {
    if number.contains('.') {
        number.trim_end_matches('0').trim_end_matches('.')
    } else {
        number
    }
}
