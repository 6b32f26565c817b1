//! State shared by every dimension of a running scan.

use crate::composer::DeviceSet;
use crate::config::ScanConfig;
use crate::data_point::{PendingDataPoint, StepId};
use crate::error::{ScanError, ScanResult};
use crate::pipeline::{DataPointPipeline, ReadoutMode};
use crate::status::StatusCell;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub(crate) struct ScanContext {
    pub scan_id: Uuid,
    pub command: String,
    pub devices: Arc<DeviceSet>,
    pub pipeline: Arc<DataPointPipeline>,
    pub status: Arc<StatusCell>,
    pub cancel: CancellationToken,
    pub config: Arc<ScanConfig>,
    pub dimensions: Vec<usize>,
    pub total_points: usize,
}

impl ScanContext {
    pub fn readout_mode(&self) -> ReadoutMode {
        self.pipeline.mode()
    }

    pub fn check_cancelled(&self) -> ScanResult<()> {
        if self.cancel.is_cancelled() {
            Err(ScanError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Sleep unless the scan is aborted first.
    pub async fn sleep(&self, duration: Duration) -> ScanResult<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ScanError::Interrupted),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    pub async fn wait_if_paused(&self) -> ScanResult<()> {
        self.status
            .wait_if_paused(&self.cancel, self.config.motion.pause_poll_interval())
            .await
    }

    pub fn finish_early_requested(&self) -> bool {
        self.status.is_finish_early_requested()
    }

    pub fn new_point(&self, index: usize, step_ids: Vec<Option<StepId>>) -> PendingDataPoint {
        PendingDataPoint {
            index,
            total_points: self.total_points,
            scan_id: self.scan_id,
            command: self.command.clone(),
            step_ids,
            dimensions: self.dimensions.clone(),
            scannables: Vec::new(),
            detectors: Vec::new(),
        }
    }
}
