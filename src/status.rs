//! Scan status state machine.
//!
//! One [`StatusCell`] exists per scan and is shared by every dimension of the
//! scan tree and by [`ScanControl`](crate::scan::ScanControl) handles. Every
//! transition is checked against [`ScanStatus::possible_follow_ups`]; an
//! invalid request is logged and ignored rather than raised, because it is
//! usually a late control request racing the scan's own progress.

use crate::error::{ScanError, ScanResult};
use crate::sink::{ScanEvent, ScanObserver};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Lifecycle state of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    /// Built but not run
    NotStarted,
    /// Collecting points
    Running,
    /// Waiting at a point boundary for resume
    Paused,
    /// Will stop at the next point boundary and complete normally
    FinishingEarly,
    /// Aborted; cleaning up
    TidyingUpAfterStop,
    /// Failed; cleaning up
    TidyingUpAfterFailure,
    /// All points collected
    CompletedOkay,
    /// Stopped early on request
    CompletedEarly,
    /// Aborted on request
    CompletedAfterStop,
    /// Failed
    CompletedAfterFailure,
}

impl ScanStatus {
    /// States reachable from this one.
    #[must_use]
    pub fn possible_follow_ups(self) -> &'static [ScanStatus] {
        use ScanStatus::*;
        match self {
            NotStarted => &[Running, TidyingUpAfterStop, TidyingUpAfterFailure],
            Running => &[
                Paused,
                FinishingEarly,
                TidyingUpAfterStop,
                TidyingUpAfterFailure,
                CompletedOkay,
            ],
            Paused => &[Running, FinishingEarly, TidyingUpAfterStop, TidyingUpAfterFailure],
            FinishingEarly => &[CompletedEarly, TidyingUpAfterStop, TidyingUpAfterFailure],
            TidyingUpAfterStop => &[CompletedAfterStop],
            TidyingUpAfterFailure => &[CompletedAfterFailure],
            CompletedOkay | CompletedEarly | CompletedAfterStop | CompletedAfterFailure => &[],
        }
    }

    /// Whether `next` may follow this state.
    #[must_use]
    pub fn can_transition_to(self, next: ScanStatus) -> bool {
        self.possible_follow_ups().contains(&next)
    }

    /// Scan finished, whatever the outcome
    #[must_use]
    pub fn is_complete(self) -> bool {
        matches!(
            self,
            Self::CompletedOkay | Self::CompletedEarly | Self::CompletedAfterStop | Self::CompletedAfterFailure
        )
    }

    /// Scan is cleaning up after an abort or failure
    #[must_use]
    pub fn is_aborting(self) -> bool {
        matches!(self, Self::TidyingUpAfterStop | Self::TidyingUpAfterFailure)
    }

    /// Scan is collecting (possibly paused or about to finish)
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::FinishingEarly)
    }

    /// Can pause from this state
    #[must_use]
    pub fn can_pause(self) -> bool {
        self == Self::Running
    }

    /// Can resume from this state
    #[must_use]
    pub fn can_resume(self) -> bool {
        self == Self::Paused
    }

    /// Terminal state reached from here once collection has stopped.
    ///
    /// A scan still `Paused` when collection ends is considered to have run to
    /// completion.
    #[must_use]
    pub fn resolution(self) -> Option<ScanStatus> {
        match self {
            Self::Running | Self::Paused => Some(Self::CompletedOkay),
            Self::FinishingEarly => Some(Self::CompletedEarly),
            Self::TidyingUpAfterStop => Some(Self::CompletedAfterStop),
            Self::TidyingUpAfterFailure => Some(Self::CompletedAfterFailure),
            Self::NotStarted | Self::CompletedOkay | Self::CompletedEarly
            | Self::CompletedAfterStop | Self::CompletedAfterFailure => None,
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotStarted => "not started",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::FinishingEarly => "finishing early",
            Self::TidyingUpAfterStop => "tidying up after stop",
            Self::TidyingUpAfterFailure => "tidying up after failure",
            Self::CompletedOkay => "completed",
            Self::CompletedEarly => "completed early",
            Self::CompletedAfterStop => "completed after stop",
            Self::CompletedAfterFailure => "completed after failure",
        };
        f.write_str(label)
    }
}

/// Shared, authoritative status of one scan.
pub struct StatusCell {
    tx: watch::Sender<ScanStatus>,
    finish_early: AtomicBool,
    observers: Vec<Arc<dyn ScanObserver>>,
}

impl StatusCell {
    /// A new cell in `NotStarted`.
    #[must_use]
    pub fn new(observers: Vec<Arc<dyn ScanObserver>>) -> Self {
        let (tx, _rx) = watch::channel(ScanStatus::NotStarted);
        Self {
            tx,
            finish_early: AtomicBool::new(false),
            observers,
        }
    }

    /// Current status
    #[must_use]
    pub fn get(&self) -> ScanStatus {
        *self.tx.borrow()
    }

    /// Receiver that sees every status change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ScanStatus> {
        self.tx.subscribe()
    }

    /// Move to `next` if the transition is allowed.
    ///
    /// Returns `false` (and logs) if it is not.
    pub fn set(&self, next: ScanStatus) -> bool {
        let mut previous = ScanStatus::NotStarted;
        let changed = self.tx.send_if_modified(|current| {
            previous = *current;
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });

        if changed {
            debug!(from = %previous, to = %next, "Scan status changed");
            let event = ScanEvent::Status { status: next };
            for observer in &self.observers {
                observer.notify(&event);
            }
        } else {
            error!(from = %previous, to = %next, "Ignoring illegal scan status transition");
        }
        changed
    }

    /// Ask the scan to stop after the current point and complete normally.
    pub fn request_finish_early(&self) {
        self.finish_early.store(true, Ordering::SeqCst);
        let current = self.get();
        if current.can_transition_to(ScanStatus::FinishingEarly) {
            self.set(ScanStatus::FinishingEarly);
        } else {
            info!(status = %current, "Finish early requested; scan is not in a state to finish early");
        }
    }

    /// Whether finish-early has been requested
    #[must_use]
    pub fn is_finish_early_requested(&self) -> bool {
        self.finish_early.load(Ordering::SeqCst)
    }

    /// Request a pause at the next point boundary.
    pub fn pause(&self) -> bool {
        self.set(ScanStatus::Paused)
    }

    /// Resume a paused scan.
    pub fn resume(&self) -> bool {
        self.set(ScanStatus::Running)
    }

    /// Block while paused, polling every `interval`.
    ///
    /// Returns early on a finish-early request; fails with
    /// [`ScanError::Interrupted`] if the scan is aborted meanwhile.
    pub async fn wait_if_paused(&self, cancel: &CancellationToken, interval: Duration) -> ScanResult<()> {
        let mut logged = false;
        while self.get() == ScanStatus::Paused && !self.is_finish_early_requested() {
            if !logged {
                info!("Scan paused");
                logged = true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ScanError::Interrupted),
                _ = tokio::time::sleep(interval) => {}
            }
        }
        if logged {
            info!(status = %self.get(), "Scan no longer paused");
        }
        if cancel.is_cancelled() {
            return Err(ScanError::Interrupted);
        }
        Ok(())
    }

    /// Resolve to the terminal state for the current state.
    pub fn complete(&self) -> ScanStatus {
        let mut current = self.get();
        if current == ScanStatus::Paused {
            self.set(ScanStatus::Running);
            current = ScanStatus::Running;
        }
        match current.resolution() {
            Some(terminal) => {
                self.set(terminal);
                terminal
            }
            None => {
                error!(status = %current, "Scan status has no terminal resolution");
                current
            }
        }
    }
}

impl fmt::Debug for StatusCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusCell")
            .field("status", &self.get())
            .field("finish_early", &self.is_finish_early_requested())
            .finish()
    }
}
