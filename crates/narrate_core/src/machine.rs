//! Legal job and unit transitions.
//!
//! Resuming a cancelled job is not a transition of that job: the backend starts
//! a new job id for the remaining units and the original stays `Cancelled`.

use chrono::{DateTime, Utc};
use narrate_logging::narrate_warn;

use crate::{Job, JobStatus, Unit, UnitStatus};

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Statuses listed by the backend's "active jobs" view.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Running | JobStatus::Cancelling
        )
    }

    /// Re-entering the current status is allowed so duplicate events are no-ops.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self == next {
            return true;
        }
        match self {
            Pending => matches!(next, Running | Cancelling | Cancelled | Completed | Failed),
            Running => matches!(next, Cancelling | Cancelled | Completed | Failed),
            Cancelling => matches!(next, Cancelled | Completed | Failed),
            Completed | Failed | Cancelled => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal job transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

impl Job {
    /// Moves the job to `next`, keeping the terminal-field invariants:
    /// `completed_at` is set iff terminal and `error_message` iff failed.
    pub fn transition(
        &mut self,
        next: JobStatus,
        at: DateTime<Utc>,
    ) -> Result<(), IllegalTransition> {
        if !self.status.can_transition_to(next) {
            return Err(IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        if next == self.status {
            return Ok(());
        }

        self.status = next;
        self.updated_at = Some(at);
        if next == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(at);
        }
        if next.is_terminal() {
            self.completed_at.get_or_insert(at);
            self.current_unit_id = None;
        } else {
            self.completed_at = None;
        }
        if next != JobStatus::Failed {
            self.error_message = None;
        }
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>, at: DateTime<Utc>) -> Result<(), IllegalTransition> {
        self.transition(JobStatus::Failed, at)?;
        self.record_error(error.into());
        Ok(())
    }

    pub(crate) fn record_error(&mut self, error: String) {
        self.error_message = Some(if error.trim().is_empty() {
            "unknown error".to_string()
        } else {
            error
        });
    }

    /// Replaces a terminal status the cache only assumed (an optimistic
    /// cancel) with the terminal status the server reports.
    pub(crate) fn overrule(&mut self, next: JobStatus, at: DateTime<Utc>) {
        self.status = next;
        self.updated_at = Some(at);
        self.completed_at = Some(at);
        self.current_unit_id = None;
        if next != JobStatus::Failed {
            self.error_message = None;
        }
    }

    /// Applies authoritative counts. Missing values keep what is cached;
    /// `processed_units` is clamped to `total_units`.
    pub fn set_counts(&mut self, processed: Option<u32>, total: Option<u32>, failed: Option<u32>) {
        if let Some(total) = total {
            self.total_units = total;
        }
        if let Some(processed) = processed {
            if processed > self.total_units {
                narrate_warn!(
                    "Job {} reported processed={} above total={}; clamping",
                    self.id,
                    processed,
                    self.total_units
                );
            }
            self.processed_units = processed.min(self.total_units);
        }
        if let Some(failed) = failed {
            self.failed_units = failed;
        }
    }
}

impl Unit {
    /// Cancellation only releases work that was promised but never reached.
    pub fn release_if_queued(&mut self) -> bool {
        if self.status == UnitStatus::Queued {
            self.status = UnitStatus::Pending;
            true
        } else {
            false
        }
    }
}
