//! Job state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
///
/// ```text
/// NEW ──→ RUNNING ──→ COMPLETED
///  │         ├──────→ EXCEPTION
///  │         └──────→ TERMINATED
///  └────────────────→ TERMINATED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created, not started yet.
    New,
    /// Process callback is executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Cancelled before or during execution.
    Terminated,
    /// Finished with an error.
    Exception,
}

impl JobState {
    /// Terminal states.
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Terminated | Self::Exception)
    }

    /// Whether `self → next` is a permitted transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Running | Self::Terminated)
                | (
                    Self::Running,
                    Self::Completed | Self::Exception | Self::Terminated
                )
        )
    }

    /// `CIM_ConcreteJob.JobState` value.
    #[must_use]
    pub fn cim_value(self) -> u16 {
        match self {
            Self::New => 2,
            Self::Running => 4,
            Self::Completed => 7,
            Self::Terminated => 8,
            Self::Exception => 10,
        }
    }

    /// `CIM_ManagedSystemElement.OperationalStatus` values.
    #[must_use]
    pub fn operational_status(self) -> Vec<u16> {
        match self {
            Self::New => vec![2, 15],
            Self::Running => vec![2],
            Self::Completed => vec![2, 17],
            Self::Terminated => vec![10],
            Self::Exception => vec![6, 17],
        }
    }

    /// Lowercase label used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Terminated => "terminated",
            Self::Exception => "exception",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
