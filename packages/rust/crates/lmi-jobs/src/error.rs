//! Error types for job management.
//!
//! Caller-contract violations come back as typed errors; none of them
//! leave the manager in an inconsistent state.

use lmi_indications::{CimStatus, IndicationError};
use thiserror::Error;

use crate::job::JobState;

/// Job manager errors.
#[derive(Error, Debug)]
pub enum JobError {
    /// No provider has attached yet, or the last one detached.
    #[error("job manager is not running")]
    NotRunning,

    /// Job types must be registered before the event loop starts.
    #[error("job type registry is frozen")]
    RegistryFrozen,

    /// Duplicate job type registration.
    #[error("job type already registered: {0}")]
    TypeAlreadyRegistered(String),

    /// Lookup of a job type that was never registered.
    #[error("job type not registered: {0}")]
    UnknownJobType(String),

    /// No job matches the given id, number, name or path.
    #[error("job not found: {0}")]
    NotFound(String),

    /// `run_job` on a job that is already pending or running.
    #[error("job {0} is already queued or running")]
    AlreadyQueued(u64),

    /// `run_job` on a job that already finished.
    #[error("job {0} has already finished")]
    AlreadyFinished(u64),

    /// `delete_job` on a NEW or RUNNING job.
    #[error("job {0} is not finished")]
    NotFinished(u64),

    /// `terminate_job` on a running job whose type is not cancellable.
    #[error("job {number} of type {job_type} cannot be cancelled while running")]
    NotCancellable {
        /// Job number.
        number: u64,
        /// Job type name.
        job_type: String,
    },

    /// Transition not allowed by the state machine.
    #[error("job {number}: invalid state transition {from} -> {to}")]
    InvalidTransition {
        /// Job number.
        number: u64,
        /// Current state.
        from: JobState,
        /// Requested state.
        to: JobState,
    },

    /// Cancellation raced with the job finishing on its own.
    #[error("job {number} finished as {state} instead of terminated")]
    TerminationFailed {
        /// Job number.
        number: u64,
        /// State the job actually reached.
        state: JobState,
    },

    /// Malformed input such as an unparsable InstanceID.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Storage I/O failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Indication sender failure.
    #[error(transparent)]
    Indication(#[from] IndicationError),

    /// Any other failure.
    #[error("{0}")]
    Failed(String),
}

impl JobError {
    /// CIM status this error is reported as.
    #[must_use]
    pub fn status(&self) -> CimStatus {
        match self {
            Self::NotFound(_) | Self::UnknownJobType(_) => CimStatus::NotFound,
            Self::NotCancellable { .. } => CimStatus::NotSupported,
            Self::InvalidParameter(_) => CimStatus::InvalidParameter,
            Self::TypeAlreadyRegistered(_) => CimStatus::AlreadyExists,
            Self::Indication(error) => error.status(),
            Self::NotRunning
            | Self::RegistryFrozen
            | Self::AlreadyQueued(_)
            | Self::AlreadyFinished(_)
            | Self::NotFinished(_)
            | Self::InvalidTransition { .. }
            | Self::TerminationFailed { .. }
            | Self::Persistence(_)
            | Self::Failed(_) => CimStatus::Failed,
        }
    }
}

/// Result type for job manager operations.
pub type Result<T> = std::result::Result<T, JobError>;
