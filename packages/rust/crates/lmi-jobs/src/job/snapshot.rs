//! Plain-data view of a job, also its persisted form.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::state::JobState;

/// Name of a registered job type, e.g. `SoftwareInstallationJob`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobType(String);

impl JobType {
    /// Create a job type name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The type name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for JobType {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Why a job ended in EXCEPTION or TERMINATED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobFailureKind {
    /// Process callback reported a failure.
    Failed,
    /// Job was cancelled.
    Terminated,
    /// Requested operation is not supported.
    NotSupported,
    /// Job input was invalid.
    InvalidParameter,
}

/// Error payload attached to a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Failure category.
    pub kind: JobFailureKind,
    /// Human readable description.
    pub message: String,
}

impl JobFailure {
    /// Generic failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            kind: JobFailureKind::Failed,
            message: message.into(),
        }
    }
}

/// Property touched by a modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobProperty {
    /// `state` (and the timestamps moving with it).
    State,
    /// `priority`.
    Priority,
    /// `percent_complete`.
    PercentComplete,
    /// `delete_on_completion`.
    DeleteOnCompletion,
    /// `time_before_removal`.
    TimeBeforeRemoval,
    /// `name`.
    Name,
    /// `method_name`.
    MethodName,
    /// `status_description`.
    StatusDescription,
    /// Input or output parameters.
    Parameters,
    /// `result`.
    Result,
    /// Type-specific payload.
    Data,
}

impl JobProperty {
    /// Changes to these reschedule (or cancel) delayed deletion.
    #[must_use]
    pub fn affects_deletion(self) -> bool {
        matches!(self, Self::DeleteOnCompletion | Self::TimeBeforeRemoval)
    }
}

/// Snapshot of every job property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    /// Process-unique number.
    pub number: u64,
    /// String identity, `<ORGID>:<ClassName>:<Number>`.
    pub jobid: String,
    /// Registered type governing this job.
    pub job_type: JobType,
    /// Display name.
    pub name: String,
    /// Current state.
    pub state: JobState,
    /// Lower value runs first.
    pub priority: u32,
    /// 0..=100.
    pub percent_complete: u16,
    /// Remove the job automatically once finished.
    pub delete_on_completion: bool,
    /// Delay between finishing and automatic removal.
    #[serde(with = "duration_millis")]
    pub time_before_removal: Duration,
    /// Creation time.
    pub time_submitted: DateTime<Utc>,
    /// First transition into RUNNING.
    pub start_time: Option<DateTime<Utc>>,
    /// Time of the last state change (creation counts).
    pub time_of_last_state_change: DateTime<Utc>,
    /// Extrinsic method that spawned the job.
    pub method_name: Option<String>,
    /// Free-form status line.
    pub status_description: Option<String>,
    /// Method input parameters.
    #[serde(default)]
    pub in_params: Map<String, Value>,
    /// Method output parameters.
    #[serde(default)]
    pub out_params: Map<String, Value>,
    /// Method return value.
    pub result: Option<Value>,
    /// Failure details for EXCEPTION/TERMINATED.
    pub error: Option<JobFailure>,
    /// Type-specific payload owned by the process callback.
    #[serde(default)]
    pub data: Value,
}

impl JobSnapshot {
    /// Fresh snapshot for a NEW job.
    #[must_use]
    pub fn new(number: u64, jobid: String, job_type: JobType) -> Self {
        let now = Utc::now();
        Self {
            number,
            name: format!("{job_type}-{number}"),
            jobid,
            job_type,
            state: JobState::New,
            priority: 0,
            percent_complete: 0,
            delete_on_completion: false,
            time_before_removal: Duration::ZERO,
            time_submitted: now,
            start_time: None,
            time_of_last_state_change: now,
            method_name: None,
            status_description: None,
            in_params: Map::new(),
            out_params: Map::new(),
            result: None,
            error: None,
            data: Value::Null,
        }
    }

    /// Whether the job reached a terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
