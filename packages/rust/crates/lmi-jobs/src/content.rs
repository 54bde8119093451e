//! Turns jobs into the instance vocabulary used for indications.

use chrono::Utc;
use lmi_indications::{IndicationKind, Instance, PerceivedSeverity, StaticFilter};
use serde_json::Value;

use crate::error::{JobError, Result};
use crate::job::{JobProperty, JobSnapshot, JobState};

/// Ids of the static filters registered for every job class.
pub mod filter_ids {
    /// Job was created.
    pub const CREATED: &str = "Created";
    /// Job was deleted.
    pub const DELETED: &str = "Deleted";
    /// Job state changed.
    pub const CHANGED: &str = "Changed";
    /// Job progress changed.
    pub const PERCENT_UPDATED: &str = "PercentUpdated";
    /// Job completed.
    pub const SUCCEEDED: &str = "Succeeded";
    /// Job ended in EXCEPTION.
    pub const FAILED: &str = "Failed";
}

/// Key property of every job instance.
pub const INSTANCE_ID: &str = "InstanceID";

/// Static filters for `class_name`, whose indications are named after `name_prefix`.
#[must_use]
pub fn standard_filters(class_name: &str, name_prefix: &str) -> Vec<StaticFilter> {
    let creation = IndicationKind::Creation.class_name(name_prefix);
    let deletion = IndicationKind::Deletion.class_name(name_prefix);
    let modification = IndicationKind::Modification.class_name(name_prefix);
    let changed = |property: &str| {
        format!(
            "SELECT * FROM {modification} WHERE SourceInstance ISA {class_name} AND \
             SourceInstance.CIM_ConcreteJob::{property} <> \
             PreviousInstance.CIM_ConcreteJob::{property}"
        )
    };
    let reached = |state: JobState| {
        format!(
            "SELECT * FROM {modification} WHERE SourceInstance ISA {class_name} AND \
             SourceInstance.CIM_ConcreteJob::JobState = {} AND \
             PreviousInstance.CIM_ConcreteJob::JobState <> {}",
            state.cim_value(),
            state.cim_value()
        )
    };

    vec![
        StaticFilter::new(
            filter_ids::CREATED,
            format!("SELECT * FROM {creation} WHERE SourceInstance ISA {class_name}"),
        ),
        StaticFilter::new(
            filter_ids::DELETED,
            format!("SELECT * FROM {deletion} WHERE SourceInstance ISA {class_name}"),
        ),
        StaticFilter::new(filter_ids::CHANGED, changed("JobState")),
        StaticFilter::new(filter_ids::PERCENT_UPDATED, changed("PercentComplete")),
        StaticFilter::new(filter_ids::SUCCEEDED, reached(JobState::Completed)),
        StaticFilter::new(filter_ids::FAILED, reached(JobState::Exception)),
    ]
}

/// What a conversion needs besides the job itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertContext {
    /// Namespace of the produced instance.
    pub namespace: String,
    /// Organization id used in InstanceIDs.
    pub org_id: String,
    /// CIM class of the job type.
    pub class_name: String,
}

impl ConvertContext {
    /// InstanceID of job `number`.
    #[must_use]
    pub fn instance_id(&self, number: u64) -> String {
        instance_id(&self.org_id, &self.class_name, number)
    }
}

/// `<ORGID>:<ClassName>:<Number>`.
#[must_use]
pub fn instance_id(org_id: &str, class_name: &str, number: u64) -> String {
    format!("{org_id}:{class_name}:{number}")
}

/// Split an InstanceID into `(org_id, class_name, number)`.
pub fn parse_instance_id(id: &str) -> Result<(&str, &str, u64)> {
    let mut parts = id.splitn(3, ':');
    let (Some(org_id), Some(class_name), Some(number)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(JobError::InvalidParameter(format!(
            "malformed InstanceID: {id}"
        )));
    };
    if org_id.is_empty() || class_name.is_empty() {
        return Err(JobError::InvalidParameter(format!(
            "malformed InstanceID: {id}"
        )));
    }
    let number = number
        .parse::<u64>()
        .map_err(|_| JobError::InvalidParameter(format!("invalid job number in InstanceID: {id}")))?;
    Ok((org_id, class_name, number))
}

/// CIM_ConcreteJob property set for `job`.
#[must_use]
pub fn standard_job_instance(job: &JobSnapshot, ctx: &ConvertContext) -> Instance {
    let elapsed = job.start_time.map(|start| {
        let end = if job.is_finished() {
            job.time_of_last_state_change
        } else {
            Utc::now()
        };
        (end - start).num_milliseconds().max(0)
    });
    let (error_code, error_description) = match &job.error {
        Some(failure) => (
            Value::from(failure_code(failure.kind)),
            Value::from(failure.message.clone()),
        ),
        None => (Value::Null, Value::Null),
    };

    Instance::new(&ctx.namespace, &ctx.class_name)
        .with_key(INSTANCE_ID, ctx.instance_id(job.number))
        .with_property("Name", job.name.clone())
        .with_property("JobState", job.state.cim_value())
        .with_property("OperationalStatus", job.state.operational_status())
        .with_property("JobStatus", job_status(job))
        .with_property("PercentComplete", job.percent_complete)
        .with_property("Priority", job.priority)
        .with_property("DeleteOnCompletion", job.delete_on_completion)
        .with_property(
            "TimeBeforeRemoval",
            u64::try_from(job.time_before_removal.as_millis()).unwrap_or(u64::MAX),
        )
        .with_property("TimeSubmitted", job.time_submitted.to_rfc3339())
        .with_property(
            "StartTime",
            job.start_time.map(|t| Value::from(t.to_rfc3339())).unwrap_or_default(),
        )
        .with_property(
            "TimeOfLastStateChange",
            job.time_of_last_state_change.to_rfc3339(),
        )
        .with_property("ElapsedTime", elapsed.map(Value::from).unwrap_or_default())
        .with_property("ErrorCode", error_code)
        .with_property("ErrorDescription", error_description)
        .with_property(
            "MethodName",
            job.method_name.clone().map(Value::from).unwrap_or_default(),
        )
}

fn job_status(job: &JobSnapshot) -> String {
    if let Some(status) = &job.status_description {
        return status.clone();
    }
    match job.state {
        JobState::New => "Enqueued".to_string(),
        JobState::Running => "Running".to_string(),
        JobState::Completed => "Completed successfully".to_string(),
        JobState::Terminated => "Terminated".to_string(),
        JobState::Exception => job
            .error
            .as_ref()
            .map_or_else(|| "Failed".to_string(), |e| format!("Failed: {}", e.message)),
    }
}

fn failure_code(kind: crate::job::JobFailureKind) -> u16 {
    use crate::job::JobFailureKind;
    match kind {
        JobFailureKind::Failed => 1,
        JobFailureKind::NotSupported => 7,
        JobFailureKind::InvalidParameter => 4,
        JobFailureKind::Terminated => 17,
    }
}

/// Filters a modification is reported under, in send order.
#[must_use]
pub(crate) fn modification_filters(
    property: JobProperty,
    before: &JobSnapshot,
    after: &JobSnapshot,
) -> Vec<(&'static str, PerceivedSeverity)> {
    let mut filters = Vec::new();
    match property {
        JobProperty::State if before.state != after.state => {
            filters.push((filter_ids::CHANGED, PerceivedSeverity::Information));
            match after.state {
                JobState::Completed => {
                    filters.push((filter_ids::SUCCEEDED, PerceivedSeverity::Information));
                }
                JobState::Exception => {
                    filters.push((filter_ids::FAILED, PerceivedSeverity::Major));
                }
                _ => {}
            }
        }
        JobProperty::PercentComplete if before.percent_complete != after.percent_complete => {
            filters.push((filter_ids::PERCENT_UPDATED, PerceivedSeverity::Information));
        }
        _ => {}
    }
    filters
}
