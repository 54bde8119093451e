//! Job type registry: write-once behavior descriptors keyed by job type.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use lmi_indications::Instance;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::content::{ConvertContext, standard_job_instance};
use crate::error::{JobError, Result};
use crate::job::{Job, JobSnapshot, JobType};

/// Behavior plugged in by a provider for one job type.
pub trait JobTypeHandler: Send + Sync {
    /// Outward instance of the job.
    fn convert(&self, job: &JobSnapshot, ctx: &ConvertContext) -> Result<Instance> {
        Ok(standard_job_instance(job, ctx))
    }

    /// Instance carrying the method's input and output parameters.
    fn job_parameters(&self, job: &JobSnapshot, ctx: &ConvertContext) -> Result<Instance> {
        let mut instance = Instance::new(&ctx.namespace, "__MethodParameters");
        for (name, value) in job.in_params.iter().chain(job.out_params.iter()) {
            instance.set(name.clone(), value.clone());
        }
        Ok(instance)
    }

    /// Run the job to completion on a worker thread.
    ///
    /// The handler should finish the job itself (`finish_ok`,
    /// `finish_exception` or `finish_terminated` once `cancel` fires).
    /// Returning with the job still unfinished forces it into EXCEPTION.
    fn process(&self, job: &Arc<Job>, cancel: &CancellationToken);
}

/// CIM type of a method's return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnValueKind {
    /// Method returns nothing.
    #[default]
    None,
    /// `uint32` status code.
    Uint32,
    /// `uint16`.
    Uint16,
    /// `boolean`.
    Boolean,
    /// `string`.
    String,
}

impl ReturnValueKind {
    /// Coerce a stored result to this CIM type; `None` when it does not fit.
    #[must_use]
    pub fn coerce(self, value: &Value) -> Option<Value> {
        match self {
            Self::None => None,
            Self::Uint32 => value
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .map(Value::from),
            Self::Uint16 => value
                .as_u64()
                .and_then(|v| u16::try_from(v).ok())
                .map(Value::from),
            Self::Boolean => value.as_bool().map(Value::from),
            Self::String => Some(match value {
                Value::String(s) => Value::from(s.clone()),
                other => Value::from(other.to_string()),
            }),
        }
    }
}

/// Behavior descriptor of one job type.
#[derive(Clone)]
pub struct JobTypeInfo {
    job_type: JobType,
    class_name: String,
    handler: Arc<dyn JobTypeHandler>,
    return_value: ReturnValueKind,
    cancellable: bool,
    persistent: bool,
}

impl JobTypeInfo {
    /// Non-cancellable, non-persistent type with no return value.
    pub fn new(
        job_type: impl Into<JobType>,
        class_name: impl Into<String>,
        handler: Arc<dyn JobTypeHandler>,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            class_name: class_name.into(),
            handler,
            return_value: ReturnValueKind::None,
            cancellable: false,
            persistent: false,
        }
    }

    /// Allow `terminate_job` on running jobs of this type.
    #[must_use]
    pub fn cancellable(mut self, cancellable: bool) -> Self {
        self.cancellable = cancellable;
        self
    }

    /// Save jobs of this type to the storage directory.
    #[must_use]
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// CIM type of the method's return value.
    #[must_use]
    pub fn return_value(mut self, kind: ReturnValueKind) -> Self {
        self.return_value = kind;
        self
    }

    /// Registered type name.
    pub fn job_type(&self) -> &JobType {
        &self.job_type
    }

    /// CIM class of jobs of this type.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Plugged-in behavior.
    pub fn handler(&self) -> &Arc<dyn JobTypeHandler> {
        &self.handler
    }

    /// Return value type.
    pub fn return_value_kind(&self) -> ReturnValueKind {
        self.return_value
    }

    /// Whether running jobs can be terminated.
    pub fn is_cancellable(&self) -> bool {
        self.cancellable
    }

    /// Whether jobs are persisted.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }
}

impl fmt::Debug for JobTypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobTypeInfo")
            .field("job_type", &self.job_type)
            .field("class_name", &self.class_name)
            .field("return_value", &self.return_value)
            .field("cancellable", &self.cancellable)
            .field("persistent", &self.persistent)
            .finish_non_exhaustive()
    }
}

/// Registered job types. Frozen once the event loop starts.
#[derive(Debug, Default)]
pub(crate) struct JobTypeRegistry {
    types: RwLock<HashMap<JobType, Arc<JobTypeInfo>>>,
    frozen: AtomicBool,
}

impl JobTypeRegistry {
    pub(crate) fn register(&self, info: JobTypeInfo) -> Result<()> {
        let mut types = self.types.write().unwrap_or_else(PoisonError::into_inner);
        // `frozen` only flips while the write lock is held.
        if self.frozen.load(Ordering::Acquire) {
            return Err(JobError::RegistryFrozen);
        }
        if types.contains_key(&info.job_type) {
            return Err(JobError::TypeAlreadyRegistered(info.job_type.to_string()));
        }
        tracing::debug!(
            job_type = %info.job_type,
            class_name = %info.class_name,
            cancellable = info.cancellable,
            persistent = info.persistent,
            "job type registered"
        );
        types.insert(info.job_type.clone(), Arc::new(info));
        Ok(())
    }

    pub(crate) fn freeze(&self) {
        let _types = self.types.write().unwrap_or_else(PoisonError::into_inner);
        self.frozen.store(true, Ordering::Release);
    }

    pub(crate) fn get(&self, job_type: &JobType) -> Result<Arc<JobTypeInfo>> {
        let types = self.types.read().unwrap_or_else(PoisonError::into_inner);
        types.get(job_type).cloned().ok_or_else(|| {
            tracing::error!(job_type = %job_type, "job type is not registered");
            JobError::UnknownJobType(job_type.to_string())
        })
    }

    pub(crate) fn all(&self) -> Vec<Arc<JobTypeInfo>> {
        let types = self.types.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = types.values().cloned().collect();
        all.sort_by(|a, b| a.job_type.cmp(&b.job_type));
        all
    }

    pub(crate) fn any_persistent(&self) -> bool {
        self.types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|info| info.persistent)
    }
}
