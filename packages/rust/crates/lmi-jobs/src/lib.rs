//! Asynchronous CIM job manager.
//!
//! - **Jobs**: numbered units of work moving through NEW → RUNNING →
//!   {COMPLETED, EXCEPTION}, or to TERMINATED when cancelled.
//! - **Manager**: priority-ordered pending queue, single or concurrent
//!   execution, delayed deletion, one event loop thread per profile.
//! - **Persistence**: one JSON file per job, reloaded and resumed on start.
//! - **Indications**: lifecycle events delivered through `lmi-indications`.

mod calendar;
pub mod config;
pub mod content;
mod error;
mod job;
mod manager;
mod persistence;
mod registry;
#[doc(hidden)]
pub mod test_support;

pub use error::{JobError, Result};
pub use job::{Job, JobFailure, JobFailureKind, JobProperty, JobSnapshot, JobState, JobType};
pub use manager::{JobManager, JobManagerConfig, ProviderHandle};
pub use persistence::{JobStorage, StoredJobFile};
pub use registry::{JobTypeHandler, JobTypeInfo, ReturnValueKind};

pub use tokio_util::sync::CancellationToken;
