//! The job object: identity, properties and the per-job lock.
//!
//! Every mutation goes through a setter that takes the job lock, records a
//! before/after snapshot and forwards a signal to the owning manager's event
//! loop. Signals are queued while the job lock is held, so the loop sees
//! them in the order the changes happened.

mod snapshot;
mod state;

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};

pub use snapshot::{JobFailure, JobFailureKind, JobProperty, JobSnapshot, JobType};
pub use state::JobState;

use crate::error::{JobError, Result};
use crate::manager::{LoopMessage, SignalHook};

struct JobInner {
    snapshot: JobSnapshot,
    hook: Option<SignalHook>,
    persistent: bool,
    in_worker: bool,
}

impl JobInner {
    fn emit(&self, message: LoopMessage) {
        if let Some(hook) = &self.hook
            && hook.send(message).is_err()
        {
            tracing::debug!(
                job_number = self.snapshot.number,
                "event loop gone; job signal dropped"
            );
        }
    }
}

/// A unit of asynchronous, trackable, cancellable work.
pub struct Job {
    number: u64,
    jobid: String,
    job_type: JobType,
    inner: Mutex<JobInner>,
    finished: Condvar,
}

impl Job {
    pub(crate) fn from_snapshot(snapshot: JobSnapshot, persistent: bool) -> Self {
        Self {
            number: snapshot.number,
            jobid: snapshot.jobid.clone(),
            job_type: snapshot.job_type.clone(),
            inner: Mutex::new(JobInner {
                snapshot,
                hook: None,
                persistent,
                in_worker: false,
            }),
            finished: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn attach(&self, hook: SignalHook) {
        self.lock().hook = Some(hook);
    }

    /// Stop forwarding signals; used right before deletion.
    pub(crate) fn detach(&self) {
        self.lock().hook = None;
    }

    pub(crate) fn persistence_enabled(&self) -> bool {
        self.lock().persistent
    }

    pub(crate) fn disable_persistence(&self) {
        self.lock().persistent = false;
    }

    /// Claim the job for a worker; `false` if another worker still holds it.
    pub(crate) fn enter_worker(&self) -> bool {
        let mut inner = self.lock();
        !std::mem::replace(&mut inner.in_worker, true)
    }

    /// Release the worker claim and report it to whichever loop the job is
    /// attached to now.
    pub(crate) fn leave_worker(&self, panicked: bool) {
        let mut inner = self.lock();
        inner.in_worker = false;
        inner.emit(LoopMessage::WorkerFinished {
            number: self.number,
            panicked,
        });
    }

    pub(crate) fn in_worker(&self) -> bool {
        self.lock().in_worker
    }

    /// Process-unique job number.
    pub fn number(&self) -> u64 {
        self.number
    }

    /// `<ORGID>:<ClassName>:<Number>` identity.
    pub fn jobid(&self) -> &str {
        &self.jobid
    }

    /// Registered type of this job.
    pub fn job_type(&self) -> &JobType {
        &self.job_type
    }

    /// Copy of all properties.
    pub fn snapshot(&self) -> JobSnapshot {
        self.lock().snapshot.clone()
    }

    /// Current state.
    pub fn state(&self) -> JobState {
        self.lock().snapshot.state
    }

    /// Whether the job reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    /// Display name.
    pub fn name(&self) -> String {
        self.lock().snapshot.name.clone()
    }

    /// Scheduling priority, lower runs first.
    pub fn priority(&self) -> u32 {
        self.lock().snapshot.priority
    }

    /// Progress in percent.
    pub fn percent_complete(&self) -> u16 {
        self.lock().snapshot.percent_complete
    }

    /// Whether the job is removed automatically after finishing.
    pub fn delete_on_completion(&self) -> bool {
        self.lock().snapshot.delete_on_completion
    }

    /// Delay before automatic removal.
    pub fn time_before_removal(&self) -> Duration {
        self.lock().snapshot.time_before_removal
    }

    /// Method input parameters.
    pub fn in_params(&self) -> Map<String, Value> {
        self.lock().snapshot.in_params.clone()
    }

    /// Type-specific payload.
    pub fn data(&self) -> Value {
        self.lock().snapshot.data.clone()
    }

    fn modify<F>(&self, property: JobProperty, apply: F) -> bool
    where
        F: FnOnce(&mut JobSnapshot) -> bool,
    {
        let mut inner = self.lock();
        let before = inner.snapshot.clone();
        if !apply(&mut inner.snapshot) {
            return false;
        }
        let after = inner.snapshot.clone();
        inner.emit(LoopMessage::Modified {
            number: self.number,
            before: Box::new(before),
            after: Box::new(after),
            property,
        });
        true
    }

    /// Set the display name.
    pub fn set_name(&self, name: impl Into<String>) -> bool {
        let name = name.into();
        self.modify(JobProperty::Name, |s| replace(&mut s.name, name))
    }

    /// Change priority; a pending job is re-queued under the new value.
    pub fn set_priority(&self, priority: u32) -> bool {
        self.modify(JobProperty::Priority, |s| replace(&mut s.priority, priority))
    }

    /// Update progress, clamped to 100.
    pub fn set_percent_complete(&self, percent: u16) -> bool {
        let percent = percent.min(100);
        self.modify(JobProperty::PercentComplete, |s| {
            replace(&mut s.percent_complete, percent)
        })
    }

    /// Request (or cancel) automatic removal after finishing.
    pub fn set_delete_on_completion(&self, delete: bool) -> bool {
        self.modify(JobProperty::DeleteOnCompletion, |s| {
            replace(&mut s.delete_on_completion, delete)
        })
    }

    /// Delay between finishing and automatic removal.
    pub fn set_time_before_removal(&self, delay: Duration) -> bool {
        self.modify(JobProperty::TimeBeforeRemoval, |s| {
            replace(&mut s.time_before_removal, delay)
        })
    }

    /// Name of the method that spawned the job.
    pub fn set_method_name(&self, method: impl Into<String>) -> bool {
        let method = Some(method.into());
        self.modify(JobProperty::MethodName, |s| replace(&mut s.method_name, method))
    }

    /// Free-form status line.
    pub fn set_status_description(&self, status: impl Into<String>) -> bool {
        let status = Some(status.into());
        self.modify(JobProperty::StatusDescription, |s| {
            replace(&mut s.status_description, status)
        })
    }

    /// Set one input parameter.
    pub fn set_in_param(&self, name: impl Into<String>, value: impl Into<Value>) -> bool {
        let (name, value) = (name.into(), value.into());
        self.modify(JobProperty::Parameters, |s| {
            s.in_params.insert(name, value.clone()).as_ref() != Some(&value)
        })
    }

    /// Set one output parameter.
    pub fn set_out_param(&self, name: impl Into<String>, value: impl Into<Value>) -> bool {
        let (name, value) = (name.into(), value.into());
        self.modify(JobProperty::Parameters, |s| {
            s.out_params.insert(name, value.clone()).as_ref() != Some(&value)
        })
    }

    /// Replace the type-specific payload.
    pub fn set_data(&self, data: Value) -> bool {
        self.modify(JobProperty::Data, |s| replace(&mut s.data, data))
    }

    fn transition(
        &self,
        next: JobState,
        result: Option<Value>,
        error: Option<JobFailure>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let current = inner.snapshot.state;
        if !current.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                number: self.number,
                from: current,
                to: next,
            });
        }

        let before = inner.snapshot.clone();
        let now = Utc::now();
        let snapshot = &mut inner.snapshot;
        snapshot.state = next;
        snapshot.time_of_last_state_change = now;
        match next {
            JobState::Running => {
                snapshot.start_time.get_or_insert(now);
            }
            JobState::Completed => {
                snapshot.percent_complete = 100;
                snapshot.result = result;
            }
            JobState::Terminated | JobState::Exception => {
                snapshot.result = result;
                snapshot.error = error;
            }
            JobState::New => {}
        }
        let after = snapshot.clone();

        tracing::debug!(
            job_number = self.number,
            jobid = %self.jobid,
            from = %current,
            to = %next,
            "job state changed"
        );
        inner.emit(LoopMessage::Modified {
            number: self.number,
            before: Box::new(before),
            after: Box::new(after),
            property: JobProperty::State,
        });
        if next.is_finished() {
            inner.emit(LoopMessage::Finished {
                number: self.number,
                state: next,
            });
            self.finished.notify_all();
        }
        Ok(())
    }

    /// NEW → RUNNING.
    pub(crate) fn start(&self) -> Result<()> {
        self.transition(JobState::Running, None, None)
    }

    /// Finish successfully with an optional return value.
    pub fn finish_ok(&self, result: Option<Value>) -> Result<()> {
        self.transition(JobState::Completed, result, None)
    }

    /// Finish with an error.
    pub fn finish_exception(&self, failure: JobFailure) -> Result<()> {
        tracing::warn!(
            job_number = self.number,
            jobid = %self.jobid,
            error = %failure.message,
            "job failed"
        );
        self.transition(JobState::Exception, None, Some(failure))
    }

    /// Finish as cancelled.
    pub fn finish_terminated(&self) -> Result<()> {
        let failure = JobFailure {
            kind: JobFailureKind::Terminated,
            message: "job was terminated".to_string(),
        };
        self.transition(JobState::Terminated, None, Some(failure))
    }

    /// Block until the job finishes or `timeout` elapses.
    ///
    /// Returns the terminal state, or `None` on timeout.
    pub fn wait_finished(&self, timeout: Option<Duration>) -> Option<JobState> {
        let inner = self.lock();
        let unfinished = |inner: &mut JobInner| !inner.snapshot.state.is_finished();
        let inner = match timeout {
            Some(timeout) => {
                self.finished
                    .wait_timeout_while(inner, timeout, unfinished)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .finished
                .wait_while(inner, unfinished)
                .unwrap_or_else(PoisonError::into_inner),
        };
        let state = inner.snapshot.state;
        state.is_finished().then_some(state)
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("number", &self.number)
            .field("jobid", &self.jobid)
            .field("job_type", &self.job_type)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn job() -> Job {
        Job::from_snapshot(
            JobSnapshot::new(7, "LMI:LMI_TestJob:7".into(), JobType::new("TestJob")),
            false,
        )
    }

    #[test]
    fn test_setters_report_change_only_once() {
        let job = job();
        assert!(job.set_priority(5));
        assert!(!job.set_priority(5));
        assert!(job.set_percent_complete(250));
        assert_eq!(job.percent_complete(), 100);
    }

    #[test]
    fn test_signals_arrive_in_order() {
        let job = job();
        let (tx, mut rx) = mpsc::unbounded_channel();
        job.attach(tx);

        job.set_percent_complete(10);
        job.start().unwrap();
        job.finish_ok(Some(Value::from(0))).unwrap();

        let mut seen = Vec::new();
        while let Ok(message) = rx.try_recv() {
            match message {
                LoopMessage::Modified { property, after, .. } => {
                    seen.push(format!("{property:?}:{}", after.state));
                }
                LoopMessage::Finished { state, .. } => seen.push(format!("finished:{state}")),
                _ => {}
            }
        }
        assert_eq!(
            seen,
            vec![
                "PercentComplete:new",
                "State:running",
                "State:completed",
                "finished:completed"
            ]
        );
    }

    #[test]
    fn test_finished_job_rejects_transitions() {
        let job = job();
        job.finish_terminated().unwrap();
        assert!(matches!(
            job.start(),
            Err(JobError::InvalidTransition { .. })
        ));
        assert_eq!(job.wait_finished(Some(Duration::ZERO)), Some(JobState::Terminated));
    }

    #[test]
    fn test_detached_job_emits_nothing() {
        let job = job();
        let (tx, mut rx) = mpsc::unbounded_channel();
        job.attach(tx);
        job.detach();
        job.set_name("renamed");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_worker_claim_is_exclusive_and_reported() {
        let job = job();
        let (tx, mut rx) = mpsc::unbounded_channel();
        job.attach(tx);

        assert!(job.enter_worker());
        assert!(!job.enter_worker());
        assert!(job.in_worker());
        job.leave_worker(false);
        assert!(!job.in_worker());
        assert!(matches!(
            rx.try_recv(),
            Ok(LoopMessage::WorkerFinished { number: 7, panicked: false })
        ));
        assert!(job.enter_worker());
    }

    #[test]
    fn test_wait_finished_times_out_for_new_job() {
        assert_eq!(job().wait_finished(Some(Duration::from_millis(10))), None);
    }
}
