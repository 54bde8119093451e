use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use lmi_indications::IndicationKind;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::calendar::CalendarAction;
use crate::content::modification_filters;
use crate::error::{JobError, Result};
use crate::job::{Job, JobFailure, JobProperty, JobSnapshot, JobState};
use crate::manager::types::{LoopMessage, SignalHook, epoch_millis};
use crate::registry::JobTypeInfo;

use super::JobManager;
use super::store::JobStore;

/// How long a stopping loop waits for cancelled workers to finish their job.
const WORKER_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub(super) struct LoopHandle {
    mailbox: SignalHook,
    thread: JoinHandle<()>,
    thread_id: ThreadId,
}

impl LoopHandle {
    pub(super) fn thread_id(&self) -> ThreadId {
        self.thread_id
    }
}

impl JobManager {
    pub(super) fn start_event_loop(self: &Arc<Self>) -> Result<LoopHandle> {
        let (mailbox, inbox) = mpsc::unbounded_channel();
        {
            let mut store = self.lock_store();
            store.mailbox = Some(mailbox.clone());
            for job in store.jobs.values() {
                job.attach(mailbox.clone());
            }
            self.reclaim_workers(&mut store);
            self.load_persisted_jobs(&mut store, &mailbox);
        }

        let thread_name = format!("lmi-jobs-{}", self.config.profile_name.to_lowercase());
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .thread_name(format!("{thread_name}-worker"))
            .build()
            .map_err(|error| self.abort_start(format!("failed to build event loop runtime: {error}")))?;
        let manager = Arc::clone(self);
        let thread = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                runtime.block_on(manager.run_event_loop(inbox));
                // Workers still inside `process` keep their thread and report
                // through the job's signal hook.
                runtime.shutdown_background();
            })
            .map_err(|error| self.abort_start(format!("failed to spawn event loop thread: {error}")))?;

        let _ = mailbox.send(LoopMessage::Launch);
        Ok(LoopHandle {
            mailbox,
            thread_id: thread.thread().id(),
            thread,
        })
    }

    fn abort_start(&self, message: String) -> JobError {
        tracing::error!(profile = %self.config.profile_name, error = %message, "job event loop not started");
        self.lock_store().mailbox = None;
        JobError::Failed(message)
    }

    pub(super) fn stop_event_loop(&self, handle: LoopHandle) {
        let cancelled: Vec<Arc<Job>> = {
            let mut store = self.lock_store();
            store.mailbox = None;
            store
                .running
                .iter()
                .filter_map(|(number, token)| {
                    let job = store.jobs.get(number)?;
                    let cancellable = self
                        .registry
                        .get(job.job_type())
                        .is_ok_and(|info| info.is_cancellable());
                    cancellable.then(|| {
                        token.cancel();
                        Arc::clone(job)
                    })
                })
                .collect()
        };
        if std::thread::current().id() == handle.thread_id {
            let _ = handle.mailbox.send(LoopMessage::Shutdown);
            tracing::warn!(
                profile = %self.config.profile_name,
                "job manager stopped from its own event loop; not joining"
            );
            return;
        }

        // Final states of cancelled jobs reach the loop ahead of Shutdown.
        let deadline = Instant::now() + WORKER_SHUTDOWN_GRACE;
        for job in &cancelled {
            if job
                .wait_finished(Some(deadline.saturating_duration_since(Instant::now())))
                .is_none()
            {
                tracing::warn!(job_number = job.number(), "cancelled job still running at shutdown");
            }
        }
        let _ = handle.mailbox.send(LoopMessage::Shutdown);
        if handle.thread.join().is_err() {
            tracing::error!(profile = %self.config.profile_name, "job event loop thread panicked");
        }

        let mut store = self.lock_store();
        self.reclaim_workers(&mut store);
    }

    /// Release running slots whose worker returned while no loop listened.
    ///
    /// Unfinished jobs go back to the pending queue; jobs still inside a
    /// worker keep their slot until that worker reports.
    fn reclaim_workers(&self, store: &mut JobStore) {
        let idle: Vec<u64> = store
            .running
            .keys()
            .copied()
            .filter(|number| store.jobs.get(number).is_none_or(|job| !job.in_worker()))
            .collect();
        for number in idle {
            store.running.remove(&number);
            let Some(job) = store.jobs.get(&number).cloned() else {
                continue;
            };
            if !job.is_finished() {
                store.enqueue(number, job.priority());
                continue;
            }
            let snapshot = job.snapshot();
            Self::update_deletion(store, &snapshot);
            if job.persistence_enabled()
                && let Err(error) = self.storage.save(&snapshot)
            {
                tracing::warn!(
                    job_number = number,
                    error = %format!("{error:#}"),
                    "failed to save job"
                );
            }
        }
    }

    /// Reload persisted jobs into the store, in submission order.
    fn load_persisted_jobs(&self, store: &mut JobStore, mailbox: &SignalHook) {
        if !self.registry.any_persistent() {
            return;
        }
        let snapshots = match self.storage.load_all() {
            Ok(snapshots) => snapshots,
            Err(error) => {
                tracing::error!(
                    dir = %self.storage.dir().display(),
                    error = %format!("{error:#}"),
                    "failed to load persisted jobs"
                );
                return;
            }
        };

        let mut loaded = 0usize;
        for snapshot in snapshots {
            let number = snapshot.number;
            if store.jobs.contains_key(&number) {
                continue;
            }
            let persistent = match self.registry.get(&snapshot.job_type) {
                Ok(info) => info.is_persistent(),
                Err(_) => {
                    tracing::warn!(
                        job_number = number,
                        job_type = %snapshot.job_type,
                        "skipping persisted job of unregistered type"
                    );
                    continue;
                }
            };
            self.next_number
                .fetch_max(number.saturating_add(1), std::sync::atomic::Ordering::SeqCst);

            let finished = snapshot.is_finished();
            let priority = snapshot.priority;
            Self::update_deletion(store, &snapshot);
            let job = Arc::new(Job::from_snapshot(snapshot, persistent));
            job.attach(mailbox.clone());
            store.jobs.insert(number, job);
            if !finished {
                store.enqueue(number, priority);
            }
            loaded += 1;
        }
        tracing::info!(
            profile = %self.config.profile_name,
            loaded,
            resumed = store.pending_numbers().len(),
            "persisted jobs loaded"
        );
    }

    async fn run_event_loop(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<LoopMessage>) {
        tracing::info!(profile = %self.config.profile_name, "job event loop started");
        loop {
            let deadline = self.lock_store().calendar.next_deadline();
            let message = match deadline {
                Some(at_ms) => {
                    let wait = u64::try_from(at_ms.saturating_sub(epoch_millis())).unwrap_or(0);
                    tokio::select! {
                        message = inbox.recv() => message,
                        () = tokio::time::sleep(Duration::from_millis(wait)) => {
                            self.process_calendar_events();
                            continue;
                        }
                    }
                }
                None => inbox.recv().await,
            };
            match message {
                None | Some(LoopMessage::Shutdown) => break,
                Some(message) => self.handle_message(message),
            }
        }
        tracing::info!(profile = %self.config.profile_name, "job event loop stopped");
    }

    fn handle_message(self: &Arc<Self>, message: LoopMessage) {
        match message {
            LoopMessage::Modified {
                number,
                before,
                after,
                property,
            } => self.job_modified(number, &before, &after, property),
            LoopMessage::Finished { number, state } => self.job_finished(number, state),
            LoopMessage::Launch => self.launch_jobs(),
            LoopMessage::WorkerFinished { number, panicked } => {
                self.worker_finished(number, panicked);
            }
            LoopMessage::Shutdown => {}
        }
    }

    fn job_modified(
        &self,
        number: u64,
        before: &JobSnapshot,
        after: &JobSnapshot,
        property: JobProperty,
    ) {
        {
            let mut store = self.lock_store();
            let Some(job) = store.jobs.get(&number).cloned() else {
                tracing::trace!(job_number = number, "modification of deleted job ignored");
                return;
            };
            if property == JobProperty::Priority && store.requeue(number, job.priority()) {
                tracing::debug!(job_number = number, priority = job.priority(), "pending job re-queued");
            }
            if property.affects_deletion() {
                Self::update_deletion(&mut store, &job.snapshot());
            }
            // delete_job removes the file under the same lock.
            if job.persistence_enabled()
                && let Err(error) = self.storage.save(after)
            {
                tracing::warn!(
                    job_number = number,
                    error = %format!("{error:#}"),
                    "failed to save job"
                );
                if let Err(error) = self.storage.ensure_dir() {
                    tracing::error!(
                        job_number = number,
                        dir = %self.storage.dir().display(),
                        error = %format!("{error:#}"),
                        "job storage unavailable; persistence disabled for job"
                    );
                    job.disable_persistence();
                }
            }
        }

        for (filter_id, severity) in modification_filters(property, before, after) {
            self.send_job_indication(
                IndicationKind::Modification,
                after,
                Some(before),
                filter_id,
                severity,
            );
        }
    }

    fn job_finished(&self, number: u64, state: JobState) {
        let mut store = self.lock_store();
        let Some(job) = store.jobs.get(&number).cloned() else {
            return;
        };
        store.remove_pending(number);
        Self::update_deletion(&mut store, &job.snapshot());
        tracing::info!(job_number = number, jobid = %job.jobid(), %state, "job finished");
    }

    fn worker_finished(self: &Arc<Self>, number: u64, panicked: bool) {
        let job = {
            let mut store = self.lock_store();
            store.running.remove(&number);
            store.jobs.get(&number).cloned()
        };
        if let Some(job) = job
            && !job.is_finished()
        {
            let reason = if panicked {
                "job processing panicked"
            } else {
                "job processing returned without finishing the job"
            };
            tracing::warn!(job_number = number, reason, "forcing job into exception state");
            if job.state() == JobState::New
                && let Err(error) = job.start()
            {
                tracing::warn!(job_number = number, %error, "failed to mark job running");
            }
            if let Err(error) = job.finish_exception(JobFailure::failed(reason)) {
                tracing::warn!(job_number = number, %error, "failed to force job exception");
            }
        }
        self.launch_jobs();
    }

    fn launch_jobs(&self) {
        let mut store = self.lock_store();
        if store.mailbox.is_none() {
            return;
        }
        while let Some(number) = store.pop_launchable(self.config.concurrent_processing) {
            let Some(job) = store.jobs.get(&number).cloned() else {
                continue;
            };
            if job.is_finished() {
                continue;
            }
            let Ok(info) = self.registry.get(job.job_type()) else {
                continue;
            };
            let cancel = CancellationToken::new();
            store.running.insert(number, cancel.clone());
            if !job.enter_worker() {
                tracing::warn!(
                    job_number = number,
                    "previous worker still inside process; not relaunched"
                );
                continue;
            }
            spawn_worker(job, info, cancel);
        }
    }

    fn process_calendar_events(&self) {
        let due = self.lock_store().calendar.pop_due(epoch_millis());
        for event in due {
            match event.action {
                CalendarAction::DeleteJob => {
                    let Some(job) = self.get_job_by_number(event.number) else {
                        continue;
                    };
                    if !job.delete_on_completion() {
                        tracing::debug!(
                            job_number = event.number,
                            "deletion no longer requested; skipping"
                        );
                        continue;
                    }
                    if let Err(error) = self.delete_job(&job) {
                        tracing::warn!(job_number = event.number, %error, "scheduled deletion failed");
                    }
                }
            }
        }
    }
}

fn spawn_worker(job: Arc<Job>, info: Arc<JobTypeInfo>, cancel: CancellationToken) {
    tracing::info!(job_number = job.number(), jobid = %job.jobid(), "job launched");
    tokio::task::spawn_blocking(move || {
        let _claim = WorkerClaim(&job);
        run_worker(&job, &info, &cancel);
    });
}

/// Releases the job's worker claim on return or unwind.
struct WorkerClaim<'a>(&'a Job);

impl Drop for WorkerClaim<'_> {
    fn drop(&mut self) {
        let panicked = std::thread::panicking();
        if panicked {
            tracing::error!(job_number = self.0.number(), "job worker panicked");
        }
        self.0.leave_worker(panicked);
    }
}

fn run_worker(job: &Arc<Job>, info: &JobTypeInfo, cancel: &CancellationToken) {
    if cancel.is_cancelled() {
        if let Err(error) = job.finish_terminated() {
            tracing::warn!(job_number = job.number(), %error, "failed to terminate job");
        }
        return;
    }
    if job.state() == JobState::New
        && let Err(error) = job.start()
    {
        tracing::warn!(job_number = job.number(), %error, "failed to start job");
        return;
    }
    info.handler().process(job, cancel);
}
