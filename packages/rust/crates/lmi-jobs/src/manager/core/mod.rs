//! Job manager: job store, provider attachment and the public job API.

mod runtime;
mod store;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lmi_indications::{
    Broker, IndicationKind, IndicationSender, Instance, ObjectPath, PerceivedSeverity,
};

use crate::calendar::CalendarAction;
use crate::content::{
    ConvertContext, INSTANCE_ID, filter_ids, instance_id, parse_instance_id, standard_filters,
};
use crate::error::{JobError, Result};
use crate::job::{Job, JobSnapshot, JobState, JobType};
use crate::manager::types::{JobManagerConfig, LoopMessage, epoch_millis};
use crate::persistence::JobStorage;
use crate::registry::{JobTypeInfo, JobTypeRegistry};

use self::runtime::LoopHandle;
use self::store::JobStore;

#[derive(Debug, Default)]
struct RuntimeState {
    attached: usize,
    event_loop: Option<LoopHandle>,
}

/// Asynchronous job manager for one profile.
///
/// Lock order is manager (store) lock first, job lock second.
pub struct JobManager {
    config: JobManagerConfig,
    registry: JobTypeRegistry,
    sender: Arc<IndicationSender>,
    storage: JobStorage,
    store: Mutex<JobStore>,
    runtime: Mutex<RuntimeState>,
    next_number: AtomicU64,
}

impl JobManager {
    /// Create a stopped manager. Register job types, then [`JobManager::attach`].
    pub fn new(config: JobManagerConfig) -> Arc<Self> {
        let sender = Arc::new(IndicationSender::new(&config.host_name, &config.namespace));
        let storage = JobStorage::new(config.storage_dir());
        Arc::new(Self {
            config,
            registry: JobTypeRegistry::default(),
            sender,
            storage,
            store: Mutex::new(JobStore::default()),
            runtime: Mutex::new(RuntimeState::default()),
            next_number: AtomicU64::new(1),
        })
    }

    fn lock_store(&self) -> MutexGuard<'_, JobStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_runtime(&self) -> MutexGuard<'_, RuntimeState> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Manager configuration.
    pub fn config(&self) -> &JobManagerConfig {
        &self.config
    }

    /// Sender used for job indications; CIMOM filter callbacks go here.
    pub fn indication_sender(&self) -> &Arc<IndicationSender> {
        &self.sender
    }

    /// Storage of persisted jobs.
    pub fn storage(&self) -> &JobStorage {
        &self.storage
    }

    /// Register a job type. Fails once the first provider attached.
    pub fn register_job_type(&self, info: JobTypeInfo) -> Result<()> {
        self.registry.register(info)
    }

    /// Whether the event loop is running.
    pub fn is_running(&self) -> bool {
        self.lock_runtime().event_loop.is_some()
    }

    /// Attach a provider instrumenting `class_name`.
    ///
    /// The first attach freezes the registry, initialises the indication
    /// sender, loads persisted jobs and starts the event loop. Dropping the
    /// last [`ProviderHandle`] stops it again.
    pub fn attach(self: &Arc<Self>, class_name: &str, broker: Arc<dyn Broker>) -> Result<ProviderHandle> {
        let mut runtime = self.lock_runtime();
        let created = self.sender.init(&self.config.indication_prefix)?;
        if created {
            self.register_standard_filters();
        }
        if runtime.event_loop.is_none() {
            self.registry.freeze();
            match self.start_event_loop() {
                Ok(handle) => runtime.event_loop = Some(handle),
                Err(error) => {
                    let _ = self.sender.cleanup();
                    return Err(error);
                }
            }
        }
        runtime.attached += 1;
        self.sender.register_broker(class_name, broker);
        tracing::info!(
            profile = %self.config.profile_name,
            class_name,
            providers = runtime.attached,
            "provider attached to job manager"
        );
        Ok(ProviderHandle {
            manager: Arc::clone(self),
            class_name: class_name.to_string(),
        })
    }

    fn detach(&self, class_name: &str) {
        let stopping = {
            let mut runtime = self.lock_runtime();
            self.sender.unregister_broker(class_name);
            runtime.attached = runtime.attached.saturating_sub(1);
            if let Err(error) = self.sender.cleanup() {
                tracing::warn!(class_name, %error, "indication sender cleanup failed");
            }
            tracing::info!(
                profile = %self.config.profile_name,
                class_name,
                providers = runtime.attached,
                "provider detached from job manager"
            );
            if runtime.attached > 0 {
                None
            } else {
                runtime.event_loop.take()
            }
        };
        if let Some(handle) = stopping {
            self.stop_event_loop(handle);
        }
    }

    fn register_standard_filters(&self) {
        let prefix = &self.config.indication_prefix;
        for info in self.registry.all() {
            let filters = standard_filters(info.class_name(), prefix);
            if let Err(error) = self.sender.add_static_filters(info.class_name(), &filters) {
                tracing::debug!(
                    class_name = %info.class_name(),
                    %error,
                    "standard job filters already registered"
                );
            }
        }
    }

    fn convert_context(&self, info: &JobTypeInfo) -> ConvertContext {
        ConvertContext {
            namespace: self.config.namespace.clone(),
            org_id: self.config.org_id.clone(),
            class_name: info.class_name().to_string(),
        }
    }

    /// Create a NEW job of `job_type`, persist it and announce it.
    pub fn new_job(&self, job_type: impl Into<JobType>) -> Result<Arc<Job>> {
        let job_type = job_type.into();
        let info = self.registry.get(&job_type)?;
        let job = {
            let mut store = self.lock_store();
            let mailbox = store.mailbox.clone().ok_or(JobError::NotRunning)?;
            let number = self.next_number.fetch_add(1, Ordering::SeqCst);
            let jobid = instance_id(&self.config.org_id, info.class_name(), number);
            let mut snapshot = JobSnapshot::new(number, jobid, job_type);
            snapshot.time_before_removal = self.config.default_time_before_removal;

            let persistent = info.is_persistent() && self.save_new(&snapshot);
            let job = Arc::new(Job::from_snapshot(snapshot, persistent));
            job.attach(mailbox);
            store.jobs.insert(number, Arc::clone(&job));
            job
        };
        tracing::info!(
            job_number = job.number(),
            jobid = %job.jobid(),
            job_type = %job.job_type(),
            "job created"
        );
        self.send_job_indication(
            IndicationKind::Creation,
            &job.snapshot(),
            None,
            filter_ids::CREATED,
            PerceivedSeverity::Information,
        );
        Ok(job)
    }

    /// First save of a job; `false` disables persistence for it.
    fn save_new(&self, snapshot: &JobSnapshot) -> bool {
        if let Err(error) = self.storage.ensure_dir() {
            tracing::error!(
                job_number = snapshot.number,
                error = %format!("{error:#}"),
                "job storage unavailable; job will not be persisted"
            );
            return false;
        }
        if let Err(error) = self.storage.save(snapshot) {
            tracing::warn!(
                job_number = snapshot.number,
                error = %format!("{error:#}"),
                "failed to save job"
            );
        }
        true
    }

    /// Queue `job` for execution.
    pub fn run_job(&self, job: &Arc<Job>) -> Result<()> {
        let number = job.number();
        let mut store = self.lock_store();
        if store.mailbox.is_none() {
            return Err(JobError::NotRunning);
        }
        if !store.jobs.contains_key(&number) {
            return Err(JobError::NotFound(job.jobid().to_string()));
        }
        if store.is_queued(number) {
            tracing::warn!(job_number = number, "job is already queued");
            return Err(JobError::AlreadyQueued(number));
        }
        if job.is_finished() {
            return Err(JobError::AlreadyFinished(number));
        }
        store.enqueue(number, job.priority());
        tracing::debug!(job_number = number, priority = job.priority(), "job queued");
        store.notify(LoopMessage::Launch)
    }

    /// Queue the job identified by `jobid`.
    pub fn run_job_by_id(&self, jobid: &str) -> Result<()> {
        let job = self
            .get_job_by_id(jobid)
            .ok_or_else(|| JobError::NotFound(jobid.to_string()))?;
        self.run_job(&job)
    }

    /// Cancel `job`.
    ///
    /// A RUNNING job of a non-cancellable type is refused. A job no worker
    /// owns is terminated right away; otherwise the worker is asked to stop
    /// and this call blocks until the job finishes. It must not be called
    /// from the event loop thread.
    pub fn terminate_job(&self, job: &Arc<Job>) -> Result<()> {
        let number = job.number();
        let info = self.registry.get(job.job_type())?;
        let on_event_loop = self.on_event_loop_thread();
        let token = {
            let mut store = self.lock_store();
            match job.state() {
                state if state.is_finished() => return Err(JobError::AlreadyFinished(number)),
                JobState::Running if !info.is_cancellable() => {
                    tracing::warn!(
                        job_number = number,
                        job_type = %job.job_type(),
                        "refusing to terminate non-cancellable running job"
                    );
                    return Err(JobError::NotCancellable {
                        number,
                        job_type: job.job_type().to_string(),
                    });
                }
                _ => {}
            }
            // No worker owns the job: queued, never run, or resumed from storage.
            let Some(token) = store.running.get(&number).cloned() else {
                store.remove_pending(number);
                job.finish_terminated()?;
                tracing::info!(job_number = number, "job terminated without a worker");
                return Ok(());
            };
            if on_event_loop {
                return Err(JobError::Failed(format!(
                    "cannot wait for job {number} on the event loop thread"
                )));
            }
            token
        };

        token.cancel();
        match job.wait_finished(None) {
            Some(JobState::Terminated) => {
                tracing::info!(job_number = number, "running job terminated");
                Ok(())
            }
            Some(state) => Err(JobError::TerminationFailed { number, state }),
            None => Err(JobError::Failed(format!("job {number} did not finish"))),
        }
    }

    /// Remove a finished job, its file and calendar events, then announce it.
    pub fn delete_job(&self, job: &Arc<Job>) -> Result<()> {
        let number = job.number();
        let info = self.registry.get(job.job_type())?;
        let snapshot = {
            let mut store = self.lock_store();
            if !store.jobs.contains_key(&number) {
                return Err(JobError::NotFound(job.jobid().to_string()));
            }
            if !job.is_finished() {
                return Err(JobError::NotFinished(number));
            }
            job.detach();
            store.calendar.cancel_job(number);
            if info.is_persistent()
                && let Err(error) = self.storage.remove(job.job_type(), number)
            {
                tracing::warn!(
                    job_number = number,
                    error = %format!("{error:#}"),
                    "failed to remove persisted job file"
                );
            }
            let snapshot = job.snapshot();
            store.remove_pending(number);
            let freed_slot = store.running.remove(&number).is_some();
            store.jobs.remove(&number);
            if freed_slot {
                let _ = store.notify(LoopMessage::Launch);
            }
            snapshot
        };
        tracing::info!(job_number = number, jobid = %snapshot.jobid, "job deleted");
        self.send_job_indication(
            IndicationKind::Deletion,
            &snapshot,
            None,
            filter_ids::DELETED,
            PerceivedSeverity::Information,
        );
        Ok(())
    }

    /// Block until `job` finishes or `timeout` elapses.
    pub fn wait_for_job(&self, job: &Job, timeout: Option<Duration>) -> Option<JobState> {
        job.wait_finished(timeout)
    }

    /// Job whose InstanceID is `jobid`.
    pub fn get_job_by_id(&self, jobid: &str) -> Option<Arc<Job>> {
        self.lock_store()
            .jobs
            .values()
            .find(|job| job.jobid() == jobid)
            .cloned()
    }

    /// Job numbered `number`.
    pub fn get_job_by_number(&self, number: u64) -> Option<Arc<Job>> {
        self.lock_store().jobs.get(&number).cloned()
    }

    /// First job named `name`.
    pub fn get_job_by_name(&self, name: &str) -> Option<Arc<Job>> {
        self.lock_store()
            .jobs
            .values()
            .find(|job| job.name() == name)
            .cloned()
    }

    /// Resolve an object path `Class.InstanceID="<ORGID>:<ClassName>:<Number>"`.
    pub fn get_job_matching_op(&self, path: &ObjectPath) -> Result<Arc<Job>> {
        let id = path.key(INSTANCE_ID).ok_or_else(|| {
            JobError::InvalidParameter(format!("missing {INSTANCE_ID} key in {path}"))
        })?;
        let (org_id, class_name, number) = parse_instance_id(id)?;
        if !org_id.eq_ignore_ascii_case(&self.config.org_id) {
            return Err(JobError::NotFound(id.to_string()));
        }
        if !path.class_name.is_empty() && !class_name.eq_ignore_ascii_case(&path.class_name) {
            return Err(JobError::InvalidParameter(format!(
                "InstanceID {id} does not belong to class {}",
                path.class_name
            )));
        }
        let job = self
            .get_job_by_number(number)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let info = self.registry.get(job.job_type())?;
        if !info.class_name().eq_ignore_ascii_case(class_name) {
            return Err(JobError::NotFound(id.to_string()));
        }
        Ok(job)
    }

    /// Outward instance of `job`.
    pub fn job_instance(&self, job: &Job) -> Result<Instance> {
        let info = self.registry.get(job.job_type())?;
        info.handler()
            .convert(&job.snapshot(), &self.convert_context(&info))
    }

    /// Method parameters of `job`, with `ReturnValue` once it finished.
    pub fn job_parameters(&self, job: &Job) -> Result<Instance> {
        let info = self.registry.get(job.job_type())?;
        let snapshot = job.snapshot();
        let mut instance = info
            .handler()
            .job_parameters(&snapshot, &self.convert_context(&info))?;
        if let Some(result) = &snapshot.result
            && let Some(value) = info.return_value_kind().coerce(result)
        {
            instance.set("__ReturnValue", value);
        }
        Ok(instance)
    }

    /// InstanceIDs of all jobs, by number.
    pub fn get_job_ids(&self) -> Vec<String> {
        self.lock_store()
            .jobs
            .values()
            .map(|job| job.jobid().to_string())
            .collect()
    }

    /// InstanceIDs of pending jobs, in launch order.
    pub fn get_pending_job_ids(&self) -> Vec<String> {
        self.ids_of(|store| store.pending_numbers())
    }

    /// InstanceIDs of running jobs.
    pub fn get_running_job_ids(&self) -> Vec<String> {
        self.ids_of(|store| store.running_numbers())
    }

    /// Numbers of all jobs.
    pub fn get_job_numbers(&self) -> Vec<u64> {
        self.lock_store().jobs.keys().copied().collect()
    }

    /// Numbers of pending jobs, in launch order.
    pub fn get_pending_job_numbers(&self) -> Vec<u64> {
        self.lock_store().pending_numbers()
    }

    /// Numbers of running jobs.
    pub fn get_running_job_numbers(&self) -> Vec<u64> {
        self.lock_store().running_numbers()
    }

    /// Number of known jobs.
    pub fn job_count(&self) -> usize {
        self.lock_store().jobs.len()
    }

    fn ids_of(&self, numbers: impl FnOnce(&JobStore) -> Vec<u64>) -> Vec<String> {
        let store = self.lock_store();
        numbers(&store)
            .into_iter()
            .filter_map(|number| store.jobs.get(&number))
            .map(|job| job.jobid().to_string())
            .collect()
    }

    /// Schedule removal of a finished job that wants it; cancel otherwise.
    fn update_deletion(store: &mut JobStore, snapshot: &JobSnapshot) {
        if !snapshot.is_finished() {
            return;
        }
        // Recomputed from scratch: the removal delay may have grown.
        store.calendar.cancel(snapshot.number, CalendarAction::DeleteJob);
        if snapshot.delete_on_completion {
            let now_ms = epoch_millis();
            let elapsed_ms = now_ms
                .saturating_sub(snapshot.time_of_last_state_change.timestamp_millis())
                .max(0);
            let remaining = snapshot
                .time_before_removal
                .saturating_sub(Duration::from_millis(elapsed_ms.unsigned_abs()));
            store.calendar.schedule(
                now_ms,
                remaining,
                snapshot.number,
                CalendarAction::DeleteJob,
            );
        }
    }

    fn send_job_indication(
        &self,
        kind: IndicationKind,
        snapshot: &JobSnapshot,
        previous: Option<&JobSnapshot>,
        filter_id: &str,
        severity: PerceivedSeverity,
    ) {
        let Ok(info) = self.registry.get(&snapshot.job_type) else {
            return;
        };
        if !self.sender.is_subscribed(info.class_name(), filter_id) {
            return;
        }
        let ctx = self.convert_context(&info);
        let convert = |snapshot: &JobSnapshot| {
            info.handler().convert(snapshot, &ctx).map_err(|error| {
                tracing::error!(
                    job_number = snapshot.number,
                    filter_id,
                    %error,
                    "failed to convert job for indication"
                );
            })
        };
        let Ok(source) = convert(snapshot) else {
            return;
        };
        let previous = match previous.map(convert).transpose() {
            Ok(previous) => previous,
            Err(()) => return,
        };
        if let Err(error) = self
            .sender
            .send(kind, &source, previous.as_ref(), filter_id, severity)
        {
            tracing::warn!(
                job_number = snapshot.number,
                jobid = %snapshot.jobid,
                class_name = %info.class_name(),
                filter_id,
                %error,
                "job indication not delivered"
            );
        }
    }

    fn on_event_loop_thread(&self) -> bool {
        let current = std::thread::current().id();
        self.lock_runtime()
            .event_loop
            .as_ref()
            .is_some_and(|handle| handle.thread_id() == current)
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("profile", &self.config.profile_name)
            .field("jobs", &self.job_count())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Registration of one provider with a [`JobManager`]; detaches on drop.
pub struct ProviderHandle {
    manager: Arc<JobManager>,
    class_name: String,
}

impl ProviderHandle {
    /// Manager this provider is attached to.
    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    /// Class the provider instruments.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }
}

impl Drop for ProviderHandle {
    fn drop(&mut self) {
        self.manager.detach(&self.class_name);
    }
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("class_name", &self.class_name)
            .finish_non_exhaustive()
    }
}
