#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lmi_indications::test_support::RecordingBroker;
use lmi_indications::{CimStatus, ObjectPath, properties};
use lmi_jobs::content::{filter_ids, standard_filters};
use lmi_jobs::test_support::{MODE_PARAM, ScriptedHandler, wait_until};
use lmi_jobs::{
    JobError, JobManager, JobManagerConfig, JobState, JobTypeInfo, ProviderHandle,
    ReturnValueKind,
};

const JOB_TYPE: &str = "TestJob";
const JOB_CLASS: &str = "LMI_TestJob";
const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

struct Fixture {
    manager: Arc<JobManager>,
    handler: Arc<ScriptedHandler>,
    broker: Arc<RecordingBroker>,
    _provider: ProviderHandle,
}

fn config(root: &Path, concurrent: bool) -> JobManagerConfig {
    let mut config = JobManagerConfig::new("Test");
    config.storage_root = root.to_path_buf();
    config.concurrent_processing = concurrent;
    config.host_name = "testhost".to_string();
    config
}

fn start(root: &Path, concurrent: bool, cancellable: bool) -> Fixture {
    let manager = JobManager::new(config(root, concurrent));
    let handler = ScriptedHandler::new();
    manager
        .register_job_type(
            JobTypeInfo::new(JOB_TYPE, JOB_CLASS, handler.clone())
                .cancellable(cancellable)
                .return_value(ReturnValueKind::Uint32),
        )
        .expect("register job type");
    let broker = Arc::new(RecordingBroker::new());
    let provider = manager
        .attach(JOB_CLASS, broker.clone())
        .expect("attach provider");
    Fixture {
        manager,
        handler,
        broker,
        _provider: provider,
    }
}

#[test]
fn lower_priority_value_launches_first() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), false, false);

    let blocker = fx.manager.new_job(JOB_TYPE).expect("blocker");
    blocker.set_in_param(MODE_PARAM, "block");
    fx.manager.run_job(&blocker).expect("run blocker");
    assert!(wait_until(|| blocker.state() == JobState::Running));

    let first = fx.manager.new_job(JOB_TYPE).expect("first");
    first.set_priority(10);
    let second = fx.manager.new_job(JOB_TYPE).expect("second");
    second.set_priority(5);
    fx.manager.run_job(&first).expect("run first");
    fx.manager.run_job(&second).expect("run second");
    assert_eq!(
        fx.manager.get_pending_job_numbers(),
        vec![second.number(), first.number()]
    );

    fx.handler.gate.open();
    assert_eq!(fx.manager.wait_for_job(&first, TIMEOUT), Some(JobState::Completed));
    assert_eq!(
        fx.handler.started(),
        vec![blocker.number(), second.number(), first.number()]
    );
}

#[test]
fn priority_change_requeues_pending_job() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), false, false);

    let blocker = fx.manager.new_job(JOB_TYPE).expect("blocker");
    blocker.set_in_param(MODE_PARAM, "block");
    fx.manager.run_job(&blocker).expect("run blocker");
    assert!(wait_until(|| blocker.state() == JobState::Running));

    let a = fx.manager.new_job(JOB_TYPE).expect("a");
    let b = fx.manager.new_job(JOB_TYPE).expect("b");
    fx.manager.run_job(&a).expect("run a");
    fx.manager.run_job(&b).expect("run b");
    b.set_priority(0);
    a.set_priority(3);
    assert!(wait_until(|| {
        fx.manager.get_pending_job_numbers() == vec![b.number(), a.number()]
    }));

    fx.handler.gate.open();
    assert_eq!(fx.manager.wait_for_job(&a, TIMEOUT), Some(JobState::Completed));
    assert_eq!(fx.handler.started()[1..], [b.number(), a.number()]);
}

#[test]
fn non_concurrent_policy_runs_one_job_at_a_time() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), false, false);

    let jobs: Vec<_> = (0..4)
        .map(|_| {
            let job = fx.manager.new_job(JOB_TYPE).expect("job");
            job.set_in_param(MODE_PARAM, "sleep");
            fx.manager.run_job(&job).expect("run");
            job
        })
        .collect();
    for job in &jobs {
        assert_eq!(fx.manager.wait_for_job(job, TIMEOUT), Some(JobState::Completed));
    }
    assert_eq!(fx.handler.max_running(), 1);
}

#[test]
fn concurrent_policy_runs_jobs_side_by_side() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), true, false);

    let a = fx.manager.new_job(JOB_TYPE).expect("a");
    let b = fx.manager.new_job(JOB_TYPE).expect("b");
    for job in [&a, &b] {
        job.set_in_param(MODE_PARAM, "block");
        fx.manager.run_job(job).expect("run");
    }
    assert!(wait_until(|| fx.manager.get_running_job_numbers().len() == 2));
    assert_eq!(fx.manager.get_running_job_ids().len(), 2);

    fx.handler.gate.open();
    assert_eq!(fx.manager.wait_for_job(&b, TIMEOUT), Some(JobState::Completed));
    assert_eq!(fx.handler.max_running(), 2);
}

#[test]
fn completed_job_with_zero_delay_is_deleted() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), false, false);

    let job = fx.manager.new_job(JOB_TYPE).expect("job");
    job.set_delete_on_completion(true);
    job.set_time_before_removal(Duration::ZERO);
    fx.manager.run_job(&job).expect("run");

    assert_eq!(fx.manager.wait_for_job(&job, TIMEOUT), Some(JobState::Completed));
    assert!(wait_until(|| fx.manager.get_job_ids().is_empty()));
    assert!(fx.manager.get_job_by_id(job.jobid()).is_none());
}

#[test]
fn clearing_delete_on_completion_keeps_job() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), false, false);

    let job = fx.manager.new_job(JOB_TYPE).expect("job");
    job.set_delete_on_completion(true);
    job.set_time_before_removal(Duration::from_millis(300));
    fx.manager.run_job(&job).expect("run");
    assert_eq!(fx.manager.wait_for_job(&job, TIMEOUT), Some(JobState::Completed));
    job.set_delete_on_completion(false);

    std::thread::sleep(Duration::from_millis(600));
    assert_eq!(fx.manager.job_count(), 1);
}

#[test]
fn requesting_deletion_after_finish_removes_job() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), false, false);

    let job = fx.manager.new_job(JOB_TYPE).expect("job");
    job.set_time_before_removal(Duration::ZERO);
    fx.manager.run_job(&job).expect("run");
    assert_eq!(fx.manager.wait_for_job(&job, TIMEOUT), Some(JobState::Completed));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(fx.manager.job_count(), 1);

    job.set_delete_on_completion(true);
    assert!(wait_until(|| fx.manager.job_count() == 0));
}

#[test]
fn shortening_removal_delay_after_finish_deletes_job() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), false, false);

    let job = fx.manager.new_job(JOB_TYPE).expect("job");
    job.set_delete_on_completion(true);
    job.set_time_before_removal(Duration::from_secs(600));
    fx.manager.run_job(&job).expect("run");
    assert_eq!(fx.manager.wait_for_job(&job, TIMEOUT), Some(JobState::Completed));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(fx.manager.job_count(), 1);

    job.set_time_before_removal(Duration::ZERO);
    assert!(wait_until(|| fx.manager.job_count() == 0));
}

#[test]
fn extending_removal_delay_after_finish_postpones_deletion() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), false, false);

    let job = fx.manager.new_job(JOB_TYPE).expect("job");
    job.set_delete_on_completion(true);
    job.set_time_before_removal(Duration::from_millis(400));
    fx.manager.run_job(&job).expect("run");
    assert_eq!(fx.manager.wait_for_job(&job, TIMEOUT), Some(JobState::Completed));
    job.set_time_before_removal(Duration::from_secs(600));

    std::thread::sleep(Duration::from_millis(800));
    assert_eq!(fx.manager.job_count(), 1);
}

#[test]
fn delete_requires_finished_job() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), false, false);

    let job = fx.manager.new_job(JOB_TYPE).expect("job");
    let error = fx.manager.delete_job(&job).expect_err("not finished");
    assert!(matches!(error, JobError::NotFinished(n) if n == job.number()));
    assert_eq!(fx.manager.get_job_ids(), vec![job.jobid().to_string()]);
    assert_eq!(job.state(), JobState::New);
}

#[test]
fn running_a_queued_job_twice_fails() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), false, false);

    let job = fx.manager.new_job(JOB_TYPE).expect("job");
    job.set_in_param(MODE_PARAM, "block");
    fx.manager.run_job(&job).expect("run");
    let error = fx.manager.run_job(&job).expect_err("double run");
    assert!(matches!(error, JobError::AlreadyQueued(_)));
    assert_eq!(error.status(), CimStatus::Failed);

    fx.handler.gate.open();
    assert_eq!(fx.manager.wait_for_job(&job, TIMEOUT), Some(JobState::Completed));
    assert!(matches!(
        fx.manager.run_job(&job),
        Err(JobError::AlreadyQueued(_) | JobError::AlreadyFinished(_))
    ));
}

#[test]
fn terminating_non_cancellable_running_job_is_not_supported() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), false, false);

    let job = fx.manager.new_job(JOB_TYPE).expect("job");
    job.set_in_param(MODE_PARAM, "block");
    fx.manager.run_job(&job).expect("run");
    assert!(wait_until(|| job.state() == JobState::Running));

    let error = fx.manager.terminate_job(&job).expect_err("not cancellable");
    assert_eq!(error.status(), CimStatus::NotSupported);
    assert_eq!(job.state(), JobState::Running);

    fx.handler.gate.open();
    assert_eq!(fx.manager.wait_for_job(&job, TIMEOUT), Some(JobState::Completed));
}

#[test]
fn terminating_cancellable_running_job_waits_for_termination() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), false, true);

    let job = fx.manager.new_job(JOB_TYPE).expect("job");
    job.set_in_param(MODE_PARAM, "block");
    fx.manager.run_job(&job).expect("run");
    assert!(wait_until(|| job.state() == JobState::Running));

    fx.manager.terminate_job(&job).expect("terminate");
    assert_eq!(job.state(), JobState::Terminated);
    assert!(job.snapshot().error.is_some());
    assert!(matches!(
        fx.manager.terminate_job(&job),
        Err(JobError::AlreadyFinished(_))
    ));
}

#[test]
fn terminating_pending_job_finishes_it_immediately() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), false, false);

    let blocker = fx.manager.new_job(JOB_TYPE).expect("blocker");
    blocker.set_in_param(MODE_PARAM, "block");
    fx.manager.run_job(&blocker).expect("run blocker");
    assert!(wait_until(|| blocker.state() == JobState::Running));

    let pending = fx.manager.new_job(JOB_TYPE).expect("pending");
    fx.manager.run_job(&pending).expect("run pending");
    fx.manager.terminate_job(&pending).expect("terminate pending");
    assert_eq!(pending.state(), JobState::Terminated);
    assert!(fx.manager.get_pending_job_ids().is_empty());

    fx.handler.gate.open();
    assert_eq!(fx.manager.wait_for_job(&blocker, TIMEOUT), Some(JobState::Completed));
    assert!(!fx.handler.started().contains(&pending.number()));
    fx.manager.delete_job(&pending).expect("delete terminated job");
}

#[test]
fn terminating_queued_job_of_non_cancellable_type_succeeds() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), false, false);

    let blocker = fx.manager.new_job(JOB_TYPE).expect("blocker");
    blocker.set_in_param(MODE_PARAM, "block");
    fx.manager.run_job(&blocker).expect("run blocker");
    assert!(wait_until(|| blocker.state() == JobState::Running));

    let idle = fx.manager.new_job(JOB_TYPE).expect("idle");
    fx.manager.terminate_job(&idle).expect("terminate new job");
    assert_eq!(idle.state(), JobState::Terminated);

    fx.handler.gate.open();
    assert_eq!(fx.manager.wait_for_job(&blocker, TIMEOUT), Some(JobState::Completed));
    assert_eq!(fx.handler.started(), vec![blocker.number()]);
}

#[test]
fn job_returning_unfinished_is_forced_into_exception() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), false, false);

    let job = fx.manager.new_job(JOB_TYPE).expect("job");
    job.set_in_param(MODE_PARAM, "forget");
    fx.manager.run_job(&job).expect("run");

    assert_eq!(fx.manager.wait_for_job(&job, TIMEOUT), Some(JobState::Exception));
    let error = job.snapshot().error.expect("error recorded");
    assert!(error.message.contains("without finishing"));
}

#[test]
fn lifecycle_indications_follow_subscriptions() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), false, false);
    let sender = fx.manager.indication_sender();
    let prefix = &fx.manager.config().indication_prefix;
    for filter in standard_filters(JOB_CLASS, prefix) {
        if filter.id != filter_ids::FAILED {
            sender
                .activate_filter(&filter.query, JOB_CLASS)
                .expect("activate");
        }
    }
    sender.enable_indications();

    let job = fx.manager.new_job(JOB_TYPE).expect("job");
    fx.manager.run_job(&job).expect("run");
    assert_eq!(fx.manager.wait_for_job(&job, TIMEOUT), Some(JobState::Completed));
    assert!(wait_until(|| fx
        .broker
        .filter_names()
        .contains(&filter_ids::SUCCEEDED.to_string())));
    fx.manager.delete_job(&job).expect("delete");

    assert_eq!(
        fx.broker.filter_names(),
        vec![
            filter_ids::CREATED,
            filter_ids::CHANGED,
            filter_ids::PERCENT_UPDATED,
            filter_ids::CHANGED,
            filter_ids::SUCCEEDED,
            filter_ids::DELETED,
        ]
    );

    let delivered = fx.broker.delivered();
    let changed = &delivered[3];
    assert_eq!(changed.class_name, format!("{prefix}InstModification"));
    let previous = changed.previous_instance().expect("previous instance");
    assert_eq!(previous.get("JobState"), Some(&serde_json::Value::from(4)));
    let source = changed.source_instance().expect("source instance");
    assert_eq!(source.get("JobState"), Some(&serde_json::Value::from(7)));
    assert_eq!(
        changed.properties.get(properties::SOURCE_INSTANCE_HOST),
        Some(&serde_json::Value::from("testhost"))
    );
    let deleted = delivered.last().expect("deleted");
    assert!(deleted.source_instance().is_some());
}

#[test]
fn failed_job_is_reported_with_major_severity() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), false, false);
    let sender = fx.manager.indication_sender();
    let failed = standard_filters(JOB_CLASS, &fx.manager.config().indication_prefix)
        .into_iter()
        .find(|filter| filter.id == filter_ids::FAILED)
        .expect("failed filter");
    sender.activate_filter(&failed.query, JOB_CLASS).expect("activate");
    sender.enable_indications();

    let job = fx.manager.new_job(JOB_TYPE).expect("job");
    job.set_in_param(MODE_PARAM, "fail");
    fx.manager.run_job(&job).expect("run");
    assert_eq!(fx.manager.wait_for_job(&job, TIMEOUT), Some(JobState::Exception));
    assert!(wait_until(|| !fx.broker.delivered().is_empty()));

    let delivered = fx.broker.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].filter_name, filter_ids::FAILED);
    assert_eq!(
        delivered[0].properties.get(properties::PERCEIVED_SEVERITY),
        Some(&serde_json::Value::from(5))
    );
}

#[test]
fn nothing_is_delivered_while_indications_are_disabled() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), false, false);
    let sender = fx.manager.indication_sender();
    for filter in standard_filters(JOB_CLASS, &fx.manager.config().indication_prefix) {
        sender
            .activate_filter(&filter.query, JOB_CLASS)
            .expect("activate");
    }

    let job = fx.manager.new_job(JOB_TYPE).expect("job");
    fx.manager.run_job(&job).expect("run");
    assert_eq!(fx.manager.wait_for_job(&job, TIMEOUT), Some(JobState::Completed));
    std::thread::sleep(Duration::from_millis(50));
    assert!(fx.broker.delivered().is_empty());
}

#[test]
fn object_paths_resolve_to_jobs() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), false, false);
    let job = fx.manager.new_job(JOB_TYPE).expect("job");
    assert_eq!(job.jobid(), format!("LMI:{JOB_CLASS}:{}", job.number()));

    let path = ObjectPath::new("root/cimv2", JOB_CLASS).with_key("InstanceID", job.jobid());
    let found = fx.manager.get_job_matching_op(&path).expect("resolve");
    assert!(Arc::ptr_eq(&found, &job));

    let parsed: ObjectPath = path.to_string().parse().expect("parse path");
    assert!(fx.manager.get_job_matching_op(&parsed).is_ok());

    let foreign = ObjectPath::new("root/cimv2", JOB_CLASS)
        .with_key("InstanceID", format!("ACME:{JOB_CLASS}:{}", job.number()));
    assert_eq!(
        fx.manager.get_job_matching_op(&foreign).expect_err("org").status(),
        CimStatus::NotFound
    );

    let unknown = ObjectPath::new("root/cimv2", JOB_CLASS)
        .with_key("InstanceID", format!("LMI:{JOB_CLASS}:9999"));
    assert!(matches!(
        fx.manager.get_job_matching_op(&unknown),
        Err(JobError::NotFound(_))
    ));

    let garbage = ObjectPath::new("root/cimv2", JOB_CLASS).with_key("InstanceID", "nonsense");
    assert_eq!(
        fx.manager.get_job_matching_op(&garbage).expect_err("garbage").status(),
        CimStatus::InvalidParameter
    );

    assert!(matches!(
        fx.manager
            .get_job_matching_op(&ObjectPath::new("root/cimv2", JOB_CLASS)),
        Err(JobError::InvalidParameter(_))
    ));
}

#[test]
fn lookups_by_number_name_and_id() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), false, false);
    let job = fx.manager.new_job(JOB_TYPE).expect("job");
    job.set_name("install vim");

    assert!(fx.manager.get_job_by_number(job.number()).is_some());
    assert!(fx.manager.get_job_by_name("install vim").is_some());
    assert!(fx.manager.get_job_by_name("missing").is_none());
    fx.manager.run_job_by_id(job.jobid()).expect("run by id");
    assert_eq!(fx.manager.wait_for_job(&job, TIMEOUT), Some(JobState::Completed));
    assert!(matches!(
        fx.manager.run_job_by_id("LMI:LMI_TestJob:424242"),
        Err(JobError::NotFound(_))
    ));
    assert_eq!(fx.manager.job_count(), 1);
}

#[test]
fn instances_and_parameters_reflect_job() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), false, false);
    let job = fx.manager.new_job(JOB_TYPE).expect("job");
    job.set_in_param("Package", "vim");
    job.set_method_name("InstallFromSoftwareIdentity");
    fx.manager.run_job(&job).expect("run");
    assert_eq!(fx.manager.wait_for_job(&job, TIMEOUT), Some(JobState::Completed));

    let instance = fx.manager.job_instance(&job).expect("instance");
    assert_eq!(instance.class_name, JOB_CLASS);
    assert_eq!(instance.get("PercentComplete"), Some(&serde_json::Value::from(100)));
    assert_eq!(
        instance.get("MethodName"),
        Some(&serde_json::Value::from("InstallFromSoftwareIdentity"))
    );

    let params = fx.manager.job_parameters(&job).expect("parameters");
    assert_eq!(params.get("Package"), Some(&serde_json::Value::from("vim")));
    assert_eq!(params.get("__ReturnValue"), Some(&serde_json::Value::from(0)));
}

#[test]
fn registry_is_frozen_once_a_provider_attached() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), false, false);
    let error = fx
        .manager
        .register_job_type(JobTypeInfo::new("Late", "LMI_LateJob", ScriptedHandler::new()))
        .expect_err("frozen");
    assert!(matches!(error, JobError::RegistryFrozen));
}

#[test]
fn jobs_need_an_attached_provider() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let manager = JobManager::new(config(tmp.path(), false));
    manager
        .register_job_type(JobTypeInfo::new(JOB_TYPE, JOB_CLASS, ScriptedHandler::new()))
        .expect("register");
    assert!(matches!(manager.new_job(JOB_TYPE), Err(JobError::NotRunning)));
    assert!(matches!(
        manager.new_job("Unknown"),
        Err(JobError::UnknownJobType(_))
    ));

    let provider = manager
        .attach(JOB_CLASS, Arc::new(RecordingBroker::new()))
        .expect("attach");
    assert!(manager.is_running());
    assert!(manager.indication_sender().is_initialized());
    drop(provider);
    assert!(!manager.is_running());
    assert!(!manager.indication_sender().is_initialized());
}

#[test]
fn event_loop_survives_until_last_provider_detaches() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let fx = start(tmp.path(), false, false);
    let second = fx
        .manager
        .attach("LMI_OtherJob", Arc::new(RecordingBroker::new()))
        .expect("second attach");
    drop(second);
    assert!(fx.manager.is_running());

    let job = fx.manager.new_job(JOB_TYPE).expect("job");
    fx.manager.run_job(&job).expect("run");
    assert_eq!(fx.manager.wait_for_job(&job, TIMEOUT), Some(JobState::Completed));
}

#[test]
fn non_cancellable_job_keeps_its_worker_across_restart() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let Fixture {
        manager,
        handler,
        _provider: provider,
        ..
    } = start(tmp.path(), false, false);

    let job = manager.new_job(JOB_TYPE).expect("job");
    job.set_in_param(MODE_PARAM, "block");
    manager.run_job(&job).expect("run");
    assert!(wait_until(|| job.state() == JobState::Running));

    drop(provider);
    assert!(!manager.is_running());
    assert_eq!(job.state(), JobState::Running);

    let _provider = manager
        .attach(JOB_CLASS, Arc::new(RecordingBroker::new()))
        .expect("re-attach");
    assert_eq!(manager.get_running_job_numbers(), vec![job.number()]);
    assert!(manager.get_pending_job_numbers().is_empty());
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(handler.started(), vec![job.number()]);

    handler.gate.open();
    assert_eq!(manager.wait_for_job(&job, TIMEOUT), Some(JobState::Completed));
    assert!(wait_until(|| manager.get_running_job_numbers().is_empty()));
    assert_eq!(handler.started(), vec![job.number()]);
    assert_eq!(handler.max_running(), 1);
}
