//! Shared types and helpers for the job manager.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::RuntimeSettings;
use crate::job::{JobProperty, JobSnapshot, JobState};

/// Messages processed, in arrival order, by the event loop thread.
#[derive(Debug)]
pub(crate) enum LoopMessage {
    /// A job property changed.
    Modified {
        number: u64,
        before: Box<JobSnapshot>,
        after: Box<JobSnapshot>,
        property: JobProperty,
    },
    /// A job reached a terminal state.
    Finished { number: u64, state: JobState },
    /// Pending queue changed; try to start jobs.
    Launch,
    /// A worker returned from the process callback.
    WorkerFinished { number: u64, panicked: bool },
    /// Stop the loop.
    Shutdown,
}

/// Per-job handle into the event loop mailbox.
pub(crate) type SignalHook = mpsc::UnboundedSender<LoopMessage>;

/// Job manager configuration for one profile.
#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    /// Profile name, e.g. `Software`.
    pub profile_name: String,
    /// Root directory for persisted jobs; `<root>/<profile lowercased>/`.
    pub storage_root: PathBuf,
    /// Allow more than one job in the running set.
    pub concurrent_processing: bool,
    /// Organization id used in InstanceIDs.
    pub org_id: String,
    /// Namespace of job instances and indications.
    pub namespace: String,
    /// Reported as `SourceInstanceHost`.
    pub host_name: String,
    /// Indication class prefix, e.g. `LMI_Software`.
    pub indication_prefix: String,
    /// Default `time_before_removal` for new jobs.
    pub default_time_before_removal: Duration,
}

pub(crate) const DEFAULT_STORAGE_ROOT: &str = "/var/lib/openlmi-providers/jobs";
pub(crate) const DEFAULT_ORG_ID: &str = "LMI";
pub(crate) const DEFAULT_NAMESPACE: &str = "root/cimv2";
const DEFAULT_TIME_BEFORE_REMOVAL_SECS: u64 = 300;

impl JobManagerConfig {
    /// Defaults for `profile_name`.
    pub fn new(profile_name: impl Into<String>) -> Self {
        let profile_name = profile_name.into();
        Self {
            indication_prefix: format!("{DEFAULT_ORG_ID}_{profile_name}"),
            profile_name,
            storage_root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            concurrent_processing: false,
            org_id: DEFAULT_ORG_ID.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            host_name: default_host_name(),
            default_time_before_removal: Duration::from_secs(DEFAULT_TIME_BEFORE_REMOVAL_SECS),
        }
    }

    /// Build from merged runtime settings; profile entries win over globals.
    pub fn from_settings(profile_name: impl Into<String>, settings: &RuntimeSettings) -> Self {
        let mut config = Self::new(profile_name);
        let jobs = &settings.jobs;
        let profile = settings.profile(&config.profile_name);

        if let Some(root) = normalized(jobs.storage_root.as_deref()) {
            config.storage_root = PathBuf::from(root);
        }
        if let Some(org_id) = normalized(jobs.org_id.as_deref()) {
            config.org_id = org_id;
            config.indication_prefix = format!("{}_{}", config.org_id, config.profile_name);
        }
        if let Some(secs) = jobs.default_time_before_removal_secs {
            config.default_time_before_removal = Duration::from_secs(secs);
        }
        config.concurrent_processing = profile
            .and_then(|p| p.concurrent_processing)
            .or(jobs.concurrent_processing)
            .unwrap_or(false);
        if let Some(prefix) = normalized(profile.and_then(|p| p.indication_prefix.as_deref())) {
            config.indication_prefix = prefix;
        }
        if let Some(namespace) = normalized(settings.indications.namespace.as_deref()) {
            config.namespace = namespace;
        }
        if let Some(host) = normalized(settings.indications.host_name.as_deref()) {
            config.host_name = host;
        }
        config
    }

    /// `<storage_root>/<profile lowercased>`.
    #[must_use]
    pub fn storage_dir(&self) -> PathBuf {
        self.storage_root.join(self.profile_name.to_lowercase())
    }
}

fn normalized(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn default_host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .and_then(|v| normalized(Some(&v)))
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .and_then(|v| normalized(Some(&v)))
        })
        .unwrap_or_else(|| "localhost".to_string())
}

pub(crate) fn epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
