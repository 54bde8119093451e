//! Runtime settings loader for lmi-jobs.
//!
//! Loads and merges:
//! - System defaults: `<PRJ_ROOT>/packages/conf/lmi-jobs.yaml`
//! - User overrides:  `<config home>/openlmi/lmi-jobs.yaml`, where the config
//!   home is the caller's choice, else `PRJ_CONFIG_HOME`, else `.config`
//!
//! Merge precedence is user over system. Relative locations resolve against
//! `PRJ_ROOT`, falling back to the working directory.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Deserialize;

const SYSTEM_SETTINGS: &str = "packages/conf/lmi-jobs.yaml";
const USER_SETTINGS: &str = "openlmi/lmi-jobs.yaml";
const CONFIG_HOME: &str = ".config";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeSettings {
    #[serde(default)]
    pub jobs: JobSettings,
    #[serde(default)]
    pub indications: IndicationSettings,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobSettings {
    pub storage_root: Option<String>,
    pub concurrent_processing: Option<bool>,
    pub org_id: Option<String>,
    pub default_time_before_removal_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IndicationSettings {
    pub host_name: Option<String>,
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileSettings {
    pub indication_prefix: Option<String>,
    pub concurrent_processing: Option<bool>,
}

impl RuntimeSettings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            jobs: self.jobs.merge(overlay.jobs),
            indications: self.indications.merge(overlay.indications),
            profiles: merge_profiles(self.profiles, overlay.profiles),
        }
    }

    /// Per-profile section; profile names match case-insensitively.
    #[must_use]
    pub fn profile(&self, name: &str) -> Option<&ProfileSettings> {
        self.profiles
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, profile)| profile)
    }
}

impl JobSettings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            storage_root: overlay.storage_root.or(self.storage_root),
            concurrent_processing: overlay
                .concurrent_processing
                .or(self.concurrent_processing),
            org_id: overlay.org_id.or(self.org_id),
            default_time_before_removal_secs: overlay
                .default_time_before_removal_secs
                .or(self.default_time_before_removal_secs),
        }
    }
}

impl IndicationSettings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            host_name: overlay.host_name.or(self.host_name),
            namespace: overlay.namespace.or(self.namespace),
        }
    }
}

impl ProfileSettings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            indication_prefix: overlay.indication_prefix.or(self.indication_prefix),
            concurrent_processing: overlay
                .concurrent_processing
                .or(self.concurrent_processing),
        }
    }
}

fn merge_profiles(
    mut base: HashMap<String, ProfileSettings>,
    overlay: HashMap<String, ProfileSettings>,
) -> HashMap<String, ProfileSettings> {
    for (name, override_profile) in overlay {
        base.entry(name)
            .and_modify(|existing| *existing = existing.clone().merge(override_profile.clone()))
            .or_insert(override_profile);
    }
    base
}

/// Load merged runtime settings; `conf_home` replaces `PRJ_CONFIG_HOME`.
pub fn load_runtime_settings(conf_home: Option<&Path>) -> RuntimeSettings {
    let (system, user) = runtime_settings_paths(conf_home);
    load_runtime_settings_from_paths(&system, &user)
}

/// System and user settings files, in merge order.
#[doc(hidden)]
pub fn runtime_settings_paths(conf_home: Option<&Path>) -> (PathBuf, PathBuf) {
    let root = env_path("PRJ_ROOT")
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_default();
    let conf_home = conf_home
        .map(Path::to_path_buf)
        .or_else(|| env_path("PRJ_CONFIG_HOME"))
        .unwrap_or_else(|| PathBuf::from(CONFIG_HOME));
    // An absolute config home replaces the root when joined.
    (root.join(SYSTEM_SETTINGS), root.join(conf_home).join(USER_SETTINGS))
}

#[doc(hidden)]
pub fn load_runtime_settings_from_paths(system: &Path, user: &Path) -> RuntimeSettings {
    let base = read_settings(system).unwrap_or_default();
    base.merge(read_settings(user).unwrap_or_default())
}

fn env_path(name: &str) -> Option<PathBuf> {
    let value = std::env::var(name).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| PathBuf::from(value))
}

/// `None` for absent, unreadable or malformed files; the latter two are logged.
fn read_settings(path: &Path) -> Option<RuntimeSettings> {
    let raw = std::fs::read_to_string(path)
        .inspect_err(|error| {
            if error.kind() != ErrorKind::NotFound {
                tracing::warn!(
                    path = %path.display(),
                    %error,
                    "settings file unreadable; ignoring"
                );
            }
        })
        .ok()?;
    serde_yaml::from_str(&raw)
        .inspect_err(|error| {
            tracing::warn!(path = %path.display(), %error, "settings file malformed; ignoring");
        })
        .ok()
}
