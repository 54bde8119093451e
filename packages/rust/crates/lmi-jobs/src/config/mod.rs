//! Config namespace: YAML runtime settings.

mod settings;

pub use settings::{
    IndicationSettings, JobSettings, ProfileSettings, RuntimeSettings, load_runtime_settings,
    load_runtime_settings_from_paths, runtime_settings_paths,
};
