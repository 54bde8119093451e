//! Indication model: the envelope handed to the broker for delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::instance::Instance;

/// Property names carried by every lifecycle indication.
pub mod properties {
    /// Embedded instance the indication is about.
    pub const SOURCE_INSTANCE: &str = "SourceInstance";
    /// Host name of the system hosting the source instance.
    pub const SOURCE_INSTANCE_HOST: &str = "SourceInstanceHost";
    /// Object path of the source instance.
    pub const SOURCE_INSTANCE_MODEL_PATH: &str = "SourceInstanceModelPath";
    /// Name of the static filter the indication matched.
    pub const INDICATION_FILTER_NAME: &str = "IndicationFilterName";
    /// Severity as seen by the management client.
    pub const PERCEIVED_SEVERITY: &str = "PerceivedSeverity";
    /// Pre-change copy of the source instance (modifications only).
    pub const PREVIOUS_INSTANCE: &str = "PreviousInstance";
    /// Unique indication identifier.
    pub const INDICATION_IDENTIFIER: &str = "IndicationIdentifier";
    /// Creation time of the indication.
    pub const INDICATION_TIME: &str = "IndicationTime";
}

/// Kind of lifecycle indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndicationKind {
    /// Instance was created.
    Creation,
    /// Instance properties changed.
    Modification,
    /// Instance was removed.
    Deletion,
    /// Free-form alert carrying a source instance.
    Alert,
}

impl IndicationKind {
    /// Class name suffix appended to the sender's name prefix.
    #[must_use]
    pub fn class_suffix(self) -> &'static str {
        match self {
            Self::Creation => "InstCreation",
            Self::Modification => "InstModification",
            Self::Deletion => "InstDeletion",
            Self::Alert => "AlertIndication",
        }
    }

    /// Full indication class name for a provider prefix, e.g. `LMI_SoftwareInstCreation`.
    #[must_use]
    pub fn class_name(self, name_prefix: &str) -> String {
        format!("{name_prefix}{}", self.class_suffix())
    }
}

/// CIM `PerceivedSeverity` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PerceivedSeverity {
    /// Unknown.
    Unknown,
    /// Other.
    Other,
    /// Informational only.
    #[default]
    Information,
    /// Degraded/Warning.
    Degraded,
    /// Minor.
    Minor,
    /// Major.
    Major,
    /// Critical.
    Critical,
    /// Fatal/NonRecoverable.
    Fatal,
}

impl PerceivedSeverity {
    /// Numeric CIM value.
    #[must_use]
    pub fn cim_value(self) -> u16 {
        match self {
            Self::Unknown => 0,
            Self::Other => 1,
            Self::Information => 2,
            Self::Degraded => 3,
            Self::Minor => 4,
            Self::Major => 5,
            Self::Critical => 6,
            Self::Fatal => 7,
        }
    }
}

/// An indication ready for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Indication {
    /// Unique identifier, mirrored in `IndicationIdentifier`.
    pub id: String,
    /// Indication class name.
    pub class_name: String,
    /// Lifecycle kind.
    pub kind: IndicationKind,
    /// Static filter id this indication is sent for.
    pub filter_name: String,
    /// Creation timestamp.
    pub time: DateTime<Utc>,
    /// Indication properties.
    pub properties: Map<String, Value>,
}

impl Indication {
    /// Wrap `source` into an indication of `kind`.
    ///
    /// `previous` is only recorded for modifications.
    #[must_use]
    pub fn wrap(
        kind: IndicationKind,
        class_name: String,
        filter_name: &str,
        host_name: &str,
        severity: PerceivedSeverity,
        source: &Instance,
        previous: Option<&Instance>,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let time = Utc::now();
        let mut props = Map::new();
        props.insert(properties::SOURCE_INSTANCE.into(), source.to_value());
        props.insert(properties::SOURCE_INSTANCE_HOST.into(), host_name.into());
        props.insert(
            properties::SOURCE_INSTANCE_MODEL_PATH.into(),
            source.object_path().to_string().into(),
        );
        props.insert(properties::INDICATION_FILTER_NAME.into(), filter_name.into());
        props.insert(
            properties::PERCEIVED_SEVERITY.into(),
            severity.cim_value().into(),
        );
        props.insert(properties::INDICATION_IDENTIFIER.into(), id.clone().into());
        props.insert(properties::INDICATION_TIME.into(), time.to_rfc3339().into());
        if kind == IndicationKind::Modification
            && let Some(previous) = previous
        {
            props.insert(properties::PREVIOUS_INSTANCE.into(), previous.to_value());
        }

        Self {
            id,
            class_name,
            kind,
            filter_name: filter_name.to_string(),
            time,
            properties: props,
        }
    }

    /// Decode the embedded source instance.
    #[must_use]
    pub fn source_instance(&self) -> Option<Instance> {
        self.properties
            .get(properties::SOURCE_INSTANCE)
            .and_then(Instance::from_value)
    }

    /// Decode the embedded previous instance, if any.
    #[must_use]
    pub fn previous_instance(&self) -> Option<Instance> {
        self.properties
            .get(properties::PREVIOUS_INSTANCE)
            .and_then(Instance::from_value)
    }
}

impl std::fmt::Display for Indication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let path = self
            .properties
            .get(properties::SOURCE_INSTANCE_MODEL_PATH)
            .and_then(Value::as_str)
            .unwrap_or("?");
        write!(
            f,
            "[{}] {} ({}): {}",
            self.time.format("%H:%M:%S"),
            self.class_name,
            self.filter_name,
            path
        )
    }
}
