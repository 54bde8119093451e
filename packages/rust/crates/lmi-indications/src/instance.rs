//! CIM instances and object paths as exchanged with the broker.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::IndicationError;

/// A CIM instance: class, namespace and a bag of JSON-typed properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Namespace the instance lives in (e.g. `root/cimv2`).
    pub namespace: String,
    /// CIM class name.
    pub class_name: String,
    /// Property values keyed by property name.
    pub properties: Map<String, Value>,
    /// Names of the key properties, in path order.
    pub key_names: Vec<String>,
}

impl Instance {
    /// Create an empty instance of `class_name`.
    pub fn new(namespace: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            class_name: class_name.into(),
            properties: Map::new(),
            key_names: Vec::new(),
        }
    }

    /// Add a key property.
    #[must_use]
    pub fn with_key(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        if !self.key_names.iter().any(|k| k.eq_ignore_ascii_case(&name)) {
            self.key_names.push(name.clone());
        }
        self.properties.insert(name, value.into());
        self
    }

    /// Add a non-key property.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Set a property value, replacing any previous one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(name.into(), value.into());
    }

    /// Look up a property. CIM property names are case-insensitive.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name).or_else(|| {
            self.properties
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        })
    }

    /// Build the object path from the key properties.
    #[must_use]
    pub fn object_path(&self) -> ObjectPath {
        let mut path = ObjectPath::new(&self.namespace, &self.class_name);
        for key in &self.key_names {
            let value = match self.get(key) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            path.keys.insert(key.clone(), value);
        }
        path
    }

    /// Embedded-instance form used inside indication properties.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Inverse of [`Instance::to_value`].
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Reference to a CIM instance: `namespace:Class.Key="value",...`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectPath {
    /// Namespace, may be empty for local paths.
    pub namespace: String,
    /// CIM class name.
    pub class_name: String,
    /// Key property bindings.
    pub keys: BTreeMap<String, String>,
}

impl ObjectPath {
    /// Create a path without keys.
    pub fn new(namespace: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            class_name: class_name.into(),
            keys: BTreeMap::new(),
        }
    }

    /// Add a key binding.
    #[must_use]
    pub fn with_key(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.keys.insert(name.into(), value.into());
        self
    }

    /// Look up a key binding, case-insensitively.
    #[must_use]
    pub fn key(&self, name: &str) -> Option<&str> {
        self.keys
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.namespace.is_empty() {
            write!(f, "{}:", self.namespace)?;
        }
        f.write_str(&self.class_name)?;
        for (i, (name, value)) in self.keys.iter().enumerate() {
            let sep = if i == 0 { '.' } else { ',' };
            let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
            write!(f, "{sep}{name}=\"{escaped}\"")?;
        }
        Ok(())
    }
}

impl FromStr for ObjectPath {
    type Err = IndicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // The namespace ends at the last ':' ahead of the first key binding;
        // host names and key values may carry '.' and ':' of their own.
        let head_end = s.find('=').unwrap_or(s.len());
        let (namespace, rest) = match s[..head_end].rfind(':') {
            Some(idx) => (s[..idx].trim(), &s[idx + 1..]),
            None => ("", s),
        };
        let (class_name, bindings) = match rest.split_once('.') {
            Some((class, bindings)) => (class.trim(), Some(bindings)),
            None => (rest.trim(), None),
        };
        if class_name.is_empty() {
            return Err(IndicationError::InvalidParameter(format!(
                "object path without class name: {s}"
            )));
        }

        let mut path = ObjectPath::new(namespace, class_name);
        if let Some(bindings) = bindings {
            path.keys = parse_key_bindings(bindings)?;
        }
        Ok(path)
    }
}

fn parse_key_bindings(input: &str) -> Result<BTreeMap<String, String>, IndicationError> {
    let mut keys = BTreeMap::new();
    let mut chars = input.chars().peekable();

    loop {
        let name: String = chars.by_ref().take_while(|c| *c != '=').collect();
        let name = name.trim();
        if name.is_empty() {
            return Err(IndicationError::InvalidParameter(format!(
                "malformed key binding in: {input}"
            )));
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    other => value.push(other),
                }
            }
            if !closed {
                return Err(IndicationError::InvalidParameter(format!(
                    "unterminated key value in: {input}"
                )));
            }
            match chars.next() {
                None | Some(',') => {}
                Some(c) => {
                    return Err(IndicationError::InvalidParameter(format!(
                        "unexpected '{c}' after key value in: {input}"
                    )));
                }
            }
        } else {
            value = chars.by_ref().take_while(|c| *c != ',').collect();
            value = value.trim().to_string();
        }

        keys.insert(name.to_string(), value);
        if chars.peek().is_none() {
            break;
        }
    }

    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_path_display_and_parse() {
        let path = ObjectPath::new("root/cimv2", "LMI_SoftwareJob")
            .with_key("InstanceID", "LMI:LMI_SoftwareJob:12");
        let text = path.to_string();
        assert_eq!(
            text,
            "root/cimv2:LMI_SoftwareJob.InstanceID=\"LMI:LMI_SoftwareJob:12\""
        );
        let parsed: ObjectPath = text.parse().unwrap();
        assert_eq!(parsed, path);
    }

    #[test]
    fn test_parse_escaped_and_unquoted_values() {
        let parsed: ObjectPath = r#"CIM_Foo.Name="a \"b\"",Count=3"#.parse().unwrap();
        assert_eq!(parsed.namespace, "");
        assert_eq!(parsed.key("name"), Some("a \"b\""));
        assert_eq!(parsed.key("Count"), Some("3"));
    }

    #[test]
    fn test_parse_host_qualified_namespace() {
        let parsed: ObjectPath = r#"//host.example.com:5989/root/cimv2:LMI_SoftwareJob.InstanceID="LMI:LMI_SoftwareJob:7""#
            .parse()
            .unwrap();
        assert_eq!(parsed.namespace, "//host.example.com:5989/root/cimv2");
        assert_eq!(parsed.class_name, "LMI_SoftwareJob");
        assert_eq!(parsed.key("InstanceID"), Some("LMI:LMI_SoftwareJob:7"));

        let local: ObjectPath = r#"LMI_SoftwareJob.InstanceID="LMI:LMI_SoftwareJob:7""#
            .parse()
            .unwrap();
        assert_eq!(local.namespace, "");
        assert_eq!(local.class_name, "LMI_SoftwareJob");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(":.x=1".parse::<ObjectPath>().is_err());
        assert!("Foo.Name=\"open".parse::<ObjectPath>().is_err());
    }

    #[test]
    fn test_instance_object_path_uses_keys() {
        let instance = Instance::new("root/cimv2", "LMI_SoftwareJob")
            .with_key("InstanceID", "LMI:LMI_SoftwareJob:1")
            .with_property("PercentComplete", 40);
        let path = instance.object_path();
        assert_eq!(path.keys.len(), 1);
        assert_eq!(path.key("instanceid"), Some("LMI:LMI_SoftwareJob:1"));
        assert_eq!(instance.get("percentcomplete"), Some(&Value::from(40)));
    }
}
