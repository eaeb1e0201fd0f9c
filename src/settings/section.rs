use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};
use serde_yaml::{Mapping, Value};
use std::fmt;
use std::str::FromStr;
use tracing::info;

use crate::constants::ON_EXISTING_KEY;
use crate::error::{PipelineError, Result};

/// A named configuration block of the settings document (`import`, `export`, ...).
///
/// Keys are validated lazily: a step declares what it needs through [`require_keys`]
/// right before it consumes the section.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepSection {
    name: String,
    values: Mapping,
}

impl StepSection {
    pub fn new(name: impl Into<String>, values: Mapping) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    /// Build a section from a YAML value, which must be a mapping.
    pub fn from_value(name: impl Into<String>, value: Value) -> Result<Self> {
        let name = name.into();
        match value {
            Value::Mapping(values) => Ok(Self { name, values }),
            other => Err(PipelineError::config(format!(
                "section '{}' must be a mapping, found {}",
                name,
                describe(&other)
            ))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Scalar value of `key` rendered as a string (numbers and booleans included).
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(scalar_to_string)
    }

    /// Like [`get_str`](Self::get_str) but fails when the key is missing or not a scalar.
    pub fn require_str(&self, key: &str) -> Result<String> {
        require_keys(self, &[key])?;
        self.get_str(key).ok_or_else(|| {
            PipelineError::config(format!(
                "error: {} section key '{}' must be a scalar value",
                self.name, key
            ))
        })
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value.as_u64().map(Some).ok_or_else(|| {
                PipelineError::config(format!(
                    "error: {} section key '{}' must be a non-negative integer",
                    self.name, key
                ))
            }),
        }
    }

    /// Deserialize the whole section into a typed settings struct.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        serde_yaml::from_value(Value::Mapping(self.values.clone())).map_err(|e| {
            PipelineError::config(format!("error: invalid {} section: {}", self.name, e))
        })
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.values.insert(Value::String(key.to_string()), value.into());
    }

    /// Sub-entries keyed by string, in document order.
    pub fn entries(&self) -> impl Iterator<Item = (String, &Value)> {
        self.values
            .iter()
            .filter_map(|(key, value)| scalar_to_string(key).map(|key| (key, value)))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Fail with a `ConfigError` naming the first of `keys` missing from `section`.
pub fn require_keys(section: &StepSection, keys: &[&str]) -> Result<()> {
    match keys.iter().find(|key| !section.contains_key(**key)) {
        Some(missing) => Err(PipelineError::config(format!(
            "error: {} section is missing: {}",
            section.name(),
            missing
        ))),
        None => Ok(()),
    }
}

/// What a writing step does when its target data already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnExistingPolicy {
    #[default]
    Skip,
    Delete,
    Abort,
}

impl OnExistingPolicy {
    pub const ALLOWED: [&'static str; 3] = ["skip", "delete", "abort"];

    pub fn as_str(&self) -> &'static str {
        match self {
            OnExistingPolicy::Skip => "skip",
            OnExistingPolicy::Delete => "delete",
            OnExistingPolicy::Abort => "abort",
        }
    }
}

impl fmt::Display for OnExistingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OnExistingPolicy {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "skip" => Ok(OnExistingPolicy::Skip),
            "delete" => Ok(OnExistingPolicy::Delete),
            "abort" => Ok(OnExistingPolicy::Abort),
            other => Err(PipelineError::config(format!(
                "{}: {} is not one of the allowed values: {}",
                ON_EXISTING_KEY,
                other,
                Self::ALLOWED.join(" ")
            ))),
        }
    }
}

/// Read the `on_existing` policy of a section, installing `skip` when the key is absent.
pub fn resolve_on_existing(section: &mut StepSection) -> Result<OnExistingPolicy> {
    if !section.contains_key(ON_EXISTING_KEY) {
        info!("defaulting '{}' to 'skip'", ON_EXISTING_KEY);
        section.insert(ON_EXISTING_KEY, OnExistingPolicy::Skip.as_str());
    }

    let raw = section.get_str(ON_EXISTING_KEY).ok_or_else(|| {
        PipelineError::config(format!(
            "{}: value is not one of the allowed values: {}",
            ON_EXISTING_KEY,
            OnExistingPolicy::ALLOWED.join(" ")
        ))
    })?;
    raw.parse()
}

pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// `deserialize_with` helper accepting any scalar (`4326` or `"EPSG:4326"`) as a string.
pub(crate) fn scalar_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => scalar_to_string(&value).map(Some).ok_or_else(|| {
            D::Error::custom(format!("expected a scalar value, found {}", describe(&value)))
        }),
    }
}

pub(crate) fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}
