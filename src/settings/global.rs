use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::info;

use super::section::{scalar_string, StepSection};
use crate::constants::DEFAULT_SRID;
use crate::error::Result;

static NON_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new("[^0-9]").expect("valid regex"));
static NON_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new("[^a-zA-Z0-9_]").expect("valid regex"));

/// Strip every character that is not a decimal digit. An empty result means "default SRID".
pub fn sanitize_srid(raw: &str) -> String {
    NON_DIGITS.replace_all(raw, "").into_owned()
}

/// Strip every character outside `[A-Za-z0-9_]`.
pub fn sanitize_case_id(raw: &str) -> String {
    NON_IDENTIFIER.replace_all(raw, "").into_owned()
}

/// The `global` section as written in the settings document.
#[derive(Debug, Default, Deserialize)]
struct GlobalSection {
    #[serde(default, deserialize_with = "scalar_string")]
    target_srid: Option<String>,
    #[serde(default, deserialize_with = "scalar_string")]
    case_id: Option<String>,
}

/// Run-wide settings shared by every step: target SRID and case id.
///
/// Built once while loading the settings document, then handed to each step by reference.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GlobalConfig {
    custom_srid: String,
    case_id: String,
}

impl GlobalConfig {
    pub fn new(target_srid: &str, case_id: &str) -> Self {
        Self {
            custom_srid: sanitize_srid(target_srid),
            case_id: sanitize_case_id(case_id),
        }
    }

    pub fn from_section(section: Option<&StepSection>) -> Result<Self> {
        let Some(section) = section else {
            return Ok(Self::default());
        };
        let raw: GlobalSection = section.deserialize()?;

        let mut config = Self::default();
        if let Some(srid) = raw.target_srid {
            config.custom_srid = sanitize_srid(&srid);
            info!("Set the target SRID to {}", config.target_srid());
        }
        if let Some(case_id) = raw.case_id {
            config.case_id = sanitize_case_id(&case_id);
            info!("Set the case id to '{}'", config.case_id);
        }
        Ok(config)
    }

    /// The sanitized SRID from the settings, empty when none was given.
    pub fn custom_srid(&self) -> &str {
        &self.custom_srid
    }

    /// SRID steps should write, falling back to the system default.
    pub fn target_srid(&self) -> &str {
        if self.custom_srid.is_empty() {
            DEFAULT_SRID
        } else {
            &self.custom_srid
        }
    }

    pub fn case_id(&self) -> &str {
        &self.case_id
    }

    /// Table name for `base`, prefixed with the case id when one is set.
    pub fn table_name(&self, base: &str) -> String {
        if self.case_id.is_empty() {
            base.to_string()
        } else {
            format!("{}_{}", self.case_id, base)
        }
    }
}
