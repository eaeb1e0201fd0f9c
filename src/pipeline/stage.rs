use clap::ValueEnum;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// The six skippable pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
pub enum Stage {
    Import,
    Optional,
    Network,
    Attributes,
    Index,
    Export,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Import,
        Stage::Optional,
        Stage::Network,
        Stage::Attributes,
        Stage::Index,
        Stage::Export,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Import => "import",
            Stage::Optional => "optional",
            Stage::Network => "network",
            Stage::Attributes => "attributes",
            Stage::Index => "index",
            Stage::Export => "export",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == value)
            .ok_or_else(|| {
                let allowed: Vec<&str> = Stage::ALL.iter().map(Stage::as_str).collect();
                PipelineError::config(format!(
                    "skip: {} is not one of the allowed values: {}",
                    value,
                    allowed.join(" ")
                ))
            })
    }
}

/// Stages bypassed for a single run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipSet {
    stages: BTreeSet<Stage>,
}

impl SkipSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse skip tokens, rejecting unknown ones before anything runs.
    pub fn parse<S: AsRef<str>>(tokens: &[S]) -> Result<Self, PipelineError> {
        tokens
            .iter()
            .map(|token| token.as_ref().parse::<Stage>())
            .collect::<Result<BTreeSet<_>, _>>()
            .map(|stages| Self { stages })
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl FromIterator<Stage> for SkipSet {
    fn from_iter<I: IntoIterator<Item = Stage>>(iter: I) -> Self {
        Self {
            stages: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for SkipSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.stages.iter().map(Stage::as_str).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_tokens() {
        let skip = SkipSet::parse(&["import", "optional"]).unwrap();
        assert!(skip.contains(Stage::Import));
        assert!(skip.contains(Stage::Optional));
        assert!(!skip.contains(Stage::Export));
        assert_eq!(skip.to_string(), "[import, optional]");
    }

    #[test]
    fn rejects_unknown_tokens() {
        let err = SkipSet::parse(&["import", "weights"]).unwrap_err();
        assert!(err.to_string().contains("weights is not one of the allowed values"));
    }

    #[test]
    fn empty_skip_set() {
        let skip = SkipSet::parse::<&str>(&[]).unwrap();
        assert!(skip.is_empty());
        assert_eq!(skip.to_string(), "[]");
    }
}
