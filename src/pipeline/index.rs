use async_trait::async_trait;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use super::steps::{step_failed, StepContext, StepResult};
use crate::constants::{ATTRIBUTES_TABLE, FEATURES_TABLE, SEARCH_INDEX_TABLE};
use crate::error::{PipelineError, Result, StepError};
use crate::pipeline::steps::attributes::derive_attributes;
use crate::settings::section::scalar_to_string;
use crate::settings::StepSection;

/// Attribute name to weight.
pub type WeightSet = BTreeMap<String, f64>;

/// Weight sets by name, loaded from the `weights` section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedWeights {
    sets: BTreeMap<String, WeightSet>,
}

impl ResolvedWeights {
    pub fn get(&self, name: &str) -> Option<&WeightSet> {
        self.sets.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &WeightSet)> {
        self.sets.iter()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

impl FromIterator<(String, WeightSet)> for ResolvedWeights {
    fn from_iter<I: IntoIterator<Item = (String, WeightSet)>>(iter: I) -> Self {
        Self {
            sets: iter.into_iter().collect(),
        }
    }
}

/// Resolve every weight definition against `base_path`.
///
/// An entry is either a path to a YAML file holding `attribute: weight` pairs,
/// or such a mapping given inline.
pub fn load_weights(base_path: &Path, definitions: &StepSection) -> Result<ResolvedWeights> {
    if definitions.is_empty() {
        return Err(PipelineError::config(
            "error: weights section defines no weights",
        ));
    }

    let mut sets = BTreeMap::new();
    for (name, definition) in definitions.entries() {
        let set = match definition {
            Value::Mapping(_) => parse_weight_set(&name, definition)?,
            other => {
                let Some(relative) = scalar_to_string(other) else {
                    return Err(PipelineError::config(format!(
                        "weights.{}: expected a file path or a mapping",
                        name
                    )));
                };
                let path = base_path.join(&relative);
                info!("loading weights '{}' from {}", name, path.display());
                let raw = fs::read_to_string(&path).map_err(|e| {
                    PipelineError::config(format!(
                        "weights.{}: failed to read '{}': {}",
                        name,
                        path.display(),
                        e
                    ))
                })?;
                let document: Value = serde_yaml::from_str(&raw).map_err(|e| {
                    PipelineError::config(format!(
                        "weights.{}: failed to parse '{}': {}",
                        name,
                        path.display(),
                        e
                    ))
                })?;
                parse_weight_set(&name, &document)?
            }
        };
        debug!("weights '{}': {} attributes", name, set.len());
        sets.insert(name, set);
    }

    Ok(ResolvedWeights { sets })
}

fn parse_weight_set(name: &str, document: &Value) -> Result<WeightSet> {
    let Value::Mapping(mapping) = document else {
        return Err(PipelineError::config(format!(
            "weights.{}: weight definition must be a mapping of attribute to number",
            name
        )));
    };

    let mut set = WeightSet::new();
    for (attribute, weight) in mapping {
        let attribute = scalar_to_string(attribute).ok_or_else(|| {
            PipelineError::config(format!("weights.{}: attribute names must be strings", name))
        })?;
        let weight = weight.as_f64().filter(|w| w.is_finite()).ok_or_else(|| {
            PipelineError::config(format!(
                "weights.{}: weight for '{}' is not a number",
                name, attribute
            ))
        })?;
        set.insert(attribute, weight);
    }
    Ok(set)
}

/// Builds the search index from resolved weights.
#[async_trait]
pub trait IndexGenerator: Send + Sync {
    async fn generate_index(&self, weights: &ResolvedWeights) -> Result<StepResult>;
}

/// Scores every feature as the weighted sum of its attributes, one score per weight set.
pub struct SqliteIndexGenerator {
    ctx: StepContext,
}

impl SqliteIndexGenerator {
    pub fn new(ctx: StepContext) -> Self {
        Self { ctx }
    }

    fn build(&self, weights: &ResolvedWeights) -> std::result::Result<usize, StepError> {
        let mut db = self.ctx.open_database()?;
        let features_table = self.ctx.table(FEATURES_TABLE);
        let attributes_table = self.ctx.table(ATTRIBUTES_TABLE);
        let index_table = self.ctx.table(SEARCH_INDEX_TABLE);

        if !db.table_exists(&features_table)? {
            return Err(StepError::InvalidData(format!(
                "features table '{}' does not exist; run the import stage first",
                features_table
            )));
        }

        let attributes = if db.table_exists(&attributes_table)? {
            db.load_attributes(&attributes_table)?
        } else {
            warn!(
                "'{}' does not exist, scoring on feature properties only",
                attributes_table
            );
            derive_attributes(&db.load_features(&features_table)?, &[])
        };

        let scores = score_features(&attributes, weights);
        db.write_scores(&index_table, &scores)?;
        db.register_layer(
            &index_table,
            "index",
            self.ctx.global.target_srid(),
            attributes.len(),
        )?;
        Ok(scores.len())
    }
}

#[async_trait]
impl IndexGenerator for SqliteIndexGenerator {
    async fn generate_index(&self, weights: &ResolvedWeights) -> Result<StepResult> {
        let count = self.build(weights).map_err(step_failed("index"))?;
        let message = format!(
            "wrote {} scores for {} weight sets",
            count,
            weights.len()
        );
        info!("{}", message);
        Ok(StepResult::success(count, message))
    }
}

/// `(feature id, weight name, score)` rows; missing attributes count as zero.
pub fn score_features(
    attributes: &crate::db::AttributeTable,
    weights: &ResolvedWeights,
) -> Vec<(String, String, f64)> {
    let mut feature_ids: Vec<&String> = attributes.keys().collect();
    feature_ids.sort();

    let mut scores = Vec::with_capacity(feature_ids.len() * weights.len());
    for feature_id in feature_ids {
        let values = &attributes[feature_id];
        for (weight_name, set) in weights.iter() {
            let score: f64 = set
                .iter()
                .map(|(attribute, weight)| weight * values.get(attribute).copied().unwrap_or(0.0))
                .sum();
            scores.push((feature_id.clone(), weight_name.clone(), score));
        }
    }
    scores
}
