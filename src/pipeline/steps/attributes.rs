use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::{invalid_settings, policy_of, step_failed, DbStep, StepContext, StepResult};
use crate::constants::{ATTRIBUTES_TABLE, EDGES_TABLE, FEATURES_TABLE};
use crate::db::{AttributeTable, Edge, Feature, TargetAction};
use crate::error::{PipelineError, Result, StepError};
use crate::settings::StepSection;

pub const DEGREE: &str = "degree";
pub const TOTAL_LENGTH: &str = "total_length";
pub const MEAN_LENGTH: &str = "mean_length";

/// Derives per-feature numeric attributes from the network and the feature properties.
pub struct AttributesStep {
    ctx: StepContext,
}

impl AttributesStep {
    pub fn new(ctx: StepContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl DbStep for AttributesStep {
    async fn run_step(&self, config: &StepSection) -> Result<StepResult> {
        let step = self.step_name();
        let policy = policy_of(config).map_err(invalid_settings(step))?;
        let features_table = self.ctx.table(FEATURES_TABLE);
        let edges_table = self.ctx.table(EDGES_TABLE);
        let attributes_table = self.ctx.table(ATTRIBUTES_TABLE);

        let mut db = self.ctx.open_database().map_err(step_failed(step))?;
        if !db.table_exists(&features_table).map_err(step_failed(step))? {
            return Err(PipelineError::step(
                step,
                StepError::InvalidData(format!(
                    "features table '{}' does not exist; run the import stage first",
                    features_table
                )),
            ));
        }
        if db
            .prepare_target(&attributes_table, policy)
            .map_err(step_failed(step))?
            == TargetAction::Keep
        {
            return Ok(StepResult::kept(format!(
                "'{}' already exists, attributes step skipped",
                attributes_table
            )));
        }

        let features = db.load_features(&features_table).map_err(step_failed(step))?;
        let edges = if db.table_exists(&edges_table).map_err(step_failed(step))? {
            db.load_edges(&edges_table).map_err(step_failed(step))?
        } else {
            warn!(
                "no network table '{}', network attributes will be zero",
                edges_table
            );
            Vec::new()
        };

        let attributes = derive_attributes(&features, &edges);
        db.write_attributes(&attributes_table, &attributes)
            .map_err(step_failed(step))?;
        db.register_layer(
            &attributes_table,
            "attributes",
            self.ctx.global.target_srid(),
            attributes.len(),
        )
        .map_err(step_failed(step))?;

        let message = format!(
            "derived attributes for {} features into '{}'",
            attributes.len(),
            attributes_table
        );
        info!("{}", message);
        Ok(StepResult::success(attributes.len(), message))
    }

    fn step_name(&self) -> &'static str {
        "attributes"
    }
}

/// Network measures plus every numeric or boolean feature property.
///
/// Derived measures win over properties of the same name.
pub fn derive_attributes(features: &[Feature], edges: &[Edge]) -> AttributeTable {
    let mut lengths: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for edge in edges {
        lengths.entry(edge.source.as_str()).or_default().push(edge.length_m);
        lengths.entry(edge.target.as_str()).or_default().push(edge.length_m);
    }

    let mut table = AttributeTable::new();
    for feature in features {
        let mut values = BTreeMap::new();
        for (key, value) in &feature.properties {
            let number = value
                .as_f64()
                .or_else(|| value.as_bool().map(|b| if b { 1.0 } else { 0.0 }));
            if let Some(number) = number {
                values.insert(key.clone(), number);
            }
        }

        let incident = lengths.get(feature.id.as_str());
        let degree = incident.map_or(0, Vec::len);
        let total: f64 = incident.map_or(0.0, |l| l.iter().sum());
        let mean = if degree == 0 { 0.0 } else { total / degree as f64 };
        values.insert(DEGREE.to_string(), degree as f64);
        values.insert(TOTAL_LENGTH.to_string(), total);
        values.insert(MEAN_LENGTH.to_string(), mean);

        table.insert(feature.id.clone(), values);
    }
    table
}
