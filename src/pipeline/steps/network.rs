use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::{invalid_settings, policy_of, step_failed, DbStep, StepContext, StepResult};
use crate::constants::{EDGES_TABLE, FEATURES_TABLE};
use crate::db::{Edge, Feature, TargetAction};
use crate::error::{PipelineError, Result, StepError};
use crate::settings::StepSection;

const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Geographic (longitude/latitude) SRIDs; everything else is treated as projected metres.
const GEOGRAPHIC_SRIDS: [&str; 3] = ["4326", "4258", "4269"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    Haversine,
    Planar,
}

impl DistanceMetric {
    pub fn for_srid(srid: &str) -> Self {
        if GEOGRAPHIC_SRIDS.contains(&srid) {
            DistanceMetric::Haversine
        } else {
            DistanceMetric::Planar
        }
    }

    /// Distance in metres between two features.
    pub fn distance(&self, a: &Feature, b: &Feature) -> f64 {
        match self {
            DistanceMetric::Haversine => {
                let (phi1, phi2) = (a.y.to_radians(), b.y.to_radians());
                let d_phi = (b.y - a.y).to_radians();
                let d_lambda = (b.x - a.x).to_radians();
                let h = (d_phi / 2.0).sin().powi(2)
                    + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
                2.0 * EARTH_RADIUS_M * h.sqrt().asin()
            }
            DistanceMetric::Planar => (b.x - a.x).hypot(b.y - a.y),
        }
    }
}

/// Derives a point network: every feature is linked to its nearest neighbours.
///
/// Configured from the `import` section; `neighbours` (default 1) sets how many
/// links each feature contributes. Links are undirected and deduplicated.
pub struct NetworkStep {
    ctx: StepContext,
}

impl NetworkStep {
    pub fn new(ctx: StepContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl DbStep for NetworkStep {
    async fn run_step(&self, config: &StepSection) -> Result<StepResult> {
        let step = self.step_name();
        let policy = policy_of(config).map_err(invalid_settings(step))?;
        let neighbours = config
            .get_u64("neighbours")
            .map_err(invalid_settings(step))?
            .unwrap_or(1);
        if neighbours == 0 {
            return Err(PipelineError::step(
                step,
                StepError::Settings(format!(
                    "{} section key 'neighbours' must be at least 1",
                    config.name()
                )),
            ));
        }

        let features_table = self.ctx.table(FEATURES_TABLE);
        let edges_table = self.ctx.table(EDGES_TABLE);

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
            .prepare_target(&edges_table, policy)
            .map_err(step_failed(step))?
            == TargetAction::Keep
        {
            return Ok(StepResult::kept(format!(
                "'{}' already exists, network step skipped",
                edges_table
            )));
        }

        let features = db.load_features(&features_table).map_err(step_failed(step))?;
        let srid = self.ctx.global.target_srid();
        let metric = DistanceMetric::for_srid(srid);
        debug!(
            "linking {} features to {} neighbours using {:?} distances",
            features.len(),
            neighbours,
            metric
        );

        let edges = nearest_neighbour_edges(&features, neighbours as usize, metric);
        db.write_edges(&edges_table, &edges)
            .map_err(step_failed(step))?;
        db.register_layer(&edges_table, "network", srid, edges.len())
            .map_err(step_failed(step))?;

        let message = format!("derived {} edges into '{}'", edges.len(), edges_table);
        info!("{}", message);
        Ok(StepResult::success(edges.len(), message))
    }

    fn step_name(&self) -> &'static str {
        "network"
    }
}

/// Link each feature to its `k` nearest features. Ties break on feature id.
pub fn nearest_neighbour_edges(features: &[Feature], k: usize, metric: DistanceMetric) -> Vec<Edge> {
    let mut edges: BTreeMap<(String, String), f64> = BTreeMap::new();

    for (i, feature) in features.iter().enumerate() {
        let mut candidates: Vec<(f64, &Feature)> = features
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, other)| (metric.distance(feature, other), other))
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));

        for (distance, other) in candidates.into_iter().take(k) {
            let key = if feature.id <= other.id {
                (feature.id.clone(), other.id.clone())
            } else {
                (other.id.clone(), feature.id.clone())
            };
            edges.entry(key).or_insert(distance);
        }
    }

    edges
        .into_iter()
        .map(|((source, target), length_m)| Edge {
            source,
            target,
            length_m,
        })
        .collect()
}
