use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use super::{invalid_settings, step_failed, DbStep, StepContext, StepResult};
use crate::constants::{ATTRIBUTES_TABLE, DEFAULT_SRID, FEATURES_TABLE, SEARCH_INDEX_TABLE};
use crate::db::{AttributeTable, Database, Feature};
use crate::error::{PipelineError, Result, StepError};
use crate::settings::StepSection;

/// Features joined with their derived attributes and index scores.
struct ExportRows {
    features: Vec<Feature>,
    attributes: AttributeTable,
    scores: AttributeTable,
}

impl ExportRows {
    fn load(ctx: &StepContext, db: &Database) -> std::result::Result<Self, StepError> {
        let features_table = ctx.table(FEATURES_TABLE);
        if !db.table_exists(&features_table)? {
            return Err(StepError::InvalidData(format!(
                "features table '{}' does not exist; nothing to export",
                features_table
            )));
        }

        Ok(Self {
            features: db.load_features(&features_table)?,
            attributes: load_if_present(ctx, db, ATTRIBUTES_TABLE, Database::load_attributes)?,
            scores: load_if_present(ctx, db, SEARCH_INDEX_TABLE, Database::load_scores)?,
        })
    }
}

fn load_if_present(
    ctx: &StepContext,
    db: &Database,
    base: &str,
    load: fn(&Database, &str) -> std::result::Result<AttributeTable, StepError>,
) -> std::result::Result<AttributeTable, StepError> {
    let table = ctx.table(base);
    if db.table_exists(&table)? {
        load(db, &table)
    } else {
        warn!("'{}' does not exist, exporting without it", table);
        Ok(AttributeTable::new())
    }
}

fn output_path(
    ctx: &StepContext,
    step: &'static str,
    config: &StepSection,
) -> Result<std::path::PathBuf> {
    let path = config.require_str("path").map_err(invalid_settings(step))?;
    Ok(ctx.resolve_path(&path))
}

fn ensure_parent(path: &Path) -> std::result::Result<(), StepError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Writes features, attributes and scores as a GeoJSON FeatureCollection.
pub struct GeoJsonExporter {
    ctx: StepContext,
}

impl GeoJsonExporter {
    pub fn new(ctx: StepContext) -> Self {
        Self { ctx }
    }

    fn export(&self, path: &Path) -> std::result::Result<usize, StepError> {
        let db = self.ctx.open_database()?;
        let rows = ExportRows::load(&self.ctx, &db)?;

        let features: Vec<Value> = rows
            .features
            .iter()
            .map(|feature| {
                let mut properties = feature.properties.clone();
                if let Some(name) = &feature.name {
                    properties.insert("name".to_string(), json!(name));
                }
                if let Some(attributes) = rows.attributes.get(&feature.id) {
                    properties.insert("attributes".to_string(), json!(attributes));
                }
                if let Some(scores) = rows.scores.get(&feature.id) {
                    properties.insert("scores".to_string(), json!(scores));
                }
                json!({
                    "type": "Feature",
                    "id": feature.id,
                    "geometry": {"type": "Point", "coordinates": [feature.x, feature.y]},
                    "properties": properties,
                })
            })
            .collect();

        let mut collection = Map::new();
        collection.insert("type".to_string(), json!("FeatureCollection"));
        let srid = self.ctx.global.target_srid();
        if srid != DEFAULT_SRID {
            collection.insert(
                "crs".to_string(),
                json!({"type": "name", "properties": {"name": format!("EPSG:{}", srid)}}),
            );
        }
        let count = features.len();
        collection.insert("features".to_string(), Value::Array(features));

        ensure_parent(path)?;
        fs::write(path, serde_json::to_string_pretty(&Value::Object(collection))?)?;
        Ok(count)
    }
}

#[async_trait]
impl DbStep for GeoJsonExporter {
    async fn run_step(&self, config: &StepSection) -> Result<StepResult> {
        let path = output_path(&self.ctx, self.step_name(), config)?;
        let count = self.export(&path).map_err(step_failed(self.step_name()))?;
        let message = format!("exported {} features to {}", count, path.display());
        info!("{}", message);
        Ok(StepResult::success(count, message))
    }

    fn step_name(&self) -> &'static str {
        "geojson_export"
    }
}

/// Writes one CSV row per feature, with attribute and `score_<weight>` columns.
pub struct CsvExporter {
    ctx: StepContext,
}

impl CsvExporter {
    pub fn new(ctx: StepContext) -> Self {
        Self { ctx }
    }

    fn export(&self, path: &Path, delimiter: u8) -> std::result::Result<usize, StepError> {
        let db = self.ctx.open_database()?;
        let rows = ExportRows::load(&self.ctx, &db)?;

        let attribute_names: BTreeSet<&String> =
            rows.attributes.values().flat_map(|a| a.keys()).collect();
        let weight_names: BTreeSet<&String> =
            rows.scores.values().flat_map(|s| s.keys()).collect();

        ensure_parent(path)?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_path(path)?;

        let mut header: Vec<String> = ["id", "name", "x", "y"]
            .iter()
            .map(|h| h.to_string())
            .collect();
        header.extend(attribute_names.iter().map(|n| n.to_string()));
        header.extend(weight_names.iter().map(|n| format!("score_{}", n)));
        writer.write_record(&header)?;

        for feature in &rows.features {
            let mut record = vec![
                feature.id.clone(),
                feature.name.clone().unwrap_or_default(),
                feature.x.to_string(),
                feature.y.to_string(),
            ];
            let attributes = rows.attributes.get(&feature.id);
            for name in &attribute_names {
                record.push(
                    attributes
                        .and_then(|a| a.get(*name))
                        .map(f64::to_string)
                        .unwrap_or_default(),
                );
            }
            let scores = rows.scores.get(&feature.id);
            for name in &weight_names {
                record.push(
                    scores
                        .and_then(|s| s.get(*name))
                        .map(f64::to_string)
                        .unwrap_or_default(),
                );
            }
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(rows.features.len())
    }
}

#[async_trait]
impl DbStep for CsvExporter {
    async fn run_step(&self, config: &StepSection) -> Result<StepResult> {
        let path = output_path(&self.ctx, self.step_name(), config)?;
        let delimiter = match config.get_str("delimiter") {
            None => b',',
            Some(d) if d.len() == 1 && d.is_ascii() => d.as_bytes()[0],
            Some(d) => {
                return Err(PipelineError::step(
                    self.step_name(),
                    StepError::Settings(format!(
                        "{} section key 'delimiter' must be a single ASCII character, got '{}'",
                        config.name(),
                        d
                    )),
                ))
            }
        };

        let count = self
            .export(&path, delimiter)
            .map_err(step_failed(self.step_name()))?;
        let message = format!("exported {} features to {}", count, path.display());
        info!("{}", message);
        Ok(StepResult::success(count, message))
    }

    fn step_name(&self) -> &'static str {
        "csv_export"
    }
}
