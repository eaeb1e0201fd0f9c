use async_trait::async_trait;
use serde_json::{Map, Number, Value};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::{invalid_settings, policy_of, step_failed, DbStep, StepContext, StepResult};
use crate::constants::FEATURES_TABLE;
use crate::db::{Feature, TargetAction};
use crate::error::{PipelineError, Result, StepError};
use crate::settings::{sanitize_case_id, sanitize_srid, StepSection};

/// Column (or property) names an importer reads feature fields from.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnOptions {
    pub id: String,
    pub name: String,
    pub x: String,
    pub y: String,
}

impl ColumnOptions {
    pub fn from_section(config: &StepSection) -> Self {
        Self {
            id: config.get_str("id_column").unwrap_or_else(|| "id".to_string()),
            name: config
                .get_str("name_column")
                .unwrap_or_else(|| "name".to_string()),
            x: config.get_str("x_column").unwrap_or_else(|| "lon".to_string()),
            y: config.get_str("y_column").unwrap_or_else(|| "lat".to_string()),
        }
    }
}

/// Imports point features from a CSV file with a header row.
pub struct CsvImporter {
    ctx: StepContext,
}

impl CsvImporter {
    pub fn new(ctx: StepContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl DbStep for CsvImporter {
    async fn run_step(&self, config: &StepSection) -> Result<StepResult> {
        import_features(&self.ctx, self.step_name(), config, read_csv)
    }

    fn step_name(&self) -> &'static str {
        "csv_import"
    }
}

/// Imports Point features from a GeoJSON FeatureCollection.
pub struct GeoJsonImporter {
    ctx: StepContext,
}

impl GeoJsonImporter {
    pub fn new(ctx: StepContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl DbStep for GeoJsonImporter {
    async fn run_step(&self, config: &StepSection) -> Result<StepResult> {
        import_features(&self.ctx, self.step_name(), config, read_geojson)
    }

    fn step_name(&self) -> &'static str {
        "geojson_import"
    }
}

/// Table an import section writes: its `table` key, or the features table.
pub fn target_table(config: &StepSection) -> String {
    config
        .get_str("table")
        .map(|raw| sanitize_case_id(&raw))
        .filter(|table| !table.is_empty())
        .unwrap_or_else(|| FEATURES_TABLE.to_string())
}

fn import_features<F>(
    ctx: &StepContext,
    step: &'static str,
    config: &StepSection,
    read: F,
) -> Result<StepResult>
where
    F: FnOnce(&Path, &ColumnOptions) -> std::result::Result<Vec<Feature>, StepError>,
{
    let file = ctx.resolve_path(&config.require_str("file").map_err(invalid_settings(step))?);
    let policy = policy_of(config).map_err(invalid_settings(step))?;
    let table = ctx.table(&target_table(config));
    let columns = ColumnOptions::from_section(config);

    if let Some(raw) = config.get_str("srid") {
        let source_srid = sanitize_srid(&raw);
        if !source_srid.is_empty() && source_srid != ctx.global.target_srid() {
            return Err(PipelineError::step(
                step,
                StepError::Settings(format!(
                    "{}: source SRID {} differs from target SRID {} and reprojection is not supported",
                    config.name(),
                    source_srid,
                    ctx.global.target_srid()
                )),
            ));
        }
    }

    // Parse the input before the target table is touched
    info!("reading {}", file.display());
    let features = read(&file, &columns).map_err(step_failed(step))?;
    debug!("parsed {} features from {}", features.len(), file.display());

    let mut db = ctx.open_database().map_err(step_failed(step))?;
    if db
        .prepare_target(&table, policy)
        .map_err(step_failed(step))?
        == TargetAction::Keep
    {
        return Ok(StepResult::kept(format!(
            "'{}' already exists, import skipped",
            table
        )));
    }

    let srid = ctx.global.target_srid();
    db.write_features(&table, &features, srid)
        .map_err(step_failed(step))?;
    db.register_layer(&table, "import", srid, features.len())
        .map_err(step_failed(step))?;

    let message = format!("imported {} features into '{}'", features.len(), table);
    info!("{}", message);
    Ok(StepResult::success(features.len(), message))
}

fn read_csv(path: &Path, columns: &ColumnOptions) -> std::result::Result<Vec<Feature>, StepError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let headers = reader.headers()?.clone();

    let position = |column: &str| headers.iter().position(|h| h == column);
    let x_idx = position(&columns.x).ok_or_else(|| {
        StepError::InvalidData(format!("missing x column '{}' in {}", columns.x, path.display()))
    })?;
    let y_idx = position(&columns.y).ok_or_else(|| {
        StepError::InvalidData(format!("missing y column '{}' in {}", columns.y, path.display()))
    })?;
    let id_idx = position(&columns.id);
    let name_idx = position(&columns.name);

    let mut features = Vec::new();
    let mut seen = HashSet::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let line = row + 2;

        let x = parse_coordinate(record.get(x_idx), &columns.x, line)?;
        let y = parse_coordinate(record.get(y_idx), &columns.y, line)?;
        let id = match id_idx {
            Some(idx) => record.get(idx).unwrap_or_default().to_string(),
            None => (row + 1).to_string(),
        };
        check_id(&id, line, &mut seen)?;

        let name = name_idx
            .and_then(|idx| record.get(idx))
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        let mut properties = Map::new();
        for (idx, header) in headers.iter().enumerate() {
            if idx == x_idx || idx == y_idx || Some(idx) == id_idx || Some(idx) == name_idx {
                continue;
            }
            properties.insert(
                header.to_string(),
                property_value(record.get(idx).unwrap_or_default()),
            );
        }

        features.push(Feature {
            id,
            name,
            x,
            y,
            properties,
        });
    }
    Ok(features)
}

fn read_geojson(
    path: &Path,
    columns: &ColumnOptions,
) -> std::result::Result<Vec<Feature>, StepError> {
    let document: Value = serde_json::from_str(&fs::read_to_string(path)?)?;
    if document.get("type").and_then(Value::as_str) != Some("FeatureCollection") {
        return Err(StepError::InvalidData(format!(
            "{} is not a GeoJSON FeatureCollection",
            path.display()
        )));
    }
    let items = document
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            StepError::InvalidData(format!("{} has no features array", path.display()))
        })?;

    let mut features = Vec::with_capacity(items.len());
    let mut seen = HashSet::new();
    for (index, item) in items.iter().enumerate() {
        let geometry_type = item
            .get("geometry")
            .and_then(|g| g.get("type"))
            .and_then(Value::as_str);
        if geometry_type != Some("Point") {
            return Err(StepError::InvalidData(format!(
                "feature {} has geometry {:?}; only Point is supported",
                index, geometry_type
            )));
        }
        let coordinates = item
            .get("geometry")
            .and_then(|g| g.get("coordinates"))
            .and_then(Value::as_array)
            .filter(|c| c.len() >= 2)
            .ok_or_else(|| {
                StepError::InvalidData(format!("feature {} has invalid coordinates", index))
            })?;
        let (Some(x), Some(y)) = (coordinates[0].as_f64(), coordinates[1].as_f64()) else {
            return Err(StepError::InvalidData(format!(
                "feature {} has non-numeric coordinates",
                index
            )));
        };

        let mut properties = item
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let id = item
            .get("id")
            .and_then(json_scalar)
            .or_else(|| properties.remove(&columns.id).as_ref().and_then(json_scalar))
            .unwrap_or_else(|| (index + 1).to_string());
        check_id(&id, index + 1, &mut seen)?;
        let name = properties
            .remove(&columns.name)
            .and_then(|v| v.as_str().map(str::to_string));

        features.push(Feature {
            id,
            name,
            x,
            y,
            properties,
        });
    }
    Ok(features)
}

fn parse_coordinate(
    raw: Option<&str>,
    column: &str,
    line: usize,
) -> std::result::Result<f64, StepError> {
    raw.and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .ok_or_else(|| {
            StepError::InvalidData(format!(
                "line {}: column '{}' is not a valid coordinate",
                line, column
            ))
        })
}

fn check_id(
    id: &str,
    position: usize,
    seen: &mut HashSet<String>,
) -> std::result::Result<(), StepError> {
    if id.is_empty() {
        return Err(StepError::InvalidData(format!(
            "record {}: empty feature id",
            position
        )));
    }
    if !seen.insert(id.to_string()) {
        return Err(StepError::InvalidData(format!(
            "record {}: duplicate feature id '{}'",
            position, id
        )));
    }
    Ok(())
}

/// Numbers are inferred, except codes with a leading zero such as `01234`.
fn property_value(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    if has_leading_zero(raw) {
        return Value::String(raw.to_string());
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Some(n) = raw.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(n);
    }
    Value::String(raw.to_string())
}

fn has_leading_zero(raw: &str) -> bool {
    let digits = raw.trim_start_matches(&['-', '+'][..]);
    digits.len() > 1 && digits.starts_with('0') && !digits[1..].starts_with('.')
}

fn json_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{DatabaseConfig, GlobalConfig};
    use serde_json::json;

    fn context(dir: &Path, global: GlobalConfig) -> StepContext {
        StepContext::new(&DatabaseConfig::at(dir.join("geo.db")), &global, dir)
    }

    fn section(yaml: &str) -> StepSection {
        StepSection::from_value("import", serde_yaml::from_str(yaml).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn csv_import_writes_features_and_layer() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("stops.csv"),
            "id,name,lon,lat,capacity\ns1,Main St,13.40,52.52,12\ns2,,13.41,52.53,\n",
        )
        .unwrap();

        let importer = CsvImporter::new(context(dir.path(), GlobalConfig::new("", "city-a")));
        let result = importer
            .run_step(&section("{type: csv, file: stops.csv, on_existing: skip}"))
            .await
            .unwrap();
        assert_eq!(result.processed_count, 2);

        let db = crate::db::Database::open(&DatabaseConfig::at(dir.path().join("geo.db"))).unwrap();
        let features = db.load_features("citya_features").unwrap();
        assert_eq!(features[0].name.as_deref(), Some("Main St"));
        assert_eq!(features[0].properties["capacity"], json!(12));
        assert_eq!(features[1].name, None);
        assert_eq!(features[1].properties["capacity"], Value::Null);

        let layer = db.layer("citya_features").unwrap().unwrap();
        assert_eq!(layer.srid, "4326");
        assert_eq!(layer.feature_count, 2);
    }

    #[tokio::test]
    async fn csv_import_respects_skip_and_abort() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.csv"), "id,lon,lat\na,1,2\n").unwrap();
        fs::write(dir.path().join("b.csv"), "id,lon,lat\nb,3,4\nc,5,6\n").unwrap();
        let importer = CsvImporter::new(context(dir.path(), GlobalConfig::default()));

        importer
            .run_step(&section("{type: csv, file: a.csv}"))
            .await
            .unwrap();

        let kept = importer
            .run_step(&section("{type: csv, file: b.csv, on_existing: skip}"))
            .await
            .unwrap();
        assert!(kept.kept_existing);

        let err = importer
            .run_step(&section("{type: csv, file: b.csv, on_existing: abort}"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::StepExecution {
                source: StepError::TargetExists(_),
                ..
            }
        ));

        let replaced = importer
            .run_step(&section("{type: csv, file: b.csv, on_existing: delete}"))
            .await
            .unwrap();
        assert_eq!(replaced.processed_count, 2);
    }

    #[tokio::test]
    async fn bad_input_keeps_existing_data_under_delete() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("good.csv"), "id,lon,lat\na,1,2\n").unwrap();
        fs::write(dir.path().join("bad.csv"), "id,lon,lat\nb,east,4\n").unwrap();
        let importer = CsvImporter::new(context(dir.path(), GlobalConfig::default()));

        importer
            .run_step(&section("{type: csv, file: good.csv}"))
            .await
            .unwrap();
        let err = importer
            .run_step(&section("{type: csv, file: bad.csv, on_existing: delete}"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("line 2: column 'lon'"));

        let db = crate::db::Database::open(&DatabaseConfig::at(dir.path().join("geo.db"))).unwrap();
        assert_eq!(db.load_features("features").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_file_key_fails_the_step() {
        let dir = tempfile::tempdir().unwrap();
        let importer = CsvImporter::new(context(dir.path(), GlobalConfig::default()));
        let err = importer
            .run_step(&section("{type: csv}"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::StepExecution {
                source: StepError::Settings(_),
                ..
            }
        ));
        assert_eq!(err.exit_code(), 4);
        assert!(!dir.path().join("geo.db").exists());
    }

    #[tokio::test]
    async fn mismatched_source_srid_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.csv"), "id,lon,lat\na,1,2\n").unwrap();
        let importer = CsvImporter::new(context(dir.path(), GlobalConfig::default()));
        let err = importer
            .run_step(&section("{type: csv, file: a.csv, srid: 'EPSG:25832'}"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("reprojection is not supported"));
        assert!(matches!(err, PipelineError::StepExecution { .. }));
    }

    #[test]
    fn duplicate_csv_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dup.csv");
        fs::write(&path, "id,lon,lat\na,1,2\na,3,4\n").unwrap();
        let columns = ColumnOptions::from_section(&section("{}"));
        let err = read_csv(&path, &columns).unwrap_err();
        assert!(err.to_string().contains("duplicate feature id 'a'"));
    }

    #[test]
    fn geojson_points_are_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pois.geojson");
        let doc = json!({
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "id": 7, "geometry": {"type": "Point", "coordinates": [8.5, 47.3]},
                 "properties": {"name": "Cafe", "seats": 20}},
                {"type": "Feature", "geometry": {"type": "Point", "coordinates": [8.6, 47.4]},
                 "properties": {"id": "p2"}}
            ]
        });
        fs::write(&path, doc.to_string()).unwrap();

        let columns = ColumnOptions::from_section(&section("{}"));
        let features = read_geojson(&path, &columns).unwrap();
        assert_eq!(features[0].id, "7");
        assert_eq!(features[0].name.as_deref(), Some("Cafe"));
        assert_eq!(features[0].properties["seats"], json!(20));
        assert!(!features[0].properties.contains_key("name"));
        assert_eq!(features[1].id, "p2");
    }

    #[test]
    fn geojson_non_points_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lines.geojson");
        let doc = json!({
            "type": "FeatureCollection",
            "features": [{"type": "Feature", "geometry": {"type": "LineString", "coordinates": [[0, 0], [1, 1]]}}]
        });
        fs::write(&path, doc.to_string()).unwrap();

        let columns = ColumnOptions::from_section(&section("{}"));
        let err = read_geojson(&path, &columns).unwrap_err();
        assert!(err.to_string().contains("only Point is supported"));
    }

    #[test]
    fn leading_zero_codes_stay_strings() {
        assert_eq!(property_value("01234"), json!("01234"));
        assert_eq!(property_value("-007"), json!("-007"));
        assert_eq!(property_value("0"), json!(0));
        assert_eq!(property_value("0.5"), json!(0.5));
        assert_eq!(property_value("1234"), json!(1234));
        assert_eq!(property_value(""), Value::Null);
    }

    #[test]
    fn target_table_defaults_and_sanitizes() {
        assert_eq!(target_table(&section("{type: csv}")), "features");
        assert_eq!(target_table(&section("{table: 'bus-stops'}")), "busstops");
    }
}
