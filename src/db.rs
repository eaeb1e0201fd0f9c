use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::constants::LAYERS_TABLE;
use crate::error::StepError;
use crate::settings::{DatabaseConfig, OnExistingPolicy};

/// A point feature as stored in a features table.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: String,
    pub name: Option<String>,
    pub x: f64,
    pub y: f64,
    pub properties: Map<String, Value>,
}

/// A derived network edge between two features.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub length_m: f64,
}

/// Row of the layers registry.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub name: String,
    pub kind: String,
    pub srid: String,
    pub feature_count: i64,
}

/// Outcome of checking a step's target table against its `on_existing` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetAction {
    /// Target is absent (or was just deleted); the step writes it.
    Write,
    /// Target exists and the policy is `skip`; the step leaves it untouched.
    Keep,
}

/// Per-feature numeric attributes keyed by feature id, then attribute name.
pub type AttributeTable = HashMap<String, BTreeMap<String, f64>>;

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database described by `config`.
    pub fn open(config: &DatabaseConfig) -> Result<Self, StepError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        debug!("Opening database at {}", config.path.display());
        let conn = Connection::open(&config.path)?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        let mode: String = conn.pragma_update_and_check(
            None,
            "journal_mode",
            config.journal_mode.as_str(),
            |row| row.get(0),
        )?;
        debug!("journal_mode is {}", mode);

        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                name          TEXT PRIMARY KEY,
                kind          TEXT NOT NULL,
                srid          TEXT NOT NULL,
                feature_count INTEGER NOT NULL,
                created_at    TEXT NOT NULL
            );
            "#,
            quote_ident(LAYERS_TABLE)
        ))?;

        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, StepError> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Apply `policy` to `table` before a step writes it.
    pub fn prepare_target(
        &self,
        table: &str,
        policy: OnExistingPolicy,
    ) -> Result<TargetAction, StepError> {
        if !self.table_exists(table)? {
            return Ok(TargetAction::Write);
        }

        match policy {
            OnExistingPolicy::Skip => {
                info!("'{}' already exists, skipping (on_existing: skip)", table);
                Ok(TargetAction::Keep)
            }
            OnExistingPolicy::Delete => {
                info!("'{}' already exists, deleting (on_existing: delete)", table);
                self.drop_table(table)?;
                Ok(TargetAction::Write)
            }
            OnExistingPolicy::Abort => Err(StepError::TargetExists(table.to_string())),
        }
    }

    pub fn drop_table(&self, table: &str) -> Result<(), StepError> {
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS {};", quote_ident(table)))?;
        self.conn.execute(
            &format!("DELETE FROM {} WHERE name = ?1", quote_ident(LAYERS_TABLE)),
            params![table],
        )?;
        Ok(())
    }

    pub fn register_layer(
        &self,
        table: &str,
        kind: &str,
        srid: &str,
        feature_count: usize,
    ) -> Result<(), StepError> {
        self.conn.execute(
            &format!(
                "INSERT INTO {} (name, kind, srid, feature_count, created_at) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(name) DO UPDATE SET kind=excluded.kind, srid=excluded.srid,
                 feature_count=excluded.feature_count, created_at=excluded.created_at",
                quote_ident(LAYERS_TABLE)
            ),
            params![table, kind, srid, feature_count as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn layer(&self, table: &str) -> Result<Option<Layer>, StepError> {
        let layer = self
            .conn
            .query_row(
                &format!(
                    "SELECT name, kind, srid, feature_count FROM {} WHERE name = ?1",
                    quote_ident(LAYERS_TABLE)
                ),
                params![table],
                |row| {
                    Ok(Layer {
                        name: row.get(0)?,
                        kind: row.get(1)?,
                        srid: row.get(2)?,
                        feature_count: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(layer)
    }

    // Features

    pub fn write_features(
        &mut self,
        table: &str,
        features: &[Feature],
        srid: &str,
    ) -> Result<(), StepError> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(&format!(
            r#"
            CREATE TABLE {} (
                id         TEXT PRIMARY KEY,
                name       TEXT,
                x          REAL NOT NULL,
                y          REAL NOT NULL,
                srid       TEXT NOT NULL,
                properties TEXT NOT NULL
            );
            "#,
            quote_ident(table)
        ))?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (id, name, x, y, srid, properties) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                quote_ident(table)
            ))?;
            for feature in features {
                let properties = serde_json::to_string(&feature.properties)?;
                stmt.execute(params![
                    feature.id,
                    feature.name,
                    feature.x,
                    feature.y,
                    srid,
                    properties
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_features(&self, table: &str) -> Result<Vec<Feature>, StepError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, name, x, y, properties FROM {} ORDER BY id",
            quote_ident(table)
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut features = Vec::new();
        for row in rows {
            let (id, name, x, y, properties) = row?;
            let properties = match serde_json::from_str::<Value>(&properties)? {
                Value::Object(map) => map,
                _ => {
                    warn!("feature '{}' has non-object properties, ignoring them", id);
                    Map::new()
                }
            };
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

    // Edges

    pub fn write_edges(&mut self, table: &str, edges: &[Edge]) -> Result<(), StepError> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(&format!(
            r#"
            CREATE TABLE {} (
                source   TEXT NOT NULL,
                target   TEXT NOT NULL,
                length_m REAL NOT NULL,
                PRIMARY KEY (source, target)
            );
            "#,
            quote_ident(table)
        ))?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR IGNORE INTO {} (source, target, length_m) VALUES (?1, ?2, ?3)",
                quote_ident(table)
            ))?;
            for edge in edges {
                stmt.execute(params![edge.source, edge.target, edge.length_m])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_edges(&self, table: &str) -> Result<Vec<Edge>, StepError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT source, target, length_m FROM {} ORDER BY source, target",
            quote_ident(table)
        ))?;
        let edges = stmt
            .query_map([], |row| {
                Ok(Edge {
                    source: row.get(0)?,
                    target: row.get(1)?,
                    length_m: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(edges)
    }

    // Attributes

    pub fn write_attributes(
        &mut self,
        table: &str,
        attributes: &AttributeTable,
    ) -> Result<(), StepError> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(&format!(
            r#"
            CREATE TABLE {} (
                feature_id TEXT NOT NULL,
                attribute  TEXT NOT NULL,
                value      REAL NOT NULL,
                PRIMARY KEY (feature_id, attribute)
            );
            "#,
            quote_ident(table)
        ))?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (feature_id, attribute, value) VALUES (?1, ?2, ?3)",
                quote_ident(table)
            ))?;
            for (feature_id, values) in attributes {
                for (attribute, value) in values {
                    stmt.execute(params![feature_id, attribute, value])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_attributes(&self, table: &str) -> Result<AttributeTable, StepError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT feature_id, attribute, value FROM {}",
            quote_ident(table)
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?;

        let mut attributes = AttributeTable::new();
        for row in rows {
            let (feature_id, attribute, value) = row?;
            attributes
                .entry(feature_id)
                .or_default()
                .insert(attribute, value);
        }
        Ok(attributes)
    }

    // Search index

    /// Replace the search index table with `scores` (feature id, weight name, score).
    pub fn write_scores(
        &mut self,
        table: &str,
        scores: &[(String, String, f64)],
    ) -> Result<(), StepError> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(&format!(
            r#"
            DROP TABLE IF EXISTS {table};
            CREATE TABLE {table} (
                feature_id  TEXT NOT NULL,
                weight_name TEXT NOT NULL,
                score       REAL NOT NULL,
                PRIMARY KEY (feature_id, weight_name)
            );
            "#,
            table = quote_ident(table)
        ))?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (feature_id, weight_name, score) VALUES (?1, ?2, ?3)",
                quote_ident(table)
            ))?;
            for (feature_id, weight_name, score) in scores {
                stmt.execute(params![feature_id, weight_name, score])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Scores keyed by feature id, then weight name.
    pub fn load_scores(&self, table: &str) -> Result<AttributeTable, StepError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT feature_id, weight_name, score FROM {}",
            quote_ident(table)
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?;

        let mut scores = AttributeTable::new();
        for row in rows {
            let (feature_id, weight_name, score) = row?;
            scores.entry(feature_id).or_default().insert(weight_name, score);
        }
        Ok(scores)
    }
}

/// Quote an SQLite identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
