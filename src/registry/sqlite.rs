//! SQLite-backed model registry.

use super::ModelRegistry;
use crate::error::RegistryError;
use crate::types::{Metrics, ModelState, ModelVersion};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS model_versions (
        version TEXT PRIMARY KEY,
        artifact_path TEXT NOT NULL,
        state TEXT NOT NULL,
        metrics_json TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        promoted_at INTEGER
    );
    CREATE UNIQUE INDEX IF NOT EXISTS one_production
        ON model_versions(state) WHERE state = 'production';
";

const COLUMNS: &str = "version, artifact_path, state, metrics_json, created_at, promoted_at";

/// Raw row before state/metrics decoding.
type RawRow = (String, String, String, String, i64, Option<i64>);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode(raw: RawRow) -> Result<ModelVersion, RegistryError> {
    let (version, artifact_path, state, metrics_json, created_at, promoted_at) = raw;
    let state = ModelState::parse(&state)
        .ok_or_else(|| RegistryError::Codec(format!("unknown state '{}' for {}", state, version)))?;
    let metrics: Metrics = serde_json::from_str(&metrics_json)
        .map_err(|e| RegistryError::Codec(format!("metrics for {}: {}", version, e)))?;

    Ok(ModelVersion {
        version,
        artifact_path,
        state,
        metrics,
        created_at: created_at as u64,
        promoted_at: promoted_at.map(|t| t as u64),
    })
}

pub struct SqliteModelRegistry {
    conn: Mutex<Connection>,
}

impl SqliteModelRegistry {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, RegistryError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn query(&self, sql: &str, arg: Option<&str>) -> Result<Vec<ModelVersion>, RegistryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = match arg {
            Some(a) => stmt
                .query_map(params![a], read_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map([], read_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        rows.into_iter().map(decode).collect()
    }

    fn state_of(conn: &Connection, version: &str) -> Result<ModelState, RegistryError> {
        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM model_versions WHERE version = ?1",
                params![version],
                |row| row.get(0),
            )
            .optional()?;
        let state = state.ok_or_else(|| RegistryError::NotFound(version.to_string()))?;
        ModelState::parse(&state)
            .ok_or_else(|| RegistryError::Codec(format!("unknown state '{}'", state)))
    }
}

impl ModelRegistry for SqliteModelRegistry {
    fn register(&self, version: &ModelVersion) -> Result<(), RegistryError> {
        let metrics_json = serde_json::to_string(&version.metrics)
            .map_err(|e| RegistryError::Codec(e.to_string()))?;
        self.conn.lock().execute(
            "INSERT INTO model_versions (version, artifact_path, state, metrics_json, created_at, promoted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                version.version,
                version.artifact_path,
                version.state.as_str(),
                metrics_json,
                version.created_at as i64,
                version.promoted_at.map(|t| t as i64),
            ],
        )?;
        Ok(())
    }

    fn get(&self, version: &str) -> Result<Option<ModelVersion>, RegistryError> {
        let sql = format!("SELECT {} FROM model_versions WHERE version = ?1", COLUMNS);
        Ok(self.query(&sql, Some(version))?.into_iter().next())
    }

    fn production(&self) -> Result<Option<ModelVersion>, RegistryError> {
        let sql = format!("SELECT {} FROM model_versions WHERE state = ?1", COLUMNS);
        Ok(self
            .query(&sql, Some(ModelState::Production.as_str()))?
            .into_iter()
            .next())
    }

    fn list_staging(&self) -> Result<Vec<ModelVersion>, RegistryError> {
        let sql = format!(
            "SELECT {} FROM model_versions WHERE state = ?1 ORDER BY created_at DESC, version DESC",
            COLUMNS
        );
        self.query(&sql, Some(ModelState::Staging.as_str()))
    }

    fn list_all(&self) -> Result<Vec<ModelVersion>, RegistryError> {
        let sql = format!(
            "SELECT {} FROM model_versions ORDER BY created_at DESC, version DESC",
            COLUMNS
        );
        self.query(&sql, None)
    }

    fn mark_production_at(
        &self,
        version: &str,
        promoted_at: u64,
    ) -> Result<Option<String>, RegistryError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        match Self::state_of(&tx, version)? {
            ModelState::Production => return Ok(None),
            ModelState::Archived => {
                return Err(RegistryError::InvalidState {
                    version: version.to_string(),
                    from: ModelState::Archived.to_string(),
                    to: ModelState::Production.to_string(),
                })
            }
            ModelState::Staging => {}
        }

        let previous: Option<String> = tx
            .query_row(
                "SELECT version FROM model_versions WHERE state = 'production'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(prev) = &previous {
            tx.execute(
                "UPDATE model_versions SET state = 'archived' WHERE version = ?1",
                params![prev],
            )?;
        }
        tx.execute(
            "UPDATE model_versions SET state = 'production', promoted_at = ?2 WHERE version = ?1",
            params![version, promoted_at as i64],
        )?;
        tx.commit()?;

        Ok(previous)
    }

    fn mark_archived(&self, version: &str) -> Result<(), RegistryError> {
        let conn = self.conn.lock();
        if Self::state_of(&conn, version)? == ModelState::Archived {
            return Ok(());
        }
        conn.execute(
            "UPDATE model_versions SET state = 'archived' WHERE version = ?1",
            params![version],
        )?;
        Ok(())
    }
}
