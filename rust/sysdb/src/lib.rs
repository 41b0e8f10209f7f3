//! Per-run metadata store: one key/value table per simulation run, holding
//! the canonical JSON of the run's `SimulationMetadata` under the
//! `full_metadata` key.

use async_trait::async_trait;
use evochora_config::{
    registry::{Injectable, Registry},
    Configurable,
};
use evochora_error::{ErrorCodes, EvochoraError, WrappedSqlxError};
use evochora_metrics::{Capabilities, UsageType};
use evochora_sqlite::{SqliteDBConfig, SqliteDb};
use evochora_types::{RunId, SimulationMetadata};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use thiserror::Error;

pub const FULL_METADATA_KEY: &str = "full_metadata";

#[derive(Error, Debug)]
pub enum SysDbError {
    #[error("Query error: {0}")]
    QueryError(#[from] WrappedSqlxError),
    #[error("Failed to encode metadata: {0}")]
    InvalidMetadata(#[from] serde_json::Error),
}

impl EvochoraError for SysDbError {
    fn code(&self) -> ErrorCodes {
        match self {
            SysDbError::QueryError(err) => err.code(),
            SysDbError::InvalidMetadata(_) => ErrorCodes::InvalidArgument,
        }
    }
}

#[derive(Deserialize, Clone, Serialize, Debug)]
pub struct SysDbConfig {
    pub db: SqliteDBConfig,
}

//////////////////////////////////////////// SqliteSysDb ///////////////////////////////////////////

#[derive(Clone, Debug)]
pub struct SysDb {
    db: SqliteDb,
}

impl SysDb {
    pub fn new(db: SqliteDb) -> SysDb {
        SysDb { db }
    }

    /// SQLite has no schemas, so the per-run schema `SIM_<sanitized>`
    /// becomes a table-name prefix. The sanitized run id is uppercase
    /// alphanumerics and underscores only, safe to interpolate.
    fn table_name(run_id: &RunId) -> String {
        format!("SIM_{}_metadata", run_id.sanitized())
    }

    pub async fn put_metadata(
        &self,
        run_id: &RunId,
        metadata: &SimulationMetadata,
    ) -> Result<(), SysDbError> {
        let table = SysDb::table_name(run_id);
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (key VARCHAR PRIMARY KEY, value TEXT)",
            table
        ))
        .execute(self.db.get_conn())
        .await
        .map_err(WrappedSqlxError)?;
        let json = metadata.to_canonical_json()?;
        sqlx::query(&format!(
            "INSERT INTO \"{}\" (key, value) VALUES (?, ?) ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            table
        ))
        .bind(FULL_METADATA_KEY)
        .bind(json)
        .execute(self.db.get_conn())
        .await
        .map_err(WrappedSqlxError)?;
        tracing::debug!(run_id = %run_id, "stored run metadata");
        Ok(())
    }

    /// `None` while the simulation has not yet published its metadata; the
    /// indexer polls on this during startup.
    pub async fn get_metadata(
        &self,
        run_id: &RunId,
    ) -> Result<Option<SimulationMetadata>, SysDbError> {
        let table = SysDb::table_name(run_id);
        let row = sqlx::query(&format!(
            "SELECT value FROM \"{}\" WHERE key = ?",
            table
        ))
        .bind(FULL_METADATA_KEY)
        .fetch_optional(self.db.get_conn())
        .await;
        let row = match row {
            Ok(row) => row,
            // The table itself does not exist until the first put.
            Err(sqlx::Error::Database(err)) if err.message().contains("no such table") => {
                return Ok(None)
            }
            Err(err) => return Err(WrappedSqlxError(err).into()),
        };
        match row {
            Some(row) => {
                let json: String = row.get("value");
                Ok(Some(SimulationMetadata::from_json(&json)?))
            }
            None => Ok(None),
        }
    }

    /// Run ids with stored metadata, ascending (run ids sort by start time).
    pub async fn list_runs(&self) -> Result<Vec<String>, SysDbError> {
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'SIM_%_metadata' ORDER BY name",
        )
        .fetch_all(self.db.get_conn())
        .await
        .map_err(WrappedSqlxError)?;
        let mut runs = Vec::new();
        for row in rows {
            let table: String = row.get("name");
            let value = sqlx::query(&format!("SELECT value FROM \"{}\" WHERE key = ?", table))
                .bind(FULL_METADATA_KEY)
                .fetch_optional(self.db.get_conn())
                .await
                .map_err(WrappedSqlxError)?;
            if let Some(row) = value {
                let json: String = row.get("value");
                match SimulationMetadata::from_json(&json) {
                    Ok(metadata) => runs.push(metadata.simulation_run_id),
                    Err(err) => {
                        tracing::warn!(%table, %err, "skipping unreadable run metadata")
                    }
                }
            }
        }
        runs.sort();
        Ok(runs)
    }
}

impl Injectable for SysDb {}

impl Capabilities for SysDb {
    fn resource_name(&self) -> &str {
        "sysdb"
    }

    fn supported_usages(&self) -> &'static [UsageType] {
        &[UsageType::DbMetaRead, UsageType::DbMetaWrite]
    }
}

#[async_trait]
impl Configurable<SysDbConfig> for SysDb {
    async fn try_from_config(
        config: &SysDbConfig,
        registry: &Registry,
    ) -> Result<Self, Box<dyn EvochoraError>> {
        let db = match registry.get::<SqliteDb>() {
            Ok(db) => db,
            Err(_) => {
                let db = SqliteDb::try_from_config(&config.db, registry).await?;
                registry.register(db.clone());
                db
            }
        };
        Ok(SysDb::new(db))
    }
}

//////////////////////// Tests ////////////////////////
#[cfg(test)]
mod tests {
    use super::*;

    const RUN_ID: &str = "20240301-09300000-0f0e0d0c-0b0a-0908-0706-050403020100";

    fn metadata(run_id: &str, seed: i64) -> SimulationMetadata {
        SimulationMetadata {
            simulation_run_id: run_id.to_string(),
            resolved_config_json: r#"{"environment":{"shape":[32,32],"topology":"torus"}}"#
                .to_string(),
            start_time_ms: 1_709_285_400_000,
            initial_seed: seed,
            sampling_interval: 10,
        }
    }

    #[tokio::test]
    async fn metadata_round_trips() {
        let sysdb = SysDb::new(SqliteDb::new_test_db().await);
        let run_id = RunId::new(RUN_ID).unwrap();
        assert_eq!(sysdb.get_metadata(&run_id).await.unwrap(), None);

        let metadata = metadata(RUN_ID, 42);
        sysdb.put_metadata(&run_id, &metadata).await.unwrap();
        assert_eq!(sysdb.get_metadata(&run_id).await.unwrap(), Some(metadata));
    }

    #[tokio::test]
    async fn put_is_idempotent_and_overwrites() {
        let sysdb = SysDb::new(SqliteDb::new_test_db().await);
        let run_id = RunId::new(RUN_ID).unwrap();
        sysdb.put_metadata(&run_id, &metadata(RUN_ID, 1)).await.unwrap();
        sysdb.put_metadata(&run_id, &metadata(RUN_ID, 2)).await.unwrap();
        let stored = sysdb.get_metadata(&run_id).await.unwrap().unwrap();
        assert_eq!(stored.initial_seed, 2);
    }

    #[tokio::test]
    async fn list_runs_returns_original_run_ids() {
        let sysdb = SysDb::new(SqliteDb::new_test_db().await);
        let second = "20240302-09300000-0f0e0d0c-0b0a-0908-0706-050403020100";
        for run in [RUN_ID, second] {
            let run_id = RunId::new(run).unwrap();
            sysdb.put_metadata(&run_id, &metadata(run, 7)).await.unwrap();
        }
        assert_eq!(
            sysdb.list_runs().await.unwrap(),
            vec![RUN_ID.to_string(), second.to_string()]
        );
    }
}
