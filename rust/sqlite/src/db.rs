use crate::config::SqliteDBConfig;
use async_trait::async_trait;
use evochora_config::{
    registry::{Injectable, Registry},
    Configurable,
};
use evochora_error::{ErrorCodes, EvochoraError, WrappedSqlxError};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone)]
/// A wrapper around a SQLite connection pool.
/// ## Notes:
/// - Clone safety: all clones share the same pool; the pool is Send/Sync.
/// - The pool is capped at one connection so that claim transactions
///   serialize; competing consumers rely on this for exactly-one delivery.
pub struct SqliteDb {
    conn: SqlitePool,
}

#[derive(Error, Debug)]
pub enum SqliteCreationError {
    #[error("Invalid database url '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    ConnectError(#[from] WrappedSqlxError),
}

impl EvochoraError for SqliteCreationError {
    fn code(&self) -> ErrorCodes {
        match self {
            SqliteCreationError::InvalidUrl { .. } => ErrorCodes::InvalidArgument,
            SqliteCreationError::ConnectError(err) => err.code(),
        }
    }
}

impl SqliteDb {
    pub async fn open(config: &SqliteDBConfig) -> Result<SqliteDb, SqliteCreationError> {
        let options = if config.url == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(|source| {
                SqliteCreationError::InvalidUrl {
                    url: config.url.clone(),
                    source,
                }
            })?
        } else {
            SqliteConnectOptions::new()
                .filename(&config.url)
                .create_if_missing(config.create_if_missing)
        };
        let conn = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(WrappedSqlxError)?;
        Ok(SqliteDb { conn })
    }

    pub async fn new_test_db() -> SqliteDb {
        SqliteDb::open(&SqliteDBConfig::in_memory())
            .await
            .expect("in-memory sqlite must open")
    }

    pub fn get_conn(&self) -> &SqlitePool {
        &self.conn
    }
}

impl Injectable for SqliteDb {}

#[async_trait]
impl Configurable<SqliteDBConfig> for SqliteDb {
    async fn try_from_config(
        config: &SqliteDBConfig,
        _registry: &Registry,
    ) -> Result<Self, Box<dyn EvochoraError>> {
        SqliteDb::open(config).await.map_err(|err| err.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    #[tokio::test]
    async fn in_memory_db_executes_queries() {
        let db = SqliteDb::new_test_db().await;
        sqlx::query("CREATE TABLE t (v INTEGER)")
            .execute(db.get_conn())
            .await
            .unwrap();
        sqlx::query("INSERT INTO t (v) VALUES (41), (1)")
            .execute(db.get_conn())
            .await
            .unwrap();
        let row = sqlx::query("SELECT SUM(v) AS total FROM t")
            .fetch_one(db.get_conn())
            .await
            .unwrap();
        let total: i64 = row.get("total");
        assert_eq!(total, 42);
    }

    #[tokio::test]
    async fn file_backed_db_is_created_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let config = SqliteDBConfig {
            url: dir.path().join("pipeline.sqlite3").display().to_string(),
            create_if_missing: true,
        };
        let db = SqliteDb::open(&config).await.unwrap();
        sqlx::query("CREATE TABLE t (v INTEGER)")
            .execute(db.get_conn())
            .await
            .unwrap();
        assert!(dir.path().join("pipeline.sqlite3").exists());
    }
}
