use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SqliteDBConfig {
    /// Path of the database file, or `:memory:` for an in-process database.
    pub url: String,
    #[serde(default = "SqliteDBConfig::default_create_if_missing")]
    pub create_if_missing: bool,
}

impl SqliteDBConfig {
    fn default_create_if_missing() -> bool {
        true
    }

    pub fn in_memory() -> SqliteDBConfig {
        SqliteDBConfig {
            url: ":memory:".to_string(),
            create_if_missing: true,
        }
    }
}
