pub mod helpers;
pub mod registry;

use async_trait::async_trait;
use evochora_error::EvochoraError;
use figment::providers::{Env, Format, Yaml};
use registry::Registry;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config error: {0}")]
    ConfigError(#[from] figment::Error),
}

impl EvochoraError for ConfigError {
    fn code(&self) -> evochora_error::ErrorCodes {
        evochora_error::ErrorCodes::Internal
    }
}

/// Built from parsed configuration. Components implement this instead of
/// ad-hoc constructors so wiring is uniform: parse the file once, then
/// construct each component against the registry of already-built shared
/// resources (pools, storage, topics).
#[async_trait]
pub trait Configurable<T, E = Box<dyn EvochoraError>> {
    async fn try_from_config(config: &T, registry: &Registry) -> Result<Self, E>
    where
        Self: Sized;
}

/// Extract a typed config from a YAML file merged with prefixed environment
/// variables. The file's `section` key is focused over the top level so one
/// file can configure several services; env wins over the file. Env keys
/// use `__` for nesting, since variable names cannot carry dots. A missing
/// file is not an error: the env alone may be a complete config.
pub fn load_config<T: DeserializeOwned>(
    path: &str,
    section: &str,
    env_prefix: &str,
) -> Result<T, ConfigError> {
    let env = figment::Figment::from(
        Env::prefixed(env_prefix).map(|key| key.as_str().replace("__", ".").into()),
    );
    let merged = if std::path::Path::new(path).exists() {
        let yaml = figment::Figment::from(Yaml::file(path));
        yaml.clone().merge(yaml.focus(section)).merge(env)
    } else {
        env
    };
    Ok(merged.extract()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Deserialize)]
    struct DemoConfig {
        run_id: String,
        #[serde(default)]
        max_retries: u32,
    }

    #[test]
    fn section_overlays_top_level_and_env_wins() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "pipeline.yaml",
                r#"
run_id: from-top-level
indexer:
  max_retries: 3
"#,
            )?;
            jail.set_env("EVO_TEST_RUN_ID", "from-env");

            let config: DemoConfig = load_config("pipeline.yaml", "indexer", "EVO_TEST_")
                .expect("config must load");
            assert_eq!(config.run_id, "from-env");
            assert_eq!(config.max_retries, 3);
            Ok(())
        });
    }

    #[test]
    fn missing_file_falls_back_to_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("EVO_TEST_RUN_ID", "env-only");
            let config: DemoConfig = load_config("does-not-exist.yaml", "indexer", "EVO_TEST_")
                .expect("config must load");
            assert_eq!(config.run_id, "env-only");
            assert_eq!(config.max_retries, 0);
            Ok(())
        });
    }
}
