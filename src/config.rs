//! Configuration loading
//!
//! Sources, lowest precedence first:
//! 1. built-in defaults
//! 2. TOML file (`replica-router.toml`, `--config`, or `REPLICA_ROUTER_CONFIG_PATH`)
//! 3. environment variables, e.g. `REPLICA_ROUTER_DATASOURCE__READ__HOST`
//! 4. explicit overrides
//!
//! A `.env` file in the working directory is loaded before anything else.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::pool::PoolSettings;
use crate::routing::TargetKey;

pub const ENV_PREFIX: &str = "REPLICA_ROUTER";
pub const CONFIG_PATH_ENV: &str = "REPLICA_ROUTER_CONFIG_PATH";
pub const DEFAULT_CONFIG_FILE: &str = "replica-router.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub datasource: DatasourceConfig,
    pub routing: RoutingConfig,
}

/// One settings namespace per routing target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasourceConfig {
    pub read: PoolSettings,
    pub write: PoolSettings,
}

impl DatasourceConfig {
    pub fn settings(&self, target: TargetKey) -> &PoolSettings {
        match target {
            TargetKey::Read => &self.read,
            TargetKey::Write => &self.write,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub lenient_fallback: bool,
    pub default_target: TargetKey,
    /// Targets that get a pool. Leaving one out only works with lenient fallback.
    pub targets: Vec<TargetKey>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            lenient_fallback: false,
            default_target: TargetKey::Write,
            targets: vec![TargetKey::Write, TargetKey::Read],
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load from the default file, environment and `.env`
    pub fn load() -> Result<Self> {
        Self::builder().build()
    }

    /// The configuration with every password replaced
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        config.datasource.read.password = "***".to_string();
        config.datasource.write.password = "***".to_string();
        config
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_path: Option<PathBuf>,
    overrides: Vec<(String, String)>,
    skip_env: bool,
}

impl ConfigBuilder {
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// Set a single key, e.g. `datasource.read.host`, above every other source
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((key.into(), value.into()));
        self
    }

    /// Ignore `.env` and process environment variables
    pub fn without_env(mut self) -> Self {
        self.skip_env = true;
        self
    }

    pub fn build(self) -> Result<Config> {
        if !self.skip_env {
            dotenvy::dotenv().ok();
        }

        let mut builder = config::Config::builder()
            .set_default("datasource.read.pool_name", "read")?
            .set_default("datasource.write.pool_name", "write")?;

        let env_path = if self.skip_env {
            None
        } else {
            std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from)
        };

        match self.config_path.or(env_path) {
            Some(path) => {
                debug!(path = %path.display(), "loading configuration file");
                builder = builder.add_source(
                    config::File::from(path).format(config::FileFormat::Toml),
                );
            }
            None => {
                builder = builder.add_source(
                    config::File::with_name(DEFAULT_CONFIG_FILE)
                        .format(config::FileFormat::Toml)
                        .required(false),
                );
            }
        }

        if !self.skip_env {
            builder = builder.add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("routing.targets"),
            );
        }

        for (key, value) in self.overrides {
            builder = builder.set_override(key, value)?;
        }

        let source = builder.build()?;

        let routing = match source.get::<RoutingConfig>("routing") {
            Ok(routing) => routing,
            Err(config::ConfigError::NotFound(_)) => RoutingConfig::default(),
            Err(err) => return Err(err.into()),
        };

        Ok(Config {
            datasource: DatasourceConfig {
                read: PoolSettings::from_config(&source, "datasource.read")?,
                write: PoolSettings::from_config(&source, "datasource.write")?,
            },
            routing,
        })
    }
}
