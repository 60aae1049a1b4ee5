//! # Flowmem Configuration
//!
//! Layered configuration for the record allocator, pool manager and
//! instance directory sizing, plus telemetry settings.
//!
//! ## Features
//! - **Layering**: defaults, then YAML files, then `FLOWMEM_*` environment variables
//! - **Validation**: every sizing bound is checked after extraction

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use validator::Validate;

mod directory;
mod error;
mod pool;
mod record;
mod telemetry;
mod validation;

pub use directory::DirectoryConfig;
pub use error::ConfigError;
pub use pool::PoolConfig;
pub use record::{RecordConfig, MAX_RECORDS};
pub use telemetry::TelemetryConfig;

const BASE_FILE: &str = "config/flowmem.yaml";
const ENV_PREFIX: &str = "FLOWMEM_";

/// Top-level configuration container.
#[derive(Debug, Serialize, Deserialize, Validate, Default, Clone, PartialEq, Eq)]
pub struct FlowmemConfig {
    /// Record allocator geometry.
    #[serde(default)]
    #[validate(nested)]
    pub record: RecordConfig,

    #[serde(default)]
    #[validate(nested)]
    pub pool: PoolConfig,

    #[serde(default)]
    #[validate(nested)]
    pub directory: DirectoryConfig,

    #[serde(default)]
    #[validate(nested)]
    pub telemetry: TelemetryConfig,
}

impl FlowmemConfig {
    /// Load configuration from default files and environment.
    ///
    /// Hierarchy:
    /// 1. Default values
    /// 2. `config/flowmem.yaml`, skipped when missing
    /// 3. `config/<FLOWMEM_ENV>.yaml` (default `production`)
    /// 4. `FLOWMEM_*` environment variables, nested with `__`
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(FlowmemConfig::default()));

        if Path::new(BASE_FILE).exists() {
            figment = figment.merge(Yaml::file(BASE_FILE));
        } else {
            debug!("{} not found, using default configuration", BASE_FILE);
        }

        let env = std::env::var("FLOWMEM_ENV").unwrap_or_else(|_| "production".into());
        let env_file = format!("config/{}.yaml", env);
        if Path::new(&env_file).exists() {
            figment = figment.merge(Yaml::file(env_file));
        }

        Self::finish(figment)
    }

    /// Load configuration from a specific file layered over the defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(PathBuf::from(path)));
        }

        let figment =
            Figment::from(Serialized::defaults(FlowmemConfig::default())).merge(Yaml::file(path));
        Self::finish(figment)
    }

    fn finish(figment: Figment) -> Result<Self, ConfigError> {
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(ConfigError::from)
            .and_then(|config: Self| {
                config.validate()?;
                Ok(config)
            })
    }
}
