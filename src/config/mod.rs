mod schema;

pub use schema::*;

use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Locations searched by [`load_first`], in order
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["config/mysqlwire.toml", "mysqlwire.toml"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    Ok(config)
}

/// Load the first readable config file, falling back to defaults.
///
/// A file that exists but fails to parse is an error; missing files are
/// skipped.
pub fn load_first(paths: &[&str]) -> Result<Config, ConfigError> {
    for path in paths {
        match load_config(path) {
            Ok(config) => {
                info!(path = %path, "Loaded configuration");
                return Ok(config);
            }
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path, "Config file not found");
            }
            Err(e) => return Err(e),
        }
    }

    info!("Using default configuration");
    Ok(Config::default())
}
