//! Configuration loading.
//!
//! - [`types`]: YAML configuration types
//! - [`validate`]: Validation and conversion into runnable settings
//!
//! The main entry points are [`load_configs`] and [`create_server_configs`].

mod types;
mod validate;

pub use types::*;
pub use validate::{ValidatedConfig, create_server_configs};

/// Loads configuration files from the provided paths.
///
/// Reads each file, parses it as YAML, and returns the combined list of configs.
pub async fn load_configs(args: &[String]) -> std::io::Result<Vec<Config>> {
    let mut all_configs = vec![];
    for config_filename in args {
        let config_bytes = tokio::fs::read(config_filename).await.map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Could not read config file {config_filename}: {e}"),
            )
        })?;

        let config_str = String::from_utf8(config_bytes).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Could not parse config file {config_filename} as UTF8: {e}"),
            )
        })?;

        let mut configs = serde_yaml::from_str::<Vec<Config>>(&config_str).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Could not parse config file {config_filename} as config YAML: {e}"),
            )
        })?;
        all_configs.append(&mut configs)
    }
    Ok(all_configs)
}
