//! Configuration loading from `meshbus.toml` with defaults.

use meshbus_types::BusConfig;
use std::path::{Path, PathBuf};
use tracing::info;

/// Config file used when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "meshbus.toml";

/// Load node configuration from a TOML file, with defaults.
///
/// A missing, unreadable, or invalid file yields the defaults; problems are
/// logged, never returned.
pub fn load_config(path: Option<&Path>) -> BusConfig {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return BusConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<BusConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                BusConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            BusConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_missing_file() {
        let config = load_config(Some(Path::new("/nonexistent/meshbus.toml")));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.command_port, 55200);
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            address = "10.1.2.3"
            command_port = 6000
            seeds = ["10.1.2.4:6000:6001"]

            [connection]
            max_connect_attempts = 5
            "#
        )
        .unwrap();

        let config = load_config(Some(file.path()));
        assert_eq!(config.address.to_string(), "10.1.2.3");
        assert_eq!(config.command_port, 6000);
        assert_eq!(config.data_port, 55201);
        assert_eq!(config.seeds.len(), 1);
        assert_eq!(config.connection.max_connect_attempts, 5);
        assert_eq!(config.connection.retry_interval_ms, 2000);
    }

    #[test]
    fn test_load_config_invalid_falls_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "command_port = \"not a port\"").unwrap();
        let config = load_config(Some(file.path()));
        assert_eq!(config.command_port, 55200);
    }
}
