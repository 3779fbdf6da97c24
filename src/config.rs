//! Configuration module with appData support

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for per-task output directories
    pub output_base: PathBuf,
    /// Directory for rotating application log files
    pub log_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8484,
            },
            storage: StorageConfig {
                output_base: PathBuf::from("strm_output"),
                log_dir: get_appdata_dir().join("logs"),
            },
        }
    }
}

/// Get the appData directory path
/// Priority: STRMGEN_APPDATA_DIR env var > ./appData
pub fn get_appdata_dir() -> PathBuf {
    env::var("STRMGEN_APPDATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./appData"))
}

/// Get the config file path with fallback
/// Tries: appData/config/config.toml -> config.toml (old location)
pub fn get_config_path() -> PathBuf {
    let appdata_config = get_appdata_dir().join("config/config.toml");
    if appdata_config.exists() {
        appdata_config
    } else {
        PathBuf::from("config.toml")
    }
}

/// Get the database file path
/// Always uses: appData/data/strmgen.db (creates directory if needed)
pub fn get_db_path() -> PathBuf {
    let appdata_dir = get_appdata_dir();
    let data_dir = appdata_dir.join("data");

    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir).ok();
    }

    data_dir.join("strmgen.db")
}

/// Create appData directory structure if it doesn't exist
pub fn ensure_appdata_dirs() -> std::io::Result<()> {
    let appdata_dir = get_appdata_dir();

    std::fs::create_dir_all(appdata_dir.join("config"))?;
    std::fs::create_dir_all(appdata_dir.join("data"))?;
    std::fs::create_dir_all(appdata_dir.join("logs"))?;

    Ok(())
}
