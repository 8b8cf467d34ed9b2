/// Configuration for the Lanes backend.
/// Reads lanes.json from $LANES_CONFIG or ~/.config/lanes/lanes.json (or platform equivalent).
use lanes_core::config::EngineConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "LANES_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Directory holding one `<board_id>.json` per board.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lanes")
        .join("boards")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            data_dir: default_data_dir(),
            engine: EngineConfig::default(),
        }
    }
}

/// `$LANES_CONFIG` if set, else ~/.config/lanes/lanes.json
pub fn default_config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lanes")
        .join("lanes.json")
}

/// Load config from path. Returns default if the file is missing or malformed.
pub fn load_config(path: &Path) -> ServerConfig {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            log::warn!(target: "lanes.config", "Failed to parse config {}: {}", path.display(), e);
            ServerConfig::default()
        }),
        Err(_) => {
            log::info!(target: "lanes.config", "No config at {}, using defaults", path.display());
            ServerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.json"));
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind_address, "127.0.0.1");
    }

    #[test]
    fn test_partial_file_keeps_defaults_for_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lanes.json");
        fs::write(
            &path,
            r#"{ "port": 9191, "dataDir": "/srv/lanes", "engine": { "lockWaitMs": 200 } }"#,
        )
        .unwrap();

        let config = load_config(&path);
        assert_eq!(config.port, 9191);
        assert_eq!(config.data_dir, PathBuf::from("/srv/lanes"));
        assert_eq!(config.engine.lock_wait_ms, 200);
        assert_eq!(config.engine.persist_timeout_ms, 5_000);
        assert_eq!(config.bind_address, "127.0.0.1");
    }

    #[test]
    fn test_malformed_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lanes.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_config(&path).port, 8080);
    }
}
