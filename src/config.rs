//! Process bootstrap configuration: where the kernel keeps its data and
//! which port it listens on. Distinct from the `Settings` document in
//! `store.rs`, which holds user-editable irrigation configuration and is
//! reloaded at runtime — this is read once at process start.

use anyhow::{Context, Result};
use serde::Deserialize;

fn default_data_dir() -> String {
    "/data".to_string()
}

fn default_web_port() -> u16 {
    8080
}

fn default_log_filter() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            web_port: default_web_port(),
            log_filter: default_log_filter(),
        }
    }
}

/// Reads and parses `path`. A missing file is not an error — the kernel
/// runs fine on defaults, same as the factory-default settings document.
/// `IRRIGATION_DATA_DIR`, if set, overrides whatever `data_dir` the file (or
/// the defaults) resolved to, the same env-driven override idiom used for
/// the runner's `CONFIG_PATH` itself.
pub fn load(path: &str) -> Result<Config> {
    let mut config = match std::fs::read_to_string(path) {
        Ok(contents) => {
            toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => return Err(e).context(format!("failed to read config: {path}")),
    };
    if let Ok(data_dir) = std::env::var("IRRIGATION_DATA_DIR") {
        config.data_dir = data_dir;
    }
    Ok(config)
}
