use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Server configuration, loaded from a JSON file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    pub data_folder: PathBuf,
    /// Default push gateway; an empty string disables push entirely.
    #[serde(default)]
    pub notification_server: String,
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Unlocks `GET /admin/reset`.
    #[serde(default)]
    pub development: bool,
    #[serde(default)]
    pub static_files: Option<PathBuf>,
}

fn default_bind() -> SocketAddr {
    ([0, 0, 0, 0], 8080).into()
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config '{}': {e}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("cannot parse config '{}': {e}", path.display()))?;
        Ok(config)
    }
}
