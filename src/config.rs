use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::downloader::{SyncMode, SyncOptions};
use crate::error::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "rdw-dashboard.json";

/// Tool settings. Every field has a default, so a partial JSON file (or
/// none at all) is valid.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub base_url: String,
    pub metadata_file: String,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub workers: usize,
    pub sequential: bool,
    pub progress_step_percent: f64,
    pub connect_timeout_secs: u64,
    /// Hard ceiling on rows returned by any query.
    pub result_limit: usize,
    /// SQLite file, relative to `data_dir`, holding the loaded datasets.
    pub database_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            base_url: "https://opendata.rdw.nl".to_string(),
            metadata_file: "download_metadata.json".to_string(),
            max_attempts: 3,
            retry_backoff_ms: 2000,
            workers: 3,
            sequential: false,
            progress_step_percent: 5.0,
            connect_timeout_secs: 30,
            result_limit: 10_000,
            database_file: "rdw-dashboard.sqlite".to_string(),
        }
    }
}

impl Config {
    /// Loads `path`, or `rdw-dashboard.json` from the working directory when
    /// no path is given. Only the implicit file may be absent.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let content = match tokio::fs::read_to_string(&config_path).await {
            Ok(content) => content,
            Err(e) if path.is_none() && e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: config_path,
                    source,
                })
            }
        };
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join(&self.metadata_file)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn sync_mode(&self) -> SyncMode {
        if self.sequential {
            SyncMode::Sequential
        } else {
            SyncMode::Parallel {
                workers: self.workers.max(1),
            }
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            data_dir: self.data_dir.clone(),
            base_url: self.base_url.clone(),
            max_attempts: self.max_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            progress_step_percent: self.progress_step_percent,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            force: false,
        }
    }
}
