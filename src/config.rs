//! Configuration loaded from `~/.leadflow/config.json`.
//!
//! Every field has a serde default, so a partial (or missing) file yields a
//! usable config.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::pipeline::{Stage, StagePipeline};
use crate::store::{JsonFileStore, KeyValueStore, MemoryStore, SqliteStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    Json,
    Sqlite,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Memory => "memory",
            StorageBackend::Json => "json",
            StorageBackend::Sqlite => "sqlite",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BulkConfig {
    /// Records committed per backend step.
    pub chunk_size: usize,
    /// Simulated latency per step, in milliseconds.
    pub step_delay_ms: u64,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 50,
            step_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InsightConfig {
    /// Upper bound on records sent to the provider per batch.
    pub max_batch: usize,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self { max_batch: 25 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub tenant_id: String,
    pub storage: StorageBackend,
    /// Defaults to `~/.leadflow/data`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Custom pipeline stages. `None` uses the built-in six.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stages: Option<Vec<Stage>>,
    pub bulk: BulkConfig,
    pub insights: InsightConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tenant_id: "default".to_string(),
            storage: StorageBackend::default(),
            data_dir: None,
            stages: None,
            bulk: BulkConfig::default(),
            insights: InsightConfig::default(),
        }
    }
}

impl Config {
    /// Validated pipeline for the configured stages.
    pub fn pipeline(&self) -> Result<StagePipeline, String> {
        match &self.stages {
            Some(stages) => StagePipeline::new(stages.clone())
                .map_err(|e| format!("Invalid stages in config: {}", e)),
            None => Ok(StagePipeline::default_stages()),
        }
    }

    pub fn data_dir(&self) -> Result<PathBuf, String> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(leadflow_dir()?.join("data")),
        }
    }

    /// Open the configured storage backend.
    pub fn open_store(&self) -> Result<Arc<dyn KeyValueStore>, String> {
        let store: Arc<dyn KeyValueStore> = match self.storage {
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            StorageBackend::Json => Arc::new(
                JsonFileStore::open(&self.data_dir()?)
                    .map_err(|e| format!("Failed to open JSON store: {}", e))?,
            ),
            StorageBackend::Sqlite => Arc::new(
                SqliteStore::open(&self.data_dir()?.join("leadflow.db"))
                    .map_err(|e| format!("Failed to open SQLite store: {}", e))?,
            ),
        };
        log::info!("Using {} storage for tenant '{}'", self.storage.as_str(), self.tenant_id);
        Ok(store)
    }
}

fn leadflow_dir() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or("Could not find home directory")?;
    Ok(home.join(".leadflow"))
}

pub fn config_path() -> Result<PathBuf, String> {
    Ok(leadflow_dir()?.join("config.json"))
}

/// Load config from `path`. A missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<Config, String> {
    if !path.exists() {
        log::debug!("No config at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    let content =
        fs::read_to_string(path).map_err(|e| format!("Failed to read config: {}", e))?;
    let config: Config =
        serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))?;
    // Surface bad stages at load time, not on first use.
    config.pipeline()?;
    Ok(config)
}

pub fn load_config() -> Result<Config, String> {
    load_config_from(&config_path()?)
}

/// Write config to `path`, creating the parent directory.
pub fn save_config_to(path: &Path, config: &Config) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config dir: {}", e))?;
        }
    }
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    fs::write(path, content).map_err(|e| format!("Failed to write config: {}", e))
}

pub fn save_config(config: &Config) -> Result<(), String> {
    save_config_to(&config_path()?, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let config = load_config_from(&dir.path().join("config.json")).expect("load");
        assert_eq!(config, Config::default());
        assert_eq!(config.storage, StorageBackend::Json);
        assert_eq!(config.bulk.chunk_size, 50);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"tenantId": "Acme Corp", "storage": "sqlite", "bulk": {"stepDelayMs": 5}}"#)
            .expect("write");
        let config = load_config_from(&path).expect("load");
        assert_eq!(config.tenant_id, "Acme Corp");
        assert_eq!(config.storage, StorageBackend::Sqlite);
        assert_eq!(config.bulk.step_delay_ms, 5);
        assert_eq!(config.bulk.chunk_size, 50);
        assert_eq!(config.insights.max_batch, 25);
    }

    #[test]
    fn test_invalid_stages_rejected_at_load() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"stages": [{"id": "a", "name": "A", "rank": 1, "probability": 10},
                           {"id": "a", "name": "B", "rank": 2, "probability": 20}]}"#,
        )
        .expect("write");
        let err = load_config_from(&path).unwrap_err();
        assert!(err.contains("duplicate stage id"));
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            tenant_id: "globex".to_string(),
            storage: StorageBackend::Memory,
            data_dir: Some(dir.path().join("data")),
            ..Default::default()
        };
        save_config_to(&path, &config).expect("save");
        assert_eq!(load_config_from(&path).expect("load"), config);
    }

    #[test]
    fn test_open_sqlite_store_in_data_dir() {
        let dir = TempDir::new().expect("tempdir");
        let config = Config {
            storage: StorageBackend::Sqlite,
            data_dir: Some(dir.path().join("data")),
            ..Default::default()
        };
        let store = config.open_store().expect("open");
        store.save("default.leads", "[]").expect("save");
        assert!(dir.path().join("data").join("leadflow.db").exists());
    }
}
