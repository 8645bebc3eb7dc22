use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::store::policy::HistoryPolicy;

const LOCAL_CONFIG: &str = ".localhist.toml";
const DATA_DIR: &str = ".localhist";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub policy: HistoryPolicy,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub enabled: bool,
    pub db_path: Option<String>,
    pub blob_path: Option<String>,
    /// zstd level for stored blobs; `None` stores them uncompressed.
    pub compression_level: Option<i32>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct WatcherConfig {
    pub ignore_patterns: Vec<String>,
    /// Seconds of inactivity between cleanup sweeps.
    pub clean_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: None,
            blob_path: None,
            compression_level: Some(3),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            ignore_patterns: vec![
                r"(^|/)\.git(/|$)".to_string(),
                r"(^|/)target(/|$)".to_string(),
                r"(^|/)\.localhist(/|$)".to_string(),
            ],
            clean_interval_secs: 60 * 60,
        }
    }
}

impl StoreConfig {
    pub fn db_path(&self, workspace: &Path) -> PathBuf {
        match &self.db_path {
            Some(p) => workspace.join(p),
            None => workspace.join(DATA_DIR).join("buckets"),
        }
    }

    pub fn blob_path(&self, workspace: &Path) -> PathBuf {
        match &self.blob_path {
            Some(p) => workspace.join(p),
            None => workspace.join(DATA_DIR).join("blobs"),
        }
    }
}

impl Config {
    /// Defaults, overridden by the global config file, then merged with the
    /// workspace's local overrides.
    pub fn load(workspace: &Path) -> Result<Self> {
        let mut config = Config::default();

        // 1. Global Config (~/.config/localhist/config.toml)
        if let Some(config_dir) = dirs::config_dir() {
            let global_path = config_dir.join("localhist/config.toml");
            if global_path.exists() {
                let content = fs::read_to_string(&global_path)?;
                match toml::from_str::<Config>(&content) {
                    Ok(global) => config = global,
                    Err(e) => log::warn!("Ignoring {}: {}", global_path.display(), e),
                }
            }
        }

        // 2. Local Config (<workspace>/.localhist.toml)
        let local_path = workspace.join(LOCAL_CONFIG);
        if local_path.exists() {
            let content = fs::read_to_string(&local_path)?;
            config.merge_str(&content)?;
        }

        Ok(config)
    }

    /// Applies a partial TOML document on top of this config. Ignore
    /// patterns accumulate; everything else replaces.
    pub fn merge_str(&mut self, content: &str) -> Result<()> {
        #[derive(Deserialize)]
        struct PartialConfig {
            policy: Option<PartialPolicy>,
            store: Option<PartialStore>,
            watcher: Option<PartialWatcher>,
        }
        #[derive(Deserialize)]
        struct PartialPolicy {
            file_state_longevity_secs: Option<u64>,
            max_file_states: Option<usize>,
            max_file_state_size: Option<u64>,
        }
        #[derive(Deserialize)]
        struct PartialStore {
            enabled: Option<bool>,
            db_path: Option<String>,
            blob_path: Option<String>,
            compression_level: Option<i32>,
        }
        #[derive(Deserialize)]
        struct PartialWatcher {
            ignore_patterns: Option<Vec<String>>,
            clean_interval_secs: Option<u64>,
        }

        let partial: PartialConfig = toml::from_str(content)?;
        if let Some(p) = partial.policy {
            if let Some(v) = p.file_state_longevity_secs {
                self.policy.file_state_longevity_secs = v;
            }
            if let Some(v) = p.max_file_states {
                self.policy.max_file_states = v;
            }
            if let Some(v) = p.max_file_state_size {
                self.policy.max_file_state_size = v;
            }
        }
        if let Some(s) = partial.store {
            if let Some(enabled) = s.enabled {
                self.store.enabled = enabled;
            }
            if let Some(path) = s.db_path {
                self.store.db_path = Some(path);
            }
            if let Some(path) = s.blob_path {
                self.store.blob_path = Some(path);
            }
            if let Some(level) = s.compression_level {
                self.store.compression_level = Some(level);
            }
        }
        if let Some(w) = partial.watcher {
            if let Some(patterns) = w.ignore_patterns {
                self.watcher.ignore_patterns.extend(patterns);
                self.watcher.ignore_patterns.sort();
                self.watcher.ignore_patterns.dedup();
            }
            if let Some(secs) = w.clean_interval_secs {
                self.watcher.clean_interval_secs = secs;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_override() {
        let mut config = Config::default();
        config
            .merge_str(
                r#"
                [policy]
                max_file_states = 5

                [watcher]
                ignore_patterns = ["\\.tmp$"]
                "#,
            )
            .unwrap();

        assert_eq!(config.policy.max_file_states, 5);
        assert_eq!(
            config.policy.max_file_state_size,
            HistoryPolicy::default().max_file_state_size
        );
        assert!(config.watcher.ignore_patterns.iter().any(|p| p == r"\.tmp$"));
        assert_eq!(config.watcher.ignore_patterns.len(), 4);
    }

    #[test]
    fn test_default_locations() {
        let store = StoreConfig::default();
        let ws = Path::new("/work");
        assert_eq!(store.db_path(ws), PathBuf::from("/work/.localhist/buckets"));
        assert_eq!(store.blob_path(ws), PathBuf::from("/work/.localhist/blobs"));
    }

    #[test]
    fn test_bad_local_config_is_an_error() {
        let mut config = Config::default();
        assert!(config.merge_str("[policy]\nmax_file_states = \"many\"").is_err());
    }

    #[test]
    fn test_load_reads_workspace_file() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(
            dir.path().join(LOCAL_CONFIG),
            "[store]\ncompression_level = 9\n",
        )
        .unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.store.compression_level, Some(9));
    }
}
