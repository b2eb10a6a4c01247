// Configuration management for the meshcast CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/meshcast/config.json
// - Linux: ~/.config/meshcast/config.json
// - Windows: %APPDATA%\meshcast\config.json

use anyhow::{Context, Result};
use meshcast_core::MeshConfig;
use std::path::{Path, PathBuf};

pub struct ConfigFile {
    path: PathBuf,
    pub mesh: MeshConfig,
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

impl ConfigFile {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("meshcast"))
    }

    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load the user's config, creating the default file on first use
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_path()?)
    }

    pub fn load_from(path: PathBuf) -> Result<Self> {
        if path.exists() {
            let mesh = MeshConfig::load(&path)
                .with_context(|| format!("Failed to load config file {}", path.display()))?;
            Ok(Self { path, mesh })
        } else {
            let file = Self {
                path,
                mesh: MeshConfig::default(),
            };
            file.save()?;
            Ok(file)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) -> Result<()> {
        self.mesh
            .save(&self.path)
            .with_context(|| format!("Failed to write config file {}", self.path.display()))
    }

    /// Set a config value. The whole config is validated before it is saved.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.mesh.clone();
        match key {
            "local_name" => updated.local_name = value.to_string(),
            "interests" => updated.interests = split_list(value),
            "groups" => updated.groups = split_list(value),
            "push.threshold" => {
                updated.push.threshold = value.parse().context("Invalid number")?;
            }
            "push.send_interval_ms" => {
                updated.push.send_interval_ms = value.parse().context("Invalid number")?;
            }
            "push.feed_capacity" => {
                updated.push.feed_capacity = value.parse().context("Invalid number")?;
            }
            "push.weights.relevance" => {
                updated.push.weights.relevance = value.parse().context("Invalid number")?;
            }
            "push.weights.replication_density" => {
                updated.push.weights.replication_density =
                    value.parse().context("Invalid number")?;
            }
            "push.weights.quality" => {
                updated.push.weights.quality = value.parse().context("Invalid number")?;
            }
            "adapters.bluetooth" => {
                updated.adapters.bluetooth = value.parse().context("Invalid boolean value")?;
            }
            "adapters.wifi" => {
                updated.adapters.wifi = value.parse().context("Invalid boolean value")?;
            }
            "adapters.local" => {
                updated.adapters.local = value.parse().context("Invalid boolean value")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        updated
            .validate()
            .with_context(|| format!("Rejected value for {}", key))?;
        self.mesh = updated;
        self.save()
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let m = &self.mesh;
        vec![
            ("local_name".to_string(), m.local_name.clone()),
            ("interests".to_string(), m.interests.join(",")),
            ("groups".to_string(), m.groups.join(",")),
            ("push.threshold".to_string(), m.push.threshold.to_string()),
            ("push.send_interval_ms".to_string(), m.push.send_interval_ms.to_string()),
            ("push.feed_capacity".to_string(), m.push.feed_capacity.to_string()),
            ("push.weights.relevance".to_string(), m.push.weights.relevance.to_string()),
            (
                "push.weights.replication_density".to_string(),
                m.push.weights.replication_density.to_string(),
            ),
            ("push.weights.quality".to_string(), m.push.weights.quality.to_string()),
            ("adapters.bluetooth".to_string(), m.adapters.bluetooth.to_string()),
            ("adapters.wifi".to_string(), m.adapters.wifi.to_string()),
            ("adapters.local".to_string(), m.adapters.local.to_string()),
        ]
    }
}
