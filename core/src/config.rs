// Mesh configuration: serde/JSON, validated before use

use crate::push::ScoreWeights;
use crate::transport::TransportType;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Name announced to peers
    pub local_name: String,

    /// Topics we want to receive
    pub interests: Vec<String>,

    /// Groups whose content we carry
    pub groups: Vec<String>,

    /// Dissemination settings
    pub push: PushConfig,

    /// Which link layers to enable
    pub adapters: AdapterConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub weights: ScoreWeights,

    /// Minimum score for an item to stay eligible
    pub threshold: f32,

    /// Pause between two pushes on the same session (0 = none)
    pub send_interval_ms: u64,

    /// Capacity of the content-change feed
    pub feed_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub bluetooth: bool,
    pub wifi: bool,
    pub local: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            local_name: "meshcast".to_string(),
            interests: Vec::new(),
            groups: vec!["public".to_string()],
            push: PushConfig::default(),
            adapters: AdapterConfig::default(),
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            threshold: 0.0,
            send_interval_ms: 0,
            feed_capacity: 256,
        }
    }
}

impl AdapterConfig {
    /// Whether the link layer of `transport` may be started
    pub fn enables(&self, transport: TransportType) -> bool {
        match transport {
            TransportType::Bluetooth => self.bluetooth,
            TransportType::WifiManaged | TransportType::WifiDirect => self.wifi,
            TransportType::Local => self.local,
        }
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            bluetooth: true,
            wifi: true,
            local: true,
        }
    }
}

fn check_weight(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::invalid(
            field,
            format!("must be a finite non-negative number, got {}", value),
        ));
    }
    Ok(())
}

impl MeshConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.push.weights;
        check_weight("push.weights.relevance", w.relevance)?;
        check_weight("push.weights.replication_density", w.replication_density)?;
        check_weight("push.weights.quality", w.quality)?;
        if w.relevance + w.replication_density + w.quality == 0.0 {
            return Err(ConfigError::invalid("push.weights", "at least one weight must be positive"));
        }
        check_weight("push.threshold", self.push.threshold)?;
        if self.push.feed_capacity == 0 {
            return Err(ConfigError::invalid("push.feed_capacity", "must be at least 1"));
        }
        if self.groups.is_empty() {
            return Err(ConfigError::invalid("groups", "at least one group is required"));
        }
        let a = &self.adapters;
        if !(a.bluetooth || a.wifi || a.local) {
            return Err(ConfigError::invalid("adapters", "no link layer enabled"));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: MeshConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
