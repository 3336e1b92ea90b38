//! Model configuration for charrnn.
//!
//! Serialised as JSON next to every checkpoint. Every field except
//! `vocab_size` has a default, so a minimal `{"vocab_size": 65}` JSON will
//! produce a working (if small) model.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Recurrent cell used by every layer of the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerType {
    Gru,
    Lstm,
    /// GRU with a second gated update along the depth axis. Layers keep
    /// their output at the embedding width.
    GridGru,
}

impl LayerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gru => "gru",
            Self::Lstm => "lstm",
            Self::GridGru => "gridgru",
        }
    }
}

impl FromStr for LayerType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gru" => Ok(Self::Gru),
            "lstm" => Ok(Self::Lstm),
            "gridgru" => Ok(Self::GridGru),
            other => bail!("unknown layer type `{other}` (expected gru, lstm or gridgru)"),
        }
    }
}

impl fmt::Display for LayerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Architecture of the character-level language model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size (max token index + 1).
    pub vocab_size: usize,
    #[serde(default = "default_layer_type")]
    pub layer_type: LayerType,
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
    /// Embedding width D.
    #[serde(default = "default_dim")]
    pub embedding_dim: usize,
    /// Recurrent state width H.
    #[serde(default = "default_dim")]
    pub hidden_dim: usize,
    /// Dropout applied to each layer's output while training.
    #[serde(default)]
    pub dropout: f64,
    /// Probability of keeping the previous state element.
    #[serde(default)]
    pub zoneout: f64,
}

fn default_layer_type() -> LayerType {
    LayerType::GridGru
}
fn default_num_layers() -> usize {
    2
}
fn default_dim() -> usize {
    128
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 0,
            layer_type: LayerType::GridGru,
            num_layers: 2,
            embedding_dim: 128,
            hidden_dim: 128,
            dropout: 0.0,
            zoneout: 0.0,
        }
    }
}

impl ModelConfig {
    /// Width of the tensor each recurrent layer hands to the next one.
    pub fn layer_output_dim(&self) -> usize {
        match self.layer_type {
            LayerType::GridGru => self.embedding_dim,
            LayerType::Gru | LayerType::Lstm => self.hidden_dim,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.vocab_size == 0 {
            bail!("vocab_size must be positive");
        }
        if self.num_layers == 0 {
            bail!("num_layers must be positive");
        }
        if self.embedding_dim == 0 || self.hidden_dim == 0 {
            bail!(
                "embedding_dim ({}) and hidden_dim ({}) must be positive",
                self.embedding_dim,
                self.hidden_dim
            );
        }
        if !(0.0..1.0).contains(&self.dropout) {
            bail!("dropout must be in [0, 1), got {}", self.dropout);
        }
        if !(0.0..1.0).contains(&self.zoneout) {
            bail!("zoneout must be in [0, 1), got {}", self.zoneout);
        }
        Ok(())
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}
