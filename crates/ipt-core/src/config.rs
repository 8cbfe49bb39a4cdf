use crate::rule::Verdict;
use crate::table::TableOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine settings, loaded from YAML. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Chain evaluated when the caller does not name one
    pub default_chain: String,
    pub evaluation: EvaluationConfig,
    pub conntrack: ConntrackConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub max_jump_depth: usize,
    /// Verdict when the evaluated chain ends without a policy and nothing matched
    pub implicit_policy: Verdict,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConntrackConfig {
    /// Maximum tracked flows; unbounded when absent
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// error, warn, info, debug, trace
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_chain: "INPUT".to_string(),
            evaluation: EvaluationConfig::default(),
            conntrack: ConntrackConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            max_jump_depth: 32,
            implicit_policy: Verdict::Accept,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config from {:?}", path))?;
        Self::from_yaml(&content).context("Failed to parse engine config YAML")
    }

    pub fn table_options(&self) -> TableOptions {
        TableOptions {
            max_jump_depth: self.evaluation.max_jump_depth,
            implicit_policy: self.evaluation.implicit_policy,
            conntrack_capacity: self.conntrack.capacity,
        }
    }
}
