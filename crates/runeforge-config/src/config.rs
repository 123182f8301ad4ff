//! Pipeline configuration.
//!
//! Configuration is read from a TOML file. Every section is optional; missing
//! values fall back to the defaults below.

use crate::keywords::KeywordTables;
use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "RUNEFORGE_CONFIG";

/// Environment variable overriding the database location.
pub const DATABASE_ENV: &str = "RUNEFORGE_DB";

/// Validation errors for a loaded configuration.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("router thresholds out of order: learning {learning} must be <= direct {direct}")]
    ThresholdOrder { learning: f64, direct: f64 },

    #[error("{field} must be within [0.0, 1.0], got {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("keyword group '{0}' has no keywords")]
    EmptyKeywordGroup(String),

    #[error("agent seed '{0}' has an empty identifier or role")]
    InvalidAgentSeed(String),
}

/// Routing thresholds and dispatch timeout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouterConfig {
    /// Scores at or above this are dispatched directly to an agent
    pub direct_assign_threshold: f64,

    /// Scores at or above this (and below the direct threshold) are queued for learning
    pub learning_threshold: f64,

    /// Timeout for handing a task to an agent, in milliseconds
    pub dispatch_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            direct_assign_threshold: 0.95,
            learning_threshold: 0.70,
            dispatch_timeout_ms: 30_000,
        }
    }
}

/// Training queue settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Recurrence at or above which an entry is surfaced as a highlight
    pub recurrence_highlight_threshold: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            recurrence_highlight_threshold: 2,
        }
    }
}

/// Knowledge smith settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SmithConfig {
    /// Minimum entries per category before an Orb is created or updated
    pub min_evidence: usize,

    /// Whether pending entries without a recorded solution are consumed
    pub include_incomplete: bool,

    /// Number of top-ranked commands copied into a Rune
    pub max_rune_commands: usize,

    /// Fraction of changed commands above which a new Rune version needs approval
    pub material_change_fraction: f64,

    /// Fixed part of the Rune timeout, in seconds
    pub base_timeout_secs: u64,

    /// Estimated seconds per command
    pub per_command_secs: u64,

    /// Action type stamped on derived Runes
    pub action_type: String,

    /// Command substrings that mark a Rune as high risk
    pub high_risk_markers: Vec<String>,

    /// Words that mark a solution phrase as a success pattern
    pub success_markers: Vec<String>,

    /// Maximum success patterns kept on an Orb
    pub max_success_patterns: usize,
}

impl Default for SmithConfig {
    fn default() -> Self {
        Self {
            min_evidence: 1,
            include_incomplete: true,
            max_rune_commands: 5,
            material_change_fraction: 0.5,
            base_timeout_secs: 60,
            per_command_secs: 60,
            action_type: "command_execution".to_string(),
            high_risk_markers: vec![
                "rm -rf".to_string(),
                "drop table".to_string(),
                "drop database".to_string(),
                "mkfs".to_string(),
                "--force".to_string(),
                "delete".to_string(),
                "shutdown".to_string(),
            ],
            success_markers: vec![
                "success".to_string(),
                "successfully".to_string(),
                "succeeded".to_string(),
                "completed".to_string(),
                "deployed".to_string(),
                "resolved".to_string(),
                "fixed".to_string(),
                "passed".to_string(),
                "healthy".to_string(),
                "running".to_string(),
            ],
            max_success_patterns: 10,
        }
    }
}

/// Confidence adjustments applied after keyword scoring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringConfig {
    /// Bonus added when the detected category matches
    pub category_bonus: BTreeMap<String, f64>,

    /// Penalty subtracted for high and critical priority tasks
    pub high_priority_penalty: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let mut category_bonus = BTreeMap::new();
        category_bonus.insert("infrastructure".to_string(), 0.10);
        category_bonus.insert("security".to_string(), 0.10);
        category_bonus.insert("development".to_string(), 0.05);

        Self {
            category_bonus,
            high_priority_penalty: 0.10,
        }
    }
}

/// Where durable state lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: Option<PathBuf>,
}

/// An agent registered at startup when the store holds no agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSeed {
    pub agent_id: String,
    pub role: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl AgentSeed {
    fn new(agent_id: &str, role: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            role: role.to_string(),
            capabilities: Vec::new(),
        }
    }
}

fn default_agents() -> Vec<AgentSeed> {
    vec![
        AgentSeed::new("infrastructure-agent", "infrastructure"),
        AgentSeed::new("security-agent", "security"),
        AgentSeed::new("cloud-agent", "cloud"),
        AgentSeed::new("development-agent", "development"),
        AgentSeed::new("operations-agent", "operations"),
    ]
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub router: RouterConfig,
    pub queue: QueueConfig,
    pub smith: SmithConfig,
    pub scoring: ScoringConfig,
    pub keywords: KeywordTables,
    pub storage: StorageConfig,
    pub agents: Vec<AgentSeed>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            queue: QueueConfig::default(),
            smith: SmithConfig::default(),
            scoring: ScoringConfig::default(),
            keywords: KeywordTables::default(),
            storage: StorageConfig::default(),
            agents: default_agents(),
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a configuration from TOML text.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: PipelineConfig =
            toml::from_str(raw).context("Failed to parse pipeline configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Load from an explicit path, `RUNEFORGE_CONFIG`, or the default location,
    /// falling back to defaults when no file exists.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let candidate = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(default_config_path);

        match candidate {
            Some(path) if path.exists() => {
                tracing::debug!("Loading configuration from {}", path.display());
                Self::load(&path)
            }
            Some(path) => {
                tracing::debug!(
                    "No configuration at {}, using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    /// Render this configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize pipeline configuration")
    }

    /// Resolve the database path: config, then `RUNEFORGE_DB`, then the data dir.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.storage
            .database_path
            .clone()
            .or_else(|| std::env::var_os(DATABASE_ENV).map(PathBuf::from))
            .or_else(default_database_path)
    }

    /// Reject settings that parse but cannot work together.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let router = &self.router;
        for (field, value) in [
            ("router.direct_assign_threshold", router.direct_assign_threshold),
            ("router.learning_threshold", router.learning_threshold),
            ("smith.material_change_fraction", self.smith.material_change_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange { field, value });
            }
        }

        if router.learning_threshold > router.direct_assign_threshold {
            return Err(ConfigError::ThresholdOrder {
                learning: router.learning_threshold,
                direct: router.direct_assign_threshold,
            });
        }

        if router.dispatch_timeout_ms == 0 {
            return Err(ConfigError::Zero {
                field: "router.dispatch_timeout_ms",
            });
        }
        if self.smith.min_evidence == 0 {
            return Err(ConfigError::Zero {
                field: "smith.min_evidence",
            });
        }
        if self.smith.max_rune_commands == 0 {
            return Err(ConfigError::Zero {
                field: "smith.max_rune_commands",
            });
        }

        if let Some(group) = self.keywords.groups.iter().find(|g| g.keywords.is_empty()) {
            return Err(ConfigError::EmptyKeywordGroup(group.category.clone()));
        }

        if let Some(seed) = self
            .agents
            .iter()
            .find(|a| a.agent_id.trim().is_empty() || a.role.trim().is_empty())
        {
            return Err(ConfigError::InvalidAgentSeed(seed.agent_id.clone()));
        }

        Ok(())
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "runeforge", "runeforge")
}

/// Default config file location (`<config dir>/runeforge/config.toml`).
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Default database location (`<data dir>/runeforge/runeforge.duckdb`).
pub fn default_database_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().join("runeforge.duckdb"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.router.direct_assign_threshold, 0.95);
        assert_eq!(config.router.learning_threshold, 0.70);
        assert_eq!(config.smith.min_evidence, 1);
        assert_eq!(config.agents.len(), 5);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [router]
            learning_threshold = 0.6

            [smith]
            material_change_fraction = 0.25
            "#,
        )
        .unwrap();

        assert_eq!(config.router.learning_threshold, 0.6);
        assert_eq!(config.router.direct_assign_threshold, 0.95);
        assert_eq!(config.smith.material_change_fraction, 0.25);
        assert_eq!(config.smith.max_rune_commands, 5);
        assert_eq!(config.keywords, KeywordTables::default());
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut config = PipelineConfig::default();
        config.router.learning_threshold = 0.99;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ThresholdOrder {
                learning: 0.99,
                direct: 0.95
            })
        );
    }

    #[test]
    fn test_out_of_range_fraction_rejected() {
        let mut config = PipelineConfig::default();
        config.smith.material_change_fraction = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_empty_keyword_group_rejected() {
        let mut config = PipelineConfig::default();
        config.keywords.groups[0].keywords.clear();
        assert_eq!(
            config.validate(),
            Err(ConfigError::EmptyKeywordGroup("infrastructure".to_string()))
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[queue]\nrecurrence_highlight_threshold = 5").unwrap();

        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.queue.recurrence_highlight_threshold, 5);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            PipelineConfig::load_or_default(Some(&dir.path().join("missing.toml"))).unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_toml_round_trip_preserves_tables() {
        let config = PipelineConfig::default();
        let raw = config.to_toml_string().unwrap();
        let parsed = PipelineConfig::from_toml_str(&raw).unwrap();
        assert_eq!(parsed, config);
    }
}
