//! Configuration and persistence for the runeforge pipeline.
//!
//! - [`PipelineConfig`]: TOML-backed settings for routing thresholds, the
//!   knowledge smith, scoring adjustments and seed agents
//! - [`KeywordTables`]: the versioned keyword tables consumed by the
//!   confidence evaluator
//! - [`Persistence`]: a DuckDB-backed document store used for durable state

pub mod config;
pub mod keywords;
pub mod persistence;

pub use config::{
    default_config_path, default_database_path, AgentSeed, ConfigError, PipelineConfig,
    QueueConfig, RouterConfig, ScoringConfig, SmithConfig, StorageConfig,
};
pub use keywords::{KeywordGroup, KeywordTables, WeightClass, WeightTable};
pub use persistence::{DocumentRecord, DocumentTable, Persistence};
