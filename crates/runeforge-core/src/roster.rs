//! Agent roles, capability sets and category-to-agent selection.
//!
//! Capability sets only grow through the enhancement engine. Removal goes
//! through [`EnhancementEngine::revoke`](crate::enhancement::EnhancementEngine::revoke),
//! which records a revocation in the audit trail.

use crate::types::{AgentId, Category, PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Roster shared by the router and the enhancement engine.
pub type SharedRoster = Arc<RwLock<AgentRoster>>;

/// Role of an agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Infrastructure,
    Security,
    Cloud,
    Development,
    Operations,
    /// Handles any category
    Generalist,
}

impl AgentRole {
    /// Categories this role handles natively.
    pub fn categories(&self) -> &'static [&'static str] {
        match self {
            AgentRole::Infrastructure => &[
                "infrastructure",
                "kubernetes",
                "docker",
                "helm",
                "terraform",
                "deployment",
                "networking",
            ],
            AgentRole::Security => &["security", "vulnerability", "compliance", "audit"],
            AgentRole::Cloud => &["cloud", "aws", "azure", "gcp"],
            AgentRole::Development => &["development", "testing", "code", "build"],
            AgentRole::Operations => &["operations", "monitoring", "maintenance", "backup", "other"],
            AgentRole::Generalist => &[],
        }
    }

    /// Whether this role handles the category.
    pub fn handles(&self, category: &str) -> bool {
        match self {
            AgentRole::Generalist => true,
            role => role.categories().contains(&category),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Infrastructure => "infrastructure",
            AgentRole::Security => "security",
            AgentRole::Cloud => "cloud",
            AgentRole::Development => "development",
            AgentRole::Operations => "operations",
            AgentRole::Generalist => "generalist",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentRole {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "infrastructure" | "infra" => Ok(AgentRole::Infrastructure),
            "security" => Ok(AgentRole::Security),
            "cloud" => Ok(AgentRole::Cloud),
            "development" | "dev" => Ok(AgentRole::Development),
            "operations" | "ops" => Ok(AgentRole::Operations),
            "generalist" | "general" => Ok(AgentRole::Generalist),
            other => Err(PipelineError::Validation(format!(
                "unknown agent role '{other}'"
            ))),
        }
    }
}

/// Capability string prefix for a category (`"<category>."`).
pub fn capability_prefix(category: &str) -> String {
    format!("{category}.")
}

/// A registered agent and its current capability set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentProfile {
    pub agent_id: AgentId,
    pub role: AgentRole,
    pub capabilities: BTreeSet<String>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentProfile {
    pub fn new(agent_id: impl Into<String>, role: AgentRole) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            role,
            capabilities: BTreeSet::new(),
            registered_at: now,
            updated_at: now,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Number of capabilities scoped to the category.
    pub fn coverage(&self, category: &str) -> usize {
        let prefix = capability_prefix(category);
        self.capabilities
            .iter()
            .filter(|c| c.starts_with(&prefix) || c.as_str() == category)
            .count()
    }

    /// Remove one capability. Returns whether it was held.
    pub fn remove_capability(&mut self, capability: &str) -> bool {
        let removed = self.capabilities.remove(capability);
        if removed {
            self.updated_at = Utc::now();
        }
        removed
    }

    /// Whether this agent can take a task of the category, either by role
    /// or by capabilities gained through enhancement.
    pub fn can_handle(&self, category: &str) -> bool {
        self.role.handles(category) || self.coverage(category) > 0
    }
}

/// Recommendation for a direct assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentMatch {
    pub agent_id: AgentId,
    pub role: AgentRole,
    pub coverage: usize,
}

/// Registry of agents.
#[derive(Debug, Default, Clone)]
pub struct AgentRoster {
    agents: HashMap<AgentId, AgentProfile>,
}

impl AgentRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a roster from stored profiles.
    pub fn from_profiles(profiles: Vec<AgentProfile>) -> Self {
        Self {
            agents: profiles
                .into_iter()
                .map(|p| (p.agent_id.clone(), p))
                .collect(),
        }
    }

    /// Register a new agent. Existing agents keep their capabilities.
    pub fn register(&mut self, profile: AgentProfile) -> Result<&AgentProfile> {
        if self.agents.contains_key(&profile.agent_id) {
            return Err(PipelineError::invalid_state(
                profile.agent_id,
                "register_agent",
                "agent already registered",
            ));
        }
        let agent_id = profile.agent_id.clone();
        let profile = self.agents.entry(agent_id).or_insert(profile);
        Ok(&*profile)
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentProfile> {
        self.agents.get(agent_id)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// All agents, sorted by identifier.
    pub fn list(&self) -> Vec<AgentProfile> {
        let mut agents: Vec<AgentProfile> = self.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Insert or replace a profile.
    pub(crate) fn put(&mut self, profile: AgentProfile) {
        self.agents.insert(profile.agent_id.clone(), profile);
    }

    /// Pick the agent for a category: most category-scoped capabilities first,
    /// role specialists before generalists, then by identifier.
    pub fn select_for(&self, category: &Category) -> Option<AgentMatch> {
        let mut candidates: Vec<AgentMatch> = self
            .agents
            .values()
            .filter(|p| p.can_handle(category))
            .map(|p| AgentMatch {
                agent_id: p.agent_id.clone(),
                role: p.role,
                coverage: p.coverage(category),
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.coverage
                .cmp(&a.coverage)
                .then_with(|| {
                    let a_general = a.role == AgentRole::Generalist;
                    let b_general = b.role == AgentRole::Generalist;
                    a_general.cmp(&b_general)
                })
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });

        candidates.into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_handles() {
        assert!(AgentRole::Infrastructure.handles("kubernetes"));
        assert!(!AgentRole::Infrastructure.handles("security"));
        assert!(AgentRole::Generalist.handles("anything"));
        assert_eq!("ops".parse::<AgentRole>().unwrap(), AgentRole::Operations);
        assert!("wizard".parse::<AgentRole>().is_err());
    }

    #[test]
    fn test_select_prefers_specialist_with_coverage() {
        let mut roster = AgentRoster::new();
        roster
            .register(AgentProfile::new("generalist", AgentRole::Generalist))
            .unwrap();
        roster
            .register(AgentProfile::new("infra-b", AgentRole::Infrastructure))
            .unwrap();
        roster
            .register(
                AgentProfile::new("infra-a", AgentRole::Infrastructure)
                    .with_capabilities(["kubernetes.command_execution"]),
            )
            .unwrap();

        let pick = roster.select_for(&"kubernetes".to_string()).unwrap();
        assert_eq!(pick.agent_id, "infra-a");
        assert_eq!(pick.coverage, 1);

        let pick = roster.select_for(&"infrastructure".to_string()).unwrap();
        assert_eq!(pick.agent_id, "infra-a");
    }

    #[test]
    fn test_select_falls_back_to_generalist() {
        let mut roster = AgentRoster::new();
        roster
            .register(AgentProfile::new("dev", AgentRole::Development))
            .unwrap();
        assert!(roster.select_for(&"security".to_string()).is_none());

        roster
            .register(AgentProfile::new("gen", AgentRole::Generalist))
            .unwrap();
        assert_eq!(
            roster.select_for(&"security".to_string()).unwrap().agent_id,
            "gen"
        );
    }

    #[test]
    fn test_enhanced_capability_extends_reach() {
        let mut roster = AgentRoster::new();
        roster
            .register(AgentProfile::new("dev", AgentRole::Development))
            .unwrap();
        assert!(roster.select_for(&"database".to_string()).is_none());

        let mut profile = roster.get("dev").cloned().unwrap();
        profile.capabilities.insert("database.command_execution".to_string());
        roster.put(profile);
        assert_eq!(
            roster.select_for(&"database".to_string()).unwrap().agent_id,
            "dev"
        );
    }

    #[test]
    fn test_remove_capability() {
        let mut profile = AgentProfile::new("a", AgentRole::Cloud).with_capabilities(["cloud.x"]);
        assert!(profile.remove_capability("cloud.x"));
        assert!(!profile.remove_capability("cloud.x"));
        assert_eq!(profile.coverage("cloud"), 0);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut roster = AgentRoster::new();
        roster.register(AgentProfile::new("a", AgentRole::Cloud)).unwrap();
        assert!(matches!(
            roster.register(AgentProfile::new("a", AgentRole::Security)),
            Err(PipelineError::InvalidState { .. })
        ));
    }
}
