//! Enhancement engine: grants agents capabilities derived from Runes.
//!
//! Capability sets only grow here. Removal goes through
//! [`EnhancementEngine::revoke`], which appends an audited
//! [`CapabilityRevocation`]. Writes to one agent are serialized by a keyed
//! lock; distinct agents proceed concurrently.

use crate::knowledge::{ApprovalStatus, RuneState, SharedKnowledge};
use crate::locks::KeyedLocks;
use crate::roster::{AgentProfile, AgentRole, SharedRoster};
use crate::store::KnowledgeStore;
use crate::types::{AgentId, ApprovalId, Category, PipelineError, Result, RuneId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Request to enhance one agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnhancementRequest {
    pub agent_id: AgentId,

    /// Role used to register an agent the roster does not know yet
    #[serde(default)]
    pub agent_role: Option<AgentRole>,

    /// Capabilities claimed by an agent the roster does not know yet
    #[serde(default)]
    pub current_capabilities: Vec<String>,

    /// Improvements to look for; empty means every Rune the agent can use
    #[serde(default)]
    pub target_improvements: Vec<String>,

    #[serde(default)]
    pub context: serde_json::Value,
}

impl EnhancementRequest {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: AgentRole) -> Self {
        self.agent_role = Some(role);
        self
    }

    pub fn with_targets(mut self, targets: &[&str]) -> Self {
        self.target_improvements = targets.iter().map(|t| t.to_string()).collect();
        self
    }
}

/// A Rune version referenced by an enhancement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuneRef {
    pub rune_id: RuneId,
    pub version: u32,
    pub category: Category,
}

/// Whether an enhancement took effect.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnhancementStatus {
    Applied,
    PendingApproval,
}

/// Audit record of one enhancement. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnhancementRecord {
    pub record_id: String,
    pub agent_id: AgentId,
    pub agent_role: AgentRole,
    pub prior_capabilities: BTreeSet<String>,
    pub target_improvements: Vec<String>,
    pub runes: Vec<RuneRef>,
    /// Capabilities the enhancement adds (or would add once approved)
    pub granted: Vec<String>,
    pub resulting_capabilities: BTreeSet<String>,
    pub status: EnhancementStatus,
    /// Approval items blocking a pending enhancement
    #[serde(default)]
    pub blocking_approvals: Vec<ApprovalId>,
    #[serde(default)]
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Audit record of a capability removal. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityRevocation {
    pub revocation_id: String,
    pub agent_id: AgentId,
    pub capability: String,
    pub reason: String,
    pub revoked_by: String,
    pub revoked_at: DateTime<Utc>,
}

/// Result of an enhancement request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnhancementOutcome {
    /// Capabilities were added
    Applied { record: EnhancementRecord },
    /// Nothing new to grant
    Unchanged {
        agent_id: AgentId,
        capabilities: BTreeSet<String>,
    },
    /// Waiting on approval items; nothing was granted
    PendingApproval {
        record: EnhancementRecord,
        approval_ids: Vec<ApprovalId>,
    },
}

impl EnhancementOutcome {
    /// Whether the agent's capabilities are final for this request.
    pub fn approved(&self) -> bool {
        !matches!(self, EnhancementOutcome::PendingApproval { .. })
    }

    pub fn record(&self) -> Option<&EnhancementRecord> {
        match self {
            EnhancementOutcome::Applied { record }
            | EnhancementOutcome::PendingApproval { record, .. } => Some(record),
            EnhancementOutcome::Unchanged { .. } => None,
        }
    }
}

/// Per-agent result of a bulk enhancement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEnhancementResult {
    pub agent_id: AgentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<EnhancementOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcomes of a bulk enhancement, in request order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkEnhancementReport {
    pub results: Vec<AgentEnhancementResult>,
    pub succeeded: usize,
    pub failed: usize,
}

impl BulkEnhancementReport {
    /// Fail with `PartialBatchFailure` when any agent failed.
    pub fn ensure_complete(&self) -> Result<()> {
        if self.failed == 0 {
            return Ok(());
        }
        Err(PipelineError::PartialBatchFailure {
            stage: "bulk_enhance",
            failed: self.failed,
            total: self.results.len(),
        })
    }
}

/// Applies Rune-derived capabilities to agents.
pub struct EnhancementEngine {
    roster: SharedRoster,
    knowledge: SharedKnowledge,
    store: Arc<dyn KnowledgeStore>,
    locks: KeyedLocks,
    records: RwLock<Vec<EnhancementRecord>>,
    revocations: RwLock<Vec<CapabilityRevocation>>,
}

impl std::fmt::Debug for EnhancementEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnhancementEngine").finish_non_exhaustive()
    }
}

impl EnhancementEngine {
    pub fn new(roster: SharedRoster, knowledge: SharedKnowledge, store: Arc<dyn KnowledgeStore>) -> Self {
        Self {
            roster,
            knowledge,
            store,
            locks: KeyedLocks::new(),
            records: RwLock::new(Vec::new()),
            revocations: RwLock::new(Vec::new()),
        }
    }

    /// Create an engine with the audit trail loaded from `store`.
    pub fn hydrate(
        roster: SharedRoster,
        knowledge: SharedKnowledge,
        store: Arc<dyn KnowledgeStore>,
    ) -> Result<Self> {
        let records = store
            .load_enhancements()
            .map_err(PipelineError::persistence)?;
        let revocations = store
            .load_revocations()
            .map_err(PipelineError::persistence)?;

        let engine = Self::new(roster, knowledge, store);
        Ok(Self {
            records: RwLock::new(records),
            revocations: RwLock::new(revocations),
            ..engine
        })
    }

    /// Enhance one agent.
    pub async fn enhance(&self, request: EnhancementRequest) -> Result<EnhancementOutcome> {
        let request = normalize(request)?;
        let _guard = self.locks.lock(&request.agent_id).await;
        self.enhance_locked(request).await
    }

    /// Re-run the agent's latest pending enhancement once its approvals clear.
    pub async fn resume_pending(&self, agent_id: &str) -> Result<EnhancementOutcome> {
        let _guard = self.locks.lock(agent_id).await;

        let latest = self
            .records
            .read()
            .await
            .iter()
            .rev()
            .find(|r| r.agent_id == agent_id)
            .cloned();
        let pending = match latest {
            Some(record) if record.status == EnhancementStatus::PendingApproval => record,
            _ => return Err(PipelineError::not_found("pending enhancement", agent_id)),
        };

        let still_pending: Vec<ApprovalId> = {
            let knowledge = self.knowledge.read().await;
            pending
                .blocking_approvals
                .iter()
                .filter(|id| {
                    knowledge
                        .approval(id)
                        .map(|item| item.status == ApprovalStatus::Pending)
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        };
        if !still_pending.is_empty() {
            return Ok(EnhancementOutcome::PendingApproval {
                record: pending,
                approval_ids: still_pending,
            });
        }

        let request = EnhancementRequest {
            agent_id: pending.agent_id,
            agent_role: Some(pending.agent_role),
            current_capabilities: Vec::new(),
            target_improvements: pending.target_improvements,
            context: pending.context,
        };
        self.enhance_locked(request).await
    }

    /// Enhance several agents with the same targets. Failures are reported
    /// per agent and do not stop the others.
    pub async fn bulk_enhance(&self, agent_ids: &[AgentId], targets: &[String]) -> BulkEnhancementReport {
        let futures = agent_ids.iter().map(|agent_id| {
            let request = EnhancementRequest {
                agent_id: agent_id.clone(),
                target_improvements: targets.to_vec(),
                ..Default::default()
            };
            async move { (agent_id.clone(), self.enhance(request).await) }
        });

        let mut report = BulkEnhancementReport::default();
        for (agent_id, result) in futures::future::join_all(futures).await {
            match result {
                Ok(outcome) => {
                    report.succeeded += 1;
                    report.results.push(AgentEnhancementResult {
                        agent_id,
                        outcome: Some(outcome),
                        error: None,
                    });
                }
                Err(e) => {
                    tracing::warn!("Enhancement of agent '{}' failed: {}", agent_id, e);
                    report.failed += 1;
                    report.results.push(AgentEnhancementResult {
                        agent_id,
                        outcome: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        tracing::info!(
            "Bulk enhancement finished: {} succeeded, {} failed",
            report.succeeded,
            report.failed
        );
        report
    }

    /// Register a new agent with the capabilities it already holds.
    pub async fn register(&self, profile: AgentProfile) -> Result<AgentProfile> {
        let _guard = self.locks.lock(&profile.agent_id).await;
        self.insert_agent(profile).await
    }

    /// Remove one capability and record who removed it and why.
    pub async fn revoke(
        &self,
        agent_id: &str,
        capability: &str,
        reason: &str,
        revoked_by: &str,
    ) -> Result<CapabilityRevocation> {
        if reason.trim().is_empty() || revoked_by.trim().is_empty() {
            return Err(PipelineError::Validation(
                "a revocation needs a reason and the name of who revoked it".to_string(),
            ));
        }

        let _guard = self.locks.lock(agent_id).await;
        let mut profile = self
            .roster
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("agent", agent_id))?;

        if !profile.remove_capability(capability) {
            return Err(PipelineError::not_found(
                "capability",
                format!("{agent_id}/{capability}"),
            ));
        }

        let revocation = CapabilityRevocation {
            revocation_id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            capability: capability.to_string(),
            reason: reason.to_string(),
            revoked_by: revoked_by.to_string(),
            revoked_at: Utc::now(),
        };

        self.store
            .upsert_agent(&profile)
            .map_err(PipelineError::persistence)?;
        self.store
            .append_revocation(&revocation)
            .map_err(PipelineError::persistence)?;

        self.roster.write().await.put(profile);
        self.revocations.write().await.push(revocation.clone());

        tracing::info!(
            "Capability '{}' revoked from agent '{}' by {}",
            capability,
            agent_id,
            revoked_by
        );
        Ok(revocation)
    }

    /// Current capabilities of an agent.
    pub async fn capabilities(&self, agent_id: &str) -> Result<BTreeSet<String>> {
        self.roster
            .read()
            .await
            .get(agent_id)
            .map(|p| p.capabilities.clone())
            .ok_or_else(|| PipelineError::not_found("agent", agent_id))
    }

    /// Enhancement records of an agent, oldest first.
    pub async fn history(&self, agent_id: &str) -> Vec<EnhancementRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.agent_id == agent_id)
            .cloned()
            .collect()
    }

    /// Revocations of an agent, oldest first.
    pub async fn revocations(&self, agent_id: &str) -> Vec<CapabilityRevocation> {
        self.revocations
            .read()
            .await
            .iter()
            .filter(|r| r.agent_id == agent_id)
            .cloned()
            .collect()
    }

    async fn enhance_locked(&self, request: EnhancementRequest) -> Result<EnhancementOutcome> {
        let profile = self.resolve_agent(&request).await?;

        let (mut runes, proposed, blocked) = {
            let knowledge = self.knowledge.read().await;
            let mut applicable: Vec<RuneRef> = Vec::new();
            let mut blocked: Vec<(RuneRef, Option<ApprovalId>)> = Vec::new();
            let mut granted: BTreeSet<String> = BTreeSet::new();

            for state in knowledge.rune_states() {
                if !relevant(&profile, &state, &request.target_improvements) {
                    continue;
                }
                if let Some(pending) = state.pending {
                    granted.extend(pending.granted_capabilities());
                    blocked.push((
                        RuneRef {
                            rune_id: pending.rune_id.clone(),
                            version: pending.version,
                            category: pending.category.clone(),
                        },
                        pending.approval_id.clone(),
                    ));
                } else if let Some(active) = state.active {
                    granted.extend(active.granted_capabilities());
                    applicable.push(RuneRef {
                        rune_id: active.rune_id.clone(),
                        version: active.version,
                        category: active.category.clone(),
                    });
                }
            }
            (applicable, granted, blocked)
        };

        let delta: Vec<String> = proposed
            .difference(&profile.capabilities)
            .cloned()
            .collect();

        if blocked.is_empty() && delta.is_empty() {
            tracing::debug!("Agent '{}' already holds every matching capability", profile.agent_id);
            return Ok(EnhancementOutcome::Unchanged {
                agent_id: profile.agent_id,
                capabilities: profile.capabilities,
            });
        }

        let mut resulting = profile.capabilities.clone();
        resulting.extend(delta.iter().cloned());

        let approval_ids: Vec<ApprovalId> = blocked.iter().filter_map(|(_, id)| id.clone()).collect();
        let status = if blocked.is_empty() {
            EnhancementStatus::Applied
        } else {
            EnhancementStatus::PendingApproval
        };
        runes.extend(blocked.into_iter().map(|(rune, _)| rune));

        let record = EnhancementRecord {
            record_id: uuid::Uuid::new_v4().to_string(),
            agent_id: profile.agent_id.clone(),
            agent_role: profile.role,
            prior_capabilities: profile.capabilities.clone(),
            target_improvements: request.target_improvements,
            runes,
            granted: delta,
            resulting_capabilities: resulting,
            status,
            blocking_approvals: approval_ids.clone(),
            context: request.context,
            created_at: Utc::now(),
        };

        if status == EnhancementStatus::PendingApproval {
            self.append_record(&record).await?;
            tracing::info!(
                "Enhancement of agent '{}' waits on {} approval item(s)",
                record.agent_id,
                approval_ids.len()
            );
            return Ok(EnhancementOutcome::PendingApproval {
                record,
                approval_ids,
            });
        }

        let mut updated = profile;
        updated.capabilities = record.resulting_capabilities.clone();
        updated.updated_at = record.created_at;
        self.store
            .upsert_agent(&updated)
            .map_err(PipelineError::persistence)?;
        self.append_record(&record).await?;
        self.roster.write().await.put(updated);

        tracing::info!(
            "Agent '{}' gained {} capabilities",
            record.agent_id,
            record.granted.len()
        );
        Ok(EnhancementOutcome::Applied { record })
    }

    /// Look up the agent, registering it when the request names a role.
    async fn resolve_agent(&self, request: &EnhancementRequest) -> Result<AgentProfile> {
        if let Some(profile) = self.roster.read().await.get(&request.agent_id) {
            if let Some(role) = request.agent_role.filter(|r| *r != profile.role) {
                tracing::debug!(
                    "Ignoring role '{}' claimed for agent '{}' registered as '{}'",
                    role,
                    profile.agent_id,
                    profile.role
                );
            }
            return Ok(profile.clone());
        }

        let role = request
            .agent_role
            .ok_or_else(|| PipelineError::not_found("agent", request.agent_id.clone()))?;
        let profile = AgentProfile::new(request.agent_id.clone(), role)
            .with_capabilities(request.current_capabilities.iter().cloned());

        self.insert_agent(profile).await
    }

    /// Persist and register a new profile. Callers hold the agent's lock.
    async fn insert_agent(&self, profile: AgentProfile) -> Result<AgentProfile> {
        if self.roster.read().await.contains(&profile.agent_id) {
            return Err(PipelineError::invalid_state(
                profile.agent_id,
                "register_agent",
                "agent already registered",
            ));
        }
        self.store
            .upsert_agent(&profile)
            .map_err(PipelineError::persistence)?;
        self.roster.write().await.register(profile.clone())?;
        tracing::info!("Registered agent '{}' as {}", profile.agent_id, profile.role);
        Ok(profile)
    }

    async fn append_record(&self, record: &EnhancementRecord) -> Result<()> {
        self.store.append_enhancement(record).map_err(|e| {
            tracing::error!("Failed to persist enhancement record '{}': {:#}", record.record_id, e);
            PipelineError::persistence(e)
        })?;
        self.records.write().await.push(record.clone());
        Ok(())
    }
}

fn normalize(mut request: EnhancementRequest) -> Result<EnhancementRequest> {
    request.agent_id = request.agent_id.trim().to_string();
    if request.agent_id.is_empty() {
        return Err(PipelineError::Validation(
            "enhancement request has no agent identifier".to_string(),
        ));
    }
    if request.target_improvements.iter().any(|t| t.trim().is_empty()) {
        return Err(PipelineError::Validation(format!(
            "enhancement request for '{}' has an empty target",
            request.agent_id
        )));
    }
    request.target_improvements = crate::types::dedup_preserving_order(request.target_improvements);
    Ok(request)
}

/// A Rune is relevant when the agent can handle its category and, if targets
/// were given, one of them refers to the Rune.
fn relevant(profile: &AgentProfile, state: &RuneState<'_>, targets: &[String]) -> bool {
    if !profile.can_handle(state.category) {
        return false;
    }
    if targets.is_empty() {
        return true;
    }
    let Some(rune) = state.pending.or(state.active) else {
        return false;
    };
    targets.iter().any(|t| rune.matches_target(t))
}
