//! The assembled pipeline.
//!
//! [`Pipeline`] wires the evaluator, router, training queue, knowledge smith,
//! approval gate and enhancement engine around one [`KnowledgeStore`] and
//! hands each caller-facing operation to the component that owns it.

use crate::approval::{ApprovalGate, PendingApproval};
use crate::enhancement::{
    BulkEnhancementReport, CapabilityRevocation, EnhancementEngine, EnhancementOutcome,
    EnhancementRecord, EnhancementRequest,
};
use crate::evaluator::{ConfidenceAssessment, ConfidenceEvaluator};
use crate::knowledge::{ApprovalItem, KnowledgeBase, Orb, Rune, SharedKnowledge};
use crate::queue::{QueueDigest, Solution, TrainingQueue, TrainingQueueEntry};
use crate::roster::{AgentProfile, AgentRole, AgentRoster, SharedRoster};
use crate::router::{AgentExecutor, AgentOutcome, RouteDecision, RouteState, Router, RoutingRecord};
use crate::smith::{KnowledgeSmith, SynthesisReport};
use crate::store::{KnowledgeStore, MemoryStore};
use crate::types::{AgentId, PipelineError, Result, TaskId, TaskSubmission};
use runeforge_config::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// What happened to a submitted task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionOutcome {
    pub task_id: TaskId,
    pub attempt: u32,
    pub state: RouteState,
    pub assessment: ConfidenceAssessment,
    pub decision: RouteDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    /// The training queue entry after enqueueing, for queued tasks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_entry: Option<TrainingQueueEntry>,
}

/// Task evaluation and continuous-learning pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    roster: SharedRoster,
    knowledge: SharedKnowledge,
    queue: Arc<TrainingQueue>,
    router: Router,
    smith: KnowledgeSmith,
    gate: ApprovalGate,
    enhancer: EnhancementEngine,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("router", &self.router)
            .field("smith", &self.smith)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Build a pipeline over `store`, loading everything it already holds.
    ///
    /// When the store has no agents, the agents named in the configuration
    /// are registered and persisted.
    pub fn open(config: PipelineConfig, store: Arc<dyn KnowledgeStore>) -> Result<Self> {
        config.validate()?;

        let roster: SharedRoster = Arc::new(RwLock::new(load_roster(&config, store.as_ref())?));
        let knowledge: SharedKnowledge = Arc::new(RwLock::new(KnowledgeBase::from_parts(
            store.load_orbs().map_err(PipelineError::persistence)?,
            store.load_runes().map_err(PipelineError::persistence)?,
            store.load_approvals().map_err(PipelineError::persistence)?,
        )));
        let queue = Arc::new(TrainingQueue::hydrate(config.queue.clone(), Arc::clone(&store))?);

        let evaluator = Arc::new(ConfidenceEvaluator::new(
            config.keywords.clone(),
            config.scoring.clone(),
        ));
        let router = Router::new(
            config.router.clone(),
            evaluator,
            Arc::clone(&roster),
            Arc::clone(&queue),
        );
        let smith = KnowledgeSmith::new(
            config.smith.clone(),
            Arc::clone(&queue),
            Arc::clone(&knowledge),
            Arc::clone(&store),
        );
        let gate = ApprovalGate::new(Arc::clone(&knowledge), Arc::clone(&store));
        let enhancer = EnhancementEngine::hydrate(
            Arc::clone(&roster),
            Arc::clone(&knowledge),
            Arc::clone(&store),
        )?;

        tracing::info!("Pipeline ready (keyword tables {})", config.keywords.version);

        Ok(Self {
            config,
            roster,
            knowledge,
            queue,
            router,
            smith,
            gate,
            enhancer,
        })
    }

    /// A pipeline that keeps everything in memory.
    pub fn in_memory(config: PipelineConfig) -> Result<Self> {
        Self::open(config, Arc::new(MemoryStore::new()))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // ========== Routing ==========

    /// Validate, score and route a task. Tasks in the learning band are
    /// queued for training.
    pub async fn submit(&self, submission: TaskSubmission) -> Result<SubmissionOutcome> {
        let task = submission.into_task()?;
        let record = self.router.submit(task).await?;
        self.outcome(record).await
    }

    /// Score and route the latest snapshot of a task again.
    pub async fn reevaluate(&self, task_id: &str) -> Result<SubmissionOutcome> {
        let record = self.router.reevaluate(task_id).await?;
        self.outcome(record).await
    }

    async fn outcome(&self, record: RoutingRecord) -> Result<SubmissionOutcome> {
        let (Some(assessment), Some(decision)) = (record.assessment, record.decision) else {
            return Err(PipelineError::invalid_state(
                record.task.task_id,
                "submit",
                "routing finished without a decision",
            ));
        };
        let queue_entry = if record.state == RouteState::QueuedForLearning {
            self.queue.get(&record.task.task_id).await
        } else {
            None
        };

        Ok(SubmissionOutcome {
            task_id: record.task.task_id,
            attempt: record.attempt,
            state: record.state,
            assessment,
            decision,
            agent_id: record.agent_id,
            queue_entry,
        })
    }

    pub async fn dispatch(&self, task_id: &str, executor: &dyn AgentExecutor) -> Result<RoutingRecord> {
        self.router.dispatch(task_id, executor).await
    }

    pub async fn report_outcome(&self, task_id: &str, outcome: AgentOutcome) -> Result<RoutingRecord> {
        self.router.report_outcome(task_id, outcome).await
    }

    pub async fn routing(&self, task_id: &str) -> Option<RoutingRecord> {
        self.router.latest(task_id).await
    }

    // ========== Training Queue ==========

    pub async fn complete(&self, task_id: &str, solution: Solution) -> Result<TrainingQueueEntry> {
        self.queue.mark_completed(task_id, solution).await
    }

    pub async fn mark_matched(&self, task_id: &str, rune_id: &str) -> Result<TrainingQueueEntry> {
        self.queue.mark_matched(task_id, rune_id).await
    }

    pub async fn mark_fallback(&self, task_id: &str, reason: &str) -> Result<TrainingQueueEntry> {
        self.queue.mark_fallback(task_id, reason).await
    }

    pub async fn queue_entry(&self, task_id: &str) -> Option<TrainingQueueEntry> {
        self.queue.get(task_id).await
    }

    pub async fn digest(&self) -> QueueDigest {
        self.queue.digest().await
    }

    // ========== Knowledge ==========

    pub async fn synthesize(&self) -> SynthesisReport {
        self.smith.synthesize().await
    }

    pub async fn orbs(&self) -> Vec<Orb> {
        self.knowledge.read().await.orbs().to_vec()
    }

    /// Every stored Rune version.
    pub async fn runes(&self) -> Vec<Rune> {
        self.knowledge.read().await.runes().to_vec()
    }

    pub async fn pending_approvals(&self) -> Vec<PendingApproval> {
        self.gate.list_pending().await
    }

    pub async fn approve(&self, approval_id: &str, reviewer: &str) -> Result<ApprovalItem> {
        self.gate.approve(approval_id, reviewer).await
    }

    pub async fn reject(&self, approval_id: &str, reviewer: &str, reason: &str) -> Result<ApprovalItem> {
        self.gate.reject(approval_id, reviewer, reason).await
    }

    // ========== Agents ==========

    pub async fn enhance(&self, request: EnhancementRequest) -> Result<EnhancementOutcome> {
        self.enhancer.enhance(request).await
    }

    pub async fn resume_enhancement(&self, agent_id: &str) -> Result<EnhancementOutcome> {
        self.enhancer.resume_pending(agent_id).await
    }

    pub async fn bulk_enhance(&self, agent_ids: &[AgentId], targets: &[String]) -> BulkEnhancementReport {
        self.enhancer.bulk_enhance(agent_ids, targets).await
    }

    pub async fn revoke(
        &self,
        agent_id: &str,
        capability: &str,
        reason: &str,
        revoked_by: &str,
    ) -> Result<CapabilityRevocation> {
        self.enhancer
            .revoke(agent_id, capability, reason, revoked_by)
            .await
    }

    pub async fn capabilities(&self, agent_id: &str) -> Result<BTreeSet<String>> {
        self.enhancer.capabilities(agent_id).await
    }

    pub async fn enhancement_history(&self, agent_id: &str) -> Vec<EnhancementRecord> {
        self.enhancer.history(agent_id).await
    }

    /// Register a new agent.
    pub async fn register_agent(&self, profile: AgentProfile) -> Result<AgentProfile> {
        self.enhancer.register(profile).await
    }

    pub async fn agents(&self) -> Vec<AgentProfile> {
        self.roster.read().await.list()
    }
}

/// Stored agents, or the configured seed agents when the store has none.
fn load_roster(config: &PipelineConfig, store: &dyn KnowledgeStore) -> Result<AgentRoster> {
    let stored = store.load_agents().map_err(PipelineError::persistence)?;
    if !stored.is_empty() {
        return Ok(AgentRoster::from_profiles(stored));
    }

    let mut roster = AgentRoster::new();
    for seed in &config.agents {
        let role: AgentRole = seed.role.parse()?;
        let profile =
            AgentProfile::new(seed.agent_id.clone(), role).with_capabilities(seed.capabilities.iter().cloned());
        store
            .upsert_agent(&profile)
            .map_err(PipelineError::persistence)?;
        roster.register(profile)?;
    }
    if !roster.is_empty() {
        tracing::info!("Seeded {} agents from configuration", roster.len());
    }
    Ok(roster)
}
