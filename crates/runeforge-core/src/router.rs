//! Routing state machine.
//!
//! ```text
//! received -> evaluated -> direct_assigned -> completed | failed
//!                       -> queued_for_learning
//!                       -> manual_review
//!                       -> failed            (training queue write failed)
//! ```
//!
//! Every submission gets its own routing record and passes through
//! `evaluated` exactly once. Resubmitting an identifier, or asking for
//! re-evaluation, starts a new record; earlier records keep their history.

use crate::evaluator::{ConfidenceAssessment, ConfidenceEvaluator};
use crate::locks::KeyedLocks;
use crate::queue::TrainingQueue;
use crate::roster::SharedRoster;
use crate::types::{AgentId, PipelineError, Result, Task, TaskId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runeforge_config::RouterConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Routing state of one submission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RouteState {
    Received,
    Evaluated,
    DirectAssigned,
    QueuedForLearning,
    ManualReview,
    Completed,
    Failed,
}

impl RouteState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RouteState) -> bool {
        use RouteState::*;
        matches!(
            (self, next),
            (Received, Evaluated)
                | (Evaluated, DirectAssigned)
                | (Evaluated, QueuedForLearning)
                | (Evaluated, ManualReview)
                | (Evaluated, Failed)
                | (DirectAssigned, Completed)
                | (DirectAssigned, Failed)
        )
    }

    /// No Router-driven transition leaves these states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RouteState::Completed
                | RouteState::Failed
                | RouteState::QueuedForLearning
                | RouteState::ManualReview
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RouteState::Received => "received",
            RouteState::Evaluated => "evaluated",
            RouteState::DirectAssigned => "direct_assigned",
            RouteState::QueuedForLearning => "queued_for_learning",
            RouteState::ManualReview => "manual_review",
            RouteState::Completed => "completed",
            RouteState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RouteState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task was handed to a human.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ManualReviewReason {
    LowConfidence,
    NoCapableAgent,
}

/// Decision taken from `evaluated`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum RouteDecision {
    DirectAssign { agent_id: AgentId, coverage: usize },
    QueueForLearning,
    ManualReview { reason: ManualReviewReason },
}

impl RouteDecision {
    fn target_state(&self) -> RouteState {
        match self {
            RouteDecision::DirectAssign { .. } => RouteState::DirectAssigned,
            RouteDecision::QueueForLearning => RouteState::QueuedForLearning,
            RouteDecision::ManualReview { .. } => RouteState::ManualReview,
        }
    }
}

/// One state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transition {
    pub from: Option<RouteState>,
    pub to: RouteState,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Routing record of one submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRecord {
    pub submission_id: String,
    /// 1 for the first submission of a task identifier
    pub attempt: u32,
    pub task: Task,
    pub state: RouteState,
    pub assessment: Option<ConfidenceAssessment>,
    pub decision: Option<RouteDecision>,
    pub agent_id: Option<AgentId>,
    pub history: Vec<Transition>,
    pub error: Option<String>,
}

impl RoutingRecord {
    fn received(task: Task, attempt: u32) -> Self {
        Self {
            submission_id: uuid::Uuid::new_v4().to_string(),
            attempt,
            task,
            state: RouteState::Received,
            assessment: None,
            decision: None,
            agent_id: None,
            history: vec![Transition {
                from: None,
                to: RouteState::Received,
                at: Utc::now(),
                note: None,
            }],
            error: None,
        }
    }

    fn transition(&mut self, to: RouteState, stage: &'static str, note: Option<String>) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(PipelineError::invalid_state(
                self.task.task_id.clone(),
                stage,
                format!("cannot move from {} to {}", self.state, to),
            ));
        }
        self.history.push(Transition {
            from: Some(self.state),
            to,
            at: Utc::now(),
            note,
        });
        self.state = to;
        Ok(())
    }
}

/// Outcome reported by an agent for a directly assigned task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AgentOutcome {
    Success { result: String },
    Failure { error: String },
}

/// Hands a task to an agent.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Execute the task and return its result.
    async fn execute(&self, agent_id: &str, task: &Task) -> anyhow::Result<String>;
}

#[derive(Debug, Default)]
struct RouterArena {
    records: Vec<RoutingRecord>,
    by_task: HashMap<TaskId, Vec<usize>>,
}

impl RouterArena {
    fn latest_index(&self, task_id: &str) -> Option<usize> {
        self.by_task.get(task_id).and_then(|ids| ids.last().copied())
    }

    fn attempts(&self, task_id: &str) -> u32 {
        self.by_task.get(task_id).map(|ids| ids.len() as u32).unwrap_or(0)
    }

    fn push(&mut self, record: RoutingRecord) {
        self.by_task
            .entry(record.task.task_id.clone())
            .or_default()
            .push(self.records.len());
        self.records.push(record);
    }
}

/// Routes evaluated tasks to agents, the training queue or human review.
pub struct Router {
    config: RouterConfig,
    evaluator: Arc<ConfidenceEvaluator>,
    roster: SharedRoster,
    queue: Arc<TrainingQueue>,
    arena: RwLock<RouterArena>,
    locks: KeyedLocks,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Router {
    pub fn new(
        config: RouterConfig,
        evaluator: Arc<ConfidenceEvaluator>,
        roster: SharedRoster,
        queue: Arc<TrainingQueue>,
    ) -> Self {
        Self {
            config,
            evaluator,
            roster,
            queue,
            arena: RwLock::new(RouterArena::default()),
            locks: KeyedLocks::new(),
        }
    }

    /// Evaluate and route a new submission.
    pub async fn submit(&self, task: Task) -> Result<RoutingRecord> {
        let _guard = self.locks.lock(&task.task_id).await;
        self.route(task).await
    }

    /// Route the latest snapshot of a task again as a new submission.
    pub async fn reevaluate(&self, task_id: &str) -> Result<RoutingRecord> {
        let _guard = self.locks.lock(task_id).await;
        let task = {
            let arena = self.arena.read().await;
            let index = arena
                .latest_index(task_id)
                .ok_or_else(|| PipelineError::not_found("routing record", task_id))?;
            arena.records[index].task.clone()
        };
        tracing::info!("Re-evaluating task '{}'", task_id);
        self.route(task).await
    }

    /// The score band decision for an assessment.
    pub async fn decide(&self, assessment: &ConfidenceAssessment) -> RouteDecision {
        if assessment.score >= self.config.direct_assign_threshold {
            match self.roster.read().await.select_for(&assessment.category) {
                Some(pick) => RouteDecision::DirectAssign {
                    agent_id: pick.agent_id,
                    coverage: pick.coverage,
                },
                None => RouteDecision::ManualReview {
                    reason: ManualReviewReason::NoCapableAgent,
                },
            }
        } else if assessment.score >= self.config.learning_threshold {
            RouteDecision::QueueForLearning
        } else {
            RouteDecision::ManualReview {
                reason: ManualReviewReason::LowConfidence,
            }
        }
    }

    async fn route(&self, task: Task) -> Result<RoutingRecord> {
        let attempt = self.arena.read().await.attempts(&task.task_id) + 1;
        let mut record = RoutingRecord::received(task, attempt);

        let assessment = self.evaluator.assess(&record.task);
        record.transition(
            RouteState::Evaluated,
            "evaluate",
            Some(format!("score {:.2}, category {}", assessment.score, assessment.category)),
        )?;

        let decision = self.decide(&assessment).await;
        record.assessment = Some(assessment.clone());
        record.decision = Some(decision.clone());

        let queued = if decision == RouteDecision::QueueForLearning {
            self.queue
                .enqueue(record.task.clone(), assessment, None)
                .await
                .map(|_| ())
        } else {
            Ok(())
        };

        match &queued {
            Ok(()) => {
                record.transition(decision.target_state(), "route", None)?;
                if let RouteDecision::DirectAssign { agent_id, .. } = &decision {
                    record.agent_id = Some(agent_id.clone());
                }
            }
            Err(e) => {
                tracing::error!("Failed to queue task '{}' for learning: {}", record.task.task_id, e);
                record.transition(RouteState::Failed, "route", Some(e.to_string()))?;
                record.error = Some(e.to_string());
            }
        }

        tracing::info!(
            "Task '{}' (attempt {}) routed to {}",
            record.task.task_id,
            record.attempt,
            record.state
        );
        self.arena.write().await.push(record.clone());
        queued.map(|_| record)
    }

    /// Hand a directly assigned task to its agent under the dispatch timeout.
    /// An agent error marks the task failed; a timeout marks it failed and
    /// is returned as `DownstreamTimeout`.
    pub async fn dispatch(&self, task_id: &str, executor: &dyn AgentExecutor) -> Result<RoutingRecord> {
        let _guard = self.locks.lock(task_id).await;
        let (agent_id, task) = {
            let arena = self.arena.read().await;
            let record = arena
                .latest_index(task_id)
                .map(|i| &arena.records[i])
                .ok_or_else(|| PipelineError::not_found("routing record", task_id))?;
            match (&record.state, &record.agent_id) {
                (RouteState::DirectAssigned, Some(agent_id)) => (agent_id.clone(), record.task.clone()),
                _ => {
                    return Err(PipelineError::invalid_state(
                        task_id,
                        "dispatch",
                        format!("task is {}, expected direct_assigned", record.state),
                    ))
                }
            }
        };

        let timeout = Duration::from_millis(self.config.dispatch_timeout_ms);
        match tokio::time::timeout(timeout, executor.execute(&agent_id, &task)).await {
            Ok(Ok(result)) => {
                self.finish(task_id, AgentOutcome::Success { result }, "dispatch")
                    .await
            }
            Ok(Err(e)) => {
                tracing::warn!("Agent '{}' failed task '{}': {:#}", agent_id, task_id, e);
                self.finish(
                    task_id,
                    AgentOutcome::Failure {
                        error: format!("{e:#}"),
                    },
                    "dispatch",
                )
                .await
            }
            Err(_) => {
                tracing::warn!(
                    "Agent '{}' did not answer task '{}' within {:?}",
                    agent_id,
                    task_id,
                    timeout
                );
                self.finish(
                    task_id,
                    AgentOutcome::Failure {
                        error: format!("timed out after {timeout:?}"),
                    },
                    "dispatch",
                )
                .await?;
                Err(PipelineError::DownstreamTimeout {
                    id: task_id.to_string(),
                    stage: "dispatch",
                    timeout,
                })
            }
        }
    }

    /// Record the outcome an agent reported for a directly assigned task.
    pub async fn report_outcome(&self, task_id: &str, outcome: AgentOutcome) -> Result<RoutingRecord> {
        let _guard = self.locks.lock(task_id).await;
        self.finish(task_id, outcome, "report_outcome").await
    }

    async fn finish(&self, task_id: &str, outcome: AgentOutcome, stage: &'static str) -> Result<RoutingRecord> {
        let mut arena = self.arena.write().await;
        let index = arena
            .latest_index(task_id)
            .ok_or_else(|| PipelineError::not_found("routing record", task_id))?;
        let record = &mut arena.records[index];

        match outcome {
            AgentOutcome::Success { result } => {
                record.transition(RouteState::Completed, stage, None)?;
                record.task.completed_at = Some(Utc::now());
                record.task.result = Some(result);
            }
            AgentOutcome::Failure { error } => {
                record.transition(RouteState::Failed, stage, Some(error.clone()))?;
                record.error = Some(error);
            }
        }
        tracing::info!("Task '{}' {}", task_id, record.state);
        Ok(record.clone())
    }

    /// Latest submission of a task.
    pub async fn latest(&self, task_id: &str) -> Option<RoutingRecord> {
        let arena = self.arena.read().await;
        arena.latest_index(task_id).map(|i| arena.records[i].clone())
    }

    /// Every submission of a task, oldest first.
    pub async fn submissions(&self, task_id: &str) -> Vec<RoutingRecord> {
        let arena = self.arena.read().await;
        arena
            .by_task
            .get(task_id)
            .map(|ids| ids.iter().map(|&i| arena.records[i].clone()).collect())
            .unwrap_or_default()
    }

    /// Latest submissions currently in `state`, in submission order.
    pub async fn list_by_state(&self, state: RouteState) -> Vec<RoutingRecord> {
        let arena = self.arena.read().await;
        arena
            .records
            .iter()
            .enumerate()
            .filter(|(i, r)| r.state == state && arena.latest_index(&r.task.task_id) == Some(*i))
            .map(|(_, r)| r.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::{AgentProfile, AgentRole, AgentRoster};
    use crate::queue::EntryStatus;
    use crate::store::{FaultyStore, KnowledgeStore, MemoryStore};
    use crate::types::TaskPriority;
    use runeforge_config::{KeywordTables, QueueConfig, ScoringConfig};

    struct EchoExecutor;

    #[async_trait]
    impl AgentExecutor for EchoExecutor {
        async fn execute(&self, agent_id: &str, task: &Task) -> anyhow::Result<String> {
            Ok(format!("{agent_id} handled {}", task.task_id))
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl AgentExecutor for FailingExecutor {
        async fn execute(&self, _agent_id: &str, _task: &Task) -> anyhow::Result<String> {
            anyhow::bail!("helm release is locked")
        }
    }

    struct SlowExecutor;

    #[async_trait]
    impl AgentExecutor for SlowExecutor {
        async fn execute(&self, _agent_id: &str, _task: &Task) -> anyhow::Result<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".to_string())
        }
    }

    fn router_with(roster: AgentRoster, config: RouterConfig) -> (Router, Arc<TrainingQueue>) {
        router_over(roster, config, Arc::new(MemoryStore::new()))
    }

    fn router_over(
        roster: AgentRoster,
        config: RouterConfig,
        store: Arc<dyn KnowledgeStore>,
    ) -> (Router, Arc<TrainingQueue>) {
        let queue = Arc::new(TrainingQueue::new(QueueConfig::default(), store));
        let router = Router::new(
            config,
            Arc::new(ConfidenceEvaluator::new(
                KeywordTables::default(),
                ScoringConfig::default(),
            )),
            Arc::new(RwLock::new(roster)),
            Arc::clone(&queue),
        );
        (router, queue)
    }

    fn router() -> (Router, Arc<TrainingQueue>) {
        let mut roster = AgentRoster::new();
        roster
            .register(AgentProfile::new("infra", AgentRole::Infrastructure))
            .unwrap();
        router_with(roster, RouterConfig::default())
    }

    fn helm_task(id: &str) -> Task {
        Task::with_id(id, "Deploy Helm chart for microservice, kubernetes helm deployment")
    }

    #[test]
    fn test_transition_table() {
        assert!(RouteState::Received.can_transition_to(RouteState::Evaluated));
        assert!(!RouteState::Received.can_transition_to(RouteState::DirectAssigned));
        assert!(!RouteState::QueuedForLearning.can_transition_to(RouteState::Completed));
        assert!(!RouteState::Completed.can_transition_to(RouteState::Failed));
        assert!(RouteState::DirectAssigned.can_transition_to(RouteState::Failed));
        assert!(RouteState::Evaluated.can_transition_to(RouteState::Failed));
        assert!(!RouteState::ManualReview.can_transition_to(RouteState::Failed));
    }

    #[tokio::test]
    async fn test_high_confidence_is_direct_assigned() {
        let (router, _) = router();
        let record = router.submit(helm_task("a")).await.unwrap();

        assert_eq!(record.state, RouteState::DirectAssigned);
        assert_eq!(record.agent_id.as_deref(), Some("infra"));
        let states: Vec<RouteState> = record.history.iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![RouteState::Received, RouteState::Evaluated, RouteState::DirectAssigned]
        );
    }

    #[tokio::test]
    async fn test_no_capable_agent_goes_to_manual_review() {
        let (router, _) = router_with(AgentRoster::new(), RouterConfig::default());
        let record = router.submit(helm_task("a")).await.unwrap();
        assert_eq!(record.state, RouteState::ManualReview);
        assert_eq!(
            record.decision,
            Some(RouteDecision::ManualReview {
                reason: ManualReviewReason::NoCapableAgent
            })
        );
    }

    #[tokio::test]
    async fn test_mid_confidence_is_queued() {
        let (router, queue) = router();
        // two high keywords plus the infrastructure bonus land on 0.70
        let record = router
            .submit(Task::with_id("q", "kubernetes helm"))
            .await
            .unwrap();
        assert_eq!(record.state, RouteState::QueuedForLearning);
        assert!(queue.get("q").await.is_some());
    }

    #[tokio::test]
    async fn test_queue_write_failure_fails_submission() {
        let store = Arc::new(FaultyStore::default());
        store.fail_queue_writes(Some(EntryStatus::Pending));
        let (router, queue) = router_over(AgentRoster::new(), RouterConfig::default(), store.clone());

        let err = router
            .submit(Task::with_id("q", "kubernetes helm"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Persistence(_)));
        assert!(queue.get("q").await.is_none());

        let record = router.latest("q").await.unwrap();
        assert_eq!(record.state, RouteState::Failed);
        assert_eq!(record.decision, Some(RouteDecision::QueueForLearning));
        assert!(record.error.is_some());
        assert!(router
            .list_by_state(RouteState::QueuedForLearning)
            .await
            .is_empty());

        // once the store recovers, a re-evaluation queues the task
        store.fail_queue_writes(None);
        let retry = router.reevaluate("q").await.unwrap();
        assert_eq!(retry.state, RouteState::QueuedForLearning);
        assert!(queue.get("q").await.is_some());
    }

    #[tokio::test]
    async fn test_low_confidence_is_manual_review() {
        let (router, queue) = router();
        let record = router
            .submit(Task::with_id("b", "Investigate intermittent test failures"))
            .await
            .unwrap();
        assert_eq!(record.state, RouteState::ManualReview);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_resubmission_is_a_new_record() {
        let (router, _) = router();
        router.submit(helm_task("a")).await.unwrap();
        router
            .report_outcome(
                "a",
                AgentOutcome::Failure {
                    error: "boom".to_string(),
                },
            )
            .await
            .unwrap();

        let second = router.reevaluate("a").await.unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(second.state, RouteState::DirectAssigned);

        let all = router.submissions("a").await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].state, RouteState::Failed);
        assert_eq!(router.list_by_state(RouteState::Failed).await.len(), 0);
        assert_eq!(router.list_by_state(RouteState::DirectAssigned).await.len(), 1);
    }

    #[tokio::test]
    async fn test_report_outcome_requires_direct_assignment() {
        let (router, _) = router();
        router
            .submit(Task::with_id("b", "Investigate intermittent test failures"))
            .await
            .unwrap();

        let err = router
            .report_outcome(
                "b",
                AgentOutcome::Success {
                    result: "ok".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState { .. }));
        assert!(matches!(
            router
                .report_outcome("missing", AgentOutcome::Success { result: String::new() })
                .await,
            Err(PipelineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_dispatch_success_and_failure() {
        let (router, _) = router();
        router.submit(helm_task("ok")).await.unwrap();
        router.submit(helm_task("bad")).await.unwrap();

        let done = router.dispatch("ok", &EchoExecutor).await.unwrap();
        assert_eq!(done.state, RouteState::Completed);
        assert_eq!(done.task.result.as_deref(), Some("infra handled ok"));

        let failed = router.dispatch("bad", &FailingExecutor).await.unwrap();
        assert_eq!(failed.state, RouteState::Failed);
        assert!(failed.error.unwrap().contains("locked"));

        // terminal: no second dispatch
        assert!(matches!(
            router.dispatch("ok", &EchoExecutor).await,
            Err(PipelineError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_dispatch_timeout_fails_task() {
        let mut roster = AgentRoster::new();
        roster
            .register(AgentProfile::new("infra", AgentRole::Infrastructure))
            .unwrap();
        let (router, _) = router_with(
            roster,
            RouterConfig {
                dispatch_timeout_ms: 20,
                ..RouterConfig::default()
            },
        );
        router.submit(helm_task("slow")).await.unwrap();

        let err = router.dispatch("slow", &SlowExecutor).await.unwrap_err();
        assert!(matches!(err, PipelineError::DownstreamTimeout { stage: "dispatch", .. }));
        assert_eq!(router.latest("slow").await.unwrap().state, RouteState::Failed);
    }

    #[tokio::test]
    async fn test_high_priority_penalty_changes_route() {
        let (router, _) = router();
        let record = router
            .submit(helm_task("p").with_priority(TaskPriority::Critical))
            .await
            .unwrap();
        // 1.0 after the penalty is still above the direct threshold
        assert_eq!(record.state, RouteState::DirectAssigned);

        let record = router
            .submit(Task::with_id("p2", "kubernetes helm docker").with_priority(TaskPriority::High))
            .await
            .unwrap();
        // 0.90 + 0.10 - 0.10 stays in the learning band
        assert_eq!(record.state, RouteState::QueuedForLearning);
    }
}
