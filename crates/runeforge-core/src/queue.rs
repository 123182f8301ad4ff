//! Training queue: tasks waiting for knowledge extraction.
//!
//! Entries are keyed by task identifier and never duplicated. Mutations on the
//! same identifier are serialized through [`KeyedLocks`]; every mutation is
//! written to the store before it becomes visible in memory.

use crate::evaluator::ConfidenceAssessment;
use crate::locks::KeyedLocks;
use crate::store::KnowledgeStore;
use crate::types::{
    dedup_preserving_order, union_into, AgentId, Category, PipelineError, Result, RuneId, Task,
    TaskId,
};
use chrono::{DateTime, Utc};
use runeforge_config::QueueConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Status of a queue entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Waiting for the knowledge smith
    Pending,
    /// Consumed by a synthesis run
    Trained,
    /// Resolved by an existing Rune
    Matched,
    /// Handed back to a human or default handler
    Fallback,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Trained => "trained",
            EntryStatus::Matched => "matched",
            EntryStatus::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntryStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(EntryStatus::Pending),
            "trained" => Ok(EntryStatus::Trained),
            "matched" => Ok(EntryStatus::Matched),
            "fallback" => Ok(EntryStatus::Fallback),
            other => Err(PipelineError::Validation(format!(
                "unknown queue status '{other}'"
            ))),
        }
    }
}

/// Solution data attached when a queued task is completed manually.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Solution {
    pub summary: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default = "default_success")]
    pub success: bool,
    pub completed_at: DateTime<Utc>,
}

fn default_success() -> bool {
    true
}

impl Solution {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            success: true,
            completed_at: Utc::now(),
        }
    }

    pub fn with_commands(mut self, commands: &[&str]) -> Self {
        self.commands = commands.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }
}

/// A task snapshot captured at queuing time plus its learning status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingQueueEntry {
    pub task: Task,
    pub assessment: ConfidenceAssessment,
    pub status: EntryStatus,

    /// Times this task identifier has been queued
    pub recurrence: u32,

    pub agent_id: Option<AgentId>,
    pub solution: Option<Solution>,

    /// Insertion order
    pub seq: u64,

    pub queued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub matched_rune: Option<RuneId>,

    #[serde(default)]
    pub fallback_reason: Option<String>,
}

impl TrainingQueueEntry {
    /// Category used for grouping: the task's hint when given, otherwise the
    /// assessed category.
    pub fn category(&self) -> Category {
        self.task
            .normalized_hint()
            .unwrap_or_else(|| self.assessment.category.clone())
    }

    /// Commands recorded for this entry: the task's, then the solution's.
    pub fn all_commands(&self) -> Vec<String> {
        let mut commands = self.task.commands.clone();
        if let Some(solution) = &self.solution {
            union_into(&mut commands, &solution.commands);
        }
        commands
    }

    /// Check that the fields the knowledge smith relies on are present.
    pub fn check_complete(&self) -> std::result::Result<(), String> {
        if self.task.task_id.trim().is_empty() {
            return Err("entry has no task identifier".to_string());
        }
        if self.task.description.trim().is_empty() {
            return Err(format!("task {} has no description", self.task.task_id));
        }
        if self.category().trim().is_empty() {
            return Err(format!("task {} has no category", self.task.task_id));
        }
        Ok(())
    }
}

/// Result of an enqueue call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    pub entry: TrainingQueueEntry,
    /// False when an existing entry absorbed the task
    pub created: bool,
}

/// A task seen repeatedly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecurrenceHighlight {
    pub task_id: TaskId,
    pub category: Category,
    pub recurrence: u32,
    pub status: EntryStatus,
}

/// Read-only summary of the queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueDigest {
    pub total: usize,
    pub pending: usize,
    pub trained: usize,
    pub matched: usize,
    pub fallback: usize,
    /// In insertion order
    pub recurrence_highlights: Vec<RecurrenceHighlight>,
}

#[derive(Debug, Default)]
struct QueueArena {
    entries: Vec<TrainingQueueEntry>,
    index: HashMap<TaskId, usize>,
}

impl QueueArena {
    fn get(&self, task_id: &str) -> Option<&TrainingQueueEntry> {
        self.index.get(task_id).map(|&i| &self.entries[i])
    }

    fn put(&mut self, entry: TrainingQueueEntry) {
        match self.index.get(&entry.task.task_id) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.index
                    .insert(entry.task.task_id.clone(), self.entries.len());
                self.entries.push(entry);
            }
        }
    }
}

/// Durable, deduplicated queue of tasks pending knowledge extraction.
pub struct TrainingQueue {
    config: QueueConfig,
    store: Arc<dyn KnowledgeStore>,
    arena: RwLock<QueueArena>,
    locks: KeyedLocks,
    next_seq: AtomicU64,
}

impl std::fmt::Debug for TrainingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingQueue")
            .field("config", &self.config)
            .field("next_seq", &self.next_seq)
            .finish()
    }
}

impl TrainingQueue {
    /// Create an empty queue backed by `store`.
    pub fn new(config: QueueConfig, store: Arc<dyn KnowledgeStore>) -> Self {
        Self {
            config,
            store,
            arena: RwLock::new(QueueArena::default()),
            locks: KeyedLocks::new(),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Load existing entries from `store`.
    pub fn hydrate(config: QueueConfig, store: Arc<dyn KnowledgeStore>) -> Result<Self> {
        let entries = store
            .load_queue_entries()
            .map_err(PipelineError::persistence)?;
        let next_seq = entries.iter().map(|e| e.seq).max().unwrap_or(0) + 1;

        let mut arena = QueueArena::default();
        for entry in entries {
            arena.put(entry);
        }
        tracing::debug!("Hydrated training queue with {} entries", arena.entries.len());

        Ok(Self {
            config,
            store,
            arena: RwLock::new(arena),
            locks: KeyedLocks::new(),
            next_seq: AtomicU64::new(next_seq),
        })
    }

    /// Queue a task. An existing entry for the same identifier absorbs it:
    /// recurrence is incremented and tags, tools and commands are merged.
    pub async fn enqueue(
        &self,
        task: Task,
        assessment: ConfidenceAssessment,
        agent_id: Option<AgentId>,
    ) -> Result<EnqueueOutcome> {
        if task.task_id.trim().is_empty() {
            return Err(PipelineError::Validation(
                "cannot queue a task without an identifier".to_string(),
            ));
        }

        let _guard = self.locks.lock(&task.task_id).await;
        let existing = self.arena.read().await.get(&task.task_id).cloned();
        let now = Utc::now();

        let (entry, created) = match existing {
            Some(mut entry) => {
                entry.recurrence += 1;
                union_into(&mut entry.task.tags, &task.tags);
                union_into(&mut entry.task.tools, &task.tools);
                union_into(&mut entry.task.commands, &task.commands);
                if entry.task.category_hint.is_none() {
                    entry.task.category_hint = task.category_hint;
                }
                if agent_id.is_some() {
                    entry.agent_id = agent_id;
                }
                entry.updated_at = now;
                (entry, false)
            }
            None => {
                let mut task = task;
                task.tags = dedup_preserving_order(task.tags);
                task.tools = dedup_preserving_order(task.tools);
                task.commands = dedup_preserving_order(task.commands);
                let entry = TrainingQueueEntry {
                    task,
                    assessment,
                    status: EntryStatus::Pending,
                    recurrence: 1,
                    agent_id,
                    solution: None,
                    seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
                    queued_at: now,
                    updated_at: now,
                    matched_rune: None,
                    fallback_reason: None,
                };
                (entry, true)
            }
        };

        self.persist(&entry)?;
        self.arena.write().await.put(entry.clone());

        if created {
            tracing::info!("Queued task '{}' for learning", entry.task.task_id);
        } else {
            tracing::info!(
                "Task '{}' seen again, recurrence now {}",
                entry.task.task_id,
                entry.recurrence
            );
        }
        Ok(EnqueueOutcome { entry, created })
    }

    /// Attach solution data to a pending entry.
    pub async fn mark_completed(&self, task_id: &str, solution: Solution) -> Result<TrainingQueueEntry> {
        self.update(task_id, "mark_completed", |entry| {
            if entry.status != EntryStatus::Pending {
                return Err(format!("entry is {}, expected pending", entry.status));
            }
            if entry.solution.is_some() {
                return Err("entry already has a solution".to_string());
            }
            entry.task.completed_at = Some(solution.completed_at);
            entry.task.result = Some(solution.summary.clone());
            entry.solution = Some(solution);
            Ok(())
        })
        .await
    }

    /// Record that an existing Rune resolved a pending entry.
    pub async fn mark_matched(&self, task_id: &str, rune_id: &str) -> Result<TrainingQueueEntry> {
        let rune_id = rune_id.to_string();
        self.update(task_id, "mark_matched", |entry| {
            if entry.status != EntryStatus::Pending {
                return Err(format!("entry is {}, expected pending", entry.status));
            }
            entry.status = EntryStatus::Matched;
            entry.matched_rune = Some(rune_id);
            Ok(())
        })
        .await
    }

    /// Record that a pending entry was handed to a fallback handler.
    pub async fn mark_fallback(&self, task_id: &str, reason: &str) -> Result<TrainingQueueEntry> {
        let reason = reason.to_string();
        self.update(task_id, "mark_fallback", |entry| {
            if entry.status != EntryStatus::Pending {
                return Err(format!("entry is {}, expected pending", entry.status));
            }
            entry.status = EntryStatus::Fallback;
            entry.fallback_reason = Some(reason);
            Ok(())
        })
        .await
    }

    /// Mark a consumed entry as trained. Entries that left `pending` since
    /// they were read are left alone; returns whether the entry changed.
    pub(crate) async fn mark_trained(&self, task_id: &str) -> Result<bool> {
        let result = self
            .update(task_id, "mark_trained", |entry| {
                if entry.status != EntryStatus::Pending {
                    return Err(format!("entry is {}", entry.status));
                }
                entry.status = EntryStatus::Trained;
                Ok(())
            })
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(PipelineError::InvalidState { message, .. }) => {
                tracing::debug!("Not marking '{}' trained: {}", task_id, message);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Recurrence at or above which entries are highlighted.
    pub fn highlight_threshold(&self) -> u32 {
        self.config.recurrence_highlight_threshold
    }

    pub async fn get(&self, task_id: &str) -> Option<TrainingQueueEntry> {
        self.arena.read().await.get(task_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.arena.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Entries with `status`, in insertion order.
    pub async fn list_by_status(&self, status: EntryStatus) -> Vec<TrainingQueueEntry> {
        let arena = self.arena.read().await;
        let mut entries: Vec<TrainingQueueEntry> = arena
            .entries
            .iter()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    /// Entries whose recurrence reached the highlight threshold, in insertion order.
    pub async fn recurrence_highlights(&self) -> Vec<RecurrenceHighlight> {
        let arena = self.arena.read().await;
        self.highlights_of(&arena.entries)
    }

    fn highlights_of(&self, entries: &[TrainingQueueEntry]) -> Vec<RecurrenceHighlight> {
        let mut highlights: Vec<(u64, RecurrenceHighlight)> = entries
            .iter()
            .filter(|e| e.recurrence >= self.config.recurrence_highlight_threshold)
            .map(|e| {
                (
                    e.seq,
                    RecurrenceHighlight {
                        task_id: e.task.task_id.clone(),
                        category: e.category(),
                        recurrence: e.recurrence,
                        status: e.status,
                    },
                )
            })
            .collect();
        highlights.sort_by_key(|(seq, _)| *seq);
        highlights.into_iter().map(|(_, h)| h).collect()
    }

    /// Counts per status plus recurrence highlights.
    pub async fn digest(&self) -> QueueDigest {
        let arena = self.arena.read().await;
        let mut digest = QueueDigest {
            total: arena.entries.len(),
            ..Default::default()
        };
        for entry in &arena.entries {
            match entry.status {
                EntryStatus::Pending => digest.pending += 1,
                EntryStatus::Trained => digest.trained += 1,
                EntryStatus::Matched => digest.matched += 1,
                EntryStatus::Fallback => digest.fallback += 1,
            }
        }
        digest.recurrence_highlights = self.highlights_of(&arena.entries);
        digest
    }

    /// Apply `mutate` to one entry under its key lock and write it through.
    async fn update<F>(&self, task_id: &str, stage: &'static str, mutate: F) -> Result<TrainingQueueEntry>
    where
        F: FnOnce(&mut TrainingQueueEntry) -> std::result::Result<(), String>,
    {
        let _guard = self.locks.lock(task_id).await;
        let mut entry = self
            .arena
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("queue entry", task_id))?;

        mutate(&mut entry).map_err(|message| PipelineError::invalid_state(task_id, stage, message))?;
        entry.updated_at = Utc::now();

        self.persist(&entry)?;
        self.arena.write().await.put(entry.clone());
        tracing::debug!("Queue entry '{}' updated by {}", task_id, stage);
        Ok(entry)
    }

    fn persist(&self, entry: &TrainingQueueEntry) -> Result<()> {
        self.store.upsert_queue_entry(entry).map_err(|e| {
            tracing::error!(
                "Failed to persist queue entry '{}': {:#}",
                entry.task.task_id,
                e
            );
            PipelineError::persistence(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::ConfidenceEvaluator;
    use crate::store::MemoryStore;
    use runeforge_config::{KeywordTables, ScoringConfig};

    fn queue() -> (TrainingQueue, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (
            TrainingQueue::new(QueueConfig::default(), store.clone()),
            store,
        )
    }

    fn assessed(task: &Task) -> ConfidenceAssessment {
        ConfidenceEvaluator::new(KeywordTables::default(), ScoringConfig::default()).assess(task)
    }

    async fn enqueue(queue: &TrainingQueue, task: Task) -> EnqueueOutcome {
        let assessment = assessed(&task);
        queue.enqueue(task, assessment, None).await.unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let (queue, store) = queue();
        let first = enqueue(
            &queue,
            Task::with_id("t-1", "kubernetes helm rollout").with_tags(vec!["k8s".to_string()]),
        )
        .await;
        let second = enqueue(
            &queue,
            Task::with_id("t-1", "kubernetes helm rollout")
                .with_tags(vec!["prod".to_string(), "k8s".to_string()]),
        )
        .await;

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(queue.len().await, 1);

        let entry = queue.get("t-1").await.unwrap();
        assert_eq!(entry.recurrence, 2);
        assert_eq!(entry.task.tags, vec!["k8s", "prod"]);
        assert_eq!(store.load_queue_entries().unwrap()[0].recurrence, 2);
    }

    #[tokio::test]
    async fn test_concurrent_enqueue_loses_no_updates() {
        let (queue, _) = queue();
        let queue = Arc::new(queue);

        let mut handles = Vec::new();
        for i in 0..16 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let task = Task::with_id("same", "terraform plan")
                    .with_tags(vec![format!("tag-{i}")]);
                let assessment = assessed(&task);
                queue.enqueue(task, assessment, None).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let entry = queue.get("same").await.unwrap();
        assert_eq!(entry.recurrence, 16);
        assert_eq!(entry.task.tags.len(), 16);
    }

    #[tokio::test]
    async fn test_mark_completed_transitions() {
        let (queue, _) = queue();
        enqueue(&queue, Task::with_id("t-1", "helm upgrade")).await;

        let entry = queue
            .mark_completed("t-1", Solution::new("Deployed successfully").with_commands(&["helm upgrade app"]))
            .await
            .unwrap();
        assert_eq!(entry.status, EntryStatus::Pending);
        assert!(entry.solution.is_some());
        assert_eq!(entry.all_commands(), vec!["helm upgrade app"]);

        let again = queue.mark_completed("t-1", Solution::new("again")).await;
        assert!(matches!(again, Err(PipelineError::InvalidState { .. })));

        let missing = queue.mark_completed("nope", Solution::new("x")).await;
        assert!(matches!(missing, Err(PipelineError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_completion_handlers_require_pending() {
        let (queue, _) = queue();
        enqueue(&queue, Task::with_id("a", "audit firewall")).await;
        enqueue(&queue, Task::with_id("b", "scan certificates")).await;

        let matched = queue.mark_matched("a", "rune-1").await.unwrap();
        assert_eq!(matched.status, EntryStatus::Matched);
        assert_eq!(matched.matched_rune.as_deref(), Some("rune-1"));

        let fallback = queue.mark_fallback("b", "no rune").await.unwrap();
        assert_eq!(fallback.status, EntryStatus::Fallback);

        assert!(matches!(
            queue.mark_completed("a", Solution::new("x")).await,
            Err(PipelineError::InvalidState { stage: "mark_completed", .. })
        ));
        assert!(!queue.mark_trained("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_by_status_keeps_insertion_order() {
        let (queue, _) = queue();
        for id in ["c", "a", "b"] {
            enqueue(&queue, Task::with_id(id, "docker cleanup")).await;
        }
        queue.mark_fallback("a", "manual").await.unwrap();
        // a duplicate does not move an entry
        enqueue(&queue, Task::with_id("c", "docker cleanup")).await;

        let pending: Vec<String> = queue
            .list_by_status(EntryStatus::Pending)
            .await
            .into_iter()
            .map(|e| e.task.task_id)
            .collect();
        assert_eq!(pending, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_digest_counts_and_highlights() {
        let (queue, _) = queue();
        enqueue(&queue, Task::with_id("a", "helm install")).await;
        enqueue(&queue, Task::with_id("b", "helm install")).await;
        enqueue(&queue, Task::with_id("b", "helm install")).await;
        queue.mark_matched("a", "r").await.unwrap();

        let digest = queue.digest().await;
        assert_eq!(digest.total, 2);
        assert_eq!(digest.pending, 1);
        assert_eq!(digest.matched, 1);
        assert_eq!(digest.recurrence_highlights.len(), 1);
        assert_eq!(digest.recurrence_highlights[0].task_id, "b");
        assert_eq!(digest.recurrence_highlights[0].recurrence, 2);
    }

    #[tokio::test]
    async fn test_hydrate_restores_order_and_sequence() {
        let (queue, store) = queue();
        enqueue(&queue, Task::with_id("first", "helm install")).await;
        enqueue(&queue, Task::with_id("second", "helm install")).await;
        drop(queue);

        let queue = TrainingQueue::hydrate(QueueConfig::default(), store).unwrap();
        let third = enqueue(&queue, Task::with_id("third", "helm install")).await;
        assert_eq!(third.entry.seq, 3);

        let ids: Vec<String> = queue
            .list_by_status(EntryStatus::Pending)
            .await
            .into_iter()
            .map(|e| e.task.task_id)
            .collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_entry_category_prefers_hint() {
        let task = Task::with_id("k", "helm install").with_category_hint("Kubernetes");
        let entry = TrainingQueueEntry {
            assessment: assessed(&task),
            task,
            status: EntryStatus::Pending,
            recurrence: 1,
            agent_id: None,
            solution: None,
            seq: 1,
            queued_at: Utc::now(),
            updated_at: Utc::now(),
            matched_rune: None,
            fallback_reason: None,
        };
        assert_eq!(entry.category(), "kubernetes");
        assert!(entry.check_complete().is_ok());
    }
}
