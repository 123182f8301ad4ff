//! Knowledge smith: turns queued tasks into Orbs and Runes.
//!
//! A synthesis run groups pending queue entries by category, merges their
//! evidence into the category's Orb, derives a Rune from the Orb's most common
//! commands and flags novel or risky content for approval. Only one run is in
//! flight at a time; callers arriving during a run receive its report.

use crate::knowledge::{
    changed_fraction, ApprovalItem, ApprovalSubject, FlagReason, KnowledgeBase, Orb, RiskLevel,
    Rune, RuneDraft, RuneParameters, RuneStatus, SharedKnowledge, SuccessCriteria,
};
use crate::locks::SingleFlight;
use crate::queue::{EntryStatus, RecurrenceHighlight, TrainingQueue, TrainingQueueEntry};
use crate::store::KnowledgeStore;
use crate::types::{union_into, Category, PipelineError, Result, TaskId};
use chrono::{DateTime, Utc};
use runeforge_config::SmithConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A per-item failure recorded during a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SynthesisError {
    pub task_id: Option<TaskId>,
    pub category: Option<Category>,
    pub message: String,
}

/// Summary of one synthesis run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SynthesisReport {
    pub run_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Orbs created or updated
    pub orbs_touched: usize,
    pub orbs_created: usize,
    pub runes_created: usize,
    /// New versions of existing Runes
    pub runes_updated: usize,
    /// Queue entries marked trained
    pub entries_processed: usize,
    pub approvals_created: usize,
    /// Categories left pending for lack of evidence
    pub groups_below_threshold: usize,
    pub recurrence_highlights: Vec<RecurrenceHighlight>,
    pub errors: Vec<SynthesisError>,
}

impl SynthesisReport {
    fn started() -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    fn aborted(message: String) -> Self {
        let mut report = Self::started();
        report.errors.push(SynthesisError {
            task_id: None,
            category: None,
            message,
        });
        report.finished_at = Some(Utc::now());
        report
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Fail with `PartialBatchFailure` when any item was skipped.
    pub fn ensure_complete(&self) -> Result<()> {
        if self.errors.is_empty() {
            return Ok(());
        }
        Err(PipelineError::PartialBatchFailure {
            stage: "synthesize",
            failed: self.errors.len(),
            total: self.entries_processed + self.errors.len(),
        })
    }
}

/// Changes computed for one category before they are committed.
#[derive(Debug, Default)]
struct GroupChanges {
    /// The updated Orb; `None` when every entry was already absorbed
    orb: Option<Orb>,
    orb_created: bool,
    runes: Vec<Rune>,
    rune_created: bool,
    rune_updated: bool,
    approvals: Vec<ApprovalItem>,
}

/// The parts of the knowledge base a category's changes were computed from.
#[derive(Debug, PartialEq)]
struct GroupBasis {
    orb: Option<Orb>,
    runes: Vec<Rune>,
}

impl GroupBasis {
    fn capture(knowledge: &KnowledgeBase, category: &str) -> Self {
        let orb = knowledge.orb_for_category(category).cloned();
        let runes = orb
            .as_ref()
            .and_then(|orb| knowledge.latest_rune_for_orb(&orb.orb_id))
            .map(|latest| {
                knowledge
                    .rune_versions(&latest.rune_id)
                    .into_iter()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Self { orb, runes }
    }
}

struct SmithCore {
    config: SmithConfig,
    queue: Arc<TrainingQueue>,
    knowledge: SharedKnowledge,
    store: Arc<dyn KnowledgeStore>,
}

/// Batch synthesizer of Orbs and Runes.
pub struct KnowledgeSmith {
    core: Arc<SmithCore>,
    flight: SingleFlight<SynthesisReport>,
}

impl std::fmt::Debug for KnowledgeSmith {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeSmith")
            .field("config", &self.core.config)
            .field("flight", &self.flight)
            .finish()
    }
}

impl KnowledgeSmith {
    pub fn new(
        config: SmithConfig,
        queue: Arc<TrainingQueue>,
        knowledge: SharedKnowledge,
        store: Arc<dyn KnowledgeStore>,
    ) -> Self {
        Self {
            core: Arc::new(SmithCore {
                config,
                queue,
                knowledge,
                store,
            }),
            flight: SingleFlight::new(),
        }
    }

    /// Run a synthesis batch, or join the one already running.
    ///
    /// The batch runs on its own task and finishes even if every caller goes
    /// away.
    pub async fn synthesize(&self) -> SynthesisReport {
        let core = Arc::clone(&self.core);
        self.flight
            .run(async move {
                match tokio::spawn(async move { core.run().await }).await {
                    Ok(report) => report,
                    Err(e) => {
                        tracing::error!("Synthesis task failed: {}", e);
                        SynthesisReport::aborted(format!("synthesis task failed: {e}"))
                    }
                }
            })
            .await
    }

    pub fn is_running(&self) -> bool {
        self.flight.in_flight()
    }
}

impl SmithCore {
    async fn run(&self) -> SynthesisReport {
        let mut report = SynthesisReport::started();
        let pending = self
            .queue
            .list_by_status(EntryStatus::Pending)
            .await;

        let mut groups: Vec<(Category, Vec<TrainingQueueEntry>)> = Vec::new();
        for entry in pending {
            if !self.config.include_incomplete && entry.solution.is_none() {
                continue;
            }
            if let Err(message) = entry.check_complete() {
                tracing::warn!("Skipping malformed queue entry: {}", message);
                report.errors.push(SynthesisError {
                    task_id: Some(entry.task.task_id.clone()).filter(|id| !id.is_empty()),
                    category: None,
                    message,
                });
                continue;
            }

            let category = entry.category();
            match groups.iter_mut().find(|(c, _)| *c == category) {
                Some((_, entries)) => entries.push(entry),
                None => groups.push((category, vec![entry])),
            }
        }

        let mut consumed: Vec<TaskId> = Vec::new();
        for (category, entries) in groups {
            if entries.len() < self.config.min_evidence {
                tracing::debug!(
                    "Category '{}' has {} entries, below minimum evidence {}",
                    category,
                    entries.len(),
                    self.config.min_evidence
                );
                report.groups_below_threshold += 1;
                continue;
            }

            match self.apply_group(&category, &entries).await {
                Ok(changes) if changes.orb.is_none() => {
                    tracing::debug!(
                        "Category '{}' entries were already absorbed; marking them trained",
                        category
                    );
                    consumed.extend(entries.into_iter().map(|e| e.task.task_id));
                }
                Ok(changes) => {
                    report.orbs_touched += 1;
                    report.orbs_created += usize::from(changes.orb_created);
                    report.runes_created += usize::from(changes.rune_created);
                    report.runes_updated += usize::from(changes.rune_updated);
                    report.approvals_created += changes.approvals.len();

                    let threshold = self.queue.highlight_threshold();
                    for entry in &entries {
                        if entry.recurrence >= threshold {
                            report.recurrence_highlights.push(RecurrenceHighlight {
                                task_id: entry.task.task_id.clone(),
                                category: category.clone(),
                                recurrence: entry.recurrence,
                                status: EntryStatus::Trained,
                            });
                        }
                    }
                    consumed.extend(entries.into_iter().map(|e| e.task.task_id));
                }
                Err(e) => {
                    tracing::error!("Failed to synthesize category '{}': {}", category, e);
                    report.errors.push(SynthesisError {
                        task_id: None,
                        category: Some(category),
                        message: e.to_string(),
                    });
                }
            }
        }

        for task_id in consumed {
            match self.queue.mark_trained(&task_id).await {
                Ok(true) => report.entries_processed += 1,
                Ok(false) => {}
                Err(e) => report.errors.push(SynthesisError {
                    task_id: Some(task_id),
                    category: None,
                    message: e.to_string(),
                }),
            }
        }

        report.finished_at = Some(Utc::now());
        tracing::info!(
            "Synthesis {} finished: {} orbs touched, {} runes created, {} updated, {} entries, {} errors",
            report.run_id,
            report.orbs_touched,
            report.runes_created,
            report.runes_updated,
            report.entries_processed,
            report.errors.len()
        );
        report
    }

    /// Merge a category's entries into its Orb and derive the Rune.
    ///
    /// Changes are computed under a read lock. The write lock is taken only to
    /// write them to the store and then to the in-memory knowledge base; if the
    /// category's Orb or Runes moved in between, the changes are recomputed.
    async fn apply_group(&self, category: &str, entries: &[TrainingQueueEntry]) -> Result<GroupChanges> {
        let (basis, computed) = {
            let knowledge = self.knowledge.read().await;
            (
                GroupBasis::capture(&knowledge, category),
                self.compute_group(&knowledge, category, entries),
            )
        };

        let mut knowledge = self.knowledge.write().await;
        let changes = if GroupBasis::capture(&knowledge, category) == basis {
            computed
        } else {
            tracing::debug!("Knowledge for '{}' changed during synthesis; recomputing", category);
            self.compute_group(&knowledge, category, entries)
        };
        let Some(orb) = changes.orb.as_ref() else {
            return Ok(changes);
        };

        self.store
            .upsert_orb(orb)
            .map_err(PipelineError::persistence)?;
        for rune in &changes.runes {
            self.store
                .upsert_rune(rune)
                .map_err(PipelineError::persistence)?;
        }
        for item in &changes.approvals {
            self.store
                .upsert_approval(item)
                .map_err(PipelineError::persistence)?;
        }

        tracing::debug!(
            "Orb '{}' ({}) now holds {} tasks",
            orb.name,
            orb.orb_id,
            orb.knowledge.task_count
        );
        knowledge.upsert_orb(orb.clone());
        for rune in &changes.runes {
            knowledge.upsert_rune(rune.clone());
        }
        for item in &changes.approvals {
            knowledge.upsert_approval(item.clone());
        }
        Ok(changes)
    }

    /// Fold the entries the Orb has not seen yet into it and derive the Rune.
    fn compute_group(
        &self,
        knowledge: &KnowledgeBase,
        category: &str,
        entries: &[TrainingQueueEntry],
    ) -> GroupChanges {
        let mut changes = GroupChanges::default();

        let mut orb = match knowledge.orb_for_category(category) {
            Some(orb) => orb.clone(),
            None => {
                changes.orb_created = true;
                Orb::new(category)
            }
        };

        let mut absorbed = 0;
        for entry in entries {
            if orb.absorbed.contains(&entry.task.task_id) {
                tracing::debug!("Orb '{}' already holds task '{}'", orb.name, entry.task.task_id);
                continue;
            }
            self.absorb(&mut orb, entry);
            absorbed += 1;
        }
        if absorbed == 0 {
            return GroupChanges::default();
        }
        orb.updated_at = Utc::now();

        if let Some(draft) = self.draft_rune(&orb) {
            self.derive_rune(knowledge, &orb, draft, &mut changes);
        } else if changes.orb_created {
            changes.approvals.push(ApprovalItem::new(
                ApprovalSubject::Orb {
                    orb_id: orb.orb_id.clone(),
                },
                vec![FlagReason::FirstOccurrence],
            ));
        }

        changes.orb = Some(orb);
        changes
    }

    fn absorb(&self, orb: &mut Orb, entry: &TrainingQueueEntry) {
        union_into(&mut orb.tags, &entry.task.tags);
        union_into(&mut orb.knowledge.tools, &entry.task.tools);
        orb.knowledge.record_commands(&entry.all_commands());

        let success = entry.solution.as_ref().map(|s| s.success).unwrap_or(false);
        if let Some(solution) = entry.solution.as_ref().filter(|s| s.success) {
            for pattern in extract_success_patterns(&solution.summary, &self.config.success_markers) {
                if orb.knowledge.success_patterns.len() >= self.config.max_success_patterns {
                    break;
                }
                union_into(&mut orb.knowledge.success_patterns, &[pattern]);
            }
        }

        orb.knowledge.record_outcome(success);
        orb.absorb_confidence(entry.assessment.score);
        orb.absorbed.insert(entry.task.task_id.clone());
    }

    fn draft_rune(&self, orb: &Orb) -> Option<RuneDraft> {
        let commands = orb.knowledge.top_commands(self.config.max_rune_commands);
        if commands.is_empty() {
            return None;
        }

        let estimated_time_secs = self.config.per_command_secs * commands.len() as u64;
        let risk_level = assess_risk(&commands, &self.config.high_risk_markers);

        Some(RuneDraft {
            name: format!("{} {}", orb.category, self.config.action_type),
            description: format!(
                "Runs the most common {} commands recorded in {}",
                orb.category, orb.name
            ),
            action_type: self.config.action_type.clone(),
            parameters: RuneParameters {
                tools_required: orb.knowledge.tools.clone(),
                estimated_time_secs,
                risk_level,
            },
            success_criteria: SuccessCriteria {
                exit_code: 0,
                output_contains: orb.knowledge.success_patterns.first().cloned(),
                timeout_secs: self.config.base_timeout_secs + estimated_time_secs,
            },
            commands,
        })
    }

    fn derive_rune(
        &self,
        knowledge: &KnowledgeBase,
        orb: &Orb,
        draft: RuneDraft,
        changes: &mut GroupChanges,
    ) {
        let high_risk = draft.parameters.risk_level == RiskLevel::High;

        let Some(latest) = knowledge.latest_rune_for_orb(&orb.orb_id) else {
            let mut reasons = vec![FlagReason::FirstOccurrence];
            if high_risk {
                reasons.push(FlagReason::HighRisk);
            }
            let rune_id = uuid::Uuid::new_v4().to_string();
            let mut rune = Rune::from_draft(rune_id, 1, orb, draft, RuneStatus::PendingApproval);
            let item = ApprovalItem::new(
                ApprovalSubject::Rune {
                    orb_id: orb.orb_id.clone(),
                    rune_id: rune.rune_id.clone(),
                    version: rune.version,
                },
                reasons,
            );
            rune.approval_id = Some(item.approval_id.clone());
            tracing::info!("New rune '{}' for category '{}' awaits approval", rune.rune_id, orb.category);
            changes.runes.push(rune);
            changes.approvals.push(item);
            changes.rune_created = true;
            return;
        };

        if latest.same_content(&draft) {
            return;
        }

        let active = knowledge.active_rune(&latest.rune_id);
        let baseline = active.unwrap_or(latest);
        let fraction = changed_fraction(&baseline.commands, &draft.commands);

        let mut reasons = Vec::new();
        if fraction > self.config.material_change_fraction {
            reasons.push(FlagReason::MaterialChange {
                changed_fraction: fraction,
            });
        }
        if high_risk {
            reasons.push(FlagReason::HighRisk);
        }
        if latest.status == RuneStatus::PendingApproval {
            reasons.push(FlagReason::PendingPredecessor);
            let mut superseded = latest.clone();
            superseded.status = RuneStatus::Superseded;
            changes.runes.push(superseded);
        } else if active.is_none() {
            reasons.push(FlagReason::NoApprovedPredecessor);
        }

        let version = latest.version + 1;
        let rune_id = latest.rune_id.clone();
        if reasons.is_empty() {
            changes.runes.extend(knowledge.superseded_by(&rune_id, version));
            let rune = Rune::from_draft(rune_id, version, orb, draft, RuneStatus::Active);
            tracing::info!("Rune '{}' advanced to v{}", rune.rune_id, rune.version);
            changes.runes.push(rune);
        } else {
            let mut rune = Rune::from_draft(rune_id, version, orb, draft, RuneStatus::PendingApproval);
            let item = ApprovalItem::new(
                ApprovalSubject::Rune {
                    orb_id: orb.orb_id.clone(),
                    rune_id: rune.rune_id.clone(),
                    version,
                },
                reasons,
            );
            rune.approval_id = Some(item.approval_id.clone());
            tracing::info!(
                "Rune '{}' v{} flagged for approval ({:.0}% of commands changed)",
                rune.rune_id,
                version,
                fraction * 100.0
            );
            changes.runes.push(rune);
            changes.approvals.push(item);
        }
        changes.rune_updated = true;
    }
}

/// Risk of a command sequence: any high-risk marker makes it high, long
/// sequences are medium.
fn assess_risk(commands: &[String], markers: &[String]) -> RiskLevel {
    let high = commands.iter().any(|command| {
        let command = command.to_ascii_lowercase();
        markers
            .iter()
            .any(|marker| command.contains(&marker.to_ascii_lowercase()))
    });
    if high {
        RiskLevel::High
    } else if commands.len() > 3 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Phrases of a solution summary that mention a success marker.
fn extract_success_patterns(summary: &str, markers: &[String]) -> Vec<String> {
    summary
        .split(['.', ';', '\n'])
        .map(str::trim)
        .filter(|phrase| !phrase.is_empty())
        .filter(|phrase| {
            let lowered = phrase.to_ascii_lowercase();
            let words: Vec<&str> = lowered
                .split(|c: char| !c.is_ascii_alphanumeric())
                .filter(|w| !w.is_empty())
                .collect();
            markers
                .iter()
                .any(|m| words.contains(&m.to_ascii_lowercase().as_str()))
        })
        .map(str::to_string)
        .collect()
}
