//! Knowledge artifacts: Orbs (category clusters), Runes (versioned action
//! templates) and the approval items that gate them.

use crate::roster::capability_prefix;
use crate::types::{ApprovalId, Category, OrbId, RuneId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Knowledge base shared by the smith, approval gate and enhancement engine.
pub type SharedKnowledge = Arc<RwLock<KnowledgeBase>>;

/// Occurrence count of a command across an Orb's evidence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandStat {
    pub command: String,
    pub count: u64,
}

/// Knowledge body of an Orb.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OrbKnowledge {
    /// Union of tools used, first-seen order
    pub tools: Vec<String>,

    /// Commands ranked by occurrence, ties in first-seen order
    pub commands: Vec<String>,

    /// Command counts in first-seen order
    pub command_frequency: Vec<CommandStat>,

    /// Success phrases extracted from solution summaries
    pub success_patterns: Vec<String>,

    pub task_count: u64,
    pub success_count: u64,
    pub success_rate: f64,
}

impl OrbKnowledge {
    /// Count each command once.
    pub fn record_commands(&mut self, commands: &[String]) {
        for command in commands {
            match self
                .command_frequency
                .iter_mut()
                .find(|s| &s.command == command)
            {
                Some(stat) => stat.count += 1,
                None => self.command_frequency.push(CommandStat {
                    command: command.clone(),
                    count: 1,
                }),
            }
        }
        self.rerank();
    }

    fn rerank(&mut self) {
        let mut ranked: Vec<&CommandStat> = self.command_frequency.iter().collect();
        // stable sort keeps first-seen order between equal counts
        ranked.sort_by(|a, b| b.count.cmp(&a.count));
        self.commands = ranked.into_iter().map(|s| s.command.clone()).collect();
    }

    pub fn record_outcome(&mut self, success: bool) {
        self.task_count += 1;
        if success {
            self.success_count += 1;
        }
        self.success_rate = self.success_count as f64 / self.task_count as f64;
    }

    /// The `n` highest ranked commands.
    pub fn top_commands(&self, n: usize) -> Vec<String> {
        self.commands.iter().take(n).cloned().collect()
    }
}

/// A named knowledge cluster for a task category.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Orb {
    pub orb_id: OrbId,
    pub name: String,
    pub category: Category,
    pub tags: Vec<String>,
    pub knowledge: OrbKnowledge,
    /// Mean confidence score of the tasks absorbed so far
    pub confidence: f64,
    /// Queue entries already folded into this Orb
    #[serde(default)]
    pub absorbed: BTreeSet<TaskId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Orb {
    pub fn new(category: impl Into<String>) -> Self {
        let category = category.into();
        let now = Utc::now();
        Self {
            orb_id: uuid::Uuid::new_v4().to_string(),
            name: orb_name(&category),
            category,
            tags: Vec::new(),
            knowledge: OrbKnowledge::default(),
            confidence: 0.0,
            absorbed: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Fold one task's confidence into the running mean. Call after
    /// `knowledge.record_outcome` so `task_count` includes the task.
    pub fn absorb_confidence(&mut self, score: f64) {
        let n = self.knowledge.task_count.max(1) as f64;
        self.confidence += (score - self.confidence) / n;
    }
}

fn orb_name(category: &str) -> String {
    let mut chars = category.chars();
    match chars.next() {
        Some(first) => format!("{}{} knowledge", first.to_uppercase(), chars.as_str()),
        None => "Uncategorized knowledge".to_string(),
    }
}

/// Risk level of a Rune.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Execution parameters of a Rune.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuneParameters {
    pub tools_required: Vec<String>,
    pub estimated_time_secs: u64,
    pub risk_level: RiskLevel,
}

/// How to tell that a Rune run succeeded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuccessCriteria {
    pub exit_code: i32,
    pub output_contains: Option<String>,
    pub timeout_secs: u64,
}

/// Lifecycle of one Rune version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuneStatus {
    /// Usable for enhancement
    Active,
    /// Waiting on an approval item
    PendingApproval,
    /// Candidate rejected by a reviewer
    Rejected,
    /// Replaced by a newer version
    Superseded,
}

/// Content of a Rune version, before identity and status are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct RuneDraft {
    pub name: String,
    pub description: String,
    pub action_type: String,
    pub commands: Vec<String>,
    pub parameters: RuneParameters,
    pub success_criteria: SuccessCriteria,
}

/// One version of an executable action template derived from an Orb.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rune {
    /// Logical identifier shared by every version
    pub rune_id: RuneId,
    pub version: u32,
    pub name: String,
    pub description: String,
    pub orb_id: OrbId,
    pub category: Category,
    pub action_type: String,
    pub commands: Vec<String>,
    pub parameters: RuneParameters,
    pub success_criteria: SuccessCriteria,
    pub status: RuneStatus,
    pub approval_id: Option<ApprovalId>,
    pub created_at: DateTime<Utc>,
}

impl Rune {
    pub fn from_draft(
        rune_id: RuneId,
        version: u32,
        orb: &Orb,
        draft: RuneDraft,
        status: RuneStatus,
    ) -> Self {
        Self {
            rune_id,
            version,
            name: draft.name,
            description: draft.description,
            orb_id: orb.orb_id.clone(),
            category: orb.category.clone(),
            action_type: draft.action_type,
            commands: draft.commands,
            parameters: draft.parameters,
            success_criteria: draft.success_criteria,
            status,
            approval_id: None,
            created_at: Utc::now(),
        }
    }

    /// Storage key of this version.
    pub fn version_key(&self) -> String {
        format!("{}@v{}", self.rune_id, self.version)
    }

    /// Whether a draft carries the same content as this version.
    pub fn same_content(&self, draft: &RuneDraft) -> bool {
        self.name == draft.name
            && self.description == draft.description
            && self.action_type == draft.action_type
            && self.commands == draft.commands
            && self.parameters == draft.parameters
            && self.success_criteria == draft.success_criteria
    }

    /// Capabilities an agent gains from this Rune.
    pub fn granted_capabilities(&self) -> BTreeSet<String> {
        let prefix = capability_prefix(&self.category);
        let mut caps = BTreeSet::new();
        caps.insert(format!("{prefix}{}", self.action_type));
        for tool in &self.parameters.tools_required {
            caps.insert(format!("{prefix}tool.{}", tool.to_ascii_lowercase()));
        }
        caps
    }

    /// Whether a requested improvement refers to this Rune.
    pub fn matches_target(&self, target: &str) -> bool {
        let target = target.trim().to_ascii_lowercase();
        if target.is_empty() {
            return false;
        }
        self.category.to_ascii_lowercase().contains(&target)
            || self.name.to_ascii_lowercase().contains(&target)
            || self.rune_id == target
            || self
                .commands
                .iter()
                .any(|c| c.to_ascii_lowercase().contains(&target))
            || self
                .parameters
                .tools_required
                .iter()
                .any(|t| t.to_ascii_lowercase() == target)
            || self.granted_capabilities().contains(&target)
    }
}

/// Fraction of commands that differ between two versions (symmetric
/// difference over union).
pub fn changed_fraction(old: &[String], new: &[String]) -> f64 {
    let old: HashSet<&String> = old.iter().collect();
    let new: HashSet<&String> = new.iter().collect();
    let union = old.union(&new).count();
    if union == 0 {
        return 0.0;
    }
    let changed = old.symmetric_difference(&new).count();
    changed as f64 / union as f64
}

/// Review state of an approval item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }
}

/// What an approval item gates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApprovalSubject {
    Orb {
        orb_id: OrbId,
    },
    Rune {
        orb_id: OrbId,
        rune_id: RuneId,
        version: u32,
    },
}

impl ApprovalSubject {
    pub fn orb_id(&self) -> &str {
        match self {
            ApprovalSubject::Orb { orb_id } | ApprovalSubject::Rune { orb_id, .. } => orb_id,
        }
    }
}

/// Why an artifact was flagged for review.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FlagReason {
    /// First knowledge for this category
    FirstOccurrence,
    /// Command set changed by more than the configured fraction
    MaterialChange { changed_fraction: f64 },
    /// Commands contain a high-risk marker
    HighRisk,
    /// Replaces a version that was still awaiting review
    PendingPredecessor,
    /// No earlier version of the Rune was ever approved
    NoApprovedPredecessor,
}

/// A Rune or Orb awaiting (or past) human review.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalItem {
    pub approval_id: ApprovalId,
    pub subject: ApprovalSubject,
    pub reasons: Vec<FlagReason>,
    pub status: ApprovalStatus,
    pub reviewer: Option<String>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl ApprovalItem {
    pub fn new(subject: ApprovalSubject, reasons: Vec<FlagReason>) -> Self {
        Self {
            approval_id: uuid::Uuid::new_v4().to_string(),
            subject,
            reasons,
            status: ApprovalStatus::Pending,
            reviewer: None,
            rejection_reason: None,
            created_at: Utc::now(),
            decided_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }
}

/// Usable and blocked versions of one logical Rune.
#[derive(Debug, Clone)]
pub struct RuneState<'a> {
    pub rune_id: &'a str,
    pub category: &'a str,
    /// Newest active version
    pub active: Option<&'a Rune>,
    /// Newest version still awaiting approval
    pub pending: Option<&'a Rune>,
}

/// In-memory arena of Orbs, Rune versions and approval items.
#[derive(Debug, Default, Clone)]
pub struct KnowledgeBase {
    orbs: Vec<Orb>,
    orb_index: HashMap<OrbId, usize>,
    runes: Vec<Rune>,
    approvals: Vec<ApprovalItem>,
    approval_index: HashMap<ApprovalId, usize>,
}

impl KnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(orbs: Vec<Orb>, runes: Vec<Rune>, approvals: Vec<ApprovalItem>) -> Self {
        let mut kb = Self::new();
        for orb in orbs {
            kb.upsert_orb(orb);
        }
        for rune in runes {
            kb.upsert_rune(rune);
        }
        for item in approvals {
            kb.upsert_approval(item);
        }
        kb
    }

    // ========== Orbs ==========

    pub fn orbs(&self) -> &[Orb] {
        &self.orbs
    }

    pub fn orb(&self, orb_id: &str) -> Option<&Orb> {
        self.orb_index.get(orb_id).map(|&i| &self.orbs[i])
    }

    /// First Orb created for a category.
    pub fn orb_for_category(&self, category: &str) -> Option<&Orb> {
        self.orbs.iter().find(|o| o.category == category)
    }

    pub fn upsert_orb(&mut self, orb: Orb) {
        match self.orb_index.get(&orb.orb_id) {
            Some(&i) => self.orbs[i] = orb,
            None => {
                self.orb_index.insert(orb.orb_id.clone(), self.orbs.len());
                self.orbs.push(orb);
            }
        }
    }

    // ========== Runes ==========

    /// Every stored Rune version.
    pub fn runes(&self) -> &[Rune] {
        &self.runes
    }

    pub fn upsert_rune(&mut self, rune: Rune) {
        match self
            .runes
            .iter()
            .position(|r| r.rune_id == rune.rune_id && r.version == rune.version)
        {
            Some(i) => self.runes[i] = rune,
            None => self.runes.push(rune),
        }
    }

    pub fn rune(&self, rune_id: &str, version: u32) -> Option<&Rune> {
        self.runes
            .iter()
            .find(|r| r.rune_id == rune_id && r.version == version)
    }

    pub fn rune_mut(&mut self, rune_id: &str, version: u32) -> Option<&mut Rune> {
        self.runes
            .iter_mut()
            .find(|r| r.rune_id == rune_id && r.version == version)
    }

    /// All versions of a logical Rune, oldest first.
    pub fn rune_versions(&self, rune_id: &str) -> Vec<&Rune> {
        let mut versions: Vec<&Rune> = self.runes.iter().filter(|r| r.rune_id == rune_id).collect();
        versions.sort_by_key(|r| r.version);
        versions
    }

    /// Newest version (any status) of the Rune derived from an Orb.
    pub fn latest_rune_for_orb(&self, orb_id: &str) -> Option<&Rune> {
        self.runes
            .iter()
            .filter(|r| r.orb_id == orb_id)
            .max_by_key(|r| r.version)
    }

    /// Newest active version of a logical Rune.
    pub fn active_rune(&self, rune_id: &str) -> Option<&Rune> {
        self.runes
            .iter()
            .filter(|r| r.rune_id == rune_id && r.status == RuneStatus::Active)
            .max_by_key(|r| r.version)
    }

    /// Usable and blocked versions per logical Rune, in creation order.
    pub fn rune_states(&self) -> Vec<RuneState<'_>> {
        let mut order: Vec<&str> = Vec::new();
        for rune in &self.runes {
            if !order.contains(&rune.rune_id.as_str()) {
                order.push(&rune.rune_id);
            }
        }

        order
            .into_iter()
            .filter_map(|rune_id| {
                let versions = self.rune_versions(rune_id);
                let first = versions.first()?;
                Some(RuneState {
                    rune_id,
                    category: &first.category,
                    active: versions
                        .iter()
                        .rev()
                        .find(|r| r.status == RuneStatus::Active)
                        .copied(),
                    pending: versions
                        .iter()
                        .rev()
                        .find(|r| r.status == RuneStatus::PendingApproval)
                        .copied(),
                })
            })
            .collect()
    }

    /// Copies of every active version of a Rune other than `keep`, marked
    /// superseded. Nothing is changed in place.
    pub fn superseded_by(&self, rune_id: &str, keep: u32) -> Vec<Rune> {
        self.runes
            .iter()
            .filter(|r| r.rune_id == rune_id && r.version != keep && r.status == RuneStatus::Active)
            .map(|r| Rune {
                status: RuneStatus::Superseded,
                ..r.clone()
            })
            .collect()
    }

    // ========== Approvals ==========

    pub fn approvals(&self) -> &[ApprovalItem] {
        &self.approvals
    }

    pub fn approval(&self, approval_id: &str) -> Option<&ApprovalItem> {
        self.approval_index
            .get(approval_id)
            .map(|&i| &self.approvals[i])
    }

    pub fn approval_mut(&mut self, approval_id: &str) -> Option<&mut ApprovalItem> {
        match self.approval_index.get(approval_id) {
            Some(&i) => Some(&mut self.approvals[i]),
            None => None,
        }
    }

    pub fn upsert_approval(&mut self, item: ApprovalItem) {
        match self.approval_index.get(&item.approval_id) {
            Some(&i) => self.approvals[i] = item,
            None => {
                self.approval_index
                    .insert(item.approval_id.clone(), self.approvals.len());
                self.approvals.push(item);
            }
        }
    }

    pub fn pending_approvals(&self) -> Vec<&ApprovalItem> {
        self.approvals.iter().filter(|a| a.is_pending()).collect()
    }
}
