//! Storage abstraction for pipeline state.
//!
//! Components keep their working set in memory and write through to a
//! [`KnowledgeStore`] on every mutation. Any backend that implements the trait
//! can hold durable state; [`MemoryStore`] is the in-process arena used for
//! tests and ephemeral runs.

use crate::enhancement::{CapabilityRevocation, EnhancementRecord};
use crate::knowledge::{ApprovalItem, Orb, Rune};
use crate::queue::TrainingQueueEntry;
use crate::roster::AgentProfile;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;

/// Trait for persistence operations required by the pipeline.
pub trait KnowledgeStore: Send + Sync {
    // ========== Training Queue ==========

    /// All queue entries in insertion order.
    fn load_queue_entries(&self) -> Result<Vec<TrainingQueueEntry>>;

    fn upsert_queue_entry(&self, entry: &TrainingQueueEntry) -> Result<()>;

    // ========== Knowledge ==========

    fn load_orbs(&self) -> Result<Vec<Orb>>;

    fn upsert_orb(&self, orb: &Orb) -> Result<()>;

    /// Every stored Rune version.
    fn load_runes(&self) -> Result<Vec<Rune>>;

    /// Insert or replace one Rune version, keyed by rune id and version.
    fn upsert_rune(&self, rune: &Rune) -> Result<()>;

    fn load_approvals(&self) -> Result<Vec<ApprovalItem>>;

    fn upsert_approval(&self, item: &ApprovalItem) -> Result<()>;

    // ========== Audit Trail ==========

    fn load_enhancements(&self) -> Result<Vec<EnhancementRecord>>;

    /// Append an enhancement record. Records are never rewritten.
    fn append_enhancement(&self, record: &EnhancementRecord) -> Result<()>;

    fn load_revocations(&self) -> Result<Vec<CapabilityRevocation>>;

    fn append_revocation(&self, revocation: &CapabilityRevocation) -> Result<()>;

    // ========== Agents ==========

    fn load_agents(&self) -> Result<Vec<AgentProfile>>;

    fn upsert_agent(&self, profile: &AgentProfile) -> Result<()>;
}

/// Arena of values with an identifier-to-index map.
#[derive(Debug)]
struct Collection<T> {
    items: Vec<T>,
    index: HashMap<String, usize>,
}

impl<T> Default for Collection<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T: Clone> Collection<T> {
    fn upsert(&mut self, id: String, value: T) {
        match self.index.get(&id) {
            Some(&i) => self.items[i] = value,
            None => {
                self.index.insert(id, self.items.len());
                self.items.push(value);
            }
        }
    }

    fn append(&mut self, id: String, value: T) -> Result<()> {
        if self.index.contains_key(&id) {
            anyhow::bail!("record {id} already exists");
        }
        self.upsert(id, value);
        Ok(())
    }

    fn snapshot(&self) -> Vec<T> {
        self.items.clone()
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    queue: Collection<TrainingQueueEntry>,
    orbs: Collection<Orb>,
    runes: Collection<Rune>,
    approvals: Collection<ApprovalItem>,
    enhancements: Collection<EnhancementRecord>,
    revocations: Collection<CapabilityRevocation>,
    agents: Collection<AgentProfile>,
}

/// In-memory [`KnowledgeStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        let mut state = self.state.lock().expect("memory store poisoned");
        f(&mut state)
    }
}

impl KnowledgeStore for MemoryStore {
    fn load_queue_entries(&self) -> Result<Vec<TrainingQueueEntry>> {
        Ok(self.with_state(|s| {
            let mut entries = s.queue.snapshot();
            entries.sort_by_key(|e| e.seq);
            entries
        }))
    }

    fn upsert_queue_entry(&self, entry: &TrainingQueueEntry) -> Result<()> {
        self.with_state(|s| s.queue.upsert(entry.task.task_id.clone(), entry.clone()));
        Ok(())
    }

    fn load_orbs(&self) -> Result<Vec<Orb>> {
        Ok(self.with_state(|s| s.orbs.snapshot()))
    }

    fn upsert_orb(&self, orb: &Orb) -> Result<()> {
        self.with_state(|s| s.orbs.upsert(orb.orb_id.clone(), orb.clone()));
        Ok(())
    }

    fn load_runes(&self) -> Result<Vec<Rune>> {
        Ok(self.with_state(|s| s.runes.snapshot()))
    }

    fn upsert_rune(&self, rune: &Rune) -> Result<()> {
        self.with_state(|s| s.runes.upsert(rune.version_key(), rune.clone()));
        Ok(())
    }

    fn load_approvals(&self) -> Result<Vec<ApprovalItem>> {
        Ok(self.with_state(|s| s.approvals.snapshot()))
    }

    fn upsert_approval(&self, item: &ApprovalItem) -> Result<()> {
        self.with_state(|s| s.approvals.upsert(item.approval_id.clone(), item.clone()));
        Ok(())
    }

    fn load_enhancements(&self) -> Result<Vec<EnhancementRecord>> {
        Ok(self.with_state(|s| s.enhancements.snapshot()))
    }

    fn append_enhancement(&self, record: &EnhancementRecord) -> Result<()> {
        self.with_state(|s| {
            s.enhancements
                .append(record.record_id.clone(), record.clone())
        })
    }

    fn load_revocations(&self) -> Result<Vec<CapabilityRevocation>> {
        Ok(self.with_state(|s| s.revocations.snapshot()))
    }

    fn append_revocation(&self, revocation: &CapabilityRevocation) -> Result<()> {
        self.with_state(|s| {
            s.revocations
                .append(revocation.revocation_id.clone(), revocation.clone())
        })
    }

    fn load_agents(&self) -> Result<Vec<AgentProfile>> {
        Ok(self.with_state(|s| s.agents.snapshot()))
    }

    fn upsert_agent(&self, profile: &AgentProfile) -> Result<()> {
        self.with_state(|s| s.agents.upsert(profile.agent_id.clone(), profile.clone()));
        Ok(())
    }
}

/// Store whose queue-entry writes can be made to fail, for exercising
/// partial persistence failures.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FaultyStore {
    inner: MemoryStore,
    failing_queue_status: Mutex<Option<crate::queue::EntryStatus>>,
}

#[cfg(test)]
impl FaultyStore {
    /// Fail writes of queue entries in `status` until cleared with `None`.
    pub(crate) fn fail_queue_writes(&self, status: Option<crate::queue::EntryStatus>) {
        *self.failing_queue_status.lock().expect("faulty store poisoned") = status;
    }
}

#[cfg(test)]
impl KnowledgeStore for FaultyStore {
    fn load_queue_entries(&self) -> Result<Vec<TrainingQueueEntry>> {
        self.inner.load_queue_entries()
    }

    fn upsert_queue_entry(&self, entry: &TrainingQueueEntry) -> Result<()> {
        if *self.failing_queue_status.lock().expect("faulty store poisoned") == Some(entry.status) {
            anyhow::bail!("disk full writing {}", entry.task.task_id);
        }
        self.inner.upsert_queue_entry(entry)
    }

    fn load_orbs(&self) -> Result<Vec<Orb>> {
        self.inner.load_orbs()
    }

    fn upsert_orb(&self, orb: &Orb) -> Result<()> {
        self.inner.upsert_orb(orb)
    }

    fn load_runes(&self) -> Result<Vec<Rune>> {
        self.inner.load_runes()
    }

    fn upsert_rune(&self, rune: &Rune) -> Result<()> {
        self.inner.upsert_rune(rune)
    }

    fn load_approvals(&self) -> Result<Vec<ApprovalItem>> {
        self.inner.load_approvals()
    }

    fn upsert_approval(&self, item: &ApprovalItem) -> Result<()> {
        self.inner.upsert_approval(item)
    }

    fn load_enhancements(&self) -> Result<Vec<EnhancementRecord>> {
        self.inner.load_enhancements()
    }

    fn append_enhancement(&self, record: &EnhancementRecord) -> Result<()> {
        self.inner.append_enhancement(record)
    }

    fn load_revocations(&self) -> Result<Vec<CapabilityRevocation>> {
        self.inner.load_revocations()
    }

    fn append_revocation(&self, revocation: &CapabilityRevocation) -> Result<()> {
        self.inner.append_revocation(revocation)
    }

    fn load_agents(&self) -> Result<Vec<AgentProfile>> {
        self.inner.load_agents()
    }

    fn upsert_agent(&self, profile: &AgentProfile) -> Result<()> {
        self.inner.upsert_agent(profile)
    }
}
