//! Implementation of `KnowledgeStore` for `runeforge-config::Persistence`.
//!
//! Every pipeline value is stored as a JSON document in the table for its
//! collection.

use anyhow::{bail, Context, Result};
use runeforge_config::{DocumentTable, Persistence};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::enhancement::{CapabilityRevocation, EnhancementRecord};
use crate::knowledge::{ApprovalItem, Orb, Rune};
use crate::queue::TrainingQueueEntry;
use crate::roster::AgentProfile;
use crate::store::KnowledgeStore;

/// Wrapper around `Persistence` that implements `KnowledgeStore`.
///
/// The config crate cannot name pipeline types, so the JSON mapping lives here.
pub struct PersistenceAdapter {
    persistence: Persistence,
}

impl PersistenceAdapter {
    /// Create a new adapter.
    pub fn new(persistence: Persistence) -> Self {
        Self { persistence }
    }

    /// Get a reference to the underlying persistence.
    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    /// Consume the adapter and return the underlying persistence.
    pub fn into_persistence(self) -> Persistence {
        self.persistence
    }

    fn put<T: Serialize>(&self, table: DocumentTable, id: &str, value: &T) -> Result<()> {
        let body = serde_json::to_string(value)
            .with_context(|| format!("Failed to encode {id} for {}", table.table_name()))?;
        self.persistence.document_upsert(table, id, &body)
    }

    fn append<T: Serialize>(&self, table: DocumentTable, id: &str, value: &T) -> Result<()> {
        if self.persistence.document_get(table, id)?.is_some() {
            bail!("{} already holds {id}", table.table_name());
        }
        self.put(table, id, value)
    }

    fn load<T: DeserializeOwned>(&self, table: DocumentTable) -> Result<Vec<T>> {
        self.persistence
            .document_list(table)?
            .into_iter()
            .map(|record| {
                serde_json::from_str(&record.body).with_context(|| {
                    format!("Failed to decode {} from {}", record.id, table.table_name())
                })
            })
            .collect()
    }
}

impl KnowledgeStore for PersistenceAdapter {
    fn load_queue_entries(&self) -> Result<Vec<TrainingQueueEntry>> {
        let mut entries: Vec<TrainingQueueEntry> = self.load(DocumentTable::TrainingQueue)?;
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }

    fn upsert_queue_entry(&self, entry: &TrainingQueueEntry) -> Result<()> {
        self.put(DocumentTable::TrainingQueue, &entry.task.task_id, entry)
    }

    fn load_orbs(&self) -> Result<Vec<Orb>> {
        self.load(DocumentTable::Orbs)
    }

    fn upsert_orb(&self, orb: &Orb) -> Result<()> {
        self.put(DocumentTable::Orbs, &orb.orb_id, orb)
    }

    fn load_runes(&self) -> Result<Vec<Rune>> {
        self.load(DocumentTable::Runes)
    }

    fn upsert_rune(&self, rune: &Rune) -> Result<()> {
        self.put(DocumentTable::Runes, &rune.version_key(), rune)
    }

    fn load_approvals(&self) -> Result<Vec<ApprovalItem>> {
        self.load(DocumentTable::Approvals)
    }

    fn upsert_approval(&self, item: &ApprovalItem) -> Result<()> {
        self.put(DocumentTable::Approvals, &item.approval_id, item)
    }

    fn load_enhancements(&self) -> Result<Vec<EnhancementRecord>> {
        self.load(DocumentTable::Enhancements)
    }

    fn append_enhancement(&self, record: &EnhancementRecord) -> Result<()> {
        self.append(DocumentTable::Enhancements, &record.record_id, record)
    }

    fn load_revocations(&self) -> Result<Vec<CapabilityRevocation>> {
        self.load(DocumentTable::Revocations)
    }

    fn append_revocation(&self, revocation: &CapabilityRevocation) -> Result<()> {
        self.append(DocumentTable::Revocations, &revocation.revocation_id, revocation)
    }

    fn load_agents(&self) -> Result<Vec<AgentProfile>> {
        self.load(DocumentTable::Agents)
    }

    fn upsert_agent(&self, profile: &AgentProfile) -> Result<()> {
        self.put(DocumentTable::Agents, &profile.agent_id, profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::ConfidenceEvaluator;
    use crate::knowledge::{
        ApprovalSubject, FlagReason, RiskLevel, RuneDraft, RuneParameters, RuneStatus,
        SuccessCriteria,
    };
    use crate::queue::EntryStatus;
    use crate::roster::AgentRole;
    use crate::types::Task;
    use chrono::Utc;
    use runeforge_config::{KeywordTables, ScoringConfig};
    use tempfile::TempDir;

    fn entry(task_id: &str, seq: u64) -> TrainingQueueEntry {
        let task = Task::with_id(task_id, "kubernetes helm");
        let assessment =
            ConfidenceEvaluator::new(KeywordTables::default(), ScoringConfig::default())
                .assess(&task);
        TrainingQueueEntry {
            task,
            assessment,
            status: EntryStatus::Pending,
            recurrence: 1,
            agent_id: None,
            solution: None,
            seq,
            queued_at: Utc::now(),
            updated_at: Utc::now(),
            matched_rune: None,
            fallback_reason: None,
        }
    }

    #[test]
    fn test_queue_entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pipeline.duckdb");

        {
            let store = PersistenceAdapter::new(Persistence::new(&path).unwrap());
            store.upsert_queue_entry(&entry("b", 2)).unwrap();
            store.upsert_queue_entry(&entry("a", 1)).unwrap();
            let mut updated = entry("b", 2);
            updated.recurrence = 3;
            store.upsert_queue_entry(&updated).unwrap();
        }

        let store = PersistenceAdapter::new(Persistence::new(&path).unwrap());
        let entries = store.load_queue_entries().unwrap();
        let ids: Vec<&str> = entries.iter().map(|e| e.task.task_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(entries[1].recurrence, 3);
    }

    #[test]
    fn test_rune_versions_are_distinct_documents() {
        let store = PersistenceAdapter::new(Persistence::in_memory().unwrap());
        let orb = Orb::new("kubernetes");
        store.upsert_orb(&orb).unwrap();

        let draft = RuneDraft {
            name: "Kubernetes deploy".to_string(),
            description: "Apply manifests".to_string(),
            action_type: "deploy".to_string(),
            commands: vec!["kubectl apply -f app.yaml".to_string()],
            parameters: RuneParameters {
                tools_required: vec!["kubectl".to_string()],
                estimated_time_secs: 60,
                risk_level: RiskLevel::Low,
            },
            success_criteria: SuccessCriteria {
                exit_code: 0,
                output_contains: None,
                timeout_secs: 90,
            },
        };
        let v1 = Rune::from_draft("r1".to_string(), 1, &orb, draft.clone(), RuneStatus::Active);
        let v2 = Rune::from_draft("r1".to_string(), 2, &orb, draft, RuneStatus::PendingApproval);
        store.upsert_rune(&v1).unwrap();
        store.upsert_rune(&v2).unwrap();

        let runes = store.load_runes().unwrap();
        assert_eq!(runes.len(), 2);
        assert_eq!(store.load_orbs().unwrap()[0].orb_id, orb.orb_id);

        let item = ApprovalItem::new(
            ApprovalSubject::Rune {
                orb_id: orb.orb_id.clone(),
                rune_id: "r1".to_string(),
                version: 2,
            },
            vec![FlagReason::HighRisk],
        );
        store.upsert_approval(&item).unwrap();
        assert_eq!(store.load_approvals().unwrap(), vec![item]);
    }

    #[test]
    fn test_audit_records_are_append_only() {
        let store = PersistenceAdapter::new(Persistence::in_memory().unwrap());
        let revocation = CapabilityRevocation {
            revocation_id: "rev-1".to_string(),
            agent_id: "infra".to_string(),
            capability: "kubernetes.deploy".to_string(),
            reason: "misfire".to_string(),
            revoked_by: "ops".to_string(),
            revoked_at: Utc::now(),
        };
        store.append_revocation(&revocation).unwrap();
        assert!(store.append_revocation(&revocation).is_err());
        assert_eq!(store.load_revocations().unwrap().len(), 1);
    }

    #[test]
    fn test_agents_round_trip_through_duckdb() {
        let store = PersistenceAdapter::new(Persistence::in_memory().unwrap());
        let profile = AgentProfile::new("sec", AgentRole::Security).with_capabilities(["security.audit"]);
        store.upsert_agent(&profile).unwrap();

        let loaded = store.load_agents().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].role, AgentRole::Security);
        assert!(loaded[0].capabilities.contains("security.audit"));
    }
}
