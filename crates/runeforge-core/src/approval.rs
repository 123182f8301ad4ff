//! Human approval checkpoint for flagged Orbs and Runes.
//!
//! Items move `pending -> approved` or `pending -> rejected` exactly once.
//! Approving a Rune version activates it and supersedes the previously active
//! version; rejecting it only marks that candidate.

use crate::knowledge::{
    ApprovalItem, ApprovalStatus, ApprovalSubject, Orb, Rune, RuneStatus, SharedKnowledge,
};
use crate::store::KnowledgeStore;
use crate::types::{PipelineError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A pending item with the content it gates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingApproval {
    pub item: ApprovalItem,
    pub orb: Option<Orb>,
    pub rune: Option<Rune>,
}

/// Decision applied to an approval item.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Approve,
    Reject { reason: String },
}

impl Decision {
    fn status(&self) -> ApprovalStatus {
        match self {
            Decision::Approve => ApprovalStatus::Approved,
            Decision::Reject { .. } => ApprovalStatus::Rejected,
        }
    }

    fn stage(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject { .. } => "reject",
        }
    }
}

/// Resolves approval items and applies their effect on Rune versions.
pub struct ApprovalGate {
    knowledge: SharedKnowledge,
    store: Arc<dyn KnowledgeStore>,
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGate").finish_non_exhaustive()
    }
}

impl ApprovalGate {
    pub fn new(knowledge: SharedKnowledge, store: Arc<dyn KnowledgeStore>) -> Self {
        Self { knowledge, store }
    }

    /// Pending items, oldest first, with embedded Orb and Rune content.
    pub async fn list_pending(&self) -> Vec<PendingApproval> {
        let knowledge = self.knowledge.read().await;
        knowledge
            .pending_approvals()
            .into_iter()
            .map(|item| {
                let rune = match &item.subject {
                    ApprovalSubject::Rune {
                        rune_id, version, ..
                    } => knowledge.rune(rune_id, *version).cloned(),
                    ApprovalSubject::Orb { .. } => None,
                };
                PendingApproval {
                    orb: knowledge.orb(item.subject.orb_id()).cloned(),
                    rune,
                    item: item.clone(),
                }
            })
            .collect()
    }

    pub async fn get(&self, approval_id: &str) -> Result<ApprovalItem> {
        self.knowledge
            .read()
            .await
            .approval(approval_id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("approval item", approval_id))
    }

    /// Approve an item.
    pub async fn approve(&self, approval_id: &str, reviewer: &str) -> Result<ApprovalItem> {
        self.decide(approval_id, reviewer, Decision::Approve).await
    }

    /// Reject an item. The prior version of the Rune, if any, is untouched.
    pub async fn reject(&self, approval_id: &str, reviewer: &str, reason: &str) -> Result<ApprovalItem> {
        self.decide(
            approval_id,
            reviewer,
            Decision::Reject {
                reason: reason.to_string(),
            },
        )
        .await
    }

    async fn decide(&self, approval_id: &str, reviewer: &str, decision: Decision) -> Result<ApprovalItem> {
        if reviewer.trim().is_empty() {
            return Err(PipelineError::Validation(
                "a reviewer is required to resolve an approval item".to_string(),
            ));
        }

        let mut knowledge = self.knowledge.write().await;
        let mut item = knowledge
            .approval(approval_id)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("approval item", approval_id))?;

        if item.status != ApprovalStatus::Pending {
            return Err(PipelineError::invalid_state(
                approval_id,
                decision.stage(),
                format!("item already {}", item.status.as_str()),
            ));
        }

        let mut runes: Vec<Rune> = Vec::new();
        if let ApprovalSubject::Rune {
            rune_id, version, ..
        } = &item.subject
        {
            let candidate = knowledge
                .rune(rune_id, *version)
                .cloned()
                .ok_or_else(|| PipelineError::not_found("rune", format!("{rune_id}@v{version}")))?;

            // A candidate replaced by a newer version keeps its superseded
            // status; only the decision is recorded.
            if candidate.status == RuneStatus::PendingApproval {
                match &decision {
                    Decision::Approve => {
                        runes.extend(knowledge.superseded_by(rune_id, *version));
                        runes.push(Rune {
                            status: RuneStatus::Active,
                            ..candidate
                        });
                    }
                    Decision::Reject { .. } => runes.push(Rune {
                        status: RuneStatus::Rejected,
                        ..candidate
                    }),
                }
            }
        }

        item.status = decision.status();
        item.reviewer = Some(reviewer.to_string());
        item.decided_at = Some(Utc::now());
        if let Decision::Reject { reason } = &decision {
            item.rejection_reason = Some(reason.clone());
        }

        for rune in &runes {
            self.store.upsert_rune(rune).map_err(|e| {
                tracing::error!("Failed to persist rune '{}': {:#}", rune.version_key(), e);
                PipelineError::persistence(e)
            })?;
        }
        self.store.upsert_approval(&item).map_err(|e| {
            tracing::error!("Failed to persist approval item '{}': {:#}", approval_id, e);
            PipelineError::persistence(e)
        })?;

        for rune in runes {
            knowledge.upsert_rune(rune);
        }
        knowledge.upsert_approval(item.clone());

        tracing::info!(
            "Approval item '{}' {} by {}",
            approval_id,
            decision.status().as_str(),
            reviewer
        );
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{
        FlagReason, KnowledgeBase, RiskLevel, RuneDraft, RuneParameters, SuccessCriteria,
    };
    use crate::store::MemoryStore;
    use tokio::sync::RwLock;

    struct Fixture {
        gate: ApprovalGate,
        knowledge: SharedKnowledge,
        store: Arc<MemoryStore>,
        orb: Orb,
    }

    fn draft(commands: &[&str]) -> RuneDraft {
        RuneDraft {
            name: "kubernetes command_execution".to_string(),
            description: "test".to_string(),
            action_type: "command_execution".to_string(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
            parameters: RuneParameters {
                tools_required: Vec::new(),
                estimated_time_secs: 60,
                risk_level: RiskLevel::Low,
            },
            success_criteria: SuccessCriteria {
                exit_code: 0,
                output_contains: None,
                timeout_secs: 120,
            },
        }
    }

    fn fixture() -> Fixture {
        let orb = Orb::new("kubernetes");
        let mut kb = KnowledgeBase::new();
        kb.upsert_orb(orb.clone());
        let knowledge: SharedKnowledge = Arc::new(RwLock::new(kb));
        let store = Arc::new(MemoryStore::new());
        Fixture {
            gate: ApprovalGate::new(Arc::clone(&knowledge), store.clone()),
            knowledge,
            store,
            orb,
        }
    }

    impl Fixture {
        /// Add a rune version in `status`, flagged when pending.
        async fn add_version(&self, version: u32, commands: &[&str], status: RuneStatus) -> Option<String> {
            let mut kb = self.knowledge.write().await;
            let mut rune = Rune::from_draft("r1".to_string(), version, &self.orb, draft(commands), status);
            let mut approval_id = None;
            if status == RuneStatus::PendingApproval {
                let item = ApprovalItem::new(
                    ApprovalSubject::Rune {
                        orb_id: self.orb.orb_id.clone(),
                        rune_id: "r1".to_string(),
                        version,
                    },
                    vec![FlagReason::FirstOccurrence],
                );
                rune.approval_id = Some(item.approval_id.clone());
                approval_id = Some(item.approval_id.clone());
                kb.upsert_approval(item);
            }
            kb.upsert_rune(rune);
            approval_id
        }
    }

    #[tokio::test]
    async fn test_approve_activates_and_supersedes() {
        let f = fixture();
        f.add_version(1, &["helm install app"], RuneStatus::Active).await;
        let id = f
            .add_version(2, &["helm upgrade app"], RuneStatus::PendingApproval)
            .await
            .unwrap();

        let item = f.gate.approve(&id, "alice").await.unwrap();
        assert_eq!(item.status, ApprovalStatus::Approved);
        assert_eq!(item.reviewer.as_deref(), Some("alice"));

        let kb = f.knowledge.read().await;
        assert_eq!(kb.rune("r1", 1).unwrap().status, RuneStatus::Superseded);
        assert_eq!(kb.rune("r1", 2).unwrap().status, RuneStatus::Active);
        assert_eq!(f.store.load_runes().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reject_leaves_prior_version_untouched() {
        let f = fixture();
        f.add_version(1, &["helm install app"], RuneStatus::Active).await;
        let prior = f.knowledge.read().await.rune("r1", 1).cloned().unwrap();
        let id = f
            .add_version(2, &["rm -rf /"], RuneStatus::PendingApproval)
            .await
            .unwrap();

        let item = f.gate.reject(&id, "bob", "too dangerous").await.unwrap();
        assert_eq!(item.status, ApprovalStatus::Rejected);
        assert_eq!(item.rejection_reason.as_deref(), Some("too dangerous"));

        let kb = f.knowledge.read().await;
        assert_eq!(kb.rune("r1", 1), Some(&prior));
        assert_eq!(kb.rune("r1", 2).unwrap().status, RuneStatus::Rejected);
        assert_eq!(kb.active_rune("r1").unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_resolved_item_cannot_be_decided_again() {
        let f = fixture();
        let id = f
            .add_version(1, &["helm install app"], RuneStatus::PendingApproval)
            .await
            .unwrap();
        f.gate.approve(&id, "alice").await.unwrap();

        assert!(matches!(
            f.gate.approve(&id, "alice").await,
            Err(PipelineError::InvalidState { stage: "approve", .. })
        ));
        assert!(matches!(
            f.gate.reject(&id, "alice", "late").await,
            Err(PipelineError::InvalidState { stage: "reject", .. })
        ));
        assert!(matches!(
            f.gate.approve("missing", "alice").await,
            Err(PipelineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_pending_embeds_content() {
        let f = fixture();
        let id = f
            .add_version(1, &["helm install app"], RuneStatus::PendingApproval)
            .await
            .unwrap();

        let pending = f.gate.list_pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].item.approval_id, id);
        assert_eq!(pending[0].orb.as_ref().unwrap().category, "kubernetes");
        assert_eq!(pending[0].rune.as_ref().unwrap().commands, vec!["helm install app"]);

        f.gate.reject(&id, "carol", "no").await.unwrap();
        assert!(f.gate.list_pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_approving_superseded_candidate_only_records_decision() {
        let f = fixture();
        let old = f
            .add_version(1, &["helm install app"], RuneStatus::PendingApproval)
            .await
            .unwrap();
        {
            let mut kb = f.knowledge.write().await;
            kb.rune_mut("r1", 1).unwrap().status = RuneStatus::Superseded;
        }

        f.gate.approve(&old, "alice").await.unwrap();
        let kb = f.knowledge.read().await;
        assert_eq!(kb.rune("r1", 1).unwrap().status, RuneStatus::Superseded);
        assert!(kb.active_rune("r1").is_none());
    }

    #[tokio::test]
    async fn test_reviewer_required() {
        let f = fixture();
        let id = f
            .add_version(1, &["helm install app"], RuneStatus::PendingApproval)
            .await
            .unwrap();
        assert!(matches!(
            f.gate.approve(&id, " ").await,
            Err(PipelineError::Validation(_))
        ));
    }
}
