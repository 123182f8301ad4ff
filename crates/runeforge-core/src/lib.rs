//! Task evaluation and continuous-learning pipeline.
//!
//! Incoming tasks are scored for automation confidence and routed to a
//! capable agent, a training queue or human review. Completed queued work is
//! distilled into knowledge:
//!
//! - **Confidence Evaluation**: keyword-table scoring with category bonuses and
//!   a priority penalty
//! - **Routing**: a per-submission state machine with timeout-bounded dispatch
//! - **Training Queue**: deduplicated tasks with recurrence counters and solutions
//! - **Knowledge Smith**: batch synthesis of Orbs (per-category knowledge) and
//!   versioned Runes (action templates)
//! - **Approval Gate**: human review of new, risky or materially changed Runes
//! - **Enhancement**: granting agents capabilities derived from approved Runes
//!
//! # Usage
//!
//! ```ignore
//! use runeforge_core::{Pipeline, Solution, TaskSubmission};
//! use runeforge_config::PipelineConfig;
//!
//! let pipeline = Pipeline::in_memory(PipelineConfig::default())?;
//! let outcome = pipeline
//!     .submit(TaskSubmission::new("Upgrade the kubernetes helm release").with_id("t-1"))
//!     .await?;
//!
//! pipeline
//!     .complete("t-1", Solution::new("Upgraded").with_commands(&["helm upgrade app ./chart"]))
//!     .await?;
//! let report = pipeline.synthesize().await;
//! ```

pub mod approval;
pub mod enhancement;
pub mod evaluator;
pub mod knowledge;
pub mod locks;
pub mod persistence_impl;
pub mod pipeline;
pub mod queue;
pub mod roster;
pub mod router;
pub mod smith;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use approval::{ApprovalGate, Decision, PendingApproval};
pub use enhancement::{
    AgentEnhancementResult, BulkEnhancementReport, CapabilityRevocation, EnhancementEngine,
    EnhancementOutcome, EnhancementRecord, EnhancementRequest, EnhancementStatus, RuneRef,
};
pub use evaluator::{ConfidenceAssessment, ConfidenceEvaluator, SignalBreakdown};
pub use knowledge::{
    ApprovalItem, ApprovalStatus, ApprovalSubject, FlagReason, KnowledgeBase, Orb, OrbKnowledge,
    RiskLevel, Rune, RuneParameters, RuneStatus, SharedKnowledge, SuccessCriteria,
};
pub use persistence_impl::PersistenceAdapter;
pub use pipeline::{Pipeline, SubmissionOutcome};
pub use queue::{EntryStatus, QueueDigest, RecurrenceHighlight, Solution, TrainingQueue, TrainingQueueEntry};
pub use roster::{AgentProfile, AgentRole, AgentRoster, SharedRoster};
pub use router::{
    AgentExecutor, AgentOutcome, ManualReviewReason, RouteDecision, RouteState, Router,
    RoutingRecord,
};
pub use smith::{KnowledgeSmith, SynthesisReport};
pub use store::{KnowledgeStore, MemoryStore};
pub use types::{PipelineError, Result, Task, TaskPriority, TaskSubmission};
