//! Common types used across the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Unique identifier for a task.
pub type TaskId = String;

/// Unique identifier for an agent.
pub type AgentId = String;

/// Unique identifier for an Orb.
pub type OrbId = String;

/// Logical identifier for a Rune (stable across versions).
pub type RuneId = String;

/// Unique identifier for an approval item.
pub type ApprovalId = String;

/// Task category (e.g., "infrastructure", "kubernetes").
pub type Category = String;

/// Category assigned to tasks with an empty description.
pub const UNKNOWN_CATEGORY: &str = "unknown";

/// Category assigned when nothing matched and no hint was given.
pub const OTHER_CATEGORY: &str = "other";

/// Priority level for a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    /// Whether the task is high-stakes enough to lower its confidence.
    pub fn is_high_stakes(&self) -> bool {
        *self >= TaskPriority::High
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "normal" | "medium" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            other => Err(PipelineError::Validation(format!(
                "unknown priority '{other}'"
            ))),
        }
    }
}

/// A unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: TaskId,

    /// Free-text description
    pub description: String,

    /// Optional structured category hint
    #[serde(default)]
    pub category_hint: Option<Category>,

    #[serde(default)]
    pub priority: TaskPriority,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Tools used (or expected) for this task
    #[serde(default)]
    pub tools: Vec<String>,

    /// Commands associated with this task
    #[serde(default)]
    pub commands: Vec<String>,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Result reported on completion
    #[serde(default)]
    pub result: Option<String>,
}

impl Task {
    /// Create a task with a generated identifier.
    pub fn new(description: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), description)
    }

    /// Create a task with an explicit identifier.
    pub fn with_id(task_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            description: description.into(),
            category_hint: None,
            priority: TaskPriority::Normal,
            tags: Vec::new(),
            tools: Vec::new(),
            commands: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
            result: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category_hint(mut self, category: impl Into<String>) -> Self {
        self.category_hint = Some(category.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_commands(mut self, commands: Vec<String>) -> Self {
        self.commands = commands;
        self
    }

    /// The category hint, normalized, if it carries any text.
    pub fn normalized_hint(&self) -> Option<Category> {
        self.category_hint
            .as_deref()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
    }
}

/// Inbound task submission record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSubmission {
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub description: String,
    #[serde(default)]
    pub category_hint: Option<Category>,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
}

impl TaskSubmission {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_category_hint(mut self, category: impl Into<String>) -> Self {
        self.category_hint = Some(category.into());
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_commands(mut self, commands: &[&str]) -> Self {
        self.commands = commands.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    /// Validate and convert into a task. Malformed submissions are rejected
    /// here and never reach the queue.
    pub fn into_task(self) -> Result<Task> {
        let task_id = match self.task_id {
            Some(id) => {
                let id = id.trim().to_string();
                if id.is_empty() {
                    return Err(PipelineError::Validation(
                        "task identifier must not be blank".to_string(),
                    ));
                }
                if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
                    return Err(PipelineError::Validation(format!(
                        "task identifier '{id}' contains whitespace or control characters"
                    )));
                }
                id
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        if self.description.chars().any(|c| c.is_control() && c != '\n' && c != '\t') {
            return Err(PipelineError::Validation(format!(
                "description of task {task_id} contains control characters"
            )));
        }

        for (field, values) in [
            ("tags", &self.tags),
            ("tools", &self.tools),
            ("commands", &self.commands),
        ] {
            if values.iter().any(|v| v.trim().is_empty()) {
                return Err(PipelineError::Validation(format!(
                    "task {task_id} has an empty entry in {field}"
                )));
            }
        }

        let mut task = Task::with_id(task_id, self.description);
        task.category_hint = self.category_hint.filter(|h| !h.trim().is_empty());
        task.priority = self.priority.unwrap_or_default();
        task.tags = dedup_preserving_order(self.tags);
        task.tools = dedup_preserving_order(self.tools);
        task.commands = dedup_preserving_order(self.commands);
        Ok(task)
    }
}

/// Remove duplicates, keeping the first occurrence of each value.
pub fn dedup_preserving_order(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| seen.insert(v.clone()))
        .collect()
}

/// Append values not already present, keeping first-seen order.
pub fn union_into(target: &mut Vec<String>, incoming: &[String]) -> bool {
    let mut changed = false;
    for value in incoming {
        if !target.contains(value) {
            target.push(value.clone());
            changed = true;
        }
    }
    changed
}

/// Error types for pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid state for {id} during {stage}: {message}")]
    InvalidState {
        id: String,
        stage: &'static str,
        message: String,
    },

    #[error("Downstream timeout for {id} during {stage} after {timeout:?}")]
    DownstreamTimeout {
        id: String,
        stage: &'static str,
        timeout: Duration,
    },

    #[error("Partial batch failure during {stage}: {failed} of {total} items failed")]
    PartialBatchFailure {
        stage: &'static str,
        failed: usize,
        total: usize,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(#[from] runeforge_config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub(crate) fn invalid_state(
        id: impl Into<String>,
        stage: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            id: id.into(),
            stage,
            message: message.into(),
        }
    }

    pub(crate) fn persistence(err: anyhow::Error) -> Self {
        Self::Persistence(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
