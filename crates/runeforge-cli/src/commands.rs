//! Subcommand handlers.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use runeforge_config::{Persistence, PipelineConfig};
use runeforge_core::{
    AgentProfile, AgentRole, EnhancementRequest, PersistenceAdapter, Pipeline, PipelineError,
    Solution, TaskPriority, TaskSubmission,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Args)]
pub struct SubmitArgs {
    /// Task description
    pub description: String,

    /// Task identifier (generated when omitted)
    #[arg(long)]
    pub id: Option<String>,

    /// Category hint used when no keyword matches
    #[arg(long)]
    pub hint: Option<String>,

    /// low, normal, high or critical
    #[arg(long, value_parser = parse_priority)]
    pub priority: Option<TaskPriority>,

    #[arg(long = "tag")]
    pub tags: Vec<String>,

    #[arg(long = "tool")]
    pub tools: Vec<String>,

    #[arg(long = "command")]
    pub commands: Vec<String>,
}

#[derive(Args)]
pub struct CompleteArgs {
    pub task_id: String,

    /// What was done
    #[arg(long)]
    pub summary: String,

    /// Commands that solved the task
    #[arg(long = "command")]
    pub commands: Vec<String>,

    /// Mark the attempt as unsuccessful
    #[arg(long)]
    pub failed: bool,
}

#[derive(Args)]
pub struct EnhanceArgs {
    pub agent_id: String,

    /// Role for an agent the roster does not know yet
    #[arg(long, value_parser = parse_role)]
    pub role: Option<AgentRole>,

    /// Capabilities claimed by a new agent
    #[arg(long = "capability")]
    pub capabilities: Vec<String>,

    /// Improvements to look for (category, tool or command fragment)
    #[arg(long = "target")]
    pub targets: Vec<String>,

    /// Re-run the agent's latest pending enhancement instead
    #[arg(long, conflicts_with_all = ["role", "capabilities", "targets"])]
    pub resume: bool,
}

#[derive(Subcommand)]
pub enum ApprovalsCommand {
    /// Pending items with their Orb and Rune content
    List,

    Approve {
        approval_id: String,
        #[arg(long)]
        reviewer: String,
    },

    Reject {
        approval_id: String,
        #[arg(long)]
        reviewer: String,
        #[arg(long)]
        reason: String,
    },
}

#[derive(Subcommand)]
pub enum AgentsCommand {
    List,

    Register {
        agent_id: String,
        #[arg(long, value_parser = parse_role)]
        role: AgentRole,
        #[arg(long = "capability")]
        capabilities: Vec<String>,
    },
}

fn parse_priority(raw: &str) -> std::result::Result<TaskPriority, String> {
    raw.parse().map_err(|e: PipelineError| e.to_string())
}

fn parse_role(raw: &str) -> std::result::Result<AgentRole, String> {
    raw.parse().map_err(|e: PipelineError| e.to_string())
}

/// Open the pipeline over the database from `--db`, the configuration, or
/// memory.
pub fn open_pipeline(config: PipelineConfig, db: Option<PathBuf>, ephemeral: bool) -> Result<Pipeline> {
    let db_path = if ephemeral { None } else { db.or_else(|| config.database_path()) };

    let persistence = match db_path {
        Some(path) => {
            tracing::debug!("Using database {}", path.display());
            Persistence::new(&path)
                .with_context(|| format!("Failed to open database {}", path.display()))?
        }
        None => {
            tracing::warn!("No database path resolved; state will not be kept");
            Persistence::in_memory()?
        }
    };

    Pipeline::open(config, Arc::new(PersistenceAdapter::new(persistence)))
        .context("Failed to open pipeline")
}

/// Print a value as pretty JSON.
pub fn emit<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn submit(pipeline: &Pipeline, args: SubmitArgs) -> Result<()> {
    let submission = TaskSubmission {
        task_id: args.id,
        description: args.description,
        category_hint: args.hint,
        priority: args.priority,
        tags: args.tags,
        tools: args.tools,
        commands: args.commands,
    };
    emit(&pipeline.submit(submission).await?)
}

pub async fn complete(pipeline: &Pipeline, args: CompleteArgs) -> Result<()> {
    let mut solution = Solution::new(args.summary);
    solution.commands = args.commands;
    if args.failed {
        solution = solution.failed();
    }
    emit(&pipeline.complete(&args.task_id, solution).await?)
}

pub async fn synthesize(pipeline: &Pipeline) -> Result<()> {
    let report = pipeline.synthesize().await;
    emit(&report)?;
    report.ensure_complete()?;
    Ok(())
}

pub async fn knowledge(pipeline: &Pipeline) -> Result<()> {
    emit(&serde_json::json!({
        "orbs": pipeline.orbs().await,
        "runes": pipeline.runes().await,
    }))
}

pub async fn approvals(pipeline: &Pipeline, command: ApprovalsCommand) -> Result<()> {
    match command {
        ApprovalsCommand::List => emit(&pipeline.pending_approvals().await),
        ApprovalsCommand::Approve {
            approval_id,
            reviewer,
        } => emit(&pipeline.approve(&approval_id, &reviewer).await?),
        ApprovalsCommand::Reject {
            approval_id,
            reviewer,
            reason,
        } => emit(&pipeline.reject(&approval_id, &reviewer, &reason).await?),
    }
}

pub async fn enhance(pipeline: &Pipeline, args: EnhanceArgs) -> Result<()> {
    if args.resume {
        return emit(&pipeline.resume_enhancement(&args.agent_id).await?);
    }

    let mut request = EnhancementRequest::new(args.agent_id);
    request.agent_role = args.role;
    request.current_capabilities = args.capabilities;
    request.target_improvements = args.targets;
    emit(&pipeline.enhance(request).await?)
}

pub async fn bulk_enhance(pipeline: &Pipeline, agents: Vec<String>, targets: Vec<String>) -> Result<()> {
    let report = pipeline.bulk_enhance(&agents, &targets).await;
    emit(&report)?;
    report.ensure_complete()?;
    Ok(())
}

pub async fn agents(pipeline: &Pipeline, command: AgentsCommand) -> Result<()> {
    match command {
        AgentsCommand::List => emit(&pipeline.agents().await),
        AgentsCommand::Register {
            agent_id,
            role,
            capabilities,
        } => {
            let profile = AgentProfile::new(agent_id, role).with_capabilities(capabilities);
            emit(&pipeline.register_agent(profile).await?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_and_role_parsers() {
        assert_eq!(parse_priority("HIGH").unwrap(), TaskPriority::High);
        assert!(parse_priority("urgent").unwrap_err().contains("urgent"));
        assert_eq!(parse_role("ops").unwrap(), AgentRole::Operations);
    }

    #[tokio::test]
    async fn test_ephemeral_pipeline_round_trip() {
        let pipeline = open_pipeline(PipelineConfig::default(), None, true).unwrap();
        submit(
            &pipeline,
            SubmitArgs {
                description: "Restart the kubernetes helm release".to_string(),
                id: Some("cli-1".to_string()),
                hint: Some("kubernetes".to_string()),
                priority: None,
                tags: vec![],
                tools: vec![],
                commands: vec![],
            },
        )
        .await
        .unwrap();

        complete(
            &pipeline,
            CompleteArgs {
                task_id: "cli-1".to_string(),
                summary: "Restarted".to_string(),
                commands: vec!["helm rollback app 1".to_string()],
                failed: false,
            },
        )
        .await
        .unwrap();

        let entry = pipeline.queue_entry("cli-1").await.unwrap();
        assert_eq!(entry.solution.unwrap().commands, vec!["helm rollback app 1"]);
    }
}
