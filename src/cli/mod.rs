//! CLI command definitions for agent-conductor
//!
//! This module defines the CLI structure using clap's derive macros.
//! The main entry point is the `Cli` struct which contains subcommands.

use crate::format::OutputFormat;
use crate::types::{parse_priority, TaskFlags, TaskRequest};
use clap::{Args, Parser, Subcommand};

/// Task orchestration and file-lock arbitration for coding agents
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Path to database file (overrides config)
    #[arg(short, long, global = true)]
    pub database: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one or more tasks and wait for them to finish
    Run(RunArgs),

    /// List finished tasks kept in history
    History(ListArgs),

    /// List stored (saved but not launched) tasks
    Stored(ListArgs),

    /// Print the launch script a task would run, without running it
    Script(ScriptArgs),
}

/// Behaviour switches shared by `run` and `script`.
#[derive(Args, Debug, Clone, Default)]
pub struct FlagArgs {
    /// Pass the agent's permission bypass flag
    #[arg(long)]
    pub skip_permissions: bool,

    /// Run the agent as a remote session
    #[arg(long)]
    pub remote_session: bool,

    /// Re-run the agent until it prints the completion marker
    #[arg(long)]
    pub iterate: bool,

    /// Iteration cap for --iterate (config default otherwise)
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Never wait on another task's file locks
    #[arg(long)]
    pub ignore_file_locks: bool,

    #[arg(long)]
    pub tool_bus: bool,

    #[arg(long)]
    pub spawn_team: bool,

    /// Ask the agent to plan before editing
    #[arg(long)]
    pub extended_planning: bool,

    /// Forbid git write operations
    #[arg(long)]
    pub no_git_write: bool,

    /// Produce a plan only, without modifying files
    #[arg(long)]
    pub plan_only: bool,

    /// Ask the agent to split large work into subtasks
    #[arg(long)]
    pub auto_decompose: bool,
}

impl FlagArgs {
    pub fn to_flags(&self) -> TaskFlags {
        TaskFlags {
            skip_permissions: self.skip_permissions,
            remote_session: self.remote_session,
            headless: true,
            iterate_until_done: self.iterate,
            ignore_file_locks: self.ignore_file_locks,
            use_tool_bus: self.tool_bus,
            spawn_team: self.spawn_team,
            extended_planning: self.extended_planning,
            no_git_write: self.no_git_write,
            plan_only: self.plan_only,
            auto_decompose: self.auto_decompose,
        }
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Task descriptions; several run concurrently unless --sequential
    #[arg(required = true)]
    pub descriptions: Vec<String>,

    /// Project directory the agent works in (defaults to the current directory)
    #[arg(short, long)]
    pub project: Option<String>,

    /// Model override
    #[arg(short, long)]
    pub model: Option<String>,

    /// Priority: high, medium, low, or an integer
    #[arg(long, default_value = "medium")]
    pub priority: String,

    /// Chain the tasks so each waits for the previous one
    #[arg(long)]
    pub sequential: bool,

    /// Group name for multi-task runs
    #[arg(long, default_value = "cli")]
    pub group: String,

    /// Output format: markdown or json
    #[arg(short, long, default_value = "markdown")]
    pub format: String,

    #[command(flatten)]
    pub flags: FlagArgs,
}

impl RunArgs {
    /// One request per description.
    pub fn requests(&self, project: &str) -> Vec<TaskRequest> {
        self.descriptions
            .iter()
            .map(|description| TaskRequest {
                model: self.model.clone(),
                flags: self.flags.to_flags(),
                priority: parse_priority(&self.priority),
                max_iterations: self.flags.max_iterations,
                ..TaskRequest::new(description.as_str(), project)
            })
            .collect()
    }
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Output format: markdown or json
    #[arg(short, long, default_value = "markdown")]
    pub format: String,
}

#[derive(Args, Debug)]
pub struct ScriptArgs {
    pub description: String,

    #[arg(short, long)]
    pub project: Option<String>,

    #[arg(short, long)]
    pub model: Option<String>,

    /// Render a PowerShell script instead of the platform default
    #[arg(long)]
    pub powershell: bool,

    #[command(flatten)]
    pub flags: FlagArgs,
}

/// Parse a `--format` value, falling back to markdown.
pub fn output_format(value: &str) -> OutputFormat {
    OutputFormat::from_str(value).unwrap_or(OutputFormat::Markdown)
}
