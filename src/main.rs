//! agent-conductor command-line entry point.

use agent_conductor::cli::{output_format, Cli, Command, ListArgs, RunArgs, ScriptArgs};
use agent_conductor::config::Config;
use agent_conductor::db::{Database, SqliteTaskStore, TaskStore};
use agent_conductor::format::{self, OutputFormat};
use agent_conductor::orchestrator::{ScriptFlavor, TaskOrchestrator};
use agent_conductor::types::{Task, TaskStatus};
use agent_conductor::logging;
use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log, cli.verbose)?;

    let mut config = Config::load_or_default(cli.config.as_deref().map(Path::new))?;
    if let Some(db_path) = &cli.database {
        config.store.db_path = PathBuf::from(db_path);
    }

    match cli.command {
        Command::Script(args) => print_script(config, &args),
        Command::Run(args) => {
            let orchestrator = open_orchestrator(config)?;
            run_tasks(&orchestrator, &args).await
        }
        Command::History(args) => {
            let orchestrator = open_orchestrator(config)?;
            orchestrator.restore_history().await?;
            let history = orchestrator.tasks();
            print_listing("History", &history, &args)
        }
        Command::Stored(args) => {
            let orchestrator = open_orchestrator(config)?;
            let stored = orchestrator.load_stored_tasks().await?;
            print_listing("Stored tasks", &stored, &args)
        }
    }
}

fn open_orchestrator(config: Config) -> Result<Arc<TaskOrchestrator>> {
    config.ensure_db_dir()?;
    let db = Database::open(&config.store.db_path)
        .with_context(|| format!("Failed to open database {}", config.store.db_path.display()))?;
    info!(path = %config.store.db_path.display(), "database opened");
    let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::new(db));
    Ok(TaskOrchestrator::new(config, Some(store)))
}

fn current_project(project: &Option<String>) -> Result<String> {
    match project {
        Some(path) => Ok(path.clone()),
        None => Ok(std::env::current_dir()
            .context("Failed to read current directory")?
            .display()
            .to_string()),
    }
}

async fn run_tasks(orchestrator: &Arc<TaskOrchestrator>, args: &RunArgs) -> Result<()> {
    let project = current_project(&args.project)?;
    orchestrator.set_active_project(project.as_str());

    let requests = args.requests(&project);
    let handles = if requests.len() == 1 && !args.sequential {
        let request = requests.into_iter().next().context("No task description given")?;
        vec![orchestrator.create_task(request)?]
    } else {
        orchestrator.create_batch(&args.group, requests, args.sequential)?
    };

    let mut finished = Vec::with_capacity(handles.len());
    for handle in &handles {
        tokio::select! {
            task = orchestrator.wait_for_terminal(handle.id()) => finished.push(task?),
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, cancelling running tasks");
                for handle in &handles {
                    orchestrator.cancel(handle.id())?;
                }
                finished.clear();
                for handle in &handles {
                    finished.push(handle.snapshot());
                }
                break;
            }
        }
    }

    // The terminal save is spawned per task; flush once more before exit
    orchestrator.save_history().await?;

    match output_format(&args.format) {
        OutputFormat::Json => println!("{}", format::to_json(&finished)?),
        OutputFormat::Markdown => {
            for task in &finished {
                println!("{}", format::format_task_markdown(task));
            }
        }
    }

    if finished.iter().any(|t| t.status != TaskStatus::Completed) {
        std::process::exit(1);
    }
    Ok(())
}

fn print_listing(title: &str, tasks: &[Task], args: &ListArgs) -> Result<()> {
    match output_format(&args.format) {
        OutputFormat::Json => println!("{}", format::to_json(tasks)?),
        OutputFormat::Markdown => print!("{}", format::format_tasks_markdown(title, tasks)),
    }
    Ok(())
}

fn print_script(config: Config, args: &ScriptArgs) -> Result<()> {
    let project = current_project(&args.project)?;
    let flavor = if args.powershell {
        ScriptFlavor::PowerShell
    } else {
        ScriptFlavor::native()
    };

    let mut task = Task::create(&args.description, &project, args.flags.to_flags());
    task.model = args.model.clone().or_else(|| config.agent.default_model.clone());

    let prompt_file = config
        .agent
        .script_dir
        .join(format!("{}-1.md", task.id));
    let orchestrator = TaskOrchestrator::new(config, None);
    print!("{}", orchestrator.render_launch_script(&task, &prompt_file, flavor));
    Ok(())
}
