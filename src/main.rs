use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stepflow_core::config::AppConfig;
use stepflow_core::execution::ExecutionRecord;
use stepflow_core::types::{ApprovalDecision, ApprovalRequest, ExecutionId, StepId, WorkflowEvent, WorkflowId};
use stepflow_core::workflow::WorkflowGraph;

use stepflow_engine::{AuditLogger, ExecutionHandle, HttpAgentDirectory, WorkflowEngine, WorkflowScheduler};
use stepflow_store::SqliteWorkflowStore;

#[derive(Parser)]
#[command(name = "stepflow", version, about = "Workflow engine for multi-agent pipelines with human checkpoints")]
struct Cli {
    /// Path to config file (default: ./stepflow.toml, then ~/.stepflow/config.toml)
    #[arg(short, long, env = "STEPFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow file without saving it
    Validate {
        /// Workflow definition (.json or .toml)
        file: PathBuf,
    },
    /// Validate and save a workflow file as a new version
    Save {
        file: PathBuf,
    },
    /// Store a workflow file as the editable draft, even if invalid
    Draft {
        file: PathBuf,
        /// Delete the draft of the workflow in FILE instead
        #[arg(long)]
        delete: bool,
    },
    /// List saved versions of a workflow
    Versions {
        workflow: String,
    },
    /// List saved workflows
    List,
    /// Delete a workflow. Past executions stay readable
    Delete {
        workflow: String,
    },
    /// Copy the latest version of a workflow under a new id
    Duplicate {
        workflow: String,
    },
    /// Print a saved version of a workflow as JSON
    Export {
        workflow: String,
        /// Export this version instead of the latest
        #[arg(long)]
        version: Option<u32>,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Save an exported workflow as a new version
    Import {
        file: PathBuf,
    },
    /// Execution counts and mean duration of a workflow
    Stats {
        workflow: String,
    },
    /// Run the latest version of a workflow
    Run {
        workflow: String,
        /// JSON input handed to every step
        #[arg(long, default_value = "{}")]
        input: String,
        /// Run a specific saved version instead of the latest
        #[arg(long)]
        version: Option<u32>,
    },
    /// List executions of a workflow, newest first
    Executions {
        workflow: String,
    },
    /// Show an execution trace
    Show {
        execution: String,
        /// Print only the log
        #[arg(long)]
        log: bool,
    },
    /// Run the workflow scheduler until interrupted
    Schedule,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stepflow=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "stepflow", &mut io::stdout());
        return Ok(());
    }

    // Validation needs no store
    if let Commands::Validate { file } = &cli.command {
        let config = load_config(cli.config.as_deref())?;
        let engine = build_engine(&config, Arc::new(SqliteWorkflowStore::in_memory()?))?;
        return validate_file(&engine, file).await;
    }

    let config = load_config(cli.config.as_deref())?;
    let workspace = config.workspace_dir();
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("creating workspace {}", workspace.display()))?;
    let store = Arc::new(SqliteWorkflowStore::open(&config.database_path())?);
    let engine = Arc::new(build_engine(&config, store)?);

    match cli.command {
        Commands::Save { file } => {
            let graph = read_workflow(&file)?;
            let report = engine.validate(&graph).await;
            print_warnings(&report.warnings);
            let id = engine.save(&graph)?;
            println!("Saved {}", id);
        }
        Commands::Draft { file, delete } => {
            let graph = read_workflow(&file)?;
            if delete {
                if engine.delete_draft(&graph.id)? {
                    println!("Deleted draft of {}", graph.id);
                } else {
                    println!("No draft for {}", graph.id);
                }
            } else {
                engine.save_draft(&graph)?;
                let report = engine.validate(&graph).await;
                println!("Draft of {} stored", graph.id);
                if !report.is_valid {
                    println!("  (not yet valid: {} errors)", report.errors.len());
                }
            }
        }
        Commands::Versions { workflow } => {
            let versions = engine.list_versions(&WorkflowId::from(workflow.as_str()))?;
            if versions.is_empty() {
                println!("No saved versions of {}", workflow);
            }
            for v in versions {
                println!("  v{:<4} {}  {}", v.version, v.saved_at.format("%Y-%m-%d %H:%M:%S"), v.name);
            }
        }
        Commands::List => {
            let workflows = engine.list_workflows()?;
            if workflows.is_empty() {
                println!("No saved workflows.");
            }
            for w in workflows {
                println!(
                    "  {}  v{}  {}  {}",
                    w.workflow_id,
                    w.latest_version,
                    w.saved_at.format("%Y-%m-%d %H:%M:%S"),
                    w.name
                );
            }
        }
        Commands::Delete { workflow } => {
            let id = WorkflowId::from(workflow.as_str());
            if engine.delete_workflow(&id)? {
                println!("Deleted {}", id);
            } else {
                println!("{} was already deleted", id);
            }
        }
        Commands::Duplicate { workflow } => {
            let id = engine.duplicate_workflow(&WorkflowId::from(workflow.as_str()))?;
            println!("Saved {}", id);
        }
        Commands::Export {
            workflow,
            version,
            output,
        } => {
            let json = engine.export_workflow(&WorkflowId::from(workflow.as_str()), version)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("writing {}", path.display()))?;
                    eprintln!("Exported to {}", path.display());
                }
                None => println!("{}", json),
            }
        }
        Commands::Import { file } => {
            let json = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let id = engine.import_workflow(&json)?;
            println!("Imported {}", id);
        }
        Commands::Stats { workflow } => {
            let stats = engine.workflow_stats(&WorkflowId::from(workflow.as_str()))?;
            println!("  executions  {}", stats.total);
            println!("  succeeded   {}", stats.succeeded);
            println!("  failed      {}", stats.failed);
            println!("  running     {}", stats.running);
            println!("  suspended   {}", stats.suspended);
            if let Some(rate) = stats.success_rate() {
                println!("  success     {:.1}%", rate * 100.0);
            }
            if let Some(ms) = stats.mean_duration_ms {
                println!("  mean time   {:.1}s", ms as f64 / 1000.0);
            }
            if let Some(at) = stats.last_started_at {
                println!("  last run    {}", at.format("%Y-%m-%d %H:%M:%S"));
            }
        }
        Commands::Run {
            workflow,
            input,
            version,
        } => {
            let input: serde_json::Value =
                serde_json::from_str(&input).context("--input must be valid JSON")?;
            let record = run_workflow(&engine, &config, &WorkflowId::from(workflow.as_str()), version, input).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Executions { workflow } => {
            let executions = engine.list_executions(&WorkflowId::from(workflow.as_str()))?;
            if executions.is_empty() {
                println!("No executions of {}", workflow);
            }
            for e in executions {
                println!(
                    "  {}  v{}  {:<9}  {}",
                    e.execution_id,
                    e.workflow_version,
                    e.status.to_string(),
                    e.started_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Show { execution, log } => {
            let id = ExecutionId::from(execution.as_str());
            if log {
                for entry in engine.execution_log(&id)? {
                    println!(
                        "{}  {:<5}  {:<12}  {}",
                        entry.timestamp.format("%H:%M:%S%.3f"),
                        entry.level.to_string(),
                        entry.step_id.map(|s| s.to_string()).unwrap_or_default(),
                        entry.message
                    );
                }
            } else {
                let record = engine.load_execution(&id)?;
                println!("{}", serde_json::to_string_pretty(&record)?);
                print_open_steps(&record);
            }
        }
        Commands::Schedule => {
            if !config.scheduler.enabled {
                anyhow::bail!("Scheduler is disabled. Set `enabled = true` under [scheduler] in the config.");
            }
            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down scheduler...");
                cancel_clone.cancel();
            });

            let audit = spawn_audit(&engine, &config, cancel.clone());
            WorkflowScheduler::new(engine.clone(), cancel.clone()).run().await;
            if let Some(audit) = audit {
                audit.await.ok();
            }
        }
        Commands::Validate { .. } | Commands::Completions { .. } => {
            unreachable!("handled before store setup")
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(AppConfig::default_path);
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        Ok(AppConfig::load(&path)?)
    } else {
        warn!(path = %path.display(), "No config file found, using defaults");
        Ok(AppConfig::default())
    }
}

fn build_engine(config: &AppConfig, store: Arc<SqliteWorkflowStore>) -> anyhow::Result<WorkflowEngine> {
    let directory = Arc::new(HttpAgentDirectory::new(config.agents.clone()));
    Ok(WorkflowEngine::new(config.clone(), store, directory))
}

/// Parse a workflow definition; `.toml` files as TOML, anything else as JSON.
fn read_workflow(path: &Path) -> anyhow::Result<WorkflowGraph> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let graph = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?,
        _ => serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?,
    };
    Ok(graph)
}

async fn validate_file(engine: &WorkflowEngine, file: &Path) -> anyhow::Result<()> {
    let graph = read_workflow(file)?;
    let report = engine.validate(&graph).await;
    if report.is_valid {
        println!("{} is valid", graph.id);
    } else {
        println!("{} has {} errors:", graph.id, report.errors.len());
        for e in &report.errors {
            println!("  - {}", e);
        }
    }
    print_warnings(&report.warnings);
    if !report.is_valid {
        std::process::exit(1);
    }
    Ok(())
}

/// Steps a reader of a trace acts on: failures to retry, checkpoints to decide.
fn print_open_steps(record: &ExecutionRecord) {
    let join = |ids: Vec<&StepId>| {
        ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
    };
    let failed = record.failed_steps();
    if !failed.is_empty() {
        eprintln!("Failed steps: {}", join(failed));
    }
    let awaiting = record.awaiting_approval();
    if !awaiting.is_empty() {
        eprintln!("Awaiting approval: {}", join(awaiting));
    }
}

fn print_warnings(warnings: &[String]) {
    for w in warnings {
        eprintln!("  warning: {}", w);
    }
}

fn spawn_audit(
    engine: &WorkflowEngine,
    config: &AppConfig,
    cancel: CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    if !config.audit.enabled {
        return None;
    }
    let logger = AuditLogger::new(config.audit_dir());
    Some(tokio::spawn(logger.run(engine.event_bus().clone(), cancel)))
}

/// Run one execution to completion, printing progress to stderr and asking
/// for decisions on stdin whenever a checkpoint is waiting.
async fn run_workflow(
    engine: &Arc<WorkflowEngine>,
    config: &AppConfig,
    workflow_id: &WorkflowId,
    version: Option<u32>,
    input: serde_json::Value,
) -> anyhow::Result<ExecutionRecord> {
    let audit_cancel = CancellationToken::new();
    let audit = spawn_audit(engine, config, audit_cancel.clone());
    let printer = spawn_printer(engine);

    let mut handle = match version {
        Some(v) => {
            let snapshot = engine.store().load_version(workflow_id, v)?;
            engine.execute_snapshot(Arc::new(snapshot), input).await?
        }
        None => engine.execute(workflow_id, input).await?,
    };
    eprintln!("Execution {} started", handle.id());

    let ctrl_c_engine = engine.clone();
    let ctrl_c_id = handle.id().clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl_c_engine.cancel(&ctrl_c_id, "interrupted").await.ok();
    });

    let record = drive_to_completion(engine, &mut handle).await?;

    printer.await.ok();
    audit_cancel.cancel();
    if let Some(audit) = audit {
        audit.await.ok();
    }
    Ok(record)
}

async fn drive_to_completion(
    engine: &WorkflowEngine,
    handle: &mut ExecutionHandle,
) -> anyhow::Result<ExecutionRecord> {
    loop {
        let record = handle.settled().await;
        if record.is_terminal() {
            return Ok(record);
        }

        let pending = engine.pending_for(handle.id()).await;
        if pending.is_empty() {
            // a decision is being applied
            handle.changed().await;
            continue;
        }
        for request in pending {
            let (decision, comment) = prompt_decision(&request).await?;
            if let Err(e) = engine
                .decide(&request.execution_id, &request.step_id, decision, comment)
                .await
            {
                eprintln!("  {}", e);
            }
        }
    }
}

async fn prompt_decision(request: &ApprovalRequest) -> anyhow::Result<(ApprovalDecision, String)> {
    eprintln!(
        "\n[APPROVAL] step {} ({}, agent {}) supervisors: {}",
        request.step_id,
        request.role,
        request.agent_ref,
        request.supervisors.iter().cloned().collect::<Vec<_>>().join(", ")
    );
    eprintln!("  output: {}", truncate(&request.output.to_string(), 500));

    loop {
        eprint!("  approve|reject [comment]> ");
        let line = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line).map(|n| (n, line))
        })
        .await??;

        match line {
            (0, _) => anyhow::bail!("stdin closed while a checkpoint was waiting"),
            (_, text) => {
                let text = text.trim();
                let (word, comment) = text.split_once(' ').unwrap_or((text, ""));
                match word.parse::<ApprovalDecision>() {
                    Ok(decision) => return Ok((decision, comment.trim().to_string())),
                    Err(e) => eprintln!("  {}", e),
                }
            }
        }
    }
}

fn spawn_printer(engine: &WorkflowEngine) -> tokio::task::JoinHandle<()> {
    let mut rx = engine.event_bus().subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(WorkflowEvent::LogAppended { entry, .. }) => {
                    let step = entry
                        .step_id
                        .map(|s| format!("[{}] ", s))
                        .unwrap_or_default();
                    eprintln!("  {}{}", step, entry.message);
                }
                Ok(WorkflowEvent::ExecutionFinished { .. }) => break,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}
