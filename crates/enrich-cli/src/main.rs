use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use enrich_console::{
    ActionOutcome, ActionParams, Confirm, ConfirmPrompt, Console, ConsoleAction, ConsoleSession, ConsoleState,
    JobBoard, STUCK_BATCH_THRESHOLD,
};
use enrich_core::{registry, ProgressSnapshot, TaskDefinition};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "enrich-cli")]
#[command(about = "Enrichment job console")]
struct Cli {
    /// Task to operate on; defaults to ENRICH_DEFAULT_TASK.
    #[arg(long, global = true)]
    task: Option<String>,
    /// Pipeline stage for staged tasks.
    #[arg(long, global = true)]
    stage: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List registered tasks.
    Tasks,
    /// Print progress, jobs and alerts once.
    Status,
    /// Follow progress until interrupted.
    Watch,
    Start,
    Continue,
    Recover,
    /// Recover stuck batches, then add workers up to the task's capacity.
    Scale {
        #[arg(long, default_value_t = enrich_console::MAX_SCALE_UP)]
        workers: u32,
        #[arg(long)]
        batch_size: Option<u32>,
    },
    Dedupe,
    AbortDuplicates,
    ClearAll {
        #[arg(long)]
        yes: bool,
    },
    ComputeMissing,
    /// Verify, compute missing items, then start a job for them.
    CompleteMissing {
        #[arg(long)]
        yes: bool,
    },
    Verify,
    Reconcile {
        /// Reconcile every registered task.
        #[arg(long)]
        all: bool,
    },
    Prune {
        #[arg(long)]
        yes: bool,
    },
    /// Run the web console (and the reconciliation schedule when enabled).
    Serve,
}

/// Asks on the terminal unless `--yes` was given.
struct TerminalConfirm {
    assume_yes: bool,
}

impl Confirm for TerminalConfirm {
    fn confirm(&self, prompt: &ConfirmPrompt) -> bool {
        if self.assume_yes {
            return true;
        }
        eprint!("[{}] {} [y/N] ", prompt.task, prompt.detail);
        let _ = std::io::stderr().flush();
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("enrich=info,warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let console = Arc::new(Console::from_env().await?);
    let task = console.resolve_task(cli.task.as_deref());
    let stage = cli.stage.clone();

    match cli.command.unwrap_or(Commands::Status) {
        Commands::Tasks => {
            for t in registry() {
                println!("{:<18} {:<28} {}", t.task_id, t.job_type, t.label);
            }
        }
        Commands::Status => {
            let (snapshot, board) = tokio::join!(console.snapshot(task, stage.as_deref()), console.job_board(task));
            print_status(task, &snapshot, &board?);
        }
        Commands::Watch => watch(console, task, stage).await?,
        Commands::Start => run(&console, task, stage, ConsoleAction::Start, ActionParams::default(), false).await?,
        Commands::Continue => {
            run(&console, task, stage, ConsoleAction::Continue, ActionParams::default(), false).await?
        }
        Commands::Recover => run(&console, task, stage, ConsoleAction::Recover, ActionParams::default(), false).await?,
        Commands::Scale { workers, batch_size } => {
            let params = ActionParams {
                workers: Some(workers),
                batch_size,
            };
            run(&console, task, stage, ConsoleAction::RecoverAndScale, params, false).await?
        }
        Commands::Dedupe => {
            run(&console, task, stage, ConsoleAction::DedupeBatches, ActionParams::default(), false).await?
        }
        Commands::AbortDuplicates => {
            run(&console, task, stage, ConsoleAction::AbortDuplicates, ActionParams::default(), false).await?
        }
        Commands::ClearAll { yes } => {
            run(&console, task, stage, ConsoleAction::ClearAll, ActionParams::default(), yes).await?
        }
        Commands::ComputeMissing => {
            run(&console, task, stage, ConsoleAction::ComputeMissing, ActionParams::default(), false).await?
        }
        Commands::CompleteMissing { yes } => complete_missing(&console, task, stage, yes).await?,
        Commands::Verify => run(&console, task, stage, ConsoleAction::Verify, ActionParams::default(), false).await?,
        Commands::Reconcile { all } => {
            let tasks: Vec<&TaskDefinition> = if all { registry().iter().collect() } else { vec![task] };
            for t in tasks {
                run(&console, t, None, ConsoleAction::Reconcile, ActionParams::default(), false).await?;
            }
        }
        Commands::Prune { yes } => run(&console, task, stage, ConsoleAction::Prune, ActionParams::default(), yes).await?,
        Commands::Serve => serve(console, task, stage).await?,
    }

    Ok(())
}

async fn run(
    console: &Console,
    task: &TaskDefinition,
    stage: Option<String>,
    action: ConsoleAction,
    params: ActionParams,
    yes: bool,
) -> Result<()> {
    let ctx = console.action_context(task, stage.as_deref()).await?;
    let outcome = console
        .execute(task, action, &params, &ctx, &TerminalConfirm { assume_yes: yes })
        .await?;
    print_outcome(task, &outcome)
}

async fn complete_missing(console: &Console, task: &TaskDefinition, stage: Option<String>, yes: bool) -> Result<()> {
    let confirm = TerminalConfirm { assume_yes: yes };
    let params = ActionParams::default();
    let mut ctx = console.action_context(task, stage.as_deref()).await?;

    let verified = console
        .execute(task, ConsoleAction::Verify, &params, &ctx, &confirm)
        .await?;
    print_outcome(task, &verified)?;
    ctx.verification = verified.verification;

    let computed = console
        .execute(task, ConsoleAction::ComputeMissing, &params, &ctx, &confirm)
        .await?;
    print_outcome(task, &computed)?;
    ctx.estimate = computed.estimate;
    if ctx.estimate.as_ref().is_some_and(|e| e.missing_count == 0) {
        println!("nothing missing for {}", task.task_id);
        return Ok(());
    }

    ctx.now = Utc::now();
    let started = console
        .execute(task, ConsoleAction::StartMissing, &params, &ctx, &confirm)
        .await?;
    print_outcome(task, &started)
}

async fn watch(console: Arc<Console>, task: &TaskDefinition, stage: Option<String>) -> Result<()> {
    let session = ConsoleSession::start(console, task.task_id, stage);
    let mut updates = session.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = updates.borrow_and_update().clone();
                print_state(task, &state);
            }
        }
    }
    session.shutdown();
    Ok(())
}

async fn serve(console: Arc<Console>, task: &TaskDefinition, stage: Option<String>) -> Result<()> {
    let scheduler = console.maybe_build_reconcile_scheduler().await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting reconciliation scheduler")?;
        info!(cron = %console.config().reconcile_cron, "reconciliation scheduler started");
    }
    let session = ConsoleSession::start(console, task.task_id, stage);
    enrich_web::serve_from_env(session).await
}

fn print_status(task: &TaskDefinition, snapshot: &ProgressSnapshot, board: &JobBoard) {
    println!(
        "{} ({}): {}% | sources {}/{} | facets {}/{} | remaining {}",
        task.label,
        task.task_id,
        snapshot.progress,
        snapshot.source_enriched,
        snapshot.source_total,
        snapshot.facets_created,
        snapshot.target_facets,
        snapshot.remaining
    );
    for warning in &snapshot.warnings {
        println!("  warning: {warning}");
    }
    for alert in enrich_console::evaluate_health(snapshot.source_total, snapshot.facets_created, task.task_id) {
        println!("  {:?}: {}", alert.severity, alert.message);
    }
    match board.active_job() {
        Some(job) => println!(
            "  active job {} ({:?}), {} processing batches",
            job.id,
            job.status,
            board.processing_count()
        ),
        None => println!("  no active job"),
    }
    if board.active.has_anomaly() {
        println!("  {} active jobs found; using the most recent", board.active.concurrent_active);
    }
    let stuck = enrich_console::detect_stuck(&board.batches, Utc::now(), STUCK_BATCH_THRESHOLD);
    if !stuck.is_empty() {
        let ids: Vec<&str> = stuck.iter().map(|b| b.id.as_str()).collect();
        println!("  stuck batches: {}", ids.join(", "));
    }
}

fn print_state(task: &TaskDefinition, state: &ConsoleState) {
    print_status(task, &state.snapshot, &state.board);
    if let Some(err) = &state.last_error {
        println!("  last error: {err}");
    }
}

fn print_outcome(task: &TaskDefinition, outcome: &ActionOutcome) -> Result<()> {
    println!("[{}] {}", task.task_id, outcome.message);
    if outcome.estimate.is_some()
        || outcome.verification.is_some()
        || outcome.reconciliation.is_some()
        || outcome.prune.is_some()
    {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    }
    Ok(())
}
