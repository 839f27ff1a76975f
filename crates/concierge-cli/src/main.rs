//! concierge - conversational assistant CLI

mod commands;
mod config;
mod handlers;
mod store;
mod utils;
mod workspace;

use clap::Parser;
use concierge_agent::{
    BatchItem, Inbound, Orchestrator, OrchestratorEvent, PatternPlanner, ResumeOutcome,
    ResumeRejection, ResumeRequest, StateStore, TurnOutcome,
};
use concierge_core::{CapabilityRegistry, ReturnTo, TriggerOrigin, UserContext};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::store::FileStore;
use crate::workspace::{Workspace, WorkspaceAdapter};

/// concierge - a conversational assistant that asks when it is unsure
#[derive(Parser, Debug)]
#[command(name = "concierge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Send a single message and exit
    #[arg(short, long)]
    message: Option<String>,

    /// Thread to continue (default: a new thread)
    #[arg(short, long)]
    thread: Option<String>,

    /// Answer the pending question of this step (with --message)
    #[arg(long, value_name = "STEP", requires = "message")]
    reply_to: Option<String>,

    /// Explicitly resume a suspended step (with --thread and --message)
    #[arg(long, value_name = "STEP", requires_all = ["thread", "message"], conflicts_with = "reply_to")]
    resume: Option<String>,

    /// Process a file of JSON lines ({"thread": "...", "text": "..."}) concurrently
    #[arg(long, value_name = "FILE")]
    batch: Option<PathBuf>,

    /// Workspace file holding tasks, events, notes and sent mail
    #[arg(long, value_name = "FILE")]
    workspace: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// List saved threads
    #[arg(long)]
    threads: bool,

    /// Print the saved state of a thread as JSON
    #[arg(long, value_name = "ID")]
    show: Option<String>,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

/// One line of a batch file
#[derive(Debug, Deserialize)]
struct BatchLine {
    #[serde(default)]
    thread: Option<String>,
    text: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing
    if args.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("concierge=debug,concierge_agent=debug,concierge_core=debug")
            .with_writer(std::io::stderr)
            .init();
    }

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let cfg = config::Config::load();
    let store = Arc::new(FileStore::new(FileStore::threads_dir()));

    if args.threads {
        return list_threads(&store).await;
    }

    if let Some(ref id) = args.show {
        let state = store.load(id).await?;
        match state {
            Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
            None => {
                eprintln!("No saved thread {}", id);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let workspace_path = args.workspace.clone().unwrap_or_else(Workspace::default_path);
    let workspace = Workspace::open(workspace_path).await?;
    let orchestrator = Arc::new(build_orchestrator(&cfg, Arc::clone(&store), &workspace));
    let mut events = orchestrator.subscribe();
    let user = cfg.user_context();

    if let Some(ref path) = args.batch {
        return run_batch_file(orchestrator, path, &cfg, &user).await;
    }

    let thread_id = args
        .thread
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    // Explicit resume
    if let (Some(step), Some(text)) = (&args.resume, &args.message) {
        let outcome = orchestrator
            .resume(ResumeRequest {
                thread_id: thread_id.clone(),
                return_to: ReturnTo::step(step.as_str()),
                user_text: text.clone(),
            })
            .await?;
        drain_events(&mut events, args.verbose);
        return match outcome {
            ResumeOutcome::Applied(outcome) => {
                print_outcome(&outcome);
                Ok(())
            }
            ResumeOutcome::Rejected(rejection) => {
                print_rejection(&rejection);
                std::process::exit(2);
            }
        };
    }

    // Non-interactive mode
    if let Some(ref text) = args.message {
        let mut inbound = Inbound::new(&thread_id, text.as_str()).with_user(user);
        if let Some(ref step) = args.reply_to {
            inbound = inbound.reply_to(ReturnTo::step(step.as_str()));
        }
        let outcome = orchestrator.handle_message(inbound).await?;
        drain_events(&mut events, args.verbose);
        print_outcome(&outcome);
        if matches!(outcome, TurnOutcome::AwaitingClarification { .. }) {
            eprintln!("\n(answer with: concierge --thread {} -m \"...\")", thread_id);
        }
        return Ok(());
    }

    run_interactive(&orchestrator, &store, thread_id, user, &mut events, args.verbose).await
}

fn build_orchestrator(cfg: &config::Config, store: Arc<FileStore>, workspace: &Workspace) -> Orchestrator {
    let registry = Arc::new(CapabilityRegistry::builtin());
    let planner = Arc::new(PatternPlanner::new(Arc::clone(&registry)));
    let mut orchestrator = Orchestrator::new(cfg.orchestrator(), planner, store);
    for resolver in handlers::builtin(&registry, workspace) {
        orchestrator.add_resolver(resolver);
    }
    for adapter in WorkspaceAdapter::all(workspace) {
        orchestrator.add_adapter(adapter);
    }
    orchestrator
}

async fn run_interactive(
    orchestrator: &Orchestrator,
    store: &FileStore,
    mut thread_id: String,
    user: UserContext,
    events: &mut broadcast::Receiver<OrchestratorEvent>,
    verbose: bool,
) -> anyhow::Result<()> {
    use std::io::{self, Write};

    // Show minimal startup info (only if TTY)
    if std::io::IsTerminal::is_terminal(&std::io::stderr()) {
        eprintln!("concierge thread: {}", utils::short_id(&thread_id));
        eprintln!("Type /help for commands.");
        eprintln!();
    }

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            // EOF
            break;
        }

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        // Handle slash commands
        if let Some(result) = commands::execute_command(input, orchestrator, store, &thread_id).await {
            match result {
                Ok(commands::CommandResult::Message(msg)) => println!("{}", msg),
                Ok(commands::CommandResult::Outcome(outcome)) => {
                    drain_events(events, verbose);
                    print_outcome(&outcome);
                }
                Ok(commands::CommandResult::NewThread) => {
                    thread_id = uuid::Uuid::new_v4().to_string();
                    println!("Started thread {}", utils::short_id(&thread_id));
                }
                Ok(commands::CommandResult::SwitchThread(id)) => {
                    println!("Switched to thread {}", id);
                    thread_id = id;
                }
                Ok(commands::CommandResult::Exit) => break,
                Ok(commands::CommandResult::Unknown(cmd)) => {
                    println!("Unknown command: /{}", cmd);
                    println!("Type /help for available commands.");
                }
                Err(e) => eprintln!("Error: {}", e),
            }
            println!();
            continue;
        }

        let inbound = Inbound::new(&thread_id, input).with_user(user.clone());
        match orchestrator.handle_message(inbound).await {
            Ok(outcome) => {
                drain_events(events, verbose);
                print_outcome(&outcome);
            }
            Err(e) => eprintln!("Error: {}", e.user_message()),
        }
        println!();
    }

    Ok(())
}

async fn run_batch_file(
    orchestrator: Arc<Orchestrator>,
    path: &Path,
    cfg: &config::Config,
    user: &UserContext,
) -> anyhow::Result<()> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut inbound = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: BatchLine = serde_json::from_str(line)
            .map_err(|e| anyhow::anyhow!("{}:{}: {}", path.display(), n + 1, e))?;
        let thread = parsed
            .thread
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        inbound.push(
            Inbound::new(thread, parsed.text)
                .with_user(user.clone())
                .with_origin(TriggerOrigin::Scheduled),
        );
    }

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling batch...");
            on_ctrl_c.cancel();
        }
    });

    let threads: Vec<String> = inbound.iter().map(|i| i.thread_id.clone()).collect();
    let results = concierge_agent::handle_messages(orchestrator, inbound, &cfg.batch(), cancel).await;

    let mut failed = 0;
    for BatchItem {
        index,
        attempts,
        result,
    } in results
    {
        let thread = utils::short_id(&threads[index]);
        match result {
            Ok(outcome) => println!("[{}] {}: {}", index + 1, thread, outcome_line(&outcome)),
            Err(e) => {
                failed += 1;
                println!(
                    "[{}] {}: failed after {} attempt(s): {}",
                    index + 1,
                    thread,
                    attempts,
                    e.user_message()
                );
            }
        }
    }
    if failed > 0 {
        eprintln!("{} of {} messages failed", failed, threads.len());
        std::process::exit(1);
    }
    Ok(())
}

async fn list_threads(store: &FileStore) -> anyhow::Result<()> {
    let summaries = store.summaries().await?;
    if summaries.is_empty() {
        println!("No saved threads found.");
        println!("Threads are stored in: {}", store.dir().display());
        return Ok(());
    }
    println!("Saved threads:\n");
    println!("{:<38} {:<17} {:<6} Pending", "ID", "Last activity", "Msgs");
    println!("{}", "-".repeat(90));
    for s in summaries {
        println!(
            "{:<38} {:<17} {:<6} {}",
            s.id,
            s.last_activity_display(),
            s.message_count,
            s.pending.as_deref().map(|q| utils::truncate_chars(q, 30)).unwrap_or_default()
        );
    }
    println!("\nContinue with: concierge --thread <id>");
    Ok(())
}

/// Print what happened inside the turn. Failures and skipped duplicates are
/// always shown; the rest only with --verbose.
fn drain_events(events: &mut broadcast::Receiver<OrchestratorEvent>, verbose: bool) {
    loop {
        match events.try_recv() {
            Ok(event) => match event {
                OrchestratorEvent::StepFailed { step_id, message } => {
                    eprintln!("[{} failed: {}]", step_id, utils::truncate_chars(&message, 80));
                }
                OrchestratorEvent::OperationSkipped { step_id, .. } => {
                    eprintln!("[{} already done, skipped]", step_id);
                }
                OrchestratorEvent::OperationExecuted {
                    step_id,
                    action,
                    success,
                } if verbose => {
                    eprintln!("[{} {} {}]", step_id, action, if success { "ok" } else { "error" });
                }
                OrchestratorEvent::PlanReady { steps } if verbose => {
                    let plan: Vec<String> = steps
                        .iter()
                        .map(|s| format!("{}:{}.{}", s.id, s.capability, s.action))
                        .collect();
                    eprintln!("[plan {}]", plan.join(" "));
                }
                _ => {}
            },
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                tracing::debug!("Dropped {} orchestrator events", n);
            }
            Err(_) => break,
        }
    }
}

fn print_options(options: &[String]) {
    for (i, option) in options.iter().enumerate() {
        println!("  {}. {}", i + 1, option);
    }
}

fn print_outcome(outcome: &TurnOutcome) {
    match outcome {
        TurnOutcome::Responded { text } => println!("{}", text),
        TurnOutcome::AwaitingClarification {
            question, options, ..
        } => {
            println!("{}", question);
            print_options(options);
        }
        TurnOutcome::Expired { message } => println!("{}", message),
        TurnOutcome::Reprompt { question, options } => {
            println!("I still need an answer to this first:");
            println!("{}", question);
            print_options(options);
        }
    }
}

fn print_rejection(rejection: &ResumeRejection) {
    match rejection {
        ResumeRejection::Expired { message } => eprintln!("{}", message),
        ResumeRejection::Mismatched {
            expected,
            question,
            options,
        } => {
            eprintln!("That step is not waiting for an answer; step {} is:", expected.step_id);
            eprintln!("{}", question);
            for (i, option) in options.iter().enumerate() {
                eprintln!("  {}. {}", i + 1, option);
            }
        }
        ResumeRejection::NothingPending => eprintln!("Nothing is waiting for an answer."),
    }
}

/// Single-line summary for batch output
fn outcome_line(outcome: &TurnOutcome) -> String {
    let text = match outcome {
        TurnOutcome::Responded { text } => text.clone(),
        TurnOutcome::AwaitingClarification { question, .. } => format!("(waiting) {}", question),
        TurnOutcome::Expired { message } => format!("(expired) {}", message),
        TurnOutcome::Reprompt { question, .. } => format!("(waiting) {}", question),
    };
    utils::truncate_chars(&text.replace('\n', " "), 100)
}
