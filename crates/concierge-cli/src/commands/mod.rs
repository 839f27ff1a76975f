//! Slash commands for interactive mode

mod status;

pub use status::StatusCommand;

use concierge_agent::{Orchestrator, Result, TurnOutcome};

use crate::store::FileStore;
use crate::utils::truncate_chars;

/// Result of executing a slash command
pub enum CommandResult {
    /// Show a message to the user (not sent to the orchestrator)
    Message(String),
    /// A command that ran a turn
    Outcome(TurnOutcome),
    /// Start a new thread
    NewThread,
    /// Continue another saved thread
    SwitchThread(String),
    /// Exit the application
    Exit,
    /// Unknown command
    Unknown(String),
}

/// Parse and execute a slash command
pub async fn execute_command(
    input: &str,
    orchestrator: &Orchestrator,
    store: &FileStore,
    thread_id: &str,
) -> Option<Result<CommandResult>> {
    let input = input.trim();

    let rest = input.strip_prefix('/')?;
    let parts: Vec<&str> = rest.splitn(2, ' ').collect();
    let command = parts[0].to_lowercase();
    let args = parts.get(1).map(|s| s.trim()).unwrap_or("");

    Some(match command.as_str() {
        "help" | "h" | "?" => Ok(CommandResult::Message(help_message())),

        "quit" | "exit" | "q" => Ok(CommandResult::Exit),

        "new" | "n" => Ok(CommandResult::NewThread),

        "status" | "s" => StatusCommand::execute(orchestrator, thread_id).await,

        "threads" | "t" => list_threads(store, thread_id).await,

        "switch" if !args.is_empty() => Ok(CommandResult::SwitchThread(args.to_string())),
        "switch" => Ok(CommandResult::Message("Usage: /switch <thread-id>".to_string())),

        "show" => show_thread(orchestrator, thread_id).await,

        "retry" | "r" => orchestrator.retry_unresolved(thread_id).await.map(|o| match o {
            Some(outcome) => CommandResult::Outcome(outcome),
            None => CommandResult::Message("Nothing to retry.".to_string()),
        }),

        "cancel" if !args.is_empty() => {
            orchestrator.cancel_step(thread_id, args).await.map(|cancelled| {
                CommandResult::Message(if cancelled {
                    format!("Cancelled step {}.", args)
                } else {
                    format!("No unresolved step {}.", args)
                })
            })
        }
        "cancel" => Ok(CommandResult::Message("Usage: /cancel <step-id>".to_string())),

        _ => Ok(CommandResult::Unknown(command)),
    })
}

async fn list_threads(store: &FileStore, current: &str) -> Result<CommandResult> {
    let summaries = store.summaries().await?;
    if summaries.is_empty() {
        return Ok(CommandResult::Message("No saved threads.".to_string()));
    }
    let mut output = String::new();
    for s in summaries {
        let marker = if s.id == current { "*" } else { " " };
        output.push_str(&format!(
            "{} {:<38} {:<17} {:>4} msgs",
            marker,
            s.id,
            s.last_activity_display(),
            s.message_count
        ));
        if let Some(question) = &s.pending {
            output.push_str(&format!("  waiting: {}", truncate_chars(question, 40)));
        }
        output.push('\n');
    }
    Ok(CommandResult::Message(output.trim_end().to_string()))
}

async fn show_thread(orchestrator: &Orchestrator, thread_id: &str) -> Result<CommandResult> {
    let Some(state) = orchestrator.load(thread_id).await? else {
        return Ok(CommandResult::Message("No messages yet.".to_string()));
    };
    let lines: Vec<String> = state
        .recent_messages
        .iter()
        .map(|m| {
            let role = match m.role {
                concierge_core::Role::User => "you",
                concierge_core::Role::Assistant => "concierge",
            };
            format!("[{}] {}", role, truncate_chars(&m.content.replace('\n', " "), 100))
        })
        .collect();
    Ok(CommandResult::Message(lines.join("\n")))
}

fn help_message() -> String {
    r#"Available commands:
  /help, /h, /?        Show this help message
  /status, /s          Show thread state and counters
  /threads, /t         List saved threads
  /switch <id>         Continue a saved thread
  /show                Show recent messages of this thread
  /retry, /r           Retry steps that failed in the last turn
  /cancel <step-id>    Give up on an unresolved step
  /new, /n             Start a new thread
  /quit, /exit, /q     Exit concierge

While a question is pending, your next message answers it. Reply with an
option number or part of its text."#
        .to_string()
}
