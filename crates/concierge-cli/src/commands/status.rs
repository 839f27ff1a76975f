//! /status command - show thread state and runtime counters

use super::CommandResult;
use concierge_agent::{Orchestrator, Result, TurnStatus};

pub struct StatusCommand;

impl StatusCommand {
    pub async fn execute(orchestrator: &Orchestrator, thread_id: &str) -> Result<CommandResult> {
        let mut output = String::from("Thread Status\n");
        output.push_str(&"-".repeat(40));
        output.push('\n');
        output.push_str(&format!("Thread:     {}\n", thread_id));

        match orchestrator.load(thread_id).await? {
            Some(state) => {
                let status = orchestrator
                    .status(thread_id)
                    .await?
                    .unwrap_or(TurnStatus::Running);
                output.push_str(&format!("Status:     {}\n", status_label(status)));
                output.push_str(&format!("Trace:      {}\n", state.trace_id));
                output.push_str(&format!("Messages:   {}\n", state.recent_messages.len()));

                let resolved = state.plan.iter().filter(|s| state.is_resolved(&s.id)).count();
                output.push_str(&format!(
                    "Plan:       {} steps, {} resolved\n",
                    state.plan.len(),
                    resolved
                ));
                for step in state.unresolved_steps() {
                    output.push_str(&format!(
                        "            {} {}.{} unresolved\n",
                        step.id, step.capability, step.action
                    ));
                }
                if let Some(pending) = &state.pending_hitl {
                    output.push_str(&format!(
                        "Waiting on: {} ({})\n",
                        pending.question,
                        pending.step_id()
                    ));
                }
                if let Some(error) = &state.error {
                    output.push_str(&format!("Last error: {}\n", error));
                }
                output.push_str(&format!(
                    "Ledger:     {} committed operations\n",
                    state.executed_operations.len()
                ));
            }
            None => output.push_str("Status:     new (nothing saved yet)\n"),
        }
        output.push('\n');

        let t = orchestrator.telemetry().snapshot();
        output.push_str("Counters (this process):\n");
        for (label, value) in [
            ("Turns", t.turns),
            ("Suspensions", t.suspensions),
            ("Resumes", t.resumes),
            ("Expired", t.expired),
            ("Mismatches", t.mismatches),
            ("Duplicate skips", t.duplicate_skips),
            ("Handler errors", t.handler_errors),
        ] {
            output.push_str(&format!("  {:<16} {:>8}\n", format!("{}:", label), format_number(value)));
        }

        Ok(CommandResult::Message(output))
    }
}

fn status_label(status: TurnStatus) -> &'static str {
    match status {
        TurnStatus::Running => "running",
        TurnStatus::AwaitingClarification => "awaiting clarification",
        TurnStatus::Resuming => "resuming",
        TurnStatus::TimedOut => "timed out",
        TurnStatus::Completed => "completed",
    }
}

fn format_number(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}k", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}
