//! Final reply formatting seam

use concierge_core::ResolverResult;

use crate::state::ConversationState;

/// Turns a completed state into the reply text
pub trait ResponseFormatter: Send + Sync {
    fn format(&self, state: &ConversationState) -> String;
}

/// Plain-text formatter: one line per step, then the error notice if any
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainFormatter;

impl ResponseFormatter for PlainFormatter {
    fn format(&self, state: &ConversationState) -> String {
        let mut lines = Vec::new();
        for step in &state.plan {
            let line = match (
                state.execution_results.get(&step.id),
                state.resolver_results.get(&step.id),
            ) {
                (Some(exec), _) if exec.success => match &exec.data {
                    Some(serde_json::Value::String(text)) => text.clone(),
                    Some(data) if reply_text(data).is_some() => {
                        reply_text(data).unwrap_or_default().to_string()
                    }
                    Some(data) if !data.is_null() => format!("{}: {}", step.action, data),
                    _ => format!("{}: done", step.action),
                },
                (Some(exec), _) => format!(
                    "{}: failed ({})",
                    step.action,
                    exec.error.as_deref().unwrap_or("unknown error")
                ),
                (None, Some(ResolverResult::Execute { .. })) => {
                    format!("{}: ready", step.action)
                }
                _ => continue,
            };
            lines.push(line);
        }
        if let Some(error) = &state.error {
            lines.push(error.clone());
        }
        if lines.is_empty() {
            "Sorry, I couldn't work out what to do. Could you rephrase that?".to_string()
        } else {
            lines.join("\n")
        }
    }
}

/// Human-readable text an adapter or resolver put in its payload
fn reply_text(data: &serde_json::Value) -> Option<&str> {
    ["message", "reply"]
        .iter()
        .find_map(|k| data.get(*k).and_then(|v| v.as_str()))
}
