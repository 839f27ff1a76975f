//! Calendar resolver

use async_trait::async_trait;
use concierge_agent::{ConversationState, Error, Resolver, Result};
use concierge_core::{CapabilityRegistry, PlanStep, ResolverResult};
use regex::Regex;
use serde_json::json;
use std::sync::{Arc, LazyLock};

use super::{constraints_schema, pick, subject};
use crate::workspace::Workspace;

/// Trailing time expression of an event request ("... tomorrow at 10")
static WHEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\s+((?:on\s+|at\s+|next\s+)?(?:today|tonight|tomorrow|monday|tuesday|wednesday|thursday|friday|saturday|sunday|mañana|hoy)\b.*|at\s+\d{1,2}(?::\d{2})?\s*(?:am|pm)?)$",
    )
    .expect("valid time regex")
});

pub struct CalendarResolver {
    registry: Arc<CapabilityRegistry>,
    workspace: Workspace,
}

impl CalendarResolver {
    pub fn new(registry: Arc<CapabilityRegistry>, workspace: Workspace) -> Self {
        Self {
            registry,
            workspace,
        }
    }
}

/// Split "Ana tomorrow at 10" into a title and a time expression
fn split_when(text: &str) -> (String, Option<String>) {
    match WHEN.captures(text).and_then(|c| c.get(0).zip(c.get(1))) {
        Some((whole, when)) => (
            text[..whole.start()].trim().to_string(),
            Some(when.as_str().trim().to_string()),
        ),
        None => (text.trim().to_string(), None),
    }
}

#[async_trait]
impl Resolver for CalendarResolver {
    fn name(&self) -> &str {
        "calendar"
    }

    fn capability(&self) -> &str {
        "calendar"
    }

    fn actions(&self) -> &[&str] {
        &["create_event", "delete_event", "list_events"]
    }

    fn constraints_schema(&self) -> Option<serde_json::Value> {
        Some(constraints_schema(&["title", "when", "id"]))
    }

    async fn resolve(&self, step: &PlanStep, state: &ConversationState) -> Result<ResolverResult> {
        match step.action.as_str() {
            "create_event" => {
                let (title, parsed_when) = split_when(&subject(&self.registry, step, "title"));
                let when = step.constraint_str("when").map(str::to_string).or(parsed_when);
                if title.is_empty() {
                    return Err(Error::validation(&step.id, "what is the event about"));
                }
                Ok(ResolverResult::execute(
                    &step.id,
                    json!({ "title": title, "when": when }),
                ))
            }
            "delete_event" => {
                if let Some(id) = step.constraint_str("id") {
                    return Ok(ResolverResult::execute(&step.id, json!({ "id": id })));
                }
                let query = subject(&self.registry, step, "title");
                let events = self.workspace.events_matching(&query);

                if let Some(answer) = state.clarification_for(&step.id) {
                    return pick(&events, &answer.text, |e| e.title.as_str())
                        .map(|e| ResolverResult::execute(&step.id, json!({ "id": e.id })))
                        .ok_or_else(|| {
                            Error::validation(&step.id, format!("no event matches \"{}\"", answer.text))
                        });
                }

                match events.as_slice() {
                    [] => Err(Error::validation(
                        &step.id,
                        format!("no event matches \"{}\"", query),
                    )),
                    [only] => Ok(ResolverResult::execute(&step.id, json!({ "id": only.id }))),
                    many => Ok(ResolverResult::clarify(
                        &step.id,
                        "Which event should I cancel?",
                        many.iter().map(|e| e.title.clone()).collect(),
                    )
                    .with_entity_type("event")),
                }
            }
            "list_events" => Ok(ResolverResult::execute(&step.id, json!({}))),
            other => Err(Error::handler(self.name(), format!("unsupported action {}", other))),
        }
    }
}
