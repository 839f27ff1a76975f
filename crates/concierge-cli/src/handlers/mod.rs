//! Capability resolvers for the builtin catalog

mod calendar;
mod chat;
mod mail;
mod memory;
mod tasks;

pub use calendar::CalendarResolver;
pub use chat::ChatResolver;
pub use mail::MailResolver;
pub use memory::MemoryResolver;
pub use tasks::TaskResolver;

use concierge_agent::BoxedResolver;
use concierge_core::{CapabilityRegistry, PlanStep};
use serde_json::json;
use std::sync::Arc;

use crate::workspace::Workspace;

/// Constraint schema shared by the builtin resolvers: free text plus
/// optional structured fields, all strings
fn constraints_schema(fields: &[&str]) -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    properties.insert("text".to_string(), json!({ "type": "string" }));
    for field in fields {
        properties.insert(field.to_string(), json!({ "type": "string" }));
    }
    json!({ "type": "object", "properties": properties })
}

/// Every builtin resolver, sharing one registry and workspace
pub fn builtin(registry: &Arc<CapabilityRegistry>, workspace: &Workspace) -> Vec<BoxedResolver> {
    vec![
        Arc::new(TaskResolver::new(Arc::clone(registry), workspace.clone())),
        Arc::new(CalendarResolver::new(Arc::clone(registry), workspace.clone())),
        Arc::new(MemoryResolver::new(Arc::clone(registry))),
        Arc::new(MailResolver::new(Arc::clone(registry))),
        Arc::new(ChatResolver::new(Arc::clone(registry))),
    ]
}

/// What a step is about: an explicit constraint if the planner gave one,
/// otherwise the step's text with its trigger phrase removed
pub(crate) fn subject(registry: &CapabilityRegistry, step: &PlanStep, field: &str) -> String {
    if let Some(value) = step.constraint_str(field).filter(|v| !v.trim().is_empty()) {
        return value.trim().to_string();
    }
    let text = step.constraint_str("text").unwrap_or_default();
    match registry.find_action(&step.capability, &step.action) {
        Some(entry) => entry.subject(text),
        None => text.trim().to_string(),
    }
}

/// Pick one candidate from a clarification answer: a 1-based number or a
/// fragment of exactly one candidate's label
pub(crate) fn pick<'a, T>(
    candidates: &'a [T],
    answer: &str,
    label: impl Fn(&T) -> &str,
) -> Option<&'a T> {
    let answer = answer.trim().to_lowercase();
    if let Ok(n) = answer.parse::<usize>() {
        return n.checked_sub(1).and_then(|i| candidates.get(i));
    }
    if let Some(exact) = candidates.iter().find(|c| label(c).to_lowercase() == answer) {
        return Some(exact);
    }
    let mut partial = candidates
        .iter()
        .filter(|c| label(c).to_lowercase().contains(&answer));
    match (partial.next(), partial.next()) {
        (Some(only), None) => Some(only),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_by_number_and_fragment() {
        fn label<'a>(s: &'a &str) -> &'a str {
            s
        }
        let items = ["buy milk", "buy bread", "call mom"];
        assert_eq!(pick(&items, "2", label), Some(&"buy bread"));
        assert_eq!(pick(&items, "0", label), None);
        assert_eq!(pick(&items, "MILK", label), Some(&"buy milk"));
        // ambiguous fragment
        assert_eq!(pick(&items, "buy", label), None);
        assert_eq!(pick(&items, "call mom", label), Some(&"call mom"));
    }

    #[test]
    fn test_subject_prefers_explicit_field() {
        let registry = CapabilityRegistry::builtin();
        let step = PlanStep::new("s1", "database", "create_task")
            .with_constraints(json!({"text": "remind me to buy milk"}));
        assert_eq!(subject(&registry, &step, "title"), "buy milk");

        let step = step.with_constraints(json!({"text": "remind me", "title": "Pay rent"}));
        assert_eq!(subject(&registry, &step, "title"), "Pay rent");
    }
}
