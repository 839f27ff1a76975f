//! General conversation resolver

use async_trait::async_trait;
use chrono::Timelike;
use concierge_agent::{ConversationState, Resolver, Result};
use concierge_core::{CapabilityRegistry, PlanStep, ResolverResult};
use serde_json::json;
use std::sync::Arc;

const GREETINGS: &[&str] = &["hello", "hi", "hey", "hola", "buenos", "good morning"];
const THANKS: &[&str] = &["thanks", "thank you", "gracias"];

/// Answers small talk and explains what the assistant can do
pub struct ChatResolver {
    registry: Arc<CapabilityRegistry>,
}

impl ChatResolver {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    fn help(&self) -> String {
        let mut lines = vec!["I can help with:".to_string()];
        for entry in self.registry.entries() {
            if entry.capability == "chat" {
                continue;
            }
            match entry.examples.first() {
                Some(example) => lines.push(format!("- {} (\"{}\")", entry.summary, example)),
                None => lines.push(format!("- {}", entry.summary)),
            }
        }
        lines.join("\n")
    }
}

fn part_of_day(state: &ConversationState) -> &'static str {
    match state.now.as_ref().map(|n| n.local.hour()) {
        Some(5..=11) => "Good morning",
        Some(12..=17) => "Good afternoon",
        Some(_) => "Good evening",
        None => "Hello",
    }
}

#[async_trait]
impl Resolver for ChatResolver {
    fn name(&self) -> &str {
        "chat"
    }

    fn capability(&self) -> &str {
        "chat"
    }

    fn actions(&self) -> &[&str] {
        &["respond"]
    }

    async fn resolve(&self, step: &PlanStep, state: &ConversationState) -> Result<ResolverResult> {
        let text = step
            .constraint_str("text")
            .unwrap_or_else(|| state.input_text())
            .to_lowercase();
        let words: Vec<&str> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let says = |phrases: &[&str]| {
            phrases
                .iter()
                .any(|p| words.contains(p) || (p.contains(' ') && text.contains(p)))
        };

        let reply = if says(THANKS) {
            "You're welcome!".to_string()
        } else if says(GREETINGS) {
            let name = state
                .user
                .as_ref()
                .and_then(|u| u.display_name.as_deref())
                .map(|n| format!(", {}", n))
                .unwrap_or_default();
            format!("{}{}! How can I help?", part_of_day(state), name)
        } else {
            self.help()
        };
        Ok(ResolverResult::execute(&step.id, json!({ "reply": reply })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use concierge_core::{TimeContext, UserContext};

    #[tokio::test]
    async fn test_greeting_uses_local_time_and_name() {
        let r = ChatResolver::new(Arc::new(CapabilityRegistry::builtin()));
        let user = UserContext {
            display_name: Some("Ana".into()),
            utc_offset_minutes: 120,
            ..Default::default()
        };
        let mut state = ConversationState::new("T1");
        state.now = Some(TimeContext::resolve(
            &user,
            Utc.with_ymd_and_hms(2025, 3, 1, 7, 0, 0).unwrap(),
        ));
        state.user = Some(user);

        let step = PlanStep::new("s1", "chat", "respond").with_constraints(json!({ "text": "Hello!" }));
        let result = r.resolve(&step, &state).await.unwrap();
        assert_eq!(result.args().unwrap()["reply"], "Good morning, Ana! How can I help?");
    }

    #[tokio::test]
    async fn test_unknown_chat_lists_capabilities() {
        let r = ChatResolver::new(Arc::new(CapabilityRegistry::builtin()));
        let step = PlanStep::new("s1", "chat", "respond").with_constraints(json!({ "text": "qwerty" }));
        let result = r.resolve(&step, &ConversationState::new("T1")).await.unwrap();
        let reply = result.args().unwrap()["reply"].as_str().unwrap().to_string();
        assert!(reply.starts_with("I can help with:"));
        assert!(reply.contains("Create a task or reminder"));
    }
}
