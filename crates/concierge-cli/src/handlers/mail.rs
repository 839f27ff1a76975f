//! Mail resolver

use async_trait::async_trait;
use concierge_agent::{ConversationState, Error, Resolver, Result};
use concierge_core::{CapabilityRegistry, PlanStep, ResolverResult};
use regex::Regex;
use serde_json::json;
use std::sync::{Arc, LazyLock};

use super::{constraints_schema, subject};

/// "Bob saying I'll be late" / "Bob that the report is ready"
static RECIPIENT_AND_BODY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?P<to>.+?)\s+(?:saying|that|about|diciendo|que)\s+(?P<body>.+)$")
        .expect("valid mail regex")
});

pub struct MailResolver {
    registry: Arc<CapabilityRegistry>,
}

impl MailResolver {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }
}

/// Recipient and body from free text; a bare text is all recipient
fn parse_message(text: &str) -> (String, String) {
    match RECIPIENT_AND_BODY.captures(text) {
        Some(c) => (c["to"].trim().to_string(), c["body"].trim().to_string()),
        None => (text.trim().to_string(), String::new()),
    }
}

#[async_trait]
impl Resolver for MailResolver {
    fn name(&self) -> &str {
        "mail"
    }

    fn capability(&self) -> &str {
        "mail"
    }

    fn actions(&self) -> &[&str] {
        &["send_email", "search_emails"]
    }

    fn constraints_schema(&self) -> Option<serde_json::Value> {
        Some(constraints_schema(&["to", "body", "query"]))
    }

    async fn resolve(&self, step: &PlanStep, state: &ConversationState) -> Result<ResolverResult> {
        match step.action.as_str() {
            "send_email" => {
                let (parsed_to, parsed_body) = parse_message(&subject(&self.registry, step, "to"));
                let body = step
                    .constraint_str("body")
                    .map(str::to_string)
                    .unwrap_or(parsed_body);

                let to = match state.clarification_for(&step.id) {
                    Some(answer) => answer.text.trim().to_string(),
                    None => parsed_to,
                };
                if to.is_empty() {
                    return Ok(ResolverResult::clarify(
                        &step.id,
                        "Who should I send it to?",
                        vec![],
                    )
                    .with_entity_type("recipient"));
                }
                Ok(ResolverResult::execute(
                    &step.id,
                    json!({ "to": to, "body": body }),
                ))
            }
            "search_emails" => Ok(ResolverResult::execute(
                &step.id,
                json!({ "query": subject(&self.registry, step, "query") }),
            )),
            other => Err(Error::handler(self.name(), format!("unsupported action {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use concierge_core::{HitlResultEntry, ReturnTo};

    #[test]
    fn test_parse_message() {
        assert_eq!(
            parse_message("Bob saying I'll be late"),
            ("Bob".to_string(), "I'll be late".to_string())
        );
        assert_eq!(parse_message("Bob"), ("Bob".to_string(), String::new()));
    }

    #[tokio::test]
    async fn test_missing_recipient_asks_for_one() {
        let r = MailResolver::new(Arc::new(CapabilityRegistry::builtin()));
        let step = PlanStep::new("s1", "mail", "send_email")
            .with_constraints(json!({ "text": "send an email" }));
        let mut state = ConversationState::new("T1");

        let result = r.resolve(&step, &state).await.unwrap();
        assert!(matches!(result, ResolverResult::Clarify { .. }));

        state.hitl_results.insert(
            "s1#recipient".into(),
            HitlResultEntry {
                text: "ana@example.com".into(),
                return_to: ReturnTo::step("s1").with_mode("recipient"),
                received_at: Utc::now(),
            },
        );
        let result = r.resolve(&step, &state).await.unwrap();
        assert_eq!(result.args().unwrap()["to"], "ana@example.com");
    }
}
