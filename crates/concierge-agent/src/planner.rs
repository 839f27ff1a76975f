//! Turning a message into an ordered plan of capability-tagged steps

use async_trait::async_trait;
use concierge_core::{
    CapabilityRegistry, ExecutionMetadata, PatternMatch, PlanStep, RoutingSuggestion,
};
use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, LazyLock};

use crate::classifier::{BoxedClassifier, extract_json};
use crate::error::{Error, Result};
use crate::state::ConversationState;

/// Score gap under which the top matches count as ambiguous
const AMBIGUITY_MARGIN: f64 = 10.0;

/// Maximum number of routing suggestions offered
const MAX_SUGGESTIONS: usize = 3;

/// Splits compound requests ("do X and then Y; Z") into segments
static STEP_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*(?:;|\band then\b|\bthen\b|\by luego\b)\s*").expect("valid separator regex")
});

/// A plan plus optional disambiguation hints
#[derive(Debug, Clone, Default)]
pub struct PlanOutput {
    pub steps: Vec<PlanStep>,
    pub routing_suggestions: Option<Vec<RoutingSuggestion>>,
    /// Telemetry produced while planning (LLM calls, usage)
    pub metadata: ExecutionMetadata,
}

/// Produces the plan for a turn
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, message: &str, state: &ConversationState) -> Result<PlanOutput>;
}

/// Type alias for a shared planner
pub type BoxedPlanner = Arc<dyn Planner>;

/// Deterministic planner built on the capability registry's trigger phrases
pub struct PatternPlanner {
    registry: Arc<CapabilityRegistry>,
}

impl PatternPlanner {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    /// Plan synchronously; used directly and as the classifier fallback
    pub fn plan_segments(&self, message: &str, state: &ConversationState) -> PlanOutput {
        let enabled = |capability: &str| {
            state
                .user
                .as_ref()
                .is_none_or(|u| u.capability_enabled(capability))
        };

        let mut steps = Vec::new();
        let mut suggestions = None;

        for segment in split_segments(message) {
            let id = format!("s{}", steps.len() + 1);
            let matches = self
                .registry
                .match_patterns_where(segment, |e| enabled(&e.capability));

            let step = match matches.first() {
                Some(best) => {
                    if suggestions.is_none() && is_ambiguous(&matches) {
                        suggestions = Some(to_suggestions(&matches));
                    }
                    PlanStep::new(id, &best.entry.capability, best.entry.default_action())
                }
                None => PlanStep::new(id, "chat", "respond"),
            };
            steps.push(step.with_constraints(serde_json::json!({ "text": segment })));
        }

        if steps.is_empty() {
            steps.push(
                PlanStep::new("s1", "chat", "respond")
                    .with_constraints(serde_json::json!({ "text": message.trim() })),
            );
        }

        PlanOutput {
            steps,
            routing_suggestions: suggestions,
            metadata: ExecutionMetadata::default(),
        }
    }
}

#[async_trait]
impl Planner for PatternPlanner {
    async fn plan(&self, message: &str, state: &ConversationState) -> Result<PlanOutput> {
        Ok(self.plan_segments(message, state))
    }
}

/// Planner that asks a classifier for a JSON plan and falls back to patterns
pub struct ClassifierPlanner {
    classifier: BoxedClassifier,
    registry: Arc<CapabilityRegistry>,
    fallback: PatternPlanner,
}

#[derive(Deserialize)]
struct ClassifiedPlan {
    steps: Vec<ClassifiedStep>,
}

#[derive(Deserialize)]
struct ClassifiedStep {
    capability: String,
    action: String,
    #[serde(default)]
    constraints: serde_json::Value,
}

impl ClassifierPlanner {
    pub fn new(classifier: BoxedClassifier, registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            classifier,
            fallback: PatternPlanner::new(Arc::clone(&registry)),
            registry,
        }
    }

    fn system_context(&self) -> String {
        format!(
            "Split the user's message into an ordered list of steps. \
             Answer with JSON: {{\"steps\": [{{\"capability\", \"action\", \"constraints\"}}]}}.\n\
             Available capabilities:\n{}",
            self.registry.describe()
        )
    }

    /// Parse a classifier payload, keeping only steps the registry knows about
    fn parse_steps(&self, value: serde_json::Value) -> Result<Vec<PlanStep>> {
        let value = match value {
            serde_json::Value::String(text) => extract_json(&text)?,
            other => other,
        };
        let plan: ClassifiedPlan = serde_json::from_value(value)?;
        let mut steps = Vec::new();
        for s in plan.steps {
            if self.registry.find_action(&s.capability, &s.action).is_none() {
                tracing::warn!(
                    "Classifier proposed unknown step {}/{}, dropping it",
                    s.capability,
                    s.action
                );
                continue;
            }
            let constraints = if s.constraints.is_object() {
                s.constraints
            } else {
                serde_json::json!({})
            };
            steps.push(
                PlanStep::new(format!("s{}", steps.len() + 1), s.capability, s.action)
                    .with_constraints(constraints),
            );
        }
        if steps.is_empty() {
            return Err(Error::Classifier("plan has no usable steps".to_string()));
        }
        Ok(steps)
    }
}

#[async_trait]
impl Planner for ClassifierPlanner {
    async fn plan(&self, message: &str, state: &ConversationState) -> Result<PlanOutput> {
        let pattern = self.fallback.plan_segments(message, state);
        let user_context = match state.now.as_ref() {
            Some(now) => format!("[now: {}]\n{}", now.local.to_rfc3339(), message),
            None => message.to_string(),
        };

        match self
            .classifier
            .classify(&self.system_context(), &user_context)
            .await
        {
            Ok(classification) => {
                let metadata = ExecutionMetadata::llm_call(classification.usage);
                match self.parse_steps(classification.value) {
                    Ok(steps) => Ok(PlanOutput {
                        steps,
                        routing_suggestions: pattern.routing_suggestions,
                        metadata,
                    }),
                    Err(e) => {
                        tracing::warn!("Unusable classifier plan, using pattern plan: {}", e);
                        Ok(PlanOutput { metadata, ..pattern })
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Classifier failed, using pattern plan: {}", e);
                Ok(pattern)
            }
        }
    }
}

/// Split a message into non-empty request segments
pub fn split_segments(message: &str) -> Vec<&str> {
    STEP_SEPARATOR
        .split(message)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn is_ambiguous(matches: &[PatternMatch<'_>]) -> bool {
    match matches {
        [first, second, ..] => first.score - second.score < AMBIGUITY_MARGIN,
        _ => false,
    }
}

fn to_suggestions(matches: &[PatternMatch<'_>]) -> Vec<RoutingSuggestion> {
    matches
        .iter()
        .take(MAX_SUGGESTIONS)
        .map(|m| RoutingSuggestion {
            label: m.entry.summary.clone(),
            capability: m.entry.capability.clone(),
            action: m.entry.default_action().to_string(),
            score: m.score,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Classification, Classifier};
    use concierge_core::{Usage, UserContext};

    fn planner() -> PatternPlanner {
        PatternPlanner::new(Arc::new(CapabilityRegistry::builtin()))
    }

    #[test]
    fn test_split_segments() {
        assert_eq!(
            split_segments("show my calendar and then list my tasks; say hello"),
            vec!["show my calendar", "list my tasks", "say hello"]
        );
        assert_eq!(split_segments("   "), Vec::<&str>::new());
    }

    #[test]
    fn test_compound_request_becomes_ordered_plan() {
        let out = planner().plan_segments(
            "what's on my calendar then show my tasks",
            &ConversationState::new("T1"),
        );
        assert_eq!(out.steps.len(), 2);
        assert_eq!(out.steps[0].id, "s1");
        assert_eq!(out.steps[0].capability, "calendar");
        assert_eq!(out.steps[0].action, "list_events");
        assert_eq!(out.steps[1].id, "s2");
        assert_eq!(out.steps[1].capability, "database");
        assert_eq!(out.steps[1].action, "list_tasks");
        assert_eq!(out.steps[1].constraint_str("text"), Some("show my tasks"));
    }

    #[test]
    fn test_unmatched_message_falls_back_to_chat() {
        let out = planner().plan_segments("qwerty asdf", &ConversationState::new("T1"));
        assert_eq!(out.steps.len(), 1);
        assert_eq!(out.steps[0].capability, "chat");
        assert!(out.routing_suggestions.is_none());
    }

    #[test]
    fn test_ambiguous_message_gets_suggestions() {
        let out = planner().plan_segments(
            "cancel the meeting or delete the task",
            &ConversationState::new("T1"),
        );
        let suggestions = out.routing_suggestions.unwrap();
        assert!(suggestions.len() >= 2);
        assert!(suggestions.len() <= MAX_SUGGESTIONS);
    }

    #[test]
    fn test_disabled_capabilities_are_skipped() {
        let mut state = ConversationState::new("T1");
        state.user = Some(UserContext {
            enabled_capabilities: vec!["database".into()],
            ..Default::default()
        });
        let out = planner().plan_segments("what's on my calendar", &state);
        assert_eq!(out.steps[0].capability, "chat");
    }

    struct FixedClassifier(Result<serde_json::Value>);

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify(&self, system: &str, _user: &str) -> Result<Classification> {
            assert!(system.contains("task_create"));
            match &self.0 {
                Ok(v) => Ok(Classification {
                    value: v.clone(),
                    usage: Usage { input: 40, output: 8 },
                }),
                Err(e) => Err(Error::Classifier(e.to_string())),
            }
        }
    }

    #[tokio::test]
    async fn test_classifier_plan_is_used_and_counted() {
        let registry = Arc::new(CapabilityRegistry::builtin());
        let classifier = Arc::new(FixedClassifier(Ok(serde_json::json!({
            "steps": [
                {"capability": "database", "action": "create_task", "constraints": {"title": "milk"}},
                {"capability": "weather", "action": "forecast"}
            ]
        }))));
        let p = ClassifierPlanner::new(classifier, registry);
        let out = p
            .plan("please note milk", &ConversationState::new("T1"))
            .await
            .unwrap();
        assert_eq!(out.steps.len(), 1);
        assert_eq!(out.steps[0].action, "create_task");
        assert_eq!(out.steps[0].constraint_str("title"), Some("milk"));
        assert_eq!(out.metadata.llm_calls, 1);
        assert_eq!(out.metadata.usage.total(), 48);
    }

    #[tokio::test]
    async fn test_classifier_failure_falls_back_to_patterns() {
        let registry = Arc::new(CapabilityRegistry::builtin());
        let classifier = Arc::new(FixedClassifier(Err(Error::Classifier("down".into()))));
        let p = ClassifierPlanner::new(classifier, registry);
        let out = p
            .plan("remind me to buy milk", &ConversationState::new("T1"))
            .await
            .unwrap();
        assert_eq!(out.steps[0].action, "create_task");
        assert_eq!(out.metadata.llm_calls, 0);
    }
}
