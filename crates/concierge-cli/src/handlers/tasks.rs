//! Task resolver

use async_trait::async_trait;
use concierge_agent::{ConversationState, Error, Resolver, Result};
use concierge_core::{CapabilityRegistry, PlanStep, ResolverResult};
use serde_json::json;
use std::sync::Arc;

use super::{constraints_schema, pick, subject};
use crate::workspace::{Task, Workspace};

/// Resolves task steps against the workspace, asking which task is meant
/// when a reference matches more than one
pub struct TaskResolver {
    registry: Arc<CapabilityRegistry>,
    workspace: Workspace,
}

impl TaskResolver {
    pub fn new(registry: Arc<CapabilityRegistry>, workspace: Workspace) -> Self {
        Self {
            registry,
            workspace,
        }
    }

    fn resolve_reference(&self, step: &PlanStep, state: &ConversationState) -> Result<ResolverResult> {
        if let Some(id) = step.constraint_str("id") {
            return Ok(ResolverResult::execute(&step.id, json!({ "id": id })));
        }

        let query = subject(&self.registry, step, "title");
        let candidates = self.workspace.open_tasks_matching(&query);
        let chosen = |task: &Task| {
            ResolverResult::execute(&step.id, json!({ "id": task.id, "title": task.title }))
        };

        if let Some(answer) = state.clarification_for(&step.id) {
            return pick(&candidates, &answer.text, |t| t.title.as_str())
                .map(chosen)
                .ok_or_else(|| {
                    Error::validation(&step.id, format!("no open task matches \"{}\"", answer.text))
                });
        }

        match candidates.as_slice() {
            [] => Err(Error::validation(
                &step.id,
                format!("no open task matches \"{}\"", query),
            )),
            [only] => Ok(chosen(only)),
            many => Ok(ResolverResult::clarify(
                &step.id,
                "Which task did you mean?",
                many.iter().map(|t| t.title.clone()).collect(),
            )
            .with_entity_type("task")),
        }
    }
}

#[async_trait]
impl Resolver for TaskResolver {
    fn name(&self) -> &str {
        "tasks"
    }

    fn capability(&self) -> &str {
        "database"
    }

    fn actions(&self) -> &[&str] {
        &["create_task", "complete_task", "delete_task", "list_tasks"]
    }

    fn constraints_schema(&self) -> Option<serde_json::Value> {
        Some(constraints_schema(&["title", "id"]))
    }

    async fn resolve(&self, step: &PlanStep, state: &ConversationState) -> Result<ResolverResult> {
        match step.action.as_str() {
            "create_task" => {
                let title = subject(&self.registry, step, "title");
                if title.is_empty() {
                    return Err(Error::validation(&step.id, "what should the task say"));
                }
                Ok(ResolverResult::execute(&step.id, json!({ "title": title })))
            }
            "complete_task" | "delete_task" => self.resolve_reference(step, state),
            "list_tasks" => Ok(ResolverResult::execute(&step.id, json!({}))),
            other => Err(Error::handler(self.name(), format!("unsupported action {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkspaceAdapter;
    use chrono::Utc;
    use concierge_agent::Adapter;
    use concierge_core::{HitlResultEntry, ReturnTo};

    async fn workspace_with(titles: &[&str]) -> Workspace {
        let ws = Workspace::in_memory();
        let adapter = WorkspaceAdapter::new("database", ws.clone());
        for title in titles {
            adapter
                .execute("create_task", &json!({ "title": title }))
                .await;
        }
        ws
    }

    fn resolver(ws: Workspace) -> TaskResolver {
        TaskResolver::new(Arc::new(CapabilityRegistry::builtin()), ws)
    }

    fn step(action: &str, text: &str) -> PlanStep {
        PlanStep::new("s1", "database", action).with_constraints(json!({ "text": text }))
    }

    #[tokio::test]
    async fn test_create_uses_subject() {
        let r = resolver(Workspace::in_memory());
        let result = r
            .resolve(&step("create_task", "remind me to buy milk"), &ConversationState::new("T1"))
            .await
            .unwrap();
        assert_eq!(result.args().unwrap()["title"], "buy milk");
    }

    #[tokio::test]
    async fn test_single_match_resolves_directly() {
        let r = resolver(workspace_with(&["buy milk", "call mom"]).await);
        let result = r
            .resolve(&step("delete_task", "delete the task about milk"), &ConversationState::new("T1"))
            .await
            .unwrap();
        assert_eq!(result.args().unwrap()["title"], "buy milk");
    }

    #[tokio::test]
    async fn test_ambiguous_reference_asks_then_uses_answer() {
        let r = resolver(workspace_with(&["buy milk", "buy bread"]).await);
        let s = step("delete_task", "delete the task about buy");
        let mut state = ConversationState::new("T1");

        let result = r.resolve(&s, &state).await.unwrap();
        let ResolverResult::Clarify {
            options,
            entity_type,
            ..
        } = result
        else {
            panic!("expected a clarification");
        };
        assert_eq!(options, vec!["buy milk".to_string(), "buy bread".to_string()]);
        assert_eq!(entity_type.as_deref(), Some("task"));

        state.hitl_results.insert(
            "s1#task".into(),
            HitlResultEntry {
                text: "2".into(),
                return_to: ReturnTo::step("s1").with_mode("task"),
                received_at: Utc::now(),
            },
        );
        let result = r.resolve(&s, &state).await.unwrap();
        assert_eq!(result.args().unwrap()["title"], "buy bread");
    }

    #[tokio::test]
    async fn test_no_match_is_validation_error() {
        let r = resolver(workspace_with(&["buy milk"]).await);
        let err = r
            .resolve(&step("complete_task", "finished the report"), &ConversationState::new("T1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
