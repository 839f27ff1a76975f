//! Long-term memory resolver

use async_trait::async_trait;
use concierge_agent::{ConversationState, Error, Resolver, Result};
use concierge_core::{CapabilityRegistry, PlanStep, ResolverResult};
use serde_json::json;
use std::sync::Arc;

use super::{constraints_schema, subject};

pub struct MemoryResolver {
    registry: Arc<CapabilityRegistry>,
}

impl MemoryResolver {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Resolver for MemoryResolver {
    fn name(&self) -> &str {
        "memory"
    }

    fn capability(&self) -> &str {
        "memory"
    }

    fn actions(&self) -> &[&str] {
        &["save_memory", "search_memory"]
    }

    fn constraints_schema(&self) -> Option<serde_json::Value> {
        Some(constraints_schema(&["content", "query"]))
    }

    async fn resolve(&self, step: &PlanStep, _state: &ConversationState) -> Result<ResolverResult> {
        match step.action.as_str() {
            "save_memory" => {
                let content = subject(&self.registry, step, "content");
                if content.is_empty() {
                    return Err(Error::validation(&step.id, "what should I remember"));
                }
                Ok(ResolverResult::execute(&step.id, json!({ "content": content })))
            }
            "search_memory" => Ok(ResolverResult::execute(
                &step.id,
                json!({ "query": subject(&self.registry, step, "query") }),
            )),
            other => Err(Error::handler(self.name(), format!("unsupported action {}", other))),
        }
    }
}
