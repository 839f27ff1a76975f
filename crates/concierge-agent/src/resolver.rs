//! Capability handler trait and step selection

use async_trait::async_trait;
use concierge_core::{PlanStep, ResolverResult};
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Result;
use crate::state::ConversationState;

/// A capability handler ("resolver"): turns one plan step into a concrete
/// operation or a clarification request.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Handler name (used in logs and error messages)
    fn name(&self) -> &str;

    /// Capability tag this handler serves
    fn capability(&self) -> &str;

    /// Action hints this handler accepts
    fn actions(&self) -> &[&str];

    /// Optional JSON Schema the step's constraints must satisfy
    fn constraints_schema(&self) -> Option<serde_json::Value> {
        None
    }

    /// Resolve a step.
    ///
    /// On a resumed turn the user's answer is available through
    /// [`ConversationState::clarification_for`].
    async fn resolve(&self, step: &PlanStep, state: &ConversationState) -> Result<ResolverResult>;
}

/// Type alias for a shared resolver
pub type BoxedResolver = Arc<dyn Resolver>;

/// Whether a resolver serves a step's capability and action
pub fn handles(resolver: &dyn Resolver, step: &PlanStep) -> bool {
    resolver.capability() == step.capability
        && resolver.actions().iter().any(|a| *a == step.action)
}

/// The first unresolved step in plan order this resolver serves, ignoring
/// the ids in `skip`. `None` means the resolver has nothing to do this pass.
pub fn select_step<'a>(
    resolver: &dyn Resolver,
    state: &'a ConversationState,
    skip: &HashSet<String>,
) -> Option<&'a PlanStep> {
    state
        .unresolved_steps()
        .find(|step| !skip.contains(&step.id) && handles(resolver, step))
}
