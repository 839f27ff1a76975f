//! Conversation state: identity, memory, plan, resolution, HITL and ledger.

use chrono::{DateTime, Utc};
use concierge_core::{
    ChatMessage, ExecutedOperation, ExecutionMetadata, ExecutionResult, HitlResultEntry,
    PendingInterrupt, PlanStep, ResolverResult, RoutingSuggestion, TimeContext, TurnInput,
    UserContext,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The single record threaded through a turn and persisted across suspensions.
///
/// Only the reducer in [`crate::reducer`] produces new values of this type
/// during a turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationState {
    // Identity
    pub thread_id: String,
    pub trace_id: String,

    // Context
    pub user: Option<UserContext>,
    pub input: Option<TurnInput>,
    pub now: Option<TimeContext>,

    // Memory
    pub recent_messages: Vec<ChatMessage>,
    pub long_term_summary: Option<String>,

    // Planning
    pub plan: Vec<PlanStep>,
    pub routing_suggestions: Option<Vec<RoutingSuggestion>>,

    // Resolution
    pub resolver_results: BTreeMap<String, ResolverResult>,
    pub executor_args: BTreeMap<String, serde_json::Value>,
    pub execution_results: BTreeMap<String, ExecutionResult>,

    // HITL
    pub pending_hitl: Option<PendingInterrupt>,
    pub hitl_results: BTreeMap<String, HitlResultEntry>,
    pub interrupted_at: Option<DateTime<Utc>>,

    // Idempotency
    pub executed_operations: BTreeMap<String, ExecutedOperation>,

    // Output/control
    pub formatted_response: Option<String>,
    pub final_response: Option<String>,
    pub error: Option<String>,
    pub metadata: ExecutionMetadata,
}

impl ConversationState {
    /// Fresh state for a thread
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            ..Default::default()
        }
    }

    /// Start the next turn: keep the archived fields and drop the ephemeral ones.
    pub fn next_turn(&self, trace_id: impl Into<String>) -> Self {
        Self {
            thread_id: self.thread_id.clone(),
            trace_id: trace_id.into(),
            user: self.user.clone(),
            recent_messages: self.recent_messages.clone(),
            long_term_summary: self.long_term_summary.clone(),
            executed_operations: self.executed_operations.clone(),
            ..Default::default()
        }
    }

    /// Whether a plan step already has a committed result
    pub fn is_resolved(&self, step_id: &str) -> bool {
        self.resolver_results.contains_key(step_id)
    }

    /// Plan steps without a committed result, in plan order
    pub fn unresolved_steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.plan.iter().filter(|s| !self.is_resolved(&s.id))
    }

    /// Whether every plan step has a committed result
    pub fn all_resolved(&self) -> bool {
        self.unresolved_steps().next().is_none()
    }

    /// Plan steps whose execution failed on an earlier pass
    pub fn failed_steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.plan.iter().filter(|s| {
            self.execution_results
                .get(&s.id)
                .is_some_and(|r| !r.success)
        })
    }

    /// Latest clarification recorded for a step, if any
    pub fn clarification_for(&self, step_id: &str) -> Option<&HitlResultEntry> {
        self.hitl_results
            .values()
            .filter(|e| e.return_to.step_id == step_id)
            .max_by_key(|e| e.received_at)
    }

    /// The user's message text for this turn
    pub fn input_text(&self) -> &str {
        self.input.as_ref().map(|i| i.text.as_str()).unwrap_or("")
    }
}

/// A partial update produced by one processing step.
///
/// `None` leaves the field untouched. Nullable last-write-wins fields use a
/// nested option so an update can explicitly clear them with `Some(None)`.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub thread_id: Option<String>,
    pub trace_id: Option<String>,

    pub user: Option<UserContext>,
    pub input: Option<TurnInput>,
    pub now: Option<TimeContext>,

    pub recent_messages: Option<Vec<ChatMessage>>,
    pub long_term_summary: Option<String>,

    pub plan: Option<Vec<PlanStep>>,
    pub routing_suggestions: Option<Option<Vec<RoutingSuggestion>>>,

    pub resolver_results: Option<BTreeMap<String, ResolverResult>>,
    pub executor_args: Option<BTreeMap<String, serde_json::Value>>,
    pub execution_results: Option<BTreeMap<String, ExecutionResult>>,

    pub pending_hitl: Option<Option<PendingInterrupt>>,
    pub hitl_results: Option<BTreeMap<String, HitlResultEntry>>,
    pub interrupted_at: Option<Option<DateTime<Utc>>>,

    pub executed_operations: Option<BTreeMap<String, ExecutedOperation>>,

    pub formatted_response: Option<String>,
    pub final_response: Option<String>,
    pub error: Option<Option<String>>,
    pub metadata: Option<ExecutionMetadata>,
}

impl StateUpdate {
    /// Commit one resolver result (and its execution args) under its step id
    pub fn resolved(result: ResolverResult) -> Self {
        let step_id = result.step_id().to_string();
        let executor_args = result
            .args()
            .map(|args| BTreeMap::from([(step_id.clone(), args.clone())]));
        Self {
            resolver_results: Some(BTreeMap::from([(step_id, result)])),
            executor_args,
            ..Default::default()
        }
    }

    /// Suspend on a clarification request
    pub fn suspended(interrupt: PendingInterrupt, at: DateTime<Utc>) -> Self {
        Self {
            pending_hitl: Some(Some(interrupt)),
            interrupted_at: Some(Some(at)),
            ..Default::default()
        }
    }

    /// Clear the pending interrupt and its timestamp
    pub fn interrupt_cleared() -> Self {
        Self {
            pending_hitl: Some(None),
            interrupted_at: Some(None),
            ..Default::default()
        }
    }

    /// Record a non-fatal error message
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(Some(message.into()));
        self
    }

    /// Append messages to the recent-message window
    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.recent_messages = Some(messages);
        self
    }

    /// Add telemetry
    pub fn with_metadata(mut self, metadata: ExecutionMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
