//! Field-specific merge rules for [`ConversationState`].
//!
//! Each field is merged by exactly one small reducer function. [`Reducer::apply`]
//! destructures the whole [`StateUpdate`], so adding a field without choosing a
//! policy for it fails to compile.
//!
//! | policy                | fields                                                                 |
//! |-----------------------|------------------------------------------------------------------------|
//! | set-once              | `thread_id`, `trace_id`                                                |
//! | last-write-wins       | `user`, `input`, `now`, `long_term_summary`, `plan`, `routing_suggestions`, `pending_hitl`, `interrupted_at`, `formatted_response`, `final_response`, `error` |
//! | append-and-trim       | `recent_messages`                                                      |
//! | write-once mapping    | `resolver_results`                                                     |
//! | shallow-merge mapping | `executor_args`, `execution_results`, `hitl_results`, `executed_operations` |
//! | additive accumulate   | `metadata`                                                             |

use concierge_core::ExecutionMetadata;
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::state::{ConversationState, StateUpdate};

/// Default bound of the recent-message window
pub const DEFAULT_RECENT_MESSAGES_LIMIT: usize = 10;

/// Replace when present
pub fn last_write_wins<T: Clone>(current: &T, incoming: Option<T>) -> T {
    incoming.unwrap_or_else(|| current.clone())
}

/// Replace when present; `Some(None)` clears
pub fn last_write_wins_nullable<T: Clone>(
    current: &Option<T>,
    incoming: Option<Option<T>>,
) -> Option<T> {
    match incoming {
        Some(value) => value,
        None => current.clone(),
    }
}

/// Replace only while the current value is still empty
pub fn set_once(current: &str, incoming: Option<String>) -> String {
    match incoming {
        Some(value) if current.is_empty() => value,
        Some(value) => {
            if value != current {
                tracing::debug!("Ignoring identity overwrite ({} -> {})", current, value);
            }
            current.to_string()
        }
        None => current.to_string(),
    }
}

/// Append, then keep only the most recent `limit` items
pub fn append_and_trim<T: Clone>(current: &[T], incoming: Option<Vec<T>>, limit: usize) -> Vec<T> {
    let mut items = current.to_vec();
    if let Some(new_items) = incoming {
        items.extend(new_items);
    }
    if items.len() > limit {
        items.drain(..items.len() - limit);
    }
    items
}

/// Merge keys, later values replacing earlier ones; no deep merge
pub fn shallow_merge<V: Clone>(
    current: &BTreeMap<String, V>,
    incoming: Option<BTreeMap<String, V>>,
) -> BTreeMap<String, V> {
    let mut merged = current.clone();
    if let Some(entries) = incoming {
        merged.extend(entries);
    }
    merged
}

/// Merge keys that are not yet present. Returns the merged map and the keys
/// that were already set (and therefore kept their existing value).
pub fn merge_write_once<V: Clone>(
    current: &BTreeMap<String, V>,
    incoming: Option<BTreeMap<String, V>>,
) -> (BTreeMap<String, V>, Vec<String>) {
    let mut merged = current.clone();
    let mut conflicts = Vec::new();
    for (key, value) in incoming.into_iter().flatten() {
        if merged.contains_key(&key) {
            conflicts.push(key);
        } else {
            merged.insert(key, value);
        }
    }
    (merged, conflicts)
}

/// Counters sum, timing logs concatenate
pub fn accumulate(
    current: &ExecutionMetadata,
    incoming: Option<ExecutionMetadata>,
) -> ExecutionMetadata {
    let mut total = current.clone();
    if let Some(delta) = incoming {
        total.accumulate(&delta);
    }
    total
}

/// Applies partial updates to conversation state
#[derive(Debug, Clone, Copy)]
pub struct Reducer {
    recent_messages_limit: usize,
}

impl Default for Reducer {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_MESSAGES_LIMIT)
    }
}

impl Reducer {
    pub fn new(recent_messages_limit: usize) -> Self {
        Self {
            recent_messages_limit,
        }
    }

    pub fn recent_messages_limit(&self) -> usize {
        self.recent_messages_limit
    }

    /// Produce the next state. Write-once conflicts keep the existing value and are logged.
    pub fn apply(&self, current: &ConversationState, update: StateUpdate) -> ConversationState {
        let (next, conflicts) = self.merge(current, update);
        for step_id in conflicts {
            tracing::warn!("Ignoring second result for already-resolved step {}", step_id);
        }
        next
    }

    /// Produce the next state, rejecting any second write to a resolved step.
    pub fn apply_checked(
        &self,
        current: &ConversationState,
        update: StateUpdate,
    ) -> Result<ConversationState> {
        let (next, conflicts) = self.merge(current, update);
        match conflicts.into_iter().next() {
            Some(step_id) => Err(Error::DuplicateResolution(step_id)),
            None => Ok(next),
        }
    }

    fn merge(
        &self,
        current: &ConversationState,
        update: StateUpdate,
    ) -> (ConversationState, Vec<String>) {
        let StateUpdate {
            thread_id,
            trace_id,
            user,
            input,
            now,
            recent_messages,
            long_term_summary,
            plan,
            routing_suggestions,
            resolver_results,
            executor_args,
            execution_results,
            pending_hitl,
            hitl_results,
            interrupted_at,
            executed_operations,
            formatted_response,
            final_response,
            error,
            metadata,
        } = update;

        let (resolver_results, conflicts) =
            merge_write_once(&current.resolver_results, resolver_results);

        let next = ConversationState {
            thread_id: set_once(&current.thread_id, thread_id),
            trace_id: set_once(&current.trace_id, trace_id),
            user: last_write_wins_nullable(&current.user, user.map(Some)),
            input: last_write_wins_nullable(&current.input, input.map(Some)),
            now: last_write_wins_nullable(&current.now, now.map(Some)),
            recent_messages: append_and_trim(
                &current.recent_messages,
                recent_messages,
                self.recent_messages_limit,
            ),
            long_term_summary: last_write_wins_nullable(
                &current.long_term_summary,
                long_term_summary.map(Some),
            ),
            plan: last_write_wins(&current.plan, plan),
            routing_suggestions: last_write_wins_nullable(
                &current.routing_suggestions,
                routing_suggestions,
            ),
            resolver_results,
            executor_args: shallow_merge(&current.executor_args, executor_args),
            execution_results: shallow_merge(&current.execution_results, execution_results),
            pending_hitl: last_write_wins_nullable(&current.pending_hitl, pending_hitl),
            hitl_results: shallow_merge(&current.hitl_results, hitl_results),
            interrupted_at: last_write_wins_nullable(&current.interrupted_at, interrupted_at),
            executed_operations: shallow_merge(&current.executed_operations, executed_operations),
            formatted_response: last_write_wins_nullable(
                &current.formatted_response,
                formatted_response.map(Some),
            ),
            final_response: last_write_wins_nullable(
                &current.final_response,
                final_response.map(Some),
            ),
            error: last_write_wins_nullable(&current.error, error),
            metadata: accumulate(&current.metadata, metadata),
        };
        (next, conflicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concierge_core::{ChatMessage, PendingInterrupt, PlanStep, ResolverResult, Usage};

    #[test]
    fn test_identity_is_set_once() {
        let reducer = Reducer::default();
        let state = ConversationState::default();
        let state = reducer.apply(
            &state,
            StateUpdate {
                thread_id: Some("T1".into()),
                trace_id: Some("trace-a".into()),
                ..Default::default()
            },
        );
        let state = reducer.apply(
            &state,
            StateUpdate {
                thread_id: Some("T2".into()),
                trace_id: Some("trace-b".into()),
                ..Default::default()
            },
        );
        assert_eq!(state.thread_id, "T1");
        assert_eq!(state.trace_id, "trace-a");
    }

    #[test]
    fn test_recent_messages_are_bounded() {
        let reducer = Reducer::new(10);
        let mut state = ConversationState::new("T1");
        for i in 0..25 {
            state = reducer.apply(
                &state,
                StateUpdate::default().with_messages(vec![
                    ChatMessage::user(format!("u{}", i)),
                    ChatMessage::assistant(format!("a{}", i)),
                ]),
            );
            assert!(state.recent_messages.len() <= 10);
        }
        assert_eq!(state.recent_messages.len(), 10);
        assert_eq!(state.recent_messages.last().unwrap().content, "a24");
        assert_eq!(state.recent_messages.first().unwrap().content, "u20");
    }

    #[test]
    fn test_resolver_results_are_write_once() {
        let reducer = Reducer::default();
        let state = ConversationState::new("T1");
        let first = ResolverResult::execute("s1", serde_json::json!({"v": 1}));
        let second = ResolverResult::execute("s1", serde_json::json!({"v": 2}));

        let state = reducer
            .apply_checked(&state, StateUpdate::resolved(first.clone()))
            .unwrap();

        let lenient = reducer.apply(&state, StateUpdate::resolved(second.clone()));
        assert_eq!(lenient.resolver_results["s1"], first);

        let strict = reducer.apply_checked(&state, StateUpdate::resolved(second));
        assert!(matches!(strict, Err(Error::DuplicateResolution(id)) if id == "s1"));
        assert_eq!(state.resolver_results["s1"], first);
    }

    #[test]
    fn test_absent_fields_leave_state_untouched() {
        let reducer = Reducer::default();
        let mut state = ConversationState::new("T1");
        state.plan = vec![PlanStep::new("s1", "chat", "respond")];
        state.error = Some("earlier".into());
        state.final_response = Some("hello".into());

        let next = reducer.apply(&state, StateUpdate::default());
        assert_eq!(next, state);
    }

    #[test]
    fn test_nullable_fields_can_be_cleared() {
        let reducer = Reducer::default();
        let state = ConversationState::new("T1");
        let at = chrono::Utc::now();
        let pending = PendingInterrupt::disambiguation("s1", "which?", vec![], None);
        let state = reducer.apply(&state, StateUpdate::suspended(pending.clone(), at));
        assert_eq!(state.pending_hitl.as_ref(), Some(&pending));
        assert_eq!(state.interrupted_at, Some(at));

        let state = reducer.apply(&state, StateUpdate::interrupt_cleared());
        assert!(state.pending_hitl.is_none());
        assert!(state.interrupted_at.is_none());
    }

    #[test]
    fn test_mappings_shallow_merge() {
        let reducer = Reducer::default();
        let mut state = ConversationState::new("T1");
        state
            .executor_args
            .insert("s1".into(), serde_json::json!({"a": 1, "b": 2}));
        let next = reducer.apply(
            &state,
            StateUpdate {
                executor_args: Some(BTreeMap::from([
                    ("s1".to_string(), serde_json::json!({"a": 9})),
                    ("s2".to_string(), serde_json::json!({"c": 3})),
                ])),
                ..Default::default()
            },
        );
        assert_eq!(next.executor_args["s1"], serde_json::json!({"a": 9}));
        assert_eq!(next.executor_args.len(), 2);
    }

    #[test]
    fn test_metadata_accumulates() {
        let reducer = Reducer::default();
        let state = ConversationState::new("T1");
        let state = reducer.apply(
            &state,
            StateUpdate::default()
                .with_metadata(ExecutionMetadata::llm_call(Usage { input: 10, output: 5 })),
        );
        let state = reducer.apply(
            &state,
            StateUpdate::default()
                .with_metadata(ExecutionMetadata::llm_call(Usage { input: 1, output: 1 })),
        );
        assert_eq!(state.metadata.llm_calls, 2);
        assert_eq!(state.metadata.usage.total(), 17);
    }

    #[test]
    fn test_apply_does_not_mutate_input() {
        let reducer = Reducer::default();
        let state = ConversationState::new("T1");
        let snapshot = state.clone();
        let _ = reducer.apply(
            &state,
            StateUpdate::resolved(ResolverResult::execute("s1", serde_json::json!({}))),
        );
        assert_eq!(state, snapshot);
    }
}
