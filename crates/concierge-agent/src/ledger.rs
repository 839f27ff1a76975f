//! Idempotency ledger and the downstream execution phase.
//!
//! Every side-effecting operation gets a stable key derived from its step id
//! and operation shape. The executor consults `executed_operations` before
//! calling an adapter, so re-entering a step after a resume or a retry cannot
//! repeat a committed side effect.

use async_trait::async_trait;
use chrono::Utc;
use concierge_core::{ExecutedOperation, ExecutionMetadata, ExecutionResult, PlanStep};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

use crate::error::Error;
use crate::events::OrchestratorEvent;
use crate::state::{ConversationState, StateUpdate};
use crate::telemetry::Telemetry;

/// Action verbs that produce external side effects
const SIDE_EFFECT_VERBS: &[&str] = &[
    "create", "update", "delete", "complete", "send", "add", "remove", "save", "schedule",
    "cancel", "move",
];

/// Whether an action hint changes external state
pub fn is_side_effecting(action: &str) -> bool {
    let verb = action.split('_').next().unwrap_or(action);
    SIDE_EFFECT_VERBS.contains(&verb)
}

/// Target identifier carried by operation args, if any
pub fn target_id(args: &serde_json::Value) -> Option<String> {
    ["id", "target_id", "task_id", "event_id"]
        .iter()
        .find_map(|k| args.get(*k))
        .map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
}

/// Stable operation key: turn, step id, action, and a digest of the canonical args.
///
/// The key is scoped to the turn's trace id, so a resume or a retry of the
/// same turn hits the ledger while a fresh request on a later turn does not.
/// `serde_json` maps serialize with sorted keys, so logically equal args give
/// equal keys. The digest keeps raw user content out of the ledger.
pub fn operation_key(trace_id: &str, step: &PlanStep, args: &serde_json::Value) -> String {
    let canonical = serde_json::to_string(args).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(trace_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    let short: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("{}:{}:{}", step.id, step.action, short)
}

/// Outcome reported by an adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AdapterOutcome {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Domain adapter that performs operations against a backend
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Capability tag this adapter executes for
    fn capability(&self) -> &str;

    async fn execute(&self, action: &str, args: &serde_json::Value) -> AdapterOutcome;
}

/// Type alias for a shared adapter
pub type BoxedAdapter = Arc<dyn Adapter>;

/// Runs resolved operations through their adapters, guarded by the ledger
#[derive(Clone, Default)]
pub struct Executor {
    adapters: HashMap<String, BoxedAdapter>,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter (replaces any adapter for the same capability)
    pub fn add_adapter(&mut self, adapter: BoxedAdapter) {
        self.adapters
            .insert(adapter.capability().to_string(), adapter);
    }

    /// Execute every resolved step that has not succeeded yet, in plan order.
    ///
    /// Steps that failed on an earlier pass run again. A side-effecting step
    /// whose key is already in the ledger is never sent to its adapter twice.
    /// Returns a single update carrying results, ledger entries, timings and
    /// the last error, if any.
    pub async fn run(
        &self,
        state: &ConversationState,
        events: &broadcast::Sender<OrchestratorEvent>,
        telemetry: &Telemetry,
    ) -> StateUpdate {
        let mut results = BTreeMap::new();
        let mut ledger = BTreeMap::new();
        let mut metadata = ExecutionMetadata::default();
        let mut error = None;

        for step in &state.plan {
            let Some(args) = state.executor_args.get(&step.id) else {
                continue;
            };
            let succeeded = state
                .execution_results
                .get(&step.id)
                .is_some_and(|r| r.success);

            let side_effect = is_side_effecting(&step.action);
            let key = operation_key(&state.trace_id, step, args);
            if side_effect
                && (state.executed_operations.contains_key(&key) || ledger.contains_key(&key))
            {
                tracing::info!(
                    step_id = %step.id,
                    operation_key = %key,
                    "Operation already committed, skipping adapter"
                );
                telemetry.record_duplicate_skip();
                let _ = events.send(OrchestratorEvent::OperationSkipped {
                    step_id: step.id.clone(),
                    operation_key: key,
                });
                // Keep the adapter's original data when it is still around
                if !succeeded {
                    results.insert(step.id.clone(), ExecutionResult::already_committed());
                }
                continue;
            }
            if succeeded {
                continue;
            }

            let Some(adapter) = self.adapters.get(&step.capability) else {
                if !side_effect {
                    // Nothing to perform: the resolver's args are the answer
                    results.insert(step.id.clone(), ExecutionResult::success(Some(args.clone())));
                    continue;
                }
                let err = Error::UnknownCapability {
                    step_id: step.id.clone(),
                    capability: step.capability.clone(),
                    action: step.action.clone(),
                };
                tracing::warn!("{}", err);
                results.insert(step.id.clone(), ExecutionResult::failure(err.to_string()));
                error = Some(err.user_message());
                continue;
            };

            let started = Instant::now();
            let outcome = adapter.execute(&step.action, args).await;
            metadata.accumulate(&ExecutionMetadata::timing(
                &step.id,
                "execute",
                started.elapsed().as_millis() as u64,
            ));
            let _ = events.send(OrchestratorEvent::OperationExecuted {
                step_id: step.id.clone(),
                action: step.action.clone(),
                success: outcome.success,
            });

            if outcome.success {
                if side_effect {
                    ledger.insert(
                        key,
                        ExecutedOperation {
                            action: step.action.clone(),
                            target_id: target_id(args).or_else(|| {
                                outcome.data.as_ref().and_then(target_id)
                            }),
                            executed_at: Utc::now(),
                        },
                    );
                }
                results.insert(step.id.clone(), ExecutionResult::success(outcome.data));
            } else {
                let message = outcome
                    .error
                    .unwrap_or_else(|| "adapter reported failure".to_string());
                let err = Error::handler(adapter.capability(), message);
                tracing::warn!(step_id = %step.id, "{}", err);
                telemetry.record_handler_error();
                results.insert(step.id.clone(), ExecutionResult::failure(err.to_string()));
                error = Some(err.user_message());
            }
        }

        StateUpdate {
            execution_results: Some(results),
            executed_operations: Some(ledger),
            metadata: Some(metadata),
            error: error.map(Some),
            ..Default::default()
        }
    }
}
