//! Resolver dispatch loop

use chrono::Utc;
use concierge_core::{ExecutionMetadata, PendingInterrupt, PlanStep, ResolverResult};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;

use crate::error::Error;
use crate::events::OrchestratorEvent;
use crate::reducer::Reducer;
use crate::resolver::{BoxedResolver, handles, select_step};
use crate::state::{ConversationState, StateUpdate};
use crate::telemetry::Telemetry;

/// How a dispatch pass ended
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Every plan step has a committed result
    Completed,
    /// A resolver asked for clarification; nothing after it was dispatched
    Suspended {
        step_id: String,
        question: String,
        options: Vec<String>,
    },
    /// Some steps failed and stay unresolved for a later pass
    Incomplete { unresolved: Vec<String> },
}

/// Walks the plan in order and invokes the matching resolver for each
/// unresolved step
pub struct Dispatcher {
    resolvers: Vec<BoxedResolver>,
    reducer: Reducer,
    /// Cached compiled constraint validators keyed by resolver name
    schema_cache: HashMap<String, Arc<jsonschema::Validator>>,
}

impl Dispatcher {
    pub fn new(reducer: Reducer) -> Self {
        Self {
            resolvers: vec![],
            reducer,
            schema_cache: HashMap::new(),
        }
    }

    /// Add a resolver
    pub fn add_resolver(&mut self, resolver: BoxedResolver) {
        self.cache_resolver_schema(&resolver);
        self.resolvers.push(resolver);
    }

    /// Compile and cache the constraints validator for a resolver.
    fn cache_resolver_schema(&mut self, resolver: &BoxedResolver) {
        let Some(schema) = resolver.constraints_schema() else {
            return;
        };
        match jsonschema::validator_for(&schema) {
            Ok(validator) => {
                self.schema_cache
                    .insert(resolver.name().to_string(), Arc::new(validator));
            }
            Err(e) => {
                tracing::warn!(
                    "Invalid constraints schema for resolver '{}', skipping validation: {}",
                    resolver.name(),
                    e
                );
            }
        }
    }

    /// The first registered resolver serving a step
    pub fn find_resolver(&self, step: &PlanStep) -> Option<&BoxedResolver> {
        self.resolvers.iter().find(|r| handles(r.as_ref(), step))
    }

    /// Dispatch every unresolved step in plan order.
    ///
    /// Stops at the first clarification request. Failed steps are left
    /// unresolved and the loop moves on to the next one.
    pub async fn run(
        &self,
        mut state: ConversationState,
        events: &broadcast::Sender<OrchestratorEvent>,
        telemetry: &Telemetry,
    ) -> (ConversationState, DispatchOutcome) {
        let mut failed: HashSet<String> = HashSet::new();

        loop {
            let Some(next) = state
                .unresolved_steps()
                .find(|s| !failed.contains(&s.id))
                .cloned()
            else {
                break;
            };

            let Some(resolver) = self.find_resolver(&next) else {
                let err = Error::UnknownCapability {
                    step_id: next.id.clone(),
                    capability: next.capability.clone(),
                    action: next.action.clone(),
                };
                state = self.fail_step(&state, &next, err, events);
                failed.insert(next.id);
                continue;
            };
            let step = select_step(resolver.as_ref(), &state, &failed)
                .cloned()
                .unwrap_or(next);

            if let Some(reason) = self
                .schema_cache
                .get(resolver.name())
                .and_then(|validator| validate_constraints(&step.constraints, validator))
            {
                state = self.fail_step(&state, &step, Error::validation(&step.id, reason), events);
                failed.insert(step.id);
                continue;
            }

            let _ = events.send(OrchestratorEvent::StepDispatched {
                step_id: step.id.clone(),
                resolver: resolver.name().to_string(),
            });
            tracing::debug!(step_id = %step.id, resolver = resolver.name(), "Dispatching step");

            let started = Instant::now();
            let result = resolver.resolve(&step, &state).await;
            let timing = ExecutionMetadata::timing(
                &step.id,
                "resolve",
                started.elapsed().as_millis() as u64,
            );

            match result {
                Ok(result) if result.step_id() != step.id => {
                    let err = Error::handler(
                        resolver.name(),
                        format!("returned a result for step {} instead", result.step_id()),
                    );
                    telemetry.record_handler_error();
                    state = self.fail_step(&state, &step, err, events);
                    failed.insert(step.id);
                }
                Ok(result @ ResolverResult::Execute { .. }) => {
                    let update = StateUpdate::resolved(result).with_metadata(timing);
                    match self.reducer.apply_checked(&state, update) {
                        Ok(next) => {
                            state = next;
                            let _ = events.send(OrchestratorEvent::StepResolved {
                                step_id: step.id.clone(),
                            });
                        }
                        Err(err) => {
                            state = self.fail_step(&state, &step, err, events);
                            failed.insert(step.id);
                        }
                    }
                }
                Ok(ResolverResult::Clarify {
                    question,
                    options,
                    entity_type,
                    ..
                }) => {
                    let interrupt = PendingInterrupt::disambiguation(
                        &step.id,
                        &question,
                        options.clone(),
                        entity_type,
                    );
                    state = self.reducer.apply(
                        &state,
                        StateUpdate::suspended(interrupt, Utc::now()).with_metadata(timing),
                    );
                    telemetry.record_suspension();
                    tracing::info!(step_id = %step.id, "Suspending turn for clarification");
                    let _ = events.send(OrchestratorEvent::ClarificationRequested {
                        step_id: step.id.clone(),
                        question: question.clone(),
                        options: options.clone(),
                    });
                    return (
                        state,
                        DispatchOutcome::Suspended {
                            step_id: step.id,
                            question,
                            options,
                        },
                    );
                }
                Err(err) => {
                    let err = match err {
                        e @ (Error::Handler { .. } | Error::Validation { .. }) => e,
                        other => Error::handler(resolver.name(), other.to_string()),
                    };
                    telemetry.record_handler_error();
                    state = self.fail_step(&state, &step, err, events);
                    failed.insert(step.id);
                }
            }
        }

        if state.all_resolved() {
            (state, DispatchOutcome::Completed)
        } else {
            let unresolved = state.unresolved_steps().map(|s| s.id.clone()).collect();
            (state, DispatchOutcome::Incomplete { unresolved })
        }
    }

    /// Record a step failure in `error`; the step stays unresolved.
    fn fail_step(
        &self,
        state: &ConversationState,
        step: &PlanStep,
        err: Error,
        events: &broadcast::Sender<OrchestratorEvent>,
    ) -> ConversationState {
        tracing::warn!(step_id = %step.id, "Step failed: {}", err);
        let _ = events.send(OrchestratorEvent::StepFailed {
            step_id: step.id.clone(),
            message: err.to_string(),
        });
        self.reducer
            .apply(state, StateUpdate::default().with_error(err.user_message()))
    }
}

/// Validate step constraints using a pre-compiled validator.
/// Returns `Some(reason)` if validation fails, `None` if valid.
fn validate_constraints(
    constraints: &serde_json::Value,
    validator: &jsonschema::Validator,
) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(constraints)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(errors.join("; "))
    }
}
