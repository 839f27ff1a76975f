//! Orchestrator event types

use concierge_core::PlanStep;
use serde::{Deserialize, Serialize};

/// Events emitted while a turn is processed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// A turn started (fresh or resumed)
    TurnStart {
        thread_id: String,
        trace_id: String,
        resumed: bool,
    },

    /// The planner produced a plan
    PlanReady { steps: Vec<PlanStep> },

    /// A resolver is about to run for a step
    StepDispatched { step_id: String, resolver: String },

    /// A step was committed to `resolver_results`
    StepResolved { step_id: String },

    /// A step failed; it stays unresolved
    StepFailed { step_id: String, message: String },

    /// A resolver asked the user for clarification; the turn is suspended
    ClarificationRequested {
        step_id: String,
        question: String,
        options: Vec<String>,
    },

    /// A clarification was rejected because it arrived too late
    ClarificationExpired { step_id: String },

    /// An adapter ran an operation
    OperationExecuted {
        step_id: String,
        action: String,
        success: bool,
    },

    /// The ledger already held this operation; the adapter was not called
    OperationSkipped { step_id: String, operation_key: String },

    /// The turn finished with a response
    TurnEnd { thread_id: String, response: String },
}

impl OrchestratorEvent {
    /// Whether this event ends the processing of an inbound message
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestratorEvent::TurnEnd { .. }
                | OrchestratorEvent::ClarificationRequested { .. }
                | OrchestratorEvent::ClarificationExpired { .. }
        )
    }
}
