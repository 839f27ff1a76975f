//! Suspend/resume state machine for clarification requests.
//!
//! Suspension is not a parked task: the turn simply stops, its state is
//! persisted, and the timeout is evaluated lazily whenever the thread is next
//! touched.
//!
//! ```text
//! RUNNING -> AWAITING_CLARIFICATION -> RESUMING -> RUNNING -> COMPLETED
//!                                   \-> TIMED_OUT
//! ```

use chrono::{DateTime, Duration, Utc};
use concierge_core::{HitlResultEntry, ReturnTo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::state::{ConversationState, StateUpdate};

/// Default clarification window, in seconds
pub const DEFAULT_INTERRUPT_TIMEOUT_SECS: i64 = 300;

/// Default clarification window
pub fn default_interrupt_timeout() -> Duration {
    Duration::seconds(DEFAULT_INTERRUPT_TIMEOUT_SECS)
}

/// Where a turn stands with respect to human-in-the-loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Running,
    AwaitingClarification,
    Resuming,
    TimedOut,
    Completed,
}

/// What to do with a message that arrives while a clarification is pending
/// but answers a different step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchPolicy {
    /// Keep the pending interrupt and ask the question again
    #[default]
    Reprompt,
    /// Drop the pending interrupt and treat the message as a new turn
    Abandon,
}

/// Derive the status of a persisted state at `now`
pub fn status(state: &ConversationState, now: DateTime<Utc>, timeout: Duration) -> TurnStatus {
    if state.pending_hitl.is_some() {
        if is_expired(state, now, timeout) {
            return TurnStatus::TimedOut;
        }
        return TurnStatus::AwaitingClarification;
    }
    if !state.plan.is_empty() && state.all_resolved() {
        return TurnStatus::Completed;
    }
    TurnStatus::Running
}

/// Whether the pending interrupt is older than the window.
///
/// A pending interrupt without a timestamp counts as expired, since there is
/// no way to tell how stale it is.
pub fn is_expired(state: &ConversationState, now: DateTime<Utc>, timeout: Duration) -> bool {
    match state.interrupted_at {
        Some(at) => now - at > timeout,
        None => state.pending_hitl.is_some(),
    }
}

/// Check a resume request against the pending interrupt.
///
/// On success returns the update that records the answer and clears the
/// interrupt (the RESUMING transition). Expiry is checked before the
/// return-to match, so a stale answer is never applied.
pub fn validate_resume(
    state: &ConversationState,
    return_to: &ReturnTo,
    text: &str,
    now: DateTime<Utc>,
    timeout: Duration,
) -> Result<StateUpdate> {
    let Some(pending) = state.pending_hitl.as_ref() else {
        return Err(Error::NoPendingInterrupt(state.thread_id.clone()));
    };

    if is_expired(state, now, timeout) {
        let elapsed_secs = state
            .interrupted_at
            .map(|at| (now - at).num_seconds())
            .unwrap_or_default();
        return Err(Error::InterruptTimeout {
            step_id: pending.step_id().to_string(),
            elapsed_secs,
        });
    }

    if !return_to.matches(pending) {
        return Err(Error::InterruptMismatch {
            expected: pending.return_to().key(),
            got: return_to.key(),
        });
    }

    let entry = HitlResultEntry {
        text: text.to_string(),
        return_to: return_to.clone(),
        received_at: now,
    };
    Ok(StateUpdate {
        hitl_results: Some(BTreeMap::from([(return_to.key(), entry)])),
        ..StateUpdate::interrupt_cleared()
    })
}

/// The update applied when a resume is rejected as expired
pub fn expiry_update(err: &Error) -> StateUpdate {
    StateUpdate::interrupt_cleared().with_error(err.user_message())
}
