//! Error types for concierge-agent

use thiserror::Error;

/// Result type alias using concierge-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating a turn.
///
/// Apart from `Store`, none of these are fatal to a turn: the orchestrator
/// records them in the state's `error` field and answers in degraded mode.
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the data model layer
    #[error(transparent)]
    Core(#[from] concierge_core::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A plan step is missing required constraints
    #[error("Step {step_id} is missing required details: {reason}")]
    Validation { step_id: String, reason: String },

    /// A capability handler, its classifier or its adapter failed
    #[error("Handler '{handler}' failed: {message}")]
    Handler { handler: String, message: String },

    /// No registered handler serves a step's capability/action
    #[error("No handler for {capability}/{action} (step {step_id})")]
    UnknownCapability {
        step_id: String,
        capability: String,
        action: String,
    },

    /// A resume arrived after the clarification window closed
    #[error("Clarification for step {step_id} expired after {elapsed_secs}s")]
    InterruptTimeout { step_id: String, elapsed_secs: i64 },

    /// A resume does not answer the pending interrupt
    #[error("Clarification answers step {got} but step {expected} is waiting")]
    InterruptMismatch { expected: String, got: String },

    /// A resume arrived but nothing is waiting for one
    #[error("No clarification is pending for thread {0}")]
    NoPendingInterrupt(String),

    /// A second result was produced for an already-resolved step
    #[error("Step {0} is already resolved")]
    DuplicateResolution(String),

    /// The classification capability failed
    #[error("Classifier error: {0}")]
    Classifier(String),

    /// Transient delivery failure, eligible for retry
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Persisting or loading conversation state failed
    #[error("State store error: {0}")]
    Store(String),

    /// The work was cancelled before it ran
    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Create a handler error
    pub fn handler(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            handler: handler.into(),
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(step_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            step_id: step_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether a retry may succeed. Logic errors never qualify.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Message suitable for showing to the user
    pub fn user_message(&self) -> String {
        match self {
            Error::InterruptTimeout { .. } => {
                "This request has expired, please send it again.".to_string()
            }
            Error::InterruptMismatch { .. } => {
                "That answer doesn't match the question I asked. Could you answer it again?"
                    .to_string()
            }
            Error::NoPendingInterrupt(_) => {
                "There is nothing waiting for an answer right now.".to_string()
            }
            Error::Validation { reason, .. } => {
                format!("I need a bit more detail to do that: {}.", reason)
            }
            Error::UnknownCapability { .. } => {
                "Sorry, I can't do that yet. Could you rephrase?".to_string()
            }
            _ => "Sorry, something went wrong on my side. Could you rephrase that?".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_retry() {
        assert!(Error::Transient("502".into()).is_transient());
        assert!(!Error::handler("tasks", "boom").is_transient());
        assert!(!Error::Store("disk full".into()).is_transient());
    }

    #[test]
    fn test_timeout_user_message_mentions_expiry() {
        let e = Error::InterruptTimeout {
            step_id: "s1".into(),
            elapsed_secs: 360,
        };
        assert!(e.user_message().contains("expired"));
    }
}
