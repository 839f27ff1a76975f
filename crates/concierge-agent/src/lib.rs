//! concierge-agent: Conversation orchestration runtime
//!
//! This crate provides the turn pipeline for a conversational assistant:
//! planning a message into capability steps, dispatching them to resolvers,
//! suspending for clarification and resuming, and executing side effects
//! exactly once through an idempotency ledger.

pub mod batch;
pub mod classifier;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod format;
pub mod hitl;
pub mod ledger;
pub mod orchestrator;
pub mod planner;
pub mod reducer;
pub mod resolver;
pub mod state;
pub mod store;
pub mod telemetry;

pub use batch::{BatchConfig, BatchItem, RetryConfig, handle_messages, run_batch};
pub use classifier::{BoxedClassifier, Classification, Classifier};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use error::{Error, Result};
pub use events::OrchestratorEvent;
pub use format::{PlainFormatter, ResponseFormatter};
pub use hitl::{MismatchPolicy, TurnStatus};
pub use ledger::{Adapter, AdapterOutcome, BoxedAdapter, Executor};
pub use orchestrator::{
    Inbound, Orchestrator, OrchestratorConfig, ResumeOutcome, ResumeRejection, ResumeRequest,
    TurnOutcome,
};
pub use planner::{BoxedPlanner, ClassifierPlanner, PatternPlanner, PlanOutput, Planner};
pub use reducer::Reducer;
pub use resolver::{BoxedResolver, Resolver};
pub use state::{ConversationState, StateUpdate};
pub use store::{BoxedStateStore, MemoryStore, StateStore};
pub use telemetry::{Telemetry, TelemetrySnapshot};
