//! concierge-core: Conversation data model and capability schema registry
//!
//! This crate holds the plain data types threaded through a conversation turn
//! and the static, priority-ordered catalog of capabilities used for
//! pattern-based routing and disambiguation prompts.

pub mod capabilities;
mod capabilities_builtin;
pub mod error;
pub mod types;

pub use capabilities::{
    CapabilityEntry, CapabilityRegistry, PatternMatch, TriggerSet, disambiguation_message,
};
pub use error::{Error, Result};
pub use types::*;
