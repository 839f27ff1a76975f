//! Core types threaded through a conversation turn

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

/// One capability-tagged unit of work derived from the user's message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Step identifier, unique within a plan (e.g. "s1")
    pub id: String,
    /// Capability/domain tag (e.g. "calendar", "database")
    pub capability: String,
    /// Action hint (e.g. "list_events", "create_task")
    pub action: String,
    /// Free-form constraints extracted by the planner
    #[serde(default)]
    pub constraints: serde_json::Value,
}

impl PlanStep {
    /// Create a step with no constraints
    pub fn new(
        id: impl Into<String>,
        capability: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            action: action.into(),
            constraints: serde_json::Value::Object(Default::default()),
        }
    }

    /// Attach constraints to the step
    pub fn with_constraints(mut self, constraints: serde_json::Value) -> Self {
        self.constraints = constraints;
        self
    }

    /// Read a string constraint
    pub fn constraint_str(&self, key: &str) -> Option<&str> {
        self.constraints.get(key).and_then(|v| v.as_str())
    }
}

/// Outcome of a capability handler for one plan step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolverResult {
    /// A concrete, ready-to-run operation payload
    Execute {
        step_id: String,
        args: serde_json::Value,
    },
    /// The handler needs more information from the human
    Clarify {
        step_id: String,
        question: String,
        #[serde(default)]
        options: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity_type: Option<String>,
    },
}

impl ResolverResult {
    /// Create an execute result
    pub fn execute(step_id: impl Into<String>, args: serde_json::Value) -> Self {
        Self::Execute {
            step_id: step_id.into(),
            args,
        }
    }

    /// Create a clarify result
    pub fn clarify(
        step_id: impl Into<String>,
        question: impl Into<String>,
        options: Vec<String>,
    ) -> Self {
        Self::Clarify {
            step_id: step_id.into(),
            question: question.into(),
            options,
            entity_type: None,
        }
    }

    /// Tag a clarify result with the kind of entity being disambiguated
    pub fn with_entity_type(mut self, kind: impl Into<String>) -> Self {
        if let Self::Clarify { entity_type, .. } = &mut self {
            *entity_type = Some(kind.into());
        }
        self
    }

    /// The step this result belongs to
    pub fn step_id(&self) -> &str {
        match self {
            Self::Execute { step_id, .. } | Self::Clarify { step_id, .. } => step_id,
        }
    }

    /// Operation arguments, if this is an execute result
    pub fn args(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Execute { args, .. } => Some(args),
            Self::Clarify { .. } => None,
        }
    }
}

/// A pattern-matched routing alternative offered for disambiguation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingSuggestion {
    pub label: String,
    pub capability: String,
    pub action: String,
    pub score: f64,
}

/// Kinds of human-in-the-loop interrupts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptKind {
    Disambiguation,
}

/// Routing information attached to a pending interrupt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptMetadata {
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
}

/// The single outstanding clarification request of a suspended turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingInterrupt {
    pub kind: InterruptKind,
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    pub metadata: InterruptMetadata,
}

impl PendingInterrupt {
    /// Build a disambiguation interrupt for a step
    pub fn disambiguation(
        step_id: impl Into<String>,
        question: impl Into<String>,
        options: Vec<String>,
        entity_type: Option<String>,
    ) -> Self {
        Self {
            kind: InterruptKind::Disambiguation,
            question: question.into(),
            options,
            metadata: InterruptMetadata {
                step_id: step_id.into(),
                entity_type,
            },
        }
    }

    /// The step this interrupt is waiting on
    pub fn step_id(&self) -> &str {
        &self.metadata.step_id
    }

    /// The return-to descriptor a matching resume must carry
    pub fn return_to(&self) -> ReturnTo {
        ReturnTo {
            step_id: self.metadata.step_id.clone(),
            mode: self.metadata.entity_type.clone(),
        }
    }
}

/// Which logical step (and optionally which mode) a clarification answers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReturnTo {
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

impl ReturnTo {
    pub fn step(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            mode: None,
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    /// Key under which the clarification is recorded in `hitl_results`
    pub fn key(&self) -> String {
        match &self.mode {
            Some(mode) => format!("{}#{}", self.step_id, mode),
            None => self.step_id.clone(),
        }
    }

    /// Whether this descriptor answers the given interrupt.
    ///
    /// The step id must match. A mode is only compared when both sides carry one.
    pub fn matches(&self, pending: &PendingInterrupt) -> bool {
        if self.step_id != pending.metadata.step_id {
            return false;
        }
        match (&self.mode, &pending.metadata.entity_type) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// The user's answer to a clarification, with routing-back instructions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitlResultEntry {
    pub text: String,
    pub return_to: ReturnTo,
    pub received_at: DateTime<Utc>,
}

/// Minimal, PII-free record of a committed side effect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedOperation {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// Result of the downstream execution phase for one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// True when the ledger already held this operation and the adapter was not called
    #[serde(default)]
    pub skipped: bool,
}

impl ExecutionResult {
    pub fn success(data: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
            skipped: false,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            skipped: false,
        }
    }

    /// An already-committed operation replayed from the ledger
    pub fn already_committed() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
            skipped: true,
        }
    }
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the bounded recent-message window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: i64,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Where an inbound message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOrigin {
    #[default]
    Message,
    Voice,
    Image,
    Scheduled,
    Resume,
}

/// Raw inbound message plus its origin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnInput {
    pub text: String,
    #[serde(default)]
    pub origin: TriggerOrigin,
}

/// User profile, enabled capabilities and locale settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserContext {
    pub id: String,
    pub display_name: Option<String>,
    pub locale: String,
    pub timezone: String,
    pub utc_offset_minutes: i32,
    /// Enabled capability tags. Empty means everything is enabled.
    pub enabled_capabilities: Vec<String>,
}

impl Default for UserContext {
    fn default() -> Self {
        Self {
            id: "local".to_string(),
            display_name: None,
            locale: "en".to_string(),
            timezone: "UTC".to_string(),
            utc_offset_minutes: 0,
            enabled_capabilities: Vec::new(),
        }
    }
}

impl UserContext {
    /// Whether a capability tag is enabled for this user (`chat` always is)
    pub fn capability_enabled(&self, capability: &str) -> bool {
        capability == "chat"
            || self.enabled_capabilities.is_empty()
            || self.enabled_capabilities.iter().any(|c| c == capability)
    }
}

/// Resolved time context for the user's timezone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeContext {
    pub utc: DateTime<Utc>,
    pub local: DateTime<FixedOffset>,
    pub timezone: String,
}

impl TimeContext {
    /// Resolve `now` into the user's fixed offset. Out-of-range offsets fall back to UTC.
    pub fn resolve(user: &UserContext, now: DateTime<Utc>) -> Self {
        let offset = user
            .utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| {
                tracing::warn!(
                    "Invalid UTC offset {} for user {}, using UTC",
                    user.utc_offset_minutes,
                    user.id
                );
                Utc.fix()
            });
        Self {
            utc: now,
            local: now.with_timezone(&offset),
            timezone: user.timezone.clone(),
        }
    }
}

/// Token usage reported by a classification call
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

/// Wall-clock time spent in one phase of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTiming {
    pub step_id: String,
    pub phase: String,
    pub elapsed_ms: u64,
}

/// Per-turn execution telemetry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionMetadata {
    pub step_timings: Vec<StepTiming>,
    pub llm_calls: u32,
    pub usage: Usage,
    pub cost_usd: f64,
}

impl ExecutionMetadata {
    /// Metadata recording a single step timing
    pub fn timing(step_id: impl Into<String>, phase: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            step_timings: vec![StepTiming {
                step_id: step_id.into(),
                phase: phase.into(),
                elapsed_ms,
            }],
            ..Default::default()
        }
    }

    /// Metadata recording one LLM call
    pub fn llm_call(usage: Usage) -> Self {
        Self {
            llm_calls: 1,
            usage,
            ..Default::default()
        }
    }

    /// Additive merge: counters sum, timing logs concatenate
    pub fn accumulate(&mut self, other: &ExecutionMetadata) {
        self.step_timings.extend(other.step_timings.iter().cloned());
        self.llm_calls += other.llm_calls;
        self.usage.input += other.usage.input;
        self.usage.output += other.usage.output;
        self.cost_usd += other.cost_usd;
    }
}
