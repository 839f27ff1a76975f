//! Turn orchestration: plan, dispatch, suspend/resume, execute, respond

use chrono::{DateTime, Utc};
use concierge_core::{ChatMessage, PlanStep, ReturnTo, TimeContext, TriggerOrigin, TurnInput, UserContext};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::{
    dispatch::{DispatchOutcome, Dispatcher},
    error::{Error, Result},
    events::OrchestratorEvent,
    format::{PlainFormatter, ResponseFormatter},
    hitl::{self, MismatchPolicy, TurnStatus},
    ledger::{BoxedAdapter, Executor},
    planner::BoxedPlanner,
    reducer::{DEFAULT_RECENT_MESSAGES_LIMIT, Reducer},
    resolver::BoxedResolver,
    state::{ConversationState, StateUpdate},
    store::BoxedStateStore,
    telemetry::Telemetry,
};

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long a clarification stays answerable
    pub interrupt_timeout: chrono::Duration,
    /// Bound of the recent-message window
    pub recent_messages_limit: usize,
    /// What to do with a message answering a different step than the pending one
    pub mismatch_policy: MismatchPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            interrupt_timeout: hitl::default_interrupt_timeout(),
            recent_messages_limit: DEFAULT_RECENT_MESSAGES_LIMIT,
            mismatch_policy: MismatchPolicy::default(),
        }
    }
}

/// An inbound chat message
#[derive(Debug, Clone)]
pub struct Inbound {
    pub thread_id: String,
    pub text: String,
    pub origin: TriggerOrigin,
    /// Which pending question this message answers, if the transport knows
    pub reply_to: Option<ReturnTo>,
    /// Fresh user profile; the persisted one is used when absent
    pub user: Option<UserContext>,
}

impl Inbound {
    pub fn new(thread_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            text: text.into(),
            origin: TriggerOrigin::Message,
            reply_to: None,
            user: None,
        }
    }

    pub fn reply_to(mut self, return_to: ReturnTo) -> Self {
        self.reply_to = Some(return_to);
        self
    }

    pub fn with_user(mut self, user: UserContext) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_origin(mut self, origin: TriggerOrigin) -> Self {
        self.origin = origin;
        self
    }
}

/// Explicit resume call
#[derive(Debug, Clone)]
pub struct ResumeRequest {
    pub thread_id: String,
    pub return_to: ReturnTo,
    pub user_text: String,
}

/// What the caller should show after processing a message
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The turn completed with a reply
    Responded { text: String },
    /// The turn is suspended on a question
    AwaitingClarification {
        step_id: String,
        question: String,
        options: Vec<String>,
    },
    /// The pending question timed out; the user must resend their request
    Expired { message: String },
    /// The message answered a different question; the pending one is asked again
    Reprompt { question: String, options: Vec<String> },
}

/// Why a resume was not applied
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeRejection {
    Expired { message: String },
    Mismatched {
        expected: ReturnTo,
        question: String,
        options: Vec<String>,
    },
    NothingPending,
}

/// Result of a resume call
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    Applied(TurnOutcome),
    Rejected(ResumeRejection),
}

/// Ties planner, dispatcher, executor and store together.
///
/// All entry points take `&self`; share one instance behind an `Arc`.
/// Turns for the same thread are serialized, turns for different threads run
/// in parallel.
pub struct Orchestrator {
    config: OrchestratorConfig,
    reducer: Reducer,
    planner: BoxedPlanner,
    dispatcher: Dispatcher,
    executor: Executor,
    store: BoxedStateStore,
    formatter: Arc<dyn ResponseFormatter>,
    telemetry: Telemetry,
    event_tx: broadcast::Sender<OrchestratorEvent>,
    thread_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(config: OrchestratorConfig, planner: BoxedPlanner, store: BoxedStateStore) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let reducer = Reducer::new(config.recent_messages_limit);
        Self {
            config,
            reducer,
            planner,
            dispatcher: Dispatcher::new(reducer),
            executor: Executor::new(),
            store,
            formatter: Arc::new(PlainFormatter),
            telemetry: Telemetry::new(),
            event_tx,
            thread_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to orchestrator events
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Get the config
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Process-wide counters
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Share an existing telemetry handle (e.g. across several orchestrators)
    pub fn set_telemetry(&mut self, telemetry: Telemetry) {
        self.telemetry = telemetry;
    }

    /// Add a capability handler
    pub fn add_resolver(&mut self, resolver: BoxedResolver) {
        self.dispatcher.add_resolver(resolver);
    }

    /// Add a domain adapter for the execution phase
    pub fn add_adapter(&mut self, adapter: BoxedAdapter) {
        self.executor.add_adapter(adapter);
    }

    /// Replace the reply formatter
    pub fn set_formatter(&mut self, formatter: Arc<dyn ResponseFormatter>) {
        self.formatter = formatter;
    }

    /// Load the persisted state of a thread
    pub async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>> {
        self.store.load(thread_id).await
    }

    /// HITL status of a thread right now (timeouts evaluated lazily here)
    pub async fn status(&self, thread_id: &str) -> Result<Option<TurnStatus>> {
        let state = self.store.load(thread_id).await?;
        Ok(state.map(|s| hitl::status(&s, Utc::now(), self.config.interrupt_timeout)))
    }

    /// Handle an inbound message.
    ///
    /// While a clarification is pending the message is treated as its answer.
    /// An answer to a different step follows the configured [`MismatchPolicy`].
    pub async fn handle_message(&self, inbound: Inbound) -> Result<TurnOutcome> {
        let lock = self.thread_lock(&inbound.thread_id);
        let _guard = lock.lock().await;
        let now = Utc::now();

        let base = match self.store.load(&inbound.thread_id).await? {
            Some(prev) => match prev.pending_hitl.as_ref().map(|p| p.return_to()) {
                Some(pending) => {
                    let return_to = inbound.reply_to.clone().unwrap_or(pending);
                    match self
                        .apply_resume(prev.clone(), &return_to, &inbound.text, now)
                        .await?
                    {
                        ResumeOutcome::Applied(outcome) => return Ok(outcome),
                        ResumeOutcome::Rejected(ResumeRejection::Expired { message }) => {
                            return Ok(TurnOutcome::Expired { message });
                        }
                        ResumeOutcome::Rejected(ResumeRejection::Mismatched {
                            question,
                            options,
                            ..
                        }) => match self.config.mismatch_policy {
                            MismatchPolicy::Reprompt => {
                                return Ok(TurnOutcome::Reprompt { question, options });
                            }
                            MismatchPolicy::Abandon => {
                                tracing::info!(
                                    thread_id = %inbound.thread_id,
                                    "Abandoning pending clarification for a new turn"
                                );
                                self.reducer.apply(&prev, StateUpdate::interrupt_cleared())
                            }
                        },
                        ResumeOutcome::Rejected(ResumeRejection::NothingPending) => prev,
                    }
                }
                None => prev,
            },
            None => ConversationState::new(&inbound.thread_id),
        };

        self.start_turn(base, inbound, now).await
    }

    /// Resume a suspended turn with the user's clarification
    pub async fn resume(&self, request: ResumeRequest) -> Result<ResumeOutcome> {
        let lock = self.thread_lock(&request.thread_id);
        let _guard = lock.lock().await;

        let Some(state) = self.store.load(&request.thread_id).await? else {
            return Ok(ResumeOutcome::Rejected(ResumeRejection::NothingPending));
        };
        self.apply_resume(state, &request.return_to, &request.user_text, Utc::now())
            .await
    }

    /// Re-run steps that failed on an earlier pass of the last turn.
    ///
    /// Covers steps that never resolved and steps whose execution failed.
    /// Operations already in the ledger are not sent to their adapter again.
    pub async fn retry_unresolved(&self, thread_id: &str) -> Result<Option<TurnOutcome>> {
        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().await;

        let Some(state) = self.store.load(thread_id).await? else {
            return Ok(None);
        };
        if state.pending_hitl.is_some()
            || (state.all_resolved() && state.failed_steps().next().is_none())
        {
            return Ok(None);
        }
        let state = self.reducer.apply(
            &state,
            StateUpdate {
                error: Some(None),
                ..Default::default()
            },
        );
        self.continue_turn(state).await.map(Some)
    }

    /// Drop an unresolved or failed step from the last turn's plan so it is never retried
    pub async fn cancel_step(&self, thread_id: &str, step_id: &str) -> Result<bool> {
        let lock = self.thread_lock(thread_id);
        let _guard = lock.lock().await;

        let Some(state) = self.store.load(thread_id).await? else {
            return Ok(false);
        };
        let failed = state.failed_steps().any(|s| s.id == step_id);
        if (state.is_resolved(step_id) && !failed) || !state.plan.iter().any(|s| s.id == step_id) {
            return Ok(false);
        }
        let plan: Vec<PlanStep> = state
            .plan
            .iter()
            .filter(|s| s.id != step_id)
            .cloned()
            .collect();
        let mut update = StateUpdate {
            plan: Some(plan),
            ..Default::default()
        };
        if state.pending_hitl.as_ref().is_some_and(|p| p.step_id() == step_id) {
            update.pending_hitl = Some(None);
            update.interrupted_at = Some(None);
        }
        let state = self.reducer.apply(&state, update);
        self.store.save(&state).await?;
        Ok(true)
    }

    fn thread_lock(&self, thread_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.thread_locks.lock();
        // A lock held only by the map has no turn running or waiting on it
        locks.retain(|id, lock| id == thread_id || Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(thread_id.to_string()).or_default())
    }

    async fn start_turn(
        &self,
        base: ConversationState,
        inbound: Inbound,
        now: DateTime<Utc>,
    ) -> Result<TurnOutcome> {
        let trace_id = uuid::Uuid::new_v4().to_string();
        let user = inbound
            .user
            .or_else(|| base.user.clone())
            .unwrap_or_default();
        let state = base.next_turn(&trace_id);
        let mut state = self.reducer.apply(
            &state,
            StateUpdate {
                now: Some(TimeContext::resolve(&user, now)),
                user: Some(user),
                input: Some(TurnInput {
                    text: inbound.text.clone(),
                    origin: inbound.origin,
                }),
                ..Default::default()
            }
            .with_messages(vec![ChatMessage::user(&inbound.text)]),
        );

        self.telemetry.record_turn();
        let _ = self.event_tx.send(OrchestratorEvent::TurnStart {
            thread_id: state.thread_id.clone(),
            trace_id,
            resumed: false,
        });

        match self.planner.plan(&inbound.text, &state).await {
            Ok(plan) => {
                self.telemetry.record_llm_calls(plan.metadata.llm_calls);
                let _ = self.event_tx.send(OrchestratorEvent::PlanReady {
                    steps: plan.steps.clone(),
                });
                tracing::debug!(steps = plan.steps.len(), "Plan ready");
                state = self.reducer.apply(
                    &state,
                    StateUpdate {
                        plan: Some(plan.steps),
                        routing_suggestions: Some(plan.routing_suggestions),
                        ..Default::default()
                    }
                    .with_metadata(plan.metadata),
                );
            }
            Err(e) => {
                tracing::warn!("Planning failed: {}", e);
                state = self
                    .reducer
                    .apply(&state, StateUpdate::default().with_error(e.user_message()));
            }
        }

        self.continue_turn(state).await
    }

    async fn apply_resume(
        &self,
        state: ConversationState,
        return_to: &ReturnTo,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<ResumeOutcome> {
        match hitl::validate_resume(&state, return_to, text, now, self.config.interrupt_timeout) {
            Ok(update) => {
                self.telemetry.record_resume();
                let state = self.reducer.apply(&state, update);
                let state = self.reducer.apply(
                    &state,
                    StateUpdate {
                        input: Some(TurnInput {
                            text: text.to_string(),
                            origin: TriggerOrigin::Resume,
                        }),
                        error: Some(None),
                        ..Default::default()
                    }
                    .with_messages(vec![ChatMessage::user(text)]),
                );
                let _ = self.event_tx.send(OrchestratorEvent::TurnStart {
                    thread_id: state.thread_id.clone(),
                    trace_id: state.trace_id.clone(),
                    resumed: true,
                });
                tracing::info!(step_id = %return_to.step_id, "Resuming suspended turn");
                Ok(ResumeOutcome::Applied(self.continue_turn(state).await?))
            }
            Err(err @ Error::InterruptTimeout { .. }) => {
                self.telemetry.record_expired();
                tracing::info!("{}", err);
                if let Error::InterruptTimeout { step_id, .. } = &err {
                    let _ = self.event_tx.send(OrchestratorEvent::ClarificationExpired {
                        step_id: step_id.clone(),
                    });
                }
                let state = self.reducer.apply(&state, hitl::expiry_update(&err));
                self.store.save(&state).await?;
                Ok(ResumeOutcome::Rejected(ResumeRejection::Expired {
                    message: err.user_message(),
                }))
            }
            Err(err @ Error::InterruptMismatch { .. }) => {
                self.telemetry.record_mismatch();
                tracing::info!("{}", err);
                let Some(pending) = state.pending_hitl.as_ref() else {
                    return Ok(ResumeOutcome::Rejected(ResumeRejection::NothingPending));
                };
                Ok(ResumeOutcome::Rejected(ResumeRejection::Mismatched {
                    expected: pending.return_to(),
                    question: pending.question.clone(),
                    options: pending.options.clone(),
                }))
            }
            Err(Error::NoPendingInterrupt(_)) => {
                Ok(ResumeOutcome::Rejected(ResumeRejection::NothingPending))
            }
            Err(other) => Err(other),
        }
    }

    /// Dispatch from the first unresolved step; execute and respond unless suspended
    async fn continue_turn(&self, state: ConversationState) -> Result<TurnOutcome> {
        let (state, outcome) = self
            .dispatcher
            .run(state, &self.event_tx, &self.telemetry)
            .await;

        if let DispatchOutcome::Suspended {
            step_id,
            question,
            options,
        } = outcome
        {
            self.store.save(&state).await?;
            return Ok(TurnOutcome::AwaitingClarification {
                step_id,
                question,
                options,
            });
        }

        let update = self
            .executor
            .run(&state, &self.event_tx, &self.telemetry)
            .await;
        let state = self.reducer.apply(&state, update);

        let text = self.formatter.format(&state);
        let state = self.reducer.apply(
            &state,
            StateUpdate {
                formatted_response: Some(text.clone()),
                final_response: Some(text.clone()),
                ..Default::default()
            }
            .with_messages(vec![ChatMessage::assistant(&text)]),
        );
        self.store.save(&state).await?;

        let _ = self.event_tx.send(OrchestratorEvent::TurnEnd {
            thread_id: state.thread_id.clone(),
            response: text.clone(),
        });
        Ok(TurnOutcome::Responded { text })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Adapter, AdapterOutcome};
    use crate::planner::{PlanOutput, Planner};
    use crate::resolver::Resolver;
    use crate::store::{MemoryStore, StateStore};
    use async_trait::async_trait;
    use concierge_core::ResolverResult;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Planner that always returns the same steps
    struct FixedPlanner(Vec<PlanStep>);

    #[async_trait]
    impl Planner for FixedPlanner {
        async fn plan(&self, _message: &str, _state: &ConversationState) -> Result<PlanOutput> {
            Ok(PlanOutput {
                steps: self.0.clone(),
                ..Default::default()
            })
        }
    }

    struct Tasks;

    #[async_trait]
    impl Resolver for Tasks {
        fn name(&self) -> &str {
            "tasks"
        }
        fn capability(&self) -> &str {
            "database"
        }
        fn actions(&self) -> &[&str] {
            &["create_task", "delete_task", "list_tasks"]
        }
        async fn resolve(&self, step: &PlanStep, state: &ConversationState) -> Result<ResolverResult> {
            match step.action.as_str() {
                "delete_task" => match state.clarification_for(&step.id) {
                    Some(answer) => Ok(ResolverResult::execute(
                        &step.id,
                        serde_json::json!({"id": answer.text}),
                    )),
                    None => Ok(ResolverResult::clarify(
                        &step.id,
                        "Which task should I delete?",
                        vec!["milk".into(), "bread".into()],
                    )),
                },
                "create_task" => Ok(ResolverResult::execute(
                    &step.id,
                    serde_json::json!({"title": step.constraint_str("title")}),
                )),
                _ => Ok(ResolverResult::execute(&step.id, serde_json::json!({}))),
            }
        }
    }

    struct Calendar;

    #[async_trait]
    impl Resolver for Calendar {
        fn name(&self) -> &str {
            "calendar"
        }
        fn capability(&self) -> &str {
            "calendar"
        }
        fn actions(&self) -> &[&str] {
            &["list_events"]
        }
        async fn resolve(&self, step: &PlanStep, _state: &ConversationState) -> Result<ResolverResult> {
            Ok(ResolverResult::execute(&step.id, serde_json::json!({"range": "today"})))
        }
    }

    struct TaskBackend {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Adapter for TaskBackend {
        fn capability(&self) -> &str {
            "database"
        }
        async fn execute(&self, action: &str, _args: &serde_json::Value) -> AdapterOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            AdapterOutcome::ok(serde_json::json!({ "message": format!("{} ok", action) }))
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        store: MemoryStore,
        calls: Arc<AtomicU32>,
    }

    fn harness(steps: Vec<PlanStep>, config: OrchestratorConfig) -> Harness {
        let store = MemoryStore::new();
        let calls = Arc::new(AtomicU32::new(0));
        let mut orchestrator = Orchestrator::new(
            config,
            Arc::new(FixedPlanner(steps)),
            Arc::new(store.clone()),
        );
        orchestrator.add_resolver(Arc::new(Tasks));
        orchestrator.add_resolver(Arc::new(Calendar));
        orchestrator.add_adapter(Arc::new(TaskBackend {
            calls: Arc::clone(&calls),
        }));
        Harness {
            orchestrator,
            store,
            calls,
        }
    }

    fn delete_plan() -> Vec<PlanStep> {
        vec![PlanStep::new("s1", "database", "delete_task")]
    }

    #[tokio::test]
    async fn test_two_step_turn_completes() {
        let h = harness(
            vec![
                PlanStep::new("s1", "calendar", "list_events"),
                PlanStep::new("s2", "database", "list_tasks"),
            ],
            OrchestratorConfig::default(),
        );
        let mut rx = h.orchestrator.subscribe();

        let outcome = h
            .orchestrator
            .handle_message(Inbound::new("T1", "what's on today and my tasks"))
            .await
            .unwrap();

        let TurnOutcome::Responded { text } = outcome else {
            panic!("expected a reply, got {:?}", outcome);
        };
        assert!(text.contains("list_tasks ok"));

        let state = h.store.load("T1").await.unwrap().unwrap();
        assert_eq!(state.resolver_results.len(), 2);
        assert_eq!(state.final_response.as_deref(), Some(text.as_str()));
        assert!(state.pending_hitl.is_none());
        assert_eq!(state.recent_messages.len(), 2);
        assert!(!state.trace_id.is_empty());

        let mut saw_end = false;
        while let Ok(event) = rx.try_recv() {
            saw_end |= matches!(event, OrchestratorEvent::TurnEnd { .. });
        }
        assert!(saw_end);
    }

    struct CountingFormatter;

    impl ResponseFormatter for CountingFormatter {
        fn format(&self, state: &ConversationState) -> String {
            format!("{} results", state.execution_results.len())
        }
    }

    #[tokio::test]
    async fn test_custom_formatter_and_shared_telemetry() {
        let shared = Telemetry::new();
        let mut h = harness(
            vec![PlanStep::new("s1", "database", "list_tasks")],
            OrchestratorConfig::default(),
        );
        h.orchestrator.set_formatter(Arc::new(CountingFormatter));
        h.orchestrator.set_telemetry(shared.clone());

        let outcome = h
            .orchestrator
            .handle_message(Inbound::new("T1", "show my tasks"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TurnOutcome::Responded {
                text: "1 results".into()
            }
        );
        assert_eq!(shared.snapshot().turns, 1);
    }

    #[tokio::test]
    async fn test_clarification_suspends_then_resumes() {
        let h = harness(delete_plan(), OrchestratorConfig::default());

        let outcome = h
            .orchestrator
            .handle_message(Inbound::new("T1", "delete the task"))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            TurnOutcome::AwaitingClarification { ref step_id, ref options, .. }
                if step_id == "s1" && options.len() == 2
        ));

        let suspended = h.store.load("T1").await.unwrap().unwrap();
        assert!(suspended.pending_hitl.is_some());
        assert!(suspended.final_response.is_none());
        assert_eq!(
            h.orchestrator.status("T1").await.unwrap(),
            Some(TurnStatus::AwaitingClarification)
        );
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);

        let outcome = h
            .orchestrator
            .handle_message(Inbound::new("T1", "milk"))
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Responded { .. }));

        let done = h.store.load("T1").await.unwrap().unwrap();
        assert_eq!(done.trace_id, suspended.trace_id);
        assert!(done.pending_hitl.is_none());
        assert_eq!(done.resolver_results["s1"].args().unwrap()["id"], "milk");
        assert_eq!(done.executed_operations.len(), 1);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.orchestrator.telemetry().snapshot().resumes, 1);
    }

    #[tokio::test]
    async fn test_late_resume_is_rejected_as_expired() {
        let h = harness(delete_plan(), OrchestratorConfig::default());
        h.orchestrator
            .handle_message(Inbound::new("T1", "delete the task"))
            .await
            .unwrap();

        // Pretend the question was asked six minutes ago
        let mut state = h.store.load("T1").await.unwrap().unwrap();
        state.interrupted_at = Some(Utc::now() - chrono::Duration::minutes(6));
        h.store.save(&state).await.unwrap();
        assert_eq!(
            h.orchestrator.status("T1").await.unwrap(),
            Some(TurnStatus::TimedOut)
        );

        let outcome = h
            .orchestrator
            .resume(ResumeRequest {
                thread_id: "T1".into(),
                return_to: ReturnTo::step("s1"),
                user_text: "milk".into(),
            })
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ResumeOutcome::Rejected(ResumeRejection::Expired { ref message }) if message.contains("expired")
        ));

        let state = h.store.load("T1").await.unwrap().unwrap();
        assert!(state.pending_hitl.is_none());
        assert!(state.interrupted_at.is_none());
        assert!(state.error.unwrap().contains("expired"));
        assert!(state.resolver_results.is_empty());
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.orchestrator.telemetry().snapshot().expired, 1);
    }

    #[tokio::test]
    async fn test_double_resume_executes_once() {
        let h = harness(delete_plan(), OrchestratorConfig::default());
        h.orchestrator
            .handle_message(Inbound::new("T1", "delete the task"))
            .await
            .unwrap();

        let request = ResumeRequest {
            thread_id: "T1".into(),
            return_to: ReturnTo::step("s1"),
            user_text: "milk".into(),
        };
        let first = h.orchestrator.resume(request.clone()).await.unwrap();
        let second = h.orchestrator.resume(request).await.unwrap();

        assert!(matches!(first, ResumeOutcome::Applied(TurnOutcome::Responded { .. })));
        assert_eq!(second, ResumeOutcome::Rejected(ResumeRejection::NothingPending));
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_same_request_on_a_later_turn_runs_again() {
        let h = harness(
            vec![
                PlanStep::new("s1", "database", "create_task")
                    .with_constraints(serde_json::json!({"title": "buy milk"})),
            ],
            OrchestratorConfig::default(),
        );
        for _ in 0..2 {
            h.orchestrator
                .handle_message(Inbound::new("T1", "remind me to buy milk"))
                .await
                .unwrap();
        }
        let state = h.store.load("T1").await.unwrap().unwrap();
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
        assert!(!state.execution_results["s1"].skipped);
        // The ledger is archived across turns
        assert_eq!(state.executed_operations.len(), 2);
        assert_eq!(h.orchestrator.telemetry().snapshot().duplicate_skips, 0);
    }

    #[tokio::test]
    async fn test_mismatched_reply_reprompts_and_keeps_pending() {
        let h = harness(delete_plan(), OrchestratorConfig::default());
        h.orchestrator
            .handle_message(Inbound::new("T1", "delete the task"))
            .await
            .unwrap();

        let outcome = h
            .orchestrator
            .handle_message(Inbound::new("T1", "yes").reply_to(ReturnTo::step("s9")))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TurnOutcome::Reprompt {
                question: "Which task should I delete?".into(),
                options: vec!["milk".into(), "bread".into()],
            }
        );
        let state = h.store.load("T1").await.unwrap().unwrap();
        assert_eq!(state.pending_hitl.as_ref().unwrap().step_id(), "s1");
        assert!(state.hitl_results.is_empty());
        assert_eq!(h.orchestrator.telemetry().snapshot().mismatches, 1);

        let rejected = h
            .orchestrator
            .resume(ResumeRequest {
                thread_id: "T1".into(),
                return_to: ReturnTo::step("s9"),
                user_text: "yes".into(),
            })
            .await
            .unwrap();
        assert!(matches!(
            rejected,
            ResumeOutcome::Rejected(ResumeRejection::Mismatched { ref expected, .. })
                if expected.step_id == "s1"
        ));
    }

    #[tokio::test]
    async fn test_mismatched_reply_can_abandon_pending() {
        let config = OrchestratorConfig {
            mismatch_policy: MismatchPolicy::Abandon,
            ..Default::default()
        };
        let h = harness(delete_plan(), config);
        h.orchestrator
            .handle_message(Inbound::new("T1", "delete the task"))
            .await
            .unwrap();
        let first_trace = h.store.load("T1").await.unwrap().unwrap().trace_id;

        let outcome = h
            .orchestrator
            .handle_message(Inbound::new("T1", "delete a task").reply_to(ReturnTo::step("s9")))
            .await
            .unwrap();

        // A fresh turn that asks its own question
        assert!(matches!(outcome, TurnOutcome::AwaitingClarification { .. }));
        let state = h.store.load("T1").await.unwrap().unwrap();
        assert_ne!(state.trace_id, first_trace);
        assert_eq!(h.orchestrator.telemetry().snapshot().turns, 2);
    }

    #[tokio::test]
    async fn test_cancel_step_drops_pending_question() {
        let h = harness(delete_plan(), OrchestratorConfig::default());
        h.orchestrator
            .handle_message(Inbound::new("T1", "delete the task"))
            .await
            .unwrap();

        assert!(h.orchestrator.cancel_step("T1", "s1").await.unwrap());
        let state = h.store.load("T1").await.unwrap().unwrap();
        assert!(state.plan.is_empty());
        assert!(state.pending_hitl.is_none());
        assert!(!h.orchestrator.cancel_step("T1", "s1").await.unwrap());
    }

    /// Task backend whose first call for title "b" fails
    struct FlakyBackend {
        a_calls: Arc<AtomicU32>,
        b_calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Adapter for FlakyBackend {
        fn capability(&self) -> &str {
            "database"
        }
        async fn execute(&self, _action: &str, args: &serde_json::Value) -> AdapterOutcome {
            if args["title"] == "b" {
                if self.b_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return AdapterOutcome::failed("backend unavailable");
                }
                return AdapterOutcome::ok(serde_json::json!({"id": "task-b"}));
            }
            self.a_calls.fetch_add(1, Ordering::SeqCst);
            AdapterOutcome::ok(serde_json::json!({"id": "task-a"}))
        }
    }

    #[tokio::test]
    async fn test_retry_after_partial_failure_reruns_only_failed_step() {
        let mut h = harness(
            vec![
                PlanStep::new("s1", "database", "create_task")
                    .with_constraints(serde_json::json!({"title": "a"})),
                PlanStep::new("s2", "database", "create_task")
                    .with_constraints(serde_json::json!({"title": "b"})),
            ],
            OrchestratorConfig::default(),
        );
        let a_calls = Arc::new(AtomicU32::new(0));
        let b_calls = Arc::new(AtomicU32::new(0));
        h.orchestrator.add_adapter(Arc::new(FlakyBackend {
            a_calls: Arc::clone(&a_calls),
            b_calls: Arc::clone(&b_calls),
        }));

        h.orchestrator
            .handle_message(Inbound::new("T1", "add a and b"))
            .await
            .unwrap();
        let partial = h.store.load("T1").await.unwrap().unwrap();
        assert!(partial.execution_results["s1"].success);
        assert!(!partial.execution_results["s2"].success);
        assert!(partial.error.is_some());
        assert_eq!(partial.executed_operations.len(), 1);

        let mut rx = h.orchestrator.subscribe();
        let retried = h.orchestrator.retry_unresolved("T1").await.unwrap();
        assert!(matches!(retried, Some(TurnOutcome::Responded { .. })));
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 2);

        let mut skipped = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let OrchestratorEvent::OperationSkipped { step_id, .. } = event {
                skipped.push(step_id);
            }
        }
        // The committed step is guarded by the ledger, the failed one ran for real
        assert_eq!(skipped, vec!["s1".to_string()]);

        let done = h.store.load("T1").await.unwrap().unwrap();
        assert_eq!(done.trace_id, partial.trace_id);
        assert!(done.execution_results["s2"].success);
        assert_eq!(done.execution_results["s1"].data.as_ref().unwrap()["id"], "task-a");
        assert_eq!(done.executed_operations.len(), 2);
        assert!(done.error.is_none());

        // Nothing left to retry
        assert_eq!(h.orchestrator.retry_unresolved("T1").await.unwrap(), None);
        assert_eq!(b_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_execution_can_be_cancelled() {
        let mut h = harness(
            vec![
                PlanStep::new("s1", "database", "create_task")
                    .with_constraints(serde_json::json!({"title": "b"})),
            ],
            OrchestratorConfig::default(),
        );
        let b_calls = Arc::new(AtomicU32::new(0));
        h.orchestrator.add_adapter(Arc::new(FlakyBackend {
            a_calls: Arc::new(AtomicU32::new(0)),
            b_calls: Arc::clone(&b_calls),
        }));
        h.orchestrator
            .handle_message(Inbound::new("T1", "add b"))
            .await
            .unwrap();

        assert!(h.orchestrator.cancel_step("T1", "s1").await.unwrap());
        assert_eq!(h.orchestrator.retry_unresolved("T1").await.unwrap(), None);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idle_thread_locks_are_released() {
        let h = harness(
            vec![PlanStep::new("s1", "database", "list_tasks")],
            OrchestratorConfig::default(),
        );
        for thread in ["T1", "T2", "T3"] {
            h.orchestrator
                .handle_message(Inbound::new(thread, "show my tasks"))
                .await
                .unwrap();
        }
        let locks = h.orchestrator.thread_locks.lock();
        assert_eq!(locks.len(), 1);
        assert!(locks.contains_key("T3"));
    }

    #[tokio::test]
    async fn test_unknown_step_degrades_and_can_be_retried() {
        let h = harness(
            vec![
                PlanStep::new("s1", "weather", "forecast"),
                PlanStep::new("s2", "database", "list_tasks"),
            ],
            OrchestratorConfig::default(),
        );
        let outcome = h
            .orchestrator
            .handle_message(Inbound::new("T1", "weather and tasks"))
            .await
            .unwrap();
        let TurnOutcome::Responded { text } = outcome else {
            panic!("expected a reply");
        };
        assert!(text.contains("can't do that"));

        let state = h.store.load("T1").await.unwrap().unwrap();
        assert!(state.is_resolved("s2"));
        assert!(!state.is_resolved("s1"));

        // Still no handler: the retry degrades the same way without repeating s2
        let retried = h.orchestrator.retry_unresolved("T1").await.unwrap();
        assert!(matches!(retried, Some(TurnOutcome::Responded { .. })));
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }
}
