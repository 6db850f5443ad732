//! Owns research sessions and drives them through the pipeline.
//!
//! Every step follows the same shape: plan the next phase from the session
//! while holding its lock, run the executor with the lock released, then
//! re-lock to record the output and apply the resulting flow event. A cancel
//! that lands while an executor is in flight is honored at that boundary and
//! the executor's output is dropped.

use std::collections::HashMap;
use std::sync::Arc;

use dialectic_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use dialectic_core::config::AppConfig;
use dialectic_core::flows::{FlowContext, TransitionOutcome};
use dialectic_core::gateway::CallGateway;
use dialectic_core::quota::QuotaUsage;
use dialectic_core::{
    AbortReason, AgentSelection, AlignmentAction, Analysis, ApplicationError,
    ClarificationExchange, DialogueHistory, DialogueOutcome, DialogueTurn, DomainError,
    EvaluationDecision, FailureKind, FlowEngine, PhaseFailure, PhaseKind, PhaseOutput,
    PipelineEvent, PipelinePhase, ResearchBundle, ResearchFlow, ResearchScope, ResearchSession,
    SearchResults, SessionId, SessionSnapshot, SessionSummary,
};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alignment::{AlignmentGate, AlignmentInput};
use crate::evaluator::{DialogueEvaluator, EvaluationInput};
use crate::events::SessionEvent;
use crate::phases::{DialogueRoundInput, PhaseExecutors, PhaseRoles, SynthesisInput};

const EVENT_CAPACITY: usize = 256;
const ACTOR: &str = "orchestrator";
const DEFAULT_CLARIFICATION_QUESTION: &str =
    "The debate needs your input before it can continue. What should it focus on?";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("session {id} is {state}, not awaiting clarification")]
    NotAwaitingClarification { id: SessionId, state: &'static str },
    #[error("session {id} is already {state}")]
    SessionTerminal { id: SessionId, state: &'static str },
    #[error("session {0} is already being driven")]
    AlreadyRunning(SessionId),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl From<OrchestratorError> for ApplicationError {
    fn from(value: OrchestratorError) -> Self {
        match value {
            OrchestratorError::SessionNotFound(_) => Self::NotFound(value.to_string()),
            OrchestratorError::NotAwaitingClarification { .. }
            | OrchestratorError::SessionTerminal { .. }
            | OrchestratorError::AlreadyRunning(_) => Self::Conflict(value.to_string()),
            OrchestratorError::InvalidRequest(message) => Self::InvalidInput(message),
            OrchestratorError::Domain(error) => Self::Domain(error),
        }
    }
}

struct SessionSlot {
    session: ResearchSession,
    cancel_requested: bool,
    driving: bool,
}

struct RoundPlan {
    round: u32,
    max_rounds: u32,
    bundle: ResearchBundle,
    agents: AgentSelection,
    history: DialogueHistory,
    clarifications: Vec<ClarificationExchange>,
    feedback: Vec<String>,
}

struct SynthesisPlan {
    bundle: ResearchBundle,
    agents: AgentSelection,
    history: DialogueHistory,
    clarifications: Vec<ClarificationExchange>,
    rounds_completed: u32,
    outcome: DialogueOutcome,
    drift_areas: Vec<String>,
}

/// The next unit of work for a session, with owned copies of its inputs.
enum Step {
    Clarify { query: String },
    Search { scope: ResearchScope },
    Analyze { scope: ResearchScope, results: SearchResults },
    DeepResearch { scope: ResearchScope, analysis: Analysis },
    SelectAgents { bundle: ResearchBundle },
    DialogueRound(Box<RoundPlan>),
    Evaluate {
        round: u32,
        max_rounds: u32,
        intent: String,
        success_criteria: Vec<String>,
        turns: Vec<DialogueTurn>,
    },
    CheckAlignment {
        round: u32,
        intent: String,
        clarifications: Vec<ClarificationExchange>,
        turns: Vec<DialogueTurn>,
    },
    Synthesize(Box<SynthesisPlan>),
}

impl Step {
    fn kind(&self) -> PhaseKind {
        match self {
            Self::Clarify { .. } => PhaseKind::Clarify,
            Self::Search { .. } => PhaseKind::Search,
            Self::Analyze { .. } => PhaseKind::Analyze,
            Self::DeepResearch { .. } => PhaseKind::DeepResearch,
            Self::SelectAgents { .. } => PhaseKind::AgentSelect,
            Self::DialogueRound(_) => PhaseKind::DialogueRound,
            Self::Evaluate { .. } => PhaseKind::Evaluate,
            Self::CheckAlignment { .. } => PhaseKind::AlignmentCheck,
            Self::Synthesize(_) => PhaseKind::Synthesize,
        }
    }
}

pub struct PipelineOrchestrator {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<SessionSlot>>>>,
    executors: PhaseExecutors,
    evaluator: DialogueEvaluator,
    alignment: AlignmentGate,
    engine: FlowEngine<ResearchFlow>,
    audit: Arc<dyn AuditSink>,
    events: broadcast::Sender<SessionEvent>,
    default_max_rounds: u32,
}

impl PipelineOrchestrator {
    pub fn new(
        gateway: Arc<dyn CallGateway>,
        roles: PhaseRoles,
        audit: Arc<dyn AuditSink>,
        default_max_rounds: u32,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions: RwLock::new(HashMap::new()),
            evaluator: DialogueEvaluator::new(gateway.clone(), roles.llm.clone()),
            alignment: AlignmentGate::new(gateway.clone(), roles.llm.clone()),
            executors: PhaseExecutors::new(gateway, roles),
            engine: FlowEngine::default(),
            audit,
            events,
            default_max_rounds,
        }
    }

    pub fn from_config(
        config: &AppConfig,
        gateway: Arc<dyn CallGateway>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self::new(gateway, PhaseRoles::from_config(config), audit, config.pipeline.max_rounds)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn quota_snapshot(&self) -> Vec<QuotaUsage> {
        self.executors.gateway().quota_snapshot()
    }

    pub async fn create_session(
        &self,
        query: &str,
        max_rounds: Option<u32>,
    ) -> Result<SessionId, OrchestratorError> {
        let max_rounds = max_rounds.unwrap_or(self.default_max_rounds);
        let session = ResearchSession::new(query, max_rounds, self.engine.initial_state())?;
        let id = session.id().clone();

        self.audit.emit(
            AuditEvent::new(
                Some(id.clone()),
                id.as_str(),
                "session.created",
                AuditCategory::Session,
                ACTOR,
                AuditOutcome::Success,
            )
            .with_metadata("max_rounds", max_rounds.to_string()),
        );
        info!(
            event_name = "orchestrator.session.created",
            session_id = %id,
            max_rounds,
            "research session created"
        );

        let slot = SessionSlot { session, cancel_requested: false, driving: false };
        self.sessions.write().await.insert(id.clone(), Arc::new(Mutex::new(slot)));
        Ok(id)
    }

    pub async fn get_session_state(
        &self,
        id: &SessionId,
    ) -> Result<SessionSnapshot, OrchestratorError> {
        let slot = self.slot(id).await?;
        let guard = slot.lock().await;
        Ok(guard.session.snapshot())
    }

    /// Most recently updated first.
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let slots = self.sessions.read().await.values().cloned().collect::<Vec<_>>();
        let mut summaries = Vec::with_capacity(slots.len());
        for slot in slots {
            summaries.push(slot.lock().await.session.summary());
        }
        summaries.sort_by(|left, right| right.updated_at.cmp(&left.updated_at));
        summaries
    }

    /// Records the answer and moves the session back into the dialogue. The
    /// caller decides when to drive it again.
    pub async fn submit_clarification_answer(
        &self,
        id: &SessionId,
        answer: &str,
    ) -> Result<SessionSnapshot, OrchestratorError> {
        if answer.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "clarification answer must not be empty".to_owned(),
            ));
        }

        let slot = self.slot(id).await?;
        let mut guard = slot.lock().await;
        let session = &mut guard.session;
        if session.is_terminal() {
            return Err(OrchestratorError::SessionTerminal {
                id: id.clone(),
                state: session.phase().label(),
            });
        }
        if !matches!(session.phase(), PipelinePhase::NeedsClarification { .. }) {
            return Err(OrchestratorError::NotAwaitingClarification {
                id: id.clone(),
                state: session.phase().label(),
            });
        }

        let exchange = session.answer_clarification(answer)?;
        let correlation_id = Uuid::new_v4().to_string();
        self.transition(session, PipelineEvent::ClarificationReceived, &correlation_id)?;
        info!(
            event_name = "orchestrator.clarification.received",
            session_id = %id,
            round = exchange.round,
            "clarification answer recorded"
        );
        Ok(session.snapshot())
    }

    /// Cancels immediately when nothing is driving the session; otherwise the
    /// driver aborts at its next boundary.
    pub async fn cancel_session(&self, id: &SessionId) -> Result<SessionSnapshot, OrchestratorError> {
        let slot = self.slot(id).await?;
        let mut guard = slot.lock().await;
        if guard.session.is_terminal() {
            return Err(OrchestratorError::SessionTerminal {
                id: id.clone(),
                state: guard.session.phase().label(),
            });
        }

        guard.cancel_requested = true;
        if !guard.driving {
            let correlation_id = Uuid::new_v4().to_string();
            self.abort_cancelled(&mut guard.session, &correlation_id)?;
        }
        info!(
            event_name = "orchestrator.session.cancel_requested",
            session_id = %id,
            deferred = guard.driving,
            "session cancellation requested"
        );
        Ok(guard.session.snapshot())
    }

    pub fn spawn_drive(self: &Arc<Self>, id: SessionId) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = orchestrator.drive(&id).await {
                error!(
                    event_name = "orchestrator.drive.failed",
                    session_id = %id,
                    error = %error,
                    "session driver stopped with error"
                );
            }
        })
    }

    /// Runs the session until it completes, aborts, or pauses for
    /// clarification.
    pub async fn drive(&self, id: &SessionId) -> Result<SessionSnapshot, OrchestratorError> {
        let slot = self.slot(id).await?;
        {
            let mut guard = slot.lock().await;
            if guard.session.is_terminal() {
                return Ok(guard.session.snapshot());
            }
            if guard.driving {
                return Err(OrchestratorError::AlreadyRunning(id.clone()));
            }
            guard.driving = true;
        }

        let correlation_id = Uuid::new_v4().to_string();
        self.drive_steps(&slot, &correlation_id).await
    }

    /// Every return clears `driving` under the same lock that decided to
    /// stop, so an answer or cancel arriving right after sees an idle slot.
    async fn drive_steps(
        &self,
        slot: &Mutex<SessionSlot>,
        correlation_id: &str,
    ) -> Result<SessionSnapshot, OrchestratorError> {
        loop {
            let (step, session_id) = {
                let mut guard = slot.lock().await;
                match self.next_step(&mut guard, correlation_id) {
                    Ok(Some(next)) => next,
                    Ok(None) => return Ok(release(&mut guard)),
                    Err(error) => {
                        guard.driving = false;
                        return Err(error);
                    }
                }
            };

            let phase = step.kind();
            self.publish(SessionEvent::PhaseStarted { session_id: session_id.clone(), phase });
            info!(
                event_name = "orchestrator.phase.started",
                correlation_id,
                session_id = %session_id,
                phase = phase.as_str(),
                "phase started"
            );

            let result = self.execute(step).await;

            let mut guard = slot.lock().await;
            match self.absorb(&mut guard, phase, result, correlation_id) {
                Ok(true) => {}
                Ok(false) => return Ok(release(&mut guard)),
                Err(error) => {
                    guard.driving = false;
                    return Err(error);
                }
            }
        }
    }

    fn next_step(
        &self,
        slot: &mut SessionSlot,
        correlation_id: &str,
    ) -> Result<Option<(Step, SessionId)>, OrchestratorError> {
        let SessionSlot { session, cancel_requested, .. } = slot;
        if *cancel_requested && !session.is_terminal() {
            self.abort_cancelled(session, correlation_id)?;
        }
        Ok(plan(session)?.map(|step| (step, session.id().clone())))
    }

    /// Applies a finished phase. `false` means the output was discarded
    /// because the session was cancelled while the phase ran.
    fn absorb(
        &self,
        slot: &mut SessionSlot,
        phase: PhaseKind,
        result: Result<PhaseOutput, PhaseFailure>,
        correlation_id: &str,
    ) -> Result<bool, OrchestratorError> {
        let SessionSlot { session, cancel_requested, .. } = slot;
        if *cancel_requested {
            info!(
                event_name = "orchestrator.phase.discarded",
                correlation_id,
                session_id = %session.id(),
                phase = phase.as_str(),
                "session cancelled while phase was in flight, discarding output"
            );
            if !session.is_terminal() {
                self.abort_cancelled(session, correlation_id)?;
            }
            return Ok(false);
        }

        match result {
            Ok(output) => {
                self.publish(SessionEvent::PhaseCompleted {
                    session_id: session.id().clone(),
                    phase,
                });
                self.settle(session, output, correlation_id)?;
            }
            Err(failure) => self.fail(session, failure, correlation_id)?,
        }
        Ok(true)
    }

    async fn execute(&self, step: Step) -> Result<PhaseOutput, PhaseFailure> {
        match step {
            Step::Clarify { query } => {
                self.executors.clarify(&query).await.map(PhaseOutput::Clarified)
            }
            Step::Search { scope } => self.executors.search(&scope).await.map(PhaseOutput::Searched),
            Step::Analyze { scope, results } => {
                self.executors.analyze(&scope, &results).await.map(PhaseOutput::Analyzed)
            }
            Step::DeepResearch { scope, analysis } => self
                .executors
                .deep_research(&scope, &analysis)
                .await
                .map(PhaseOutput::DeepResearched),
            Step::SelectAgents { bundle } => {
                self.executors.select_agents(&bundle).await.map(PhaseOutput::AgentsSelected)
            }
            Step::DialogueRound(plan) => {
                let round = plan.round;
                self.executors
                    .dialogue_round(DialogueRoundInput {
                        round,
                        max_rounds: plan.max_rounds,
                        bundle: &plan.bundle,
                        agents: &plan.agents,
                        history: &plan.history,
                        clarifications: &plan.clarifications,
                        feedback: &plan.feedback,
                    })
                    .await
                    .map(|turns| PhaseOutput::RoundCompleted { round, turns })
            }
            Step::Evaluate { round, max_rounds, intent, success_criteria, turns } => self
                .evaluator
                .evaluate(EvaluationInput {
                    round,
                    max_rounds,
                    intent: &intent,
                    success_criteria: &success_criteria,
                    turns: &turns,
                })
                .await
                .map(|evaluation| PhaseOutput::Evaluated { round, evaluation })
                .map_err(|failure| PhaseFailure::new(PhaseKind::Evaluate, failure)),
            Step::CheckAlignment { round, intent, clarifications, turns } => self
                .alignment
                .check(AlignmentInput {
                    round,
                    intent: &intent,
                    clarifications: &clarifications,
                    turns: &turns,
                })
                .await
                .map(|verdict| PhaseOutput::AlignmentChecked { round, verdict })
                .map_err(|failure| PhaseFailure::new(PhaseKind::AlignmentCheck, failure)),
            Step::Synthesize(plan) => self
                .executors
                .synthesize(SynthesisInput {
                    bundle: &plan.bundle,
                    agents: &plan.agents,
                    history: &plan.history,
                    clarifications: &plan.clarifications,
                    rounds_completed: plan.rounds_completed,
                    outcome: plan.outcome,
                    drift_areas: &plan.drift_areas,
                })
                .await
                .map(PhaseOutput::Synthesized),
        }
    }

    /// Records a successful phase output and applies whatever flow event it
    /// implies. Sub-steps that stay inside the current state only report
    /// progress.
    fn settle(
        &self,
        session: &mut ResearchSession,
        output: PhaseOutput,
        correlation_id: &str,
    ) -> Result<(), OrchestratorError> {
        let event = match &output {
            PhaseOutput::Clarified(_) => Some(PipelineEvent::ScopeClarified),
            PhaseOutput::Searched(results) => {
                for (provider, kind) in results.failed_providers() {
                    self.audit.emit(
                        AuditEvent::new(
                            Some(session.id().clone()),
                            correlation_id,
                            "provider.search_degraded",
                            AuditCategory::Provider,
                            ACTOR,
                            AuditOutcome::Failed,
                        )
                        .with_metadata("provider", provider.as_str())
                        .with_metadata("failure_kind", kind.as_str()),
                    );
                }
                None
            }
            PhaseOutput::Analyzed(_) => None,
            PhaseOutput::DeepResearched(_) => Some(PipelineEvent::ResearchCompleted),
            PhaseOutput::AgentsSelected(_) => Some(PipelineEvent::AgentsSelected),
            PhaseOutput::RoundCompleted { round, turns } => {
                self.publish(SessionEvent::RoundCompleted {
                    session_id: session.id().clone(),
                    round: *round,
                    turns: turns.len(),
                });
                None
            }
            PhaseOutput::Evaluated { round, evaluation } => match evaluation.decision {
                EvaluationDecision::Conclude => {
                    session.set_dialogue_outcome(DialogueOutcome::Concluded);
                    Some(PipelineEvent::DialogueConcluded)
                }
                EvaluationDecision::Continue if *round >= session.max_rounds() => {
                    session.set_dialogue_outcome(DialogueOutcome::RoundLimit);
                    Some(PipelineEvent::RoundLimitReached)
                }
                EvaluationDecision::Continue => None,
                EvaluationDecision::Clarify | EvaluationDecision::Hold => {
                    let question = evaluation
                        .questions
                        .first()
                        .cloned()
                        .unwrap_or_else(|| DEFAULT_CLARIFICATION_QUESTION.to_owned());
                    session.set_pending_question(question);
                    Some(PipelineEvent::ClarificationRequested)
                }
            },
            PhaseOutput::AlignmentChecked { round, verdict } => {
                self.audit.emit(
                    AuditEvent::new(
                        Some(session.id().clone()),
                        correlation_id,
                        "alignment.checked",
                        AuditCategory::Alignment,
                        ACTOR,
                        AuditOutcome::Success,
                    )
                    .with_metadata("round", round.to_string())
                    .with_metadata("action", verdict.action.as_str())
                    .with_metadata("drift_areas", verdict.drift_areas.join("; ")),
                );
                self.publish(SessionEvent::AlignmentChecked {
                    session_id: session.id().clone(),
                    round: *round,
                    action: verdict.action,
                });
                match verdict.action {
                    AlignmentAction::Proceed => Some(PipelineEvent::ContinueApproved),
                    AlignmentAction::Clarify => {
                        let question = verdict
                            .checkpoint_question
                            .clone()
                            .unwrap_or_else(|| DEFAULT_CLARIFICATION_QUESTION.to_owned());
                        session.set_pending_question(question);
                        Some(PipelineEvent::ClarificationRequested)
                    }
                    AlignmentAction::Realign => {
                        session.set_dialogue_outcome(DialogueOutcome::Realigned);
                        Some(PipelineEvent::RealignRequired)
                    }
                }
            }
            PhaseOutput::ClarificationAnswered(_) => None,
            PhaseOutput::Synthesized(_) => Some(PipelineEvent::SynthesisCompleted),
        };

        let percent = step_progress(&output);
        session.record(output)?;
        if let Some(percent) = percent {
            self.report_progress(session, percent);
        }
        if let Some(event) = event {
            self.transition(session, event, correlation_id)?;
        }
        Ok(())
    }

    fn fail(
        &self,
        session: &mut ResearchSession,
        failure: PhaseFailure,
        correlation_id: &str,
    ) -> Result<(), OrchestratorError> {
        warn!(
            event_name = "orchestrator.phase.failed",
            correlation_id,
            session_id = %session.id(),
            phase = failure.phase.as_str(),
            provider = %failure.failure.provider,
            failure_kind = failure.kind().as_str(),
            error = %failure.failure.reason,
            "phase failed"
        );
        self.audit.emit(
            AuditEvent::new(
                Some(session.id().clone()),
                correlation_id,
                "provider.call_failed",
                AuditCategory::Provider,
                ACTOR,
                AuditOutcome::Failed,
            )
            .with_metadata("phase", failure.phase.as_str())
            .with_metadata("provider", failure.failure.provider.as_str())
            .with_metadata("failure_kind", failure.kind().as_str()),
        );

        if failure.phase == PhaseKind::Evaluate && failure.kind() != FailureKind::AuthMissing {
            session.set_dialogue_outcome(DialogueOutcome::EvaluationUnavailable);
            self.transition(session, PipelineEvent::DialogueConcluded, correlation_id)?;
            return Ok(());
        }

        session.set_abort_reason(AbortReason::Failure {
            phase: failure.phase,
            kind: failure.kind(),
            reason: failure.failure.to_string(),
        });
        self.transition(session, PipelineEvent::PhaseFailed { kind: failure.kind() }, correlation_id)?;
        Ok(())
    }

    fn abort_cancelled(
        &self,
        session: &mut ResearchSession,
        correlation_id: &str,
    ) -> Result<(), OrchestratorError> {
        session.set_abort_reason(AbortReason::Cancelled);
        self.transition(session, PipelineEvent::CancelRequested, correlation_id)?;
        Ok(())
    }

    fn transition(
        &self,
        session: &mut ResearchSession,
        event: PipelineEvent,
        correlation_id: &str,
    ) -> Result<TransitionOutcome, OrchestratorError> {
        let context = FlowContext { max_rounds: session.max_rounds() };
        let audit = AuditContext::new(Some(session.id().clone()), correlation_id, ACTOR);
        let outcome = self
            .engine
            .apply_with_audit(session.phase(), &event, &context, self.audit.as_ref(), &audit)
            .map_err(DomainError::from)?;
        session.apply_transition(&outcome)?;

        info!(
            event_name = "orchestrator.session.transitioned",
            correlation_id,
            session_id = %session.id(),
            from = outcome.from.label(),
            to = outcome.to.label(),
            round = session.round(),
            "session transitioned"
        );

        let session_id = session.id().clone();
        match &outcome.to {
            PipelinePhase::NeedsClarification { round } => {
                self.publish(SessionEvent::ClarificationRequested {
                    session_id,
                    round: *round,
                    question: session.pending_question().unwrap_or_default().to_owned(),
                });
            }
            PipelinePhase::Complete => self.publish(SessionEvent::Completed { session_id }),
            PipelinePhase::Aborted => {
                if let Some(reason) = session.abort_reason() {
                    self.publish(SessionEvent::Aborted { session_id, reason: reason.clone() });
                }
            }
            _ => {}
        }
        Ok(outcome)
    }

    fn report_progress(&self, session: &mut ResearchSession, percent: u8) {
        if session.report_progress(percent) {
            self.publish(SessionEvent::Progress {
                session_id: session.id().clone(),
                state: session.phase().clone(),
                percent: session.progress(),
            });
        }
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    async fn slot(&self, id: &SessionId) -> Result<Arc<Mutex<SessionSlot>>, OrchestratorError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::SessionNotFound(id.clone()))
    }
}

/// Progress within the current state after a sub-step completes.
fn release(slot: &mut SessionSlot) -> SessionSnapshot {
    slot.driving = false;
    slot.session.snapshot()
}

fn step_progress(output: &PhaseOutput) -> Option<u8> {
    match output {
        PhaseOutput::Searched(_) => Some(33),
        PhaseOutput::Analyzed(_) => Some(66),
        PhaseOutput::DeepResearched(_) => Some(100),
        PhaseOutput::RoundCompleted { .. } => Some(50),
        PhaseOutput::Evaluated { .. } => Some(75),
        PhaseOutput::AlignmentChecked { .. } => Some(100),
        _ => None,
    }
}

/// Derives the next step from the session's state and the tail of its log.
/// `None` means there is nothing to run: the session is terminal or waiting
/// for the user.
fn plan(session: &ResearchSession) -> Result<Option<Step>, DomainError> {
    let step = match session.phase() {
        PipelinePhase::Complete
        | PipelinePhase::Aborted
        | PipelinePhase::NeedsClarification { .. } => return Ok(None),
        PipelinePhase::Clarifying => Step::Clarify { query: session.query().to_owned() },
        PipelinePhase::Researching => {
            let scope = required(session.latest_scope(), "clarified scope")?.clone();
            match session.last_output() {
                Some(PhaseOutput::Searched(results)) => {
                    Step::Analyze { scope, results: results.clone() }
                }
                Some(PhaseOutput::Analyzed(analysis)) => {
                    Step::DeepResearch { scope, analysis: analysis.clone() }
                }
                _ => Step::Search { scope },
            }
        }
        PipelinePhase::AgentSelecting => {
            Step::SelectAgents { bundle: required(session.research_bundle(), "research bundle")? }
        }
        PipelinePhase::Dialoguing { round } => {
            let round = *round;
            match session.last_output() {
                Some(PhaseOutput::RoundCompleted { round: completed, turns })
                    if *completed == round =>
                {
                    let bundle = required(session.research_bundle(), "research bundle")?;
                    let agents = required(session.latest_selection(), "agent selection")?;
                    Step::Evaluate {
                        round,
                        max_rounds: session.max_rounds(),
                        intent: bundle.scope.intent().to_owned(),
                        success_criteria: agents.success_criteria.clone(),
                        turns: turns.clone(),
                    }
                }
                Some(PhaseOutput::Evaluated { round: evaluated, evaluation })
                    if *evaluated == round
                        && evaluation.decision == EvaluationDecision::Continue =>
                {
                    let bundle = required(session.research_bundle(), "research bundle")?;
                    Step::CheckAlignment {
                        round,
                        intent: bundle.scope.intent().to_owned(),
                        clarifications: session.clarifications().to_vec(),
                        turns: session.latest_round_turns(round).to_vec(),
                    }
                }
                _ => Step::DialogueRound(Box::new(RoundPlan {
                    round,
                    max_rounds: session.max_rounds(),
                    bundle: required(session.research_bundle(), "research bundle")?,
                    agents: required(session.latest_selection(), "agent selection")?.clone(),
                    history: session.history().clone(),
                    clarifications: session.clarifications().to_vec(),
                    feedback: session
                        .latest_evaluation()
                        .map(|(_, evaluation)| evaluation.feedback.clone())
                        .unwrap_or_default(),
                })),
            }
        }
        PipelinePhase::Synthesizing => {
            let outcome = session.dialogue_outcome().unwrap_or(DialogueOutcome::Concluded);
            let drift_areas = match (outcome, session.last_verdict()) {
                (DialogueOutcome::Realigned, Some(verdict)) => verdict.drift_areas.clone(),
                _ => Vec::new(),
            };
            Step::Synthesize(Box::new(SynthesisPlan {
                bundle: required(session.research_bundle(), "research bundle")?,
                agents: required(session.latest_selection(), "agent selection")?.clone(),
                history: session.history().clone(),
                clarifications: session.clarifications().to_vec(),
                rounds_completed: session.round(),
                outcome,
                drift_areas,
            }))
        }
    };
    Ok(Some(step))
}

fn required<T>(value: Option<T>, what: &str) -> Result<T, DomainError> {
    value.ok_or_else(|| DomainError::InvariantViolation(format!("{what} missing from session log")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dialectic_core::audit::InMemoryAuditSink;
    use dialectic_core::gateway::{CompletionTask, FailureKind};
    use dialectic_core::{PipelinePhase, SessionId};
    use serde_json::json;

    use super::{OrchestratorError, PipelineOrchestrator};
    use crate::events::SessionEvent;
    use crate::phases::PhaseRoles;
    use crate::testing::{ScriptedGateway, ScriptedReply};

    fn orchestrator(gateway: Arc<ScriptedGateway>) -> (PipelineOrchestrator, InMemoryAuditSink) {
        let audit = InMemoryAuditSink::default();
        let orchestrator =
            PipelineOrchestrator::new(gateway, PhaseRoles::default(), Arc::new(audit.clone()), 3);
        (orchestrator, audit)
    }

    #[tokio::test]
    async fn conclude_after_first_round_completes() {
        let gateway = Arc::new(ScriptedGateway::happy_path());
        gateway.push(
            CompletionTask::Evaluate,
            ScriptedReply::json(json!({ "decision": "conclude", "rationale": "settled" })),
        );
        let (orchestrator, audit) = orchestrator(gateway.clone());
        let mut events = orchestrator.subscribe();

        let id = orchestrator.create_session("solid-state batteries", None).await.expect("created");
        let snapshot = orchestrator.drive(&id).await.expect("driven");

        assert_eq!(snapshot.phase, PipelinePhase::Complete);
        assert_eq!(snapshot.round, 1);
        assert_eq!(snapshot.progress, 100);
        assert!(snapshot.report.is_some());
        assert_eq!(gateway.calls_for_task(CompletionTask::Align), 0);
        assert!(audit.events().iter().any(|event| event.event_type == "flow.transition_applied"));

        let mut completed = false;
        while let Ok(event) = events.try_recv() {
            completed |= matches!(event, SessionEvent::Completed { .. });
        }
        assert!(completed);
    }

    #[tokio::test]
    async fn clarification_answer_only_accepted_while_paused() {
        let gateway = Arc::new(ScriptedGateway::happy_path());
        let (orchestrator, _) = orchestrator(gateway);
        let id = orchestrator.create_session("query", None).await.expect("created");

        let error = orchestrator
            .submit_clarification_answer(&id, "answer")
            .await
            .expect_err("not paused");

        assert!(matches!(error, OrchestratorError::NotAwaitingClarification { .. }));
    }

    #[tokio::test]
    async fn cancel_without_driver_aborts_immediately_and_is_final() {
        let gateway = Arc::new(ScriptedGateway::happy_path());
        let (orchestrator, _) = orchestrator(gateway.clone());
        let id = orchestrator.create_session("query", None).await.expect("created");

        let snapshot = orchestrator.cancel_session(&id).await.expect("cancelled");
        assert_eq!(snapshot.phase, PipelinePhase::Aborted);

        let again = orchestrator.cancel_session(&id).await.expect_err("terminal");
        assert!(matches!(again, OrchestratorError::SessionTerminal { .. }));

        let driven = orchestrator.drive(&id).await.expect("no-op");
        assert_eq!(driven.phase, PipelinePhase::Aborted);
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (orchestrator, _) = orchestrator(Arc::new(ScriptedGateway::happy_path()));

        let error = orchestrator
            .get_session_state(&SessionId::from("missing".to_owned()))
            .await
            .expect_err("missing");

        assert!(matches!(error, OrchestratorError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn invalid_round_limit_is_rejected() {
        let (orchestrator, _) = orchestrator(Arc::new(ScriptedGateway::happy_path()));

        let error = orchestrator.create_session("query", Some(16)).await.expect_err("too many");

        assert!(matches!(error, OrchestratorError::Domain(_)));
    }

    #[tokio::test]
    async fn evaluator_outage_concludes_instead_of_aborting() {
        let gateway = Arc::new(ScriptedGateway::happy_path());
        gateway.push(CompletionTask::Evaluate, ScriptedReply::failure(FailureKind::Malformed));
        let (orchestrator, _) = orchestrator(gateway);

        let id = orchestrator.create_session("query", None).await.expect("created");
        let snapshot = orchestrator.drive(&id).await.expect("driven");

        assert_eq!(snapshot.phase, PipelinePhase::Complete);
        assert_eq!(
            snapshot.dialogue_outcome,
            Some(dialectic_core::DialogueOutcome::EvaluationUnavailable)
        );
    }

    fn clarify_on_first_round(gateway: &ScriptedGateway) {
        gateway.push(
            CompletionTask::Evaluate,
            ScriptedReply::json(json!({ "decision": "clarify", "questions": ["Which market?"] })),
        );
    }

    #[tokio::test]
    async fn answer_submitted_as_the_driver_pauses_can_be_driven_at_once() {
        let gateway = Arc::new(ScriptedGateway::happy_path());
        clarify_on_first_round(&gateway);
        let (orchestrator, _) = orchestrator(gateway);
        let id = orchestrator.create_session("query", Some(2)).await.expect("created");

        let slot = orchestrator.slot(&id).await.expect("slot");
        slot.lock().await.driving = true;
        let paused = orchestrator.drive_steps(&slot, "first-drive").await.expect("paused");

        assert_eq!(paused.phase, PipelinePhase::NeedsClarification { round: 1 });
        assert!(!slot.lock().await.driving);

        orchestrator.submit_clarification_answer(&id, "EU only").await.expect("accepted");
        let resumed = orchestrator.drive(&id).await.expect("not already running");
        assert_eq!(resumed.phase, PipelinePhase::Complete);
        assert_eq!(resumed.clarifications.len(), 1);
    }

    #[tokio::test]
    async fn cancel_arriving_as_the_driver_pauses_aborts_at_once() {
        let gateway = Arc::new(ScriptedGateway::happy_path());
        clarify_on_first_round(&gateway);
        let (orchestrator, _) = orchestrator(gateway);
        let id = orchestrator.create_session("query", None).await.expect("created");

        let slot = orchestrator.slot(&id).await.expect("slot");
        slot.lock().await.driving = true;
        orchestrator.drive_steps(&slot, "first-drive").await.expect("paused");

        let cancelled = orchestrator.cancel_session(&id).await.expect("cancelled");
        assert_eq!(cancelled.phase, PipelinePhase::Aborted);
        assert_eq!(cancelled.abort, Some(dialectic_core::AbortReason::Cancelled));
    }

    #[tokio::test]
    async fn driver_that_observes_a_cancel_releases_the_slot() {
        let gateway = Arc::new(ScriptedGateway::happy_path());
        let (orchestrator, _) = orchestrator(gateway.clone());
        let id = orchestrator.create_session("query", None).await.expect("created");

        let slot = orchestrator.slot(&id).await.expect("slot");
        {
            let mut guard = slot.lock().await;
            guard.driving = true;
            guard.cancel_requested = true;
        }
        let snapshot = orchestrator.drive_steps(&slot, "cancelled-drive").await.expect("aborted");

        assert_eq!(snapshot.phase, PipelinePhase::Aborted);
        assert!(!slot.lock().await.driving);
        assert!(gateway.calls().is_empty());
        let again = orchestrator.cancel_session(&id).await.expect_err("terminal");
        assert!(matches!(again, OrchestratorError::SessionTerminal { .. }));
    }
}
