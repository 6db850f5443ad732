use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::flows::states::{
    FlowContext, PipelineAction, PipelineEvent, PipelinePhase, TransitionOutcome,
};

pub trait FlowDefinition {
    fn initial_state(&self) -> PipelinePhase;
    fn transition(
        &self,
        current: &PipelinePhase,
        event: &PipelineEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>;
}

/// Clarify, research, select agents, debate for a bounded number of rounds, synthesize.
#[derive(Clone, Debug, Default)]
pub struct ResearchFlow;

impl FlowDefinition for ResearchFlow {
    fn initial_state(&self) -> PipelinePhase {
        PipelinePhase::Clarifying
    }

    fn transition(
        &self,
        current: &PipelinePhase,
        event: &PipelineEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        transition_research(current, event, context)
    }
}

pub struct FlowEngine<F> {
    flow: F,
}

impl<F> FlowEngine<F>
where
    F: FlowDefinition,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn initial_state(&self) -> PipelinePhase {
        self.flow.initial_state()
    }

    pub fn apply(
        &self,
        current: &PipelinePhase,
        event: &PipelineEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        self.flow.transition(current, event, context)
    }

    pub fn apply_with_audit<S>(
        &self,
        current: &PipelinePhase,
        event: &PipelineEvent,
        context: &FlowContext,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.apply(current, event, context);
        match &result {
            Ok(outcome) => {
                sink.emit(
                    AuditEvent::new(
                        audit.session_id.clone(),
                        audit.correlation_id.clone(),
                        "flow.transition_applied",
                        AuditCategory::Flow,
                        audit.actor.clone(),
                        AuditOutcome::Success,
                    )
                    .with_metadata("from", outcome.from.label())
                    .with_metadata("to", outcome.to.label())
                    .with_metadata("event", format!("{:?}", outcome.event)),
                );
            }
            Err(error) => {
                sink.emit(
                    AuditEvent::new(
                        audit.session_id.clone(),
                        audit.correlation_id.clone(),
                        "flow.transition_rejected",
                        AuditCategory::Flow,
                        audit.actor.clone(),
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }
}

impl Default for FlowEngine<ResearchFlow> {
    fn default() -> Self {
        Self::new(ResearchFlow)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("invalid transition from {state:?} using event {event:?}")]
    InvalidTransition { state: PipelinePhase, event: PipelineEvent },
    #[error("session is in terminal state {state:?}")]
    TerminalState { state: PipelinePhase },
    #[error("round limit not reached: round {round} of {max_rounds}")]
    RoundLimitNotReached { round: u32, max_rounds: u32 },
}

fn transition_research(
    current: &PipelinePhase,
    event: &PipelineEvent,
    context: &FlowContext,
) -> Result<TransitionOutcome, FlowTransitionError> {
    use PipelineAction::{
        AwaitClarification, Halt, RunAgentSelect, RunDialogueRound, RunResearch, RunSynthesis,
    };
    use PipelineEvent::{
        AgentsSelected, CancelRequested, ClarificationReceived, ClarificationRequested,
        ContinueApproved, DialogueConcluded, PhaseFailed, RealignRequired, ResearchCompleted,
        RoundLimitReached, ScopeClarified, SynthesisCompleted,
    };
    use PipelinePhase::{
        Aborted, AgentSelecting, Clarifying, Complete, Dialoguing, NeedsClarification,
        Researching, Synthesizing,
    };

    if current.is_terminal() {
        return Err(FlowTransitionError::TerminalState { state: current.clone() });
    }

    let (to, actions) = match (current, event) {
        (Clarifying, ScopeClarified) => (Researching, vec![RunResearch]),
        (Researching, ResearchCompleted) => (AgentSelecting, vec![RunAgentSelect]),
        (AgentSelecting, AgentsSelected) => {
            (Dialoguing { round: 1 }, vec![RunDialogueRound { round: 1 }])
        }
        (Dialoguing { round }, ContinueApproved) => {
            if *round < context.max_rounds {
                let next = round + 1;
                (Dialoguing { round: next }, vec![RunDialogueRound { round: next }])
            } else {
                (Synthesizing, vec![RunSynthesis])
            }
        }
        (Dialoguing { round }, RoundLimitReached) => {
            if *round < context.max_rounds {
                return Err(FlowTransitionError::RoundLimitNotReached {
                    round: *round,
                    max_rounds: context.max_rounds,
                });
            }
            (Synthesizing, vec![RunSynthesis])
        }
        (Dialoguing { round }, ClarificationRequested) => {
            (NeedsClarification { round: *round }, vec![AwaitClarification])
        }
        (Dialoguing { .. }, DialogueConcluded) | (Dialoguing { .. }, RealignRequired) => {
            (Synthesizing, vec![RunSynthesis])
        }
        (NeedsClarification { round }, ClarificationReceived) => {
            (Dialoguing { round: *round }, vec![RunDialogueRound { round: *round }])
        }
        (Synthesizing, SynthesisCompleted) => (Complete, vec![Halt]),
        (_, PhaseFailed { .. }) | (_, CancelRequested) => (Aborted, vec![Halt]),
        _ => {
            return Err(FlowTransitionError::InvalidTransition {
                state: current.clone(),
                event: event.clone(),
            });
        }
    };

    Ok(TransitionOutcome { from: current.clone(), to, event: event.clone(), actions })
}

#[cfg(test)]
mod tests {
    use crate::audit::{AuditContext, InMemoryAuditSink};
    use crate::domain::session::SessionId;
    use crate::flows::engine::{FlowEngine, FlowTransitionError, ResearchFlow};
    use crate::flows::states::{FlowContext, PipelineAction, PipelineEvent, PipelinePhase};
    use crate::gateway::FailureKind;

    fn context(max_rounds: u32) -> FlowContext {
        FlowContext { max_rounds }
    }

    fn into_dialogue(engine: &FlowEngine<ResearchFlow>, ctx: &FlowContext) -> PipelinePhase {
        let mut state = engine.initial_state();
        for event in [
            PipelineEvent::ScopeClarified,
            PipelineEvent::ResearchCompleted,
            PipelineEvent::AgentsSelected,
        ] {
            state = engine.apply(&state, &event, ctx).expect("forward progress").to;
        }
        state
    }

    #[test]
    fn happy_path_runs_exactly_max_rounds_then_synthesizes() {
        let engine = FlowEngine::default();
        let ctx = context(3);
        let mut state = into_dialogue(&engine, &ctx);
        assert_eq!(state, PipelinePhase::Dialoguing { round: 1 });

        let mut rounds_seen = vec![1];
        while let PipelinePhase::Dialoguing { .. } = state {
            state =
                engine.apply(&state, &PipelineEvent::ContinueApproved, &ctx).expect("continue").to;
            if let Some(round) = state.round() {
                rounds_seen.push(round);
            }
        }

        assert_eq!(rounds_seen, vec![1, 2, 3]);
        assert_eq!(state, PipelinePhase::Synthesizing);

        let done = engine
            .apply(&state, &PipelineEvent::SynthesisCompleted, &ctx)
            .expect("synthesis completes");
        assert_eq!(done.to, PipelinePhase::Complete);
        assert_eq!(done.actions, vec![PipelineAction::Halt]);
    }

    #[test]
    fn clarification_freezes_round_and_resumes_same_round() {
        let engine = FlowEngine::default();
        let ctx = context(3);
        let round_one = into_dialogue(&engine, &ctx);
        let round_two =
            engine.apply(&round_one, &PipelineEvent::ContinueApproved, &ctx).expect("next").to;

        let paused = engine
            .apply(&round_two, &PipelineEvent::ClarificationRequested, &ctx)
            .expect("pause for user");
        assert_eq!(paused.to, PipelinePhase::NeedsClarification { round: 2 });
        assert_eq!(paused.actions, vec![PipelineAction::AwaitClarification]);

        let resumed = engine
            .apply(&paused.to, &PipelineEvent::ClarificationReceived, &ctx)
            .expect("resume");
        assert_eq!(resumed.to, PipelinePhase::Dialoguing { round: 2 });
        assert_eq!(resumed.actions, vec![PipelineAction::RunDialogueRound { round: 2 }]);
    }

    #[test]
    fn round_limit_is_rejected_before_max() {
        let engine = FlowEngine::default();
        let ctx = context(3);
        let state = into_dialogue(&engine, &ctx);

        let error = engine
            .apply(&state, &PipelineEvent::RoundLimitReached, &ctx)
            .expect_err("round 1 of 3 is not the limit");
        assert_eq!(error, FlowTransitionError::RoundLimitNotReached { round: 1, max_rounds: 3 });

        let at_limit = engine
            .apply(&PipelinePhase::Dialoguing { round: 3 }, &PipelineEvent::RoundLimitReached, &ctx)
            .expect("limit reached");
        assert_eq!(at_limit.to, PipelinePhase::Synthesizing);
    }

    #[test]
    fn realign_and_conclude_skip_to_synthesis() {
        let engine = FlowEngine::default();
        let ctx = context(5);
        let state = PipelinePhase::Dialoguing { round: 2 };

        for event in [PipelineEvent::RealignRequired, PipelineEvent::DialogueConcluded] {
            let outcome = engine.apply(&state, &event, &ctx).expect("ends dialogue");
            assert_eq!(outcome.to, PipelinePhase::Synthesizing);
        }
    }

    #[test]
    fn failure_or_cancel_aborts_from_any_live_phase() {
        let engine = FlowEngine::default();
        let ctx = context(3);
        let live = [
            PipelinePhase::Clarifying,
            PipelinePhase::Researching,
            PipelinePhase::AgentSelecting,
            PipelinePhase::Dialoguing { round: 2 },
            PipelinePhase::NeedsClarification { round: 2 },
            PipelinePhase::Synthesizing,
        ];

        for phase in &live {
            let failed = engine
                .apply(phase, &PipelineEvent::PhaseFailed { kind: FailureKind::AuthMissing }, &ctx)
                .expect("failure aborts");
            assert_eq!(failed.to, PipelinePhase::Aborted);
            let cancelled =
                engine.apply(phase, &PipelineEvent::CancelRequested, &ctx).expect("cancel aborts");
            assert_eq!(cancelled.to, PipelinePhase::Aborted);
        }
    }

    #[test]
    fn terminal_states_reject_every_event() {
        let engine = FlowEngine::default();
        let ctx = context(3);

        for terminal in [PipelinePhase::Complete, PipelinePhase::Aborted] {
            for event in [
                PipelineEvent::ScopeClarified,
                PipelineEvent::ClarificationReceived,
                PipelineEvent::CancelRequested,
                PipelineEvent::PhaseFailed { kind: FailureKind::Transient },
            ] {
                let error = engine.apply(&terminal, &event, &ctx).expect_err("terminal");
                assert!(matches!(error, FlowTransitionError::TerminalState { .. }));
            }
        }
    }

    #[test]
    fn out_of_order_event_is_invalid() {
        let engine = FlowEngine::default();
        let error = engine
            .apply(&PipelinePhase::Clarifying, &PipelineEvent::AgentsSelected, &context(3))
            .expect_err("cannot skip research");

        assert!(matches!(
            error,
            FlowTransitionError::InvalidTransition {
                state: PipelinePhase::Clarifying,
                event: PipelineEvent::AgentsSelected
            }
        ));
    }

    #[test]
    fn single_round_limit_goes_straight_to_synthesis() {
        let engine = FlowEngine::default();
        let ctx = context(1);
        let state = into_dialogue(&engine, &ctx);

        let outcome =
            engine.apply(&state, &PipelineEvent::ContinueApproved, &ctx).expect("limit of one");
        assert_eq!(outcome.to, PipelinePhase::Synthesizing);
    }

    #[test]
    fn transition_emits_audit_event() {
        let engine = FlowEngine::default();
        let sink = InMemoryAuditSink::default();
        let session_id = SessionId::new();

        let _ = engine
            .apply_with_audit(
                &PipelinePhase::Clarifying,
                &PipelineEvent::ScopeClarified,
                &context(3),
                &sink,
                &AuditContext::new(Some(session_id.clone()), "req-42", "orchestrator"),
            )
            .expect("transition should succeed");
        let _ = engine.apply_with_audit(
            &PipelinePhase::Aborted,
            &PipelineEvent::ScopeClarified,
            &context(3),
            &sink,
            &AuditContext::new(Some(session_id.clone()), "req-43", "orchestrator"),
        );

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].correlation_id, "req-42");
        assert_eq!(events[0].session_id.as_ref(), Some(&session_id));
        assert_eq!(events[0].event_type, "flow.transition_applied");
        assert_eq!(events[0].metadata.get("to").map(String::as_str), Some("researching"));
        assert_eq!(events[1].event_type, "flow.transition_rejected");
    }
}
