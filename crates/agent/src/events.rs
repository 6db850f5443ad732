use dialectic_core::{AbortReason, AlignmentAction, PhaseKind, PipelinePhase, SessionId};
use serde::Serialize;

/// Progress notifications published by the orchestrator while it drives a
/// session. Delivery is best effort; a lagging subscriber loses events.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    PhaseStarted { session_id: SessionId, phase: PhaseKind },
    PhaseCompleted { session_id: SessionId, phase: PhaseKind },
    Progress { session_id: SessionId, state: PipelinePhase, percent: u8 },
    RoundCompleted { session_id: SessionId, round: u32, turns: usize },
    AlignmentChecked { session_id: SessionId, round: u32, action: AlignmentAction },
    ClarificationRequested { session_id: SessionId, round: u32, question: String },
    Completed { session_id: SessionId },
    Aborted { session_id: SessionId, reason: AbortReason },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::PhaseStarted { session_id, .. }
            | Self::PhaseCompleted { session_id, .. }
            | Self::Progress { session_id, .. }
            | Self::RoundCompleted { session_id, .. }
            | Self::AlignmentChecked { session_id, .. }
            | Self::ClarificationRequested { session_id, .. }
            | Self::Completed { session_id }
            | Self::Aborted { session_id, .. } => session_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::PhaseStarted { .. } => "phase_started",
            Self::PhaseCompleted { .. } => "phase_completed",
            Self::Progress { .. } => "progress",
            Self::RoundCompleted { .. } => "round_completed",
            Self::AlignmentChecked { .. } => "alignment_checked",
            Self::ClarificationRequested { .. } => "clarification_requested",
            Self::Completed { .. } => "completed",
            Self::Aborted { .. } => "aborted",
        }
    }
}

#[cfg(test)]
mod tests {
    use dialectic_core::{PhaseKind, SessionId};

    use super::SessionEvent;

    #[test]
    fn events_serialize_with_a_tag() {
        let event = SessionEvent::PhaseStarted {
            session_id: SessionId::from("s-1".to_owned()),
            phase: PhaseKind::DeepResearch,
        };

        let value = serde_json::to_value(&event).expect("serializes");

        assert_eq!(value["event"], "phase_started");
        assert_eq!(value["phase"], "deep_research");
        assert_eq!(event.session_id().as_str(), "s-1");
    }
}
