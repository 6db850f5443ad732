use serde::{Deserialize, Serialize};

use crate::gateway::FailureKind;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum PipelinePhase {
    Clarifying,
    /// Search, analysis and deep research run as sub-steps of this phase.
    Researching,
    AgentSelecting,
    Dialoguing { round: u32 },
    NeedsClarification { round: u32 },
    Synthesizing,
    Complete,
    Aborted,
}

impl PipelinePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Aborted)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Clarifying => "clarifying",
            Self::Researching => "researching",
            Self::AgentSelecting => "agent_selecting",
            Self::Dialoguing { .. } => "dialoguing",
            Self::NeedsClarification { .. } => "needs_clarification",
            Self::Synthesizing => "synthesizing",
            Self::Complete => "complete",
            Self::Aborted => "aborted",
        }
    }

    pub fn round(&self) -> Option<u32> {
        match self {
            Self::Dialoguing { round } | Self::NeedsClarification { round } => Some(*round),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    ScopeClarified,
    ResearchCompleted,
    AgentsSelected,
    /// Evaluator said continue and the alignment gate said proceed.
    ContinueApproved,
    ClarificationRequested,
    DialogueConcluded,
    RealignRequired,
    RoundLimitReached,
    ClarificationReceived,
    SynthesisCompleted,
    PhaseFailed { kind: FailureKind },
    CancelRequested,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowContext {
    pub max_rounds: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineAction {
    RunClarify,
    RunResearch,
    RunAgentSelect,
    RunDialogueRound { round: u32 },
    AwaitClarification,
    RunSynthesis,
    Halt,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: PipelinePhase,
    pub to: PipelinePhase,
    pub event: PipelineEvent,
    pub actions: Vec<PipelineAction>,
}
