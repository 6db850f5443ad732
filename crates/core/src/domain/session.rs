use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::dialogue::{
    AlignmentVerdict, ClarificationExchange, DialogueHistory, DialogueOutcome, DialogueTurn,
    Evaluation,
};
use crate::domain::research::{
    AgentSelection, Analysis, DeepResearch, FinalReport, QualitySummary, ResearchBundle,
    ResearchScope, SearchResults,
};
use crate::errors::DomainError;
use crate::flows::{PipelinePhase, TransitionOutcome};
use crate::gateway::FailureKind;

pub const MIN_ROUNDS: u32 = 1;
pub const MAX_ROUNDS: u32 = 15;
pub const DEFAULT_MAX_ROUNDS: u32 = 3;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Clarify,
    Search,
    Analyze,
    DeepResearch,
    AgentSelect,
    DialogueRound,
    Evaluate,
    AlignmentCheck,
    ClarificationAnswer,
    Synthesize,
}

impl PhaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clarify => "clarify",
            Self::Search => "search",
            Self::Analyze => "analyze",
            Self::DeepResearch => "deep_research",
            Self::AgentSelect => "agent_select",
            Self::DialogueRound => "dialogue_round",
            Self::Evaluate => "evaluate",
            Self::AlignmentCheck => "alignment_check",
            Self::ClarificationAnswer => "clarification_answer",
            Self::Synthesize => "synthesize",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output", rename_all = "snake_case")]
pub enum PhaseOutput {
    Clarified(ResearchScope),
    Searched(SearchResults),
    Analyzed(Analysis),
    DeepResearched(DeepResearch),
    AgentsSelected(AgentSelection),
    RoundCompleted { round: u32, turns: Vec<DialogueTurn> },
    Evaluated { round: u32, evaluation: Evaluation },
    AlignmentChecked { round: u32, verdict: AlignmentVerdict },
    ClarificationAnswered(ClarificationExchange),
    Synthesized(FinalReport),
}

impl PhaseOutput {
    pub fn kind(&self) -> PhaseKind {
        match self {
            Self::Clarified(_) => PhaseKind::Clarify,
            Self::Searched(_) => PhaseKind::Search,
            Self::Analyzed(_) => PhaseKind::Analyze,
            Self::DeepResearched(_) => PhaseKind::DeepResearch,
            Self::AgentsSelected(_) => PhaseKind::AgentSelect,
            Self::RoundCompleted { .. } => PhaseKind::DialogueRound,
            Self::Evaluated { .. } => PhaseKind::Evaluate,
            Self::AlignmentChecked { .. } => PhaseKind::AlignmentCheck,
            Self::ClarificationAnswered(_) => PhaseKind::ClarificationAnswer,
            Self::Synthesized(_) => PhaseKind::Synthesize,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub kind: PhaseKind,
    pub output: PhaseOutput,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum AbortReason {
    Failure { phase: PhaseKind, kind: FailureKind, reason: String },
    Cancelled,
}

/// One research run. Fields are private so that every mutation goes through
/// methods that keep the log, history and phase consistent.
#[derive(Clone, Debug)]
pub struct ResearchSession {
    id: SessionId,
    query: String,
    phase: PipelinePhase,
    log: Vec<PhaseRecord>,
    round: u32,
    max_rounds: u32,
    history: DialogueHistory,
    last_verdict: Option<AlignmentVerdict>,
    clarifications: Vec<ClarificationExchange>,
    pending_question: Option<String>,
    abort: Option<AbortReason>,
    dialogue_outcome: Option<DialogueOutcome>,
    progress: u8,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ResearchSession {
    pub fn new(
        query: impl Into<String>,
        max_rounds: u32,
        initial_phase: PipelinePhase,
    ) -> Result<Self, DomainError> {
        let query = query.into();
        if query.trim().is_empty() {
            return Err(DomainError::EmptyQuery);
        }
        if !(MIN_ROUNDS..=MAX_ROUNDS).contains(&max_rounds) {
            return Err(DomainError::InvalidRoundLimit {
                value: max_rounds,
                min: MIN_ROUNDS,
                max: MAX_ROUNDS,
            });
        }

        let now = Utc::now();
        Ok(Self {
            id: SessionId::new(),
            query: query.trim().to_owned(),
            phase: initial_phase,
            log: Vec::new(),
            round: 0,
            max_rounds,
            history: DialogueHistory::default(),
            last_verdict: None,
            clarifications: Vec::new(),
            pending_question: None,
            abort: None,
            dialogue_outcome: None,
            progress: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn phase(&self) -> &PipelinePhase {
        &self.phase
    }

    pub fn log(&self) -> &[PhaseRecord] {
        &self.log
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    pub fn history(&self) -> &DialogueHistory {
        &self.history
    }

    pub fn last_verdict(&self) -> Option<&AlignmentVerdict> {
        self.last_verdict.as_ref()
    }

    pub fn clarifications(&self) -> &[ClarificationExchange] {
        &self.clarifications
    }

    pub fn pending_question(&self) -> Option<&str> {
        self.pending_question.as_deref()
    }

    pub fn abort_reason(&self) -> Option<&AbortReason> {
        self.abort.as_ref()
    }

    pub fn dialogue_outcome(&self) -> Option<DialogueOutcome> {
        self.dialogue_outcome
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn last_output(&self) -> Option<&PhaseOutput> {
        self.log.last().map(|record| &record.output)
    }

    /// Appends a phase output. Dialogue turns also land in the history,
    /// verdicts replace the last verdict.
    pub fn record(&mut self, output: PhaseOutput) -> Result<(), DomainError> {
        if self.is_terminal() {
            return Err(DomainError::InvariantViolation(format!(
                "cannot record {} output on a {} session",
                output.kind(),
                self.phase.label()
            )));
        }

        match &output {
            PhaseOutput::RoundCompleted { turns, .. } => {
                for turn in turns {
                    self.history.append(turn.clone());
                }
            }
            PhaseOutput::AlignmentChecked { verdict, .. } => {
                self.last_verdict = Some(verdict.clone());
            }
            PhaseOutput::ClarificationAnswered(exchange) => {
                self.clarifications.push(exchange.clone());
            }
            _ => {}
        }

        let now = Utc::now();
        self.log.push(PhaseRecord { kind: output.kind(), output, recorded_at: now });
        self.updated_at = now;
        Ok(())
    }

    /// Records the user's answer to the pending question. Only valid while
    /// waiting for clarification.
    pub fn answer_clarification(
        &mut self,
        answer: impl Into<String>,
    ) -> Result<ClarificationExchange, DomainError> {
        let PipelinePhase::NeedsClarification { round } = self.phase else {
            return Err(DomainError::InvariantViolation(format!(
                "session is {}, not awaiting clarification",
                self.phase.label()
            )));
        };
        let answer = answer.into();
        if answer.trim().is_empty() {
            return Err(DomainError::InvariantViolation(
                "clarification answer must not be empty".to_owned(),
            ));
        }

        let exchange = ClarificationExchange {
            round,
            question: self.pending_question.take().unwrap_or_default(),
            answer: answer.trim().to_owned(),
        };
        self.record(PhaseOutput::ClarificationAnswered(exchange.clone()))?;
        Ok(exchange)
    }

    pub fn set_pending_question(&mut self, question: impl Into<String>) {
        self.pending_question = Some(question.into());
        self.updated_at = Utc::now();
    }

    pub fn set_dialogue_outcome(&mut self, outcome: DialogueOutcome) {
        self.dialogue_outcome = Some(outcome);
    }

    /// The first reason wins; later ones are ignored.
    pub fn set_abort_reason(&mut self, reason: AbortReason) {
        if self.abort.is_none() {
            self.abort = Some(reason);
        }
    }

    /// Moves the session to `outcome.to`. The outcome must have been computed
    /// from the session's current phase.
    pub fn apply_transition(&mut self, outcome: &TransitionOutcome) -> Result<(), DomainError> {
        if outcome.from != self.phase {
            return Err(DomainError::InvariantViolation(format!(
                "transition computed from {} but session is {}",
                outcome.from.label(),
                self.phase.label()
            )));
        }

        if outcome.to.label() != self.phase.label() || outcome.to.round() != self.phase.round() {
            self.progress = 0;
        }
        if let Some(round) = outcome.to.round() {
            self.round = round;
        }
        if outcome.to == PipelinePhase::Complete {
            self.progress = 100;
        }
        self.phase = outcome.to.clone();
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Progress within the current phase; never moves backwards.
    pub fn report_progress(&mut self, percent: u8) -> bool {
        let percent = percent.min(100);
        if percent > self.progress {
            self.progress = percent;
            self.updated_at = Utc::now();
            true
        } else {
            false
        }
    }

    pub fn latest_scope(&self) -> Option<&ResearchScope> {
        self.log.iter().rev().find_map(|record| match &record.output {
            PhaseOutput::Clarified(scope) => Some(scope),
            _ => None,
        })
    }

    pub fn latest_analysis(&self) -> Option<&Analysis> {
        self.log.iter().rev().find_map(|record| match &record.output {
            PhaseOutput::Analyzed(analysis) => Some(analysis),
            _ => None,
        })
    }

    pub fn latest_deep_research(&self) -> Option<&DeepResearch> {
        self.log.iter().rev().find_map(|record| match &record.output {
            PhaseOutput::DeepResearched(research) => Some(research),
            _ => None,
        })
    }

    pub fn latest_selection(&self) -> Option<&AgentSelection> {
        self.log.iter().rev().find_map(|record| match &record.output {
            PhaseOutput::AgentsSelected(selection) => Some(selection),
            _ => None,
        })
    }

    pub fn latest_evaluation(&self) -> Option<(u32, &Evaluation)> {
        self.log.iter().rev().find_map(|record| match &record.output {
            PhaseOutput::Evaluated { round, evaluation } => Some((*round, evaluation)),
            _ => None,
        })
    }

    /// Turns of the most recent `RoundCompleted` record for `round`. A round
    /// re-run after a clarification supersedes the earlier record.
    pub fn latest_round_turns(&self, round: u32) -> &[DialogueTurn] {
        self.log
            .iter()
            .rev()
            .find_map(|record| match &record.output {
                PhaseOutput::RoundCompleted { round: recorded, turns } if *recorded == round => {
                    Some(turns.as_slice())
                }
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn report(&self) -> Option<&FinalReport> {
        self.log.iter().rev().find_map(|record| match &record.output {
            PhaseOutput::Synthesized(report) => Some(report),
            _ => None,
        })
    }

    pub fn research_bundle(&self) -> Option<ResearchBundle> {
        Some(ResearchBundle {
            scope: self.latest_scope()?.clone(),
            analysis: self.latest_analysis()?.clone(),
            deep_research: self.latest_deep_research()?.clone(),
        })
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            query: self.query.clone(),
            phase: self.phase.clone(),
            round: self.round,
            max_rounds: self.max_rounds,
            progress: self.progress,
            updated_at: self.updated_at,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            query: self.query.clone(),
            phase: self.phase.clone(),
            round: self.round,
            max_rounds: self.max_rounds,
            progress: self.progress,
            pending_question: self.pending_question.clone(),
            abort: self.abort.clone(),
            dialogue_outcome: self.dialogue_outcome,
            scope: self.latest_scope().cloned(),
            quality: self.latest_analysis().map(|analysis| analysis.quality.clone()),
            history: self.history.turns().to_vec(),
            clarifications: self.clarifications.clone(),
            last_verdict: self.last_verdict.clone(),
            report: self.report().cloned(),
            phases: self
                .log
                .iter()
                .map(|record| PhaseLogEntry { kind: record.kind, recorded_at: record.recorded_at })
                .collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseLogEntry {
    pub kind: PhaseKind,
    pub recorded_at: DateTime<Utc>,
}

/// Read-only view handed to the HTTP and CLI layers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub query: String,
    pub phase: PipelinePhase,
    pub round: u32,
    pub max_rounds: u32,
    pub progress: u8,
    pub pending_question: Option<String>,
    pub abort: Option<AbortReason>,
    pub dialogue_outcome: Option<DialogueOutcome>,
    pub scope: Option<ResearchScope>,
    pub quality: Option<QualitySummary>,
    pub history: Vec<DialogueTurn>,
    pub clarifications: Vec<ClarificationExchange>,
    pub last_verdict: Option<AlignmentVerdict>,
    pub report: Option<FinalReport>,
    pub phases: Vec<PhaseLogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub query: String,
    pub phase: PipelinePhase,
    pub round: u32,
    pub max_rounds: u32,
    pub progress: u8,
    pub updated_at: DateTime<Utc>,
}
