use serde::{Deserialize, Serialize};

/// The two fixed dialogue participants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Analyst,
    Critic,
}

impl AgentRole {
    /// Speaking order within a round.
    pub const ORDER: [AgentRole; 2] = [AgentRole::Analyst, AgentRole::Critic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyst => "analyst",
            Self::Critic => "critic",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DialogueTurn {
    pub agent: AgentRole,
    pub round: u32,
    pub content: String,
    pub confidence: Option<f32>,
    pub sources: Vec<String>,
}

/// Append-only record of every turn spoken in a session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DialogueHistory {
    turns: Vec<DialogueTurn>,
}

impl DialogueHistory {
    pub fn append(&mut self, turn: DialogueTurn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[DialogueTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn turns_for_round(&self, round: u32) -> impl Iterator<Item = &DialogueTurn> {
        self.turns.iter().filter(move |turn| turn.round == round)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentAction {
    Proceed,
    Clarify,
    Realign,
}

impl AlignmentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proceed => "proceed",
            Self::Clarify => "clarify",
            Self::Realign => "realign",
        }
    }

    /// Strict vocabulary; anything else is not an action.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "proceed" => Some(Self::Proceed),
            "clarify" => Some(Self::Clarify),
            "realign" => Some(Self::Realign),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentVerdict {
    pub action: AlignmentAction,
    pub checkpoint_question: Option<String>,
    pub drift_areas: Vec<String>,
}

impl AlignmentVerdict {
    /// Verdict used when alignment could not be verified at all.
    pub fn unverified(reason: impl Into<String>) -> Self {
        Self {
            action: AlignmentAction::Realign,
            checkpoint_question: None,
            drift_areas: vec![format!("alignment could not be verified: {}", reason.into())],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationDecision {
    Continue,
    Conclude,
    Clarify,
    /// The judgment carried no recognizable decision.
    Hold,
}

impl EvaluationDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Conclude => "conclude",
            Self::Clarify => "clarify",
            Self::Hold => "hold",
        }
    }

    /// Maps the recognized vocabulary; `hold` is never accepted from input.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "continue" => Some(Self::Continue),
            "conclude" => Some(Self::Conclude),
            "clarify" => Some(Self::Clarify),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub decision: EvaluationDecision,
    pub rationale: String,
    pub feedback: Vec<String>,
    pub questions: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationExchange {
    pub round: u32,
    pub question: String,
    pub answer: String,
}

/// Why the dialogue stopped and synthesis began.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogueOutcome {
    Concluded,
    RoundLimit,
    Realigned,
    EvaluationUnavailable,
}

impl DialogueOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Concluded => "concluded",
            Self::RoundLimit => "round_limit",
            Self::Realigned => "realigned",
            Self::EvaluationUnavailable => "evaluation_unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AgentRole, AlignmentAction, AlignmentVerdict, DialogueHistory, DialogueTurn,
        EvaluationDecision,
    };

    fn turn(agent: AgentRole, round: u32) -> DialogueTurn {
        DialogueTurn {
            agent,
            round,
            content: format!("{} speaks in round {round}", agent.as_str()),
            confidence: None,
            sources: Vec::new(),
        }
    }

    #[test]
    fn history_keeps_append_order_and_filters_by_round() {
        let mut history = DialogueHistory::default();
        history.append(turn(AgentRole::Analyst, 1));
        history.append(turn(AgentRole::Critic, 1));
        history.append(turn(AgentRole::Analyst, 2));

        assert_eq!(history.len(), 3);
        assert_eq!(history.turns()[2].round, 2);
        assert_eq!(history.turns_for_round(1).count(), 2);
    }

    #[test]
    fn alignment_vocabulary_is_closed() {
        assert_eq!(AlignmentAction::parse("PROCEED"), Some(AlignmentAction::Proceed));
        assert_eq!(AlignmentAction::parse(" realign\n"), Some(AlignmentAction::Realign));
        assert_eq!(AlignmentAction::parse("looks fine, carry on"), None);
    }

    #[test]
    fn evaluation_vocabulary_never_yields_hold() {
        assert_eq!(EvaluationDecision::parse("Conclude"), Some(EvaluationDecision::Conclude));
        assert_eq!(EvaluationDecision::parse("hold"), None);
        assert_eq!(EvaluationDecision::parse("continue please"), None);
    }

    #[test]
    fn unverified_verdict_realigns() {
        let verdict = AlignmentVerdict::unverified("timeout");
        assert_eq!(verdict.action, AlignmentAction::Realign);
        assert!(verdict.drift_areas[0].contains("timeout"));
    }
}
