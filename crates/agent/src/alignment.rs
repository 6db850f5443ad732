//! Checks a dialogue round against the user's stated intent before the next
//! round may start.
//!
//! The gate fails closed: anything short of an explicit, well-formed
//! `proceed` keeps the dialogue from continuing.

use std::sync::Arc;

use dialectic_core::gateway::{CallFailure, CallGateway, CompletionTask, FailureKind};
use dialectic_core::{
    AlignmentAction, AlignmentVerdict, ClarificationExchange, DialogueTurn, ProviderId,
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::llm::complete_json;
use crate::phases::bullet_list;

const SYSTEM: &str = "You guard a research debate against drifting from what the user asked. \
Compare the latest round with the user's intent. Use \"proceed\" if it stays on target, \
\"clarify\" if the intent is ambiguous and a question to the user would resolve it, and \
\"realign\" if the debate has drifted. Reply with a JSON object: {\"action\": \
\"proceed\"|\"clarify\"|\"realign\", \"checkpoint_question\": string|null, \"drift_areas\": \
[string]}.";

const DEFAULT_CHECKPOINT_QUESTION: &str =
    "The discussion may be drifting from your request. Could you restate what matters most?";

pub struct AlignmentInput<'a> {
    pub round: u32,
    pub intent: &'a str,
    pub clarifications: &'a [ClarificationExchange],
    pub turns: &'a [DialogueTurn],
}

#[derive(Debug, Deserialize)]
struct AlignmentReply {
    #[serde(default)]
    action: String,
    #[serde(default)]
    checkpoint_question: Option<String>,
    #[serde(default)]
    drift_areas: Vec<String>,
}

pub struct AlignmentGate {
    gateway: Arc<dyn CallGateway>,
    provider: ProviderId,
}

impl AlignmentGate {
    pub fn new(gateway: Arc<dyn CallGateway>, provider: ProviderId) -> Self {
        Self { gateway, provider }
    }

    /// The verdict that drives the session. Only `auth_missing` is returned
    /// as an error; every other failure becomes a realign verdict.
    pub async fn check(&self, input: AlignmentInput<'_>) -> Result<AlignmentVerdict, CallFailure> {
        let round = input.round;
        match self.assess(input).await {
            Ok(verdict) => {
                info!(
                    event_name = "agent.alignment.checked",
                    round,
                    action = verdict.action.as_str(),
                    drift_areas = verdict.drift_areas.len(),
                    "alignment verdict"
                );
                Ok(verdict)
            }
            Err(failure) if failure.kind == FailureKind::AuthMissing => Err(failure),
            Err(failure) => {
                warn!(
                    event_name = "agent.alignment.unverified",
                    round,
                    failure_kind = failure.kind.as_str(),
                    error = %failure.reason,
                    "alignment could not be verified, realigning"
                );
                Ok(AlignmentVerdict::unverified(failure.kind.as_str()))
            }
        }
    }

    /// Strict reading of the model's reply; an unknown action is `Malformed`.
    pub async fn assess(&self, input: AlignmentInput<'_>) -> Result<AlignmentVerdict, CallFailure> {
        let latest = input
            .turns
            .iter()
            .map(|turn| format!("{}: {}", turn.agent.as_str(), turn.content))
            .collect::<Vec<_>>();
        let clarifications = input
            .clarifications
            .iter()
            .map(|exchange| format!("Q: {} A: {}", exchange.question, exchange.answer))
            .collect::<Vec<_>>();

        let reply: AlignmentReply = complete_json(
            self.gateway.as_ref(),
            &self.provider,
            CompletionTask::Align,
            SYSTEM,
            format!(
                "User intent: {}\n\nUser clarifications:\n{}\n\nRound {}:\n{}",
                input.intent,
                bullet_list(&clarifications),
                input.round,
                bullet_list(&latest)
            ),
        )
        .await?;

        let Some(action) = AlignmentAction::parse(&reply.action) else {
            return Err(CallFailure::malformed(
                &self.provider,
                format!("unrecognized alignment action `{}`", reply.action),
            ));
        };

        let checkpoint_question = match action {
            AlignmentAction::Clarify => Some(
                reply
                    .checkpoint_question
                    .map(|question| question.trim().to_owned())
                    .filter(|question| !question.is_empty())
                    .unwrap_or_else(|| DEFAULT_CHECKPOINT_QUESTION.to_owned()),
            ),
            _ => reply.checkpoint_question.filter(|question| !question.trim().is_empty()),
        };

        Ok(AlignmentVerdict { action, checkpoint_question, drift_areas: reply.drift_areas })
    }
}
