//! Judges a finished dialogue round: keep going, stop, or ask the user.

use std::sync::Arc;

use dialectic_core::gateway::{CallFailure, CallGateway, CompletionTask};
use dialectic_core::{DialogueTurn, Evaluation, EvaluationDecision, ProviderId};
use serde::Deserialize;
use tracing::{info, warn};

use crate::llm::{complete, parse_json_reply};
use crate::phases::bullet_list;

const SYSTEM: &str = "You moderate a research debate. Decide whether another round would add \
value. Use \"conclude\" when the success criteria are met or the debate is going in circles, \
\"continue\" when important points remain open, and \"clarify\" when only the user can resolve \
an ambiguity. Reply with a JSON object: {\"decision\": \"continue\"|\"conclude\"|\"clarify\", \
\"rationale\": string, \"feedback\": [string], \"questions\": [string]}.";

pub struct EvaluationInput<'a> {
    pub round: u32,
    pub max_rounds: u32,
    pub intent: &'a str,
    pub success_criteria: &'a [String],
    /// Turns of the round being judged, as last recorded.
    pub turns: &'a [DialogueTurn],
}

#[derive(Debug, Default, Deserialize)]
struct EvaluationReply {
    #[serde(default)]
    decision: Option<String>,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    feedback: Vec<String>,
    #[serde(default)]
    questions: Vec<String>,
}

pub struct DialogueEvaluator {
    gateway: Arc<dyn CallGateway>,
    provider: ProviderId,
}

impl DialogueEvaluator {
    pub fn new(gateway: Arc<dyn CallGateway>, provider: ProviderId) -> Self {
        Self { gateway, provider }
    }

    /// Gateway failures are returned; a reply without a recognizable
    /// decision becomes `Hold`.
    pub async fn evaluate(&self, input: EvaluationInput<'_>) -> Result<Evaluation, CallFailure> {
        let transcript = input
            .turns
            .iter()
            .map(|turn| format!("{}: {}", turn.agent.as_str(), turn.content))
            .collect::<Vec<_>>();

        let text = complete(
            self.gateway.as_ref(),
            &self.provider,
            CompletionTask::Evaluate,
            SYSTEM,
            format!(
                "Topic: {}\nRound {} of {} just finished.\n\nSuccess criteria:\n{}\n\n\
This round:\n{}",
                input.intent,
                input.round,
                input.max_rounds,
                bullet_list(input.success_criteria),
                bullet_list(&transcript)
            ),
        )
        .await?;

        let evaluation = interpret(&self.provider, &text);
        info!(
            event_name = "agent.evaluator.decided",
            round = input.round,
            decision = evaluation.decision.as_str(),
            "dialogue round evaluated"
        );
        Ok(evaluation)
    }
}

fn interpret(provider: &ProviderId, text: &str) -> Evaluation {
    let reply = match parse_json_reply::<EvaluationReply>(provider, text) {
        Ok(reply) => reply,
        Err(failure) => {
            warn!(
                event_name = "agent.evaluator.unparseable",
                error = %failure.reason,
                "evaluation reply unparseable, holding"
            );
            return Evaluation {
                decision: EvaluationDecision::Hold,
                rationale: "evaluation reply could not be interpreted".to_owned(),
                feedback: Vec::new(),
                questions: Vec::new(),
            };
        }
    };

    let decision = reply
        .decision
        .as_deref()
        .and_then(EvaluationDecision::parse)
        .unwrap_or(EvaluationDecision::Hold);

    Evaluation {
        decision,
        rationale: reply.rationale,
        feedback: reply.feedback,
        questions: reply
            .questions
            .into_iter()
            .map(|question| question.trim().to_owned())
            .filter(|question| !question.is_empty())
            .collect(),
    }
}
