use dialectic_core::gateway::{CallFailure, CallGateway, CompletionTask};
use dialectic_core::{
    AgentRole, AgentSelection, ClarificationExchange, DialogueHistory, DialogueTurn, ProviderId,
    ResearchBundle,
};
use serde::Deserialize;

use crate::llm::{complete, parse_json_reply};
use crate::phases::bullet_list;

const TRANSCRIPT_WINDOW: usize = 6;

pub struct DialogueRoundInput<'a> {
    pub round: u32,
    pub max_rounds: u32,
    pub bundle: &'a ResearchBundle,
    pub agents: &'a AgentSelection,
    pub history: &'a DialogueHistory,
    pub clarifications: &'a [ClarificationExchange],
    /// Evaluator feedback from the previous round, if any.
    pub feedback: &'a [String],
}

#[derive(Debug, Deserialize)]
struct TurnReply {
    content: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    sources: Vec<String>,
}

/// One round: every role speaks once, in fixed order, each seeing the turns
/// before it.
pub async fn execute(
    gateway: &dyn CallGateway,
    provider: &ProviderId,
    input: DialogueRoundInput<'_>,
) -> Result<Vec<DialogueTurn>, CallFailure> {
    let mut turns: Vec<DialogueTurn> = Vec::with_capacity(AgentRole::ORDER.len());

    for role in AgentRole::ORDER {
        let agent = input.agents.config_for(role);
        let system = format!(
            "You are {}, the {} in a structured research debate. {} Focus on: {}. \
Respond with a JSON object {{\"content\": string, \"confidence\": number, \"sources\": [string]}}.",
            agent.name,
            role.as_str(),
            agent.persona,
            agent.focus.join(", ")
        );
        let prompt = render_prompt(&input, &turns, role);

        let text = complete(gateway, provider, CompletionTask::DialogueTurn(role), system, prompt)
            .await?;
        turns.push(parse_turn(provider, role, input.round, &text)?);
    }

    Ok(turns)
}

fn parse_turn(
    provider: &ProviderId,
    agent: AgentRole,
    round: u32,
    text: &str,
) -> Result<DialogueTurn, CallFailure> {
    let (content, confidence, sources) = match parse_json_reply::<TurnReply>(provider, text) {
        Ok(reply) => (reply.content, reply.confidence.map(|c| c.clamp(0.0, 1.0)), reply.sources),
        Err(_) => (text.to_owned(), None, Vec::new()),
    };

    let content = content.trim();
    if content.is_empty() {
        return Err(CallFailure::malformed(
            provider,
            format!("{} produced an empty turn", agent.as_str()),
        ));
    }
    Ok(DialogueTurn { agent, round, content: content.to_owned(), confidence, sources })
}

fn render_prompt(input: &DialogueRoundInput<'_>, this_round: &[DialogueTurn], role: AgentRole) -> String {
    let facts = input
        .bundle
        .analysis
        .facts
        .iter()
        .take(10)
        .map(|fact| format!("{} [{:.2}]", fact.statement, fact.confidence))
        .collect::<Vec<_>>();
    let clarifications = input
        .clarifications
        .iter()
        .map(|exchange| format!("Q: {} A: {}", exchange.question, exchange.answer))
        .collect::<Vec<_>>();

    let earlier = input.history.turns();
    let skip = earlier.len().saturating_sub(TRANSCRIPT_WINDOW);
    let transcript = earlier[skip..]
        .iter()
        .chain(this_round.iter())
        .map(|turn| format!("[round {} | {}] {}", turn.round, turn.agent.as_str(), turn.content))
        .collect::<Vec<_>>();

    let task = match role {
        AgentRole::Analyst => "Advance the strongest answer. Address the critic's last objections.",
        AgentRole::Critic => "Challenge the analyst's latest claims. Point to gaps in evidence.",
    };

    format!(
        "Topic: {}\nRound {} of {}.\n\nSuccess criteria:\n{}\n\nKey facts:\n{}\n\n\
User clarifications:\n{}\n\nEvaluator feedback:\n{}\n\nTranscript so far:\n{}\n\n{}",
        input.bundle.scope.intent(),
        input.round,
        input.max_rounds,
        bullet_list(&input.agents.success_criteria),
        bullet_list(&facts),
        bullet_list(&clarifications),
        bullet_list(input.feedback),
        bullet_list(&transcript),
        task
    )
}
