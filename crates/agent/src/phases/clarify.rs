use dialectic_core::gateway::{CallFailure, CallGateway, CompletionTask};
use dialectic_core::{ProviderId, ResearchScope};
use serde::Deserialize;

use crate::llm::complete_json;

const SYSTEM: &str = "You scope research requests. Restate what the user wants researched as a \
precise scope, list concrete requirements, and list any questions that would change the scope. \
Reply with a JSON object: {\"scope\": string, \"requirements\": [string], \
\"clarifying_questions\": [string]}.";

#[derive(Debug, Deserialize)]
struct ClarifyReply {
    #[serde(default)]
    scope: String,
    #[serde(default)]
    requirements: Vec<String>,
    #[serde(default)]
    clarifying_questions: Vec<String>,
}

pub async fn execute(
    gateway: &dyn CallGateway,
    provider: &ProviderId,
    query: &str,
) -> Result<ResearchScope, CallFailure> {
    let reply: ClarifyReply = complete_json(
        gateway,
        provider,
        CompletionTask::Clarify,
        SYSTEM,
        format!("Research request:\n{query}"),
    )
    .await?;

    let scope = reply.scope.trim();
    Ok(ResearchScope {
        original_query: query.to_owned(),
        scope: if scope.is_empty() { query.to_owned() } else { scope.to_owned() },
        requirements: non_empty(reply.requirements),
        clarifying_questions: non_empty(reply.clarifying_questions),
    })
}

fn non_empty(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|item| item.trim().to_owned())
        .filter(|item| !item.is_empty())
        .collect()
}
