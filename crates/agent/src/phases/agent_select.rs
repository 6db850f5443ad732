use dialectic_core::gateway::{CallFailure, CallGateway, CompletionTask};
use dialectic_core::{AgentConfig, AgentRole, AgentSelection, ProviderId, ResearchBundle};
use serde::Deserialize;

use crate::llm::complete_json;
use crate::phases::bullet_list;

const SYSTEM: &str = "Design two debate participants for this research topic: an analyst who \
builds the strongest evidence-based answer and a critic who stress-tests it. Reply with a JSON \
object: {\"analyst\": {\"name\": string, \"persona\": string, \"focus\": [string]}, \"critic\": \
{\"name\": string, \"persona\": string, \"focus\": [string]}, \"success_criteria\": [string]}.";

#[derive(Debug, Deserialize)]
struct SelectReply {
    analyst: AgentReply,
    critic: AgentReply,
    #[serde(default)]
    success_criteria: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AgentReply {
    name: String,
    #[serde(default)]
    persona: String,
    #[serde(default)]
    focus: Vec<String>,
}

pub async fn execute(
    gateway: &dyn CallGateway,
    provider: &ProviderId,
    bundle: &ResearchBundle,
) -> Result<AgentSelection, CallFailure> {
    let facts = bundle
        .analysis
        .facts
        .iter()
        .take(10)
        .map(|fact| fact.statement.clone())
        .collect::<Vec<_>>();

    let reply: SelectReply = complete_json(
        gateway,
        provider,
        CompletionTask::SelectAgents,
        SYSTEM,
        format!(
            "Topic:\n{}\n\nKey facts:\n{}\n\nDeep research summary:\n{}",
            bundle.scope.intent(),
            bullet_list(&facts),
            bundle.deep_research.report
        ),
    )
    .await?;

    Ok(AgentSelection {
        analyst: into_config(provider, AgentRole::Analyst, reply.analyst)?,
        critic: into_config(provider, AgentRole::Critic, reply.critic)?,
        success_criteria: reply.success_criteria,
    })
}

fn into_config(
    provider: &ProviderId,
    role: AgentRole,
    reply: AgentReply,
) -> Result<AgentConfig, CallFailure> {
    let name = reply.name.trim();
    if name.is_empty() {
        return Err(CallFailure::malformed(
            provider,
            format!("{} agent has no name", role.as_str()),
        ));
    }
    Ok(AgentConfig {
        role,
        name: name.to_owned(),
        persona: reply.persona.trim().to_owned(),
        focus: reply.focus,
    })
}

#[cfg(test)]
mod tests {
    use dialectic_core::gateway::{CompletionTask, FailureKind};
    use dialectic_core::{
        AgentRole, Analysis, DeepResearch, ProviderId, QualitySummary, ResearchBundle,
        ResearchScope,
    };
    use serde_json::json;

    use super::execute;
    use crate::testing::{ScriptedGateway, ScriptedReply};

    fn bundle() -> ResearchBundle {
        ResearchBundle {
            scope: ResearchScope {
                original_query: "q".to_owned(),
                scope: "scope".to_owned(),
                requirements: Vec::new(),
                clarifying_questions: Vec::new(),
            },
            analysis: Analysis {
                facts: Vec::new(),
                contradictions: Vec::new(),
                quality: QualitySummary {
                    total_hits: 0,
                    distinct_sources: 0,
                    channels_with_results: 0,
                    failed_providers: Vec::new(),
                    average_confidence: 0.0,
                    sourced_fact_ratio: 0.0,
                },
            },
            deep_research: DeepResearch {
                refined_query: "scope".to_owned(),
                report: "report".to_owned(),
            },
        }
    }

    #[tokio::test]
    async fn selection_assigns_fixed_roles() {
        let gateway = ScriptedGateway::happy_path();

        let selection =
            execute(&gateway, &ProviderId::new("llm"), &bundle()).await.expect("selected");

        assert_eq!(selection.analyst.role, AgentRole::Analyst);
        assert_eq!(selection.critic.role, AgentRole::Critic);
        assert_eq!(selection.config_for(AgentRole::Critic).name, "Skeptical Reviewer");
    }

    #[tokio::test]
    async fn nameless_agent_is_malformed() {
        let gateway = ScriptedGateway::new();
        gateway.push(
            CompletionTask::SelectAgents,
            ScriptedReply::json(json!({
                "analyst": { "name": "A" },
                "critic": { "name": " " }
            })),
        );

        let failure =
            execute(&gateway, &ProviderId::new("llm"), &bundle()).await.expect_err("no name");

        assert_eq!(failure.kind, FailureKind::Malformed);
    }
}
