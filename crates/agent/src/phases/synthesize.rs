use dialectic_core::gateway::{CallFailure, CallGateway, CompletionTask};
use dialectic_core::{
    AgentSelection, ClarificationExchange, DialogueHistory, DialogueOutcome, FinalReport,
    ProviderId, ReportSection, ResearchBundle,
};
use serde::Deserialize;

use crate::llm::complete_json;
use crate::phases::bullet_list;

const SYSTEM: &str = "Write the final research report from the research findings and the full \
debate transcript. Reflect where the debate reached agreement and where it did not. Reply with a \
JSON object: {\"title\": string, \"summary\": string, \"sections\": [{\"heading\": string, \
\"body\": string}], \"key_findings\": [string], \"open_questions\": [string]}.";

pub struct SynthesisInput<'a> {
    pub bundle: &'a ResearchBundle,
    pub agents: &'a AgentSelection,
    pub history: &'a DialogueHistory,
    pub clarifications: &'a [ClarificationExchange],
    pub rounds_completed: u32,
    pub outcome: DialogueOutcome,
    /// Drift flagged by the alignment gate when the dialogue was cut short.
    pub drift_areas: &'a [String],
}

#[derive(Debug, Deserialize)]
struct SynthesisReply {
    #[serde(default)]
    title: String,
    summary: String,
    #[serde(default)]
    sections: Vec<ReportSection>,
    #[serde(default)]
    key_findings: Vec<String>,
    #[serde(default)]
    open_questions: Vec<String>,
}

pub async fn execute(
    gateway: &dyn CallGateway,
    provider: &ProviderId,
    input: SynthesisInput<'_>,
) -> Result<FinalReport, CallFailure> {
    let transcript = input
        .history
        .turns()
        .iter()
        .map(|turn| format!("[round {} | {}] {}", turn.round, turn.agent.as_str(), turn.content))
        .collect::<Vec<_>>();
    let facts = input
        .bundle
        .analysis
        .facts
        .iter()
        .map(|fact| format!("{} [{:.2}]", fact.statement, fact.confidence))
        .collect::<Vec<_>>();
    let clarifications = input
        .clarifications
        .iter()
        .map(|exchange| format!("Q: {} A: {}", exchange.question, exchange.answer))
        .collect::<Vec<_>>();

    let reply: SynthesisReply = complete_json(
        gateway,
        provider,
        CompletionTask::Synthesize,
        SYSTEM,
        format!(
            "Original request: {}\nScope: {}\nDialogue ended: {} after {} round(s).\n\n\
Success criteria:\n{}\n\nFacts:\n{}\n\nDeep research:\n{}\n\nUser clarifications:\n{}\n\n\
Flagged drift:\n{}\n\nTranscript:\n{}",
            input.bundle.scope.original_query,
            input.bundle.scope.intent(),
            input.outcome.as_str(),
            input.rounds_completed,
            bullet_list(&input.agents.success_criteria),
            bullet_list(&facts),
            input.bundle.deep_research.report,
            bullet_list(&clarifications),
            bullet_list(input.drift_areas),
            bullet_list(&transcript),
        ),
    )
    .await?;

    let summary = reply.summary.trim();
    if summary.is_empty() {
        return Err(CallFailure::malformed(provider, "report summary was empty"));
    }
    let title = match reply.title.trim() {
        "" => input.bundle.scope.intent().to_owned(),
        title => title.to_owned(),
    };

    Ok(FinalReport {
        title,
        summary: summary.to_owned(),
        sections: reply.sections,
        key_findings: reply.key_findings,
        open_questions: reply.open_questions,
        rounds_completed: input.rounds_completed,
        dialogue_outcome: input.outcome,
    })
}

#[cfg(test)]
mod tests {
    use dialectic_core::gateway::{CompletionTask, FailureKind};
    use dialectic_core::{
        AgentConfig, AgentRole, AgentSelection, Analysis, DeepResearch, DialogueHistory,
        DialogueOutcome, DialogueTurn, ProviderId, QualitySummary, ResearchBundle, ResearchScope,
    };
    use serde_json::json;

    use super::{execute, SynthesisInput};
    use crate::testing::{ScriptedGateway, ScriptedReply};

    fn bundle() -> ResearchBundle {
        ResearchBundle {
            scope: ResearchScope {
                original_query: "heat pumps in cold climates".to_owned(),
                scope: "heat pump efficiency below -15C".to_owned(),
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
            deep_research: DeepResearch { refined_query: "r".to_owned(), report: "r".to_owned() },
        }
    }

    fn agents() -> AgentSelection {
        let agent = |role: AgentRole| AgentConfig {
            role,
            name: role.as_str().to_owned(),
            persona: String::new(),
            focus: Vec::new(),
        };
        AgentSelection {
            analyst: agent(AgentRole::Analyst),
            critic: agent(AgentRole::Critic),
            success_criteria: Vec::new(),
        }
    }

    #[tokio::test]
    async fn report_carries_outcome_and_full_transcript() {
        let gateway = ScriptedGateway::new();
        gateway.push(
            CompletionTask::Synthesize,
            ScriptedReply::json(json!({ "summary": "COP stays above 1.5" })),
        );
        let bundle = bundle();
        let agents = agents();
        let mut history = DialogueHistory::default();
        for round in 1..=2 {
            history.append(DialogueTurn {
                agent: AgentRole::Analyst,
                round,
                content: format!("claim {round}"),
                confidence: None,
                sources: Vec::new(),
            });
        }

        let report = execute(
            &gateway,
            &ProviderId::new("llm"),
            SynthesisInput {
                bundle: &bundle,
                agents: &agents,
                history: &history,
                clarifications: &[],
                rounds_completed: 2,
                outcome: DialogueOutcome::Realigned,
                drift_areas: &["cost instead of efficiency".to_owned()],
            },
        )
        .await
        .expect("synthesized");

        assert_eq!(report.title, "heat pump efficiency below -15C");
        assert_eq!(report.rounds_completed, 2);
        assert_eq!(report.dialogue_outcome, DialogueOutcome::Realigned);
        let prompt = &gateway.prompts_for_task(CompletionTask::Synthesize)[0];
        assert!(prompt.contains("claim 1") && prompt.contains("claim 2"));
        assert!(prompt.contains("cost instead of efficiency"));
    }

    #[tokio::test]
    async fn missing_summary_is_malformed() {
        let gateway = ScriptedGateway::new();
        gateway.push(CompletionTask::Synthesize, ScriptedReply::json(json!({ "title": "t" })));
        let bundle = bundle();
        let agents = agents();
        let history = DialogueHistory::default();

        let failure = execute(
            &gateway,
            &ProviderId::new("llm"),
            SynthesisInput {
                bundle: &bundle,
                agents: &agents,
                history: &history,
                clarifications: &[],
                rounds_completed: 0,
                outcome: DialogueOutcome::Concluded,
                drift_areas: &[],
            },
        )
        .await
        .expect_err("no summary");

        assert_eq!(failure.kind, FailureKind::Malformed);
    }
}
