use dialectic_core::gateway::{CallFailure, CallGateway, CompletionTask};
use dialectic_core::{Analysis, DeepResearch, ProviderId, ResearchScope};

use crate::llm::complete;
use crate::phases::bullet_list;

const REFINE_SYSTEM: &str = "Rewrite the research scope as a single focused query for a deep \
research engine. Use what the preliminary facts show is still unknown. Reply with the query only.";

const REPORT_SYSTEM: &str = "You are a deep research engine. Produce a thorough, sourced report \
answering the query. Prefer primary sources and state uncertainty explicitly.";

const FACTS_IN_PROMPT: usize = 8;

/// Two calls: refine the query with the general model, then hand it to the
/// deep research provider.
pub async fn execute(
    gateway: &dyn CallGateway,
    llm: &ProviderId,
    deep_research: &ProviderId,
    scope: &ResearchScope,
    analysis: &Analysis,
) -> Result<DeepResearch, CallFailure> {
    let known = analysis
        .facts
        .iter()
        .take(FACTS_IN_PROMPT)
        .map(|fact| format!("{} (confidence {:.2})", fact.statement, fact.confidence))
        .collect::<Vec<_>>();

    let refined = complete(
        gateway,
        llm,
        CompletionTask::RefineQuery,
        REFINE_SYSTEM,
        format!(
            "Scope:\n{}\n\nRequirements:\n{}\n\nPreliminary facts:\n{}",
            scope.intent(),
            bullet_list(&scope.requirements),
            bullet_list(&known)
        ),
    )
    .await?;
    let refined_query = match refined.trim() {
        "" => scope.intent().to_owned(),
        text => text.to_owned(),
    };

    let report = complete(
        gateway,
        deep_research,
        CompletionTask::DeepReport,
        REPORT_SYSTEM,
        format!("Query:\n{refined_query}\n\nAlready established:\n{}", bullet_list(&known)),
    )
    .await?;
    if report.trim().is_empty() {
        return Err(CallFailure::malformed(deep_research, "deep research report was empty"));
    }

    Ok(DeepResearch { refined_query, report: report.trim().to_owned() })
}

#[cfg(test)]
mod tests {
    use dialectic_core::gateway::{CompletionTask, FailureKind, ProviderRequest};
    use dialectic_core::{Analysis, ProviderId, QualitySummary, ResearchScope};

    use super::execute;
    use crate::testing::{ScriptedGateway, ScriptedReply};

    fn inputs() -> (ResearchScope, Analysis) {
        (
            ResearchScope {
                original_query: "q".to_owned(),
                scope: "solid-state battery timelines".to_owned(),
                requirements: Vec::new(),
                clarifying_questions: Vec::new(),
            },
            Analysis {
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
        )
    }

    #[tokio::test]
    async fn report_goes_to_the_deep_research_provider() {
        let gateway = ScriptedGateway::new();
        gateway.push(CompletionTask::RefineQuery, ScriptedReply::text("  "));
        gateway.push(CompletionTask::DeepReport, ScriptedReply::text("long report"));
        let (scope, analysis) = inputs();

        let research = execute(
            &gateway,
            &ProviderId::new("llm"),
            &ProviderId::new("deep"),
            &scope,
            &analysis,
        )
        .await
        .expect("researched");

        assert_eq!(research.refined_query, "solid-state battery timelines");
        assert_eq!(research.report, "long report");
        let calls = gateway.calls();
        assert_eq!(calls[1].provider, ProviderId::new("deep"));
        assert!(matches!(&calls[1].request, ProviderRequest::Completion(request)
            if request.prompt.contains("solid-state battery timelines")));
    }

    #[tokio::test]
    async fn empty_report_is_malformed() {
        let gateway = ScriptedGateway::new();
        gateway.push(CompletionTask::RefineQuery, ScriptedReply::text("refined"));
        gateway.push(CompletionTask::DeepReport, ScriptedReply::text(""));
        let (scope, analysis) = inputs();

        let failure = execute(
            &gateway,
            &ProviderId::new("llm"),
            &ProviderId::new("deep"),
            &scope,
            &analysis,
        )
        .await
        .expect_err("empty report");

        assert_eq!(failure.kind, FailureKind::Malformed);
    }
}
