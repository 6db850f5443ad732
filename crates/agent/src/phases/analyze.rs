use std::collections::HashSet;

use dialectic_core::gateway::{CallFailure, CallGateway, CompletionTask};
use dialectic_core::{
    Analysis, Contradiction, Fact, ProviderId, QualitySummary, ResearchScope, SearchResults,
};
use serde::Deserialize;
use tracing::info;

use crate::llm::complete_json;

const SYSTEM: &str = "You extract verifiable facts from search results. For each fact give the \
statement, the URLs that support it and a confidence between 0 and 1. Also list contradictions \
between sources. Reply with a JSON object: {\"facts\": [{\"statement\": string, \"sources\": \
[string], \"confidence\": number}], \"contradictions\": [{\"topic\": string, \"claims\": \
[string]}]}.";

#[derive(Debug, Default, Deserialize)]
struct AnalyzeReply {
    #[serde(default)]
    facts: Vec<FactReply>,
    #[serde(default)]
    contradictions: Vec<Contradiction>,
}

#[derive(Debug, Deserialize)]
struct FactReply {
    statement: String,
    #[serde(default)]
    sources: Vec<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

pub async fn execute(
    gateway: &dyn CallGateway,
    provider: &ProviderId,
    scope: &ResearchScope,
    results: &SearchResults,
    facts_limit: usize,
) -> Result<Analysis, CallFailure> {
    if results.total_hits() == 0 {
        info!(
            event_name = "agent.analyze.skipped",
            query = %results.query,
            "no search hits to analyze"
        );
        return Ok(build_analysis(results, Vec::new(), Vec::new()));
    }

    let reply: AnalyzeReply = complete_json(
        gateway,
        provider,
        CompletionTask::Analyze,
        SYSTEM,
        format!("Research scope:\n{}\n\nSearch results:\n{}", scope.intent(), render(results)),
    )
    .await?;

    let facts = rank_facts(reply.facts, facts_limit);
    let contradictions = reply
        .contradictions
        .into_iter()
        .filter(|contradiction| contradiction.claims.len() >= 2)
        .collect();
    Ok(build_analysis(results, facts, contradictions))
}

/// Highest confidence first, better-sourced facts break ties, duplicates and
/// blank statements dropped.
fn rank_facts(raw: Vec<FactReply>, limit: usize) -> Vec<Fact> {
    let mut facts = raw
        .into_iter()
        .filter_map(|fact| {
            let statement = fact.statement.trim().to_owned();
            if statement.is_empty() {
                return None;
            }
            let confidence = fact.confidence.unwrap_or(0.5);
            let confidence = if confidence.is_finite() { confidence.clamp(0.0, 1.0) } else { 0.0 };
            Some(Fact { statement, sources: fact.sources, confidence })
        })
        .collect::<Vec<_>>();

    facts.sort_by(|left, right| {
        right
            .confidence
            .total_cmp(&left.confidence)
            .then_with(|| right.sources.len().cmp(&left.sources.len()))
    });

    let mut seen = HashSet::new();
    facts.retain(|fact| seen.insert(fact.statement.to_lowercase()));
    facts.truncate(limit);
    facts
}

fn build_analysis(
    results: &SearchResults,
    facts: Vec<Fact>,
    contradictions: Vec<Contradiction>,
) -> Analysis {
    let average_confidence = if facts.is_empty() {
        0.0
    } else {
        facts.iter().map(|fact| fact.confidence).sum::<f32>() / facts.len() as f32
    };
    let sourced_fact_ratio = if facts.is_empty() {
        0.0
    } else {
        facts.iter().filter(|fact| !fact.sources.is_empty()).count() as f32 / facts.len() as f32
    };

    let quality = QualitySummary {
        total_hits: results.total_hits(),
        distinct_sources: results.distinct_urls().len(),
        channels_with_results: results
            .channels
            .iter()
            .filter(|channel| !channel.hits.is_empty())
            .count(),
        failed_providers: results
            .failed_providers()
            .into_iter()
            .map(|(provider, _)| provider.clone())
            .collect(),
        average_confidence,
        sourced_fact_ratio,
    };

    Analysis { facts, contradictions, quality }
}

fn render(results: &SearchResults) -> String {
    results
        .channels
        .iter()
        .flat_map(|channel| {
            channel.hits.iter().map(move |hit| {
                format!("[{}] {} ({})\n{}", channel.channel, hit.title, hit.url, hit.snippet)
            })
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use dialectic_core::gateway::{CompletionTask, FailureKind};
    use dialectic_core::{
        ChannelResults, ProviderId, ResearchScope, SearchChannel, SearchHit, SearchResults,
    };
    use serde_json::json;

    use super::execute;
    use crate::testing::{ScriptedGateway, ScriptedReply};

    fn scope() -> ResearchScope {
        ResearchScope {
            original_query: "q".to_owned(),
            scope: "scope".to_owned(),
            requirements: Vec::new(),
            clarifying_questions: Vec::new(),
        }
    }

    fn results(hits: usize) -> SearchResults {
        SearchResults {
            query: "scope".to_owned(),
            channels: vec![
                ChannelResults {
                    channel: SearchChannel::Web,
                    provider: ProviderId::new("web"),
                    hits: (0..hits)
                        .map(|n| SearchHit {
                            title: format!("t{n}"),
                            url: format!("https://example.com/{}", n % 2),
                            snippet: "s".to_owned(),
                            published: None,
                        })
                        .collect(),
                    failure: None,
                },
                ChannelResults {
                    channel: SearchChannel::Social,
                    provider: ProviderId::new("social"),
                    hits: Vec::new(),
                    failure: Some(FailureKind::Transient),
                },
            ],
        }
    }

    #[tokio::test]
    async fn no_hits_skips_the_model() {
        let gateway = ScriptedGateway::new();

        let analysis = execute(&gateway, &ProviderId::new("llm"), &scope(), &results(0), 10)
            .await
            .expect("analysis without hits");

        assert!(analysis.facts.is_empty());
        assert_eq!(analysis.quality.total_hits, 0);
        assert_eq!(analysis.quality.failed_providers, vec![ProviderId::new("social")]);
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn facts_are_ranked_deduplicated_and_limited() {
        let gateway = ScriptedGateway::new();
        gateway.push(
            CompletionTask::Analyze,
            ScriptedReply::json(json!({
                "facts": [
                    { "statement": "low", "sources": [], "confidence": 0.2 },
                    { "statement": "tied, unsourced", "sources": [], "confidence": 0.8 },
                    { "statement": "tied, sourced", "sources": ["a", "b"], "confidence": 0.8 },
                    { "statement": "Tied, Sourced", "sources": [], "confidence": 0.1 },
                    { "statement": "overconfident", "sources": ["a"], "confidence": 3.0 },
                    { "statement": "   ", "confidence": 0.9 }
                ],
                "contradictions": [
                    { "topic": "one-sided", "claims": ["only"] },
                    { "topic": "real", "claims": ["a", "b"] }
                ]
            })),
        );

        let analysis = execute(&gateway, &ProviderId::new("llm"), &scope(), &results(3), 3)
            .await
            .expect("analysis");

        let statements =
            analysis.facts.iter().map(|fact| fact.statement.as_str()).collect::<Vec<_>>();
        assert_eq!(statements, vec!["overconfident", "tied, sourced", "tied, unsourced"]);
        assert_eq!(analysis.facts[0].confidence, 1.0);
        assert_eq!(analysis.contradictions.len(), 1);
        assert_eq!(analysis.quality.total_hits, 3);
        assert_eq!(analysis.quality.distinct_sources, 2);
        assert_eq!(analysis.quality.channels_with_results, 1);
    }
}
