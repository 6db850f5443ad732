use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::domain::dialogue::{AgentRole, DialogueOutcome};
use crate::domain::provider::{ProviderId, SearchChannel};
use crate::gateway::FailureKind;

/// Output of the clarify phase: what the user actually wants researched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResearchScope {
    pub original_query: String,
    pub scope: String,
    pub requirements: Vec<String>,
    pub clarifying_questions: Vec<String>,
}

impl ResearchScope {
    /// The statement of intent that dialogue rounds are checked against.
    pub fn intent(&self) -> &str {
        if self.scope.trim().is_empty() {
            &self.original_query
        } else {
            &self.scope
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub published: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelResults {
    pub channel: SearchChannel,
    pub provider: ProviderId,
    pub hits: Vec<SearchHit>,
    /// Set when the provider failed; its hits are then empty.
    pub failure: Option<FailureKind>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResults {
    pub query: String,
    pub channels: Vec<ChannelResults>,
}

impl SearchResults {
    pub fn total_hits(&self) -> usize {
        self.channels.iter().map(|channel| channel.hits.len()).sum()
    }

    pub fn distinct_urls(&self) -> BTreeSet<&str> {
        self.channels
            .iter()
            .flat_map(|channel| channel.hits.iter().map(|hit| hit.url.as_str()))
            .filter(|url| !url.is_empty())
            .collect()
    }

    pub fn failed_providers(&self) -> Vec<(&ProviderId, FailureKind)> {
        self.channels
            .iter()
            .filter_map(|channel| channel.failure.map(|kind| (&channel.provider, kind)))
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub statement: String,
    pub sources: Vec<String>,
    /// Clamped to `0.0..=1.0`.
    pub confidence: f32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contradiction {
    pub topic: String,
    pub claims: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QualitySummary {
    pub total_hits: usize,
    pub distinct_sources: usize,
    pub channels_with_results: usize,
    pub failed_providers: Vec<ProviderId>,
    pub average_confidence: f32,
    pub sourced_fact_ratio: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    /// Ranked, highest confidence first.
    pub facts: Vec<Fact>,
    pub contradictions: Vec<Contradiction>,
    pub quality: QualitySummary,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeepResearch {
    pub refined_query: String,
    pub report: String,
}

/// Everything the research phases produced, handed to agent selection and dialogue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResearchBundle {
    pub scope: ResearchScope,
    pub analysis: Analysis,
    pub deep_research: DeepResearch,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub role: AgentRole,
    pub name: String,
    pub persona: String,
    pub focus: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSelection {
    pub analyst: AgentConfig,
    pub critic: AgentConfig,
    pub success_criteria: Vec<String>,
}

impl AgentSelection {
    pub fn config_for(&self, role: AgentRole) -> &AgentConfig {
        match role {
            AgentRole::Analyst => &self.analyst,
            AgentRole::Critic => &self.critic,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSection {
    pub heading: String,
    pub body: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalReport {
    pub title: String,
    pub summary: String,
    pub sections: Vec<ReportSection>,
    pub key_findings: Vec<String>,
    pub open_questions: Vec<String>,
    pub rounds_completed: u32,
    pub dialogue_outcome: DialogueOutcome,
}
