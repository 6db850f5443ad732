//! Phase executors.
//!
//! Each executor receives exactly the inputs its phase needs and returns a
//! typed output or a classified failure. None of them touch session state;
//! the orchestrator records what they return.

pub mod agent_select;
pub mod analyze;
pub mod clarify;
pub mod deep_research;
pub mod dialogue;
pub mod search;
pub mod synthesize;

use std::sync::Arc;

use dialectic_core::config::AppConfig;
use dialectic_core::gateway::{CallFailure, CallGateway};
use dialectic_core::{
    AgentSelection, Analysis, DeepResearch, DialogueTurn, FinalReport, PhaseFailure, PhaseKind,
    ProviderId, ResearchScope, SearchChannel, SearchResults,
};

pub use dialogue::DialogueRoundInput;
pub use synthesize::SynthesisInput;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchTarget {
    pub channel: SearchChannel,
    pub provider: ProviderId,
}

/// Which provider serves which phase, plus per-phase limits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseRoles {
    pub llm: ProviderId,
    pub deep_research: ProviderId,
    pub search: Vec<SearchTarget>,
    pub search_max_results: usize,
    pub facts_limit: usize,
}

impl PhaseRoles {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            llm: ProviderId::new(config.roles.llm.clone()),
            deep_research: ProviderId::new(config.roles.deep_research.clone()),
            search: config
                .roles
                .search
                .iter()
                .map(|route| SearchTarget {
                    channel: route.channel,
                    provider: ProviderId::new(route.provider.clone()),
                })
                .collect(),
            search_max_results: config.pipeline.search_max_results,
            facts_limit: config.pipeline.facts_limit,
        }
    }
}

impl Default for PhaseRoles {
    fn default() -> Self {
        Self {
            llm: ProviderId::new("llm"),
            deep_research: ProviderId::new("deep_research"),
            search: [
                (SearchChannel::Web, "web"),
                (SearchChannel::Academic, "academic"),
                (SearchChannel::Social, "social"),
            ]
            .into_iter()
            .map(|(channel, provider)| SearchTarget { channel, provider: ProviderId::new(provider) })
            .collect(),
            search_max_results: 8,
            facts_limit: 20,
        }
    }
}

#[derive(Clone)]
pub struct PhaseExecutors {
    gateway: Arc<dyn CallGateway>,
    roles: PhaseRoles,
}

impl PhaseExecutors {
    pub fn new(gateway: Arc<dyn CallGateway>, roles: PhaseRoles) -> Self {
        Self { gateway, roles }
    }

    pub fn gateway(&self) -> &Arc<dyn CallGateway> {
        &self.gateway
    }

    pub fn roles(&self) -> &PhaseRoles {
        &self.roles
    }

    pub async fn clarify(&self, query: &str) -> Result<ResearchScope, PhaseFailure> {
        clarify::execute(self.gateway.as_ref(), &self.roles.llm, query)
            .await
            .map_err(at(PhaseKind::Clarify))
    }

    pub async fn search(&self, scope: &ResearchScope) -> Result<SearchResults, PhaseFailure> {
        search::execute(
            self.gateway.as_ref(),
            &self.roles.search,
            scope,
            self.roles.search_max_results,
        )
        .await
        .map_err(at(PhaseKind::Search))
    }

    pub async fn analyze(
        &self,
        scope: &ResearchScope,
        results: &SearchResults,
    ) -> Result<Analysis, PhaseFailure> {
        analyze::execute(
            self.gateway.as_ref(),
            &self.roles.llm,
            scope,
            results,
            self.roles.facts_limit,
        )
        .await
        .map_err(at(PhaseKind::Analyze))
    }

    pub async fn deep_research(
        &self,
        scope: &ResearchScope,
        analysis: &Analysis,
    ) -> Result<DeepResearch, PhaseFailure> {
        deep_research::execute(
            self.gateway.as_ref(),
            &self.roles.llm,
            &self.roles.deep_research,
            scope,
            analysis,
        )
        .await
        .map_err(at(PhaseKind::DeepResearch))
    }

    pub async fn select_agents(
        &self,
        bundle: &dialectic_core::ResearchBundle,
    ) -> Result<AgentSelection, PhaseFailure> {
        agent_select::execute(self.gateway.as_ref(), &self.roles.llm, bundle)
            .await
            .map_err(at(PhaseKind::AgentSelect))
    }

    pub async fn dialogue_round(
        &self,
        input: DialogueRoundInput<'_>,
    ) -> Result<Vec<DialogueTurn>, PhaseFailure> {
        dialogue::execute(self.gateway.as_ref(), &self.roles.llm, input)
            .await
            .map_err(at(PhaseKind::DialogueRound))
    }

    pub async fn synthesize(&self, input: SynthesisInput<'_>) -> Result<FinalReport, PhaseFailure> {
        synthesize::execute(self.gateway.as_ref(), &self.roles.llm, input)
            .await
            .map_err(at(PhaseKind::Synthesize))
    }
}

fn at(phase: PhaseKind) -> impl Fn(CallFailure) -> PhaseFailure {
    move |failure| PhaseFailure::new(phase, failure)
}

/// Bullet list for prompts; `(none)` when empty.
pub(crate) fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "(none)".to_owned();
    }
    items.iter().map(|item| format!("- {item}")).collect::<Vec<_>>().join("\n")
}
