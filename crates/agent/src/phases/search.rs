use dialectic_core::gateway::{
    CallFailure, CallGateway, FailureKind, ProviderRequest, SearchRequest,
};
use dialectic_core::{ChannelResults, ResearchScope, SearchResults};
use futures::future::join_all;
use tracing::{info, warn};

use crate::llm::invoke_once_retrying;
use crate::phases::SearchTarget;

/// Fans the scoped query out to every search target concurrently.
///
/// A provider that fails contributes zero hits and a failure note, except
/// `auth_missing`, which fails the whole phase.
pub async fn execute(
    gateway: &dyn CallGateway,
    targets: &[SearchTarget],
    scope: &ResearchScope,
    max_results: usize,
) -> Result<SearchResults, CallFailure> {
    let query = scope.intent().to_owned();

    let calls = targets.iter().map(|target| {
        let request = ProviderRequest::Search(SearchRequest {
            query: query.clone(),
            max_results,
            channel: target.channel,
        });
        async move {
            let result = match invoke_once_retrying(gateway, &target.provider, request).await {
                Ok(response) => response.into_search_hits(&target.provider),
                Err(failure) => Err(failure),
            };
            (target, result)
        }
    });

    let mut channels = Vec::with_capacity(targets.len());
    for (target, result) in join_all(calls).await {
        match result {
            Ok(mut hits) => {
                hits.truncate(max_results);
                info!(
                    event_name = "agent.search.channel_completed",
                    channel = target.channel.as_str(),
                    provider = %target.provider,
                    hits = hits.len(),
                    "search channel returned results"
                );
                channels.push(ChannelResults {
                    channel: target.channel,
                    provider: target.provider.clone(),
                    hits,
                    failure: None,
                });
            }
            Err(failure) if failure.kind == FailureKind::AuthMissing => return Err(failure),
            Err(failure) => {
                warn!(
                    event_name = "agent.search.channel_failed",
                    channel = target.channel.as_str(),
                    provider = %target.provider,
                    failure_kind = failure.kind.as_str(),
                    error = %failure.reason,
                    "search channel failed, continuing with zero results"
                );
                channels.push(ChannelResults {
                    channel: target.channel,
                    provider: target.provider.clone(),
                    hits: Vec::new(),
                    failure: Some(failure.kind),
                });
            }
        }
    }

    Ok(SearchResults { query, channels })
}

#[cfg(test)]
mod tests {
    use dialectic_core::gateway::FailureKind;
    use dialectic_core::{ProviderId, ResearchScope, SearchHit};

    use super::execute;
    use crate::phases::PhaseRoles;
    use crate::testing::{ScriptedGateway, ScriptedReply};

    fn scope() -> ResearchScope {
        ResearchScope {
            original_query: "ev tariffs".to_owned(),
            scope: "EV tariff pass-through".to_owned(),
            requirements: Vec::new(),
            clarifying_questions: Vec::new(),
        }
    }

    fn hit(n: usize) -> SearchHit {
        SearchHit {
            title: format!("hit {n}"),
            url: format!("https://example.com/{n}"),
            snippet: String::new(),
            published: None,
        }
    }

    #[tokio::test]
    async fn partial_failure_keeps_other_channels() {
        let gateway = ScriptedGateway::new();
        gateway.set_search_default(ProviderId::new("web"), ScriptedReply::hits(vec![hit(1), hit(2)]));
        gateway.set_search_default(
            ProviderId::new("academic"),
            ScriptedReply::failure(FailureKind::QuotaExceeded),
        );
        gateway.set_search_default(ProviderId::new("social"), ScriptedReply::hits(vec![hit(3)]));

        let results = execute(&gateway, &PhaseRoles::default().search, &scope(), 8)
            .await
            .expect("partial success");

        assert_eq!(results.query, "EV tariff pass-through");
        assert_eq!(results.channels.len(), 3);
        assert_eq!(results.total_hits(), 3);
        let failed = results.failed_providers();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, &ProviderId::new("academic"));
        assert_eq!(failed[0].1, FailureKind::QuotaExceeded);
    }

    #[tokio::test]
    async fn auth_missing_fails_the_phase() {
        let gateway = ScriptedGateway::happy_path();
        gateway.push_search(ProviderId::new("social"), ScriptedReply::failure(FailureKind::AuthMissing));

        let failure = execute(&gateway, &PhaseRoles::default().search, &scope(), 8)
            .await
            .expect_err("auth is fatal");

        assert_eq!(failure.kind, FailureKind::AuthMissing);
    }

    #[tokio::test]
    async fn hits_are_capped_at_max_results() {
        let gateway = ScriptedGateway::new();
        gateway.set_search_default(
            ProviderId::new("web"),
            ScriptedReply::hits((0..10).map(hit).collect()),
        );
        let targets = &PhaseRoles::default().search[..1];

        let results = execute(&gateway, targets, &scope(), 4).await.expect("searched");

        assert_eq!(results.total_hits(), 4);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_before_giving_up_on_channel() {
        let gateway = ScriptedGateway::new();
        gateway.push_search(ProviderId::new("web"), ScriptedReply::failure(FailureKind::Transient));
        gateway.push_search(ProviderId::new("web"), ScriptedReply::hits(vec![hit(1)]));
        let targets = &PhaseRoles::default().search[..1];

        let results = execute(&gateway, targets, &scope(), 8).await.expect("searched");

        assert_eq!(results.total_hits(), 1);
        assert_eq!(gateway.calls_for_provider(&ProviderId::new("web")), 2);
    }
}
