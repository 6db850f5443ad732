use async_trait::async_trait;
use dialectic_core::config::ProviderConfig;
use dialectic_core::gateway::{
    CallFailure, FailureKind, ProviderAdapter, ProviderRequest, ProviderResponse, SearchRequest,
};
use dialectic_core::{ProviderId, SearchHit};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{classify_transport, status_failure};

/// A search backend that accepts a JSON query and returns `{"results": [...]}`.
///
/// Field names vary between services, so a few common aliases are accepted
/// for each hit.
pub struct JsonSearchAdapter {
    client: Client,
    provider: ProviderId,
    url: String,
    api_key_header: String,
    api_key: Option<SecretString>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<RawHit>,
}

#[derive(Debug, Deserialize)]
struct RawHit {
    #[serde(default)]
    title: Option<String>,
    #[serde(default, alias = "link", alias = "href")]
    url: Option<String>,
    #[serde(default, alias = "content", alias = "description", alias = "text")]
    snippet: Option<String>,
    #[serde(default, alias = "published_date", alias = "publishedDate", alias = "date")]
    published: Option<String>,
}

impl JsonSearchAdapter {
    pub fn new(client: Client, provider: ProviderId, config: &ProviderConfig) -> Self {
        Self {
            client,
            provider,
            url: config.base_url.clone(),
            api_key_header: config.api_key_header.clone(),
            api_key: config.api_key.clone(),
        }
    }

    fn body(request: &SearchRequest) -> Value {
        json!({
            "query": request.query,
            "max_results": request.max_results,
            "num_results": request.max_results,
            "channel": request.channel.as_str(),
        })
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>, CallFailure> {
        let mut builder = self.client.post(&self.url).json(&Self::body(request));
        if let Some(key) = &self.api_key {
            builder = builder.header(self.api_key_header.as_str(), key.expose_secret());
        }

        let response =
            builder.send().await.map_err(|error| classify_transport(&self.provider, error))?;
        if !response.status().is_success() {
            return Err(status_failure(&self.provider, response).await);
        }

        let parsed = response
            .json::<SearchResponse>()
            .await
            .map_err(|error| CallFailure::malformed(&self.provider, error.to_string()))?;
        Ok(into_hits(parsed))
    }
}

fn into_hits(response: SearchResponse) -> Vec<SearchHit> {
    response
        .results
        .into_iter()
        .filter_map(|raw| {
            let url = raw.url.filter(|url| !url.trim().is_empty())?;
            Some(SearchHit {
                title: raw.title.unwrap_or_else(|| url.clone()),
                url,
                snippet: raw.snippet.unwrap_or_default(),
                published: raw.published,
            })
        })
        .collect()
}

#[async_trait]
impl ProviderAdapter for JsonSearchAdapter {
    async fn call(&self, request: &ProviderRequest) -> Result<ProviderResponse, CallFailure> {
        match request {
            ProviderRequest::Search(search) => self.search(search).await.map(ProviderResponse::Search),
            ProviderRequest::Completion(_) => Err(CallFailure::new(
                FailureKind::Unknown,
                &self.provider,
                "search provider cannot serve completion requests",
            )),
        }
    }
}
