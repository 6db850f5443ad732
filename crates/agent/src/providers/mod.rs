//! HTTP adapters for the configured providers, and the gateway that governs
//! them.

pub mod openai;
pub mod search;

use std::sync::Arc;

use dialectic_core::config::{AppConfig, ProviderKind};
use dialectic_core::gateway::{CallFailure, FailureKind, GovernedGateway, ProviderAdapter};
use dialectic_core::quota::{QuotaGovernor, QuotaPolicy};
use dialectic_core::ProviderId;
use reqwest::{Client, StatusCode};
use tracing::info;

pub use openai::OpenAiCompatibleAdapter;
pub use search::JsonSearchAdapter;

/// Registers every configured provider with its own quota policy and timeout.
pub fn build_gateway(config: &AppConfig) -> GovernedGateway {
    let client = Client::new();
    let mut governor = QuotaGovernor::new(QuotaPolicy::default());
    for (id, provider) in &config.providers {
        governor = governor.with_policy(ProviderId::new(id.clone()), provider.quota_policy());
    }

    let mut gateway = GovernedGateway::new(governor);
    for (id, provider) in &config.providers {
        let provider_id = ProviderId::new(id.clone());
        let adapter: Arc<dyn ProviderAdapter> = match provider.kind {
            ProviderKind::OpenaiCompatible => Arc::new(OpenAiCompatibleAdapter::new(
                client.clone(),
                provider_id.clone(),
                provider,
            )),
            ProviderKind::JsonSearch => {
                Arc::new(JsonSearchAdapter::new(client.clone(), provider_id.clone(), provider))
            }
        };
        info!(
            event_name = "agent.provider.registered",
            provider = %provider_id,
            kind = provider.kind.as_str(),
            has_api_key = provider.has_api_key(),
            "provider registered"
        );
        gateway = gateway.register(provider_id, adapter, provider.timeout());
    }
    gateway
}

pub(crate) fn classify_status(status: StatusCode) -> FailureKind {
    match status.as_u16() {
        401 | 403 => FailureKind::AuthMissing,
        429 => FailureKind::QuotaExceeded,
        408 | 500..=599 => FailureKind::Transient,
        _ => FailureKind::Unknown,
    }
}

pub(crate) fn classify_transport(provider: &ProviderId, error: reqwest::Error) -> CallFailure {
    let kind = if error.is_timeout() || error.is_connect() || error.is_request() {
        FailureKind::Transient
    } else if error.is_decode() || error.is_body() {
        FailureKind::Malformed
    } else {
        FailureKind::Unknown
    };
    CallFailure::new(kind, provider, error.to_string())
}

/// Maps a non-success response to a failure, keeping a bounded excerpt of the
/// body for the reason.
pub(crate) async fn status_failure(
    provider: &ProviderId,
    response: reqwest::Response,
) -> CallFailure {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let excerpt = body.chars().take(300).collect::<String>();
    CallFailure::new(classify_status(status), provider, format!("HTTP {status}: {excerpt}"))
}

pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}
