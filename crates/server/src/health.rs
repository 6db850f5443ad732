use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use dialectic_core::config::{AppConfig, ProviderKind};
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    providers: Vec<ProviderReadiness>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProviderReadiness {
    pub provider: String,
    pub kind: &'static str,
    pub credentials: bool,
    pub required: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub providers: Vec<ProviderReadiness>,
    pub checked_at: String,
}

impl HealthState {
    /// Completion providers need a key; search backends may run without one.
    pub fn from_config(config: &AppConfig) -> Self {
        let providers = config
            .providers
            .iter()
            .map(|(id, provider)| ProviderReadiness {
                provider: id.clone(),
                kind: provider.kind.as_str(),
                credentials: provider.has_api_key(),
                required: provider.kind == ProviderKind::OpenaiCompatible,
            })
            .collect();
        Self { providers }
    }
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let missing = state
        .providers
        .iter()
        .filter(|provider| provider.required && !provider.credentials)
        .map(|provider| provider.provider.as_str())
        .collect::<Vec<_>>();
    let ready = missing.is_empty();

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: if ready { "ready" } else { "degraded" },
            detail: if ready {
                "all completion providers have credentials".to_string()
            } else {
                format!("missing credentials for: {}", missing.join(", "))
            },
        },
        providers: state.providers.clone(),
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}
