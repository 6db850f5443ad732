//! Single choke point for outbound provider calls.
//!
//! Every request goes through [`GovernedGateway::invoke`]: local quota
//! admission, a per-call timeout, and bounded backoff when the provider
//! itself reports exhaustion. Failures come back classified so callers never
//! inspect raw transport errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::dialogue::AgentRole;
use crate::domain::provider::{ProviderId, SearchChannel};
use crate::domain::research::SearchHit;
use crate::quota::{QuotaDecision, QuotaGovernor, QuotaUsage, RetryDecision};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AuthMissing,
    QuotaExceeded,
    Transient,
    Malformed,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthMissing => "auth_missing",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Transient => "transient",
            Self::Malformed => "malformed",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{provider} call failed ({}): {reason}", .kind.as_str())]
pub struct CallFailure {
    pub kind: FailureKind,
    pub provider: ProviderId,
    pub reason: String,
}

impl CallFailure {
    pub fn new(kind: FailureKind, provider: &ProviderId, reason: impl Into<String>) -> Self {
        Self { kind, provider: provider.clone(), reason: reason.into() }
    }

    pub fn malformed(provider: &ProviderId, reason: impl Into<String>) -> Self {
        Self::new(FailureKind::Malformed, provider, reason)
    }
}

/// What a completion is for. Adapters ignore it; fakes route on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionTask {
    Clarify,
    RefineQuery,
    DeepReport,
    Analyze,
    SelectAgents,
    DialogueTurn(AgentRole),
    Evaluate,
    Align,
    Synthesize,
}

impl CompletionTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clarify => "clarify",
            Self::RefineQuery => "refine_query",
            Self::DeepReport => "deep_report",
            Self::Analyze => "analyze",
            Self::SelectAgents => "select_agents",
            Self::DialogueTurn(AgentRole::Analyst) => "dialogue_turn.analyst",
            Self::DialogueTurn(AgentRole::Critic) => "dialogue_turn.critic",
            Self::Evaluate => "evaluate",
            Self::Align => "align",
            Self::Synthesize => "synthesize",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionRequest {
    pub task: CompletionTask,
    pub system: String,
    pub prompt: String,
    /// Ask the model for a single JSON object.
    pub json_output: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub max_results: usize,
    pub channel: SearchChannel,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderRequest {
    Completion(CompletionRequest),
    Search(SearchRequest),
}

impl ProviderRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Completion(request) => request.task.as_str(),
            Self::Search(_) => "search",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderResponse {
    Completion(String),
    Search(Vec<SearchHit>),
}

impl ProviderResponse {
    pub fn into_completion(self, provider: &ProviderId) -> Result<String, CallFailure> {
        match self {
            Self::Completion(text) => Ok(text),
            Self::Search(_) => {
                Err(CallFailure::malformed(provider, "expected completion, got search results"))
            }
        }
    }

    pub fn into_search_hits(self, provider: &ProviderId) -> Result<Vec<SearchHit>, CallFailure> {
        match self {
            Self::Search(hits) => Ok(hits),
            Self::Completion(_) => {
                Err(CallFailure::malformed(provider, "expected search results, got completion"))
            }
        }
    }
}

/// One concrete remote backend. Implementations classify their own failures.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn call(&self, request: &ProviderRequest) -> Result<ProviderResponse, CallFailure>;
}

#[async_trait]
pub trait CallGateway: Send + Sync {
    async fn invoke(
        &self,
        provider: &ProviderId,
        request: ProviderRequest,
    ) -> Result<ProviderResponse, CallFailure>;

    fn quota_snapshot(&self) -> Vec<QuotaUsage> {
        Vec::new()
    }
}

struct ProviderBinding {
    adapter: Arc<dyn ProviderAdapter>,
    timeout: Duration,
    /// Callers waiting on the same provider's window queue here in arrival order.
    turnstile: Mutex<()>,
}

pub struct GovernedGateway {
    governor: QuotaGovernor,
    bindings: HashMap<ProviderId, ProviderBinding>,
}

impl GovernedGateway {
    pub fn new(governor: QuotaGovernor) -> Self {
        Self { governor, bindings: HashMap::new() }
    }

    pub fn register(
        mut self,
        provider: ProviderId,
        adapter: Arc<dyn ProviderAdapter>,
        timeout: Duration,
    ) -> Self {
        self.bindings
            .insert(provider, ProviderBinding { adapter, timeout, turnstile: Mutex::new(()) });
        self
    }

    pub fn providers(&self) -> Vec<&ProviderId> {
        let mut providers = self.bindings.keys().collect::<Vec<_>>();
        providers.sort();
        providers
    }

    pub fn governor(&self) -> &QuotaGovernor {
        &self.governor
    }

    async fn admit(&self, provider: &ProviderId, binding: &ProviderBinding) {
        let _turn = binding.turnstile.lock().await;
        loop {
            match self.governor.acquire(provider) {
                QuotaDecision::Granted { used, limit } => {
                    debug!(
                        event_name = "gateway.quota.granted",
                        provider = %provider,
                        used,
                        limit,
                        "quota slot granted"
                    );
                    return;
                }
                QuotaDecision::Wait(wait) => {
                    info!(
                        event_name = "gateway.quota.waiting",
                        provider = %provider,
                        wait_ms = wait.as_millis() as u64,
                        "local quota window full, waiting for reset"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

#[async_trait]
impl CallGateway for GovernedGateway {
    async fn invoke(
        &self,
        provider: &ProviderId,
        request: ProviderRequest,
    ) -> Result<ProviderResponse, CallFailure> {
        let Some(binding) = self.bindings.get(provider) else {
            return Err(CallFailure::new(
                FailureKind::Unknown,
                provider,
                "provider is not registered with the gateway",
            ));
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.admit(provider, binding).await;

            let result =
                match tokio::time::timeout(binding.timeout, binding.adapter.call(&request)).await {
                    Ok(result) => result,
                    Err(_) => Err(CallFailure::new(
                        FailureKind::Transient,
                        provider,
                        format!("timed out after {}s", binding.timeout.as_secs()),
                    )),
                };

            match result {
                Err(failure) if failure.kind == FailureKind::QuotaExceeded => {
                    match self.governor.retry_after_quota_exceeded(provider, attempt) {
                        RetryDecision::RetryAfter(backoff) => {
                            warn!(
                                event_name = "gateway.quota.backoff",
                                provider = %provider,
                                request = request.kind(),
                                attempt,
                                backoff_secs = backoff.as_secs(),
                                "provider reported quota exceeded, backing off"
                            );
                            tokio::time::sleep(backoff).await;
                        }
                        RetryDecision::Exhausted { attempts } => {
                            warn!(
                                event_name = "gateway.quota.exhausted",
                                provider = %provider,
                                request = request.kind(),
                                attempts,
                                "provider quota still exceeded after final attempt"
                            );
                            return Err(CallFailure::new(
                                FailureKind::QuotaExceeded,
                                provider,
                                format!("quota exceeded after {attempts} attempts: {}", failure.reason),
                            ));
                        }
                    }
                }
                Err(failure) => {
                    warn!(
                        event_name = "gateway.call.failed",
                        provider = %provider,
                        request = request.kind(),
                        failure_kind = failure.kind.as_str(),
                        error = %failure.reason,
                        "provider call failed"
                    );
                    return Err(failure);
                }
                Ok(response) => return Ok(response),
            }
        }
    }

    fn quota_snapshot(&self) -> Vec<QuotaUsage> {
        self.governor.snapshot()
    }
}
