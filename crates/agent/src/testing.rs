//! In-process fakes for exercising executors, the orchestrator and the HTTP
//! layer without network access.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use dialectic_core::gateway::{
    CallFailure, CallGateway, CompletionTask, FailureKind, ProviderAdapter, ProviderRequest,
    ProviderResponse,
};
use dialectic_core::{AgentRole, ProviderId, SearchHit};
use serde_json::json;

#[derive(Clone, Debug, PartialEq)]
pub enum ScriptedReply {
    Text(String),
    Hits(Vec<SearchHit>),
    Failure(FailureKind),
}

impl ScriptedReply {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self::Text(value.to_string())
    }

    pub fn hits(hits: Vec<SearchHit>) -> Self {
        Self::Hits(hits)
    }

    pub fn failure(kind: FailureKind) -> Self {
        Self::Failure(kind)
    }

    fn into_result(self, provider: &ProviderId) -> Result<ProviderResponse, CallFailure> {
        match self {
            Self::Text(text) => Ok(ProviderResponse::Completion(text)),
            Self::Hits(hits) => Ok(ProviderResponse::Search(hits)),
            Self::Failure(kind) => Err(CallFailure::new(kind, provider, "scripted failure")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Route {
    Task(CompletionTask),
    Search(ProviderId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedCall {
    pub provider: ProviderId,
    pub request: ProviderRequest,
}

/// Gateway fake. Completions are routed by task, searches by provider.
/// Queued replies are consumed first, then the route's default, otherwise
/// the call fails with `unknown`.
#[derive(Default)]
pub struct ScriptedGateway {
    queued: Mutex<HashMap<Route, VecDeque<ScriptedReply>>>,
    defaults: Mutex<HashMap<Route, ScriptedReply>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults for a full successful run over the `web`, `academic` and
    /// `social` search providers: evaluator always continues, gate always proceeds.
    pub fn happy_path() -> Self {
        let gateway = Self::new();
        gateway.set_default(
            CompletionTask::Clarify,
            ScriptedReply::json(json!({
                "scope": "Compare the effect of tariffs on EV retail prices in the EU and US",
                "requirements": ["cite sources", "cover 2020 onwards"],
                "clarifying_questions": []
            })),
        );
        gateway.set_default(
            CompletionTask::RefineQuery,
            ScriptedReply::text("EV tariff pass-through to retail prices 2020-2025"),
        );
        gateway.set_default(
            CompletionTask::DeepReport,
            ScriptedReply::text("Tariffs raised landed cost; pass-through varied by brand."),
        );
        gateway.set_default(
            CompletionTask::Analyze,
            ScriptedReply::json(json!({
                "facts": [
                    {
                        "statement": "EU duties on imported EVs rose in 2024",
                        "sources": ["https://example.com/eu"],
                        "confidence": 0.9
                    },
                    {
                        "statement": "Some brands absorbed the tariff",
                        "sources": [],
                        "confidence": 0.4
                    }
                ],
                "contradictions": [
                    { "topic": "pass-through", "claims": ["full", "partial"] }
                ]
            })),
        );
        gateway.set_default(
            CompletionTask::SelectAgents,
            ScriptedReply::json(json!({
                "analyst": {
                    "name": "Trade Economist",
                    "persona": "Builds the strongest evidence-based case",
                    "focus": ["pricing data"]
                },
                "critic": {
                    "name": "Skeptical Reviewer",
                    "persona": "Challenges weak evidence",
                    "focus": ["methodology"]
                },
                "success_criteria": ["quantified pass-through estimate"]
            })),
        );
        for role in AgentRole::ORDER {
            gateway.set_default(
                CompletionTask::DialogueTurn(role),
                ScriptedReply::json(json!({
                    "content": format!("{} position", role.as_str()),
                    "confidence": 0.6,
                    "sources": ["https://example.com/eu"]
                })),
            );
        }
        gateway.set_default(
            CompletionTask::Evaluate,
            ScriptedReply::json(json!({
                "decision": "continue",
                "rationale": "open questions remain",
                "feedback": ["quantify"],
                "questions": []
            })),
        );
        gateway.set_default(
            CompletionTask::Align,
            ScriptedReply::json(json!({ "action": "proceed", "drift_areas": [] })),
        );
        gateway.set_default(
            CompletionTask::Synthesize,
            ScriptedReply::json(json!({
                "title": "Tariffs and EV prices",
                "summary": "Partial pass-through.",
                "sections": [{ "heading": "Findings", "body": "Prices rose." }],
                "key_findings": ["pass-through was partial"],
                "open_questions": []
            })),
        );
        for provider in ["web", "academic", "social"] {
            gateway.set_search_default(
                ProviderId::new(provider),
                ScriptedReply::hits(vec![SearchHit {
                    title: format!("{provider} result"),
                    url: format!("https://example.com/{provider}"),
                    snippet: "EV prices and tariffs".to_owned(),
                    published: None,
                }]),
            );
        }
        gateway
    }

    pub fn push(&self, task: CompletionTask, reply: ScriptedReply) {
        lock(&self.queued).entry(Route::Task(task)).or_default().push_back(reply);
    }

    pub fn push_search(&self, provider: ProviderId, reply: ScriptedReply) {
        lock(&self.queued).entry(Route::Search(provider)).or_default().push_back(reply);
    }

    pub fn set_default(&self, task: CompletionTask, reply: ScriptedReply) {
        lock(&self.defaults).insert(Route::Task(task), reply);
    }

    pub fn set_search_default(&self, provider: ProviderId, reply: ScriptedReply) {
        lock(&self.defaults).insert(Route::Search(provider), reply);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn calls_for_task(&self, task: CompletionTask) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| {
                matches!(&call.request, ProviderRequest::Completion(request) if request.task == task)
            })
            .count()
    }

    pub fn calls_for_provider(&self, provider: &ProviderId) -> usize {
        lock(&self.calls).iter().filter(|call| &call.provider == provider).count()
    }

    /// Prompts sent for `task`, in call order.
    pub fn prompts_for_task(&self, task: CompletionTask) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match &call.request {
                ProviderRequest::Completion(request) if request.task == task => {
                    Some(request.prompt.clone())
                }
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl CallGateway for ScriptedGateway {
    async fn invoke(
        &self,
        provider: &ProviderId,
        request: ProviderRequest,
    ) -> Result<ProviderResponse, CallFailure> {
        let route = match &request {
            ProviderRequest::Completion(completion) => Route::Task(completion.task),
            ProviderRequest::Search(_) => Route::Search(provider.clone()),
        };
        lock(&self.calls).push(RecordedCall { provider: provider.clone(), request });

        let queued = lock(&self.queued).get_mut(&route).and_then(VecDeque::pop_front);
        let reply = match queued {
            Some(reply) => Some(reply),
            None => lock(&self.defaults).get(&route).cloned(),
        };
        match reply {
            Some(reply) => reply.into_result(provider),
            None => Err(CallFailure::new(FailureKind::Unknown, provider, "no scripted reply")),
        }
    }
}

/// Adapter that fails with a fixed kind for its first `failures` calls and
/// then answers with `reply`. Counts every attempt.
pub struct CountingAdapter {
    failure: Option<FailureKind>,
    failures: u32,
    reply: ProviderResponse,
    calls: AtomicU32,
}

impl CountingAdapter {
    pub fn always_failing(kind: FailureKind) -> Self {
        Self {
            failure: Some(kind),
            failures: u32::MAX,
            reply: ProviderResponse::Completion(String::new()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing_then(kind: FailureKind, failures: u32, reply: ProviderResponse) -> Self {
        Self { failure: Some(kind), failures, reply, calls: AtomicU32::new(0) }
    }

    pub fn answering(reply: ProviderResponse) -> Self {
        Self { failure: None, failures: 0, reply, calls: AtomicU32::new(0) }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for CountingAdapter {
    async fn call(&self, _request: &ProviderRequest) -> Result<ProviderResponse, CallFailure> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.failure {
            Some(kind) if call <= self.failures => {
                Err(CallFailure::new(kind, &ProviderId::new("counting"), "scripted adapter failure"))
            }
            _ => Ok(self.reply.clone()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
