pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;
pub mod gateway;
pub mod quota;

pub use domain::dialogue::{
    AgentRole, AlignmentAction, AlignmentVerdict, ClarificationExchange, DialogueHistory,
    DialogueOutcome, DialogueTurn, Evaluation, EvaluationDecision,
};
pub use domain::provider::{ProviderId, SearchChannel};
pub use domain::research::{
    AgentConfig, AgentSelection, Analysis, ChannelResults, Contradiction, DeepResearch, Fact,
    FinalReport, QualitySummary, ReportSection, ResearchBundle, ResearchScope, SearchHit,
    SearchResults,
};
pub use domain::session::{
    AbortReason, PhaseKind, PhaseOutput, ResearchSession, SessionId, SessionSnapshot,
    SessionSummary,
};
pub use errors::{ApplicationError, DomainError, InterfaceError, PhaseFailure};
pub use flows::{FlowEngine, PipelineEvent, PipelinePhase, ResearchFlow};
pub use gateway::{
    CallFailure, CallGateway, CompletionRequest, CompletionTask, FailureKind, GovernedGateway,
    ProviderAdapter, ProviderRequest, ProviderResponse, SearchRequest,
};
pub use quota::{QuotaDecision, QuotaGovernor, QuotaPolicy, QuotaUsage, RetryDecision};
