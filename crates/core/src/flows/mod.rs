pub mod engine;
pub mod states;

pub use engine::{FlowDefinition, FlowEngine, FlowTransitionError, ResearchFlow};
pub use states::{FlowContext, PipelineAction, PipelineEvent, PipelinePhase, TransitionOutcome};
