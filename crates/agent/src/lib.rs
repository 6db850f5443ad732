//! Model-facing side of dialectic.
//!
//! This crate holds everything that talks to providers: the HTTP adapters,
//! the phase executors, the dialogue evaluator and the alignment gate. It
//! also holds the orchestrator that owns sessions and drives them through the
//! research flow defined in `dialectic-core`.
//!
//! # Architecture
//!
//! 1. **Providers** (`providers`) - reqwest adapters behind the governed gateway
//! 2. **Phase executors** (`phases`) - one function per pipeline phase, no session state
//! 3. **Judgments** (`evaluator`, `alignment`) - closed-vocabulary readings of model output
//! 4. **Orchestration** (`runtime`) - plan, execute, record, transition
//!
//! The model never moves a session directly. Its replies are parsed into a
//! small fixed vocabulary and the flow engine decides the transition.

pub mod alignment;
pub mod evaluator;
pub mod events;
pub mod llm;
pub mod phases;
pub mod providers;
pub mod runtime;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use alignment::AlignmentGate;
pub use evaluator::DialogueEvaluator;
pub use events::SessionEvent;
pub use phases::{PhaseExecutors, PhaseRoles};
pub use providers::build_gateway;
pub use runtime::{OrchestratorError, PipelineOrchestrator};
