//! In-process research run.
//!
//! The session is driven on a local runtime until it completes, aborts, or
//! pauses for a clarification. Each pause consumes the next `--answer`; with
//! none left the pending question is printed and the command exits with
//! [`EXIT_NEEDS_CLARIFICATION`].

use std::sync::Arc;

use anyhow::Context;
use dialectic_agent::{build_gateway, OrchestratorError, PipelineOrchestrator};
use dialectic_core::audit::{AuditSink, TracingAuditSink};
use dialectic_core::config::{AppConfig, LoadOptions};
use dialectic_core::{
    AbortReason, DialogueOutcome, FinalReport, PipelinePhase, QualitySummary, SessionId,
    SessionSnapshot,
};
use serde::Serialize;
use tracing::info;

use super::{
    CommandResult, EXIT_ABORTED, EXIT_CONFIG, EXIT_INVALID_REQUEST, EXIT_NEEDS_CLARIFICATION,
};

const COMMAND: &str = "research";

#[derive(Debug, Serialize)]
struct CompletedOutput<'a> {
    command: &'static str,
    status: &'static str,
    session_id: &'a SessionId,
    rounds_completed: u32,
    dialogue_outcome: Option<DialogueOutcome>,
    quality: Option<&'a QualitySummary>,
    report: &'a FinalReport,
}

#[derive(Debug, Serialize)]
struct PausedOutput<'a> {
    command: &'static str,
    status: &'static str,
    session_id: &'a SessionId,
    round: u32,
    question: &'a str,
}

#[derive(Debug, Serialize)]
struct AbortedOutput<'a> {
    command: &'static str,
    status: &'static str,
    session_id: &'a SessionId,
    reason: Option<&'a AbortReason>,
}

pub fn run(query: &str, max_rounds: Option<u32>, answers: Vec<String>) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                COMMAND,
                "config_validation",
                error.to_string(),
                EXIT_CONFIG,
            )
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to initialize async runtime")
    {
        Ok(runtime) => runtime,
        Err(error) => return CommandResult::failure(COMMAND, "runtime", format!("{error:#}"), 1),
    };

    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    let gateway = Arc::new(build_gateway(&config));
    let orchestrator = PipelineOrchestrator::from_config(&config, gateway, audit);

    runtime.block_on(execute(&orchestrator, query, max_rounds, answers))
}

/// Drives one session on `orchestrator`, answering pauses from `answers` in order.
pub async fn execute(
    orchestrator: &PipelineOrchestrator,
    query: &str,
    max_rounds: Option<u32>,
    answers: Vec<String>,
) -> CommandResult {
    let id = match orchestrator.create_session(query, max_rounds).await {
        Ok(id) => id,
        Err(error) => return rejected(error),
    };
    let mut answers = answers.into_iter();

    loop {
        let snapshot = match orchestrator.drive(&id).await {
            Ok(snapshot) => snapshot,
            Err(error) => return rejected(error),
        };

        match snapshot.phase {
            PipelinePhase::NeedsClarification { round } => {
                let Some(answer) = answers.next() else {
                    return paused(&snapshot, round);
                };
                info!(
                    event_name = "cli.research.answer_submitted",
                    session_id = %id,
                    round,
                    "submitting clarification answer"
                );
                if let Err(error) = orchestrator.submit_clarification_answer(&id, &answer).await {
                    return rejected(error);
                }
            }
            PipelinePhase::Complete => return completed(&snapshot),
            PipelinePhase::Aborted => {
                return CommandResult::json(
                    EXIT_ABORTED,
                    &AbortedOutput {
                        command: COMMAND,
                        status: "aborted",
                        session_id: &snapshot.id,
                        reason: snapshot.abort.as_ref(),
                    },
                )
            }
            _ => {
                return CommandResult::failure(
                    COMMAND,
                    "internal",
                    format!("driver stopped in non-resting state `{}`", snapshot.phase.label()),
                    1,
                )
            }
        }
    }
}

fn completed(snapshot: &SessionSnapshot) -> CommandResult {
    let Some(report) = snapshot.report.as_ref() else {
        return CommandResult::failure(
            COMMAND,
            "internal",
            "session completed without a report",
            1,
        );
    };

    CommandResult::json(
        0,
        &CompletedOutput {
            command: COMMAND,
            status: "ok",
            session_id: &snapshot.id,
            rounds_completed: report.rounds_completed,
            dialogue_outcome: snapshot.dialogue_outcome,
            quality: snapshot.quality.as_ref(),
            report,
        },
    )
}

fn paused(snapshot: &SessionSnapshot, round: u32) -> CommandResult {
    CommandResult::json(
        EXIT_NEEDS_CLARIFICATION,
        &PausedOutput {
            command: COMMAND,
            status: "needs_clarification",
            session_id: &snapshot.id,
            round,
            question: snapshot.pending_question.as_deref().unwrap_or_default(),
        },
    )
}

fn rejected(error: OrchestratorError) -> CommandResult {
    let (error_class, exit_code) = match &error {
        OrchestratorError::InvalidRequest(_) | OrchestratorError::Domain(_) => {
            ("invalid_request", EXIT_INVALID_REQUEST)
        }
        _ => ("orchestrator", 1),
    };
    CommandResult::failure(COMMAND, error_class, error.to_string(), exit_code)
}
