//! HTTP surface over the pipeline orchestrator.
//!
//! Creating a session or answering its clarification spawns a driver task
//! and returns immediately; callers poll `GET /sessions/{id}`.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dialectic_agent::{OrchestratorError, PipelineOrchestrator};
use dialectic_core::quota::QuotaUsage;
use dialectic_core::{
    ApplicationError, InterfaceError, SessionId, SessionSnapshot, SessionSummary,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct ApiState {
    orchestrator: Arc<PipelineOrchestrator>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub query: String,
    #[serde(default)]
    pub max_rounds: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: SessionId,
}

#[derive(Debug, Deserialize)]
pub struct ClarificationRequest {
    pub answer: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: &'static str,
    pub detail: String,
    pub correlation_id: String,
}

/// Interface error carrying the correlation id it was logged under.
#[derive(Debug)]
pub struct ApiError(InterfaceError);

impl From<OrchestratorError> for ApiError {
    fn from(error: OrchestratorError) -> Self {
        let correlation_id = Uuid::new_v4().to_string();
        warn!(
            event_name = "api.request.rejected",
            correlation_id = %correlation_id,
            error = %error,
            "request rejected"
        );
        Self(ApplicationError::from(error).into_interface(correlation_id))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match &self.0 {
            InterfaceError::BadRequest { .. } => (StatusCode::BAD_REQUEST, "bad_request"),
            InterfaceError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            InterfaceError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
            InterfaceError::ServiceUnavailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            InterfaceError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        let body = ErrorBody {
            error,
            message: self.0.user_message(),
            detail: self.0.message().to_string(),
            correlation_id: self.0.correlation_id().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(orchestrator: Arc<PipelineOrchestrator>) -> Router {
    Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/clarification", post(submit_clarification))
        .route("/sessions/{id}/cancel", post(cancel_session))
        .route("/quota", get(quota))
        .with_state(ApiState { orchestrator })
}

pub async fn create_session(
    State(state): State<ApiState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let session_id = state.orchestrator.create_session(&request.query, request.max_rounds).await?;
    state.orchestrator.spawn_drive(session_id.clone());
    info!(
        event_name = "api.session.accepted",
        session_id = %session_id,
        "session accepted, driver spawned"
    );
    Ok((StatusCode::ACCEPTED, Json(CreateSessionResponse { session_id })))
}

pub async fn list_sessions(State(state): State<ApiState>) -> Json<Vec<SessionSummary>> {
    Json(state.orchestrator.list_sessions().await)
}

pub async fn get_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(state.orchestrator.get_session_state(&SessionId::from(id)).await?))
}

pub async fn submit_clarification(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<ClarificationRequest>,
) -> Result<(StatusCode, Json<SessionSnapshot>), ApiError> {
    let id = SessionId::from(id);
    let snapshot = state.orchestrator.submit_clarification_answer(&id, &request.answer).await?;
    state.orchestrator.spawn_drive(id);
    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

pub async fn cancel_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    Ok(Json(state.orchestrator.cancel_session(&SessionId::from(id)).await?))
}

pub async fn quota(State(state): State<ApiState>) -> Json<Vec<QuotaUsage>> {
    Json(state.orchestrator.quota_snapshot())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        extract::{Path, State},
        http::{Request, StatusCode},
        response::IntoResponse,
        Json,
    };
    use dialectic_agent::phases::PhaseRoles;
    use dialectic_agent::testing::{ScriptedGateway, ScriptedReply};
    use dialectic_agent::PipelineOrchestrator;
    use dialectic_core::audit::InMemoryAuditSink;
    use dialectic_core::gateway::CompletionTask;
    use dialectic_core::PipelinePhase;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::{
        cancel_session, create_session, get_session, router, submit_clarification, ApiState,
        ClarificationRequest, CreateSessionRequest,
    };

    fn state(gateway: ScriptedGateway) -> ApiState {
        ApiState {
            orchestrator: Arc::new(PipelineOrchestrator::new(
                Arc::new(gateway),
                PhaseRoles::default(),
                Arc::new(InMemoryAuditSink::default()),
                3,
            )),
        }
    }

    async fn settle(state: &ApiState, id: &str) -> dialectic_core::SessionSnapshot {
        for _ in 0..200 {
            let Json(snapshot) =
                get_session(State(state.clone()), Path(id.to_owned())).await.expect("state");
            if snapshot.phase.is_terminal()
                || matches!(snapshot.phase, PipelinePhase::NeedsClarification { .. })
            {
                return snapshot;
            }
            tokio::task::yield_now().await;
        }
        panic!("session {id} did not settle");
    }

    #[tokio::test]
    async fn created_session_runs_to_completion() {
        let state = state(ScriptedGateway::happy_path());

        let (status, Json(created)) = create_session(
            State(state.clone()),
            Json(CreateSessionRequest { query: "grid batteries".to_owned(), max_rounds: Some(1) }),
        )
        .await
        .expect("created");

        assert_eq!(status, StatusCode::ACCEPTED);
        let snapshot = settle(&state, created.session_id.as_str()).await;
        assert_eq!(snapshot.phase, PipelinePhase::Complete);
        assert!(snapshot.report.is_some());
    }

    #[tokio::test]
    async fn clarification_resumes_a_paused_session() {
        let gateway = ScriptedGateway::happy_path();
        gateway.push(
            CompletionTask::Evaluate,
            ScriptedReply::json(json!({ "decision": "clarify", "questions": ["Which grid?"] })),
        );
        let state = state(gateway);

        let (_, Json(created)) = create_session(
            State(state.clone()),
            Json(CreateSessionRequest { query: "grid batteries".to_owned(), max_rounds: Some(1) }),
        )
        .await
        .expect("created");
        let id = created.session_id.as_str().to_owned();
        let paused = settle(&state, &id).await;
        assert_eq!(paused.pending_question.as_deref(), Some("Which grid?"));

        let (status, _) = submit_clarification(
            State(state.clone()),
            Path(id.clone()),
            Json(ClarificationRequest { answer: "ERCOT".to_owned() }),
        )
        .await
        .expect("accepted");

        assert_eq!(status, StatusCode::ACCEPTED);
        let finished = settle(&state, &id).await;
        assert_eq!(finished.phase, PipelinePhase::Complete);
        assert_eq!(finished.clarifications[0].answer, "ERCOT");
    }

    #[tokio::test]
    async fn misuse_maps_to_interface_errors() {
        let state = state(ScriptedGateway::happy_path());

        let missing = get_session(State(state.clone()), Path("nope".to_owned()))
            .await
            .expect_err("missing")
            .into_response();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let empty = create_session(
            State(state.clone()),
            Json(CreateSessionRequest { query: "  ".to_owned(), max_rounds: None }),
        )
        .await
        .expect_err("empty query")
        .into_response();
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);

        let id = state.orchestrator.create_session("topic", None).await.expect("created");
        cancel_session(State(state.clone()), Path(id.as_str().to_owned())).await.expect("cancel");
        let twice = cancel_session(State(state.clone()), Path(id.as_str().to_owned()))
            .await
            .expect_err("terminal")
            .into_response();
        assert_eq!(twice.status(), StatusCode::CONFLICT);

        let body = to_bytes(twice.into_body(), usize::MAX).await.expect("body");
        let payload: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(payload["error"], "conflict");
        assert!(payload["correlation_id"].as_str().is_some_and(|id| !id.is_empty()));
    }

    #[tokio::test]
    async fn router_serves_quota_and_sessions() {
        let state = state(ScriptedGateway::happy_path());
        let app = router(state.orchestrator.clone());

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/quota").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/sessions")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "query": "heat pumps" }).to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let payload: Value = serde_json::from_slice(&body).expect("json");
        assert!(payload["session_id"].as_str().is_some());
    }
}
