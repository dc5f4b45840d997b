//! # API REST
//!
//! REST API implementation for MedFlow.
//!
//! Handles:
//! - HTTP endpoints with axum
//! - OpenAPI/Swagger documentation
//! - Mapping core error codes onto HTTP statuses
//!
//! The server binary lives in the workspace root (`medflow-run`); this crate only builds the
//! router.

#![warn(rust_2018_idioms)]

mod error;

pub use error::{status_for, ApiError};

use axum::{
    extract::{Path as AxumPath, State},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use medflow_core::pipeline::{
    ClinicalSummary, ErrorBody, ExtractedFacts, FollowUp, IntakeRequest, Notice,
    PipelineOrchestrator, SafetyJudgement, SafetyReport, SessionView, Stage, TriageDecision,
    TriageView, TurnMetadata, TurnResponse, WorkflowStatus,
};
use medflow_core::{
    AuditTrail, BlockReason, ClinicalContent, ClinicalRecord, ContentHash, CoreError,
    EhrWriteResult, ErrorCode, IntegrityGate, RedFlag, RunState, ScanReport, SessionId,
    TimelineEntry, TraceStep, TriageLevel, Verdict, WriteStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

/// Application state for the REST API server
///
/// Everything a handler needs is reachable from the orchestrator: the latch for session
/// reads and closes, the rule engine for ad-hoc scans.
#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<PipelineOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthRes {
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CloseSessionReq {
    pub expected_version: u64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SealReq {
    pub record: ClinicalRecord,
    /// Consent time; defaults to the time of the request.
    #[serde(default)]
    pub consent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SealRes {
    pub content_hash: String,
    pub consent_captured_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct VerifyReq {
    pub record: ClinicalRecord,
    pub content_hash: String,
    pub consent_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ScanReq {
    pub text: String,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        intake,
        get_session,
        close_session,
        seal_record,
        verify_record,
        scan_rules,
    ),
    components(schemas(
        HealthRes,
        CloseSessionReq,
        SealReq,
        SealRes,
        VerifyReq,
        ScanReq,
        IntakeRequest,
        TurnResponse,
        TriageView,
        FollowUp,
        TurnMetadata,
        WorkflowStatus,
        Notice,
        ErrorBody,
        ErrorCode,
        SessionView,
        TimelineEntry,
        ClinicalSummary,
        ClinicalRecord,
        ClinicalContent,
        ExtractedFacts,
        TriageDecision,
        SafetyReport,
        SafetyJudgement,
        Verdict,
        BlockReason,
        EhrWriteResult,
        WriteStatus,
        AuditTrail,
        TraceStep,
        RunState,
        Stage,
        RedFlag,
        ScanReport,
        TriageLevel,
    ))
)]
pub struct ApiDoc;

/// Builds the REST router with Swagger UI and permissive CORS.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/intake", post(intake))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/close", post(close_session))
        .route("/records/seal", post(seal_record))
        .route("/records/verify", post(verify_record))
        .route("/rules/scan", post(scan_rules))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthRes)
    )
)]
/// Health check endpoint for the REST API
#[axum::debug_handler]
async fn health(State(_state): State<AppState>) -> Json<HealthRes> {
    Json(HealthRes {
        ok: true,
        message: "MedFlow REST API is alive".into(),
    })
}

#[utoipa::path(
    post,
    path = "/intake",
    request_body = IntakeRequest,
    responses(
        (status = 200, description = "Turn processed", body = TurnResponse),
        (status = 400, description = "Invalid input", body = ErrorBody),
        (status = 409, description = "Session closed or concurrently modified", body = ErrorBody),
        (status = 500, description = "Pipeline failed", body = ErrorBody)
    )
)]
/// Runs one patient turn through the pipeline.
///
/// Degraded runs still return `200` and carry a `PipelineDegraded` notice.
#[axum::debug_handler]
async fn intake(
    State(state): State<AppState>,
    Json(req): Json<IntakeRequest>,
) -> Result<Json<TurnResponse>, ApiError> {
    let response = state.orchestrator.run(req).await?;
    Ok(Json(response))
}

#[utoipa::path(
    get,
    path = "/sessions/{id}",
    params(("id" = String, Path, description = "Session id")),
    responses(
        (status = 200, description = "Session state", body = SessionView),
        (status = 400, description = "Invalid session id", body = ErrorBody),
        (status = 404, description = "Unknown session", body = ErrorBody)
    )
)]
#[axum::debug_handler]
async fn get_session(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<SessionView>, ApiError> {
    let session_id = SessionId::parse(&id).map_err(CoreError::from)?;
    let session = state.orchestrator.latch().get(&session_id)?;
    Ok(Json(SessionView::from(&session)))
}

#[utoipa::path(
    post,
    path = "/sessions/{id}/close",
    params(("id" = String, Path, description = "Session id")),
    request_body = CloseSessionReq,
    responses(
        (status = 200, description = "Session closed", body = SessionView),
        (status = 404, description = "Unknown session", body = ErrorBody),
        (status = 409, description = "Already closed or stale version", body = ErrorBody)
    )
)]
/// Closes a session at the expected latch version.
#[axum::debug_handler]
async fn close_session(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(req): Json<CloseSessionReq>,
) -> Result<Json<SessionView>, ApiError> {
    let session_id = SessionId::parse(&id).map_err(CoreError::from)?;
    let session = state
        .orchestrator
        .latch()
        .close(&session_id, req.expected_version)?;
    Ok(Json(SessionView::from(&session)))
}

#[utoipa::path(
    post,
    path = "/records/seal",
    request_body = SealReq,
    responses(
        (status = 200, description = "Record sealed", body = SealRes),
        (status = 500, description = "Record could not be canonicalized", body = ErrorBody)
    )
)]
/// Computes the content hash of a record at consent time.
#[axum::debug_handler]
async fn seal_record(
    State(_state): State<AppState>,
    Json(req): Json<SealReq>,
) -> Result<Json<SealRes>, ApiError> {
    let consent_at = req.consent_at.unwrap_or_else(Utc::now);
    let sealed = IntegrityGate::capture_consent(req.record, consent_at)?;
    tracing::info!(
        case_id = %sealed.record.case_id,
        content_hash = %sealed.content_hash,
        "record sealed"
    );
    Ok(Json(SealRes {
        content_hash: sealed.content_hash.to_string(),
        consent_captured_at: sealed.consent_captured_at,
    }))
}

#[utoipa::path(
    post,
    path = "/records/verify",
    request_body = VerifyReq,
    responses(
        (status = 200, description = "Verdict for the record", body = Verdict),
        (status = 400, description = "Malformed content hash", body = ErrorBody)
    )
)]
/// Checks a record against the hash and consent time captured when it was sealed.
///
/// A block is a normal verdict here, not an error.
#[axum::debug_handler]
async fn verify_record(
    State(_state): State<AppState>,
    Json(req): Json<VerifyReq>,
) -> Result<Json<Verdict>, ApiError> {
    let sealed_hash = ContentHash::parse(&req.content_hash).map_err(CoreError::from)?;
    let verdict = IntegrityGate::verify(&req.record, &sealed_hash, req.consent_at)?;
    Ok(Json(verdict))
}

#[utoipa::path(
    post,
    path = "/rules/scan",
    request_body = ScanReq,
    responses(
        (status = 200, description = "Red flags found in the text", body = ScanReport)
    )
)]
#[axum::debug_handler]
async fn scan_rules(State(state): State<AppState>, Json(req): Json<ScanReq>) -> Json<ScanReport> {
    Json(state.orchestrator.rules().scan(&req.text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use medflow_core::pipeline::OfflineProposer;
    use medflow_core::{CaseId, CoreConfig, InMemoryEhrStore, InMemorySessionStore, NonEmptyText};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> Router {
        let config = CoreConfig::with_defaults("unused".into()).expect("default config");
        let orchestrator = PipelineOrchestrator::new(
            Arc::new(config),
            Arc::new(InMemorySessionStore::default()),
            Arc::new(OfflineProposer),
            Arc::new(InMemoryEhrStore::default()),
        )
        .expect("orchestrator");
        router(AppState::new(Arc::new(orchestrator)))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");

        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn intake_body(session: &str, message: &str) -> Value {
        json!({"session_id": session, "patient_id": "p-1", "message": message})
    }

    fn record() -> ClinicalRecord {
        ClinicalRecord {
            case_id: CaseId::new(),
            session_id: SessionId::parse("enc-1").expect("valid"),
            patient_id: NonEmptyText::new("p-1").expect("valid"),
            content: ClinicalContent {
                extraction: ExtractedFacts::default(),
                decision: TriageDecision {
                    level: TriageLevel::Urgent,
                    reasoning: "High fever.".into(),
                    confidence_score: 0.0,
                    questions: vec!["How long?".into()],
                    flags: vec![],
                    degraded: true,
                },
                summary: ClinicalSummary {
                    chief_complaint: "fever".into(),
                    history: "Two days.".into(),
                    red_flags_identified: vec![],
                    risk_level: TriageLevel::Urgent,
                    recommended_action: "Same-day review.".into(),
                    clinician_note: String::new(),
                },
                safety: SafetyReport {
                    rescan_flags: vec![],
                    judgement: None,
                    rule_audit: vec!["Triage level appears safe for the symptoms provided.".into()],
                    final_safety_score: 83.0,
                    upgraded_from: None,
                    safety_pass: true,
                },
            },
            modified_at: Utc::now(),
            degraded: true,
        }
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (status, body) = send(&app(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn intake_returns_turn_response() {
        let app = app();
        let (status, body) = send(
            &app,
            "POST",
            "/intake",
            Some(intake_body("enc-1", "crushing chest pain")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["triage"]["level"], "emergency");
        assert_eq!(body["metadata"]["latch_version"], 1);
        assert_eq!(body["workflow_status"], "logged");
        assert_eq!(body["notices"][0]["code"], "PipelineDegraded");

        let (status, session) = send(&app, "GET", "/sessions/enc-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(session["current_level"], "emergency");
    }

    #[tokio::test]
    async fn blank_message_is_bad_request() {
        let (status, body) = send(&app(), "POST", "/intake", Some(intake_body("enc-2", " "))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "InvalidInput");
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (status, body) = send(&app(), "GET", "/sessions/nobody", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NotFound");
    }

    #[tokio::test]
    async fn closing_checks_version_and_blocks_new_turns() {
        let app = app();
        send(&app, "POST", "/intake", Some(intake_body("enc-3", "mild rash"))).await;

        let (status, body) = send(
            &app,
            "POST",
            "/sessions/enc-3/close",
            Some(json!({"expected_version": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "ConcurrentModification");

        let (status, body) = send(
            &app,
            "POST",
            "/sessions/enc-3/close",
            Some(json!({"expected_version": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["closed"], true);

        let (status, body) = send(
            &app,
            "POST",
            "/intake",
            Some(intake_body("enc-3", "chest pain")),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "SessionClosed");
    }

    #[tokio::test]
    async fn seal_then_verify_detects_tampering() {
        let app = app();
        let original = record();
        let consent_at = original.modified_at;
        let (status, sealed) = send(
            &app,
            "POST",
            "/records/seal",
            Some(json!({"record": original, "consent_at": consent_at})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let hash = sealed["content_hash"].as_str().expect("hash").to_owned();

        let (status, verdict) = send(
            &app,
            "POST",
            "/records/verify",
            Some(json!({"record": original, "content_hash": hash, "consent_at": consent_at})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(verdict["verdict"], "allow");

        let mut tampered = original.clone();
        tampered.content.decision.level = TriageLevel::Routine;
        let (status, verdict) = send(
            &app,
            "POST",
            "/records/verify",
            Some(json!({"record": tampered, "content_hash": hash, "consent_at": consent_at})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(verdict["verdict"], "block");
        assert_eq!(verdict["reason"]["code"], "content_mismatch");
    }

    #[tokio::test]
    async fn malformed_hash_is_bad_request() {
        let original = record();
        let (status, body) = send(
            &app(),
            "POST",
            "/records/verify",
            Some(json!({
                "record": original,
                "content_hash": "not-a-hash",
                "consent_at": original.modified_at,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "InvalidInput");
    }

    #[tokio::test]
    async fn scan_reports_flags_and_level() {
        let (status, body) = send(
            &app(),
            "POST",
            "/rules/scan",
            Some(json!({"text": "Slurred speech and high fever"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["level"], "emergency");
        assert_eq!(body["primary"]["matched_term"], "slurred speech");
        assert_eq!(body["flags"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn openapi_document_is_served() {
        let (status, body) = send(&app(), "GET", "/api-docs/openapi.json", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["paths"]["/intake"].is_object());
    }
}
