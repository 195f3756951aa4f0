//! wfreport HTTP API
//!
//! Each endpoint is a thin axum handler over a pure inner function, so the
//! inner functions can be exercised without the axum dispatch machinery.
//!
//! Endpoints:
//! - `GET /health`: database and catalog status
//! - `GET /version`: server version info
//! - `POST /report`: answer a question from its parsed intent

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use wfreport_core::audit::{AuditLog, AuditRecord};
use wfreport_core::fetch::FetchError;
use wfreport_core::{ParsedIntent, ReportEngine, ReportError, SchemaCatalog};

/// Shared state for all HTTP handlers
#[derive(Clone)]
pub struct HttpState {
    pub pool: PgPool,
    pub engine: Arc<ReportEngine>,
    pub audit: Option<AuditLog>,
    /// Fired on server shutdown; in-flight reports stop at their next stage.
    pub shutdown: CancellationToken,
}

pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/report", post(report_handler))
        .with_state(state)
}

/// Serve on `addr` until `state.shutdown` is cancelled.
pub async fn start_http_server(state: HttpState, addr: &str) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let app = build_router(Arc::new(state));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("wfreport HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request / Response DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ReportRequest {
    pub question: Option<String>,
    pub intent: Option<ParsedIntent>,
}

/// Standard HTTP error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            status: "error".to_string(),
            kind: None,
        }
    }

    pub fn from_report_error(err: &ReportError) -> Self {
        Self {
            kind: Some(err.kind()),
            ..Self::new(err.to_string())
        }
    }

    fn into_value(self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({ "status": "error" }))
    }
}

/// HTTP status for a pipeline failure.
pub fn status_for(err: &ReportError) -> StatusCode {
    match err {
        ReportError::Schema(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ReportError::UnreachableEntity { .. } | ReportError::UnsafeQuery(_) | ReportError::Compose { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ReportError::Fetch(FetchError::Timeout { .. }) | ReportError::ReasoningTimeout { .. } => {
            StatusCode::GATEWAY_TIMEOUT
        }
        ReportError::Fetch(_) | ReportError::ReasoningFailure(_) => StatusCode::BAD_GATEWAY,
        ReportError::Cancelled { .. } => StatusCode::REQUEST_TIMEOUT,
    }
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

pub async fn health_inner(pool: &PgPool, catalog: &SchemaCatalog) -> (StatusCode, serde_json::Value) {
    let pg_ver = match wfreport_core::db::health_check(pool).await {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "status": "unhealthy",
                    "error": e.to_string(),
                }),
            );
        }
    };

    (
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "postgresql": pg_ver,
            "catalog": {
                "version": catalog.version(),
                "tables": catalog.len(),
            },
        }),
    )
}

pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "wfreport/1",
    })
}

/// Run one report and record the outcome in the audit log when enabled.
pub async fn report_inner(
    engine: &ReportEngine,
    audit: Option<&AuditLog>,
    cancel: &CancellationToken,
    req: ReportRequest,
) -> (StatusCode, serde_json::Value) {
    let question = match req.question {
        Some(q) if !q.trim().is_empty() => q,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new("question field is required").into_value(),
            );
        }
    };
    let intent = match req.intent {
        Some(intent) if !intent.anchor.trim().is_empty() => intent,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new("intent with an anchor table is required").into_value(),
            );
        }
    };

    let start = Instant::now();
    let outcome = engine.generate_report_with_cancel(&question, &intent, cancel).await;
    let took_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Ok(bundle) => {
            tracing::info!(
                report_id = %bundle.report_id,
                kept = bundle.kept_claim_count,
                dropped = bundle.dropped_claim_count(),
                took_ms,
                "Report generated"
            );
            if let Some(log) = audit {
                write_audit(log, AuditRecord::success(&question, &intent, &bundle, took_ms)).await;
            }
            (
                StatusCode::OK,
                serde_json::json!({
                    "report_id": bundle.report_id,
                    "markdown": bundle.markdown,
                    "query": bundle.json["query"],
                    "json": bundle.json,
                    "took_ms": took_ms,
                }),
            )
        }
        Err(e) => {
            tracing::warn!(kind = e.kind(), error = %e, took_ms, "Report failed");
            if let Some(log) = audit {
                let sql = engine.plan(&intent).ok().map(|q| q.sql);
                write_audit(log, AuditRecord::failure(&question, &intent, sql, &e, took_ms)).await;
            }
            (status_for(&e), ErrorResponse::from_report_error(&e).into_value())
        }
    }
}

/// File append runs on the blocking pool; the response waits for it so the
/// record is on disk once the request completes.
async fn write_audit(log: &AuditLog, record: AuditRecord) {
    let writer = log.clone();
    match tokio::task::spawn_blocking(move || writer.append(&record)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(path = %log.path().display(), "Audit write failed: {}", e),
        Err(e) => tracing::warn!(path = %log.path().display(), "Audit writer panicked: {}", e),
    }
}

// ============================================================================
// Axum handlers (thin wrappers)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state.pool, state.engine.catalog()).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn report_handler(
    State(state): State<Arc<HttpState>>,
    payload: Result<Json<ReportRequest>, JsonRejection>,
) -> impl IntoResponse {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => {
            tracing::debug!(status = %rejection.status(), "Rejected request body");
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(rejection.body_text()).into_value()),
            );
        }
    };
    let cancel = state.shutdown.child_token();
    let (status, body) = report_inner(&state.engine, state.audit.as_ref(), &cancel, req).await;
    (status, Json(body))
}

// ============================================================================
// Unit Tests: call inner functions directly
// ============================================================================
