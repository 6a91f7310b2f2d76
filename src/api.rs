//! HTTP API for scan submission and state observation

use crate::diagnosis::DiagnosisRecord;
use crate::orchestrator::SubmitOutcome;
use crate::sessions::{is_valid_session_id, ScanSessions, DEFAULT_SESSION, SESSION_HEADER};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, FromRequestParts, Multipart, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Request/response framing allowance on top of the image limit
const BODY_OVERHEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
pub struct Base64ScanRequest {
    /// Standard base64, optionally as a `data:` URL
    pub image_data: String,
    pub mime_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ScanResponse {
    pub sequence: u64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<DiagnosisRecord>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    session: Option<String>,
}

/// Session id from the `X-Scan-Session` header or the `session` query
/// parameter, in that order. Clients naming neither share the default one.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSession(pub String);

impl<S> FromRequestParts<S> for ClientSession
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let from_header = match parts.headers.get(SESSION_HEADER) {
            Some(value) => match value.to_str() {
                Ok(id) => Some(id.trim().to_string()),
                Err(_) => {
                    return Err(error_response(StatusCode::BAD_REQUEST, "session header is not valid text"))
                }
            },
            None => None,
        };

        let id = match from_header {
            Some(id) => id,
            None => Query::<SessionQuery>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|Query(query)| query.session)
                .unwrap_or_else(|| DEFAULT_SESSION.to_string()),
        };

        if !is_valid_session_id(&id) {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "session id must be 1-128 characters of letters, digits, '-' or '_'",
            ));
        }
        Ok(ClientSession(id))
    }
}

pub fn create_router(sessions: Arc<ScanSessions>) -> Router {
    // Base64 bodies are a third larger than the image they carry
    let body_limit = sessions.max_image_bytes() / 3 * 4 + BODY_OVERHEAD_BYTES;

    Router::new()
        .route("/api/scan", post(scan_multipart))
        .route("/api/scan/base64", post(scan_base64))
        .route("/api/scan/state", get(scan_state))
        .route("/api/scan/events", get(scan_events))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(sessions)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: message.into() })).into_response()
}

fn outcome_response(outcome: SubmitOutcome) -> Response {
    match outcome {
        SubmitOutcome::Completed { sequence, record } => Json(ScanResponse {
            sequence,
            status: "completed".to_string(),
            record: Some(record),
        })
        .into_response(),
        SubmitOutcome::Superseded { sequence, .. } => Json(ScanResponse {
            sequence,
            status: "superseded".to_string(),
            record: None,
        })
        .into_response(),
        SubmitOutcome::Rejected { error, .. } => {
            error_response(StatusCode::UNPROCESSABLE_ENTITY, error.to_string())
        }
    }
}

async fn scan_multipart(
    State(sessions): State<Arc<ScanSessions>>,
    ClientSession(session): ClientSession,
    mut multipart: Multipart,
) -> Response {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => {
                return error_response(StatusCode::BAD_REQUEST, "multipart body has no file field")
            }
            Err(e) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("unreadable multipart body: {}", e),
                )
            }
        };

        // Skip plain form fields
        if field.file_name().is_none() && field.content_type().is_none() {
            continue;
        }

        let mime_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();

        return match field.bytes().await {
            Ok(bytes) => {
                let orchestrator = sessions.session(&session).await;
                outcome_response(orchestrator.submit(bytes.to_vec(), &mime_type).await)
            }
            Err(e) => error_response(StatusCode::BAD_REQUEST, format!("failed to read file field: {}", e)),
        };
    }
}

/// Split an optional `data:<mime>;base64,` prefix from the payload
fn split_data_url(data: &str) -> (Option<&str>, &str) {
    match data.strip_prefix("data:").and_then(|rest| rest.split_once(',')) {
        Some((header, payload)) => {
            let mime = header.strip_suffix(";base64").unwrap_or(header);
            (Some(mime).filter(|m| !m.is_empty()), payload)
        }
        None => (None, data),
    }
}

async fn scan_base64(
    State(sessions): State<Arc<ScanSessions>>,
    ClientSession(session): ClientSession,
    payload: Result<Json<Base64ScanRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(request) => request,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.body_text()),
    };

    let (embedded_mime, encoded) = split_data_url(request.image_data.trim());
    let Some(mime_type) = request.mime_type.as_deref().or(embedded_mime).map(str::to_string) else {
        return error_response(StatusCode::BAD_REQUEST, "mime_type is required");
    };

    let bytes = match base64::engine::general_purpose::STANDARD.decode(encoded) {
        Ok(bytes) => bytes,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("invalid base64: {}", e)),
    };

    let orchestrator = sessions.session(&session).await;
    outcome_response(orchestrator.submit(bytes, &mime_type).await)
}

async fn scan_state(
    State(sessions): State<Arc<ScanSessions>>,
    ClientSession(session): ClientSession,
) -> Response {
    Json(sessions.session(&session).await.state()).into_response()
}

async fn scan_events(
    State(sessions): State<Arc<ScanSessions>>,
    ClientSession(session): ClientSession,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = sessions.session(&session).await.updates().map(|snapshot| {
        Ok(Event::default()
            .event("scan")
            .json_data(&snapshot)
            .unwrap_or_else(|e| Event::default().event("error").data(e.to_string())))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn health_handler(State(sessions): State<Arc<ScanSessions>>) -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "model": sessions.loader().model_id(),
        "backend_ready": sessions.loader().is_ready(),
    }))
    .into_response()
}

async fn metrics_handler() -> String {
    crate::metrics::export_metrics()
}
