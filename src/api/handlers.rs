//! HTTP request handlers

use super::sse::session_event_stream;
use super::types::{
    CreateSessionRequest, CreateSessionResponse, ErrorResponse, MessageListResponse, OkResponse,
    SendMessageRequest, SessionListResponse,
};
use super::AppState;
use crate::db::{Session, SessionMode};
use crate::engine::{EngineError, PrCommentEvent};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", post(create_session).get(list_sessions))
        .route("/api/sessions/:id", get(get_session))
        .route("/api/sessions/:id/events", get(stream_events))
        .route(
            "/api/sessions/:id/messages",
            get(list_messages).post(send_message),
        )
        .route("/api/sessions/:id/pr", post(create_pr))
        .route("/api/sessions/:id/stop", post(stop_session))
        .route("/api/webhooks/github", post(github_webhook))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

// ============================================================
// Sessions
// ============================================================

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), AppError> {
    let mode = match req.mode.as_deref() {
        None | Some("") | Some("task") => SessionMode::Task,
        Some("chat") => SessionMode::Chat,
        Some(other) => {
            return Err(AppError::BadRequest(format!("unknown mode: {other}")));
        }
    };

    let session = state
        .engine
        .create_session(&req.repo, &req.prompt, &req.agent, mode)?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            id: session.id,
            branch: session.branch,
            mode: session.mode,
        }),
    ))
}

async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<SessionListResponse>, AppError> {
    let sessions = state.engine.list_sessions()?;
    Ok(Json(SessionListResponse { sessions }))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, AppError> {
    Ok(Json(state.engine.get_session(&id)?))
}

async fn stop_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>, AppError> {
    state.engine.stop_session(&id).await?;
    Ok(Json(OkResponse::new()))
}

// ============================================================
// Event Streaming
// ============================================================

#[derive(Debug, Deserialize)]
struct StreamQuery {
    after: Option<i64>,
}

async fn stream_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    // Session must exist before we hold a stream open for it
    state.engine.get_session(&id)?;

    // Browsers resume with Last-Event-ID; explicit ?after wins
    let after = query.after.or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    });

    let live = state.engine.subscribe(&id);
    let replay = state.engine.get_events(&id, after.unwrap_or(0))?;

    Ok(session_event_stream(replay, live))
}

// ============================================================
// Chat
// ============================================================

async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessageListResponse>, AppError> {
    state.engine.get_session(&id)?;
    let messages = state.engine.get_messages(&id)?;
    Ok(Json(MessageListResponse { messages }))
}

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<OkResponse>), AppError> {
    state.engine.send_chat_message(&id, &req.content)?;
    Ok((StatusCode::ACCEPTED, Json(OkResponse::new())))
}

async fn create_pr(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, AppError> {
    let session = state.engine.create_pr_from_chat(&id).await?;
    Ok(Json(session))
}

// ============================================================
// GitHub Webhook
// ============================================================

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    action: String,
    comment: Option<WebhookComment>,
    repository: Option<WebhookRepository>,
    pull_request: Option<WebhookPullRequest>,
    issue: Option<WebhookIssue>,
}

#[derive(Debug, Deserialize)]
struct WebhookComment {
    #[serde(default)]
    body: String,
    user: WebhookUser,
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct WebhookRepository {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct WebhookPullRequest {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct WebhookIssue {
    number: u64,
    /// Present only when the issue is actually a pull request
    pull_request: Option<serde_json::Value>,
}

/// PR review comments trigger follow-up sessions on the PR's branch.
/// Accepts `pull_request_review_comment` and PR-flavored `issue_comment`
/// deliveries; everything else is acknowledged and ignored.
async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OkResponse>, AppError> {
    let secret = &state.engine.config().webhook_secret;
    if secret.is_empty() {
        return Err(AppError::Internal(
            "webhook secret is not configured".to_string(),
        ));
    }

    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("missing signature".to_string()))?;
    if !verify_signature(secret.as_bytes(), &body, signature) {
        return Err(AppError::Unauthorized("invalid signature".to_string()));
    }

    let payload: WebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid payload: {e}")))?;

    if payload.action != "created" {
        return Ok(Json(OkResponse::new()));
    }
    let (Some(comment), Some(repository)) = (payload.comment, payload.repository) else {
        return Ok(Json(OkResponse::new()));
    };
    // Ignore our own (and any other bot's) comments to avoid loops
    if comment.user.login.ends_with("[bot]") {
        return Ok(Json(OkResponse::new()));
    }
    let pr_number = match (payload.pull_request, payload.issue) {
        (Some(pr), _) => pr.number,
        (None, Some(issue)) if issue.pull_request.is_some() => issue.number,
        _ => return Ok(Json(OkResponse::new())),
    };

    let original = match state
        .engine
        .get_session_by_pr(&repository.full_name, pr_number)
    {
        Ok(session) => session,
        // Not one of ours: acknowledge and move on
        Err(EngineError::NotFound(_)) => return Ok(Json(OkResponse::new())),
        Err(e) => return Err(e.into()),
    };

    state.engine.create_pr_comment_session(
        &original,
        PrCommentEvent {
            pr_number,
            author: comment.user.login,
            body: comment.body,
            path: comment.path,
        },
    )?;

    Ok(Json(OkResponse::new()))
}

fn verify_signature(secret: &[u8], body: &[u8], signature_header: &str) -> bool {
    let Some(hex_digest) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };

    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

// ============================================================
// Error Handling
// ============================================================

pub(super) enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Validation(msg) => AppError::BadRequest(msg),
            EngineError::NotFound(msg) => AppError::NotFound(msg),
            EngineError::Conflict(msg) => AppError::Conflict(msg),
            EngineError::Db(e) => AppError::Internal(e.to_string()),
            EngineError::Internal(msg) => AppError::Internal(msg),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(ErrorResponse::new(message))).into_response()
    }
}
