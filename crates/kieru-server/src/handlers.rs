use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    auth::Caller,
    error::{AccessError, CreateError, OwnerError},
    service::CreateSecretRequest,
    store::unix_now,
    AppState,
};

const DEFAULT_PAGE_SIZE: usize = 10;

// ── Error helpers ────────────────────────────────────────────────────────────

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"error": message.into()}))).into_response()
}

fn unauthorized() -> Response {
    error_response(StatusCode::UNAUTHORIZED, "authentication required")
}

fn owner_error(e: OwnerError) -> Response {
    match e {
        OwnerError::Internal(e) => internal_error(e),
        e => error_response(e.http_status(), e.to_string()),
    }
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Create ────────────────────────────────────────────────────────────────────

pub async fn create_secret(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<CreateSecretRequest>,
) -> Response {
    match state.secrets.create(body, &caller, unix_now()).await {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(CreateError::Internal(e)) => internal_error(e),
        Err(e) => error_response(e.http_status(), e.to_string()),
    }
}

// ── Access ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct AccessRequest {
    pub password: Option<String>,
}

/// Redeem one view. The body is optional; an empty body means no password.
pub async fn access_secret(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let req: AccessRequest = if body.iter().all(u8::is_ascii_whitespace) {
        AccessRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, format!("invalid body: {e}"))
            }
        }
    };

    match state
        .gate
        .access(&id, req.password.as_deref(), unix_now(), &caller.client_meta())
        .await
    {
        Ok(granted) => Json(granted).into_response(),
        // Detail already logged by the gate.
        Err(e @ (AccessError::IntegrityViolation(_) | AccessError::Internal(_))) => {
            error_response(e.http_status(), "internal server error")
        }
        Err(AccessError::Gone(reason)) => error_response(
            StatusCode::GONE,
            format!("secret is no longer available: {reason}"),
        ),
        Err(e) => error_response(e.http_status(), e.to_string()),
    }
}

// ── Validate ─────────────────────────────────────────────────────────────────

pub async fn validate_secret(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.secrets.validate(&id, unix_now()) {
        Ok(Some(summary)) => Json(summary).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "secret not found"),
        Err(e) => internal_error(e),
    }
}

// ── Password ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct UpdatePasswordRequest {
    pub password: String,
}

pub async fn update_password(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    Json(body): Json<UpdatePasswordRequest>,
) -> Response {
    let Some(subject) = caller.subject_id() else {
        return unauthorized();
    };
    match state.secrets.update_password(&id, &body.password, subject) {
        Ok(()) => Json(json!({"id": id, "isPasswordProtected": true})).into_response(),
        Err(e) => owner_error(e),
    }
}

// ── Dashboard ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PageParams {
    pub page: Option<usize>,
    pub size: Option<usize>,
    pub active: Option<bool>,
}

pub async fn list_secrets(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(params): Query<PageParams>,
) -> Response {
    let Some(subject) = caller.subject_id() else {
        return unauthorized();
    };
    let page = params.page.unwrap_or(0);
    match state.secrets.list_owned(
        subject,
        page,
        params.size.unwrap_or(DEFAULT_PAGE_SIZE),
        params.active.unwrap_or(false),
        unix_now(),
    ) {
        Ok(secrets) => Json(json!({ "page": page, "secrets": secrets })).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn secret_logs(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    Query(params): Query<PageParams>,
) -> Response {
    let Some(subject) = caller.subject_id() else {
        return unauthorized();
    };
    let page = params.page.unwrap_or(0);
    match state.secrets.access_logs(
        &id,
        subject,
        page,
        params.size.unwrap_or(DEFAULT_PAGE_SIZE),
    ) {
        Ok(logs) => Json(json!({ "page": page, "logs": logs })).into_response(),
        Err(e) => owner_error(e),
    }
}

// ── Delete ────────────────────────────────────────────────────────────────────

pub async fn delete_secret(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Response {
    let Some(subject) = caller.subject_id() else {
        return unauthorized();
    };
    match state.secrets.soft_delete(&id, subject).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => owner_error(e),
    }
}

fn internal_error(e: anyhow::Error) -> Response {
    tracing::error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal server error"})),
    )
        .into_response()
}
