//! Session and recovery endpoints.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::{api_error, ApiResult};
use crate::auth::{bearer_token, AuthError};
use crate::security::{SecurityError, SetupRequest, VerifyRequest};
use crate::shell;
use crate::AppState;

fn map_security_error(e: SecurityError) -> (StatusCode, Json<Value>) {
    match e {
        SecurityError::AlreadySet => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "already set", "code": "ALREADY_SET"})),
        ),
        SecurityError::NotSet => api_error(StatusCode::BAD_REQUEST, "security questions not set"),
        SecurityError::ConfirmMismatch | SecurityError::VerifyFailed => {
            api_error(StatusCode::UNAUTHORIZED, e.to_string())
        }
        SecurityError::InvalidArgument(msg) => api_error(StatusCode::BAD_REQUEST, msg),
        SecurityError::Store(_) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub password: String,
}

/// `POST /api/auth/login`
pub async fn login(State(state): State<AppState>, Json(payload): Json<LoginRequest>) -> ApiResult {
    if payload.password.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "password must not be empty"));
    }

    match state.auth.login(&payload.password).await {
        Ok(token) => Ok(Json(json!({
            "status": "success",
            "message": "login ok",
            "token": token,
        }))),
        Err(AuthError::WrongPassword) => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"status": "error", "message": "wrong password"})),
        )),
        Err(AuthError::Store(e)) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

/// `POST /api/auth/logout` — deletes the presented token.
pub async fn logout(State(state): State<AppState>, request: Request) -> ApiResult {
    let Some(token) = bearer_token(&request) else {
        return Err(api_error(StatusCode::BAD_REQUEST, "no token provided"));
    };

    match state.auth.logout(token).await {
        Ok(true) => Ok(Json(json!({"status": "success", "message": "logged out"}))),
        Ok(false) => Err(api_error(StatusCode::BAD_REQUEST, "logout failed")),
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

#[derive(Deserialize)]
pub struct PasswordRequest {
    #[serde(default)]
    pub old_password: String,
    #[serde(default)]
    pub new_password: String,
}

/// `POST /api/auth/password` — change password; every session is dropped.
pub async fn change_password(
    State(state): State<AppState>,
    Json(payload): Json<PasswordRequest>,
) -> ApiResult {
    if payload.old_password.is_empty() || payload.new_password.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "old and new password must not be empty",
        ));
    }

    match state
        .auth
        .change_password(&payload.old_password, &payload.new_password)
        .await
    {
        Ok(()) => Ok(Json(json!({
            "status": "success",
            "message": "password changed, please log in again",
        }))),
        Err(AuthError::WrongPassword) => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"status": "error", "message": "old password is wrong"})),
        )),
        Err(AuthError::Store(e)) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

/// `GET /api/auth/status` — whether the presented token (if any) is valid.
pub async fn status(State(state): State<AppState>, request: Request) -> Json<Value> {
    let logged_in = match bearer_token(&request) {
        Some(token) => state.auth.verify(token).await.unwrap_or(false),
        None => false,
    };
    Json(json!({"logged_in": logged_in, "auth_required": true}))
}

// ── Recovery questions ───────────────────────────────────────────────

/// `GET /api/auth/security/status`
pub async fn security_status(State(state): State<AppState>) -> ApiResult {
    let status = state
        .security
        .status()
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({"is_set": status.is_set, "created_at": status.created_at})))
}

/// `GET /api/auth/security/questions`
pub async fn security_questions(State(state): State<AppState>) -> ApiResult {
    let questions = state.security.questions().await.map_err(map_security_error)?;
    Ok(Json(json!({
        "question1": questions.question1,
        "question2": questions.question2,
    })))
}

#[derive(Deserialize)]
pub struct SecuritySetupRequest {
    #[serde(default)]
    pub question1: String,
    #[serde(default)]
    pub answer1: String,
    #[serde(default)]
    pub question2: String,
    #[serde(default)]
    pub answer2: String,
}

/// `POST /api/auth/security/setup` — one-shot; the second call fails with a
/// distinguishable code.
pub async fn security_setup(
    State(state): State<AppState>,
    Json(payload): Json<SecuritySetupRequest>,
) -> ApiResult {
    let iccid = state.modem.info().await.map(|i| i.iccid).unwrap_or_default();
    let request = SetupRequest {
        question1: payload.question1,
        answer1: payload.answer1,
        question2: payload.question2,
        answer2: payload.answer2,
    };
    state
        .security
        .setup(&request, &iccid)
        .await
        .map_err(map_security_error)?;
    Ok(Json(json!({"status": "success", "message": "security questions set"})))
}

#[derive(Deserialize)]
pub struct SecurityVerifyBody {
    #[serde(default)]
    pub answer1: String,
    #[serde(default)]
    pub answer2: String,
    #[serde(default)]
    pub confirm: String,
}

impl SecurityVerifyBody {
    fn into_request(self) -> VerifyRequest {
        VerifyRequest {
            answer1: self.answer1,
            answer2: self.answer2,
            confirm: self.confirm,
        }
    }
}

/// `POST /api/auth/security/verify` — check answers + confirmation.
pub async fn security_verify(
    State(state): State<AppState>,
    Json(payload): Json<SecurityVerifyBody>,
) -> ApiResult {
    state
        .security
        .verify(&payload.into_request())
        .await
        .map_err(map_security_error)?;
    Ok(Json(json!({"status": "success", "message": "verification ok"})))
}

/// `POST /api/auth/security/reset-password` — verified reset to the factory
/// password.
pub async fn security_reset_password(
    State(state): State<AppState>,
    Json(payload): Json<SecurityVerifyBody>,
) -> ApiResult {
    state
        .security
        .reset_password(&payload.into_request(), &state.auth)
        .await
        .map_err(map_security_error)?;
    Ok(Json(json!({
        "status": "success",
        "message": "password reset to factory default",
    })))
}

/// `POST /api/auth/security/factory-reset` — verified wipe + reboot. The
/// reboot is deferred so this response reaches the client first.
pub async fn security_factory_reset(
    State(state): State<AppState>,
    Json(payload): Json<SecurityVerifyBody>,
) -> ApiResult {
    state
        .security
        .factory_reset(&payload.into_request())
        .await
        .map_err(map_security_error)?;

    let shell_bin = state.config.server.shell.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        if let Err(e) = shell::run(&shell_bin, "reboot", 5000).await {
            warn!(error = %e, "reboot failed after factory reset");
        }
    });

    Ok(Json(json!({
        "status": "success",
        "message": "factory reset complete, rebooting",
    })))
}
