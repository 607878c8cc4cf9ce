//! Browser login and logout

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header::SET_COOKIE, StatusCode};
use axum::response::{AppendHeaders, IntoResponse};
use axum::Json;

use brunnen_core::auth::{self, AuthError};
use brunnen_core::protocol::{LoginRequest, LoginResponse};

use crate::error::ApiError;
use crate::extract::{json_body, SESSION_COOKIE};
use crate::state::SharedState;

fn session_cookie(token: &str, max_age: u64) -> String {
    format!("{SESSION_COOKIE}={token}; HttpOnly; SameSite=Strict; Path=/; Max-Age={max_age}")
}

/// `POST /login`
pub async fn login(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let req: LoginRequest = json_body(&body)?;

    let user = state.store.get_user(&req.username).await?;
    let stored = user.as_ref().map(|u| u.token.clone());
    let valid = auth::check_secret(req.password, stored).await?;
    let user = user.filter(|_| valid).ok_or_else(|| {
        tracing::warn!("Failed login for '{}'", req.username);
        ApiError::from(AuthError::InvalidCredentials)
    })?;

    let session = state.sessions.issue(&user.username, user.group)?;
    tracing::info!("User '{}' logged in", user.username);

    Ok((
        AppendHeaders([(SET_COOKIE, session_cookie(&session.token, session.expires_in))]),
        Json(LoginResponse {
            username: user.username,
            group: user.group,
            expires_in: session.expires_in,
        }),
    ))
}

/// `POST /logout`: the token itself stays valid until it expires
pub async fn logout() -> impl IntoResponse {
    (
        StatusCode::NO_CONTENT,
        AppendHeaders([(SET_COOKIE, session_cookie("", 0))]),
    )
}
