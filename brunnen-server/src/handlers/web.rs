//! Dashboard endpoints

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::Value;

use brunnen_core::auth::{self, AuthError, Permission};
use brunnen_core::protocol::{
    require_numeric_object, DeviceCreated, DeviceQuery, DeviceRequest, DeviceResponse,
    PasswordChange, PayloadError, RangeQuery, SyncStatus, Table, UserRequest, UserResponse,
    UsernameQuery,
};
use brunnen_core::model::is_valid_name;
use brunnen_core::{Device, SettingKey, Settings, User};

use crate::error::ApiError;
use crate::extract::{json_body, Session};
use crate::state::{AppState, SharedState};

/// `GET /web/logs`
pub async fn logs(
    State(state): State<SharedState>,
    session: Session,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Table>, ApiError> {
    session.require(Permission::ViewData)?;
    let range = query.range()?;
    let rows = state.store.query_logs(&range).await?;
    Ok(Json(Table::from_logs(&rows)))
}

/// `GET /web/data`, optionally averaged per `window` seconds
pub async fn data(
    State(state): State<SharedState>,
    session: Session,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Table>, ApiError> {
    session.require(Permission::ViewData)?;
    let range = query.range()?;
    let window = query.window.filter(|w| *w > 0).map(Duration::from_secs);
    let rows = state.store.query_measurements(&range, window).await?;
    Ok(Json(Table::from_measurements(&rows)))
}

/// `GET /web/sync`
pub async fn sync_status(
    State(state): State<SharedState>,
    session: Session,
) -> Result<Json<SyncStatus>, ApiError> {
    session.require(Permission::ViewData)?;
    let sync = state.sync_settings().await?;
    let latest_measurement = state.store.latest_measurement().await?;
    let activity = state.activity.read().await.clone();

    Ok(Json(SyncStatus {
        mode: sync.mode,
        period: sync.period().as_secs(),
        last_visit: activity.last_visit,
        last_sync: activity.last_sync,
        latest_measurement,
        requests: state.requests(),
    }))
}

// --- Accounts ---

/// `GET /web/user`
pub async fn current_user(session: Session) -> Json<UserResponse> {
    Json(UserResponse {
        username: session.username,
        group: session.group,
    })
}

/// `GET /web/users`
pub async fn list_users(
    State(state): State<SharedState>,
    session: Session,
) -> Result<Json<Vec<UserResponse>>, ApiError> {
    session.require(Permission::ManageUsers)?;
    let users = state
        .store
        .list_users()
        .await?
        .into_iter()
        .map(|u| UserResponse {
            username: u.username,
            group: u.group,
        })
        .collect();
    Ok(Json(users))
}

/// `POST /web/user`: create an account or change its password or group
pub async fn upsert_user(
    State(state): State<SharedState>,
    session: Session,
    body: Bytes,
) -> Result<(StatusCode, Json<UserResponse>), ApiError> {
    session.require(Permission::ManageUsers)?;
    let req: UserRequest = json_body(&body)?;
    if req.username.trim().is_empty() {
        return Err(PayloadError::MissingField("username").into());
    }
    if !is_valid_name(&req.username) {
        return Err(ApiError::Unprocessable(
            "Username must not contain control characters, '\\' or ':'.".to_string(),
        ));
    }

    let existing = state.store.get_user(&req.username).await?;
    let (user, status) = match existing {
        Some(existing) => {
            let group = req.group.unwrap_or(existing.group);
            if existing.username == session.username && group != existing.group {
                return Err(ApiError::Unprocessable(
                    "Cannot change the group of the own account.".to_string(),
                ));
            }
            let token = match req.password {
                Some(password) => hash_password(password).await?,
                None => existing.token,
            };
            let user = User {
                username: existing.username,
                group,
                token,
            };
            (user, StatusCode::OK)
        }
        None => {
            let password = req.password.ok_or(PayloadError::MissingField("password"))?;
            let user = User {
                username: req.username,
                group: req.group.unwrap_or_default(),
                token: hash_password(password).await?,
            };
            (user, StatusCode::CREATED)
        }
    };

    state.store.upsert_user(&user).await?;
    tracing::info!(
        "User '{}' saved with group {} by '{}'",
        user.username,
        user.group,
        session.username
    );

    Ok((
        status,
        Json(UserResponse {
            username: user.username,
            group: user.group,
        }),
    ))
}

/// `DELETE /web/user?username=`
pub async fn delete_user(
    State(state): State<SharedState>,
    session: Session,
    Query(query): Query<UsernameQuery>,
) -> Result<StatusCode, ApiError> {
    session.require(Permission::ManageUsers)?;
    let username = query
        .username
        .ok_or(PayloadError::MissingParameter("username"))?;
    if username == session.username {
        return Err(ApiError::Unprocessable(
            "Cannot delete the own account.".to_string(),
        ));
    }
    if state.store.get_user(&username).await?.is_none() {
        return Err(ApiError::NotFound(format!("No user '{username}'.")));
    }

    state.store.delete_user(&username).await?;
    tracing::info!("User '{}' deleted by '{}'", username, session.username);
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /web/password`
pub async fn change_password(
    State(state): State<SharedState>,
    session: Session,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    session.require(Permission::ChangeOwnPassword)?;
    let req: PasswordChange = json_body(&body)?;
    if req.new.is_empty() {
        return Err(PayloadError::MissingField("new").into());
    }

    let user = state
        .store
        .get_user(&session.username)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Login required".to_string()))?;
    if !auth::check_secret(req.current, Some(user.token.clone())).await? {
        return Err(AuthError::InvalidCredentials.into());
    }

    state
        .store
        .upsert_user(&User {
            token: hash_password(req.new).await?,
            ..user
        })
        .await?;
    tracing::info!("User '{}' changed their password", session.username);
    Ok(StatusCode::NO_CONTENT)
}

async fn hash_password(password: String) -> Result<String, ApiError> {
    if password.is_empty() {
        return Err(PayloadError::MissingField("password").into());
    }
    Ok(auth::hash_secret_blocking(password).await?)
}

// --- Devices ---

/// `GET /web/devices`
pub async fn list_devices(
    State(state): State<SharedState>,
    session: Session,
) -> Result<Json<Vec<DeviceResponse>>, ApiError> {
    session.require(Permission::ManageDevices)?;
    let devices = state
        .store
        .list_devices()
        .await?
        .into_iter()
        .map(|d| DeviceResponse {
            device_id: d.device_id,
        })
        .collect();
    Ok(Json(devices))
}

/// `POST /web/devices`: the plaintext token is only returned here
pub async fn register_device(
    State(state): State<SharedState>,
    session: Session,
    body: Bytes,
) -> Result<(StatusCode, Json<DeviceCreated>), ApiError> {
    session.require(Permission::ManageDevices)?;
    let req: DeviceRequest = json_body(&body)?;
    if !is_valid_name(&req.device_id) {
        return Err(ApiError::Unprocessable(
            "Device id must be non-empty and must not contain control characters, '\\' or ':'."
                .to_string(),
        ));
    }

    let token = match req.token {
        Some(token) if !token.is_empty() => token,
        _ => auth::generate_token(),
    };
    let hash = auth::hash_secret_blocking(token.clone()).await?;
    state
        .store
        .upsert_device(&Device {
            device_id: req.device_id.clone(),
            token: hash,
        })
        .await?;
    tracing::info!("Device '{}' registered by '{}'", req.device_id, session.username);

    Ok((
        StatusCode::CREATED,
        Json(DeviceCreated {
            device_id: req.device_id,
            token,
        }),
    ))
}

/// `DELETE /web/devices?device_id=`
pub async fn delete_device(
    State(state): State<SharedState>,
    session: Session,
    Query(query): Query<DeviceQuery>,
) -> Result<StatusCode, ApiError> {
    session.require(Permission::ManageDevices)?;
    let device_id = query
        .device_id
        .ok_or(PayloadError::MissingParameter("device_id"))?;
    if state.store.get_device(&device_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("No device '{device_id}'.")));
    }

    state.store.delete_device(&device_id).await?;
    state.activity.write().await.last_sync.remove(&device_id);
    tracing::info!("Device '{}' removed by '{}'", device_id, session.username);
    Ok(StatusCode::NO_CONTENT)
}

// --- Intervals and thresholds ---

async fn read_setting(state: &AppState, key: SettingKey) -> Result<Value, ApiError> {
    let settings = state.current_settings().await?;
    Ok(settings.get(&key).cloned().unwrap_or(Value::Null))
}

async fn write_setting(state: &AppState, key: SettingKey, body: &Bytes) -> Result<Value, ApiError> {
    let value: Value = json_body(body)?;
    require_numeric_object(key, &value)?;

    let mut update = Settings::new();
    update.insert(key, value.clone());
    state.write_settings(&update).await?;
    tracing::info!("Setting '{}' updated", key);
    Ok(value)
}

/// `GET /web/intervals`
pub async fn intervals(
    State(state): State<SharedState>,
    session: Session,
) -> Result<Json<Value>, ApiError> {
    session.require(Permission::ViewData)?;
    read_setting(&state, SettingKey::Intervals).await.map(Json)
}

/// `POST /web/intervals`
pub async fn set_intervals(
    State(state): State<SharedState>,
    session: Session,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    session.require(Permission::EditSettings)?;
    write_setting(&state, SettingKey::Intervals, &body).await.map(Json)
}

/// `GET /web/thresholds`
pub async fn thresholds(
    State(state): State<SharedState>,
    session: Session,
) -> Result<Json<Value>, ApiError> {
    session.require(Permission::ViewData)?;
    read_setting(&state, SettingKey::Thresholds).await.map(Json)
}

/// `POST /web/thresholds`
pub async fn set_thresholds(
    State(state): State<SharedState>,
    session: Session,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    session.require(Permission::EditSettings)?;
    write_setting(&state, SettingKey::Thresholds, &body).await.map(Json)
}
